//! Interactive web login
//!
//! The browser surface that performs the SAML login lives outside this crate.
//! It is handed a [`WebAuthRequest`] and yields the cookie the portal set at
//! the end of the login, or nothing if the login never completed.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Error, Debug)]
pub enum WebAuthError {
    #[error("Web authentication was cancelled")]
    Cancelled,
    #[error("Web authentication timed out")]
    TimedOut,
    #[error("Web authentication failed: {0}")]
    Bridge(String),
}

/// What the login window has to show and watch for
#[derive(Debug, Clone, PartialEq)]
pub struct WebAuthRequest {
    pub login_url: String,
    /// URL the portal redirects to once the login is done
    pub final_url: Option<String>,
    /// Cookie carrying the token on `final_url`
    pub cookie_name: Option<String>,
}

#[derive(Clone, PartialEq)]
pub struct AuthCookie {
    pub name: String,
    pub value: String,
    /// Login name reported by the identity provider, if any
    pub username: Option<String>,
}

impl AuthCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            username: None,
        }
    }

    /// Parse `name=value`; a bare value gets `default_name`
    pub fn parse(input: &str, default_name: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        match input.split_once('=') {
            Some((name, value)) if !name.is_empty() && !value.is_empty() => {
                Some(Self::new(name.trim(), value.trim()))
            }
            Some(_) => None,
            None => Some(Self::new(default_name, input)),
        }
    }
}

impl fmt::Debug for AuthCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCookie")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .field("username", &self.username)
            .finish()
    }
}

#[async_trait]
pub trait WebAuthBridge: Send + Sync {
    /// Run the login. `Ok(None)` means the bridge finished without a cookie.
    /// Implementations return [`WebAuthError::Cancelled`] once `cancel` fires.
    async fn authenticate(
        &self,
        request: &WebAuthRequest,
        cancel: CancellationToken,
    ) -> Result<Option<AuthCookie>, WebAuthError>;

    /// Dismiss the login surface
    async fn close(&self) {}
}

/// Prints the login URL and reads the cookie back from stdin
pub struct TerminalBridge;

#[async_trait]
impl WebAuthBridge for TerminalBridge {
    async fn authenticate(
        &self,
        request: &WebAuthRequest,
        cancel: CancellationToken,
    ) -> Result<Option<AuthCookie>, WebAuthError> {
        let cookie_name = request.cookie_name.as_deref().unwrap_or("cookie");
        eprintln!();
        eprintln!("Open this URL in a browser and complete the login:");
        eprintln!("  {}", request.login_url);
        if let Some(final_url) = &request.final_url {
            eprintln!("When the browser reaches {}", final_url);
        }
        eprintln!("paste the value of the '{}' cookie and press Enter:", cookie_name);

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let line = tokio::select! {
            _ = cancel.cancelled() => return Err(WebAuthError::Cancelled),
            line = lines.next_line() => line.map_err(|e| WebAuthError::Bridge(e.to_string()))?,
        };

        Ok(line.and_then(|l| AuthCookie::parse(&l, cookie_name)))
    }

    async fn close(&self) {
        info!("Web login finished");
    }
}
