//! Portal authentication
//!
//! SAML login is a three step exchange with the portal:
//! 1. pre-auth - ask the portal for a login URL
//! 2. web auth - the user logs in through a [`WebAuthBridge`](crate::webauth::WebAuthBridge)
//!    and the portal sets a cookie
//! 3. post-auth - trade the cookie for a session token (and, for AnyConnect,
//!    the hash of the certificate the tunnel endpoint will present)
//!
//! The wire format differs per protocol; see [`anyconnect`] and [`globalprotect`].

pub mod anyconnect;
pub mod globalprotect;
pub mod manager;

pub use manager::AuthManager;

use crate::credentials::{Credentials, Protocol};
use crate::webauth::AuthCookie;
use async_trait::async_trait;
use reqwest::Client;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const HTTP_TIMEOUT_SECS: u64 = 30;

/// Authentication step, used to tag errors and log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    PreAuth,
    WebAuth,
    PostAuth,
}

impl AuthStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStep::PreAuth => "pre-auth",
            AuthStep::WebAuth => "web-auth",
            AuthStep::PostAuth => "post-auth",
        }
    }
}

impl fmt::Display for AuthStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("XML parsing failed: {0}")]
    XmlError(#[from] quick_xml::DeError),

    #[error("Invalid portal address: {0}")]
    InvalidPortal(String),

    #[error("Portal rejected {step}: {message}")]
    Rejected { step: AuthStep, message: String },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Unsupported SAML method: {0}")]
    UnsupportedMethod(String),

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),
}

/// Everything the portal sees from the user's credentials. The sudo
/// password never leaves the machine.
#[derive(Clone)]
pub struct PreAuthRequest {
    pub portal: String,
    pub protocol: Protocol,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl From<&Credentials> for PreAuthRequest {
    fn from(credentials: &Credentials) -> Self {
        Self {
            portal: credentials.portal.clone(),
            protocol: credentials.protocol,
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        }
    }
}

impl fmt::Debug for PreAuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreAuthRequest")
            .field("portal", &self.portal)
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Pre-auth answer: where to send the user, plus the state the portal
/// expects back in post-auth
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreAuthResponse {
    pub login_url: String,
    pub login_final_url: Option<String>,
    pub token_cookie_name: Option<String>,
    /// URL the pre-auth request finally landed on (after redirects)
    pub portal_url: Option<String>,
    /// Raw `<opaque>` block (AnyConnect) echoed back in post-auth
    pub opaque: Option<String>,
}

#[derive(Clone, Default, PartialEq)]
pub struct AuthCompleteResponse {
    pub session_token: Option<String>,
    pub server_cert_hash: Option<String>,
}

impl fmt::Debug for AuthCompleteResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCompleteResponse")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("server_cert_hash", &self.server_cert_hash)
            .finish()
    }
}

/// The portal's HTTP API
#[async_trait]
pub trait PortalClient: Send + Sync {
    async fn pre_auth(&self, request: &PreAuthRequest) -> Result<PreAuthResponse, AuthError>;

    async fn finish_auth(
        &self,
        request: &PreAuthRequest,
        pending: &PreAuthResponse,
        cookie: &AuthCookie,
    ) -> Result<AuthCompleteResponse, AuthError>;
}

/// Talks to real portals over HTTPS, picking the dialect from the protocol
pub struct HttpPortal {
    client: Client,
}

impl HttpPortal {
    pub fn new() -> Result<Self, AuthError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(false)
            .cookie_store(true)
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PortalClient for HttpPortal {
    async fn pre_auth(&self, request: &PreAuthRequest) -> Result<PreAuthResponse, AuthError> {
        let portal = portal_url(&request.portal)?;
        match request.protocol {
            Protocol::AnyConnect => anyconnect::pre_auth(&self.client, &portal).await,
            Protocol::GlobalProtect => globalprotect::prelogin(&self.client, &portal).await,
        }
    }

    async fn finish_auth(
        &self,
        request: &PreAuthRequest,
        pending: &PreAuthResponse,
        cookie: &AuthCookie,
    ) -> Result<AuthCompleteResponse, AuthError> {
        let portal = portal_url(&request.portal)?;
        match request.protocol {
            Protocol::AnyConnect => anyconnect::finish_auth(&self.client, &portal, pending, cookie).await,
            Protocol::GlobalProtect => {
                globalprotect::login(&self.client, &portal, request.username.as_deref(), cookie).await
            }
        }
    }
}

/// Normalize a portal as typed by the user (`vpn.example.com`,
/// `https://vpn.example.com/group`) into an https URL
pub fn portal_url(portal: &str) -> Result<Url, AuthError> {
    let portal = portal.trim();
    let candidate = if portal.contains("://") {
        portal.to_string()
    } else {
        format!("https://{}", portal)
    };
    let url = Url::parse(&candidate).map_err(|e| AuthError::InvalidPortal(format!("{}: {}", portal, e)))?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(AuthError::InvalidPortal(portal.to_string()));
    }
    Ok(url)
}

/// The whole `<name ...>...</name>` element, verbatim
pub(crate) fn raw_element<'a>(body: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{}", name);
    let close = format!("</{}>", name);
    let mut search_from = 0;
    let start = loop {
        let candidate = search_from + body[search_from..].find(&open)?;
        let after = body[candidate + open.len()..].chars().next()?;
        if after == '>' || after == '/' || after.is_whitespace() {
            break candidate;
        }
        search_from = candidate + open.len();
    };
    let end = start + body[start..].find(&close)? + close.len();
    Some(&body[start..end])
}
