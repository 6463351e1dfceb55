//! Drives the three authentication steps for one set of credentials.
//!
//! Each step consumes a cheap clone of the manager and resolves exactly
//! once, so callers can move it into a spawned task and forward the result.

use super::{AuthCompleteResponse, AuthError, AuthStep, PortalClient, PreAuthRequest, PreAuthResponse};
use crate::credentials::Credentials;
use crate::webauth::{AuthCookie, WebAuthBridge, WebAuthError, WebAuthRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

impl PreAuthResponse {
    pub fn web_auth_request(&self) -> WebAuthRequest {
        WebAuthRequest {
            login_url: self.login_url.clone(),
            final_url: self.login_final_url.clone(),
            cookie_name: self.token_cookie_name.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthManager {
    portal: Arc<dyn PortalClient>,
    request: PreAuthRequest,
    web_auth_timeout: Duration,
}

impl AuthManager {
    pub fn new(portal: Arc<dyn PortalClient>, credentials: &Credentials, web_auth_timeout: Duration) -> Self {
        Self {
            portal,
            request: PreAuthRequest::from(credentials),
            web_auth_timeout,
        }
    }

    pub async fn pre_auth(self) -> Result<PreAuthResponse, AuthError> {
        info!(step = %AuthStep::PreAuth, portal = %self.request.portal, "Requesting login URL");
        let response = self.portal.pre_auth(&self.request).await?;
        debug!(step = %AuthStep::PreAuth, login_url = %response.login_url, "Login URL received");
        Ok(response)
    }

    /// Hand the login URL to `bridge` and wait for the cookie, giving up
    /// after the configured timeout or when `cancel` fires
    pub async fn web_auth(
        self,
        bridge: Arc<dyn WebAuthBridge>,
        request: WebAuthRequest,
        cancel: CancellationToken,
    ) -> Result<Option<AuthCookie>, WebAuthError> {
        info!(step = %AuthStep::WebAuth, "Waiting for web login");
        let login = bridge.authenticate(&request, cancel.clone());
        tokio::select! {
            _ = cancel.cancelled() => Err(WebAuthError::Cancelled),
            result = tokio::time::timeout(self.web_auth_timeout, login) => match result {
                Ok(cookie) => cookie,
                Err(_) => {
                    cancel.cancel();
                    Err(WebAuthError::TimedOut)
                }
            },
        }
    }

    pub async fn finish_auth(
        self,
        pending: PreAuthResponse,
        cookie: AuthCookie,
    ) -> Result<AuthCompleteResponse, AuthError> {
        info!(step = %AuthStep::PostAuth, portal = %self.request.portal, "Exchanging cookie for session token");
        self.portal.finish_auth(&self.request, &pending, &cookie).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Protocol;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StaticPortal {
        seen_cookie: Mutex<Option<String>>,
    }

    #[async_trait]
    impl PortalClient for StaticPortal {
        async fn pre_auth(&self, request: &PreAuthRequest) -> Result<PreAuthResponse, AuthError> {
            Ok(PreAuthResponse {
                login_url: format!("https://{}/saml", request.portal),
                token_cookie_name: Some("SESSID".to_string()),
                ..Default::default()
            })
        }

        async fn finish_auth(
            &self,
            _request: &PreAuthRequest,
            _pending: &PreAuthResponse,
            cookie: &AuthCookie,
        ) -> Result<AuthCompleteResponse, AuthError> {
            *self.seen_cookie.lock().unwrap() = Some(cookie.value.clone());
            Ok(AuthCompleteResponse {
                session_token: Some("tok123".to_string()),
                server_cert_hash: Some("deadbeef".to_string()),
            })
        }
    }

    /// Never produces a cookie on its own
    struct StuckBridge;

    #[async_trait]
    impl WebAuthBridge for StuckBridge {
        async fn authenticate(
            &self,
            _request: &WebAuthRequest,
            cancel: CancellationToken,
        ) -> Result<Option<AuthCookie>, WebAuthError> {
            cancel.cancelled().await;
            Err(WebAuthError::Cancelled)
        }
    }

    struct InstantBridge;

    #[async_trait]
    impl WebAuthBridge for InstantBridge {
        async fn authenticate(
            &self,
            request: &WebAuthRequest,
            _cancel: CancellationToken,
        ) -> Result<Option<AuthCookie>, WebAuthError> {
            let name = request.cookie_name.clone().unwrap_or_default();
            Ok(Some(AuthCookie::new(name, "abc")))
        }
    }

    fn manager(timeout: Duration) -> (AuthManager, Arc<StaticPortal>) {
        let portal = Arc::new(StaticPortal {
            seen_cookie: Mutex::new(None),
        });
        let creds = Credentials::saml("vpn.example.com", Protocol::AnyConnect, "openconnect");
        (AuthManager::new(portal.clone(), &creds, timeout), portal)
    }

    #[tokio::test]
    async fn test_full_exchange() {
        let (auth, portal) = manager(Duration::from_secs(5));

        let pending = auth.clone().pre_auth().await.unwrap();
        assert_eq!(pending.login_url, "https://vpn.example.com/saml");

        let cookie = auth
            .clone()
            .web_auth(Arc::new(InstantBridge), pending.web_auth_request(), CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cookie.name, "SESSID");

        let complete = auth.finish_auth(pending, cookie).await.unwrap();
        assert_eq!(complete.session_token.as_deref(), Some("tok123"));
        assert_eq!(portal.seen_cookie.lock().unwrap().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_web_auth_times_out() {
        let (auth, _) = manager(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let request = WebAuthRequest {
            login_url: "https://vpn.example.com/saml".to_string(),
            final_url: None,
            cookie_name: None,
        };

        let result = auth.web_auth(Arc::new(StuckBridge), request, cancel.clone()).await;
        assert!(matches!(result, Err(WebAuthError::TimedOut)));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_web_auth_cancelled() {
        let (auth, _) = manager(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let request = WebAuthRequest {
            login_url: "https://vpn.example.com/saml".to_string(),
            final_url: None,
            cookie_name: None,
        };

        let pending = tokio::spawn(auth.web_auth(Arc::new(StuckBridge), request, cancel.clone()));
        cancel.cancel();
        assert!(matches!(pending.await.unwrap(), Err(WebAuthError::Cancelled)));
    }
}
