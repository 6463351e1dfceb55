//! AnyConnect aggregate authentication (SSO v2)
//!
//! Both steps POST a `<config-auth>` document to the portal:
//! - `init` announces the `single-sign-on-v2` capability; the portal answers
//!   with an `auth-request` carrying the login URL and an `<opaque>` block
//! - `auth-reply` echoes the opaque block with the SSO token cookie; the portal
//!   answers `complete` with the session token and the server certificate hash

use super::{raw_element, AuthCompleteResponse, AuthError, AuthStep, PreAuthResponse};
use crate::webauth::AuthCookie;
use quick_xml::escape::escape;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

const CLIENT_VERSION: &str = "4.7.00136";
const USER_AGENT: &str = "AnyConnect Linux_64 4.7.00136";
const DEFAULT_TOKEN_COOKIE: &str = "acSamlv2Token";

#[derive(Debug, Deserialize)]
#[serde(rename = "config-auth")]
struct ConfigAuthXml {
    #[serde(rename = "@type", default)]
    kind: Option<String>,
    #[serde(default)]
    auth: Option<AuthXml>,
    #[serde(default)]
    error: Option<ErrorXml>,
    #[serde(rename = "session-token", default)]
    session_token: Option<String>,
    #[serde(default)]
    config: Option<ConfigXml>,
}

#[derive(Debug, Deserialize)]
struct AuthXml {
    #[serde(rename = "sso-v2-login", default)]
    sso_v2_login: Option<String>,
    #[serde(rename = "sso-v2-login-final", default)]
    sso_v2_login_final: Option<String>,
    #[serde(rename = "sso-v2-token-cookie-name", default)]
    sso_v2_token_cookie_name: Option<String>,
    #[serde(default)]
    error: Option<ErrorXml>,
}

#[derive(Debug, Deserialize)]
struct ErrorXml {
    #[serde(rename = "@id", default)]
    id: Option<String>,
    #[serde(rename = "$text", default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfigXml {
    #[serde(rename = "vpn-base-config", default)]
    vpn_base_config: Option<VpnBaseConfigXml>,
}

#[derive(Debug, Deserialize)]
struct VpnBaseConfigXml {
    #[serde(rename = "server-cert-hash", default)]
    server_cert_hash: Option<String>,
}

impl ConfigAuthXml {
    fn error_message(&self) -> Option<String> {
        let error = self
            .error
            .as_ref()
            .or_else(|| self.auth.as_ref().and_then(|a| a.error.as_ref()))?;
        Some(
            error
                .message
                .clone()
                .filter(|m| !m.trim().is_empty())
                .or_else(|| error.id.clone())
                .unwrap_or_else(|| "unspecified error".to_string()),
        )
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn device_id() -> &'static str {
    if cfg!(target_os = "macos") {
        "mac-intel"
    } else if cfg!(target_os = "windows") {
        "win"
    } else {
        "linux-64"
    }
}

fn init_request(portal: &Url) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<config-auth client="vpn" type="init" aggregate-auth-version="2">
<version who="vpn">{version}</version>
<device-id>{device}</device-id>
<group-select></group-select>
<group-access>{portal}</group-access>
<capabilities><auth-method>single-sign-on-v2</auth-method></capabilities>
</config-auth>"#,
        version = CLIENT_VERSION,
        device = device_id(),
        portal = escape(portal.as_str()),
    )
}

fn auth_reply(opaque: &str, token: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<config-auth client="vpn" type="auth-reply" aggregate-auth-version="2">
<version who="vpn">{version}</version>
<device-id>{device}</device-id>
<session-token/>
<session-id/>
{opaque}
<auth><sso-token>{token}</sso-token></auth>
</config-auth>"#,
        version = CLIENT_VERSION,
        device = device_id(),
        opaque = opaque,
        token = escape(token),
    )
}

/// Parse the portal's answer to `init`
fn parse_auth_request(body: &str, landed_on: &Url) -> Result<PreAuthResponse, AuthError> {
    let doc: ConfigAuthXml = quick_xml::de::from_str(body)?;

    if let Some(message) = doc.error_message() {
        return Err(AuthError::Rejected {
            step: AuthStep::PreAuth,
            message,
        });
    }

    if doc.kind.as_deref() != Some("auth-request") {
        return Err(AuthError::Rejected {
            step: AuthStep::PreAuth,
            message: format!("unexpected response type {:?}", doc.kind),
        });
    }

    let auth = doc.auth.ok_or_else(|| AuthError::MissingField("auth".to_string()))?;
    let login_url = non_empty(auth.sso_v2_login)
        .ok_or_else(|| AuthError::UnsupportedMethod("portal did not offer single-sign-on-v2".to_string()))?;

    Ok(PreAuthResponse {
        login_url,
        login_final_url: non_empty(auth.sso_v2_login_final),
        token_cookie_name: non_empty(auth.sso_v2_token_cookie_name)
            .or_else(|| Some(DEFAULT_TOKEN_COOKIE.to_string())),
        portal_url: Some(landed_on.to_string()),
        opaque: raw_element(body, "opaque").map(str::to_string),
    })
}

/// Parse the portal's answer to `auth-reply`
fn parse_complete(body: &str) -> Result<AuthCompleteResponse, AuthError> {
    let doc: ConfigAuthXml = quick_xml::de::from_str(body)?;

    if let Some(message) = doc.error_message() {
        return Err(AuthError::Rejected {
            step: AuthStep::PostAuth,
            message,
        });
    }

    let server_cert_hash = doc
        .config
        .and_then(|c| c.vpn_base_config)
        .and_then(|v| non_empty(v.server_cert_hash));

    Ok(AuthCompleteResponse {
        session_token: non_empty(doc.session_token),
        server_cert_hash,
    })
}

async fn post_config_auth(client: &Client, url: &Url, body: String) -> Result<(Url, String), AuthError> {
    let response = client
        .post(url.clone())
        .header("User-Agent", USER_AGENT)
        .header("X-Transcend-Version", "1")
        .header("X-Aggregate-Auth", "1")
        .header("X-Support-HTTP-Auth", "true")
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await?
        .error_for_status()?;

    let landed_on = response.url().clone();
    let text = response.text().await?;
    Ok((landed_on, text))
}

/// Step 1: request a login URL
pub async fn pre_auth(client: &Client, portal: &Url) -> Result<PreAuthResponse, AuthError> {
    info!("Sending aggregate-auth init to {}", portal);

    let (landed_on, body) = post_config_auth(client, portal, init_request(portal)).await?;
    debug!("Init response: {}", body);

    parse_auth_request(&body, &landed_on)
}

/// Step 3: exchange the SSO token for a session token
pub async fn finish_auth(
    client: &Client,
    portal: &Url,
    pending: &PreAuthResponse,
    cookie: &AuthCookie,
) -> Result<AuthCompleteResponse, AuthError> {
    let url = match &pending.portal_url {
        Some(landed_on) => Url::parse(landed_on).map_err(|e| AuthError::InvalidPortal(e.to_string()))?,
        None => portal.clone(),
    };
    info!("Sending aggregate-auth reply to {}", url);

    let opaque = pending.opaque.as_deref().unwrap_or_default();
    let (_, body) = post_config_auth(client, &url, auth_reply(opaque, &cookie.value)).await?;
    debug!("Auth reply response received ({} bytes)", body.len());

    parse_complete(&body)
}
