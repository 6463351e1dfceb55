//! GlobalProtect SAML authentication
//!
//! 1. prelogin - the gateway returns the SAML method and a base64 request
//! 2. the identity provider hands back a `prelogin-cookie`
//! 3. login - the prelogin cookie is exchanged for an auth cookie, which is
//!    packed into the cookie string `openconnect --protocol=gp` reads on stdin

use super::{AuthCompleteResponse, AuthError, AuthStep, PreAuthResponse};
use crate::webauth::AuthCookie;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

const USER_AGENT: &str = "PAN GlobalProtect";
const PRELOGIN_COOKIE: &str = "prelogin-cookie";
const USERAUTH_COOKIE: &str = "portal-userauthcookie";

// XML deserialization structures for prelogin
#[derive(Debug, Deserialize)]
#[serde(rename = "prelogin-response")]
struct PreloginXml {
    status: String,
    #[serde(default)]
    msg: Option<String>,
    #[serde(rename = "saml-auth-method", default)]
    saml_auth_method: Option<String>,
    #[serde(rename = "saml-request", default)]
    saml_request: Option<String>,
}

// XML deserialization structures for login
#[derive(Debug, Deserialize)]
struct JnlpXml {
    #[serde(rename = "application-desc")]
    application_desc: ApplicationDesc,
}

#[derive(Debug, Deserialize)]
struct ApplicationDesc {
    #[serde(default)]
    argument: Vec<String>,
}

fn client_os() -> &'static str {
    if cfg!(target_os = "macos") {
        "Mac"
    } else if cfg!(target_os = "windows") {
        "Windows"
    } else {
        "Linux"
    }
}

fn computer_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn endpoint(portal: &Url, path: &str) -> Result<Url, AuthError> {
    portal
        .join(path)
        .map_err(|e| AuthError::InvalidPortal(format!("{}: {}", portal, e)))
}

/// Turn a prelogin response into the URL the login window should open
fn parse_prelogin(body: &str) -> Result<PreAuthResponse, AuthError> {
    let prelogin: PreloginXml = quick_xml::de::from_str(body)?;

    if prelogin.status != "Success" {
        let reason = prelogin
            .msg
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(prelogin.status);
        return Err(AuthError::Rejected {
            step: AuthStep::PreAuth,
            message: reason,
        });
    }

    let method = prelogin
        .saml_auth_method
        .ok_or_else(|| AuthError::UnsupportedMethod("gateway does not use SAML".to_string()))?;
    let request = prelogin
        .saml_request
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .ok_or_else(|| AuthError::MissingField("saml-request".to_string()))?;

    let login_url = match method.to_ascii_uppercase().as_str() {
        "REDIRECT" => {
            let decoded = STANDARD
                .decode(&request)
                .map_err(|e| AuthError::InvalidResponse(format!("saml-request: {}", e)))?;
            String::from_utf8(decoded)
                .map_err(|e| AuthError::InvalidResponse(format!("saml-request: {}", e)))?
        }
        // The request is an auto-submitting HTML form
        "POST" => format!("data:text/html;base64,{}", request),
        other => return Err(AuthError::UnsupportedMethod(other.to_string())),
    };

    Ok(PreAuthResponse {
        login_url,
        login_final_url: None,
        token_cookie_name: Some(PRELOGIN_COOKIE.to_string()),
        portal_url: None,
        opaque: None,
    })
}

/// Key/value pairs from the JNLP `<argument>` list
fn jnlp_value<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    args.chunks(2)
        .find(|pair| pair.len() == 2 && pair[0] == key)
        .map(|pair| pair[1].as_str())
        .filter(|v| !v.is_empty())
}

/// Build the openconnect GlobalProtect cookie from a login response
fn parse_login(body: &str, gateway: &str, username: &str, computer: &str) -> Result<AuthCompleteResponse, AuthError> {
    let jnlp: JnlpXml = quick_xml::de::from_str(body).map_err(|e| AuthError::Rejected {
        step: AuthStep::PostAuth,
        message: format!("Invalid login response: {}", e),
    })?;
    let args = &jnlp.application_desc.argument;

    let Some(auth_cookie) = jnlp_value(args, "(auth-cookie)") else {
        return Ok(AuthCompleteResponse::default());
    };

    let token = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("authcookie", auth_cookie)
        .append_pair("portal", jnlp_value(args, "(portal)").unwrap_or(gateway))
        .append_pair("user", jnlp_value(args, "(user)").unwrap_or(username))
        .append_pair("domain", jnlp_value(args, "(domain)").unwrap_or_default())
        .append_pair("computer", computer)
        .append_pair("preferred-ip", "")
        .finish();

    Ok(AuthCompleteResponse {
        session_token: Some(token),
        server_cert_hash: None,
    })
}

/// Step 1: ask the gateway how to authenticate
pub async fn prelogin(client: &Client, portal: &Url) -> Result<PreAuthResponse, AuthError> {
    info!("Sending prelogin request to {}", portal);

    let url = endpoint(portal, "/ssl-vpn/prelogin.esp")?;
    let params = [
        ("tmp", "tmp"),
        ("clientVer", "4100"),
        ("clientos", client_os()),
        ("cas-support", "yes"),
    ];

    let response = client
        .post(url)
        .header("User-Agent", USER_AGENT)
        .form(&params)
        .send()
        .await?;

    let body = response.text().await?;
    debug!("Prelogin response: {}", body);

    parse_prelogin(&body)
}

/// Step 3: exchange the SAML cookie for a tunnel cookie
pub async fn login(
    client: &Client,
    portal: &Url,
    username: Option<&str>,
    cookie: &AuthCookie,
) -> Result<AuthCompleteResponse, AuthError> {
    let username = cookie
        .username
        .as_deref()
        .or(username)
        .ok_or_else(|| AuthError::MissingField("saml-username".to_string()))?;
    info!("Logging in as {} with {}", username, cookie.name);

    let url = endpoint(portal, "/ssl-vpn/login.esp")?;
    let gateway = portal.host_str().unwrap_or_default().to_string();
    let computer = computer_name();
    let cookie_param = if cookie.name == USERAUTH_COOKIE {
        USERAUTH_COOKIE
    } else {
        PRELOGIN_COOKIE
    };

    let params = [
        ("user", username),
        ("passwd", ""),
        (cookie_param, cookie.value.as_str()),
        ("computer", computer.as_str()),
        ("os-version", client_os()),
        ("clientos", client_os()),
        ("clientVer", "4100"),
        ("server", gateway.as_str()),
        ("jnlpReady", "jnlpReady"),
        ("ok", "Login"),
        ("direct", "yes"),
    ];

    let response = client
        .post(url)
        .header("User-Agent", USER_AGENT)
        .form(&params)
        .send()
        .await?;

    let body = response.text().await?;
    debug!("Login response received ({} bytes)", body.len());

    parse_login(&body, &gateway, username, &computer)
}
