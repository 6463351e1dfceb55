//! Connection credentials and the secret store they are persisted in
//!
//! The store itself is an external collaborator: `KeyringStore` hands
//! everything to the OS keychain through the `keyring` crate, and
//! `MemoryStore` keeps secrets for the lifetime of the process only.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

const KEYRING_SERVICE: &str = "vpn-launcher";

#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("Portal address is required")]
    MissingPortal,
    #[error("Username is required when SAML is disabled")]
    MissingUsername,
    #[error("Password is required when SAML is disabled")]
    MissingPassword,
    #[error("Superuser password is required to start openconnect")]
    MissingSudoPassword,
    #[error("{0} must not contain a line break")]
    LineBreak(&'static str),
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),
    #[error("Credential store error: {0}")]
    Store(String),
}

/// VPN protocol spoken by the portal, as understood by openconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "gp")]
    GlobalProtect,
    #[serde(rename = "anyconnect")]
    AnyConnect,
}

impl Protocol {
    /// Value passed to `openconnect --protocol=`
    pub fn as_arg(&self) -> &'static str {
        match self {
            Protocol::GlobalProtect => "gp",
            Protocol::AnyConnect => "anyconnect",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Protocol::GlobalProtect => "GlobalProtect",
            Protocol::AnyConnect => "AnyConnect",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

impl FromStr for Protocol {
    type Err = CredentialsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gp" | "globalprotect" => Ok(Protocol::GlobalProtect),
            "anyconnect" => Ok(Protocol::AnyConnect),
            _ => Err(CredentialsError::UnknownProtocol(s.to_string())),
        }
    }
}

/// Everything needed to authenticate and launch a tunnel
#[derive(Clone)]
pub struct Credentials {
    pub portal: String,
    pub protocol: Protocol,
    pub username: Option<String>,
    pub password: Option<String>,
    pub sudo_password: Option<String>,
    pub samlv2: bool,
    /// Path of the openconnect binary run with elevated privileges
    pub bin_path: PathBuf,
}

impl Credentials {
    pub fn saml(portal: impl Into<String>, protocol: Protocol, bin_path: impl Into<PathBuf>) -> Self {
        Self {
            portal: portal.into(),
            protocol,
            username: None,
            password: None,
            sudo_password: None,
            samlv2: true,
            bin_path: bin_path.into(),
        }
    }

    pub fn password(
        portal: impl Into<String>,
        protocol: Protocol,
        username: impl Into<String>,
        password: impl Into<String>,
        bin_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            portal: portal.into(),
            protocol,
            username: Some(username.into()),
            password: Some(password.into()),
            sudo_password: None,
            samlv2: false,
            bin_path: bin_path.into(),
        }
    }

    pub fn with_sudo_password(mut self, sudo_password: impl Into<String>) -> Self {
        self.sudo_password = Some(sudo_password.into());
        self
    }

    /// Username/password are only required outside SAML mode; the sudo
    /// password is always required.
    pub fn validate(&self) -> Result<(), CredentialsError> {
        if self.portal.trim().is_empty() {
            return Err(CredentialsError::MissingPortal);
        }
        if !self.samlv2 {
            if is_blank(&self.username) {
                return Err(CredentialsError::MissingUsername);
            }
            if is_blank(&self.password) {
                return Err(CredentialsError::MissingPassword);
            }
        }
        if is_blank(&self.sudo_password) {
            return Err(CredentialsError::MissingSudoPassword);
        }
        if let Some(password) = &self.password {
            single_line(password, "Password")?;
        }
        if let Some(sudo_password) = &self.sudo_password {
            single_line(sudo_password, "Superuser password")?;
        }
        Ok(())
    }

    /// Fill in a missing sudo password from `store`
    pub fn load_sudo_password(&mut self, store: &dyn CredentialStore) -> Result<(), CredentialsError> {
        if is_blank(&self.sudo_password) {
            if let Some(sudo_password) = store.load_sudo_password(&self.portal)? {
                debug!("Loaded superuser password for {} from store", self.portal);
                self.sudo_password = Some(sudo_password);
            }
        }
        Ok(())
    }
}

/// Secrets are written to stdin one per line
pub(crate) fn single_line<'a>(secret: &'a str, what: &'static str) -> Result<&'a str, CredentialsError> {
    if secret.contains(['\n', '\r']) {
        return Err(CredentialsError::LineBreak(what));
    }
    Ok(secret)
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(str::is_empty)
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("portal", &self.portal)
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("sudo_password", &self.sudo_password.as_ref().map(|_| "<redacted>"))
            .field("samlv2", &self.samlv2)
            .field("bin_path", &self.bin_path)
            .finish()
    }
}

/// Persistent secret storage
pub trait CredentialStore: Send + Sync {
    /// Persist the secrets in `credentials` that are present
    fn save(&self, credentials: &Credentials) -> Result<(), CredentialsError>;

    fn load_sudo_password(&self, portal: &str) -> Result<Option<String>, CredentialsError>;

    fn load_password(&self, portal: &str, username: &str) -> Result<Option<String>, CredentialsError>;
}

fn sudo_account(portal: &str) -> String {
    format!("{}:sudo", portal)
}

fn password_account(portal: &str, username: &str) -> String {
    format!("{}:{}", portal, username)
}

/// OS keychain backed store
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
        }
    }

    fn entry(&self, account: &str) -> Result<keyring::Entry, CredentialsError> {
        keyring::Entry::new(&self.service, account).map_err(|e| CredentialsError::Store(e.to_string()))
    }

    fn get(&self, account: &str) -> Result<Option<String>, CredentialsError> {
        match self.entry(account)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CredentialsError::Store(e.to_string())),
        }
    }

    fn set(&self, account: &str, secret: &str) -> Result<(), CredentialsError> {
        self.entry(account)?
            .set_password(secret)
            .map_err(|e| CredentialsError::Store(e.to_string()))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringStore {
    fn save(&self, credentials: &Credentials) -> Result<(), CredentialsError> {
        if let Some(sudo_password) = credentials.sudo_password.as_deref().filter(|s| !s.is_empty()) {
            self.set(&sudo_account(&credentials.portal), sudo_password)?;
        }
        if let (Some(username), Some(password)) = (&credentials.username, &credentials.password) {
            if !password.is_empty() {
                self.set(&password_account(&credentials.portal, username), password)?;
            }
        }
        debug!("Saved credentials for {} to keychain", credentials.portal);
        Ok(())
    }

    fn load_sudo_password(&self, portal: &str) -> Result<Option<String>, CredentialsError> {
        self.get(&sudo_account(portal))
    }

    fn load_password(&self, portal: &str, username: &str) -> Result<Option<String>, CredentialsError> {
        self.get(&password_account(portal, username))
    }
}

/// Process-local store, used when the keychain is disabled
#[derive(Default)]
pub struct MemoryStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, CredentialsError> {
        self.secrets
            .lock()
            .map_err(|_| CredentialsError::Store("memory store poisoned".to_string()))
    }
}

impl CredentialStore for MemoryStore {
    fn save(&self, credentials: &Credentials) -> Result<(), CredentialsError> {
        let mut secrets = self.lock()?;
        if let Some(sudo_password) = &credentials.sudo_password {
            secrets.insert(sudo_account(&credentials.portal), sudo_password.clone());
        }
        if let (Some(username), Some(password)) = (&credentials.username, &credentials.password) {
            secrets.insert(password_account(&credentials.portal, username), password.clone());
        }
        Ok(())
    }

    fn load_sudo_password(&self, portal: &str) -> Result<Option<String>, CredentialsError> {
        Ok(self.lock()?.get(&sudo_account(portal)).cloned())
    }

    fn load_password(&self, portal: &str, username: &str) -> Result<Option<String>, CredentialsError> {
        Ok(self.lock()?.get(&password_account(portal, username)).cloned())
    }
}
