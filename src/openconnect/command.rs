//! Privileged openconnect command line and its stdin payload

use crate::config::OpenConnectConfig;
use crate::credentials::{single_line, Credentials, CredentialsError};
use std::fmt;
use std::path::PathBuf;

/// Where sudo and the pid file live
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSettings {
    pub sudo: PathBuf,
    pub pid_file: PathBuf,
}

impl From<&OpenConnectConfig> for LaunchSettings {
    fn from(config: &OpenConnectConfig) -> Self {
        Self {
            sudo: config.sudo.clone(),
            pid_file: config.pid_file.clone(),
        }
    }
}

/// How openconnect authenticates to the gateway
#[derive(Debug, Clone, Copy)]
pub enum TunnelAuth<'a> {
    /// SAML: session token on stdin, gateway certificate pinned when known
    Session {
        token: &'a str,
        server_cert_hash: Option<&'a str>,
    },
    /// Username on the command line, password on stdin
    Password,
}

/// Newline separated secrets written to the process's stdin. Zeroed on drop.
pub struct SecretInput(Vec<u8>);

impl SecretInput {
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut bytes = Vec::new();
        for line in lines {
            bytes.extend_from_slice(line.as_ref().as_bytes());
            bytes.push(b'\n');
        }
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for SecretInput {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

impl fmt::Debug for SecretInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretInput(<{} bytes>)", self.0.len())
    }
}

/// A program, its arguments, and the secrets it reads from stdin
#[derive(Debug)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub input: SecretInput,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, input: SecretInput) -> Self {
        Self {
            program: program.into(),
            args,
            input,
        }
    }
}

/// Build `sudo -k -S openconnect -b ...` for `credentials`.
///
/// The sudo password always comes first on stdin, followed by the session
/// token or the VPN password. Either secret spanning lines is rejected.
pub fn build_launch(
    credentials: &Credentials,
    settings: &LaunchSettings,
    auth: TunnelAuth<'_>,
) -> Result<LaunchCommand, CredentialsError> {
    let sudo_password = credentials
        .sudo_password
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or(CredentialsError::MissingSudoPassword)?;
    single_line(sudo_password, "Superuser password")?;

    let mut args = vec![
        "-k".to_string(),
        "-S".to_string(),
        credentials.bin_path.display().to_string(),
        "-b".to_string(),
        format!("--protocol={}", credentials.protocol.as_arg()),
        format!("--pid-file={}", settings.pid_file.display()),
    ];

    let second_secret = match auth {
        TunnelAuth::Session { token, server_cert_hash } => {
            args.push("--cookie-on-stdin".to_string());
            if let Some(hash) = server_cert_hash {
                args.push(format!("--servercert={}", hash));
            }
            single_line(token, "Session token")?
        }
        TunnelAuth::Password => {
            let username = credentials
                .username
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or(CredentialsError::MissingUsername)?;
            let password = credentials
                .password
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or(CredentialsError::MissingPassword)?;
            args.extend(["-u".to_string(), username.to_string(), "--passwd-on-stdin".to_string()]);
            single_line(password, "Password")?
        }
    };

    args.push(credentials.portal.clone());

    Ok(LaunchCommand::new(
        &settings.sudo,
        args,
        SecretInput::from_lines([sudo_password, second_secret]),
    ))
}
