use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vpn_launcher::auth::HttpPortal;
use vpn_launcher::openconnect::{Supervisor, SupervisorSettings};
use vpn_launcher::webauth::TerminalBridge;
use vpn_launcher::{
    screen_for, Collaborators, Config, ConnectionState, Controller, ControllerSettings, CredentialStore,
    Credentials, KeyringStore, MemoryStore, Protocol, Screen,
};

/// How often a running tunnel is checked for liveness
const LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "vpn-launcher")]
#[command(about = "OpenConnect launcher with SAML web login for GlobalProtect and AnyConnect")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and start the tunnel; Ctrl+C disconnects, SIGHUP reconnects
    Connect {
        /// Portal address, e.g. vpn.example.com
        #[arg(long)]
        portal: Option<String>,
        /// gp or anyconnect
        #[arg(long)]
        protocol: Option<Protocol>,
        /// Username for VPN authentication
        #[arg(short, long)]
        user: Option<String>,
        /// Use username and password instead of SAML
        #[arg(long)]
        password_auth: bool,
        /// Do not store passwords in the keychain
        #[arg(long)]
        no_save: bool,
    },
    /// Stop a running tunnel
    Disconnect,
    /// Show current VPN status
    Status {
        /// Print machine readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate default config file
    Init,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    connected: bool,
    pid: Option<i32>,
    portal: &'a str,
    protocol: Protocol,
    screen: Screen,
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run(cli));
    // The terminal login may leave a blocked stdin read behind
    runtime.shutdown_timeout(Duration::from_millis(100));
    result
}

async fn run(cli: Cli) -> CliResult<()> {
    let config_path = cli.config.unwrap_or_else(Config::default_path);

    match cli.command {
        Commands::Connect {
            portal,
            protocol,
            user,
            password_auth,
            no_save,
        } => {
            let config = Config::load_or_default(&config_path)?;
            connect(config, portal, protocol, user, password_auth, !no_save).await
        }
        Commands::Disconnect => disconnect(Config::load_or_default(&config_path)?).await,
        Commands::Status { json } => status(&Config::load_or_default(&config_path)?, json),
        Commands::Init => init(&config_path),
    }
}

fn secret_store(config: &Config) -> Arc<dyn CredentialStore> {
    if config.auth.use_keyring {
        Arc::new(KeyringStore::new())
    } else {
        Arc::new(MemoryStore::new())
    }
}

/// Stored sudo password, or a prompt
fn sudo_password(store: &dyn CredentialStore, portal: &str) -> CliResult<String> {
    match store.load_sudo_password(portal) {
        Ok(Some(password)) => return Ok(password),
        Ok(None) => {}
        Err(e) => warn!("Could not read stored superuser password: {}", e),
    }
    Ok(rpassword::prompt_password("Superuser (sudo) password: ")?)
}

async fn connect(
    config: Config,
    portal: Option<String>,
    protocol: Option<Protocol>,
    user: Option<String>,
    password_auth: bool,
    save: bool,
) -> CliResult<()> {
    let portal = portal
        .or_else(|| Some(config.vpn.portal.clone()).filter(|p| !p.is_empty()))
        .ok_or("No portal given; pass --portal or set vpn.portal in the config")?;
    let protocol = protocol.unwrap_or(config.vpn.protocol);
    let store = secret_store(&config);
    let binary = config.openconnect.binary.clone();

    let credentials = if password_auth || !config.vpn.samlv2 {
        let username = user
            .or_else(|| config.vpn.username.clone())
            .ok_or("Username is required for password authentication; pass --user")?;
        let password = match store.load_password(&portal, &username) {
            Ok(Some(password)) => password,
            Ok(None) => rpassword::prompt_password(format!("VPN password for {}: ", username))?,
            Err(e) => {
                warn!("Could not read stored password: {}", e);
                rpassword::prompt_password(format!("VPN password for {}: ", username))?
            }
        };
        Credentials::password(&portal, protocol, username, password, binary)
    } else {
        let mut credentials = Credentials::saml(&portal, protocol, binary);
        credentials.username = user.or_else(|| config.vpn.username.clone());
        credentials
    };
    let credentials = credentials.with_sudo_password(sudo_password(store.as_ref(), &portal)?);

    let supervisor = Arc::new(Supervisor::new(SupervisorSettings::from_config(&config.openconnect)));
    let handle = Controller::spawn(
        ControllerSettings::from_config(&config),
        Collaborators {
            store,
            portal: Arc::new(HttpPortal::new()?),
            bridge: Arc::new(TerminalBridge),
            launcher: supervisor.clone(),
        },
    );

    info!("Connecting to {} ({})", portal, protocol.name());
    handle.start(credentials, save).await?;

    let mut status = handle.subscribe();
    let mut hangup = Hangup::new()?;
    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Disconnecting...");
                handle.terminate(true).await?;
                println!("Disconnected");
                return Ok(());
            }
            Some(()) = hangup.recv() => {
                info!("Reconnecting...");
                if let Err(e) = handle.restart().await {
                    error!("Reconnect failed: {}", e);
                }
            }
            _ = liveness.tick() => {
                if handle.state() == ConnectionState::Launched && supervisor.daemon_pid()?.is_none() {
                    warn!("openconnect is no longer running");
                    handle.terminate(true).await?;
                    return Err("VPN connection lost".into());
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return Err("Controller stopped unexpectedly".into());
                }
                let current = status.borrow_and_update().clone();
                debug!(state = %current.state, "Connection state changed");
                match current.state {
                    ConnectionState::Launched => {
                        println!("Connected to {}. Press Ctrl+C to disconnect.", portal);
                    }
                    ConnectionState::Stopped => {
                        if let Some(e) = current.last_error {
                            return Err(e.into());
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn disconnect(config: Config) -> CliResult<()> {
    let supervisor = Supervisor::new(SupervisorSettings::from_config(&config.openconnect));
    let Some(pid) = supervisor.daemon_pid()? else {
        println!("VPN Status: Not connected");
        return Ok(());
    };

    info!("Disconnecting openconnect (pid {})...", pid);
    let store = secret_store(&config);
    let password = sudo_password(store.as_ref(), &config.vpn.portal)?;
    supervisor.terminate_pid_file(Some(&password)).await?;
    println!("Disconnected");
    Ok(())
}

fn status(config: &Config, json: bool) -> CliResult<()> {
    let supervisor = Supervisor::new(SupervisorSettings::from_config(&config.openconnect));
    let pid = supervisor.daemon_pid()?;
    let screen = daemon_screen(pid);

    if json {
        let report = StatusReport {
            connected: pid.is_some(),
            pid,
            portal: &config.vpn.portal,
            protocol: config.vpn.protocol,
            screen,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("VPN Status: {}", screen);
    if let Some(pid) = pid {
        println!("  openconnect pid: {}", pid);
        if !config.vpn.portal.is_empty() {
            println!("  Portal: {} ({})", config.vpn.portal, config.vpn.protocol.name());
        }
    }
    Ok(())
}

/// No controller runs here; only the daemon is observable
fn daemon_screen(pid: Option<i32>) -> Screen {
    screen_for(ConnectionState::Stopped, pid.is_some())
}

fn init(path: &Path) -> CliResult<()> {
    if path.exists() {
        println!("Config already exists: {}", path.display());
        return Ok(());
    }
    info!("Generating default config...");
    Config::default().save(path)?;
    println!("Created default config: {}", path.display());
    Ok(())
}

#[cfg(unix)]
struct Hangup(tokio::signal::unix::Signal);

#[cfg(unix)]
impl Hangup {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self(signal(SignalKind::hangup())?))
    }

    async fn recv(&mut self) -> Option<()> {
        self.0.recv().await
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Option<()> {
        std::future::pending().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_screen() {
        assert_eq!(daemon_screen(Some(4242)), Screen::Connected);
        assert_eq!(daemon_screen(None), Screen::Login);
    }
}
