//! Connection lifecycle
//!
//! A single actor task owns the connection state and the auth session.
//! User requests reach it through a [`ControllerHandle`]; results of portal
//! calls, the web login and the privileged process come back to it as
//! events, so every transition happens on the actor in arrival order.
//!
//! ```text
//! Stopped -> Processing -> WebAuthPending -> Processing -> Launched
//!     ^                                                       |
//!     +------------------- Processing <-----------------------+
//! ```

use crate::auth::{AuthCompleteResponse, AuthError, AuthManager, AuthStep, PortalClient, PreAuthResponse};
use crate::config::Config;
use crate::credentials::{CredentialStore, Credentials, CredentialsError};
use crate::openconnect::{
    build_launch, LaunchSettings, ProcessLauncher, ProcessReport, SupervisorError, TunnelAuth,
};
use crate::webauth::{AuthCookie, WebAuthBridge, WebAuthError};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lines of process output carried in a launch error
const OUTPUT_TAIL_LINES: usize = 5;
const COMMAND_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Stopped,
    WebAuthPending,
    Processing,
    Launched,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Stopped => "stopped",
            ConnectionState::WebAuthPending => "waiting for web login",
            ConnectionState::Processing => "processing",
            ConnectionState::Launched => "launched",
        })
    }
}

/// What the presentation layer observes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    pub state: ConnectionState,
    /// Keep the login window open
    pub pin_open: bool,
    pub login_url: Option<String>,
    pub last_error: Option<String>,
}

impl Default for ControllerStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Stopped,
            pin_open: false,
            login_url: None,
            last_error: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Cannot start while {0}")]
    Busy(ConnectionState),
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
    #[error("{step} failed: {source}")]
    Auth {
        step: AuthStep,
        #[source]
        source: AuthError,
    },
    #[error(transparent)]
    WebAuth(#[from] WebAuthError),
    #[error("Web login finished without a session cookie")]
    CookieMissing,
    #[error("Portal did not return a session token")]
    SessionTokenMissing,
    #[error("openconnect failed to start: {0}")]
    ProcessLaunch(String),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("No authenticated session to restart")]
    NoSession,
    #[error("Controller is no longer running")]
    Closed,
}

impl ControllerError {
    /// Step name used in log lines
    pub fn step(&self) -> &'static str {
        match self {
            ControllerError::Busy(_) | ControllerError::Credentials(_) => "start",
            ControllerError::Auth { step, .. } => step.as_str(),
            ControllerError::WebAuth(_) | ControllerError::CookieMissing => AuthStep::WebAuth.as_str(),
            ControllerError::SessionTokenMissing => AuthStep::PostAuth.as_str(),
            ControllerError::Supervisor(SupervisorError::Terminate { .. })
            | ControllerError::Supervisor(SupervisorError::PidFile { .. }) => "terminate",
            ControllerError::ProcessLaunch(_) | ControllerError::Supervisor(_) => "launch",
            ControllerError::NoSession => "restart",
            ControllerError::Closed => "controller",
        }
    }
}

/// External collaborators the controller drives
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn CredentialStore>,
    pub portal: Arc<dyn PortalClient>,
    pub bridge: Arc<dyn WebAuthBridge>,
    pub launcher: Arc<dyn ProcessLauncher>,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub launch: LaunchSettings,
    /// Pause before the login window is dismissed
    pub settle_delay: Duration,
    pub web_auth_timeout: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            launch: LaunchSettings::from(&config.openconnect),
            settle_delay: config.auth.settle_delay(),
            web_auth_timeout: config.auth.web_auth_timeout(),
        }
    }
}

type Reply = oneshot::Sender<Result<(), ControllerError>>;

enum Command {
    Start {
        credentials: Credentials,
        save: bool,
        reply: Reply,
    },
    Terminate {
        forget_auth: bool,
        reply: Reply,
    },
    Restart {
        reply: Reply,
    },
}

enum Event {
    PreAuth {
        attempt: u64,
        result: Result<PreAuthResponse, AuthError>,
    },
    Cookie {
        attempt: u64,
        result: Result<Option<AuthCookie>, WebAuthError>,
    },
    PostAuth {
        attempt: u64,
        result: Result<AuthCompleteResponse, AuthError>,
    },
    ProcessExited {
        launch: u64,
        report: ProcessReport,
    },
}

/// Ephemeral SAML state
struct AuthSession {
    auth: AuthManager,
    pending: Option<PreAuthResponse>,
    session_token: Option<String>,
    server_cert_hash: Option<String>,
}

/// Cloneable front door to a running controller
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ControllerStatus>,
}

impl ControllerHandle {
    /// Begin connecting. Resolves once the first step is under way; later
    /// failures show up in [`ControllerStatus::last_error`].
    pub async fn start(&self, credentials: Credentials, save: bool) -> Result<(), ControllerError> {
        self.request(|reply| Command::Start {
            credentials,
            save,
            reply,
        })
        .await
    }

    /// Stop the tunnel. `forget_auth` discards the session token.
    pub async fn terminate(&self, forget_auth: bool) -> Result<(), ControllerError> {
        self.request(|reply| Command::Terminate { forget_auth, reply }).await
    }

    /// Stop and relaunch with the current session token
    pub async fn restart(&self) -> Result<(), ControllerError> {
        self.request(|reply| Command::Restart { reply }).await
    }

    pub fn status(&self) -> ControllerStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.status.clone()
    }

    /// Wait until the published status satisfies `done`
    pub async fn wait_until<F>(&self, mut done: F) -> Result<ControllerStatus, ControllerError>
    where
        F: FnMut(&ControllerStatus) -> bool,
    {
        let mut status = self.status.clone();
        let matched = status.wait_for(|s| done(s)).await.map_err(|_| ControllerError::Closed)?;
        Ok((*matched).clone())
    }

    async fn request<F>(&self, command: F) -> Result<(), ControllerError>
    where
        F: FnOnce(Reply) -> Command,
    {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ControllerError::Closed)?;
        response.await.map_err(|_| ControllerError::Closed)?
    }
}

pub struct Controller {
    settings: ControllerSettings,
    store: Arc<dyn CredentialStore>,
    portal: Arc<dyn PortalClient>,
    bridge: Arc<dyn WebAuthBridge>,
    launcher: Arc<dyn ProcessLauncher>,
    status: watch::Sender<ControllerStatus>,
    events: mpsc::UnboundedSender<Event>,
    credentials: Option<Credentials>,
    session: Option<AuthSession>,
    /// Bumped whenever an auth attempt is started or abandoned
    attempt: u64,
    /// Bumped on every launch and termination
    launch_seq: u64,
    web_auth_cancel: Option<CancellationToken>,
}

impl Controller {
    /// Run the controller on the current tokio runtime. It stops, taking
    /// the tunnel down, once every handle is dropped.
    pub fn spawn(settings: ControllerSettings, collaborators: Collaborators) -> ControllerHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ControllerStatus::default());

        let controller = Controller {
            settings,
            store: collaborators.store,
            portal: collaborators.portal,
            bridge: collaborators.bridge,
            launcher: collaborators.launcher,
            status: status_tx,
            events: events_tx,
            credentials: None,
            session: None,
            attempt: 0,
            launch_seq: 0,
            web_auth_cancel: None,
        };
        tokio::spawn(controller.run(commands_rx, events_rx));

        ControllerHandle {
            commands: commands_tx,
            status: status_rx,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut events: mpsc::UnboundedReceiver<Event>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }

        debug!("All controller handles dropped, shutting down");
        if let Err(e) = self.terminate(true).await {
            warn!("Failed to stop openconnect on shutdown: {}", e);
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                credentials,
                save,
                reply,
            } => {
                let result = self.start(credentials, save).await;
                if let Err(e) = &result {
                    self.report(e);
                }
                let _ = reply.send(result);
            }
            Command::Terminate { forget_auth, reply } => {
                let _ = reply.send(self.terminate(forget_auth).await);
            }
            Command::Restart { reply } => {
                let result = self.restart().await;
                if let Err(e) = &result {
                    self.report(e);
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::PreAuth { attempt, result } if attempt == self.attempt => self.on_pre_auth(result),
            Event::Cookie { attempt, result } if attempt == self.attempt => self.on_cookie(result),
            Event::PostAuth { attempt, result } if attempt == self.attempt => {
                self.on_post_auth(result).await
            }
            Event::ProcessExited { launch, report } if launch == self.launch_seq => {
                self.on_process_exit(report)
            }
            _ => debug!("Discarding result of a superseded attempt"),
        }
    }

    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_if_modified(|status| {
            let changed = status.state != state;
            status.state = state;
            changed
        });
    }

    /// Log `err` and publish it
    fn report(&self, err: &ControllerError) {
        error!(step = err.step(), "{}", err);
        let message = err.to_string();
        self.status.send_modify(|status| status.last_error = Some(message));
    }

    /// Give up on the current auth attempt
    fn abandon(&mut self, err: ControllerError) {
        error!(step = err.step(), "{}", err);
        self.attempt += 1;
        self.session = None;
        if let Some(cancel) = self.web_auth_cancel.take() {
            cancel.cancel();
            self.close_bridge(Duration::ZERO);
        }
        let message = err.to_string();
        self.status.send_modify(|status| {
            status.state = ConnectionState::Stopped;
            status.pin_open = false;
            status.login_url = None;
            status.last_error = Some(message);
        });
    }

    fn close_bridge(&self, delay: Duration) {
        let bridge = self.bridge.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            bridge.close().await;
        });
    }

    async fn start(&mut self, mut credentials: Credentials, save: bool) -> Result<(), ControllerError> {
        let state = self.state();
        if state != ConnectionState::Stopped {
            return Err(ControllerError::Busy(state));
        }

        credentials.load_sudo_password(self.store.as_ref())?;
        credentials.validate()?;
        if save {
            self.store.save(&credentials)?;
        }
        if self.launcher.is_running().await {
            return Err(SupervisorError::AlreadyRunning.into());
        }

        info!(
            portal = %credentials.portal,
            protocol = %credentials.protocol,
            saml = credentials.samlv2,
            "Starting connection"
        );

        self.attempt += 1;
        self.session = None;
        self.status.send_modify(|status| {
            status.state = ConnectionState::Processing;
            status.last_error = None;
        });

        if !credentials.samlv2 {
            self.credentials = Some(credentials);
            return self.launch().await;
        }

        let auth = AuthManager::new(self.portal.clone(), &credentials, self.settings.web_auth_timeout);
        self.session = Some(AuthSession {
            auth: auth.clone(),
            pending: None,
            session_token: None,
            server_cert_hash: None,
        });
        self.credentials = Some(credentials);

        let attempt = self.attempt;
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = auth.pre_auth().await;
            let _ = events.send(Event::PreAuth { attempt, result });
        });
        Ok(())
    }

    fn on_pre_auth(&mut self, result: Result<PreAuthResponse, AuthError>) {
        let response = match result {
            Ok(response) => response,
            Err(source) => {
                return self.abandon(ControllerError::Auth {
                    step: AuthStep::PreAuth,
                    source,
                });
            }
        };
        let Some(session) = self.session.as_mut() else {
            debug!("Pre-auth finished without an auth session");
            return;
        };

        let request = response.web_auth_request();
        let auth = session.auth.clone();
        session.pending = Some(response);

        let cancel = CancellationToken::new();
        self.web_auth_cancel = Some(cancel.clone());
        let login_url = request.login_url.clone();
        self.status.send_modify(|status| {
            status.state = ConnectionState::WebAuthPending;
            status.pin_open = true;
            status.login_url = Some(login_url);
        });

        let attempt = self.attempt;
        let events = self.events.clone();
        let bridge = self.bridge.clone();
        tokio::spawn(async move {
            let result = auth.web_auth(bridge, request, cancel).await;
            let _ = events.send(Event::Cookie { attempt, result });
        });
    }

    fn on_cookie(&mut self, result: Result<Option<AuthCookie>, WebAuthError>) {
        let cookie = match result {
            Ok(Some(cookie)) => cookie,
            Ok(None) => return self.abandon(ControllerError::CookieMissing),
            Err(e) => return self.abandon(ControllerError::WebAuth(e)),
        };
        self.web_auth_cancel = None;

        let Some((auth, pending)) = self
            .session
            .as_mut()
            .and_then(|s| s.pending.take().map(|pending| (s.auth.clone(), pending)))
        else {
            debug!("Cookie arrived without a pending pre-auth");
            return;
        };

        debug!(cookie = %cookie.name, "Web login produced a cookie");
        self.status.send_modify(|status| {
            status.state = ConnectionState::Processing;
            status.pin_open = false;
            status.login_url = None;
        });
        self.close_bridge(self.settings.settle_delay);

        let attempt = self.attempt;
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = auth.finish_auth(pending, cookie).await;
            let _ = events.send(Event::PostAuth { attempt, result });
        });
    }

    async fn on_post_auth(&mut self, result: Result<AuthCompleteResponse, AuthError>) {
        let complete = match result {
            Ok(complete) => complete,
            Err(source) => {
                return self.abandon(ControllerError::Auth {
                    step: AuthStep::PostAuth,
                    source,
                });
            }
        };
        let Some(token) = complete.session_token.filter(|t| !t.is_empty()) else {
            return self.abandon(ControllerError::SessionTokenMissing);
        };
        let Some(session) = self.session.as_mut() else {
            debug!("Post-auth finished without an auth session");
            return;
        };

        info!(step = %AuthStep::PostAuth, pinned = complete.server_cert_hash.is_some(), "Session token received");
        session.session_token = Some(token);
        session.server_cert_hash = complete.server_cert_hash;

        if let Err(e) = self.launch().await {
            self.report(&e);
        }
    }

    /// Build the privileged command and hand it to the launcher
    async fn launch(&mut self) -> Result<(), ControllerError> {
        let Some(credentials) = &self.credentials else {
            return Err(ControllerError::NoSession);
        };

        let auth = if credentials.samlv2 {
            let session = self.session.as_ref();
            let token = session
                .and_then(|s| s.session_token.as_deref())
                .ok_or(ControllerError::SessionTokenMissing)?;
            TunnelAuth::Session {
                token,
                server_cert_hash: session.and_then(|s| s.server_cert_hash.as_deref()),
            }
        } else {
            TunnelAuth::Password
        };
        let command = build_launch(credentials, &self.settings.launch, auth)?;

        self.set_state(ConnectionState::Processing);
        self.launch_seq += 1;
        let launch = self.launch_seq;

        match self.launcher.launch(command).await {
            Ok(done) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    let report = done.await.unwrap_or_else(|_| ProcessReport {
                        exit_code: None,
                        success: false,
                        output: "process monitor stopped unexpectedly".to_string(),
                    });
                    let _ = events.send(Event::ProcessExited { launch, report });
                });
                Ok(())
            }
            Err(e) => {
                // Keep the session token across a busy launcher
                if !matches!(e, SupervisorError::AlreadyRunning) {
                    self.session = None;
                }
                self.status.send_modify(|status| {
                    status.state = ConnectionState::Stopped;
                    status.pin_open = false;
                    status.login_url = None;
                });
                Err(e.into())
            }
        }
    }

    fn on_process_exit(&mut self, report: ProcessReport) {
        if report.success {
            info!("openconnect detached, tunnel is up");
            self.set_state(ConnectionState::Launched);
            return;
        }

        let code = report
            .exit_code
            .map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {}", c));
        let tail = report.tail(OUTPUT_TAIL_LINES);
        let err = if tail.is_empty() {
            ControllerError::ProcessLaunch(code)
        } else {
            ControllerError::ProcessLaunch(format!("{}: {}", code, tail))
        };
        error!(step = err.step(), "{}", err);
        self.session = None;
        let message = err.to_string();
        self.status.send_modify(|status| {
            status.state = ConnectionState::Stopped;
            status.last_error = Some(message);
        });
    }

    async fn terminate(&mut self, forget_auth: bool) -> Result<(), ControllerError> {
        self.attempt += 1;
        self.launch_seq += 1;
        if let Some(cancel) = self.web_auth_cancel.take() {
            debug!("Abandoning web login");
            cancel.cancel();
            self.close_bridge(Duration::ZERO);
        }

        if self.state() != ConnectionState::Stopped {
            self.status.send_modify(|status| {
                status.state = ConnectionState::Processing;
                status.pin_open = false;
                status.login_url = None;
            });
        }

        if forget_auth {
            self.session = None;
        } else if let Some(session) = self.session.as_mut() {
            session.pending = None;
        }

        let result = match &self.credentials {
            Some(credentials) => self.launcher.terminate_process(credentials).await,
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                self.set_state(ConnectionState::Stopped);
                info!(forget_auth, "Connection stopped");
                Ok(())
            }
            Err(e) => {
                let err = ControllerError::from(e);
                if self.launcher.is_running().await {
                    warn!("openconnect is still running");
                    self.set_state(ConnectionState::Launched);
                } else {
                    self.set_state(ConnectionState::Stopped);
                }
                self.report(&err);
                Err(err)
            }
        }
    }

    async fn restart(&mut self) -> Result<(), ControllerError> {
        let Some(credentials) = &self.credentials else {
            return Err(ControllerError::NoSession);
        };
        if credentials.samlv2 && !self.session.as_ref().is_some_and(|s| s.session_token.is_some()) {
            return Err(ControllerError::NoSession);
        }

        info!("Restarting connection");
        self.terminate(false).await?;
        self.launch().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PreAuthRequest;
    use crate::credentials::{MemoryStore, Protocol};
    use crate::openconnect::LaunchCommand;
    use crate::webauth::WebAuthRequest;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, OnceLock};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct FakePortal {
        reject_pre_auth: bool,
        omit_token: bool,
        pre_auth_calls: AtomicUsize,
        cookies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PortalClient for FakePortal {
        async fn pre_auth(&self, request: &PreAuthRequest) -> Result<PreAuthResponse, AuthError> {
            self.pre_auth_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_pre_auth {
                return Err(AuthError::Rejected {
                    step: AuthStep::PreAuth,
                    message: "Invalid group".to_string(),
                });
            }
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
            self.cookies.lock().unwrap().push(format!("{}={}", cookie.name, cookie.value));
            if self.omit_token {
                return Ok(AuthCompleteResponse::default());
            }
            Ok(AuthCompleteResponse {
                session_token: Some("tok123".to_string()),
                server_cert_hash: Some("deadbeef".to_string()),
            })
        }
    }

    /// Waits for the test to hand over a cookie
    struct FakeBridge {
        cookies: tokio::sync::Mutex<mpsc::UnboundedReceiver<Option<AuthCookie>>>,
        requests: AtomicUsize,
        closed: AtomicUsize,
    }

    impl FakeBridge {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<Option<AuthCookie>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let bridge = Arc::new(Self {
                cookies: tokio::sync::Mutex::new(rx),
                requests: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            });
            (bridge, tx)
        }
    }

    #[async_trait]
    impl WebAuthBridge for FakeBridge {
        async fn authenticate(
            &self,
            _request: &WebAuthRequest,
            cancel: CancellationToken,
        ) -> Result<Option<AuthCookie>, WebAuthError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let mut cookies = self.cookies.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => Err(WebAuthError::Cancelled),
                cookie = cookies.recv() => Ok(cookie.flatten()),
            }
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug, Clone)]
    struct Launch {
        args: Vec<String>,
        stdin: Vec<u8>,
        state_at_launch: ConnectionState,
    }

    /// Records launches; a successful launch leaves a "daemon" running
    /// until terminated
    struct FakeLauncher {
        outcome: ProcessReport,
        running: Mutex<bool>,
        /// terminate_process fails and leaves the process running
        stuck: Mutex<bool>,
        launches: Mutex<Vec<Launch>>,
        calls: Mutex<Vec<&'static str>>,
        status: OnceLock<watch::Receiver<ControllerStatus>>,
    }

    impl FakeLauncher {
        fn new(outcome: ProcessReport) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                running: Mutex::new(false),
                stuck: Mutex::new(false),
                launches: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
                status: OnceLock::new(),
            })
        }

        fn succeeding() -> Arc<Self> {
            Self::new(ProcessReport {
                exit_code: Some(0),
                success: true,
                output: String::new(),
            })
        }

        fn launches(&self) -> Vec<Launch> {
            self.launches.lock().unwrap().clone()
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessLauncher for FakeLauncher {
        async fn launch(&self, command: LaunchCommand) -> Result<oneshot::Receiver<ProcessReport>, SupervisorError> {
            let mut running = self.running.lock().unwrap();
            if *running {
                return Err(SupervisorError::AlreadyRunning);
            }
            *running = self.outcome.success;

            let state_at_launch = self
                .status
                .get()
                .map(|s| s.borrow().state)
                .unwrap_or(ConnectionState::Stopped);
            self.launches.lock().unwrap().push(Launch {
                args: command.args.clone(),
                stdin: command.input.as_bytes().to_vec(),
                state_at_launch,
            });
            self.calls.lock().unwrap().push("launch");

            let (tx, rx) = oneshot::channel();
            let _ = tx.send(self.outcome.clone());
            Ok(rx)
        }

        async fn terminate_process(&self, _credentials: &Credentials) -> Result<(), SupervisorError> {
            self.calls.lock().unwrap().push("terminate");
            if *self.stuck.lock().unwrap() {
                return Err(SupervisorError::Terminate {
                    pid: 4242,
                    reason: "Sorry, try again.".to_string(),
                });
            }
            *self.running.lock().unwrap() = false;
            Ok(())
        }

        async fn is_running(&self) -> bool {
            *self.running.lock().unwrap()
        }
    }

    struct Harness {
        handle: ControllerHandle,
        portal: Arc<FakePortal>,
        bridge: Arc<FakeBridge>,
        cookies: mpsc::UnboundedSender<Option<AuthCookie>>,
        launcher: Arc<FakeLauncher>,
        store: Arc<MemoryStore>,
    }

    fn harness(portal: FakePortal, launcher: Arc<FakeLauncher>) -> Harness {
        let portal = Arc::new(portal);
        let (bridge, cookies) = FakeBridge::new();
        let store = Arc::new(MemoryStore::new());
        let settings = ControllerSettings {
            launch: LaunchSettings {
                sudo: PathBuf::from("/usr/bin/sudo"),
                pid_file: PathBuf::from("/var/run/openconnect.pid"),
            },
            settle_delay: Duration::from_millis(10),
            web_auth_timeout: Duration::from_secs(30),
        };
        let handle = Controller::spawn(
            settings,
            Collaborators {
                store: store.clone(),
                portal: portal.clone(),
                bridge: bridge.clone(),
                launcher: launcher.clone(),
            },
        );
        let _ = launcher.status.set(handle.subscribe());

        Harness {
            handle,
            portal,
            bridge,
            cookies,
            launcher,
            store,
        }
    }

    fn password_creds() -> Credentials {
        Credentials::password(
            "vpn.example.com",
            Protocol::AnyConnect,
            "alice",
            "pw1",
            "/usr/local/bin/openconnect",
        )
        .with_sudo_password("root1")
    }

    fn saml_creds() -> Credentials {
        Credentials::saml("vpn.example.com", Protocol::GlobalProtect, "/usr/local/bin/openconnect")
            .with_sudo_password("root1")
    }

    async fn wait_state(handle: &ControllerHandle, state: ConnectionState) -> ControllerStatus {
        timeout(WAIT, handle.wait_until(|s| s.state == state))
            .await
            .expect("timed out waiting for state")
            .unwrap()
    }

    async fn wait_error(handle: &ControllerHandle) -> ControllerStatus {
        timeout(WAIT, handle.wait_until(|s| s.last_error.is_some()))
            .await
            .expect("timed out waiting for error")
            .unwrap()
    }

    /// Run a SAML start up to the launched tunnel
    async fn connect_saml(h: &Harness) {
        h.handle.start(saml_creds(), false).await.unwrap();
        wait_state(&h.handle, ConnectionState::WebAuthPending).await;
        h.cookies
            .send(AuthCookie::parse("SESSID=abc", "SESSID"))
            .unwrap();
        wait_state(&h.handle, ConnectionState::Launched).await;
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[tokio::test]
    async fn test_password_start_launches_once() {
        let h = harness(FakePortal::default(), FakeLauncher::succeeding());

        h.handle.start(password_creds(), false).await.unwrap();
        wait_state(&h.handle, ConnectionState::Launched).await;

        let launches = h.launcher.launches();
        assert_eq!(launches.len(), 1);
        let launch = &launches[0];
        assert_eq!(launch.state_at_launch, ConnectionState::Processing);
        assert!(launch.args.contains(&"--protocol=anyconnect".to_string()));
        assert!(has_pair(&launch.args, "-u", "alice"));
        assert!(launch.args.contains(&"--passwd-on-stdin".to_string()));
        assert_eq!(launch.stdin, b"root1\npw1\n");
        assert_eq!(h.portal.pre_auth_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_saml_flow_launches_with_session_token() {
        let h = harness(FakePortal::default(), FakeLauncher::succeeding());

        h.handle.start(saml_creds(), false).await.unwrap();
        let pending = wait_state(&h.handle, ConnectionState::WebAuthPending).await;
        assert!(pending.pin_open);
        assert_eq!(pending.login_url.as_deref(), Some("https://vpn.example.com/saml"));
        assert!(h.launcher.launches().is_empty());

        h.cookies
            .send(AuthCookie::parse("SESSID=abc", "SESSID"))
            .unwrap();
        let launched = wait_state(&h.handle, ConnectionState::Launched).await;
        assert!(!launched.pin_open);
        assert!(launched.last_error.is_none());

        let launches = h.launcher.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].state_at_launch, ConnectionState::Processing);
        assert_eq!(launches[0].stdin, b"root1\ntok123\n");
        assert!(launches[0].args.contains(&"--servercert=deadbeef".to_string()));
        assert!(launches[0].args.contains(&"--protocol=gp".to_string()));
        assert_eq!(*h.portal.cookies.lock().unwrap(), vec!["SESSID=abc".to_string()]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.bridge.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pre_auth_error_never_reaches_web_auth() {
        let portal = FakePortal {
            reject_pre_auth: true,
            ..Default::default()
        };
        let h = harness(portal, FakeLauncher::succeeding());

        h.handle.start(saml_creds(), false).await.unwrap();
        let status = wait_error(&h.handle).await;

        assert_eq!(status.state, ConnectionState::Stopped);
        assert!(status.last_error.unwrap().contains("Invalid group"));
        assert_eq!(h.bridge.requests.load(Ordering::SeqCst), 0);
        assert!(h.launcher.launches().is_empty());

        // the controller stays usable
        h.handle.start(password_creds(), false).await.unwrap();
        wait_state(&h.handle, ConnectionState::Launched).await;
    }

    #[tokio::test]
    async fn test_forget_auth_reruns_full_login() {
        let h = harness(FakePortal::default(), FakeLauncher::succeeding());
        connect_saml(&h).await;

        h.handle.terminate(true).await.unwrap();
        assert_eq!(h.handle.state(), ConnectionState::Stopped);

        h.handle.start(saml_creds(), false).await.unwrap();
        wait_state(&h.handle, ConnectionState::WebAuthPending).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.portal.pre_auth_calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.bridge.requests.load(Ordering::SeqCst), 2);
        assert_eq!(h.launcher.launches().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_reuses_session_after_termination() {
        let h = harness(FakePortal::default(), FakeLauncher::succeeding());
        connect_saml(&h).await;

        h.handle.restart().await.unwrap();
        wait_state(&h.handle, ConnectionState::Launched).await;

        assert_eq!(h.launcher.calls(), vec!["launch", "terminate", "launch"]);
        let launches = h.launcher.launches();
        assert_eq!(launches.len(), 2);
        assert_eq!(launches[1].stdin, b"root1\ntok123\n");
        assert_eq!(h.portal.pre_auth_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_without_session_fails() {
        let h = harness(FakePortal::default(), FakeLauncher::succeeding());
        assert!(matches!(h.handle.restart().await, Err(ControllerError::NoSession)));

        connect_saml(&h).await;
        h.handle.terminate(true).await.unwrap();
        assert!(matches!(h.handle.restart().await, Err(ControllerError::NoSession)));
    }

    #[tokio::test]
    async fn test_start_while_busy_is_rejected() {
        let h = harness(FakePortal::default(), FakeLauncher::succeeding());
        h.handle.start(saml_creds(), false).await.unwrap();
        wait_state(&h.handle, ConnectionState::WebAuthPending).await;

        let second = h.handle.start(password_creds(), false).await;
        assert!(matches!(
            second,
            Err(ControllerError::Busy(ConnectionState::WebAuthPending))
        ));
        assert_eq!(h.handle.state(), ConnectionState::WebAuthPending);
    }

    #[tokio::test]
    async fn test_cancel_during_web_auth_discards_attempt() {
        let h = harness(FakePortal::default(), FakeLauncher::succeeding());
        h.handle.start(saml_creds(), false).await.unwrap();
        wait_state(&h.handle, ConnectionState::WebAuthPending).await;

        h.handle.terminate(true).await.unwrap();
        let status = h.handle.status();
        assert_eq!(status.state, ConnectionState::Stopped);
        assert!(!status.pin_open);

        // a late cookie has nowhere to go
        let _ = h.cookies.send(AuthCookie::parse("SESSID=late", "SESSID"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.handle.state(), ConnectionState::Stopped);
        assert!(h.launcher.launches().is_empty());
        assert!(h.portal.cookies.lock().unwrap().is_empty());
        assert_eq!(h.bridge.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_web_auth_without_cookie_stops() {
        let h = harness(FakePortal::default(), FakeLauncher::succeeding());
        h.handle.start(saml_creds(), false).await.unwrap();
        wait_state(&h.handle, ConnectionState::WebAuthPending).await;

        h.cookies.send(None).unwrap();
        let status = wait_error(&h.handle).await;

        assert_eq!(status.state, ConnectionState::Stopped);
        assert_eq!(
            status.last_error.as_deref(),
            Some("Web login finished without a session cookie")
        );
        assert!(h.portal.cookies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_session_token_does_not_launch() {
        let portal = FakePortal {
            omit_token: true,
            ..Default::default()
        };
        let h = harness(portal, FakeLauncher::succeeding());
        h.handle.start(saml_creds(), false).await.unwrap();
        wait_state(&h.handle, ConnectionState::WebAuthPending).await;
        h.cookies
            .send(AuthCookie::parse("SESSID=abc", "SESSID"))
            .unwrap();

        let status = wait_error(&h.handle).await;
        assert_eq!(status.state, ConnectionState::Stopped);
        assert_eq!(
            status.last_error.as_deref(),
            Some("Portal did not return a session token")
        );
        assert!(h.launcher.launches().is_empty());
    }

    #[tokio::test]
    async fn test_failed_process_returns_to_stopped() {
        let launcher = FakeLauncher::new(ProcessReport {
            exit_code: Some(1),
            success: false,
            output: "Connecting...\nFailed to open HTTPS connection".to_string(),
        });
        let h = harness(FakePortal::default(), launcher);

        h.handle.start(password_creds(), false).await.unwrap();
        let status = wait_error(&h.handle).await;

        assert_eq!(status.state, ConnectionState::Stopped);
        let message = status.last_error.unwrap();
        assert!(message.contains("exit code 1"));
        assert!(message.contains("Failed to open HTTPS connection"));
    }

    #[tokio::test]
    async fn test_launch_while_running_is_rejected() {
        let launcher = FakeLauncher::succeeding();
        *launcher.running.lock().unwrap() = true;
        let h = harness(FakePortal::default(), launcher);

        let result = h.handle.start(password_creds(), false).await;
        assert!(matches!(
            result,
            Err(ControllerError::Supervisor(SupervisorError::AlreadyRunning))
        ));
        assert_eq!(h.handle.state(), ConnectionState::Stopped);
        assert!(h.launcher.launches().is_empty());

        *h.launcher.running.lock().unwrap() = false;
        h.handle.start(password_creds(), false).await.unwrap();
        wait_state(&h.handle, ConnectionState::Launched).await;
    }

    #[tokio::test]
    async fn test_saml_launch_into_busy_launcher_stays_retryable() {
        let h = harness(FakePortal::default(), FakeLauncher::succeeding());
        h.handle.start(saml_creds(), false).await.unwrap();
        wait_state(&h.handle, ConnectionState::WebAuthPending).await;

        // another openconnect shows up while the user is logging in
        *h.launcher.running.lock().unwrap() = true;
        h.cookies
            .send(AuthCookie::parse("SESSID=abc", "SESSID"))
            .unwrap();

        let status = wait_error(&h.handle).await;
        assert_eq!(status.state, ConnectionState::Stopped);
        assert!(!status.pin_open);
        assert!(status.login_url.is_none());
        assert_eq!(status.last_error.as_deref(), Some("openconnect is already running"));
        assert!(h.launcher.launches().is_empty());

        *h.launcher.running.lock().unwrap() = false;
        h.handle.start(saml_creds(), false).await.unwrap();
        let pending = wait_state(&h.handle, ConnectionState::WebAuthPending).await;
        assert!(pending.last_error.is_none());
    }

    #[tokio::test]
    async fn test_failed_termination_keeps_tunnel_state() {
        let h = harness(FakePortal::default(), FakeLauncher::succeeding());
        h.handle.start(password_creds(), false).await.unwrap();
        wait_state(&h.handle, ConnectionState::Launched).await;

        *h.launcher.stuck.lock().unwrap() = true;
        let result = h.handle.terminate(true).await;
        assert!(matches!(
            result,
            Err(ControllerError::Supervisor(SupervisorError::Terminate { pid: 4242, .. }))
        ));
        let status = h.handle.status();
        assert_eq!(status.state, ConnectionState::Launched);
        assert!(status.last_error.unwrap().contains("Sorry, try again."));

        let second = h.handle.start(password_creds(), false).await;
        assert!(matches!(second, Err(ControllerError::Busy(ConnectionState::Launched))));

        *h.launcher.stuck.lock().unwrap() = false;
        h.handle.terminate(true).await.unwrap();
        assert_eq!(h.handle.state(), ConnectionState::Stopped);
        assert_eq!(h.launcher.calls(), vec!["launch", "terminate", "terminate"]);
    }

    #[tokio::test]
    async fn test_invalid_credentials_rejected_before_any_work() {
        let h = harness(FakePortal::default(), FakeLauncher::succeeding());
        let creds = Credentials::saml("vpn.example.com", Protocol::AnyConnect, "openconnect");

        let result = h.handle.start(creds, false).await;
        assert!(matches!(
            result,
            Err(ControllerError::Credentials(CredentialsError::MissingSudoPassword))
        ));
        assert_eq!(h.handle.state(), ConnectionState::Stopped);
        assert_eq!(h.portal.pre_auth_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_saved_sudo_password_is_reused() {
        let h = harness(FakePortal::default(), FakeLauncher::succeeding());
        h.handle.start(password_creds(), true).await.unwrap();
        wait_state(&h.handle, ConnectionState::Launched).await;
        h.handle.terminate(true).await.unwrap();
        assert_eq!(
            h.store.load_sudo_password("vpn.example.com").unwrap().as_deref(),
            Some("root1")
        );

        let mut creds = password_creds();
        creds.sudo_password = None;
        h.handle.start(creds, false).await.unwrap();
        wait_state(&h.handle, ConnectionState::Launched).await;
        assert_eq!(h.launcher.launches()[1].stdin, b"root1\npw1\n");
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_tunnel() {
        let h = harness(FakePortal::default(), FakeLauncher::succeeding());
        h.handle.start(password_creds(), false).await.unwrap();
        wait_state(&h.handle, ConnectionState::Launched).await;

        let launcher = h.launcher.clone();
        drop(h);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(launcher.calls(), vec!["launch", "terminate"]);
    }
}
