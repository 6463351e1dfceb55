//! OpenConnect integration module
//!
//! openconnect runs under `sudo` with `-b`, so it detaches once the tunnel is
//! up and records its pid in a pid file. This module builds that command line
//! and supervises the privileged process.
//!
//! # Usage
//!
//! ```bash
//! sudo -k -S openconnect -b --protocol=anyconnect \
//!   --pid-file=/var/run/openconnect.pid --cookie-on-stdin \
//!   --servercert=HASH vpn.example.com
//! ```
//!
//! # Lifecycle
//!
//! - launch: the sudo password, then the session token or password, are
//!   written to stdin and stdin is closed
//! - the foreground process exits 0 once openconnect has detached
//! - terminate: the detached process is signalled through sudo using the pid file

pub mod command;
pub mod supervisor;

pub const DEFAULT_PID_FILE: &str = "/var/run/openconnect.pid";

pub use command::{build_launch, LaunchCommand, LaunchSettings, SecretInput, TunnelAuth};
pub use supervisor::{ProcessLauncher, ProcessReport, Supervisor, SupervisorError, SupervisorSettings};
