//! VPN Launcher - OpenConnect front-end with SAML web login
//!
//! Drives the SAML login against GlobalProtect and AnyConnect portals and
//! supervises the privileged `openconnect` process that carries the tunnel.
//!
//! # Architecture
//!
//! - `controller`: Connection state machine, the only owner of connection state
//! - `auth`: Portal protocol (pre-auth, web auth hand-off, post-auth)
//! - `webauth`: Interface to the interactive login surface
//! - `openconnect`: Privileged command line and process supervision
//! - `credentials`: Credentials and the secret store
//! - `config`: Configuration file handling (TOML)
//! - `presentation`: State to screen mapping for front-ends
//!
//! # Usage
//!
//! ```bash
//! vpn-launcher connect --portal vpn.example.com --protocol gp
//! ```

pub mod auth;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod openconnect;
pub mod presentation;
pub mod webauth;

pub use config::Config;
pub use controller::{
    Collaborators, ConnectionState, Controller, ControllerError, ControllerHandle, ControllerSettings,
    ControllerStatus,
};
pub use credentials::{CredentialStore, Credentials, KeyringStore, MemoryStore, Protocol};
pub use presentation::{screen_for, Screen};
