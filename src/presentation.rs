//! Which screen a front-end shows for a connection state
//!
//! `tunnel_up` is an external observation (a live openconnect daemon or a
//! tunnel interface). It wins over a stale `Stopped`/`WebAuthPending`, and
//! a `Launched` state without a tunnel falls back to the login screen.

use crate::controller::ConnectionState;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Screen {
    Login,
    WebAuth,
    Progress,
    Connected,
}

impl fmt::Display for Screen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Screen::Login => "Not connected",
            Screen::WebAuth => "Waiting for web login",
            Screen::Progress => "Working...",
            Screen::Connected => "Connected",
        })
    }
}

pub fn screen_for(state: ConnectionState, tunnel_up: bool) -> Screen {
    match (state, tunnel_up) {
        (ConnectionState::Stopped, false) => Screen::Login,
        (ConnectionState::Stopped, true) => Screen::Connected,
        (ConnectionState::WebAuthPending, true) => Screen::Connected,
        (ConnectionState::WebAuthPending, false) => Screen::WebAuth,
        (ConnectionState::Processing, _) => Screen::Progress,
        (ConnectionState::Launched, true) => Screen::Connected,
        (ConnectionState::Launched, false) => Screen::Login,
    }
}
