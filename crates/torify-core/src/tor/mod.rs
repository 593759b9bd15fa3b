//! Tor integration.
//!
//! Everything that talks to the daemon lives here: launching it
//! ([`TorProcess`]), the control session ([`TorController`]), asynchronous
//! events ([`EventDispatcher`]), onion services ([`OnionService`]) and
//! SOCKS5 streams with per-caller circuit isolation ([`TorProxyClient`]).
//!
//! ## Design
//!
//! The daemon is started with networking disabled and owned by this
//! process. Networking is only enabled after the controller has
//! authenticated and subscribed to events, so no event that matters for
//! onion service publication can be missed.

mod connection;
mod controller;
mod events;
mod process;
mod service;

pub use connection::{IsolationCredential, SocksProxy, TorConnection, TorConnector, TorProxyClient};
pub use controller::{wait_for_cookie, Reply, SessionState, TorController};
pub use events::{EventDispatcher, PublicationWindow, TorEvent};
pub use process::{parse_control_port, LaunchSpec, TorProcess};
pub use service::{BinderState, HiddenServiceRecord, OnionAddress, OnionService, PrivateKey};

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// All local sockets (control, SOCKS, onion service targets) are loopback.
pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Interval between bootstrap status polls.
pub const BOOTSTRAP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Interval between cookie file checks.
pub const COOKIE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A cookie file is complete once it holds this many bytes.
pub const COOKIE_MIN_LEN: u64 = 32;

/// Events the controller subscribes to.
pub const EVENTS: &[&str] = &["CIRC", "WARN", "ERR", "HS_DESC", "STATUS_CLIENT"];

/// Events held for a handler before further ones are dropped.
pub const EVENT_QUEUE_LEN: usize = 256;

/// Daemon log line announcing the control port (older daemons).
pub const CONTROL_LISTENING_PREFIX: &str = "Control listener listening on port ";

/// Daemon log line announcing the control port (newer daemons).
pub const CONTROL_OPENED_PREFIX: &str = "Opened Control listener connection (ready) on ";

/// File holding an onion service's public hostname.
pub const HOSTNAME_FILE: &str = "hostname";

/// File holding an onion service's private key blob.
pub const PRIVATE_KEY_FILE: &str = "private_key";
