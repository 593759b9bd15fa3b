//! # torify
//!
//! Runs a private tor daemon for an application: stages and launches the
//! binary, owns it through an authenticated control session, publishes onion
//! services and opens SOCKS5 streams, optionally isolated per caller on
//! their own circuits.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Torify (lifecycle)           │
//! ├─────────────────────────────────────────┤
//! │ OnionService │ TorProxyClient │ events  │
//! ├─────────────────────────────────────────┤
//! │      TorController (control port)       │
//! ├─────────────────────────────────────────┤
//! │   TorProcess   │   install (files)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use torify_core::{Torify, TorifyConfig};
//!
//! # async fn run() -> torify_core::Result<()> {
//! let torify = Torify::new(TorifyConfig::new("/var/lib/myapp/tor"))?;
//! torify.start().await?;
//!
//! let service = torify.onion_service()?;
//! let address = service.bind_default(8080).await?;
//! println!("reachable at {}", address);
//!
//! let stream = torify.socks_stream("example.onion", 80, Some("session-1")).await?;
//! # drop(stream);
//! torify.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod error;
pub mod install;
pub mod logging;
pub mod shutdown;
pub mod tor;

mod torify;

pub use config::TorifyConfig;
pub use error::{Error, Result};
pub use shutdown::ShutdownSignal;
pub use torify::Torify;

/// Library version, also written to the version marker.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
