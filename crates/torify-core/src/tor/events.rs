//! Asynchronous control port events.
//!
//! The controller queues 650 replies; [`EventDispatcher::run`] drains
//! that queue on its own task and fires one-shot readiness listeners when an
//! onion service descriptor has been uploaded.

use super::controller::Reply;
use crate::error::{Error, Result};
use crate::logging::RedactedOnion;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// A parsed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorEvent {
    /// `HS_DESC <action> <address> ...`
    HsDesc {
        /// `UPLOAD`, `UPLOADED`, `FAILED`, ...
        action: String,
        /// Service id without the `.onion` suffix.
        address: String,
    },
    /// `STATUS_CLIENT <severity> <action> [arguments]`
    StatusClient {
        /// `NOTICE`, `WARN` or `ERR`.
        severity: String,
        /// e.g. `BOOTSTRAP`, `CIRCUIT_ESTABLISHED`.
        action: String,
        /// Remaining `KEY=VALUE` arguments.
        arguments: String,
    },
    /// `CIRC <id> <status> ...`
    Circuit {
        /// Circuit id.
        id: String,
        /// `LAUNCHED`, `BUILT`, `CLOSED`, ...
        status: String,
    },
    /// `WARN <message>`
    Warn(String),
    /// `ERR <message>`
    Err(String),
    /// Anything else.
    Other(String),
}

impl TorEvent {
    /// Parse the first line of an event reply.
    pub fn parse(reply: &Reply) -> Option<Self> {
        let line = reply.lines.first()?;
        let (keyword, body) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let mut fields = body.split_whitespace();

        let event = match keyword {
            "HS_DESC" => TorEvent::HsDesc {
                action: fields.next()?.to_string(),
                address: fields.next()?.to_string(),
            },
            "STATUS_CLIENT" => {
                let severity = fields.next()?.to_string();
                let action = fields.next()?.to_string();
                TorEvent::StatusClient {
                    severity,
                    action,
                    arguments: fields.collect::<Vec<_>>().join(" "),
                }
            }
            "CIRC" => TorEvent::Circuit {
                id: fields.next()?.to_string(),
                status: fields.next()?.to_string(),
            },
            "WARN" => TorEvent::Warn(body.to_string()),
            "ERR" => TorEvent::Err(body.to_string()),
            _ => TorEvent::Other(line.clone()),
        };
        Some(event)
    }
}

type ReadyListener = Box<dyn FnOnce() + Send>;

/// Unmatched uploads remembered while a publication is starting.
const EARLY_UPLOAD_LIMIT: usize = 16;

#[derive(Default)]
struct Registry {
    listeners: HashMap<String, ReadyListener>,
    /// Open [`PublicationWindow`]s.
    windows: usize,
    /// Uploads seen while a window was open and before their listener.
    early: VecDeque<String>,
}

/// Registry of one-shot "descriptor uploaded" listeners, keyed by service id.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Keeps unmatched uploads around until the service id of a starting
/// publication is known. Closes on drop.
#[derive(Debug)]
pub struct PublicationWindow {
    dispatcher: EventDispatcher,
}

impl Drop for PublicationWindow {
    fn drop(&mut self) {
        let mut registry = self.dispatcher.lock();
        registry.windows = registry.windows.saturating_sub(1);
        if registry.windows == 0 {
            registry.early.clear();
        }
    }
}

impl EventDispatcher {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a window for a publication whose service id is not known yet.
    ///
    /// The upload event can be dispatched before the creating command's
    /// caller gets to [`register`](Self::register); while the window is
    /// open such uploads are kept and fire the listener on registration.
    pub fn open_window(&self) -> PublicationWindow {
        self.lock().windows += 1;
        PublicationWindow {
            dispatcher: self.clone(),
        }
    }

    /// Register `listener` to run once when the descriptor of `service_id`
    /// is uploaded. Runs it right away if that already happened inside an
    /// open window.
    pub fn register<F>(&self, service_id: &str, listener: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut registry = self.lock();
        if registry.listeners.contains_key(service_id) {
            return Err(Error::ListenerAlreadyRegistered(service_id.to_string()));
        }
        if let Some(pos) = registry.early.iter().position(|id| id == service_id) {
            registry.early.remove(pos);
            drop(registry);
            tracing::info!(service = %RedactedOnion(service_id), "Onion service descriptor uploaded");
            listener();
            return Ok(());
        }
        registry.listeners.insert(service_id.to_string(), Box::new(listener));
        Ok(())
    }

    /// Drop the listener for `service_id` without running it.
    pub fn remove(&self, service_id: &str) -> bool {
        let mut registry = self.lock();
        registry.early.retain(|id| id != service_id);
        registry.listeners.remove(service_id).is_some()
    }

    /// Whether a listener for `service_id` is waiting.
    pub fn is_pending(&self, service_id: &str) -> bool {
        self.lock().listeners.contains_key(service_id)
    }

    /// Number of waiting listeners.
    pub fn pending(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Handle one event.
    pub fn dispatch(&self, event: &TorEvent) {
        match event {
            TorEvent::HsDesc { action, address } if action == "UPLOADED" => {
                // Removed before running so a listener fires at most once.
                let listener = {
                    let mut registry = self.lock();
                    let listener = registry.listeners.remove(address);
                    if listener.is_none() && registry.windows > 0 && !registry.early.contains(address) {
                        if registry.early.len() == EARLY_UPLOAD_LIMIT {
                            registry.early.pop_front();
                        }
                        registry.early.push_back(address.clone());
                    }
                    listener
                };
                match listener {
                    Some(listener) => {
                        tracing::info!(service = %RedactedOnion(address), "Onion service descriptor uploaded");
                        listener();
                    }
                    None => {
                        tracing::trace!(service = %RedactedOnion(address), "Descriptor upload without listener");
                    }
                }
            }
            TorEvent::StatusClient { action, arguments, .. } if action == "BOOTSTRAP" => {
                tracing::debug!(progress = %arguments, "Bootstrap status");
            }
            TorEvent::Warn(message) => tracing::warn!(target: "torify::tor_events", "{}", message),
            TorEvent::Err(message) => tracing::error!(target: "torify::tor_events", "{}", message),
            other => tracing::trace!(event = ?other, "Tor event"),
        }
    }

    /// Dispatch queued events until the queue closes.
    ///
    /// Pending listeners are dropped afterwards so their waiters see the
    /// session end.
    pub async fn run(self, mut events: mpsc::Receiver<Reply>) {
        while let Some(reply) = events.recv().await {
            if let Some(event) = TorEvent::parse(&reply) {
                self.dispatch(&event);
            }
        }
        let dropped = {
            let mut registry = self.lock();
            let count = registry.listeners.len();
            registry.listeners.clear();
            registry.early.clear();
            count
        };
        tracing::debug!(dropped, "Event queue closed");
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
