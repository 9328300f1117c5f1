//! Transfer engine: owns the active-session registry and runs one role.
//!
//! The engine's run loop is the only code that touches the registry. Each
//! session runs as its own task driven by [`pump::drive`]; the
//! [`CloseSummary`] it returns is what removes it from the registry. Mass
//! shutdown goes through the per-session [`SessionHandle`] shutdown channel.

pub mod client;
pub mod pump;
pub mod server;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError, Mode, Role};
use crate::payload;
use crate::report::{EngineEvent, EventSender};
use crate::session::CloseSummary;

/// Close summaries kept in [`EngineOutcome::summaries`]; older ones are
/// dropped and only counted.
pub const MAX_RETAINED_SUMMARIES: usize = 1024;

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Registry entry for an active session.
///
/// Sending on (or dropping) `shutdown_tx` tells the session task to close.
/// It is taken once the session has been signalled.
#[derive(Debug)]
pub struct SessionHandle {
    /// Remote address, when known.
    pub peer: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

// ---------------------------------------------------------------------------
// EngineOutcome
// ---------------------------------------------------------------------------

/// What a finished engine run produced.
#[derive(Debug, Default)]
pub struct EngineOutcome {
    /// Sessions created (connection ids handed out), including failed
    /// connection attempts.
    pub sessions_opened: u64,
    /// Sessions that produced a close summary.
    pub sessions_closed: u64,
    /// The most recent close summaries, in close order, capped at
    /// [`MAX_RETAINED_SUMMARIES`].
    pub summaries: VecDeque<CloseSummary>,
}

impl EngineOutcome {
    /// Count a closed session and keep its summary, evicting the oldest
    /// one past the cap.
    pub fn record(&mut self, summary: CloseSummary) {
        self.sessions_closed += 1;
        if self.summaries.len() == MAX_RETAINED_SUMMARIES {
            self.summaries.pop_front();
        }
        self.summaries.push_back(summary);
    }
}

// ---------------------------------------------------------------------------
// TransferEngine
// ---------------------------------------------------------------------------

/// Runs the configured role and owns the registry of active sessions.
pub struct TransferEngine {
    config: Config,
    /// Shared generator buffer; `None` in sink mode.
    payload: Option<Bytes>,
    events: EventSender,
    active: HashMap<u64, SessionHandle>,
    last_id: u64,
}

impl TransferEngine {
    /// Validate `config` and build the payload (generator mode only).
    pub fn new(config: Config, events: EventSender) -> Result<Self, ConfigError> {
        config.validate()?;
        let payload = match config.mode {
            Mode::Generator => {
                let buf = payload::build(config.write_chunk_size);
                debug!(
                    write_chunk = config.write_chunk_size,
                    payload_len = buf.len(),
                    "payload built"
                );
                Some(buf)
            }
            Mode::Sink => None,
        };
        Ok(Self {
            config,
            payload,
            events,
            active: HashMap::new(),
            last_id: 0,
        })
    }

    /// Shared generator buffer, if this engine writes.
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Number of sessions currently in the registry.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Run the configured role until it finishes, the idle timeout fires, or
    /// `shutdown` resolves. Returns `Err` only for startup failures such as a
    /// failed bind.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<EngineOutcome>
    where
        F: Future<Output = ()>,
    {
        info!(
            role = ?self.config.role,
            mode = %self.config.mode,
            endpoint = %self.config.endpoint(),
            "engine starting"
        );
        let outcome = match self.config.role {
            Role::Server => self.serve(shutdown).await?,
            Role::Client => self.connect(shutdown).await?,
        };
        info!(
            sessions = outcome.sessions_opened,
            closed = outcome.sessions_closed,
            "engine stopped"
        );
        Ok(outcome)
    }

    fn next_session_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }

    /// Add an active session and return the receiver its task listens on.
    fn register(&mut self, id: u64, peer: Option<SocketAddr>) -> oneshot::Receiver<()> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.active.insert(
            id,
            SessionHandle {
                peer,
                shutdown_tx: Some(shutdown_tx),
            },
        );
        shutdown_rx
    }

    /// Remove a closed session. Returns `false` if it was not registered.
    fn deregister(&mut self, summary: &CloseSummary) -> bool {
        match self.active.remove(&summary.id) {
            Some(_) => {
                debug!(
                    conn_id = summary.id,
                    remaining = self.active.len(),
                    "session removed"
                );
                true
            }
            None => {
                warn!(conn_id = summary.id, "closed session was not registered");
                false
            }
        }
    }

    /// Drop registry entries whose task is gone without reporting back.
    ///
    /// Only unsignalled entries can be checked; signalled ones are cleared by
    /// [`TransferEngine::clear_registry`] once every task has been joined.
    fn prune_orphans(&mut self) {
        self.active.retain(|id, handle| {
            let alive = handle
                .shutdown_tx
                .as_ref()
                .map_or(true, |tx| !tx.is_closed());
            if !alive {
                warn!(conn_id = *id, "session task ended without a summary");
            }
            alive
        });
    }

    /// Called after all session tasks are joined; anything left is an orphan.
    fn clear_registry(&mut self) {
        for id in self.active.keys() {
            warn!(conn_id = *id, "session task ended without a summary");
        }
        self.active.clear();
    }

    /// Signal every active session to close. Entries stay registered until
    /// their task reports back. Returns the number signalled.
    fn shutdown_all(&mut self) -> usize {
        let mut signalled = 0;
        for (id, handle) in self.active.iter_mut() {
            if let Some(tx) = handle.shutdown_tx.take() {
                debug!(conn_id = *id, peer = ?handle.peer, "signalling session");
                let _ = tx.send(());
                signalled += 1;
            }
        }
        if signalled > 0 {
            info!(count = signalled, "closing active sessions");
        }
        signalled
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
