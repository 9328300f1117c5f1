//! Connection session state machine.
//!
//! A [`ConnectionSession`] holds everything about one socket except the socket
//! itself: identity, clock, per-direction [`RateTracker`]s and the lifecycle
//! `Created -> Active -> Closed`. The socket driver in `engine::pump` turns
//! readiness into [`SessionEvent`]s and feeds them to
//! [`ConnectionSession::handle`].

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time::Sleep;
use tracing::debug;

use crate::config::Mode;
use crate::rate::{Direction, DirectionTotals, RateReport, RateTracker};

/// Elapsed times are floored to this before computing final rates.
pub const MIN_ELAPSED: Duration = Duration::from_micros(1);

// ---------------------------------------------------------------------------
// Events and outputs
// ---------------------------------------------------------------------------

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseCause {
    /// Peer half-closed or closed the connection.
    PeerClosed,
    /// The transport reported an error.
    Error,
    /// Engine-wide shutdown (idle timeout on the server, or external signal).
    Shutdown,
    /// The client's own idle alarm fired.
    IdleTimeout,
}

/// I/O event delivered to a session.
#[derive(Debug)]
pub enum SessionEvent {
    /// `n` bytes were read from the socket.
    Readable(usize),
    /// The transport accepted `n` bytes.
    Writable(usize),
    /// The transport failed.
    Errored(std::io::Error),
    /// The session is ending for a non-error reason.
    Closed(CloseCause),
}

impl SessionEvent {
    /// Whether this event ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Errored(_) | SessionEvent::Closed(_))
    }
}

/// Something the session wants emitted.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutput {
    /// Interval rate report for one direction.
    Report { id: u64, report: RateReport },
    /// The session just closed.
    Summary(CloseSummary),
}

/// Final record of a closed session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseSummary {
    /// Connection id.
    pub id: u64,
    /// Remote address, when known.
    pub peer: Option<SocketAddr>,
    pub cause: CloseCause,
    /// Transport error message when `cause` is [`CloseCause::Error`].
    pub error: Option<String>,
    /// `None` if the session never became active.
    pub elapsed_secs: Option<f64>,
    /// Present for sinks, or whenever anything was read.
    pub read: Option<DirectionTotals>,
    /// Present for generators.
    pub write: Option<DirectionTotals>,
}

impl CloseSummary {
    /// Whether the session ended on a transport error.
    pub fn is_error(&self) -> bool {
        self.cause == CloseCause::Error
    }
}

// ---------------------------------------------------------------------------
// ConnectionSession
// ---------------------------------------------------------------------------

/// Where a session is in its life. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Active,
    Closed,
}

/// State of one connection: identity, clock and per-direction counters.
#[derive(Debug)]
pub struct ConnectionSession {
    id: u64,
    mode: Mode,
    peer: Option<SocketAddr>,
    /// Report interval; `None` disables interval reports.
    interval: Option<Duration>,
    lifecycle: Lifecycle,
    /// Set on activation.
    started_at: Option<Instant>,
    read: RateTracker,
    write: RateTracker,
}

impl ConnectionSession {
    /// A fresh session in the `Created` state.
    pub fn new(
        id: u64,
        mode: Mode,
        peer: Option<SocketAddr>,
        interval: Option<Duration>,
    ) -> Self {
        Self {
            id,
            mode,
            peer,
            interval,
            lifecycle: Lifecycle::Created,
            started_at: None,
            read: RateTracker::new(Direction::Read),
            write: RateTracker::new(Direction::Write),
        }
    }

    /// Connection id, unique within one engine run.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Record the remote address once it is known.
    pub fn set_peer(&mut self, peer: Option<SocketAddr>) {
        self.peer = peer;
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle == Lifecycle::Closed
    }

    /// Inbound counter.
    pub fn read(&self) -> &RateTracker {
        &self.read
    }

    /// Outbound counter.
    pub fn write(&self) -> &RateTracker {
        &self.write
    }

    /// Start the clock. Only a `Created` session can become active.
    pub fn activate(&mut self, now: Instant) {
        if self.lifecycle == Lifecycle::Created {
            self.lifecycle = Lifecycle::Active;
            self.started_at = Some(now);
        }
    }

    /// Apply one event. Data events are ignored unless the session is active;
    /// terminal events close it exactly once and yield the summary.
    pub fn handle(&mut self, event: SessionEvent, now: Instant) -> Option<SessionOutput> {
        match event {
            SessionEvent::Readable(n) => self.on_bytes(Direction::Read, n, now),
            SessionEvent::Writable(n) => self.on_bytes(Direction::Write, n, now),
            SessionEvent::Errored(e) => self
                .close(CloseCause::Error, Some(e.to_string()), now)
                .map(SessionOutput::Summary),
            SessionEvent::Closed(cause) => {
                self.close(cause, None, now).map(SessionOutput::Summary)
            }
        }
    }

    fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.started_at
            .map(|start| now.saturating_duration_since(start))
    }

    fn on_bytes(&mut self, direction: Direction, n: usize, now: Instant) -> Option<SessionOutput> {
        if self.lifecycle != Lifecycle::Active {
            return None;
        }
        let elapsed = self.elapsed(now)?;
        let (id, interval) = (self.id, self.interval);
        let tracker = match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        };
        tracker.record_bytes(n as u64);
        tracker
            .maybe_report(elapsed, interval)
            .map(|report| SessionOutput::Report { id, report })
    }

    fn close(
        &mut self,
        cause: CloseCause,
        error: Option<String>,
        now: Instant,
    ) -> Option<CloseSummary> {
        if self.lifecycle == Lifecycle::Closed {
            debug!(conn_id = self.id, ?cause, "session already closed");
            return None;
        }
        let elapsed = self.elapsed(now).map(|e| e.max(MIN_ELAPSED));
        self.lifecycle = Lifecycle::Closed;

        let (read, write) = match elapsed {
            Some(elapsed) => {
                let read = (self.mode == Mode::Sink || self.read.cumulative_bytes() > 0)
                    .then(|| self.read.totals(elapsed));
                let write = (self.mode == Mode::Generator).then(|| self.write.totals(elapsed));
                (read, write)
            }
            None => (None, None),
        };

        Some(CloseSummary {
            id: self.id,
            peer: self.peer,
            cause,
            error,
            elapsed_secs: elapsed.map(|e| e.as_secs_f64()),
            read,
            write,
        })
    }
}

// ---------------------------------------------------------------------------
// IdleAlarm
// ---------------------------------------------------------------------------

/// One-shot idle-timeout alarm.
///
/// Fires at most once and can be cancelled at most once; after either, it
/// never fires again.
#[derive(Debug, Default)]
pub struct IdleAlarm {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl IdleAlarm {
    /// An alarm that never fires.
    pub fn disarmed() -> Self {
        Self { sleep: None }
    }

    /// Start the alarm now, if a timeout is configured.
    pub fn arm(timeout: Option<Duration>) -> Self {
        Self {
            sleep: timeout.map(|t| Box::pin(tokio::time::sleep(t))),
        }
    }

    /// Armed and neither fired nor cancelled yet.
    pub fn is_pending(&self) -> bool {
        self.sleep.is_some()
    }

    /// Cancel a pending alarm. Returns `true` only for the call that actually
    /// cancelled it.
    pub fn cancel(&mut self) -> bool {
        self.sleep.take().is_some()
    }

    /// Resolves when the alarm fires; never resolves if disarmed.
    /// Cancel-safe: dropping this future keeps the deadline.
    pub fn expired(&mut self) -> impl Future<Output = ()> + '_ {
        async move {
            let Some(sleep) = self.sleep.as_mut() else {
                return std::future::pending::<()>().await;
            };
            sleep.as_mut().await;
            self.sleep = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
