//! Per-session socket driver.
//!
//! Waits on socket readiness, turns it into [`SessionEvent`]s and hands them
//! to the session. The send pump writes with `try_write`; a `WouldBlock`
//! parks it until the next writability event. Reads are counted and dropped.

use std::io::ErrorKind;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::report::{EngineEvent, EventSender};
use crate::session::{
    CloseCause, CloseSummary, ConnectionSession, IdleAlarm, SessionEvent, SessionOutput,
};

/// Size of the scratch buffer inbound data is read into and discarded from.
pub const READ_BUFFER_LEN: usize = 256 * 1024;

/// Drive an active session until it closes.
///
/// The session closes on peer close, transport error, a signal (or drop) on
/// `shutdown_rx`, or `alarm` firing. The socket is shut down and released
/// before the summary is emitted. A pending `alarm` is cancelled once on the
/// way out.
pub async fn drive(
    mut session: ConnectionSession,
    mut stream: TcpStream,
    payload: Option<Bytes>,
    events: EventSender,
    mut shutdown_rx: oneshot::Receiver<()>,
    mut alarm: IdleAlarm,
) -> CloseSummary {
    let id = session.id();
    let payload = payload.filter(|p| !p.is_empty());
    let interest = match payload {
        Some(_) => Interest::READABLE | Interest::WRITABLE,
        None => Interest::READABLE,
    };
    let mut read_buf = vec![0u8; READ_BUFFER_LEN];
    let mut offset = 0usize;
    let mut pending: Vec<SessionEvent> = Vec::with_capacity(2);

    debug!(
        conn_id = id,
        generator = payload.is_some(),
        idle_alarm = alarm.is_pending(),
        "session pump started"
    );

    let summary = loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_rx => {
                debug!(conn_id = id, "shutdown signal received");
                pending.push(SessionEvent::Closed(CloseCause::Shutdown));
            }

            _ = alarm.expired() => {
                info!(conn_id = id, "idle timeout expired");
                pending.push(SessionEvent::Closed(CloseCause::IdleTimeout));
            }

            ready = stream.ready(interest) => match ready {
                Ok(ready) => {
                    if ready.is_readable() {
                        pending.extend(read_event(&stream, &mut read_buf));
                    }
                    if ready.is_writable() && !pending.iter().any(SessionEvent::is_terminal) {
                        if let Some(payload) = &payload {
                            pending.extend(write_event(&stream, payload, &mut offset));
                        }
                    }
                }
                Err(e) => pending.push(SessionEvent::Errored(e)),
            },
        }

        let mut closed = None;
        for event in pending.drain(..) {
            if let SessionEvent::Errored(e) = &event {
                warn!(conn_id = id, error = %e, "transport error");
            }
            match session.handle(event, Instant::now()) {
                Some(SessionOutput::Report { id, report }) => {
                    let _ = events.send(EngineEvent::Report { id, report });
                }
                Some(SessionOutput::Summary(summary)) => closed = Some(summary),
                None => {}
            }
        }
        if let Some(summary) = closed {
            break summary;
        }
    };

    if let Err(e) = stream.shutdown().await {
        debug!(conn_id = id, error = %e, "socket shutdown failed");
    }
    drop(stream);

    if alarm.cancel() {
        debug!(conn_id = id, "idle alarm cancelled");
    }

    info!(
        conn_id = id,
        cause = ?summary.cause,
        read_bytes = session.read().cumulative_bytes(),
        write_bytes = session.write().cumulative_bytes(),
        elapsed_sec = summary.elapsed_secs,
        "connection closed"
    );
    let _ = events.send(EngineEvent::Closed {
        summary: summary.clone(),
    });
    summary
}

/// One non-blocking read. `None` if the readiness was spurious.
fn read_event(stream: &TcpStream, buf: &mut [u8]) -> Option<SessionEvent> {
    match stream.try_read(buf) {
        Ok(0) => Some(SessionEvent::Closed(CloseCause::PeerClosed)),
        Ok(n) => Some(SessionEvent::Readable(n)),
        Err(e) if e.kind() == ErrorKind::WouldBlock => None,
        Err(e) => Some(SessionEvent::Errored(e)),
    }
}

/// One non-blocking write of the payload from `offset`, wrapping at the end
/// so the byte stream stays a continuous repetition of the payload. `None`
/// on back-pressure.
fn write_event(stream: &TcpStream, payload: &Bytes, offset: &mut usize) -> Option<SessionEvent> {
    match stream.try_write(&payload[*offset..]) {
        Ok(n) => {
            *offset = (*offset + n) % payload.len();
            Some(SessionEvent::Writable(n))
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => None,
        Err(e) => Some(SessionEvent::Errored(e)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
