//! Client role: one outbound connection, one session.
//!
//! The idle alarm is armed only once the connection is established and is
//! owned by that session, which cancels it if it closes first.

use std::future::Future;
use std::time::Instant;

use anyhow::Result;
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::report::EngineEvent;
use crate::session::{
    CloseCause, ConnectionSession, IdleAlarm, SessionEvent, SessionOutput,
};

use super::{pump, EngineOutcome, TransferEngine};

impl TransferEngine {
    pub(super) async fn connect<F>(&mut self, shutdown: F) -> Result<EngineOutcome>
    where
        F: Future<Output = ()>,
    {
        let target = self.config.endpoint();
        let id = self.next_session_id();
        let mut session = ConnectionSession::new(
            id,
            self.config.mode,
            None,
            self.config.report_interval,
        );
        let mut outcome = EngineOutcome {
            sessions_opened: 1,
            ..EngineOutcome::default()
        };
        tokio::pin!(shutdown);

        info!(conn_id = id, target = %target, "connecting");
        let connected = tokio::select! {
            connected = TcpStream::connect(&target) => connected,
            _ = &mut shutdown => {
                info!(conn_id = id, "shutdown requested before connect completed");
                self.abandon(&mut session, SessionEvent::Closed(CloseCause::Shutdown), &mut outcome);
                return Ok(outcome);
            }
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                warn!(conn_id = id, target = %target, error = %e, "connection failed");
                self.abandon(&mut session, SessionEvent::Errored(e), &mut outcome);
                return Ok(outcome);
            }
        };

        if let Err(e) = stream.set_nodelay(self.config.no_delay) {
            warn!(conn_id = id, error = %e, "failed to set TCP_NODELAY");
        }
        info!(conn_id = id, target = %target, mode = %self.config.mode, "connected");
        self.emit(EngineEvent::Connected {
            target,
            mode: self.config.mode,
        });

        let peer = stream.peer_addr().ok();
        session.set_peer(peer);
        session.activate(Instant::now());
        let shutdown_rx = self.register(id, peer);
        let alarm = IdleAlarm::arm(self.config.idle_timeout);

        let drive = pump::drive(
            session,
            stream,
            self.payload.clone(),
            self.events.clone(),
            shutdown_rx,
            alarm,
        );
        tokio::pin!(drive);

        let summary = tokio::select! {
            summary = &mut drive => summary,
            _ = &mut shutdown => {
                info!("shutdown requested");
                self.shutdown_all();
                drive.await
            }
        };
        self.deregister(&summary);
        outcome.record(summary);
        Ok(outcome)
    }

    /// Close a session that never became active and emit its summary.
    fn abandon(
        &mut self,
        session: &mut ConnectionSession,
        event: SessionEvent,
        outcome: &mut EngineOutcome,
    ) {
        if let Some(SessionOutput::Summary(summary)) = session.handle(event, Instant::now()) {
            self.emit(EngineEvent::Closed {
                summary: summary.clone(),
            });
            outcome.record(summary);
        }
    }
}
