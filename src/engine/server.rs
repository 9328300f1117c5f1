//! Server role: accept loop, per-connection sessions, engine-wide timeout.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::report::EngineEvent;
use crate::session::{CloseSummary, ConnectionSession, IdleAlarm};

use super::{pump, EngineOutcome, TransferEngine};

impl TransferEngine {
    /// Listen, spawn a session per accepted connection, and on idle timeout
    /// or `shutdown` stop accepting and close every active session.
    pub(super) async fn serve<F>(&mut self, shutdown: F) -> Result<EngineOutcome>
    where
        F: Future<Output = ()>,
    {
        let bind_addr = self.config.endpoint();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind TCP listener on {}", bind_addr))?;
        let local_addr = listener
            .local_addr()
            .context("failed to get local address")?;

        info!(addr = %local_addr, mode = %self.config.mode, "listening");
        self.emit(EngineEvent::Listening {
            addr: local_addr,
            mode: self.config.mode,
        });

        let mut outcome = EngineOutcome::default();
        let mut tasks: JoinSet<CloseSummary> = JoinSet::new();
        let mut alarm = IdleAlarm::arm(self.config.idle_timeout);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.spawn_session(&mut tasks, stream, peer);
                        outcome.sessions_opened += 1;
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept TCP connection");
                    }
                },

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.reap(joined, &mut outcome);
                }

                _ = alarm.expired() => {
                    info!("idle timeout expired, shutting down");
                    break;
                }

                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        // Refuse new connections before closing the existing ones.
        drop(listener);
        alarm.cancel();
        self.shutdown_all();
        while let Some(joined) = tasks.join_next().await {
            self.reap(joined, &mut outcome);
        }
        self.clear_registry();

        Ok(outcome)
    }

    fn spawn_session(
        &mut self,
        tasks: &mut JoinSet<CloseSummary>,
        stream: TcpStream,
        peer: SocketAddr,
    ) {
        let id = self.next_session_id();
        if let Err(e) = stream.set_nodelay(self.config.no_delay) {
            warn!(conn_id = id, error = %e, "failed to set TCP_NODELAY");
        }

        let mut session = ConnectionSession::new(
            id,
            self.config.mode,
            Some(peer),
            self.config.report_interval,
        );
        session.activate(Instant::now());
        let shutdown_rx = self.register(id, Some(peer));

        info!(conn_id = id, peer = %peer, "accepted connection");
        self.emit(EngineEvent::Accepted { id, peer });

        tasks.spawn(pump::drive(
            session,
            stream,
            self.payload.clone(),
            self.events.clone(),
            shutdown_rx,
            IdleAlarm::disarmed(),
        ));
    }

    fn reap(&mut self, joined: Result<CloseSummary, JoinError>, outcome: &mut EngineOutcome) {
        match joined {
            Ok(summary) => {
                self.deregister(&summary);
                outcome.record(summary);
            }
            Err(e) => {
                error!(error = %e, "session task failed");
                self.prune_orphans();
            }
        }
        debug!(active = self.active_count(), "session reaped");
    }
}
