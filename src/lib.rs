//! tcpspeedtest -- measure sustained TCP throughput between two hosts.
//!
//! One side generates a fixed payload as fast as TCP flow control allows, the
//! other (or both) counts what arrives. Each connection reports current,
//! rolling and all-time rates on an interval and a summary when it closes.

pub mod config;
pub mod engine;
pub mod payload;
pub mod rate;
pub mod report;
pub mod session;

use anyhow::Result;

pub use config::{Config, Mode, Role};
pub use engine::{EngineOutcome, TransferEngine};

/// Run a configured engine, printing its events to stdout until it finishes
/// or Ctrl-C is received.
pub async fn run(config: Config) -> Result<EngineOutcome> {
    let (events, rx) = report::channel();
    let printer = tokio::spawn(report::print_events(rx, config.output));

    let engine = TransferEngine::new(config, events)?;
    let outcome = engine
        .run_until(async {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::error!("failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            tracing::info!("Ctrl-C received");
        })
        .await;

    // The engine (and every sender) is gone; let the printer drain.
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "event printer failed");
    }
    outcome
}
