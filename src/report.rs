//! Measurement output: engine events and their stdout rendering.
//!
//! The engine and its sessions never print directly. They push
//! [`EngineEvent`]s into an unbounded channel; [`print_events`] drains it and
//! writes text or JSON lines to stdout. Diagnostics go through `tracing`
//! instead.

use std::fmt;
use std::net::SocketAddr;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::{Mode, OutputFormat};
use crate::rate::{to_mbps, DirectionTotals, RateReport};
use crate::session::CloseSummary;

pub type EventSender = mpsc::UnboundedSender<EngineEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

// ---------------------------------------------------------------------------
// EngineEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Server bound and accepting.
    Listening { addr: SocketAddr, mode: Mode },
    /// Client connection established.
    Connected { target: String, mode: Mode },
    /// Server accepted a connection.
    Accepted { id: u64, peer: SocketAddr },
    Report { id: u64, report: RateReport },
    Closed { summary: CloseSummary },
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::Listening { addr, mode } => {
                write!(f, "Listening {} mode is {}", addr, mode)
            }
            EngineEvent::Connected { target, mode } => {
                write!(f, "Connected to {} mode is {}", target, mode)
            }
            EngineEvent::Accepted { id, peer } => {
                write!(f, "new connection #{} from {}", id, peer)
            }
            EngineEvent::Report { id, report } => f.write_str(&format_report(*id, report)),
            EngineEvent::Closed { summary } => f.write_str(&format_summary(summary)),
        }
    }
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// `#3 READ : 9.12 mbps (current) 9.40 mbps (rolling) 9.38 mbps (all) t=4.01s`
pub fn format_report(id: u64, report: &RateReport) -> String {
    format!(
        "#{} {:<5}: {:.2} mbps (current) {:.2} mbps (rolling) {:.2} mbps (all) t={:.2}s",
        id,
        report.direction.to_string(),
        to_mbps(report.current_bps),
        to_mbps(report.rolling_bps),
        to_mbps(report.all_time_bps),
        report.elapsed_secs,
    )
}

fn format_totals(label: &str, totals: &DirectionTotals) -> String {
    format!(
        "{}: {} in {:.2} seconds {} bytes/sec {:.2} megabits/sec",
        label, totals.bytes, totals.seconds, totals.bytes_per_sec, totals.megabits_per_sec,
    )
}

/// Multi-line close summary.
pub fn format_summary(summary: &CloseSummary) -> String {
    let mut lines = Vec::with_capacity(5);
    if summary.is_error() {
        match &summary.error {
            Some(e) => lines.push(format!("Network error! ({})", e)),
            None => lines.push("Network error!".to_string()),
        }
    }
    lines.push(format!("closed connection #{}", summary.id));
    if let Some(read) = &summary.read {
        lines.push(format_totals("READ", read));
    }
    if let Some(write) = &summary.write {
        lines.push(format_totals("WRITE", write));
    }
    if let Some(elapsed) = summary.elapsed_secs {
        lines.push(format!("Connection time: {:.2} seconds", elapsed));
    }
    lines.join("\n")
}

/// One JSON object per event, stamped with the UTC time it was printed.
pub fn format_json(event: &EngineEvent) -> serde_json::Result<String> {
    let mut value = serde_json::to_value(event)?;
    if let Some(object) = value.as_object_mut() {
        object.insert("at".into(), Utc::now().to_rfc3339().into());
    }
    serde_json::to_string(&value)
}

// ---------------------------------------------------------------------------
// Printer
// ---------------------------------------------------------------------------

/// Print every event until all senders are dropped.
pub async fn print_events(mut rx: EventReceiver, format: OutputFormat) {
    while let Some(event) = rx.recv().await {
        match format {
            OutputFormat::Text => println!("{}", event),
            OutputFormat::Json => match format_json(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
