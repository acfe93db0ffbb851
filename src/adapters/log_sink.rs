//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by rendering engine events as single-line log
//! records.  A dashboard or database adapter would implement the same
//! trait.

use log::{info, warn};

use crate::app::events::AppEvent;
use crate::app::ports::EventSink;

/// Adapter that logs every [`AppEvent`].
#[derive(Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

fn opt(v: Option<f64>, precision: usize) -> String {
    v.map_or_else(|| "-".to_string(), |v| format!("{v:.precision$}"))
}

impl EventSink for LogEventSink {
    fn emit(&self, event: &AppEvent) {
        match event {
            AppEvent::Telemetry(t) => {
                info!(
                    "TELEM | vial={} {} | OD={} | mu={}/h | Td={}h | gen={:.2} | dose={:.3} | \
                     drug={:.3}",
                    t.vial,
                    t.policy.name(),
                    opt(t.od, 3),
                    opt(t.mu, 3),
                    opt(t.doubling_time, 2),
                    t.generations,
                    t.current_dose,
                    t.drug_concentration,
                );
            }
            AppEvent::Temperature {
                vial_block_c,
                board_c,
            } => {
                info!("TEMP | vials={vial_block_c:.2}\u{00b0}C board={board_c:.2}\u{00b0}C");
            }
            AppEvent::DilutionPerformed {
                vial,
                medium1_ml,
                medium2_ml,
                concentration,
                generations,
            } => {
                info!(
                    "DILUTE | vial={vial} | m1={medium1_ml:.2}mL m2={medium2_ml:.2}mL | \
                     conc={concentration:.3} | +{generations:.3} gen"
                );
            }
            AppEvent::DilutionFailed { vial } => {
                warn!("DILUTE | vial={vial} | failed, state unchanged");
            }
            AppEvent::JobFailed { job } => {
                warn!("JOB | {job} failed");
            }
            AppEvent::JobDropped { job } => {
                info!("JOB | {job} dropped, queue busy");
            }
            AppEvent::CultureRejected { vial, reason } => {
                warn!("CULTURE | vial={vial} rejected: {reason}");
            }
            AppEvent::ExperimentStarted {
                name,
                active_cultures,
            } => {
                info!("START | experiment='{name}' cultures={active_cultures}");
            }
            AppEvent::ExperimentStopped { name } => {
                info!("STOP | experiment='{name}'");
            }
        }
    }
}
