//! Event broadcaster (§4.8): emits a single `status_update` payload after each
//! reconcile and each distribution pass.
//!
//! The HTTP/WebSocket fan-out a UI would subscribe to is out of scope (§1);
//! this module only implements the interface contract those callers rely on.
//! [`LogBroadcaster`] stands in for that excluded surface.

use crate::model::{Order, Printer};
use crate::store::FleetStore;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct EnrichedPrinter {
    #[serde(flatten)]
    pub printer: Printer,
    pub current_file: Option<String>,
    pub minutes_since_finished: Option<i64>,
    pub print_stage: crate::model::PrintStage,
    pub stage_detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub printers: Vec<EnrichedPrinter>,
    pub total_filament: f64,
    pub orders: Vec<Order>,
}

pub fn enrich(printer: &Printer, now: DateTime<Utc>) -> EnrichedPrinter {
    EnrichedPrinter {
        current_file: printer.file.clone(),
        minutes_since_finished: printer.minutes_since_finished(now),
        print_stage: printer.print_stage(),
        stage_detail: printer.stage_detail(now),
        printer: printer.clone(),
    }
}

/// Builds the broadcast payload from the store's current snapshot. Never
/// mutates the underlying state (§4.8).
pub async fn build_status_update(store: &FleetStore, now: DateTime<Utc>) -> anyhow::Result<StatusUpdate> {
    let printers = store.read_printers().await?;
    let orders = store.read_orders().await?;
    let total_filament_g = store.total_filament_g().await?;

    Ok(StatusUpdate {
        printers: printers.iter().map(|p| enrich(p, now)).collect(),
        total_filament: total_filament_g / 1000.0,
        orders: orders.into_iter().filter(|o| !o.deleted).collect(),
    })
}

pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, update: StatusUpdate);
}

/// Production broadcaster: logs the payload. Stands in for the excluded
/// WebSocket fan-out (§1, §4.8).
pub struct LogBroadcaster;

impl Broadcaster for LogBroadcaster {
    fn broadcast(&self, update: StatusUpdate) {
        log::debug!(
            "status_update: {} printers, {:.3}kg filament, {} orders",
            update.printers.len(),
            update.total_filament,
            update.orders.len()
        );
    }
}

#[cfg(test)]
pub struct RecordingBroadcaster {
    pub updates: std::sync::Mutex<Vec<StatusUpdate>>,
}

#[cfg(test)]
impl RecordingBroadcaster {
    pub fn new() -> Self {
        RecordingBroadcaster {
            updates: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&self, update: StatusUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Printer, PrinterState, PrinterType};

    #[test]
    fn stage_detail_for_finished_reports_minutes_ago() {
        let mut p = Printer::new("P1", "10.0.0.1", PrinterType::A);
        p.state = PrinterState::Finished;
        let now = Utc::now();
        p.finish_time = Some(now - chrono::Duration::minutes(7));
        let enriched = enrich(&p, now);
        assert_eq!(enriched.stage_detail, "Finished 7m ago");
        assert_eq!(enriched.minutes_since_finished, Some(7));
    }

    #[tokio::test]
    async fn build_status_update_excludes_deleted_orders() {
        let dir = tempfile::tempdir().unwrap();
        let store = FleetStore::load(dir.path()).unwrap();
        store
            .write_orders(|orders| {
                orders.push(crate::model::Order::new(1, "a.gcode", "/tmp/a.gcode", 1));
                let mut deleted = crate::model::Order::new(2, "b.gcode", "/tmp/b.gcode", 1);
                deleted.deleted = true;
                orders.push(deleted);
            })
            .await
            .unwrap();
        let update = build_status_update(&store, Utc::now()).await.unwrap();
        assert_eq!(update.orders.len(), 1);
        assert_eq!(update.orders[0].id, 1);
    }
}
