//! The printer record: persisted identity/credentials plus runtime state.
//!
//! Printer state and print stage are closed enums (§9 "Sum types for state");
//! every transition goes through the reconciler's merge function
//! ([`crate::reconciler::merge_observation`]) rather than being set ad hoc.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterType {
    A,
    B,
}

/// Printer state, per §3. `Offline`/`Prepare` are carried alongside the eight
/// print-stage values used for broadcast enrichment (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterState {
    Offline,
    Ready,
    Idle,
    Printing,
    Paused,
    Finished,
    Ejecting,
    Cooling,
    Prepare,
    Error,
}

impl Default for PrinterState {
    fn default() -> Self {
        PrinterState::Offline
    }
}

/// Broadcast-facing stage classification (§4.8). A strict subset of
/// [`PrinterState`]: `Offline` folds into `Idle` and `Prepare` folds into
/// `Printing`, matching the eight values the spec names for `print_stage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintStage {
    Idle,
    Ready,
    Printing,
    Paused,
    Finished,
    Ejecting,
    Cooling,
    Error,
}

impl From<PrinterState> for PrintStage {
    fn from(state: PrinterState) -> Self {
        match state {
            PrinterState::Offline => PrintStage::Idle,
            PrinterState::Ready => PrintStage::Ready,
            PrinterState::Idle => PrintStage::Ready,
            PrinterState::Printing => PrintStage::Printing,
            PrinterState::Paused => PrintStage::Paused,
            PrinterState::Finished => PrintStage::Finished,
            PrinterState::Ejecting => PrintStage::Ejecting,
            PrinterState::Cooling => PrintStage::Cooling,
            PrinterState::Prepare => PrintStage::Printing,
            PrinterState::Error => PrintStage::Error,
        }
    }
}

/// A Vendor-A ejection G-code staged by the ejection manager, consumed by the
/// reconciler's next tick (§4.6 step 5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEjection {
    pub gcode_content: String,
    pub gcode_file_name: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Printer {
    pub name: String,
    pub ip: String,
    #[serde(default)]
    pub group: String,
    #[serde(rename = "type")]
    pub printer_type: PrinterType,

    /// Vendor A: encrypted API token.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Vendor B: printer serial number.
    #[serde(default)]
    pub serial_number: Option<String>,
    /// Vendor B: secondary identifier kept alongside the serial (original source
    /// keeps this in its minimal printer projection; no core operation reads it).
    #[serde(default)]
    pub device_id: Option<String>,
    /// Vendor B: encrypted LAN access code.
    #[serde(default)]
    pub access_code: Option<String>,

    #[serde(default)]
    pub service_mode: bool,

    // --- runtime fields (reset on load; see `reset_runtime`) ---
    #[serde(default)]
    pub state: PrinterState,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub time_remaining: u64,
    #[serde(default)]
    pub z_height: f64,
    #[serde(default)]
    pub nozzle_temp: f64,
    #[serde(default)]
    pub bed_temp: f64,

    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub order_id: Option<i64>,
    #[serde(default)]
    pub job_id: Option<String>,

    #[serde(default)]
    pub manually_set: bool,
    #[serde(default)]
    pub manual_timeout: Option<DateTime<Utc>>,

    #[serde(default)]
    pub ejection_processed: bool,
    #[serde(default)]
    pub ejection_in_progress: bool,
    #[serde(default)]
    pub ejection_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_ejection_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub cooldown_target_temp: Option<i32>,
    #[serde(default)]
    pub cooldown_order_id: Option<i64>,

    #[serde(default)]
    pub pending_ejection: Option<PendingEjection>,

    #[serde(default)]
    pub count_incremented_for_current_job: bool,
    #[serde(default)]
    pub from_queue: bool,
    #[serde(default)]
    pub print_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// HMS alert codes currently reported by a Vendor-B printer.
    #[serde(default)]
    pub hms_alerts: Vec<String>,
    /// `ejection_complete` acked via `M400` on a Vendor-B printer (§4.4).
    #[serde(default)]
    pub ejection_complete_flag: bool,
}

impl Printer {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, printer_type: PrinterType) -> Self {
        Printer {
            name: name.into(),
            ip: ip.into(),
            group: "Default".to_string(),
            printer_type,
            api_key: None,
            serial_number: None,
            device_id: None,
            access_code: None,
            service_mode: false,
            state: PrinterState::Offline,
            status: "Offline".to_string(),
            progress: 0,
            time_remaining: 0,
            z_height: 0.0,
            nozzle_temp: 0.0,
            bed_temp: 0.0,
            file: None,
            order_id: None,
            job_id: None,
            manually_set: false,
            manual_timeout: None,
            ejection_processed: false,
            ejection_in_progress: false,
            ejection_start_time: None,
            finish_time: None,
            last_ejection_time: None,
            cooldown_target_temp: None,
            cooldown_order_id: None,
            pending_ejection: None,
            count_incremented_for_current_job: false,
            from_queue: false,
            print_started_at: None,
            error_message: None,
            hms_alerts: Vec::new(),
            ejection_complete_flag: false,
        }
    }

    /// Resets connection-dependent runtime fields after a process restart.
    /// Credentials, identity and `service_mode` survive; anything describing a
    /// live connection does not, since no driver has observed this printer yet.
    pub fn reset_runtime(&mut self) {
        self.state = PrinterState::Offline;
        self.status = "Offline".to_string();
        self.progress = 0;
        self.time_remaining = 0;
        self.manually_set = false;
        self.manual_timeout = None;
        self.ejection_in_progress = false;
        self.hms_alerts.clear();
        self.ejection_complete_flag = false;
        // order_id, file, finish_time, ejection_processed, cooldown fields are
        // left intact: a restart mid-job should not forget which order a
        // printer was working or that a FINISHED cycle was already handled.
    }

    pub fn is_distributable(&self) -> bool {
        !self.service_mode && matches!(self.state, PrinterState::Ready | PrinterState::Idle)
    }

    pub fn print_stage(&self) -> PrintStage {
        PrintStage::from(self.state)
    }

    /// Human detail string for broadcast enrichment (§4.8).
    pub fn stage_detail(&self, now: DateTime<Utc>) -> String {
        match self.print_stage() {
            PrintStage::Printing => format!("{}% complete", self.progress),
            PrintStage::Finished => match self.minutes_since_finished(now) {
                Some(mins) if mins >= 0 => format!("Finished {mins}m ago"),
                _ => "Print complete".to_string(),
            },
            PrintStage::Cooling => format!(
                "Cooling bed to {}°C",
                self.cooldown_target_temp.unwrap_or_default()
            ),
            PrintStage::Ejecting => "Ejecting print".to_string(),
            PrintStage::Error => self
                .error_message
                .clone()
                .unwrap_or_else(|| "Printer error".to_string()),
            _ => self.status.clone(),
        }
    }

    pub fn minutes_since_finished(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.state != PrinterState::Finished {
            return None;
        }
        self.finish_time.map(|ft| (now - ft).num_minutes())
    }

    /// Checks the invariants listed in spec §3/§8. Returns the first violated
    /// invariant's description, if any; used by tests and by the reconciler's
    /// failsafe repair pass.
    pub fn check_invariants(&self) -> Option<&'static str> {
        if self.state == PrinterState::Ejecting && !self.ejection_in_progress {
            return Some("EJECTING without ejection_in_progress");
        }
        if self.state == PrinterState::Cooling
            && (self.cooldown_target_temp.is_none()
                || self.cooldown_order_id.is_none()
                || self.printer_type != PrinterType::B)
        {
            return Some("COOLING missing cooldown target/order or wrong vendor type");
        }
        if self.state == PrinterState::Finished && self.finish_time.is_none() {
            return Some("FINISHED without finish_time");
        }
        if self.manually_set
            && !matches!(
                self.state,
                PrinterState::Ready | PrinterState::Printing | PrinterState::Ejecting
            )
        {
            return Some("manually_set set outside {READY, PRINTING, EJECTING}");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_printer_defaults_offline() {
        let p = Printer::new("P1", "10.0.0.5", PrinterType::A);
        assert_eq!(p.state, PrinterState::Offline);
        assert!(!p.is_distributable());
    }

    #[test]
    fn ready_and_idle_are_distributable() {
        let mut p = Printer::new("P1", "10.0.0.5", PrinterType::A);
        p.state = PrinterState::Ready;
        assert!(p.is_distributable());
        p.state = PrinterState::Idle;
        assert!(p.is_distributable());
        p.service_mode = true;
        assert!(!p.is_distributable());
    }

    #[test]
    fn print_stage_folds_offline_and_prepare() {
        let mut p = Printer::new("P1", "10.0.0.5", PrinterType::B);
        p.state = PrinterState::Offline;
        assert_eq!(p.print_stage(), PrintStage::Idle);
        p.state = PrinterState::Prepare;
        assert_eq!(p.print_stage(), PrintStage::Printing);
    }

    #[test]
    fn invariant_finished_requires_finish_time() {
        let mut p = Printer::new("P1", "10.0.0.5", PrinterType::A);
        p.state = PrinterState::Finished;
        assert!(p.check_invariants().is_some());
        p.finish_time = Some(Utc::now());
        assert!(p.check_invariants().is_none());
    }

    #[test]
    fn invariant_cooling_requires_vendor_b_and_target() {
        let mut p = Printer::new("P1", "10.0.0.5", PrinterType::A);
        p.state = PrinterState::Cooling;
        p.cooldown_target_temp = Some(40);
        p.cooldown_order_id = Some(1);
        assert!(p.check_invariants().is_some(), "vendor A cannot cool");
        p.printer_type = PrinterType::B;
        assert!(p.check_invariants().is_none());
    }

    #[test]
    fn stage_detail_reports_progress_while_printing() {
        let mut p = Printer::new("P1", "10.0.0.5", PrinterType::A);
        p.state = PrinterState::Printing;
        p.progress = 42;
        assert_eq!(p.stage_detail(Utc::now()), "42% complete");
    }
}
