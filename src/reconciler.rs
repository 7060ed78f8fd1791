//! Status reconciler (§4.5): the periodic loop that merges vendor
//! observations into fleet state without letting stale or racy data undo
//! locally-owned decisions (FINISHED, EJECTING, COOLING, READY-manually-held).
//!
//! `merge_observation` is the single pure function §9 calls for: it maps
//! `(current, observation) -> next` with no I/O and no side effects, which is
//! what makes the merge table in §4.5.1 exhaustively unit-testable.

use crate::codec::CredentialCodec;
use crate::config::RECONCILE_BATCH_SIZE;
use crate::drivers::vendor_a::VendorADriver;
use crate::drivers::vendor_b::VendorBManager;
use crate::drivers::{ApiState, Observation};
use crate::ejection::EjectionManager;
use crate::model::{Printer, PrinterState, PrinterType};
use crate::store::FleetStore;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin scheduling cursor. Scheduling state, not fleet state, so it
/// lives with the reconciler rather than in [`FleetStore`].
pub struct Reconciler {
    cursor: AtomicUsize,
}

impl Reconciler {
    pub fn new() -> Self {
        Reconciler {
            cursor: AtomicUsize::new(0),
        }
    }

    /// Selects up to `batch_size` non-service-mode printer names, advancing
    /// the round-robin cursor across calls.
    pub fn next_batch<'a>(&self, printers: &'a [Printer], batch_size: usize) -> Vec<&'a Printer> {
        let eligible: Vec<&Printer> = printers.iter().filter(|p| !p.service_mode).collect();
        if eligible.is_empty() {
            return Vec::new();
        }
        let start = self.cursor.load(Ordering::SeqCst) % eligible.len();
        let take = batch_size.min(eligible.len());
        let batch: Vec<&Printer> = (0..take).map(|i| eligible[(start + i) % eligible.len()]).collect();
        self.cursor.store((start + take) % eligible.len(), Ordering::SeqCst);
        batch
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

/// Pure merge of one printer's current state with one tick's observation
/// (§4.5.1). Returns the updated printer and whether the FINISHED handler
/// (§4.6) must run for it afterward — that handler needs order lookups and
/// lock acquisition the reconciler performs outside this function.
pub fn merge_observation(printer: &Printer, obs: &Observation, now: DateTime<Utc>) -> (Printer, bool) {
    let mut p = printer.clone();

    // Rule: COOLING preserved; only temps updated, cooling pass decides (§4.6.1).
    if p.state == PrinterState::Cooling {
        apply_temps(&mut p, obs);
        return (p, false);
    }

    // Rules: manually_set holds READY against stale observations. Vendor A
    // only ever reports PRINTING as a reason to break the hold; the Vendor-B
    // override rule (§4.5.1) widens that to PRINTING/PREPARE/PAUSED since a
    // printer staging or re-pausing a job is not a stale read.
    let breaks_hold = match p.printer_type {
        PrinterType::A => obs.api_state == Some(ApiState::Printing),
        PrinterType::B => matches!(
            obs.api_state,
            Some(ApiState::Printing) | Some(ApiState::Prepare) | Some(ApiState::Paused)
        ),
    };
    let manual_hold = p.manually_set && !breaks_hold;
    if manual_hold {
        if obs.api_state == Some(ApiState::Finished) {
            return (apply_finished_preconditions(p, obs, now), true);
        }
        p.state = PrinterState::Ready;
        apply_temps(&mut p, obs);
        return (p, false);
    }

    // Rule: stale API FINISHED ignored once this FINISHED cycle was handled.
    if p.ejection_processed && p.state == PrinterState::Ready {
        apply_temps(&mut p, obs);
        return (p, false);
    }

    // Rule: EJECTING holds until the completion detector fires (§4.6.3).
    if p.ejection_in_progress
        && p.state == PrinterState::Ejecting
        && matches!(
            obs.api_state,
            Some(ApiState::Idle) | Some(ApiState::Operational) | Some(ApiState::Finished)
        )
    {
        return (p, false);
    }

    // Rule: Vendor-A ejection runs as an ordinary print job; don't let the
    // printer fall out of EJECTING while that job is active.
    if p.state == PrinterState::Ejecting
        && p.file.as_deref().map(|f| f.contains("ejection_")).unwrap_or(false)
        && obs.api_state == Some(ApiState::Printing)
    {
        return (p, false);
    }

    // Rule: any FINISHED observation runs the finished handler.
    if obs.api_state == Some(ApiState::Finished) {
        return (apply_finished_preconditions(p, obs, now), true);
    }

    // Rule: user physically reset the printer (API IDLE/OPERATIONAL after
    // stored FINISHED). Vendor-B is sticky here (§4.5.1 "FINISHED sticky
    // rule") — only Vendor A treats this as a ready-for-more-work signal.
    if matches!(obs.api_state, Some(ApiState::Idle) | Some(ApiState::Operational))
        && p.state == PrinterState::Finished
    {
        apply_temps(&mut p, obs);
        if p.printer_type == PrinterType::A {
            p.state = PrinterState::Ready;
            p.manually_set = true;
            p.order_id = None;
            p.finish_time = None;
            p.ejection_processed = false;
            p.ejection_in_progress = false;
            p.file = None;
        }
        return (p, false);
    }

    // Rule: active print propagates progress/file/time; clears stale flags.
    if matches!(obs.api_state, Some(ApiState::Printing) | Some(ApiState::Paused)) {
        p.state = if obs.api_state == Some(ApiState::Printing) {
            PrinterState::Printing
        } else {
            PrinterState::Paused
        };
        if let Some(pr) = obs.progress {
            p.progress = pr;
        }
        if let Some(tr) = obs.time_remaining {
            p.time_remaining = tr;
        }
        if let Some(f) = &obs.current_file {
            p.file = Some(f.clone());
        }
        apply_temps(&mut p, obs);
        p.finish_time = None;
        p.ejection_processed = false;
        if p.state == PrinterState::Printing && p.print_started_at.is_none() {
            p.print_started_at = Some(now);
        }
        // §4.5.1: the override only names PRINTING/EJECTING/PREPARE as
        // clearing manually_set — a PAUSED observation breaks the READY hold
        // but leaves the flag alone.
        if p.printer_type == PrinterType::B && p.state == PrinterState::Printing {
            p.manually_set = false;
        }
        return (p, false);
    }

    // Vendor-B PREPARE: printer is staging a print but not yet RUNNING.
    if obs.api_state == Some(ApiState::Prepare) {
        p.state = PrinterState::Prepare;
        apply_temps(&mut p, obs);
        if p.printer_type == PrinterType::B {
            p.manually_set = false;
        }
        return (p, false);
    }

    // Rule: otherwise IDLE/OPERATIONAL -> READY, manual flag cleared.
    if matches!(obs.api_state, Some(ApiState::Idle) | Some(ApiState::Operational)) {
        p.state = PrinterState::Ready;
        p.manually_set = false;
        apply_temps(&mut p, obs);
        return (p, false);
    }

    // Rule: driver-reported error (HMS alerts surface as Error, §4.4).
    if obs.api_state == Some(ApiState::Error) {
        p.state = PrinterState::Error;
        p.error_message = obs.error_message.clone();
        apply_temps(&mut p, obs);
        return (p, false);
    }

    // Rule: driver returned nothing this tick -> OFFLINE, zeroed runtime fields.
    if obs.api_state.is_none() {
        p.state = PrinterState::Offline;
        p.status = "Offline".to_string();
        p.progress = 0;
        p.time_remaining = 0;
        p.bed_temp = 0.0;
        p.nozzle_temp = 0.0;
        p.z_height = 0.0;
        return (p, false);
    }

    (p, false)
}

fn apply_temps(p: &mut Printer, obs: &Observation) {
    if let Some(t) = obs.bed_temp {
        p.bed_temp = t;
    }
    if let Some(t) = obs.nozzle_temp {
        p.nozzle_temp = t;
    }
    if let Some(z) = obs.z_height {
        p.z_height = z;
    }
}

fn apply_finished_preconditions(mut p: Printer, obs: &Observation, now: DateTime<Utc>) -> Printer {
    if p.finish_time.is_none() {
        p.finish_time = Some(now);
    }
    p.progress = 100;
    p.time_remaining = 0;
    p.state = PrinterState::Finished;
    apply_temps(&mut p, obs);
    p
}

/// Failsafe repair pass run at the end of every reconcile tick (§4.5.1,§9):
/// `manually_set == true` outside `{READY, PRINTING, EJECTING}` is an
/// unintended flag flip and is forced back to READY.
pub fn repair_failsafe(p: &mut Printer) {
    if p.manually_set
        && !matches!(
            p.state,
            PrinterState::Ready | PrinterState::Printing | PrinterState::Ejecting
        )
    {
        log::warn!(
            "repairing invariant violation on {}: manually_set with state {:?}",
            p.name,
            p.state
        );
        p.state = PrinterState::Ready;
    }
}

/// Builds an [`Observation`] from a Vendor-B session's cached snapshot,
/// applying the §4.4 state mapping (including the benign-FAILED-code
/// exception) and the HMS-forces-ERROR rule.
pub fn observation_from_vendor_b(cached: &crate::drivers::vendor_b::VendorBCachedState) -> Observation {
    if !cached.connected {
        return Observation::default();
    }
    let mut api_state = cached
        .gcode_state
        .as_deref()
        .map(|raw| map_vendor_b_state(raw, cached.print_error));
    let mut error_message = None;
    if !cached.hms_alerts.is_empty() {
        api_state = Some(ApiState::Error);
        error_message = Some(format!("HMS alerts: {}", cached.hms_alerts.join(", ")));
    }
    Observation {
        api_state,
        bed_temp: cached.bed_temp,
        nozzle_temp: cached.nozzle_temp,
        z_height: None,
        progress: cached.progress,
        time_remaining: cached.time_remaining_s,
        current_file: cached.current_file.clone(),
        job_id: None,
        hms_alerts: cached.hms_alerts.clone(),
        ejection_complete: cached.ejection_complete,
        error_message,
    }
}

/// The `print_error` code Bambu firmware reports for "no print job active or
/// print job ended" — a FAILED report carrying only this code is not a real
/// error (§4.4 state-mapping table).
const BENIGN_NO_JOB_ERROR_CODE: u64 = 0x0300_0000;

fn map_vendor_b_state(raw: &str, print_error: u64) -> ApiState {
    match raw.to_ascii_uppercase().as_str() {
        "IDLE" => ApiState::Idle,
        "PREPARE" => ApiState::Prepare,
        "RUNNING" => ApiState::Printing,
        "PAUSE" => ApiState::Paused,
        "FINISH" => ApiState::Finished,
        "FAILED" if print_error == BENIGN_NO_JOB_ERROR_CODE => ApiState::Idle,
        "FAILED" => ApiState::Error,
        _ => ApiState::Idle,
    }
}

/// Runs one reconcile tick end to end: sample a batch, merge observations,
/// apply them atomically, repair invariants, persist, dispatch any resulting
/// FINISHED handling, and broadcast.
#[allow(clippy::too_many_arguments)]
pub async fn run_tick(
    store: &FleetStore,
    scheduler: &Reconciler,
    vendor_a: &VendorADriver,
    vendor_b: &VendorBManager,
    codec: &CredentialCodec,
    ejection: &EjectionManager,
    broadcaster: &dyn crate::broadcaster::Broadcaster,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let printers = store.read_printers().await?;
    let batch = scheduler.next_batch(&printers, RECONCILE_BATCH_SIZE);
    if batch.is_empty() {
        return Ok(());
    }

    let mut observations: Vec<(String, Observation)> = Vec::with_capacity(batch.len());
    for printer in &batch {
        let obs = match printer.printer_type {
            PrinterType::A => {
                let Some(key_enc) = &printer.api_key else {
                    observations.push((printer.name.clone(), Observation::default()));
                    continue;
                };
                match codec.decrypt(key_enc) {
                    Some(key) => vendor_a.observe(printer, &key).await,
                    None => Observation::default(),
                }
            }
            PrinterType::B => match vendor_b.get(&printer.name).await {
                Some(session) => observation_from_vendor_b(&session.cached_state().await),
                None => Observation::default(),
            },
        };
        observations.push((printer.name.clone(), obs));
    }

    let mut finished_handler_needed: Vec<String> = Vec::new();
    let names: std::collections::HashSet<String> = observations.iter().map(|(n, _)| n.clone()).collect();

    store
        .write_printers(|printers| {
            for printer in printers.iter_mut() {
                if !names.contains(&printer.name) {
                    continue;
                }
                let obs = &observations.iter().find(|(n, _)| n == &printer.name).unwrap().1;
                let (mut updated, needs_finished) = merge_observation(printer, obs, now);
                repair_failsafe(&mut updated);
                if needs_finished {
                    finished_handler_needed.push(printer.name.clone());
                }
                *printer = updated;
            }
        })
        .await?;

    for name in finished_handler_needed {
        if let Err(e) = ejection.handle_finished_state_ejection(&name).await {
            log::warn!("finished handler failed for {name}: {e}");
        }
    }

    if let Err(e) = ejection.flush_pending_vendor_a_ejections().await {
        log::warn!("flushing pending Vendor-A ejections failed: {e}");
    }
    if let Err(e) = ejection.cooling_pass().await {
        log::warn!("cooling pass failed: {e}");
    }
    if let Err(e) = ejection.completion_pass().await {
        log::warn!("ejection completion pass failed: {e}");
    }

    broadcaster.broadcast(crate::broadcaster::build_status_update(store, now).await?);
    Ok(())
}
