//! Ejection manager (§4.6): the FINISHED handler's decision tree, the
//! COOLING pass, Vendor-B ejection sends, completion detection across both
//! vendors, and mass resume after a global pause is lifted.
//!
//! `ejection_lock_by_printer` collapses the spec's "map<name, mutex>" into a
//! `std::sync::Mutex` guarding the map structure (rare, synchronous changes)
//! around per-printer `tokio::sync::Mutex`es (frequent, async-held). Unlike
//! the spec's literal "held for the duration of an ejection attempt", the
//! lock here is only held across the synchronous decision-and-stage step;
//! the multi-tick EJECTING lifecycle that follows is tracked through the
//! persisted `ejection_in_progress` flag instead, which every entry point
//! checks before attempting to acquire the lock at all.

use crate::codec::CredentialCodec;
use crate::config::{EJECTION_COOLDOWN, EJECTION_SAFETY_TIMEOUT, MANUAL_TIMEOUT};
use crate::drivers::vendor_a::VendorADriver;
use crate::drivers::vendor_b::{VendorBCachedState, VendorBManager};
use crate::drivers::{ApiState, Observation};
use crate::error::PresetError;
use crate::model::{EjectionCode, Order, PendingEjection, Printer, PrinterState, PrinterType};
use crate::store::group::validate_gcode_file;
use crate::store::FleetStore;
use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

/// Fallback G-code when an order doesn't specify its own (§4.6 [ADD], from
/// `handle_finished_state_ejection` in the original implementation).
const DEFAULT_EJECTION_GCODE: &str = "G28 X Y\nM84";

pub struct EjectionManager {
    store: Arc<FleetStore>,
    vendor_a: Arc<VendorADriver>,
    vendor_b: Arc<VendorBManager>,
    codec: Arc<CredentialCodec>,
    ejection_lock_by_printer: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Shared with the distributor's trigger loop; notified whenever an
    /// ejection completes or a mass resume is kicked off (§4.6.3, §4.6.4).
    distribute: Arc<Notify>,
}

impl EjectionManager {
    pub fn new(
        store: Arc<FleetStore>,
        vendor_a: Arc<VendorADriver>,
        vendor_b: Arc<VendorBManager>,
        codec: Arc<CredentialCodec>,
        distribute: Arc<Notify>,
    ) -> Self {
        EjectionManager {
            store,
            vendor_a,
            vendor_b,
            codec,
            ejection_lock_by_printer: std::sync::Mutex::new(HashMap::new()),
            distribute,
        }
    }

    async fn try_acquire(&self, printer_name: &str) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        let mutex = {
            let mut map = self.ejection_lock_by_printer.lock().unwrap();
            map.entry(printer_name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        mutex.try_lock_owned().ok()
    }

    /// The FINISHED handler (§4.6). Preconditions (`finish_time`, `progress`,
    /// `time_remaining`) are already applied by the reconciler's merge step
    /// before this runs.
    pub async fn handle_finished_state_ejection(&self, printer_name: &str) -> anyhow::Result<()> {
        let printers = self.store.read_printers().await?;
        let Some(printer) = printers.iter().find(|p| p.name == printer_name) else {
            return Ok(());
        };
        if printer.ejection_processed || printer.ejection_in_progress {
            return Ok(());
        }

        let Some(order_id) = printer.order_id else {
            return Ok(());
        };
        let orders = self.store.read_orders().await?;
        let Some(order) = orders.iter().find(|o| o.id == order_id).cloned() else {
            return Ok(());
        };
        if !order.ejection_enabled {
            return Ok(());
        }

        if self.store.ejection_paused() {
            let name = printer_name.to_string();
            self.store
                .write_printers(|printers| {
                    if let Some(p) = printers.iter_mut().find(|p| p.name == name) {
                        p.status = "Print Complete (Ejection Paused)".to_string();
                    }
                })
                .await?;
            return Ok(());
        }

        if printer.printer_type == PrinterType::B {
            if let Some(cooldown_temp) = order.cooldown_temp {
                let bed_temp = match self.vendor_b.get(printer_name).await {
                    Some(session) => session.cached_state().await.bed_temp,
                    None => None,
                };
                if let Some(bed_temp) = bed_temp {
                    if bed_temp > cooldown_temp as f64 {
                        let name = printer_name.to_string();
                        let status = format!("Cooling bed from {bed_temp:.0}\u{b0}C to {cooldown_temp}\u{b0}C");
                        self.store
                            .write_printers(|printers| {
                                if let Some(p) = printers.iter_mut().find(|p| p.name == name) {
                                    p.state = PrinterState::Cooling;
                                    p.cooldown_target_temp = Some(cooldown_temp);
                                    p.cooldown_order_id = Some(order.id);
                                    p.status = status;
                                }
                            })
                            .await?;
                        return Ok(());
                    }
                }
            }
        }

        self.begin_ejection(printer_name, &order).await
    }

    /// Step 5 of the decision tree: acquire the per-printer lock and stage
    /// the ejection for whichever vendor owns this printer.
    async fn begin_ejection(&self, printer_name: &str, order: &Order) -> anyhow::Result<()> {
        let Some(_guard) = self.try_acquire(printer_name).await else {
            return Ok(());
        };

        let printer_type = {
            let printers = self.store.read_printers().await?;
            printers.iter().find(|p| p.name == printer_name).map(|p| p.printer_type)
        };
        let Some(printer_type) = printer_type else {
            return Ok(());
        };

        let gcode = resolve_ejection_gcode(order);

        match printer_type {
            PrinterType::B => {
                self.send_vendor_b_ejection(printer_name, &gcode, false).await?;
            }
            PrinterType::A => {
                let now = Utc::now();
                let filename = format!("ejection_{}_{}.gcode", order.id, now.timestamp());
                let name = printer_name.to_string();
                self.store
                    .write_printers(|printers| {
                        if let Some(p) = printers.iter_mut().find(|p| p.name == name) {
                            p.state = PrinterState::Ejecting;
                            p.ejection_in_progress = true;
                            p.ejection_processed = true;
                            p.ejection_start_time = Some(now);
                            p.pending_ejection = Some(PendingEjection {
                                gcode_content: gcode.clone(),
                                gcode_file_name: filename.clone(),
                                timestamp: now,
                            });
                        }
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Vendor-B ejection send (§4.6.2). `force` bypasses the in-progress and
    /// cooldown guards, for operator-initiated tests (§4.10) and for the
    /// COOLING pass's self-triggered transition. Returns whether the G-code
    /// was actually sent.
    pub async fn send_vendor_b_ejection(&self, printer_name: &str, gcode: &str, force: bool) -> anyhow::Result<bool> {
        let printers = self.store.read_printers().await?;
        let Some(printer) = printers.iter().find(|p| p.name == printer_name) else {
            return Ok(false);
        };

        if !force {
            if printer.ejection_in_progress {
                return Ok(false);
            }
            if let Some(last) = printer.last_ejection_time {
                if Utc::now() - last < ChronoDuration::from_std(EJECTION_COOLDOWN).unwrap() {
                    return Ok(false);
                }
            }
        }

        let Some(session) = self.vendor_b.get(printer_name).await else {
            return Ok(false);
        };

        let now = Utc::now();
        let name = printer_name.to_string();
        self.store
            .write_printers(|printers| {
                if let Some(p) = printers.iter_mut().find(|p| p.name == name) {
                    p.state = PrinterState::Ejecting;
                    p.ejection_in_progress = true;
                    p.ejection_processed = true;
                    p.ejection_start_time = Some(now);
                }
            })
            .await?;

        session.ejection(gcode).await.context("failed to send ejection gcode")?;
        Ok(true)
    }

    /// Runs every reconcile tick (§4.6.1): printers in COOLING whose bed has
    /// reached the target transition to EJECTING; a send failure reverts
    /// them to READY rather than leaving them stuck.
    pub async fn cooling_pass(&self) -> anyhow::Result<()> {
        let printers = self.store.read_printers().await?;
        let cooling: Vec<Printer> = printers.into_iter().filter(|p| p.state == PrinterState::Cooling).collect();

        for printer in cooling {
            let (Some(target), Some(order_id)) = (printer.cooldown_target_temp, printer.cooldown_order_id) else {
                continue;
            };
            let bed_temp = match self.vendor_b.get(&printer.name).await {
                Some(session) => session.cached_state().await.bed_temp,
                None => None,
            };
            let Some(bed_temp) = bed_temp else { continue };
            if bed_temp > target as f64 {
                continue;
            }

            let orders = self.store.read_orders().await?;
            let order = orders.iter().find(|o| o.id == order_id).cloned();
            let eligible = order.as_ref().map(|o| o.ejection_enabled).unwrap_or(false);
            if !eligible {
                self.revert_cooldown_to_ready(&printer.name).await?;
                continue;
            }
            let order = order.unwrap();

            let name = printer.name.clone();
            self.store
                .write_printers(|printers| {
                    if let Some(p) = printers.iter_mut().find(|p| p.name == name) {
                        p.cooldown_target_temp = None;
                        p.cooldown_order_id = None;
                    }
                })
                .await?;

            let gcode = resolve_ejection_gcode(&order);
            let sent = self.send_vendor_b_ejection(&printer.name, &gcode, true).await?;
            if !sent {
                self.revert_cooldown_to_ready(&printer.name).await?;
            }
        }
        Ok(())
    }

    async fn revert_cooldown_to_ready(&self, printer_name: &str) -> anyhow::Result<()> {
        let name = printer_name.to_string();
        self.store
            .write_printers(|printers| {
                if let Some(p) = printers.iter_mut().find(|p| p.name == name) {
                    p.state = PrinterState::Ready;
                    p.manually_set = true;
                    p.ejection_in_progress = false;
                    p.ejection_processed = false;
                    p.cooldown_target_temp = None;
                    p.cooldown_order_id = None;
                }
            })
            .await?;
        Ok(())
    }

    /// Completion detection (§4.6.3), run every reconcile tick and again by
    /// the independent Vendor-A watchdog.
    pub async fn completion_pass(&self) -> anyhow::Result<()> {
        let printers = self.store.read_printers().await?;
        let ejecting: Vec<Printer> = printers.into_iter().filter(|p| p.state == PrinterState::Ejecting).collect();

        for printer in ejecting {
            if self.is_ejection_complete(&printer).await {
                self.complete_ejection(&printer.name).await?;
            }
        }
        Ok(())
    }

    async fn is_ejection_complete(&self, printer: &Printer) -> bool {
        match printer.printer_type {
            PrinterType::A => {
                let Some(key_enc) = &printer.api_key else { return false };
                let Some(api_key) = self.codec.decrypt(key_enc) else { return false };
                let obs = self.vendor_a.observe(printer, &api_key).await;
                vendor_a_ejection_complete(&obs, printer.file.as_deref())
            }
            PrinterType::B => {
                let cached = match self.vendor_b.get(&printer.name).await {
                    Some(session) => session.cached_state().await,
                    None => VendorBCachedState::default(),
                };
                vendor_b_ejection_complete(&cached, printer.ejection_start_time, Utc::now())
            }
        }
    }

    async fn complete_ejection(&self, printer_name: &str) -> anyhow::Result<()> {
        let now = Utc::now();
        let name = printer_name.to_string();
        self.store
            .write_printers(|printers| {
                if let Some(p) = printers.iter_mut().find(|p| p.name == name) {
                    p.state = PrinterState::Ready;
                    p.manually_set = true;
                    p.manual_timeout = Some(now + ChronoDuration::from_std(MANUAL_TIMEOUT).unwrap());
                    p.ejection_in_progress = false;
                    p.ejection_start_time = None;
                    p.pending_ejection = None;
                    p.last_ejection_time = Some(now);
                    p.order_id = None;
                    p.file = None;
                    p.finish_time = None;
                    p.ejection_processed = false;
                }
            })
            .await?;
        log::info!("ejection completed for {printer_name}");
        self.distribute.notify_one();
        Ok(())
    }

    /// Mass resume (§4.6.4): re-enters every FINISHED-but-paused printer
    /// through the FINISHED handler once the global pause is lifted.
    pub async fn trigger_mass_ejection_for_finished_printers(&self) -> anyhow::Result<()> {
        if self.store.ejection_paused() {
            return Ok(());
        }
        let printers = self.store.read_printers().await?;
        let candidates: Vec<String> = printers
            .iter()
            .filter(|p| {
                p.state == PrinterState::Finished
                    && p.status == "Print Complete (Ejection Paused)"
                    && !p.ejection_in_progress
            })
            .map(|p| p.name.clone())
            .collect();

        for name in candidates {
            if let Err(e) = self.handle_finished_state_ejection(&name).await {
                log::warn!("mass ejection resume failed for {name}: {e}");
            }
        }
        self.distribute.notify_one();
        Ok(())
    }

    /// Lists every ejection-code preset (§4.10 "list").
    pub async fn list_presets(&self) -> anyhow::Result<Vec<EjectionCode>> {
        Ok(self.store.read_ejection_codes().await?)
    }

    /// Looks up one preset by id (§4.10 "get").
    pub async fn get_preset(&self, id: &str) -> anyhow::Result<Option<EjectionCode>> {
        Ok(self.store.read_ejection_codes().await?.into_iter().find(|c| c.id == id))
    }

    /// Creates a preset with `gcode` text (§4.10 "create"). Names must be
    /// unique case-insensitively; G-code arriving as a Rust `&str` is already
    /// valid UTF-8 by construction, so no separate decode check is needed
    /// here (that check applies to the raw-bytes upload path, see
    /// [`Self::upload_preset_file`]).
    pub async fn create_preset(&self, name: &str, gcode: &str) -> anyhow::Result<EjectionCode> {
        let existing = self.store.read_ejection_codes().await?;
        if existing.iter().any(|c| c.name.eq_ignore_ascii_case(name)) {
            return Err(PresetError::DuplicateName(name.to_string()).into());
        }
        let preset = EjectionCode::new(generate_preset_id(), name, gcode, Utc::now());
        let result = preset.clone();
        self.store.write_ejection_codes(|codes| codes.push(preset)).await?;
        Ok(result)
    }

    /// Creates a preset from an uploaded file's raw bytes (§4.10: "file upload
    /// path accepts the same extensions as §4.1"). `filename` is only used to
    /// validate the extension; the preset itself is named by the caller.
    pub async fn upload_preset_file(&self, name: &str, filename: &str, bytes: &[u8]) -> anyhow::Result<EjectionCode> {
        if !validate_gcode_file(filename) {
            return Err(PresetError::UnsupportedExtension(filename.to_string()).into());
        }
        let gcode = std::str::from_utf8(bytes).map_err(|_| PresetError::InvalidEncoding)?;
        self.create_preset(name, gcode).await
    }

    /// Updates a preset's name and/or G-code, bumping `updated_at` (§4.10
    /// "update"). Renaming to a name already used by a *different* preset is
    /// rejected the same way creation is.
    pub async fn update_preset(&self, id: &str, name: Option<&str>, gcode: Option<&str>) -> anyhow::Result<EjectionCode> {
        if let Some(new_name) = name {
            let existing = self.store.read_ejection_codes().await?;
            if existing.iter().any(|c| c.id != id && c.name.eq_ignore_ascii_case(new_name)) {
                return Err(PresetError::DuplicateName(new_name.to_string()).into());
            }
        }
        let now = Utc::now();
        let id_owned = id.to_string();
        let updated = self
            .store
            .write_ejection_codes(|codes| {
                codes.iter_mut().find(|c| c.id == id_owned).map(|c| {
                    if let Some(n) = name {
                        c.name = n.to_string();
                    }
                    if let Some(g) = gcode {
                        c.gcode = g.to_string();
                    }
                    c.touch(now);
                    c.clone()
                })
            })
            .await?;
        updated.ok_or_else(|| PresetError::NotFound(id.to_string()).into())
    }

    /// Deletes a preset by id (§4.10 "delete").
    pub async fn delete_preset(&self, id: &str) -> anyhow::Result<()> {
        let id_owned = id.to_string();
        let removed = self
            .store
            .write_ejection_codes(|codes| {
                let before = codes.len();
                codes.retain(|c| c.id != id_owned);
                codes.len() != before
            })
            .await?;
        if !removed {
            return Err(PresetError::NotFound(id.to_string()).into());
        }
        Ok(())
    }

    /// Ejection-code "test" operation (§4.10): sends a preset's G-code to a
    /// specific printer for debugging, bypassing the normal FINISHED/cooldown
    /// gating this is not a real print-completion ejection. Dispatches via
    /// §4.4 (Vendor B, `force=true`) or a line-by-line POST (Vendor A) —
    /// the same transports the real ejection flow and distributor already
    /// use, per spec.md §4.10's "no separate code path" contract.
    pub async fn test_preset(&self, printer_name: &str, gcode: &str) -> anyhow::Result<bool> {
        let printers = self.store.read_printers().await?;
        let Some(printer) = printers.iter().find(|p| p.name == printer_name) else {
            return Ok(false);
        };

        match printer.printer_type {
            PrinterType::B => self.send_vendor_b_ejection(printer_name, gcode, true).await,
            PrinterType::A => {
                let Some(key_enc) = &printer.api_key else { return Ok(false) };
                let Some(api_key) = self.codec.decrypt(key_enc) else { return Ok(false) };
                Ok(self.vendor_a.send_gcode_lines(printer, &api_key, gcode).await)
            }
        }
    }

    /// Force-releases a printer's ejection lock and clears `ejection_in_progress`
    /// (spec.md §7 "hard failures surface to a reset endpoint", and the
    /// `--reset-lock` CLI escape hatch for an operator-observed stuck lock).
    /// Does not touch `state` — an operator who reaches for this is expected
    /// to also drive the printer back to READY manually if it's actually
    /// wedged, since a lock can be stuck without the printer itself being in
    /// EJECTING (e.g. a panicked task that held the lock across an await).
    pub async fn force_release_lock(&self, printer_name: &str) -> anyhow::Result<()> {
        {
            let mut map = self.ejection_lock_by_printer.lock().unwrap();
            map.remove(printer_name);
        }
        let name = printer_name.to_string();
        self.store
            .write_printers(|printers| {
                if let Some(p) = printers.iter_mut().find(|p| p.name == name) {
                    p.ejection_in_progress = false;
                }
            })
            .await?;
        log::warn!("force-released ejection lock for {printer_name}");
        Ok(())
    }

    /// Uploads any Vendor-A printer's staged ejection G-code as a print job
    /// (§4.6 step 5's "next reconcile tick picks it up"). Run after the
    /// merge step, before broadcasting.
    pub async fn flush_pending_vendor_a_ejections(&self) -> anyhow::Result<()> {
        let printers = self.store.read_printers().await?;
        let pending: Vec<Printer> = printers
            .into_iter()
            .filter(|p| p.printer_type == PrinterType::A && p.pending_ejection.is_some())
            .collect();

        for printer in pending {
            let Some(pe) = printer.pending_ejection.clone() else { continue };
            let Some(key_enc) = &printer.api_key else { continue };
            let Some(api_key) = self.codec.decrypt(key_enc) else { continue };

            let ok = self
                .vendor_a
                .send_ejection(&printer, &api_key, &pe.gcode_content, &pe.gcode_file_name)
                .await;

            let name = printer.name.clone();
            if ok {
                self.store
                    .write_printers(|printers| {
                        if let Some(p) = printers.iter_mut().find(|p| p.name == name) {
                            p.pending_ejection = None;
                            p.file = Some(pe.gcode_file_name.clone());
                        }
                    })
                    .await?;
            } else {
                log::warn!("failed to upload ejection gcode for {name}");
            }
        }
        Ok(())
    }
}

/// Opaque unique id for a new preset (§3 "id (opaque unique)"): 8 random
/// bytes, hex-encoded. No registry-wide crate is pulled in just for this —
/// `rand` is already part of the teacher's dependency tree via the codec.
fn generate_preset_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn resolve_ejection_gcode(order: &Order) -> String {
    if order.end_gcode.trim().is_empty() {
        DEFAULT_EJECTION_GCODE.to_string()
    } else {
        order.end_gcode.clone()
    }
}

fn vendor_a_ejection_complete(obs: &Observation, stored_file: Option<&str>) -> bool {
    match obs.api_state {
        // §4.6.3 Method 1 (API-based): IDLE/READY/OPERATIONAL/FINISHED on their
        // own are completion, independent of the file-name heuristic below.
        Some(ApiState::Finished) | Some(ApiState::Idle) | Some(ApiState::Operational) => true,
        Some(_) => {
            let stored_is_ejection = stored_file.map(|f| f.contains("ejection_")).unwrap_or(false);
            if !stored_is_ejection {
                return false;
            }
            match &obs.current_file {
                None => true,
                Some(current) => Some(current.as_str()) != stored_file,
            }
        }
        None => false,
    }
}

fn vendor_b_ejection_complete(cached: &VendorBCachedState, ejection_start_time: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    if cached.ejection_complete {
        return true;
    }
    if let Some(gs) = &cached.gcode_state {
        if matches!(gs.to_ascii_uppercase().as_str(), "IDLE" | "READY") {
            return true;
        }
    }
    if let Some(start) = ejection_start_time {
        if now - start > ChronoDuration::from_std(EJECTION_SAFETY_TIMEOUT).unwrap() {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PrinterType;

    fn manager() -> EjectionManager {
        let dir = tempfile::tempdir().unwrap();
        let path = Box::leak(Box::new(dir)).path().to_path_buf();
        let store = Arc::new(FleetStore::load(&path).unwrap());
        let codec = Arc::new(CredentialCodec::load_or_create(&path).unwrap());
        EjectionManager::new(
            store,
            Arc::new(VendorADriver::new()),
            Arc::new(VendorBManager::new()),
            codec,
            Arc::new(Notify::new()),
        )
    }

    fn finished_printer(order_id: i64) -> Printer {
        let mut p = Printer::new("P1", "10.0.0.1", PrinterType::A);
        p.state = PrinterState::Finished;
        p.finish_time = Some(Utc::now());
        p.order_id = Some(order_id);
        p
    }

    #[tokio::test]
    async fn idempotent_when_already_processed() {
        let mgr = manager();
        let mut p = finished_printer(1);
        p.ejection_processed = true;
        mgr.store.write_printers(|ps| ps.push(p)).await.unwrap();

        mgr.handle_finished_state_ejection("P1").await.unwrap();
        let printers = mgr.store.read_printers().await.unwrap();
        assert_eq!(printers[0].state, PrinterState::Finished);
        assert!(!printers[0].ejection_in_progress);
    }

    #[tokio::test]
    async fn stays_finished_when_order_not_found() {
        let mgr = manager();
        mgr.store.write_printers(|ps| ps.push(finished_printer(99))).await.unwrap();

        mgr.handle_finished_state_ejection("P1").await.unwrap();
        let printers = mgr.store.read_printers().await.unwrap();
        assert_eq!(printers[0].state, PrinterState::Finished);
    }

    #[tokio::test]
    async fn stays_finished_when_ejection_disabled() {
        let mgr = manager();
        let mut order = Order::new(1, "a.gcode", "/tmp/a.gcode", 1);
        order.ejection_enabled = false;
        mgr.store.write_orders(|os| os.push(order)).await.unwrap();
        mgr.store.write_printers(|ps| ps.push(finished_printer(1))).await.unwrap();

        mgr.handle_finished_state_ejection("P1").await.unwrap();
        let printers = mgr.store.read_printers().await.unwrap();
        assert_eq!(printers[0].state, PrinterState::Finished);
        assert!(!printers[0].ejection_processed);
    }

    #[tokio::test]
    async fn global_pause_sets_status_and_stays_finished() {
        let mgr = manager();
        let mut order = Order::new(1, "a.gcode", "/tmp/a.gcode", 1);
        order.ejection_enabled = true;
        mgr.store.write_orders(|os| os.push(order)).await.unwrap();
        mgr.store.write_printers(|ps| ps.push(finished_printer(1))).await.unwrap();
        mgr.store.set_ejection_paused(true);

        mgr.handle_finished_state_ejection("P1").await.unwrap();
        let printers = mgr.store.read_printers().await.unwrap();
        assert_eq!(printers[0].state, PrinterState::Finished);
        assert_eq!(printers[0].status, "Print Complete (Ejection Paused)");
    }

    #[tokio::test]
    async fn vendor_a_stages_pending_ejection_with_default_gcode() {
        let mgr = manager();
        let mut order = Order::new(1, "a.gcode", "/tmp/a.gcode", 1);
        order.ejection_enabled = true;
        order.end_gcode = String::new();
        mgr.store.write_orders(|os| os.push(order)).await.unwrap();
        mgr.store.write_printers(|ps| ps.push(finished_printer(1))).await.unwrap();

        mgr.handle_finished_state_ejection("P1").await.unwrap();
        let printers = mgr.store.read_printers().await.unwrap();
        assert_eq!(printers[0].state, PrinterState::Ejecting);
        assert!(printers[0].ejection_in_progress);
        assert!(printers[0].ejection_processed);
        let pending = printers[0].pending_ejection.as_ref().unwrap();
        assert_eq!(pending.gcode_content, DEFAULT_EJECTION_GCODE);
        assert!(pending.gcode_file_name.contains("ejection_"));
    }

    #[tokio::test]
    async fn mass_resume_skips_while_paused_and_runs_once_lifted() {
        let mgr = manager();
        let mut order = Order::new(1, "a.gcode", "/tmp/a.gcode", 1);
        order.ejection_enabled = true;
        mgr.store.write_orders(|os| os.push(order)).await.unwrap();
        let mut p = finished_printer(1);
        p.status = "Print Complete (Ejection Paused)".to_string();
        mgr.store.write_printers(|ps| ps.push(p)).await.unwrap();
        mgr.store.set_ejection_paused(true);

        mgr.trigger_mass_ejection_for_finished_printers().await.unwrap();
        let printers = mgr.store.read_printers().await.unwrap();
        assert_eq!(printers[0].state, PrinterState::Finished, "still paused, nothing should run");

        mgr.store.set_ejection_paused(false);
        mgr.trigger_mass_ejection_for_finished_printers().await.unwrap();
        let printers = mgr.store.read_printers().await.unwrap();
        assert_eq!(printers[0].state, PrinterState::Ejecting);
    }

    #[tokio::test]
    async fn completion_pass_leaves_vendor_b_printer_without_a_session_untouched() {
        let mgr = manager();
        let mut p = Printer::new("P2", "10.0.0.2", PrinterType::B);
        p.state = PrinterState::Ejecting;
        p.ejection_in_progress = true;
        p.ejection_start_time = Some(Utc::now());
        mgr.store.write_printers(|ps| ps.push(p)).await.unwrap();

        mgr.completion_pass().await.unwrap();
        let printers = mgr.store.read_printers().await.unwrap();
        assert_eq!(printers[0].state, PrinterState::Ejecting, "no session means no completion signal yet");
    }

    #[test]
    fn vendor_a_completion_detects_file_change_away_from_ejection_file() {
        let obs = Observation {
            api_state: Some(ApiState::Printing),
            current_file: Some("normal_job.gcode".to_string()),
            ..Default::default()
        };
        assert!(vendor_a_ejection_complete(&obs, Some("ejection_1_123.gcode")));
    }

    #[test]
    fn vendor_a_completion_false_for_unrelated_stored_file() {
        let obs = Observation {
            api_state: Some(ApiState::Printing),
            current_file: Some("something.gcode".to_string()),
            ..Default::default()
        };
        assert!(!vendor_a_ejection_complete(&obs, Some("normal_job.gcode")));
    }

    #[test]
    fn vendor_a_completion_true_on_finished() {
        let obs = Observation {
            api_state: Some(ApiState::Finished),
            ..Default::default()
        };
        assert!(vendor_a_ejection_complete(&obs, Some("ejection_1_123.gcode")));
    }

    #[test]
    fn vendor_a_completion_true_on_idle_even_with_unchanged_ejection_filename() {
        let obs = Observation {
            api_state: Some(ApiState::Idle),
            current_file: Some("ejection_1_123.gcode".to_string()),
            ..Default::default()
        };
        assert!(
            vendor_a_ejection_complete(&obs, Some("ejection_1_123.gcode")),
            "IDLE/OPERATIONAL is a standalone completion signal, independent of the file-name heuristic"
        );
    }

    #[test]
    fn vendor_a_completion_true_on_operational_with_no_stored_file() {
        let obs = Observation {
            api_state: Some(ApiState::Operational),
            current_file: None,
            ..Default::default()
        };
        assert!(vendor_a_ejection_complete(&obs, None));
    }

    #[test]
    fn vendor_b_completion_true_on_m400_ack() {
        let cached = VendorBCachedState {
            ejection_complete: true,
            ..Default::default()
        };
        assert!(vendor_b_ejection_complete(&cached, None, Utc::now()));
    }

    #[test]
    fn vendor_b_completion_true_on_safety_timeout() {
        let cached = VendorBCachedState::default();
        let start = Utc::now() - ChronoDuration::seconds(16);
        assert!(vendor_b_ejection_complete(&cached, Some(start), Utc::now()));
    }

    #[test]
    fn vendor_b_completion_false_before_timeout_with_no_signal() {
        let cached = VendorBCachedState::default();
        let start = Utc::now() - ChronoDuration::seconds(5);
        assert!(!vendor_b_ejection_complete(&cached, Some(start), Utc::now()));
    }

    #[tokio::test]
    async fn test_preset_returns_false_for_unknown_printer() {
        let mgr = manager();
        let sent = mgr.test_preset("Ghost", "G28").await.unwrap();
        assert!(!sent, "no printer by that name to test against");
    }

    #[tokio::test]
    async fn test_preset_vendor_a_without_api_key_is_a_no_op() {
        let mgr = manager();
        let p = Printer::new("P1", "10.0.0.1", PrinterType::A);
        mgr.store.write_printers(|ps| ps.push(p)).await.unwrap();
        let sent = mgr.test_preset("P1", "G28").await.unwrap();
        assert!(!sent, "no credential available, nothing could be sent");
    }

    #[tokio::test]
    async fn force_release_lock_clears_in_progress_flag() {
        let mgr = manager();
        let mut p = Printer::new("P1", "10.0.0.1", PrinterType::A);
        p.state = PrinterState::Ejecting;
        p.ejection_in_progress = true;
        mgr.store.write_printers(|ps| ps.push(p)).await.unwrap();

        mgr.force_release_lock("P1").await.unwrap();
        let printers = mgr.store.read_printers().await.unwrap();
        assert!(!printers[0].ejection_in_progress);

        // The lock itself must be acquirable again afterward.
        assert!(mgr.try_acquire("P1").await.is_some());
    }

    #[tokio::test]
    async fn create_preset_rejects_case_insensitive_duplicate_name() {
        let mgr = manager();
        mgr.create_preset("Standard Eject", "G28\nM84").await.unwrap();
        let err = mgr.create_preset("standard eject", "G1 Z10").await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn create_then_get_then_list_round_trip() {
        let mgr = manager();
        let created = mgr.create_preset("Standard Eject", "G28\nM84").await.unwrap();
        let fetched = mgr.get_preset(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.gcode, "G28\nM84");
        assert_eq!(mgr.list_presets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_preset_bumps_updated_at_and_changes_gcode() {
        let mgr = manager();
        let created = mgr.create_preset("Standard Eject", "G28\nM84").await.unwrap();
        let updated = mgr
            .update_preset(&created.id, None, Some("G28\nG1 Z20\nM84"))
            .await
            .unwrap();
        assert_eq!(updated.gcode, "G28\nG1 Z20\nM84");
        assert_eq!(updated.name, "Standard Eject");
        assert!(updated.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn update_preset_rejects_rename_to_another_presets_name() {
        let mgr = manager();
        mgr.create_preset("Standard Eject", "G28").await.unwrap();
        let second = mgr.create_preset("Aggressive Eject", "G1 Z30").await.unwrap();
        let err = mgr
            .update_preset(&second.id, Some("standard eject"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn update_preset_unknown_id_is_not_found() {
        let mgr = manager();
        let err = mgr.update_preset("missing", Some("X"), None).await.unwrap_err();
        assert!(err.to_string().contains("no preset"));
    }

    #[tokio::test]
    async fn delete_preset_removes_it() {
        let mgr = manager();
        let created = mgr.create_preset("Standard Eject", "G28\nM84").await.unwrap();
        mgr.delete_preset(&created.id).await.unwrap();
        assert!(mgr.get_preset(&created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_unknown_preset_is_not_found() {
        let mgr = manager();
        assert!(mgr.delete_preset("missing").await.is_err());
    }

    #[tokio::test]
    async fn upload_preset_file_rejects_unsupported_extension() {
        let mgr = manager();
        let err = mgr
            .upload_preset_file("Standard Eject", "routine.txt", b"G28\nM84")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("extension"));
    }

    #[tokio::test]
    async fn upload_preset_file_accepts_gcode_extension() {
        let mgr = manager();
        let preset = mgr
            .upload_preset_file("Standard Eject", "routine.gcode", b"G28\nM84")
            .await
            .unwrap();
        assert_eq!(preset.gcode, "G28\nM84");
    }
}
