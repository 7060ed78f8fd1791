//! Order distributor (§4.7): assigns pending order copies to ready printers.
//!
//! `select_jobs` is the pure matching function — no I/O, fully unit-testable
//! against the group-filter and numeric-sort rules — mirroring the
//! reconciler's `merge_observation` split between pure decision and impure
//! execution (§9).

use crate::codec::CredentialCodec;
use crate::config::{DISTRIBUTOR_BATCH_DELAY, MAX_CONCURRENT_JOBS, START_PRINT_VERIFY_DELAY};
use crate::drivers::vendor_a::VendorADriver;
use crate::drivers::vendor_b::{ftps, VendorBManager};
use crate::drivers::ApiState;
use crate::model::{Order, Printer, PrinterState, PrinterType};
use crate::store::FleetStore;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct Distributor {
    store: Arc<FleetStore>,
    vendor_a: Arc<VendorADriver>,
    vendor_b: Arc<VendorBManager>,
    codec: Arc<CredentialCodec>,
    /// Permits = 1: at most one pass runs; a pass triggered while one is
    /// already in flight no-ops rather than queueing (§4.7).
    semaphore: Semaphore,
}

impl Distributor {
    pub fn new(
        store: Arc<FleetStore>,
        vendor_a: Arc<VendorADriver>,
        vendor_b: Arc<VendorBManager>,
        codec: Arc<CredentialCodec>,
    ) -> Self {
        Distributor {
            store,
            vendor_a,
            vendor_b,
            codec,
            semaphore: Semaphore::new(1),
        }
    }

    /// Runs one distribution pass end to end (§4.7 steps 1-8).
    pub async fn run_pass(&self, broadcaster: &dyn crate::broadcaster::Broadcaster) -> anyhow::Result<()> {
        let Ok(_permit) = self.semaphore.try_acquire() else {
            return Ok(());
        };

        let orders = self.store.read_orders().await?;
        let printers = self.store.read_printers().await?;
        let jobs = select_jobs(&orders, &printers);
        if jobs.is_empty() {
            return Ok(());
        }

        let printers_by_name: HashMap<String, Printer> =
            printers.into_iter().map(|p| (p.name.clone(), p)).collect();
        let orders_by_id: HashMap<i64, Order> = orders.into_iter().map(|o| (o.id, o)).collect();

        // printer_name -> (order_id, filename), applied in a single write at the end (step 7).
        let mut printer_updates: HashMap<String, (i64, String)> = HashMap::new();

        let chunks: Vec<&[(String, i64)]> = jobs.chunks(MAX_CONCURRENT_JOBS).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let results = futures::future::join_all(chunk.iter().map(|(printer_name, order_id)| async move {
                let printer = printers_by_name.get(printer_name)?;
                let order = orders_by_id.get(order_id)?;
                let started = self.check_and_start_print(printer, order).await;
                started.then(|| (printer_name.clone(), *order_id))
            }))
            .await;

            for (printer_name, order_id) in results.into_iter().flatten() {
                let order = &orders_by_id[&order_id];
                self.store.add_filament_g(order.filament_g).await?;
                self.store
                    .write_orders(|orders| {
                        if let Some(o) = orders.iter_mut().find(|o| o.id == order_id) {
                            o.record_sent(Utc::now());
                        }
                    })
                    .await?;
                printer_updates.insert(printer_name, (order_id, order.filename.clone()));
            }

            if i + 1 < chunks.len() {
                tokio::time::sleep(DISTRIBUTOR_BATCH_DELAY).await;
            }
        }

        if !printer_updates.is_empty() {
            self.store
                .write_printers(|printers| {
                    for printer in printers.iter_mut() {
                        if let Some((order_id, filename)) = printer_updates.get(&printer.name) {
                            printer.order_id = Some(*order_id);
                            printer.file = Some(filename.clone());
                            printer.from_queue = true;
                            printer.count_incremented_for_current_job = true;
                            printer.state = PrinterState::Printing;
                        }
                    }
                })
                .await?;
        }

        broadcaster.broadcast(crate::broadcaster::build_status_update(&self.store, Utc::now()).await?);
        Ok(())
    }

    /// Start-print contract (§4.7.1). The *count is already incremented at
    /// job start* by the caller — this only decides whether the attempt
    /// looked like it worked.
    async fn check_and_start_print(&self, printer: &Printer, order: &Order) -> bool {
        match printer.printer_type {
            PrinterType::A => {
                let Some(key_enc) = &printer.api_key else { return false };
                let Some(api_key) = self.codec.decrypt(key_enc) else { return false };
                let Ok(bytes) = tokio::fs::read(&order.filepath).await else {
                    log::warn!("could not read {} for {}", order.filepath, printer.name);
                    return false;
                };
                let ok = self
                    .vendor_a
                    .upload_and_start(printer, &api_key, &order.filename, bytes)
                    .await;
                if ok {
                    self.schedule_start_verification(printer.name.clone(), api_key);
                }
                ok
            }
            PrinterType::B => {
                let Some(access_code_enc) = &printer.access_code else { return false };
                let Some(access_code) = self.codec.decrypt(access_code_enc) else { return false };
                let Ok(bytes) = tokio::fs::read(&order.filepath).await else {
                    log::warn!("could not read {} for {}", order.filepath, printer.name);
                    return false;
                };
                let remote_name = ftps::normalize_filename(&order.filename);
                if let Err(e) = ftps::upload(&printer.ip, &access_code, &remote_name, &bytes).await {
                    log::warn!("ftps upload failed for {}: {e}", printer.name);
                    return false;
                }
                let Some(session) = self.vendor_b.get(&printer.name).await else {
                    return false;
                };
                match session.project_file(&remote_name).await {
                    Ok(()) => true,
                    Err(e) => {
                        log::warn!("project_file command failed for {}: {e}", printer.name);
                        false
                    }
                }
            }
        }
    }

    /// Best-effort post-start verification for Vendor A (§4.7.1): waits,
    /// polls, and just logs on mismatch — the order was already counted as
    /// sent, so nothing here changes fleet state on failure.
    fn schedule_start_verification(&self, printer_name: String, api_key: String) {
        let vendor_a = Arc::clone(&self.vendor_a);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            tokio::time::sleep(START_PRINT_VERIFY_DELAY).await;
            let printers = match store.read_printers().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let Some(printer) = printers.iter().find(|p| p.name == printer_name) else {
                return;
            };
            let obs = vendor_a.observe(printer, &api_key).await;
            match obs.api_state {
                Some(ApiState::Printing) | Some(ApiState::Paused) => {
                    log::debug!("start verified for {printer_name}");
                }
                _ => {
                    log::warn!("could not verify print start for {printer_name} after the grace period");
                }
            }
        });
    }
}

/// Pure job matcher (§4.7 steps 1-4): which (printer, order) pairs to start
/// this pass, in assignment order.
pub fn select_jobs(orders: &[Order], printers: &[Printer]) -> Vec<(String, i64)> {
    let ready: Vec<&Printer> = printers.iter().filter(|p| p.is_distributable()).collect();
    let mut assigned: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut jobs = Vec::new();

    for order in orders.iter().filter(|o| o.is_active()) {
        let mut eligible: Vec<&Printer> = ready
            .iter()
            .copied()
            .filter(|p| !assigned.contains(&p.name) && order.groups.contains(&p.group))
            .collect();
        eligible.sort_by_key(|p| numeric_key(&p.name));

        let needed = (order.quantity - order.sent).min(eligible.len() as u32);
        for printer in eligible.into_iter().take(needed as usize) {
            assigned.insert(printer.name.clone());
            jobs.push((printer.name.clone(), order.id));
        }
    }
    jobs
}

/// Splits a printer name into its non-numeric prefix and leading numeric
/// substring, so `"Printer 10"` sorts after `"Printer 2"` (§4.7 step 3).
fn numeric_key(name: &str) -> (String, u64) {
    match name.find(|c: char| c.is_ascii_digit()) {
        Some(start) => {
            let prefix = name[..start].to_string();
            let digits: String = name[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
            (prefix, digits.parse().unwrap_or(0))
        }
        None => (name.to_string(), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PrinterType;

    fn printer(name: &str, group: &str, state: PrinterState) -> Printer {
        let mut p = Printer::new(name, "10.0.0.1", PrinterType::A);
        p.group = group.to_string();
        p.state = state;
        p
    }

    fn order(id: i64, quantity: u32, sent: u32, groups: &[&str]) -> Order {
        let mut o = Order::new(id, "part.gcode", "/tmp/part.gcode", quantity);
        o.sent = sent;
        o.groups = groups.iter().map(|s| s.to_string()).collect();
        o
    }

    #[test]
    fn single_eligible_printer_gets_the_job() {
        let printers = vec![printer("P1", "Default", PrinterState::Ready)];
        let orders = vec![order(1, 1, 0, &["Default"])];
        let jobs = select_jobs(&orders, &printers);
        assert_eq!(jobs, vec![("P1".to_string(), 1)]);
    }

    #[test]
    fn group_filter_excludes_non_matching_printers() {
        let printers = vec![
            printer("P1", "A", PrinterState::Ready),
            printer("P2", "B", PrinterState::Ready),
        ];
        let orders = vec![order(1, 2, 0, &["A"])];
        let jobs = select_jobs(&orders, &printers);
        assert_eq!(jobs, vec![("P1".to_string(), 1)]);
    }

    #[test]
    fn empty_groups_matches_no_printer() {
        let printers = vec![printer("P1", "Default", PrinterState::Ready)];
        let orders = vec![order(1, 1, 0, &[])];
        assert!(select_jobs(&orders, &printers).is_empty());
    }

    #[test]
    fn a_printer_is_assigned_to_at_most_one_order_per_pass() {
        let printers = vec![printer("P1", "Default", PrinterState::Ready)];
        let orders = vec![order(1, 1, 0, &["Default"]), order(2, 1, 0, &["Default"])];
        let jobs = select_jobs(&orders, &printers);
        assert_eq!(jobs, vec![("P1".to_string(), 1)], "second order has no printer left");
    }

    #[test]
    fn numeric_sort_orders_printer_ten_after_printer_two() {
        let printers = vec![
            printer("Printer 10", "Default", PrinterState::Ready),
            printer("Printer 2", "Default", PrinterState::Ready),
        ];
        let orders = vec![order(1, 1, 0, &["Default"])];
        let jobs = select_jobs(&orders, &printers);
        assert_eq!(jobs, vec![("Printer 2".to_string(), 1)]);
    }

    #[test]
    fn non_distributable_printers_are_ignored() {
        let printers = vec![
            printer("P1", "Default", PrinterState::Printing),
            printer("P2", "Default", PrinterState::Ready),
        ];
        let orders = vec![order(1, 1, 0, &["Default"])];
        assert_eq!(select_jobs(&orders, &printers), vec![("P2".to_string(), 1)]);
    }

    #[test]
    fn needed_copies_capped_by_remaining_quantity() {
        let printers = vec![
            printer("P1", "Default", PrinterState::Ready),
            printer("P2", "Default", PrinterState::Ready),
        ];
        let orders = vec![order(1, 3, 2, &["Default"])];
        let jobs = select_jobs(&orders, &printers);
        assert_eq!(jobs.len(), 1, "only one copy remains even though two printers are free");
    }

    #[test]
    fn completed_orders_are_skipped() {
        let printers = vec![printer("P1", "Default", PrinterState::Ready)];
        let mut o = order(1, 1, 1, &["Default"]);
        o.status = crate::model::OrderStatus::Completed;
        assert!(select_jobs(&[o], &printers).is_empty());
    }
}
