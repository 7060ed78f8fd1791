//! Demo fixtures (`--demo`): a small, realistic fleet snapshot so the daemon
//! can be exercised without real printers on the network.
//!
//! Generalizes the teacher's `demo.rs` three-printer scenario (one actively
//! printing, one paused with an HMS alert, one idle) from the TUI's
//! `PrinterState` into this crate's `Printer`/`Order`/`EjectionCode` model.

use crate::model::{EjectionCode, Order, OrderStatus, Printer, PrinterState, PrinterType};
use crate::store::FleetStore;
use chrono::Utc;
use std::path::Path;

/// Builds the demo fleet: three printers, one active order, one preset.
pub fn demo_fleet() -> (Vec<Printer>, Vec<Order>, Vec<EjectionCode>) {
    let now = Utc::now();

    let mut office = Printer::new("Office X1C", "10.0.0.21", PrinterType::B);
    office.serial_number = Some("00M09A1234567".to_string());
    office.state = PrinterState::Printing;
    office.status = "Printing".to_string();
    office.progress = 75;
    office.time_remaining = 45 * 60;
    office.bed_temp = 60.0;
    office.nozzle_temp = 250.0;
    office.file = Some("Benchy.gcode.3mf".to_string());
    office.order_id = Some(1);
    office.print_started_at = Some(now - chrono::Duration::minutes(135));

    let mut workshop = Printer::new("Workshop P1S", "10.0.0.22", PrinterType::B);
    workshop.serial_number = Some("01P07A7654321".to_string());
    workshop.state = PrinterState::Paused;
    workshop.status = "Paused".to_string();
    workshop.progress = 42;
    workshop.time_remaining = 87 * 60;
    workshop.bed_temp = 40.0;
    workshop.nozzle_temp = 180.0;
    workshop.file = Some("Phone Stand.gcode.3mf".to_string());
    workshop.hms_alerts = vec!["0500_0200".to_string()];
    workshop.error_message = Some("Filament may be tangled".to_string());

    let mut desk = Printer::new("Desk A1 Mini", "10.0.0.23", PrinterType::A);
    desk.state = PrinterState::Ready;
    desk.status = "Ready".to_string();

    let mut order = Order::new(1, "Benchy.gcode.3mf", "/tmp/fleetd-demo/Benchy.gcode.3mf", 3);
    order.name = Some("Benchy (demo fleet)".to_string());
    order.filament_g = 18.5;
    order.sent = 1;
    order.status = OrderStatus::Partial;
    order.groups = vec!["Default".to_string()];
    order.ejection_enabled = true;
    order.end_gcode = "G28 X Y\nM84".to_string();

    let preset = EjectionCode::new("standard-eject", "Standard eject", "G28 X Y\nM84", now);

    (vec![office, workshop, desk], vec![order], vec![preset])
}

/// Writes the demo fixture documents into `data_dir` so a normal
/// [`FleetStore::load`] picks them up, exactly as it would any persisted
/// fleet. Used by `--demo` to avoid a separate in-memory code path.
pub fn seed_demo_store(data_dir: &Path) -> anyhow::Result<()> {
    let (printers, orders, ejection_codes) = demo_fleet();
    crate::store::persist::save(&FleetStore::printers_path(data_dir), "printers", &printers)?;
    crate::store::persist::save(&FleetStore::orders_path(data_dir), "orders", &orders)?;
    crate::store::persist::save(
        &FleetStore::ejection_codes_path(data_dir),
        "ejection_codes",
        &ejection_codes,
    )?;
    Ok(())
}
