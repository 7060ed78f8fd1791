//! Typed records for the fleet's persistent and runtime state.
//!
//! Each document the store persists (printers, orders, ejection codes) is a
//! record with explicit optional fields rather than a dynamic map; runtime-only
//! fields live alongside the persisted ones but are reset on load (see
//! [`printer::Printer::reset_runtime`]).

pub mod ejection_code;
pub mod order;
pub mod printer;

pub use ejection_code::EjectionCode;
pub use order::{Order, OrderStatus};
pub use printer::{PendingEjection, Printer, PrinterState, PrinterType, PrintStage};
