//! The order record: a submission for N copies of a file, optionally
//! group-restricted, with optional post-print ejection G-code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Partial,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub filename: String,
    pub filepath: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub filament_g: f64,

    pub quantity: u32,
    #[serde(default)]
    pub sent: u32,
    #[serde(default = "default_order_status")]
    pub status: OrderStatus,

    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(default)]
    pub ejection_enabled: bool,
    #[serde(default)]
    pub end_gcode: String,
    #[serde(default)]
    pub ejection_code_id: Option<String>,
    #[serde(default)]
    pub ejection_code_name: Option<String>,

    /// Vendor-B only: target bed temperature in °C, 0–100, or `None`.
    #[serde(default)]
    pub cooldown_temp: Option<i32>,

    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_order_status() -> OrderStatus {
    OrderStatus::Pending
}

impl Order {
    pub fn new(id: i64, filename: impl Into<String>, filepath: impl Into<String>, quantity: u32) -> Self {
        Order {
            id,
            filename: filename.into(),
            filepath: filepath.into(),
            name: None,
            filament_g: 0.0,
            quantity,
            sent: 0,
            status: OrderStatus::Pending,
            groups: Vec::new(),
            ejection_enabled: false,
            end_gcode: String::new(),
            ejection_code_id: None,
            ejection_code_name: None,
            cooldown_temp: None,
            deleted: false,
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.deleted && self.sent < self.quantity && self.status != OrderStatus::Completed
    }

    /// Records one dispatched copy. Enforces the "counts only go up" rule
    /// inside the mutation path rather than trusting callers (§9).
    pub fn record_sent(&mut self, now: DateTime<Utc>) {
        if self.sent < self.quantity {
            self.sent += 1;
        }
        self.status = if self.sent == 0 {
            OrderStatus::Pending
        } else if self.sent >= self.quantity {
            if self.completed_at.is_none() {
                self.completed_at = Some(now);
            }
            OrderStatus::Completed
        } else {
            OrderStatus::Partial
        };
    }

    /// Clamps an untrusted cooldown temperature to the valid range, per the
    /// boundary rule in §8: out-of-range or non-integer values become `None`.
    pub fn normalize_cooldown_temp(raw: Option<i32>) -> Option<i32> {
        raw.filter(|t| (0..=100).contains(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sent_never_exceeds_quantity() {
        let mut o = Order::new(1, "a.gcode", "/tmp/a.gcode", 1);
        o.record_sent(Utc::now());
        o.record_sent(Utc::now());
        assert_eq!(o.sent, 1);
        assert_eq!(o.status, OrderStatus::Completed);
    }

    #[test]
    fn zero_quantity_order_is_inactive() {
        let o = Order::new(1, "a.gcode", "/tmp/a.gcode", 0);
        assert!(!o.is_active(), "library-only order has nothing to send");
    }

    #[test]
    fn partial_status_between_zero_and_quantity() {
        let mut o = Order::new(1, "a.gcode", "/tmp/a.gcode", 3);
        o.record_sent(Utc::now());
        assert_eq!(o.status, OrderStatus::Partial);
        assert!(o.is_active());
    }

    #[test]
    fn cooldown_temp_out_of_range_becomes_none() {
        assert_eq!(Order::normalize_cooldown_temp(Some(40)), Some(40));
        assert_eq!(Order::normalize_cooldown_temp(Some(-1)), None);
        assert_eq!(Order::normalize_cooldown_temp(Some(101)), None);
        assert_eq!(Order::normalize_cooldown_temp(None), None);
    }

    #[test]
    fn deleted_orders_never_active() {
        let mut o = Order::new(1, "a.gcode", "/tmp/a.gcode", 5);
        o.deleted = true;
        assert!(!o.is_active());
    }
}
