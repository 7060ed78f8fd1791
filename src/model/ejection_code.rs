//! Ejection-code presets (§4.10): named, reusable G-code snippets an order
//! can reference by id instead of inlining `end_gcode`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EjectionCode {
    pub id: String,
    pub name: String,
    pub gcode: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EjectionCode {
    pub fn new(id: impl Into<String>, name: impl Into<String>, gcode: impl Into<String>, now: DateTime<Utc>) -> Self {
        EjectionCode {
            id: id.into(),
            name: name.into(),
            gcode: gcode.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_updates_mtime_only() {
        let t0 = Utc::now();
        let mut code = EjectionCode::new("1", "standard", "G28\nM84", t0);
        let t1 = t0 + chrono::Duration::seconds(5);
        code.touch(t1);
        assert_eq!(code.created_at, t0);
        assert_eq!(code.updated_at, t1);
    }
}
