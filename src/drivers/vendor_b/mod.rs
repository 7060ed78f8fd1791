//! Vendor B driver: MQTT-over-TLS session manager + FTPS uploader (§4.4).

pub mod ftps;
pub mod session;

pub use session::{VendorBCachedState, VendorBSession};

use crate::store::FleetStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Owns one [`VendorBSession`] per Vendor-B printer, keyed by printer name.
/// Generalizes the teacher's per-process single/multi `MqttClient` list into a
/// registry the reconciler and ejection manager both reach into by name.
pub struct VendorBManager {
    sessions: Mutex<HashMap<String, Arc<VendorBSession>>>,
}

impl VendorBManager {
    pub fn new() -> Self {
        VendorBManager {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, printer_name: &str) -> Option<Arc<VendorBSession>> {
        self.sessions.lock().await.get(printer_name).cloned()
    }

    pub async fn insert(&self, printer_name: String, session: Arc<VendorBSession>) {
        self.sessions.lock().await.insert(printer_name, session);
    }

    pub async fn remove(&self, printer_name: &str) -> Option<Arc<VendorBSession>> {
        self.sessions.lock().await.remove(printer_name)
    }

    pub async fn printer_names(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Ensures a session exists for every non-service-mode Vendor-B printer,
    /// connecting any that are missing. Used at startup and whenever the
    /// printer list changes.
    pub async fn ensure_sessions(
        &self,
        store: &FleetStore,
        access_code_for: impl Fn(&str) -> Option<String>,
    ) {
        let printers = match store.read_printers().await {
            Ok(p) => p,
            Err(e) => {
                log::warn!("could not read printers while ensuring Vendor-B sessions: {e}");
                return;
            }
        };

        for printer in printers
            .iter()
            .filter(|p| p.printer_type == crate::model::PrinterType::B && !p.service_mode)
        {
            if self.get(&printer.name).await.is_some() {
                continue;
            }
            let Some(serial) = printer.serial_number.clone() else {
                continue;
            };
            let Some(access_code) = access_code_for(&printer.name) else {
                log::warn!("no access code available for {}; skipping MQTT connect", printer.name);
                continue;
            };
            match VendorBSession::connect(printer.name.clone(), printer.ip.clone(), serial, access_code).await {
                Ok(session) => {
                    log::info!("connected Vendor-B session for {}", printer.name);
                    self.insert(printer.name.clone(), Arc::new(session)).await;
                }
                Err(e) => {
                    log::warn!("failed to connect Vendor-B session for {}: {e}", printer.name);
                }
            }
        }
    }
}

impl Default for VendorBManager {
    fn default() -> Self {
        Self::new()
    }
}
