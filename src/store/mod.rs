//! Fleet state store (§4.1): in-memory source of truth, durable on disk.
//!
//! Collapses what the original keeps as several ad-hoc globals into one
//! `FleetStore` owning printers behind a read/write lock and orders, filament,
//! and ejection codes each behind their own mutex (§9 "Cyclic lock-free
//! avoidance"). No subsystem ever takes two of these locks nested in a fixed
//! order other than the one the spec allows: a printers read-lock may be held
//! while briefly acquiring the orders lock, never the reverse.

pub mod group;
pub mod persist;

use crate::config::{READ_LOCK_TIMEOUT, SAFE_LOCK_TIMEOUT, WRITE_LOCK_TIMEOUT};
use crate::error::StoreError;
use crate::model::{EjectionCode, Order, Printer};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Default, Serialize, Deserialize)]
struct TotalFilament {
    total_filament_used_g: f64,
}

pub struct FleetStore {
    data_dir: PathBuf,
    printers: RwLock<Vec<Printer>>,
    orders: Mutex<Vec<Order>>,
    total_filament_g: Mutex<f64>,
    ejection_codes: Mutex<Vec<EjectionCode>>,
    ejection_paused: std::sync::atomic::AtomicBool,
}

impl FleetStore {
    pub fn printers_path(data_dir: &Path) -> PathBuf {
        data_dir.join("printers.json")
    }
    pub fn orders_path(data_dir: &Path) -> PathBuf {
        data_dir.join("orders.json")
    }
    pub fn filament_path(data_dir: &Path) -> PathBuf {
        data_dir.join("total_filament.json")
    }
    pub fn ejection_codes_path(data_dir: &Path) -> PathBuf {
        data_dir.join("ejection_codes.json")
    }

    /// Loads all four documents from `data_dir`, deduplicating and resetting
    /// connection-dependent runtime fields on every printer.
    pub fn load(data_dir: &Path) -> Result<Self, StoreError> {
        let mut printers: Vec<Printer> = persist::load(&Self::printers_path(data_dir), "printers")?;
        let mut orders: Vec<Order> = persist::load(&Self::orders_path(data_dir), "orders")?;
        let filament: TotalFilament = persist::load(&Self::filament_path(data_dir), "total_filament")?;
        let ejection_codes: Vec<EjectionCode> =
            persist::load(&Self::ejection_codes_path(data_dir), "ejection_codes")?;

        let printers_deduped = dedup_by_key(&mut printers, |p| p.name.clone());
        let orders_deduped = dedup_by_key(&mut orders, |o| o.id);

        for p in printers.iter_mut() {
            p.reset_runtime();
        }

        if printers_deduped {
            persist::save(&Self::printers_path(data_dir), "printers", &printers)?;
        }
        if orders_deduped {
            persist::save(&Self::orders_path(data_dir), "orders", &orders)?;
        }

        Ok(FleetStore {
            data_dir: data_dir.to_path_buf(),
            printers: RwLock::new(printers),
            orders: Mutex::new(orders),
            total_filament_g: Mutex::new(filament.total_filament_used_g),
            ejection_codes: Mutex::new(ejection_codes),
            ejection_paused: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // --- printers ---

    pub async fn read_printers(&self) -> Result<Vec<Printer>, StoreError> {
        let guard = tokio::time::timeout(READ_LOCK_TIMEOUT, self.printers.read())
            .await
            .map_err(|_| lock_timeout("printers", READ_LOCK_TIMEOUT))?;
        Ok(guard.clone())
    }

    /// Applies `f` to the printer list under the write lock, snapshots the
    /// result, releases the lock, then persists (§9: never hold the lock
    /// across disk I/O).
    pub async fn write_printers<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Vec<Printer>) -> R,
    {
        let (result, snapshot) = {
            let mut guard = tokio::time::timeout(WRITE_LOCK_TIMEOUT, self.printers.write())
                .await
                .map_err(|_| lock_timeout("printers", WRITE_LOCK_TIMEOUT))?;
            let result = f(&mut guard);
            (result, guard.clone())
        };
        persist::save(&Self::printers_path(&self.data_dir), "printers", &snapshot)?;
        Ok(result)
    }

    // --- orders ---

    pub async fn read_orders(&self) -> Result<Vec<Order>, StoreError> {
        let guard = tokio::time::timeout(SAFE_LOCK_TIMEOUT, self.orders.lock())
            .await
            .map_err(|_| lock_timeout("orders", SAFE_LOCK_TIMEOUT))?;
        Ok(guard.clone())
    }

    pub async fn write_orders<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Vec<Order>) -> R,
    {
        let (result, snapshot) = {
            let mut guard = tokio::time::timeout(SAFE_LOCK_TIMEOUT, self.orders.lock())
                .await
                .map_err(|_| lock_timeout("orders", SAFE_LOCK_TIMEOUT))?;
            let result = f(&mut guard);
            (result, guard.clone())
        };
        persist::save(&Self::orders_path(&self.data_dir), "orders", &snapshot)?;
        Ok(result)
    }

    pub async fn next_order_id(&self) -> Result<i64, StoreError> {
        let guard = tokio::time::timeout(SAFE_LOCK_TIMEOUT, self.orders.lock())
            .await
            .map_err(|_| lock_timeout("orders", SAFE_LOCK_TIMEOUT))?;
        Ok(guard.iter().map(|o| o.id).max().unwrap_or(0) + 1)
    }

    // --- filament ---

    pub async fn total_filament_g(&self) -> Result<f64, StoreError> {
        let guard = tokio::time::timeout(SAFE_LOCK_TIMEOUT, self.total_filament_g.lock())
            .await
            .map_err(|_| lock_timeout("total_filament", SAFE_LOCK_TIMEOUT))?;
        Ok(*guard)
    }

    /// Adds `grams` to the running total and persists immediately (§4.9).
    pub async fn add_filament_g(&self, grams: f64) -> Result<f64, StoreError> {
        let total = {
            let mut guard = tokio::time::timeout(SAFE_LOCK_TIMEOUT, self.total_filament_g.lock())
                .await
                .map_err(|_| lock_timeout("total_filament", SAFE_LOCK_TIMEOUT))?;
            *guard += grams.max(0.0);
            *guard
        };
        persist::save(
            &Self::filament_path(&self.data_dir),
            "total_filament",
            &TotalFilament {
                total_filament_used_g: total,
            },
        )?;
        Ok(total)
    }

    // --- ejection codes ---

    pub async fn read_ejection_codes(&self) -> Result<Vec<EjectionCode>, StoreError> {
        let guard = tokio::time::timeout(SAFE_LOCK_TIMEOUT, self.ejection_codes.lock())
            .await
            .map_err(|_| lock_timeout("ejection_codes", SAFE_LOCK_TIMEOUT))?;
        Ok(guard.clone())
    }

    pub async fn write_ejection_codes<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Vec<EjectionCode>) -> R,
    {
        let (result, snapshot) = {
            let mut guard = tokio::time::timeout(SAFE_LOCK_TIMEOUT, self.ejection_codes.lock())
                .await
                .map_err(|_| lock_timeout("ejection_codes", SAFE_LOCK_TIMEOUT))?;
            let result = f(&mut guard);
            (result, guard.clone())
        };
        persist::save(
            &Self::ejection_codes_path(&self.data_dir),
            "ejection_codes",
            &snapshot,
        )?;
        Ok(result)
    }

    // --- global flags ---

    pub fn ejection_paused(&self) -> bool {
        self.ejection_paused.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn set_ejection_paused(&self, paused: bool) {
        self.ejection_paused
            .store(paused, std::sync::atomic::Ordering::SeqCst);
    }

    /// Re-asserts printer/order uniqueness; run on a timer (§4.1) in addition
    /// to at load time.
    pub async fn deduplicate(&self) -> Result<(), StoreError> {
        self.write_printers(|printers| dedup_by_key(printers, |p| p.name.clone()))
            .await?;
        self.write_orders(|orders| dedup_by_key(orders, |o| o.id))
            .await?;
        Ok(())
    }
}

fn lock_timeout(resource: &'static str, timeout: std::time::Duration) -> StoreError {
    StoreError::LockTimeout {
        resource,
        millis: timeout.as_millis() as u64,
    }
}

/// Keeps the first occurrence of each key, discarding later duplicates.
/// Returns whether anything was removed.
fn dedup_by_key<T, K, F>(items: &mut Vec<T>, key_fn: F) -> bool
where
    K: std::hash::Hash + Eq,
    F: Fn(&T) -> K,
{
    let mut seen: HashSet<K> = HashSet::with_capacity(items.len());
    let before = items.len();
    items.retain(|item| seen.insert(key_fn(item)));
    items.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PrinterType;

    #[tokio::test]
    async fn load_dedups_printers_by_name_first_occurrence_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut p1 = Printer::new("P1", "10.0.0.1", PrinterType::A);
        p1.group = "first".to_string();
        let mut p1_dup = Printer::new("P1", "10.0.0.2", PrinterType::A);
        p1_dup.group = "second".to_string();
        persist::save(
            &FleetStore::printers_path(dir.path()),
            "printers",
            &vec![p1, p1_dup],
        )
        .unwrap();

        let store = FleetStore::load(dir.path()).unwrap();
        let printers = store.read_printers().await.unwrap();
        assert_eq!(printers.len(), 1);
        assert_eq!(printers[0].group, "first");
    }

    #[tokio::test]
    async fn write_printers_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FleetStore::load(dir.path()).unwrap();
        store
            .write_printers(|printers| printers.push(Printer::new("P1", "10.0.0.1", PrinterType::A)))
            .await
            .unwrap();

        let reloaded = FleetStore::load(dir.path()).unwrap();
        let printers = reloaded.read_printers().await.unwrap();
        assert_eq!(printers.len(), 1);
        assert_eq!(printers[0].name, "P1");
    }

    #[tokio::test]
    async fn add_filament_g_is_monotonic_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FleetStore::load(dir.path()).unwrap();
        store.add_filament_g(12.0).await.unwrap();
        let total = store.add_filament_g(5.5).await.unwrap();
        assert_eq!(total, 17.5);

        let reloaded = FleetStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.total_filament_g().await.unwrap(), 17.5);
    }

    #[tokio::test]
    async fn next_order_id_is_max_plus_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = FleetStore::load(dir.path()).unwrap();
        assert_eq!(store.next_order_id().await.unwrap(), 1);
        store
            .write_orders(|orders| orders.push(Order::new(5, "a.gcode", "/tmp/a.gcode", 1)))
            .await
            .unwrap();
        assert_eq!(store.next_order_id().await.unwrap(), 6);
    }

    #[tokio::test]
    async fn deduplicate_removes_duplicate_orders_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FleetStore::load(dir.path()).unwrap();
        store
            .write_orders(|orders| {
                orders.push(Order::new(1, "a.gcode", "/tmp/a.gcode", 1));
                orders.push(Order::new(1, "b.gcode", "/tmp/b.gcode", 2));
            })
            .await
            .unwrap();
        store.deduplicate().await.unwrap();
        let orders = store.read_orders().await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].filename, "a.gcode");
    }
}
