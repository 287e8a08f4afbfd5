//! In-memory coverage aggregation.
//!
//! Provides a thread-safe table of per-application, per-device bitmaps:
//! - One counter per method ordinal, length fixed at first observation
//! - Lock-free counter increments shared by all connections
//! - Coverage ratios merged across devices or for a single device

use crate::protocol::IngestError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Identifies an independent reporting source for one application.
///
/// The server uses the local port of the accepting socket.
pub type DeviceKey = u16;

/// Fixed-length hit counters for one (application, device) pair.
#[derive(Debug)]
pub struct CoverageBitmap {
    counters: Box<[AtomicU64]>,
}

impl CoverageBitmap {
    /// Create a zeroed bitmap with one counter per method.
    pub fn new(methods: usize) -> Self {
        Self {
            counters: (0..methods).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Number of methods tracked.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Check if the bitmap tracks no methods.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Count one hit for `ordinal`.
    pub fn hit(&self, ordinal: usize) -> Result<(), IngestError> {
        let counter = self
            .counters
            .get(ordinal)
            .ok_or(IngestError::OrdinalOutOfRange {
                ordinal,
                methods: self.counters.len(),
            })?;
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Current hit count for `ordinal`.
    pub fn count(&self, ordinal: usize) -> Option<u64> {
        self.counters.get(ordinal).map(|c| c.load(Ordering::Relaxed))
    }

    /// Fraction of methods with at least one hit.
    pub fn ratio(&self) -> f64 {
        if self.counters.is_empty() {
            return 0.0;
        }
        let covered = self
            .counters
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) > 0)
            .count();
        covered as f64 / self.counters.len() as f64
    }
}

/// Coverage state for one application.
#[derive(Debug)]
struct AppCoverage {
    /// Bitmap length shared by every device of this application
    methods: usize,
    devices: HashMap<DeviceKey, Arc<CoverageBitmap>>,
}

/// Thread-safe coverage table shared by all connections
#[derive(Debug, Default)]
pub struct CoverageStore {
    apps: RwLock<HashMap<String, AppCoverage>>,
}

impl CoverageStore {
    /// Create an empty store
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Method count recorded for `app_id`, if the application has been seen.
    pub fn method_count(&self, app_id: &str) -> Option<usize> {
        let apps = self.apps.read().unwrap_or_else(PoisonError::into_inner);
        apps.get(app_id).map(|app| app.methods)
    }

    /// Bitmap for one device, if it exists.
    pub fn bitmap(&self, app_id: &str, device: DeviceKey) -> Option<Arc<CoverageBitmap>> {
        let apps = self.apps.read().unwrap_or_else(PoisonError::into_inner);
        apps.get(app_id)?.devices.get(&device).cloned()
    }

    /// Make sure a bitmap exists for `(app_id, device)`.
    ///
    /// `methods` is only used when the application is new; later devices
    /// inherit the length fixed by the first one. An existing bitmap is
    /// never resized. Returns the bitmap.
    pub fn ensure_sized(
        &self,
        app_id: &str,
        device: DeviceKey,
        methods: usize,
    ) -> Arc<CoverageBitmap> {
        if let Some(bitmap) = self.bitmap(app_id, device) {
            return bitmap;
        }

        let mut apps = self.apps.write().unwrap_or_else(PoisonError::into_inner);
        let app = apps.entry(app_id.to_string()).or_insert_with(|| {
            info!(app_id, methods, "Tracking new application");
            AppCoverage {
                methods,
                devices: HashMap::new(),
            }
        });
        let methods = app.methods;
        Arc::clone(app.devices.entry(device).or_insert_with(|| {
            debug!(app_id, device, methods, "Allocated coverage bitmap");
            Arc::new(CoverageBitmap::new(methods))
        }))
    }

    /// Count one hit for `ordinal` on `(app_id, device)`.
    pub fn mark_hit(
        &self,
        app_id: &str,
        device: DeviceKey,
        ordinal: usize,
    ) -> Result<(), IngestError> {
        let bitmap = self
            .bitmap(app_id, device)
            .ok_or_else(|| IngestError::UnknownDevice {
                app_id: app_id.to_string(),
                device,
            })?;
        bitmap.hit(ordinal)
    }

    /// Coverage of an application across all of its devices.
    ///
    /// A method counts as covered when any device has hit it. Returns 0 for
    /// unknown applications or applications without devices.
    pub fn application_coverage_ratio(&self, app_id: &str) -> f64 {
        let apps = self.apps.read().unwrap_or_else(PoisonError::into_inner);
        let Some(app) = apps.get(app_id) else {
            return 0.0;
        };
        if app.devices.is_empty() || app.methods == 0 {
            return 0.0;
        }

        let mut merged = vec![0u64; app.methods];
        for bitmap in app.devices.values() {
            for (total, counter) in merged.iter_mut().zip(bitmap.counters.iter()) {
                *total = total.saturating_add(counter.load(Ordering::Relaxed));
            }
        }

        let covered = merged.iter().filter(|&&total| total > 0).count();
        covered as f64 / app.methods as f64
    }

    /// Coverage of a single device. Returns 0 when the pair is unknown.
    pub fn device_coverage_ratio(&self, app_id: &str, device: DeviceKey) -> f64 {
        self.bitmap(app_id, device)
            .map(|bitmap| bitmap.ratio())
            .unwrap_or(0.0)
    }

    /// Ids of every application seen so far, sorted.
    pub fn applications(&self) -> Vec<String> {
        let apps = self.apps.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = apps.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Get statistics about the store
    pub fn stats(&self) -> CoverageStats {
        let apps = self.apps.read().unwrap_or_else(PoisonError::into_inner);
        CoverageStats {
            applications: apps.len(),
            devices: apps.values().map(|app| app.devices.len()).sum(),
        }
    }
}

/// Coverage store statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageStats {
    pub applications: usize,
    pub devices: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_ratio_counts_any_hit() {
        let store = CoverageStore::new();
        store.ensure_sized("app1", 9000, 5);

        for ordinal in [0, 1, 2] {
            store.mark_hit("app1", 9000, ordinal).unwrap();
        }
        assert!((store.application_coverage_ratio("app1") - 0.6).abs() < 1e-9);

        for ordinal in [0, 1, 2] {
            store.mark_hit("app1", 9000, ordinal).unwrap();
        }
        let bitmap = store.bitmap("app1", 9000).unwrap();
        assert_eq!(bitmap.count(0), Some(2));
        assert_eq!(bitmap.count(3), Some(0));
        assert!((store.application_coverage_ratio("app1") - 0.6).abs() < 1e-9);
        assert!((store.device_coverage_ratio("app1", 9000) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_returns_zero() {
        let store = CoverageStore::new();
        assert_eq!(store.application_coverage_ratio("missing"), 0.0);
        assert_eq!(store.device_coverage_ratio("missing", 1), 0.0);

        store.ensure_sized("app1", 1, 4);
        assert_eq!(store.device_coverage_ratio("app1", 2), 0.0);
    }

    #[test]
    fn test_zero_methods() {
        let store = CoverageStore::new();
        store.ensure_sized("empty", 1, 0);
        assert_eq!(store.application_coverage_ratio("empty"), 0.0);
        assert_eq!(store.device_coverage_ratio("empty", 1), 0.0);
        assert!(matches!(
            store.mark_hit("empty", 1, 0),
            Err(IngestError::OrdinalOutOfRange { ordinal: 0, methods: 0 })
        ));
    }

    #[test]
    fn test_length_fixed_at_first_observation() {
        let store = CoverageStore::new();
        store.ensure_sized("app1", 1, 4);

        let again = store.ensure_sized("app1", 1, 100);
        assert_eq!(again.len(), 4);

        let second_device = store.ensure_sized("app1", 2, 100);
        assert_eq!(second_device.len(), 4);
        assert_eq!(store.method_count("app1"), Some(4));
    }

    #[test]
    fn test_merge_across_devices() {
        let store = CoverageStore::new();
        store.ensure_sized("app1", 1, 4);
        store.ensure_sized("app1", 2, 4);

        store.mark_hit("app1", 1, 0).unwrap();
        store.mark_hit("app1", 2, 0).unwrap();
        store.mark_hit("app1", 2, 3).unwrap();

        assert!((store.application_coverage_ratio("app1") - 0.5).abs() < 1e-9);
        assert!((store.device_coverage_ratio("app1", 1) - 0.25).abs() < 1e-9);

        // Merging must not fold counts into any device's bitmap
        assert_eq!(store.bitmap("app1", 1).unwrap().count(0), Some(1));
        assert_eq!(store.bitmap("app1", 2).unwrap().count(0), Some(1));
    }

    #[test]
    fn test_mark_hit_errors() {
        let store = CoverageStore::new();
        assert!(matches!(
            store.mark_hit("app1", 1, 0),
            Err(IngestError::UnknownDevice { .. })
        ));

        store.ensure_sized("app1", 1, 2);
        assert!(matches!(
            store.mark_hit("app1", 1, 2),
            Err(IngestError::OrdinalOutOfRange { ordinal: 2, methods: 2 })
        ));
    }

    #[test]
    fn test_concurrent_increments() {
        let store = CoverageStore::new();
        let threads = 8;
        let rounds = 1000;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let device = (t % 2) as DeviceKey;
                    store.ensure_sized("shared", device, 3);
                    for _ in 0..rounds {
                        for ordinal in 0..3 {
                            store.mark_hit("shared", device, ordinal).unwrap();
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let total: u64 = (0..2)
            .map(|device| store.bitmap("shared", device).unwrap())
            .map(|bitmap| (0..3).map(|i| bitmap.count(i).unwrap()).sum::<u64>())
            .sum();
        assert_eq!(total, (threads * rounds * 3) as u64);
        assert_eq!(store.stats(), CoverageStats { applications: 1, devices: 2 });
        assert_eq!(store.applications(), vec!["shared".to_string()]);
    }
}
