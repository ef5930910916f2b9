//! Bounded in-memory warning store.
//!
//! Capacity defaults to 1000 entries; inserting past capacity evicts the
//! oldest unacknowledged warning (oldest overall when everything is
//! acknowledged).

use std::collections::HashMap;

use chrono::Duration as ChronoDuration;
use parking_lot::RwLock;
use tracing::debug;

use fc_common::{Warning, WarningCategory, WarningSeverity};

#[derive(Debug, Clone)]
pub struct WarningStoreConfig {
    pub capacity: usize,
    /// Warnings older than this are dropped by the periodic GC.
    pub max_age_hours: i64,
}

impl Default for WarningStoreConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            max_age_hours: 24,
        }
    }
}

pub struct WarningStore {
    warnings: RwLock<HashMap<String, Warning>>,
    config: WarningStoreConfig,
}

impl WarningStore {
    pub fn new(config: WarningStoreConfig) -> Self {
        Self {
            warnings: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn add(
        &self,
        category: WarningCategory,
        severity: WarningSeverity,
        message: impl Into<String>,
        source: impl Into<String>,
    ) -> String {
        let warning = Warning::new(category, severity, message, source);
        let id = warning.id.clone();

        let mut warnings = self.warnings.write();
        if warnings.len() >= self.config.capacity {
            Self::evict_one(&mut warnings);
        }
        debug!(id = %id, category = ?category, severity = ?severity, "warning recorded");
        warnings.insert(id.clone(), warning);
        id
    }

    /// Eviction path is serialized under the write lock: prefer the oldest
    /// unacknowledged entry, fall back to the oldest overall.
    fn evict_one(warnings: &mut HashMap<String, Warning>) {
        let victim = warnings
            .values()
            .filter(|w| !w.acknowledged)
            .min_by_key(|w| w.timestamp)
            .or_else(|| warnings.values().min_by_key(|w| w.timestamp))
            .map(|w| w.id.clone());

        if let Some(id) = victim {
            warnings.remove(&id);
        }
    }

    pub fn all(&self) -> Vec<Warning> {
        let mut list: Vec<_> = self.warnings.read().values().cloned().collect();
        list.sort_by_key(|w| std::cmp::Reverse(w.timestamp));
        list
    }

    pub fn by_severity(&self, severity: WarningSeverity) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| w.severity == severity)
            .cloned()
            .collect()
    }

    pub fn unacknowledged(&self) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| !w.acknowledged)
            .cloned()
            .collect()
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        match self.warnings.write().get_mut(id) {
            Some(warning) => {
                warning.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) -> usize {
        let mut warnings = self.warnings.write();
        let removed = warnings.len();
        warnings.clear();
        removed
    }

    /// Drop warnings older than `hours`, returning how many were removed.
    pub fn gc_older_than(&self, hours: i64) -> usize {
        let cutoff = ChronoDuration::hours(hours);
        let mut warnings = self.warnings.write();
        let before = warnings.len();
        warnings.retain(|_, w| w.age() <= cutoff);
        before - warnings.len()
    }

    /// Periodic maintenance entry point.
    pub fn gc(&self) -> usize {
        self.gc_older_than(self.config.max_age_hours)
    }

    pub fn len(&self) -> usize {
        self.warnings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.read().is_empty()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.warnings
            .read()
            .values()
            .filter(|w| !w.acknowledged)
            .count()
    }

    pub fn critical_count(&self) -> usize {
        self.warnings
            .read()
            .values()
            .filter(|w| w.severity == WarningSeverity::Critical && !w.acknowledged)
            .count()
    }
}

impl Default for WarningStore {
    fn default() -> Self {
        Self::new(WarningStoreConfig::default())
    }
}

impl fc_common::WarningSink for WarningStore {
    fn emit(
        &self,
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) {
        self.add(category, severity, message, source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_list_acknowledge() {
        let store = WarningStore::default();
        let id = store.add(
            WarningCategory::Routing,
            WarningSeverity::Error,
            "unknown pool",
            "consumer",
        );

        assert_eq!(store.len(), 1);
        assert_eq!(store.unacknowledged_count(), 1);

        assert!(store.acknowledge(&id));
        assert_eq!(store.unacknowledged_count(), 0);
        assert!(!store.acknowledge("missing"));
    }

    #[test]
    fn overflow_evicts_oldest_unacknowledged() {
        let store = WarningStore::new(WarningStoreConfig {
            capacity: 3,
            max_age_hours: 24,
        });

        let first = store.add(
            WarningCategory::Processing,
            WarningSeverity::Warn,
            "first",
            "test",
        );
        let second = store.add(
            WarningCategory::Processing,
            WarningSeverity::Warn,
            "second",
            "test",
        );
        store.add(
            WarningCategory::Processing,
            WarningSeverity::Warn,
            "third",
            "test",
        );

        // Acknowledging the oldest shifts eviction to the next-oldest.
        store.acknowledge(&first);
        store.add(
            WarningCategory::Processing,
            WarningSeverity::Warn,
            "fourth",
            "test",
        );

        assert_eq!(store.len(), 3);
        let remaining: Vec<_> = store.all().into_iter().map(|w| w.id).collect();
        assert!(remaining.contains(&first));
        assert!(!remaining.contains(&second));
    }

    #[test]
    fn filter_by_severity() {
        let store = WarningStore::default();
        store.add(WarningCategory::Dispatch, WarningSeverity::Warn, "a", "t");
        store.add(WarningCategory::Dispatch, WarningSeverity::Critical, "b", "t");

        assert_eq!(store.by_severity(WarningSeverity::Critical).len(), 1);
        assert_eq!(store.critical_count(), 1);
    }
}
