//! Entitlement snapshot cache.
//!
//! Holds the latest known entitlement snapshot per user with TTL-based
//! staleness. Snapshots are written through to the storage adapter so a cold
//! start can serve the last known state, and observers are notified with
//! `(old, new)` whenever a put actually changes the stored entitlement map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::storage::{keys, StorageAdapter};
use crate::types::{now_unix, EntitlementSnapshot};

/// Default time-to-live for a cached snapshot.
pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(5 * 60);

/// Callback invoked when a user's entitlement state changes.
///
/// Receives the previous snapshot (None on first population) and the new one.
pub type EntitlementsObserver =
    Box<dyn Fn(Option<&EntitlementSnapshot>, &EntitlementSnapshot) + Send + Sync>;

/// Per-user cache of the current entitlement snapshot.
///
/// All reads and writes are serialized internally; callers never need
/// external locking. Staleness is advisory: [`get`](Self::get) returns stale
/// snapshots (stale-while-revalidate), and callers that need guaranteed
/// freshness must force a backend refresh instead.
pub struct EntitlementCache {
    entries: Mutex<HashMap<String, EntitlementSnapshot>>,
    observers: Mutex<Vec<EntitlementsObserver>>,
    ttl: Duration,
    storage: Arc<dyn StorageAdapter>,
}

impl EntitlementCache {
    pub fn new(storage: Arc<dyn StorageAdapter>, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
            ttl,
            storage,
        }
    }

    /// The latest known snapshot for `user_id`, stale or not.
    ///
    /// Falls back to the persisted blob on an in-memory miss so a restarted
    /// process can serve the last known state.
    pub fn get(&self, user_id: &str) -> Option<EntitlementSnapshot> {
        if let Ok(entries) = self.entries.lock() {
            if let Some(snapshot) = entries.get(user_id) {
                return Some(snapshot.clone());
            }
        }

        let persisted = self.load_persisted(user_id)?;
        if let Ok(mut entries) = self.entries.lock() {
            entries
                .entry(user_id.to_string())
                .or_insert_with(|| persisted.clone());
        }
        Some(persisted)
    }

    /// Whether the cached snapshot for `user_id` is absent or older than the
    /// TTL.
    pub fn is_stale(&self, user_id: &str) -> bool {
        match self.get(user_id) {
            Some(snapshot) => {
                let age = now_unix().saturating_sub(snapshot.fetched_at);
                age >= self.ttl.as_secs() as i64
            }
            None => true,
        }
    }

    /// Replace the snapshot for the owning user wholesale.
    ///
    /// Writes through to storage and notifies observers exactly once if the
    /// entitlement map changed (version-token-only updates are silent).
    /// Insert, persist, and notification all happen under the entries lock,
    /// so racing puts deliver their `(old, new)` pairs in the same order the
    /// cache applied them. Observers must not call back into the cache.
    pub fn put(&self, snapshot: EntitlementSnapshot) {
        let user_id = snapshot.user_id.clone();

        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let old = entries.insert(user_id.clone(), snapshot.clone());

        if let Ok(blob) = serde_json::to_string(&snapshot) {
            self.storage.set(&keys::snapshot(&user_id), &blob);
        }

        let changed = match &old {
            Some(previous) => !previous.same_entitlements(&snapshot),
            None => true,
        };
        if changed {
            tracing::debug!(user = %user_id, "entitlement snapshot changed");
            if let Ok(observers) = self.observers.lock() {
                for observer in observers.iter() {
                    observer(old.as_ref(), &snapshot);
                }
            }
        }
    }

    /// Mark the user's snapshot stale without discarding it.
    ///
    /// The entry stays addressable (a later re-login can still see it) but
    /// every freshness check fails until the next successful refresh.
    pub fn invalidate(&self, user_id: &str) {
        let mut updated = None;
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(snapshot) = entries.get_mut(user_id) {
                snapshot.fetched_at = 0;
                updated = Some(snapshot.clone());
            }
        }

        if let Some(snapshot) = updated {
            if let Ok(blob) = serde_json::to_string(&snapshot) {
                self.storage.set(&keys::snapshot(user_id), &blob);
            }
        } else if let Some(mut persisted) = self.load_persisted(user_id) {
            persisted.fetched_at = 0;
            if let Ok(blob) = serde_json::to_string(&persisted) {
                self.storage.set(&keys::snapshot(user_id), &blob);
            }
        }
    }

    /// Register an observer for entitlement changes.
    pub fn add_observer(&self, observer: EntitlementsObserver) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(observer);
        }
    }

    fn load_persisted(&self, user_id: &str) -> Option<EntitlementSnapshot> {
        let blob = self.storage.get(&keys::snapshot(user_id))?;
        match serde_json::from_str(&blob) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                tracing::warn!(user = %user_id, %err, "discarding unreadable persisted snapshot");
                None
            }
        }
    }
}

impl std::fmt::Debug for EntitlementCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitlementCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::Entitlement;

    fn snapshot(user: &str, entitlement: Option<&str>) -> EntitlementSnapshot {
        let mut s = EntitlementSnapshot::empty(user);
        if let Some(name) = entitlement {
            s.entitlements.insert(
                name.to_string(),
                Entitlement {
                    is_active: true,
                    expiration_date: None,
                    product_identifier: "com.app.monthly".into(),
                },
            );
        }
        s
    }

    fn cache() -> EntitlementCache {
        EntitlementCache::new(Arc::new(MemoryStorage::new()), DEFAULT_SNAPSHOT_TTL)
    }

    #[test]
    fn test_get_returns_latest_put_per_user() {
        let cache = cache();
        cache.put(snapshot("u1", Some("premium")));
        cache.put(snapshot("u2", None));
        cache.put(snapshot("u1", Some("pro")));

        let got = cache.get("u1").unwrap();
        assert_eq!(got.user_id, "u1");
        assert!(got.is_entitled_to("pro"));
        assert!(!got.is_entitled_to("premium"));

        assert!(cache.get("u2").unwrap().entitlements.is_empty());
        assert!(cache.get("u3").is_none());
    }

    #[test]
    fn test_observer_fires_once_per_change() {
        let cache = cache();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        cache.add_observer(Box::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        cache.put(snapshot("u1", Some("premium")));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Same entitlement map, different version token: no notification.
        let mut same = snapshot("u1", Some("premium"));
        same.version_token = Some("v2".into());
        cache.put(same);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        cache.put(snapshot("u1", None));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_observer_sees_old_and_new() {
        let cache = cache();
        let saw_old = Arc::new(AtomicUsize::new(0));

        let counter = saw_old.clone();
        cache.add_observer(Box::new(move |old, new| {
            if old.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            assert_eq!(new.user_id, "u1");
        }));

        cache.put(snapshot("u1", None));
        assert_eq!(saw_old.load(Ordering::SeqCst), 0);
        cache.put(snapshot("u1", Some("premium")));
        assert_eq!(saw_old.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_racing_puts_deliver_ordered_observer_pairs() {
        fn keyset(snapshot: &EntitlementSnapshot) -> Vec<String> {
            let mut keys: Vec<String> = snapshot.entitlements.keys().cloned().collect();
            keys.sort();
            keys
        }

        let cache = Arc::new(cache());
        let log: Arc<Mutex<Vec<(Option<Vec<String>>, Vec<String>)>>> =
            Arc::new(Mutex::new(Vec::new()));

        let recorder = log.clone();
        cache.add_observer(Box::new(move |old, new| {
            recorder
                .lock()
                .unwrap()
                .push((old.map(keyset), keyset(new)));
        }));

        let mut handles = Vec::new();
        for thread in 0..2 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let name = format!("e{thread}-{i}");
                    cache.put(snapshot("u1", Some(name.as_str())));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Every put changed the map, and each notification's old state must
        // be exactly the previous notification's new state.
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 100);
        assert!(log[0].0.is_none());
        for pair in log.windows(2) {
            assert_eq!(pair[1].0.as_ref(), Some(&pair[0].1));
        }
    }

    #[test]
    fn test_invalidate_keeps_entry_addressable_but_stale() {
        let cache = cache();
        cache.put(snapshot("u1", Some("premium")));
        assert!(!cache.is_stale("u1"));

        cache.invalidate("u1");
        assert!(cache.is_stale("u1"));

        let still_there = cache.get("u1").unwrap();
        assert!(still_there.is_entitled_to("premium"));
    }

    #[test]
    fn test_ttl_staleness() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
        let cache = EntitlementCache::new(storage, Duration::from_secs(300));

        let mut old = snapshot("u1", None);
        old.fetched_at = now_unix() - 600;
        cache.put(old);
        assert!(cache.is_stale("u1"));

        cache.put(snapshot("u1", None));
        assert!(!cache.is_stale("u1"));
        assert!(cache.is_stale("unknown"));
    }

    #[test]
    fn test_cold_start_loads_persisted_snapshot() {
        let storage: Arc<dyn StorageAdapter> = Arc::new(MemoryStorage::new());
        {
            let cache = EntitlementCache::new(storage.clone(), DEFAULT_SNAPSHOT_TTL);
            cache.put(snapshot("u1", Some("premium")));
        }

        // Fresh cache over the same storage, as after a process restart.
        let cache = EntitlementCache::new(storage, DEFAULT_SNAPSHOT_TTL);
        let restored = cache.get("u1").unwrap();
        assert!(restored.is_entitled_to("premium"));
    }
}
