//! Best-effort subscriber attribute sync queue.
//!
//! Attributes accumulate per (user, key) and flush to the backend as one
//! batched request. A per-key validation rejection fails only that key;
//! a transport failure reverts the whole batch to pending so the next call
//! retries it. Pending sets are persisted per user, so attributes set for a
//! user who is no longer current survive until that user is flushed again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::backend::BackendClient;
use crate::error::{ErrorCode, PurchasesError, Result};
use crate::storage::{keys, StorageAdapter};
use crate::types::now_unix;

/// Sync lifecycle of one pending attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Waiting to be flushed.
    Pending,
    /// Included in the batch currently being posted.
    InFlight,
    /// Accepted by the backend.
    Synced,
    /// Rejected by the backend; not retried automatically.
    Failed(String),
}

/// One attribute awaiting sync. `value: None` is a deletion marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAttribute {
    pub value: Option<String>,
    pub sync_state: SyncState,
    pub set_at: i64,
}

/// A per-key sync rejection surfaced to the caller.
#[derive(Debug, Clone)]
pub struct AttributeSyncFailure {
    pub key: String,
    pub error: PurchasesError,
}

type UserAttributes = HashMap<String, PendingAttribute>;

/// Queue of per-user attributes awaiting backend sync.
pub struct AttributeSyncQueue {
    backend: Arc<BackendClient>,
    storage: Arc<dyn StorageAdapter>,
    pending: Mutex<HashMap<String, UserAttributes>>,
}

impl AttributeSyncQueue {
    pub fn new(backend: Arc<BackendClient>, storage: Arc<dyn StorageAdapter>) -> Self {
        Self {
            backend,
            storage,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Set (or, with `None`, delete) an attribute for a user.
    ///
    /// Overwrites any value pending for the same key; the previous pending
    /// value is never sent.
    pub fn set(&self, user_id: &str, key: &str, value: Option<String>) {
        let mut pending = self.lock();
        let user_attrs = self.user_entry(&mut pending, user_id);
        user_attrs.insert(
            key.to_string(),
            PendingAttribute {
                value,
                sync_state: SyncState::Pending,
                set_at: now_unix(),
            },
        );
        self.persist(user_id, user_attrs);
    }

    /// Sync state of one attribute, if known.
    pub fn state(&self, user_id: &str, key: &str) -> Option<SyncState> {
        let mut pending = self.lock();
        let user_attrs = self.user_entry(&mut pending, user_id);
        user_attrs.get(key).map(|a| a.sync_state.clone())
    }

    /// Flush all pending attributes for `user_id` as one batch.
    ///
    /// Returns the per-key rejections. An empty pending set is an observable
    /// no-op: no network call is made. On transport failure every attribute
    /// in the batch reverts to pending and the error propagates.
    pub async fn sync_if_needed(&self, user_id: &str) -> Result<Vec<AttributeSyncFailure>> {
        let batch: HashMap<String, Option<String>> = {
            let mut pending = self.lock();
            let user_attrs = self.user_entry(&mut pending, user_id);

            let mut batch = HashMap::new();
            for (key, attr) in user_attrs.iter_mut() {
                if attr.sync_state == SyncState::Pending {
                    attr.sync_state = SyncState::InFlight;
                    batch.insert(key.clone(), attr.value.clone());
                }
            }
            batch
        };

        if batch.is_empty() {
            return Ok(Vec::new());
        }

        match self.backend.post_attributes(user_id, &batch).await {
            Ok(rejections) => {
                let mut failed: HashMap<String, String> = rejections
                    .into_iter()
                    .map(|r| (r.key, r.message))
                    .collect();

                let mut failures = Vec::new();
                let mut pending = self.lock();
                let user_attrs = self.user_entry(&mut pending, user_id);
                for key in batch.keys() {
                    let Some(attr) = user_attrs.get_mut(key) else {
                        continue;
                    };
                    // A value re-set during the flight stays pending.
                    if attr.sync_state != SyncState::InFlight {
                        continue;
                    }
                    match failed.remove(key) {
                        Some(message) => {
                            attr.sync_state = SyncState::Failed(message.clone());
                            failures.push(AttributeSyncFailure {
                                key: key.clone(),
                                error: PurchasesError::new(
                                    ErrorCode::InvalidAttributeValue,
                                    message,
                                ),
                            });
                        }
                        None => attr.sync_state = SyncState::Synced,
                    }
                }
                self.persist(user_id, user_attrs);
                Ok(failures)
            }
            Err(err) => {
                tracing::warn!(user = %user_id, %err, "attribute sync failed; batch reverts to pending");
                let mut pending = self.lock();
                let user_attrs = self.user_entry(&mut pending, user_id);
                for key in batch.keys() {
                    if let Some(attr) = user_attrs.get_mut(key) {
                        if attr.sync_state == SyncState::InFlight {
                            attr.sync_state = SyncState::Pending;
                        }
                    }
                }
                self.persist(user_id, user_attrs);
                Err(err)
            }
        }
    }

    /// Flush every user with a pending set loaded this session.
    ///
    /// Returns one result per flushed user.
    pub async fn sync_all_users(&self) -> Vec<(String, Result<Vec<AttributeSyncFailure>>)> {
        let users: Vec<String> = {
            let pending = self.lock();
            pending
                .iter()
                .filter(|(_, attrs)| {
                    attrs.values().any(|a| a.sync_state == SyncState::Pending)
                })
                .map(|(user, _)| user.clone())
                .collect()
        };

        let mut results = Vec::with_capacity(users.len());
        for user in users {
            let result = self.sync_if_needed(&user).await;
            results.push((user, result));
        }
        results
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, UserAttributes>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// In-memory pending map for a user, loaded from storage on first touch.
    fn user_entry<'a>(
        &self,
        pending: &'a mut MutexGuard<'_, HashMap<String, UserAttributes>>,
        user_id: &str,
    ) -> &'a mut UserAttributes {
        if !pending.contains_key(user_id) {
            let loaded = self
                .storage
                .get(&keys::attributes(user_id))
                .and_then(|blob| serde_json::from_str(&blob).ok())
                .unwrap_or_default();
            pending.insert(user_id.to_string(), loaded);
        }
        pending
            .get_mut(user_id)
            .unwrap_or_else(|| unreachable!("entry inserted above"))
    }

    fn persist(&self, user_id: &str, attrs: &UserAttributes) {
        if let Ok(blob) = serde_json::to_string(attrs) {
            self.storage.set(&keys::attributes(user_id), &blob);
        }
    }
}

impl std::fmt::Debug for AttributeSyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeSyncQueue").finish_non_exhaustive()
    }
}
