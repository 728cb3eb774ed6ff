//! User identity management.
//!
//! Owns the current user identifier and its persistence across process
//! restarts. Anonymous identifiers are generated locally with a fixed
//! recognizable prefix so callers and the backend can distinguish them from
//! app-assigned account IDs structurally.

use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::storage::{keys, StorageAdapter};

/// Prefix marking locally generated anonymous user identifiers.
pub const ANONYMOUS_ID_PREFIX: &str = "anon";

/// Generate a fresh anonymous user identifier: `anon-<uuid-v4>`.
pub fn generate_anonymous_id() -> String {
    format!("{}-{}", ANONYMOUS_ID_PREFIX, Uuid::new_v4())
}

/// Whether an identifier is a locally generated anonymous one.
pub fn is_anonymous(user_id: &str) -> bool {
    let Some(rest) = user_id.strip_prefix(ANONYMOUS_ID_PREFIX) else {
        return false;
    };
    let Some(uuid_part) = rest.strip_prefix('-') else {
        return false;
    };
    Uuid::parse_str(uuid_part).is_ok()
}

/// Owner of the current user identifier.
///
/// Exactly one identifier is current at any time. The pointer is serialized
/// behind a mutex and written through to storage on every change, so a
/// restarted process resumes as the same user.
pub struct IdentityManager {
    storage: Arc<dyn StorageAdapter>,
    current: Mutex<String>,
}

impl IdentityManager {
    /// Restore the persisted current user, or fall back to `initial_user_id`
    /// (when the host app already knows its account ID) or a freshly
    /// generated anonymous identifier.
    pub fn new(storage: Arc<dyn StorageAdapter>, initial_user_id: Option<String>) -> Self {
        let current = storage
            .get(keys::CURRENT_USER)
            .filter(|id| !id.trim().is_empty())
            .or(initial_user_id.filter(|id| !id.trim().is_empty()))
            .unwrap_or_else(generate_anonymous_id);

        storage.set(keys::CURRENT_USER, &current);

        Self {
            storage,
            current: Mutex::new(current),
        }
    }

    /// The current user identifier.
    pub fn current_user_id(&self) -> String {
        match self.current.lock() {
            Ok(current) => current.clone(),
            // A poisoned lock can only leave a previously valid ID in place.
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Whether the current user is anonymous.
    pub fn current_user_is_anonymous(&self) -> bool {
        is_anonymous(&self.current_user_id())
    }

    /// Make `user_id` current and persist it.
    pub(crate) fn set_current(&self, user_id: &str) {
        if let Ok(mut current) = self.current.lock() {
            *current = user_id.to_string();
            self.storage.set(keys::CURRENT_USER, user_id);
        }
    }
}

impl std::fmt::Debug for IdentityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityManager")
            .field("current", &self.current_user_id())
            .finish_non_exhaustive()
    }
}
