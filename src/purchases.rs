//! Top-level purchases client.
//!
//! One explicitly constructed instance per logical session owns the identity
//! manager, entitlement cache, purchase orchestrator, and attribute queue.
//! There is no global shared state: callers hold the instance and every
//! operation runs against its collaborators.

use std::sync::Arc;
use std::time::Duration;

use crate::attributes::{AttributeSyncFailure, AttributeSyncQueue};
use crate::backend::BackendClient;
use crate::cache::{EntitlementCache, EntitlementsObserver, DEFAULT_SNAPSHOT_TTL};
use crate::error::{ErrorCode, PurchasesError, Result};
use crate::identity::{generate_anonymous_id, is_anonymous, IdentityManager};
use crate::purchase::{PurchaseOrchestrator, PurchaseSuccess, StoreAdapter};
use crate::storage::{MemoryStorage, StorageAdapter};
use crate::transport::{HttpTransport, Transport};
use crate::types::{EntitlementSnapshot, Offerings};

/// Default backend API URL
pub const DEFAULT_BASE_URL: &str = "https://api.purchases.dev";

/// Configuration options for the purchases client
#[derive(Clone, Default)]
pub struct PurchasesOptions {
    /// Backend URL (default: [`DEFAULT_BASE_URL`])
    pub base_url: Option<String>,
    /// Custom storage adapter (default: `MemoryStorage`)
    pub storage: Option<Arc<dyn StorageAdapter>>,
    /// Custom transport (default: reqwest-backed `HttpTransport`)
    pub transport: Option<Arc<dyn Transport>>,
    /// App-assigned user ID to start as, when the host app already knows it
    /// (default: restore the persisted user or generate an anonymous one)
    pub app_user_id: Option<String>,
    /// Time-to-live for cached entitlement snapshots (default: 5 minutes)
    pub entitlement_ttl: Option<Duration>,
}

impl std::fmt::Debug for PurchasesOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurchasesOptions")
            .field("base_url", &self.base_url)
            .field("app_user_id", &self.app_user_id)
            .field("entitlement_ttl", &self.entitlement_ttl)
            .finish_non_exhaustive()
    }
}

/// Purchases client.
///
/// Mediates between the platform store (via a [`StoreAdapter`]) and the
/// remote entitlement backend, keeping a consistent local view of what the
/// current user is entitled to.
///
/// # Example
/// ```rust,ignore
/// use purchases_sdk::{Purchases, PurchasesOptions};
///
/// let purchases = Purchases::new("your-api-key", store, Default::default())?;
///
/// // Current entitlements (cached when fresh)
/// let snapshot = purchases.get_or_refresh_entitlements(false).await?;
/// if snapshot.is_entitled_to("premium") {
///     unlock_premium();
/// }
///
/// // Buy a product and reconcile entitlements
/// let success = purchases.purchase("com.app.monthly", None).await?;
/// ```
pub struct Purchases {
    identity: IdentityManager,
    backend: Arc<BackendClient>,
    cache: Arc<EntitlementCache>,
    orchestrator: PurchaseOrchestrator,
    attributes: AttributeSyncQueue,
}

impl Purchases {
    /// Create a new purchases client.
    ///
    /// # Arguments
    /// * `api_key` - Backend API key for this app
    /// * `store` - Platform purchase surface
    /// * `options` - Optional configuration
    pub fn new(
        api_key: &str,
        store: Arc<dyn StoreAdapter>,
        options: PurchasesOptions,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(PurchasesError::new(
                ErrorCode::ClientRequestError,
                "api_key is required",
            ));
        }

        let base_url = options
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let storage: Arc<dyn StorageAdapter> = options
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        let transport: Arc<dyn Transport> = match options.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::new(&base_url, api_key)
                    .map_err(|e| PurchasesError::network(e.message))?,
            ),
        };

        let backend = Arc::new(BackendClient::new(transport));
        let cache = Arc::new(EntitlementCache::new(
            storage.clone(),
            options.entitlement_ttl.unwrap_or(DEFAULT_SNAPSHOT_TTL),
        ));
        let identity = IdentityManager::new(storage.clone(), options.app_user_id);
        let orchestrator = PurchaseOrchestrator::new(store, backend.clone(), cache.clone());
        let attributes = AttributeSyncQueue::new(backend.clone(), storage);

        Ok(Self {
            identity,
            backend,
            cache,
            orchestrator,
            attributes,
        })
    }

    // ==================== Identity ====================

    /// The current user identifier.
    pub fn current_user_id(&self) -> String {
        self.identity.current_user_id()
    }

    /// Whether the current user is a locally generated anonymous one.
    pub fn current_user_is_anonymous(&self) -> bool {
        self.identity.current_user_is_anonymous()
    }

    /// Switch the current user to an app-assigned identifier.
    ///
    /// Returns the identified user's entitlement snapshot (fetched from the
    /// backend, never from cache) and whether the backend created the user
    /// on this call. Logging in with the already-current identified user is
    /// a no-op reporting `created == false`.
    ///
    /// Purchases made by the previous (anonymous) user are not transferred;
    /// only an explicit [`restore_purchases`](Self::restore_purchases) run
    /// as the identified user pulls device purchases in.
    pub async fn log_in(&self, new_user_id: &str) -> Result<(EntitlementSnapshot, bool)> {
        let new_user_id = new_user_id.trim();
        if new_user_id.is_empty() {
            return Err(PurchasesError::missing_user_id());
        }

        let current = self.identity.current_user_id();
        if current == new_user_id && !is_anonymous(new_user_id) {
            let snapshot = match self.cache.get(new_user_id) {
                Some(snapshot) => snapshot,
                None => {
                    let snapshot = self.backend.get_customer_info(new_user_id).await?;
                    self.cache.put(snapshot.clone());
                    snapshot
                }
            };
            return Ok((snapshot, false));
        }

        self.identity.set_current(new_user_id);
        let (snapshot, created) = self.backend.log_in(new_user_id).await?;
        self.cache.put(snapshot.clone());

        tracing::debug!(user = %new_user_id, created, "logged in");
        Ok((snapshot, created))
    }

    /// Log the identified user out, switching to a fresh anonymous user.
    ///
    /// The previous user's cached snapshot is marked stale but stays
    /// addressable, so a later `log_in` with the same identifier re-fetches
    /// rather than serving old data. Returns the new anonymous user's empty
    /// snapshot.
    pub async fn log_out(&self) -> Result<EntitlementSnapshot> {
        let current = self.identity.current_user_id();
        if is_anonymous(&current) {
            return Err(PurchasesError::new(
                ErrorCode::ClientRequestError,
                "log_out called while the current user is anonymous",
            ));
        }

        self.cache.invalidate(&current);

        let anonymous_id = generate_anonymous_id();
        self.identity.set_current(&anonymous_id);

        let snapshot = EntitlementSnapshot::empty(&anonymous_id);
        self.cache.put(snapshot.clone());

        tracing::debug!(previous = %current, "logged out to anonymous user");
        Ok(snapshot)
    }

    // ==================== Entitlements ====================

    /// The current user's entitlement snapshot.
    ///
    /// With `force_refresh == false` a fresh cached snapshot is returned
    /// without a network call; a stale or missing one triggers a backend
    /// fetch, and if that fetch fails with a retryable error while a stale
    /// snapshot exists, the stale snapshot is returned instead of the error.
    /// With `force_refresh == true` the cache is bypassed and errors always
    /// propagate.
    pub async fn get_or_refresh_entitlements(
        &self,
        force_refresh: bool,
    ) -> Result<EntitlementSnapshot> {
        let user_id = self.identity.current_user_id();

        if !force_refresh && !self.cache.is_stale(&user_id) {
            if let Some(snapshot) = self.cache.get(&user_id) {
                tracing::debug!(user = %user_id, "serving entitlements from cache");
                return Ok(snapshot);
            }
        }

        match self.backend.get_customer_info(&user_id).await {
            Ok(snapshot) => {
                self.cache.put(snapshot.clone());
                Ok(snapshot)
            }
            Err(err) if !force_refresh && err.is_retryable() => {
                match self.cache.get(&user_id) {
                    Some(stale) => {
                        tracing::warn!(user = %user_id, %err, "refresh failed; serving stale snapshot");
                        Ok(stale)
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Force a backend refresh of the current user's entitlements.
    ///
    /// This is the explicit restore path: entitlements from device purchases
    /// made before a login become visible to the now-current user here, not
    /// automatically at login.
    pub async fn restore_purchases(&self) -> Result<EntitlementSnapshot> {
        self.get_or_refresh_entitlements(true).await
    }

    /// Register a callback invoked whenever a cache update changes a user's
    /// entitlement state. Receives the previous snapshot (None on first
    /// population) and the new one.
    pub fn on_entitlements_changed(&self, observer: EntitlementsObserver) {
        self.cache.add_observer(observer);
    }

    // ==================== Offerings & Purchases ====================

    /// Fetch the offerings configured for the current user.
    pub async fn get_offerings(&self) -> Result<Offerings> {
        self.backend
            .get_offerings(&self.identity.current_user_id())
            .await
    }

    /// Purchase a product, optionally with a promotional offer.
    ///
    /// On success the returned snapshot already reflects the purchase and
    /// the platform transaction has been finalized. Cancellation and
    /// deferral surface as [`ErrorCode::PurchaseCancelled`] and
    /// [`ErrorCode::PurchaseDeferred`]; both leave the product free for a
    /// later attempt.
    pub async fn purchase(
        &self,
        product_id: &str,
        offer_id: Option<&str>,
    ) -> Result<PurchaseSuccess> {
        self.orchestrator
            .purchase(&self.identity.current_user_id(), product_id, offer_id)
            .await
    }

    // ==================== Attributes ====================

    /// Set (or, with `None`, delete) an attribute for the current user.
    /// Queued locally until the next sync.
    pub fn set_attribute(&self, key: &str, value: Option<String>) {
        self.attributes
            .set(&self.identity.current_user_id(), key, value);
    }

    /// Flush pending attributes for the current user. Returns per-key
    /// rejections; a no-op (nothing pending) makes no network call.
    pub async fn sync_attributes_if_needed(&self) -> Result<Vec<AttributeSyncFailure>> {
        self.attributes
            .sync_if_needed(&self.identity.current_user_id())
            .await
    }

    /// Flush pending attributes for every known user, not just the current
    /// one.
    pub async fn sync_all_pending_attributes(
        &self,
    ) -> Vec<(String, Result<Vec<AttributeSyncFailure>>)> {
        self.attributes.sync_all_users().await
    }
}

impl std::fmt::Debug for Purchases {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Purchases")
            .field("current_user", &self.identity.current_user_id())
            .finish_non_exhaustive()
    }
}
