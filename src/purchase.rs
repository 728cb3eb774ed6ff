//! Purchase orchestration.
//!
//! Drives one purchase attempt from initiation through platform
//! confirmation to entitlement reconciliation. The platform transaction is
//! finalized only after the entitlement cache reflects the purchase;
//! finalizing earlier risks losing the entitlement on a crash between the
//! two steps. On a receipt-post failure the transaction is left unfinalized
//! so the platform redelivers it and a later restore can reconcile without
//! re-charging the user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::backend::BackendClient;
use crate::cache::EntitlementCache;
use crate::error::{ErrorCode, PurchasesError, Result};
use crate::types::EntitlementSnapshot;

/// Reference to a platform transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreTransaction {
    /// Platform-assigned transaction identifier
    pub id: String,
    /// Product the transaction is for
    pub product_id: String,
}

/// Outcome of the platform purchase flow.
#[derive(Debug, Clone)]
pub enum StorePurchaseResult {
    /// The platform confirmed the purchase.
    Purchased {
        transaction: StoreTransaction,
        /// Opaque receipt data to post to the backend
        receipt_data: String,
    },
    /// The purchase needs external approval (e.g. ask-to-buy) and may
    /// complete later.
    Deferred,
    /// The user backed out of the purchase flow.
    Cancelled,
    /// The platform reported an error.
    Failed(String),
}

/// Native purchase surface consumed by the orchestrator.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Run the platform purchase flow for a product, optionally with a
    /// promotional offer.
    async fn purchase(&self, product_id: &str, offer_id: Option<&str>) -> StorePurchaseResult;

    /// Finalize (acknowledge/finish) a confirmed transaction so the platform
    /// stops redelivering it.
    async fn finalize(&self, transaction: &StoreTransaction);
}

/// States a purchase attempt moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseState {
    Initiating,
    AwaitingPlatformResult,
    PostingReceipt,
    Reconciling,
}

/// A completed purchase: the reconciled snapshot plus the raw transaction
/// reference.
#[derive(Debug, Clone)]
pub struct PurchaseSuccess {
    pub snapshot: EntitlementSnapshot,
    pub transaction: StoreTransaction,
}

/// State machine driving purchase attempts.
///
/// Exactly one attempt per product identifier may be in flight; attempts for
/// different products proceed concurrently and independently.
pub struct PurchaseOrchestrator {
    store: Arc<dyn StoreAdapter>,
    backend: Arc<BackendClient>,
    cache: Arc<EntitlementCache>,
    active: Mutex<HashMap<String, PurchaseState>>,
}

impl PurchaseOrchestrator {
    pub fn new(
        store: Arc<dyn StoreAdapter>,
        backend: Arc<BackendClient>,
        cache: Arc<EntitlementCache>,
    ) -> Self {
        Self {
            store,
            backend,
            cache,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Purchase a product for `user_id`, reconciling entitlements on
    /// success.
    pub async fn purchase(
        &self,
        user_id: &str,
        product_id: &str,
        offer_id: Option<&str>,
    ) -> Result<PurchaseSuccess> {
        self.begin_attempt(product_id)?;
        let result = self.run_attempt(user_id, product_id, offer_id).await;
        self.clear_attempt(product_id);
        result
    }

    async fn run_attempt(
        &self,
        user_id: &str,
        product_id: &str,
        offer_id: Option<&str>,
    ) -> Result<PurchaseSuccess> {
        self.set_state(product_id, PurchaseState::AwaitingPlatformResult);

        let (transaction, receipt_data) = match self.store.purchase(product_id, offer_id).await {
            StorePurchaseResult::Purchased {
                transaction,
                receipt_data,
            } => (transaction, receipt_data),
            StorePurchaseResult::Deferred => {
                tracing::debug!(product = %product_id, "purchase deferred by platform");
                return Err(PurchasesError::new(
                    ErrorCode::PurchaseDeferred,
                    format!("purchase of {product_id} is pending external approval"),
                ));
            }
            StorePurchaseResult::Cancelled => {
                return Err(PurchasesError::new(
                    ErrorCode::PurchaseCancelled,
                    format!("purchase of {product_id} was cancelled by the user"),
                ));
            }
            StorePurchaseResult::Failed(message) => {
                return Err(PurchasesError::new(
                    ErrorCode::ClientRequestError,
                    format!("platform purchase failed: {message}"),
                ));
            }
        };

        self.set_state(product_id, PurchaseState::PostingReceipt);

        // Forced, non-cached call. On failure the transaction stays
        // unfinalized so the platform will redeliver it.
        let snapshot = self
            .backend
            .post_receipt(user_id, product_id, &receipt_data, offer_id)
            .await
            .map_err(|err| {
                tracing::warn!(
                    product = %product_id,
                    transaction = %transaction.id,
                    %err,
                    "receipt post failed; transaction left unfinalized"
                );
                err
            })?;

        self.set_state(product_id, PurchaseState::Reconciling);

        // The cache must reflect the purchase before the platform is told to
        // finish the transaction.
        self.cache.put(snapshot.clone());
        self.store.finalize(&transaction).await;

        Ok(PurchaseSuccess {
            snapshot,
            transaction,
        })
    }

    fn begin_attempt(&self, product_id: &str) -> Result<()> {
        let mut active = match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if active.contains_key(product_id) {
            return Err(PurchasesError::new(
                ErrorCode::PurchaseAlreadyInProgress,
                format!("a purchase of {product_id} is already in progress"),
            ));
        }

        active.insert(product_id.to_string(), PurchaseState::Initiating);
        Ok(())
    }

    fn set_state(&self, product_id: &str, state: PurchaseState) {
        if let Ok(mut active) = self.active.lock() {
            if let Some(attempt) = active.get_mut(product_id) {
                *attempt = state;
            }
        }
    }

    fn clear_attempt(&self, product_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(product_id);
        }
    }

    /// Current state of the attempt for a product, if one is active.
    pub fn attempt_state(&self, product_id: &str) -> Option<PurchaseState> {
        self.active
            .lock()
            .ok()
            .and_then(|active| active.get(product_id).copied())
    }
}

impl std::fmt::Debug for PurchaseOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurchaseOrchestrator").finish_non_exhaustive()
    }
}
