//! # Purchases SDK
//!
//! Client-side engine for subscription and purchase management: it mediates
//! between a platform purchase surface and a remote entitlement backend,
//! keeping a consistent local view of what the current user is entitled to
//! under concurrent requests, intermittent connectivity, and user identity
//! changes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use purchases_sdk::{Purchases, PurchasesOptions, StoreAdapter};
//!
//! # async fn run(store: Arc<dyn StoreAdapter>) -> Result<(), Box<dyn std::error::Error>> {
//! let purchases = Purchases::new("your-api-key", store, PurchasesOptions {
//!     base_url: Some("https://api.myapp.com".into()),
//!     ..Default::default()
//! })?;
//!
//! // Entitlement checks hit the cache when it is fresh
//! let snapshot = purchases.get_or_refresh_entitlements(false).await?;
//! if snapshot.is_entitled_to("premium") {
//!     println!("premium unlocked");
//! }
//!
//! // Buy a package from the current offering
//! let offerings = purchases.get_offerings().await?;
//! if let Some(package) = offerings.current().and_then(|o| o.packages.first()) {
//!     let success = purchases.purchase(&package.product_identifier, None).await?;
//!     println!("purchased, entitlements: {:?}", success.snapshot.active_entitlements());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Design
//!
//! - Concurrent identical backend calls are collapsed into one in-flight
//!   request; all callers share the result.
//! - Entitlement snapshots are cached per user with a TTL and served
//!   stale-while-revalidate; state-changing events (purchase, login,
//!   restore) always force a fresh fetch.
//! - Platform transactions are finalized only after the local entitlement
//!   state reflects them; a failed receipt post leaves the transaction
//!   pending for redelivery.
//! - Anonymous users get a locally generated `anon-<uuid>` identifier;
//!   login/logout switch the current user without destroying other users'
//!   cached state or pending attributes.

pub mod attributes;
pub mod backend;
pub mod cache;
pub mod dedup;
pub mod error;
pub mod identity;
pub mod purchase;
pub mod purchases;
pub mod storage;
pub mod transport;
pub mod types;

// Main client
pub use purchases::{Purchases, PurchasesOptions, DEFAULT_BASE_URL};

// Error types
pub use error::{map_status_to_error_code, ErrorCode, PurchasesError, Result};

// Core value types
pub use types::{Entitlement, EntitlementSnapshot, Offering, Offerings, Package};

// Purchase surface
pub use purchase::{
    PurchaseState, PurchaseSuccess, StoreAdapter, StorePurchaseResult, StoreTransaction,
};

// Attribute sync
pub use attributes::{AttributeSyncFailure, SyncState};

// Cache observation
pub use cache::{EntitlementsObserver, DEFAULT_SNAPSHOT_TTL};

// Identity helpers
pub use identity::{generate_anonymous_id, is_anonymous, ANONYMOUS_ID_PREFIX};

// Storage
pub use storage::{FileStorage, MemoryStorage, StorageAdapter};

// Transport seam
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, Transport, TransportError};
