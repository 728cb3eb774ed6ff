//! Type definitions for the purchases SDK.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current wall-clock time as unix seconds.
pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A named right (e.g. "premium") derived from one or more purchases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    /// Whether the entitlement currently grants access
    pub is_active: bool,
    /// When access ends (unix seconds, None = no expiration)
    pub expiration_date: Option<i64>,
    /// Product that granted this entitlement
    pub product_identifier: String,
}

/// Immutable point-in-time view of a user's entitlements.
///
/// Snapshots are replaced wholesale, never mutated in place. The version
/// token is an opaque conditional-refetch value; equality of two snapshots
/// is decided by the entitlement map, not the token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementSnapshot {
    /// User this snapshot belongs to
    pub user_id: String,
    /// Entitlement name -> entitlement state
    pub entitlements: HashMap<String, Entitlement>,
    /// When the snapshot was fetched (unix seconds)
    pub fetched_at: i64,
    /// Opaque version token (ETag-like) from the backend
    pub version_token: Option<String>,
}

impl EntitlementSnapshot {
    /// An empty snapshot for a user with no purchases.
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            entitlements: HashMap::new(),
            fetched_at: now_unix(),
            version_token: None,
        }
    }

    /// Whether the named entitlement is currently active.
    pub fn is_entitled_to(&self, name: &str) -> bool {
        self.entitlements.get(name).map(|e| e.is_active).unwrap_or(false)
    }

    /// Names of all currently active entitlements.
    pub fn active_entitlements(&self) -> Vec<&str> {
        self.entitlements
            .iter()
            .filter(|(_, e)| e.is_active)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Whether two snapshots carry the same entitlement state.
    ///
    /// Compares the entitlement map only; fetch time and version token are
    /// metadata, not state.
    pub fn same_entitlements(&self, other: &Self) -> bool {
        self.entitlements == other.entitlements
    }
}

/// A purchasable package inside an offering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    /// Package identifier (e.g. "$rc_monthly")
    pub identifier: String,
    /// Underlying store product identifier
    pub product_identifier: String,
}

/// A named group of packages configured on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offering {
    pub identifier: String,
    pub packages: Vec<Package>,
}

/// All offerings configured for the current user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offerings {
    /// Identifier of the offering marked current on the backend
    pub current_offering_id: Option<String>,
    /// Offering identifier -> offering
    pub offerings: HashMap<String, Offering>,
}

impl Offerings {
    /// The offering marked current on the backend, if any.
    pub fn current(&self) -> Option<&Offering> {
        self.current_offering_id
            .as_deref()
            .and_then(|id| self.offerings.get(id))
    }

    /// Look up an offering by identifier.
    pub fn offering(&self, identifier: &str) -> Option<&Offering> {
        self.offerings.get(identifier)
    }
}

// ==================== Wire Responses ====================

/// Backend representation of a subscriber's entitlement state.
///
/// Entitlement entries arrive as loosely-typed JSON; each entry is decoded
/// individually so one unparsable record drops that entry, not the whole
/// snapshot.
#[derive(Debug, Deserialize)]
pub(crate) struct SubscriberResponse {
    pub app_user_id: String,
    #[serde(default)]
    pub entitlements: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub etag: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EntitlementEntry {
    is_active: bool,
    expires_at: Option<i64>,
    product_id: String,
}

impl SubscriberResponse {
    pub(crate) fn into_snapshot(self) -> EntitlementSnapshot {
        let mut entitlements = HashMap::with_capacity(self.entitlements.len());

        for (name, raw) in self.entitlements {
            match serde_json::from_value::<EntitlementEntry>(raw) {
                Ok(entry) => {
                    entitlements.insert(
                        name,
                        Entitlement {
                            is_active: entry.is_active,
                            expiration_date: entry.expires_at,
                            product_identifier: entry.product_id,
                        },
                    );
                }
                Err(err) => {
                    tracing::warn!(entitlement = %name, %err, "skipping unparsable entitlement entry");
                }
            }
        }

        EntitlementSnapshot {
            user_id: self.app_user_id,
            entitlements,
            fetched_at: now_unix(),
            version_token: self.etag,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct OfferingsResponse {
    #[serde(default)]
    pub current_offering_id: Option<String>,
    #[serde(default)]
    pub offerings: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OfferingEntry {
    identifier: String,
    #[serde(default)]
    packages: Vec<PackageEntry>,
}

#[derive(Debug, Deserialize)]
struct PackageEntry {
    identifier: String,
    product_id: String,
}

impl From<OfferingsResponse> for Offerings {
    fn from(r: OfferingsResponse) -> Self {
        let mut offerings = HashMap::with_capacity(r.offerings.len());

        for raw in r.offerings {
            match serde_json::from_value::<OfferingEntry>(raw) {
                Ok(entry) => {
                    offerings.insert(
                        entry.identifier.clone(),
                        Offering {
                            identifier: entry.identifier,
                            packages: entry
                                .packages
                                .into_iter()
                                .map(|p| Package {
                                    identifier: p.identifier,
                                    product_identifier: p.product_id,
                                })
                                .collect(),
                        },
                    );
                }
                Err(err) => {
                    tracing::warn!(%err, "skipping unparsable offering entry");
                }
            }
        }

        Self {
            current_offering_id: r.current_offering_id,
            offerings,
        }
    }
}

/// Per-key rejection from the attributes endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AttributeErrorEntry {
    pub key: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PostAttributesResponse {
    #[serde(default)]
    pub attribute_errors: Vec<AttributeErrorEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscriber_json() -> &'static str {
        r#"{
            "app_user_id": "u1",
            "entitlements": {
                "premium": { "is_active": true, "expires_at": 1900000000, "product_id": "com.app.monthly" },
                "broken": { "is_active": "yes" },
                "lapsed": { "is_active": false, "expires_at": 1500000000, "product_id": "com.app.annual" }
            },
            "etag": "v42"
        }"#
    }

    #[test]
    fn test_snapshot_decode_skips_unparsable_entries() {
        let response: SubscriberResponse = serde_json::from_str(subscriber_json()).unwrap();
        let snapshot = response.into_snapshot();

        assert_eq!(snapshot.user_id, "u1");
        assert_eq!(snapshot.entitlements.len(), 2);
        assert!(snapshot.is_entitled_to("premium"));
        assert!(!snapshot.is_entitled_to("lapsed"));
        assert!(!snapshot.entitlements.contains_key("broken"));
        assert_eq!(snapshot.version_token.as_deref(), Some("v42"));
    }

    #[test]
    fn test_same_entitlements_ignores_version_token() {
        let response: SubscriberResponse = serde_json::from_str(subscriber_json()).unwrap();
        let a = response.into_snapshot();
        let mut b = a.clone();
        b.version_token = Some("v43".into());
        b.fetched_at += 60;

        assert!(a.same_entitlements(&b));

        b.entitlements.remove("premium");
        assert!(!a.same_entitlements(&b));
    }

    #[test]
    fn test_offerings_decode() {
        let json = r#"{
            "current_offering_id": "offering_a",
            "offerings": [
                {
                    "identifier": "offering_a",
                    "packages": [
                        { "identifier": "$rc_monthly", "product_id": "com.app.monthly" },
                        { "identifier": "$rc_annual", "product_id": "com.app.annual" }
                    ]
                },
                { "identifier": 7 }
            ]
        }"#;

        let response: OfferingsResponse = serde_json::from_str(json).unwrap();
        let offerings: Offerings = response.into();

        assert_eq!(offerings.offerings.len(), 1);
        let current = offerings.current().expect("current offering");
        assert_eq!(current.identifier, "offering_a");
        assert_eq!(current.packages.len(), 2);
        assert_eq!(current.packages[0].identifier, "$rc_monthly");
    }

    #[test]
    fn test_active_entitlements() {
        let response: SubscriberResponse = serde_json::from_str(subscriber_json()).unwrap();
        let snapshot = response.into_snapshot();
        assert_eq!(snapshot.active_entitlements(), vec!["premium"]);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = EntitlementSnapshot::empty("anon-123");
        assert!(snapshot.entitlements.is_empty());
        assert!(snapshot.active_entitlements().is_empty());
        assert_eq!(snapshot.user_id, "anon-123");
    }
}
