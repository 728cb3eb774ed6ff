//! Typed backend client.
//!
//! One method per remote operation. Every call derives a request key from
//! the endpoint plus all parameters that affect the response (notably the
//! user identifier), routes through the request deduplicator, decodes the
//! body into the expected shape, and maps HTTP status outcomes onto the SDK
//! error taxonomy. Blank user identifiers are rejected locally and never
//! sent over the wire.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::dedup::RequestDeduplicator;
use crate::error::{map_status_to_error_code, ErrorCode, PurchasesError, Result};
use crate::transport::{HttpRequest, HttpResponse, Method, Transport};
use crate::types::{
    now_unix, AttributeErrorEntry, EntitlementSnapshot, Offerings, OfferingsResponse,
    PostAttributesResponse, SubscriberResponse,
};

/// How long a fetched offerings payload stays fresh.
const OFFERINGS_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Serialize)]
struct ReceiptRequest<'a> {
    app_user_id: &'a str,
    product_id: &'a str,
    receipt_data: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    offer_id: Option<&'a str>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    app_user_id: &'a str,
}

#[derive(Serialize)]
struct AttributeValue<'a> {
    value: Option<&'a str>,
}

#[derive(Serialize)]
struct AttributesRequest<'a> {
    attributes: HashMap<&'a str, AttributeValue<'a>>,
}

/// Error body shape the backend uses for failed requests.
#[derive(serde::Deserialize)]
struct ErrorBody {
    error: Option<String>,
    details: Option<String>,
}

struct CachedOfferings {
    offerings: Offerings,
    fetched_at: i64,
}

/// Client for the remote entitlement backend.
pub struct BackendClient {
    transport: Arc<dyn Transport>,
    dedup: RequestDeduplicator,
    offerings_cache: Mutex<HashMap<String, CachedOfferings>>,
}

impl BackendClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            dedup: RequestDeduplicator::new(),
            offerings_cache: Mutex::new(HashMap::new()),
        }
    }

    // ==================== Remote Operations ====================

    /// Fetch the offerings configured for `user_id`.
    ///
    /// Consults the offerings cache first; a fresh entry is returned without
    /// a network call. The cache is populated only after a verified
    /// successful response.
    pub async fn get_offerings(&self, user_id: &str) -> Result<Offerings> {
        validate_user(user_id)?;
        let request = HttpRequest::get(format!("/v1/offerings?user={user_id}"), user_id);
        let key = request_key(&request);

        if let Ok(cache) = self.offerings_cache.lock() {
            if let Some(entry) = cache.get(&key) {
                let age = now_unix().saturating_sub(entry.fetched_at);
                if age < OFFERINGS_TTL.as_secs() as i64 {
                    tracing::debug!(user = %user_id, "serving offerings from cache");
                    return Ok(entry.offerings.clone());
                }
            }
        }

        let response: OfferingsResponse = self.request(&key, request).await?;
        let offerings: Offerings = response.into();

        if let Ok(mut cache) = self.offerings_cache.lock() {
            cache.insert(
                key,
                CachedOfferings {
                    offerings: offerings.clone(),
                    fetched_at: now_unix(),
                },
            );
        }

        Ok(offerings)
    }

    /// Fetch the entitlement snapshot for `user_id` from the backend.
    ///
    /// Always hits the network (snapshot caching lives in the entitlement
    /// cache, which decides when a refresh is needed).
    pub async fn get_customer_info(&self, user_id: &str) -> Result<EntitlementSnapshot> {
        validate_user(user_id)?;
        let request = HttpRequest::get(format!("/v1/subscribers/{user_id}"), user_id);
        let key = request_key(&request);

        let response: SubscriberResponse = self.request(&key, request).await?;
        Ok(response.into_snapshot())
    }

    /// Post receipt data from a confirmed platform transaction.
    ///
    /// Never served from cache. A transport-level failure is reported as
    /// [`ErrorCode::ReceiptPostFailed`] so the caller knows the transaction
    /// must stay unfinalized.
    pub async fn post_receipt(
        &self,
        user_id: &str,
        product_id: &str,
        receipt_data: &str,
        offer_id: Option<&str>,
    ) -> Result<EntitlementSnapshot> {
        validate_user(user_id)?;
        let body = encode_body(&ReceiptRequest {
            app_user_id: user_id,
            product_id,
            receipt_data,
            offer_id,
        })?;
        let request = HttpRequest::post("/v1/receipts", user_id, body);
        let key = request_key(&request);

        let response: SubscriberResponse = self.request(&key, request).await.map_err(|err| {
            if err.is_retryable() {
                PurchasesError::new(
                    ErrorCode::ReceiptPostFailed,
                    format!("receipt post failed: {err}"),
                )
            } else {
                err
            }
        })?;
        Ok(response.into_snapshot())
    }

    /// Post a batch of subscriber attributes.
    ///
    /// Returns the per-key rejections (empty on full success). A response
    /// carrying `attribute_errors` is a per-key outcome even when the status
    /// is 400; only statuses without that shape become batch failures.
    pub async fn post_attributes(
        &self,
        user_id: &str,
        attributes: &HashMap<String, Option<String>>,
    ) -> Result<Vec<AttributeErrorEntry>> {
        validate_user(user_id)?;
        let body = encode_body(&AttributesRequest {
            attributes: attributes
                .iter()
                .map(|(key, value)| (key.as_str(), AttributeValue { value: value.as_deref() }))
                .collect(),
        })?;
        let request = HttpRequest::post(
            format!("/v1/subscribers/{user_id}/attributes"),
            user_id,
            body,
        );
        let key = request_key(&request);

        let response = self.send(&key, request).await?;

        if response.is_success() || response.status == 400 {
            if let Ok(decoded) = serde_json::from_slice::<PostAttributesResponse>(&response.body) {
                if response.is_success() || !decoded.attribute_errors.is_empty() {
                    return Ok(decoded.attribute_errors);
                }
            }
        }
        if response.is_success() {
            return Err(PurchasesError::malformed(
                "attributes response did not match expected shape",
            ));
        }
        Err(error_from_response(&response))
    }

    /// Identify the user to the backend, fetching its entitlement snapshot.
    ///
    /// Returns the snapshot and whether the backend created the user on this
    /// call (HTTP 201) rather than finding an existing record (HTTP 200).
    pub async fn log_in(&self, user_id: &str) -> Result<(EntitlementSnapshot, bool)> {
        validate_user(user_id)?;
        let body = encode_body(&LoginRequest { app_user_id: user_id })?;
        let request = HttpRequest::post(format!("/v1/subscribers/{user_id}/login"), user_id, body);
        let key = request_key(&request);

        let response = self.send(&key, request).await?;
        let created = response.status == 201;
        let decoded: SubscriberResponse = decode_success(&response)?;
        Ok((decoded.into_snapshot(), created))
    }

    // ==================== Internal Helpers ====================

    async fn request<T: DeserializeOwned>(&self, key: &str, request: HttpRequest) -> Result<T> {
        let response = self.send(key, request).await?;
        decode_success(&response)
    }

    /// Route one request through the deduplicator and transport.
    async fn send(&self, key: &str, request: HttpRequest) -> Result<HttpResponse> {
        let transport = self.transport.clone();
        self.dedup
            .execute(key, move || async move {
                transport
                    .send(request)
                    .await
                    .map_err(|e| PurchasesError::network(e.message))
            })
            .await
    }
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient").finish_non_exhaustive()
    }
}

/// Reject empty or blank user identifiers before any wire activity.
fn validate_user(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(PurchasesError::missing_user_id());
    }
    Ok(())
}

/// Identity of a cacheable/dedupable request.
///
/// Method + path (parameters included) + user, plus a digest of the body for
/// POSTs so distinct payloads never share an in-flight slot.
fn request_key(request: &HttpRequest) -> String {
    let user = request.user_id.as_deref().unwrap_or("");
    match &request.body {
        Some(body) => {
            let mut hasher = DefaultHasher::new();
            body.hash(&mut hasher);
            format!(
                "{} {} user={} body={:016x}",
                request.method,
                request.path,
                user,
                hasher.finish()
            )
        }
        None => format!("{} {} user={}", request.method, request.path, user),
    }
}

fn encode_body<B: Serialize>(body: &B) -> Result<Vec<u8>> {
    serde_json::to_vec(body).map_err(|e| {
        PurchasesError::new(
            ErrorCode::ClientRequestError,
            format!("failed to encode request body: {e}"),
        )
    })
}

fn decode_success<T: DeserializeOwned>(response: &HttpResponse) -> Result<T> {
    if !response.is_success() {
        return Err(error_from_response(response));
    }
    serde_json::from_slice(&response.body)
        .map_err(|e| PurchasesError::malformed(format!("failed to decode response: {e}")))
}

fn error_from_response(response: &HttpResponse) -> PurchasesError {
    let parsed: ErrorBody = serde_json::from_slice(&response.body).unwrap_or(ErrorBody {
        error: None,
        details: None,
    });

    let message = match (parsed.error, parsed.details) {
        (Some(error), Some(details)) => format!("{error}: {details}"),
        (Some(error), None) => error,
        (None, Some(details)) => details,
        (None, None) => format!("request failed with status {}", response.status),
    };

    PurchasesError::with_status(map_status_to_error_code(response.status), message, response.status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_request(path: &str, user: &str) -> HttpRequest {
        HttpRequest::get(path, user)
    }

    #[test]
    fn test_request_key_separates_users() {
        let a = request_key(&get_request("/v1/subscribers/u1", "u1"));
        let b = request_key(&get_request("/v1/subscribers/u2", "u2"));
        assert_ne!(a, b);

        let a2 = request_key(&get_request("/v1/subscribers/u1", "u1"));
        assert_eq!(a, a2);
    }

    #[test]
    fn test_request_key_separates_bodies() {
        let a = request_key(&HttpRequest::post("/v1/receipts", "u1", b"{\"p\":1}".to_vec()));
        let b = request_key(&HttpRequest::post("/v1/receipts", "u1", b"{\"p\":2}".to_vec()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_validate_user_rejects_blank() {
        assert!(validate_user("").is_err());
        assert!(validate_user("   ").is_err());
        assert!(validate_user("u1").is_ok());

        let err = validate_user("").unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingUserIdentifier);
    }

    #[test]
    fn test_error_from_response_uses_backend_message() {
        let response = HttpResponse {
            status: 404,
            body: br#"{"error":"Not found","details":"unknown subscriber"}"#.to_vec(),
        };
        let err = error_from_response(&response);
        assert_eq!(err.code(), ErrorCode::ClientRequestError);
        assert_eq!(err.status(), Some(404));
        assert!(err.message().contains("unknown subscriber"));
    }

    #[test]
    fn test_decode_failure_is_malformed() {
        let response = HttpResponse {
            status: 200,
            body: b"not json".to_vec(),
        };
        let err = decode_success::<SubscriberResponse>(&response).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedResponse);
    }
}
