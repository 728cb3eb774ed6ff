//! Shared test helpers: scripted transport and store mocks plus canned
//! backend payloads.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use purchases_sdk::{
    HttpRequest, HttpResponse, Method, Purchases, PurchasesOptions, StorageAdapter,
    StoreAdapter, StorePurchaseResult, StoreTransaction, Transport, TransportError,
};

// ==================== MockTransport ====================

pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub user_id: Option<String>,
    pub body: Option<Vec<u8>>,
}

struct Route {
    method: Method,
    path_prefix: String,
    /// Responses popped in order; the last one repeats.
    responses: VecDeque<Result<HttpResponse, TransportError>>,
}

/// Scripted transport that records every request.
///
/// Routes match on method + path prefix (longest prefix wins). An optional
/// gate semaphore holds responses back so tests can keep calls in flight
/// deliberately.
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<RecordedRequest>>,
    gate: Option<Arc<Semaphore>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    /// A transport whose responses each wait for one gate permit.
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    /// Queue a JSON response for requests matching `method` + `path_prefix`.
    pub fn respond_json(&self, method: Method, path_prefix: &str, status: u16, body: &str) {
        self.push(
            method,
            path_prefix,
            Ok(HttpResponse {
                status,
                body: body.as_bytes().to_vec(),
            }),
        );
    }

    /// Queue a transport-level failure for requests matching the route.
    pub fn respond_error(&self, method: Method, path_prefix: &str, message: &str) {
        self.push(method, path_prefix, Err(TransportError::new(message)));
    }

    fn push(
        &self,
        method: Method,
        path_prefix: &str,
        response: Result<HttpResponse, TransportError>,
    ) {
        let mut routes = self.routes.lock().unwrap();
        if let Some(route) = routes
            .iter_mut()
            .find(|r| r.method == method && r.path_prefix == path_prefix)
        {
            route.responses.push_back(response);
            return;
        }
        routes.push(Route {
            method,
            path_prefix: path_prefix.to_string(),
            responses: VecDeque::from([response]),
        });
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| format!("{} {}", r.method, r.path))
            .collect()
    }

    /// Bodies of recorded requests whose path starts with `path_prefix`.
    pub fn bodies(&self, path_prefix: &str) -> Vec<Vec<u8>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path.starts_with(path_prefix))
            .filter_map(|r| r.body.clone())
            .collect()
    }

    /// Number of recorded requests whose path starts with `path_prefix`.
    pub fn request_count(&self, path_prefix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path.starts_with(path_prefix))
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            method: request.method,
            path: request.path.clone(),
            user_id: request.user_id.clone(),
            body: request.body.clone(),
        });

        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| TransportError::new("gate closed"))?;
            permit.forget();
        }

        let mut routes = self.routes.lock().unwrap();
        let route = routes
            .iter_mut()
            .filter(|r| r.method == request.method && request.path.starts_with(&r.path_prefix))
            .max_by_key(|r| r.path_prefix.len());

        match route {
            Some(route) => {
                if route.responses.len() > 1 {
                    route.responses.pop_front().expect("non-empty queue")
                } else {
                    route
                        .responses
                        .front()
                        .cloned()
                        .expect("route with no responses")
                }
            }
            None => Err(TransportError::new(format!(
                "unexpected request: {} {}",
                request.method, request.path
            ))),
        }
    }
}

// ==================== MockStore ====================

/// Scripted platform store. Purchases succeed by default with a generated
/// transaction; specific products can be scripted to cancel, defer, or fail.
pub struct MockStore {
    scripted: Mutex<VecDeque<(String, StorePurchaseResult)>>,
    finalized: Mutex<Vec<StoreTransaction>>,
    next_txn: Mutex<u64>,
    gate: Option<Arc<Semaphore>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            finalized: Mutex::new(Vec::new()),
            next_txn: Mutex::new(0),
            gate: None,
        }
    }

    /// A store whose purchase flow waits for one gate permit per call.
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    /// Script the next purchase of `product_id` to produce `result`.
    pub fn script(&self, product_id: &str, result: StorePurchaseResult) {
        self.scripted
            .lock()
            .unwrap()
            .push_back((product_id.to_string(), result));
    }

    pub fn finalized(&self) -> Vec<StoreTransaction> {
        self.finalized.lock().unwrap().clone()
    }
}

#[async_trait]
impl StoreAdapter for MockStore {
    async fn purchase(&self, product_id: &str, _offer_id: Option<&str>) -> StorePurchaseResult {
        if let Some(gate) = &self.gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return StorePurchaseResult::Failed("gate closed".into()),
            }
        }

        let scripted = {
            let mut scripted = self.scripted.lock().unwrap();
            scripted
                .iter()
                .position(|(p, _)| p == product_id)
                .and_then(|i| scripted.remove(i))
        };
        if let Some((_, result)) = scripted {
            return result;
        }

        let txn_id = {
            let mut next = self.next_txn.lock().unwrap();
            *next += 1;
            format!("txn-{}", *next)
        };
        StorePurchaseResult::Purchased {
            transaction: StoreTransaction {
                id: txn_id,
                product_id: product_id.to_string(),
            },
            receipt_data: format!("receipt-{product_id}"),
        }
    }

    async fn finalize(&self, transaction: &StoreTransaction) {
        self.finalized.lock().unwrap().push(transaction.clone());
    }
}

// ==================== Fixtures ====================

/// Subscriber payload with the given active entitlements (name, product).
pub fn subscriber_json(user: &str, entitlements: &[(&str, &str)]) -> String {
    let entries: Vec<String> = entitlements
        .iter()
        .map(|(name, product)| {
            format!(
                r#""{name}": {{ "is_active": true, "expires_at": null, "product_id": "{product}" }}"#
            )
        })
        .collect();
    format!(
        r#"{{ "app_user_id": "{user}", "entitlements": {{ {} }}, "etag": "v1" }}"#,
        entries.join(", ")
    )
}

/// Offerings payload: one offering `offering_a` with `$rc_monthly` and
/// `$rc_annual` packages.
pub fn offerings_json() -> String {
    r#"{
        "current_offering_id": "offering_a",
        "offerings": [
            {
                "identifier": "offering_a",
                "packages": [
                    { "identifier": "$rc_monthly", "product_id": "com.app.monthly" },
                    { "identifier": "$rc_annual", "product_id": "com.app.annual" }
                ]
            }
        ]
    }"#
    .to_string()
}

/// Attributes response rejecting the given keys.
pub fn attribute_errors_json(rejected: &[(&str, &str)]) -> String {
    let entries: Vec<String> = rejected
        .iter()
        .map(|(key, message)| format!(r#"{{ "key": "{key}", "message": "{message}" }}"#))
        .collect();
    format!(r#"{{ "attribute_errors": [ {} ] }}"#, entries.join(", "))
}

// ==================== Client Construction ====================

pub fn sdk(transport: Arc<MockTransport>, store: Arc<MockStore>, user: Option<&str>) -> Purchases {
    sdk_with_storage(
        transport,
        store,
        Arc::new(purchases_sdk::MemoryStorage::new()),
        user,
    )
}

pub fn sdk_with_storage(
    transport: Arc<MockTransport>,
    store: Arc<MockStore>,
    storage: Arc<dyn StorageAdapter>,
    user: Option<&str>,
) -> Purchases {
    Purchases::new(
        "test-api-key",
        store,
        PurchasesOptions {
            transport: Some(transport),
            storage: Some(storage),
            app_user_id: user.map(str::to_string),
            ..Default::default()
        },
    )
    .expect("client construction")
}
