//! Request deduplication.
//!
//! Collapses concurrent identical outbound calls into one in-flight call.
//! The first caller for a request key becomes the leader and runs the
//! operation; callers arriving while it is outstanding park on a oneshot
//! receiver and get the leader's result. When the operation resolves the
//! result is broadcast to every waiter registered up to that point and the
//! in-flight slot is removed, so later callers start a fresh call.
//!
//! Leaders can be cancelled (the caller's future dropped mid-operation). A
//! drop guard clears the slot in that case, which wakes every parked waiter;
//! each waiter then races to lead a fresh call, so a key never stays wedged
//! behind an abandoned leader.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::error::Result;
use crate::transport::HttpResponse;

type CallResult = Result<HttpResponse>;
type InFlightMap = HashMap<String, Vec<oneshot::Sender<CallResult>>>;

/// Deduplicating executor for backend calls.
///
/// Guarantees at most one concurrent network call per distinct request key.
/// No ordering is guaranteed between distinct keys.
#[derive(Default)]
pub struct RequestDeduplicator {
    in_flight: Mutex<InFlightMap>,
}

/// Clears the leader's in-flight slot unless defused by a broadcast.
///
/// Removing the slot drops the parked senders, so every waiter observes the
/// closed channel and re-enters the register-or-lead race.
struct SlotGuard<'a> {
    in_flight: &'a Mutex<InFlightMap>,
    key: &'a str,
    armed: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut in_flight = lock(self.in_flight);
        in_flight.remove(self.key);
    }
}

impl RequestDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` for `request_key`, joining an in-flight call if one
    /// exists.
    ///
    /// If another call with the same key is outstanding, this caller parks
    /// until the leader broadcasts; success and failure are both shared. If
    /// the leader is cancelled before broadcasting, parked callers wake and
    /// one of them runs `operation` as the new leader.
    pub async fn execute<F, Fut>(&self, request_key: &str, operation: F) -> CallResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CallResult>,
    {
        loop {
            let receiver = {
                let mut in_flight = lock(&self.in_flight);
                match in_flight.get_mut(request_key) {
                    Some(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Some(rx)
                    }
                    None => {
                        in_flight.insert(request_key.to_string(), Vec::new());
                        None
                    }
                }
            };

            let Some(rx) = receiver else {
                break;
            };

            tracing::debug!(request_key, "joining in-flight request");
            match rx.await {
                Ok(result) => return result,
                // The leader was cancelled before broadcasting; race to
                // lead a fresh call.
                Err(_) => continue,
            }
        }

        let mut guard = SlotGuard {
            in_flight: &self.in_flight,
            key: request_key,
            armed: true,
        };

        let result = operation().await;

        let waiters = {
            let mut in_flight = lock(&self.in_flight);
            in_flight.remove(request_key).unwrap_or_default()
        };
        guard.armed = false;

        if !waiters.is_empty() {
            tracing::debug!(request_key, waiters = waiters.len(), "broadcasting shared result");
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }

        result
    }
}

fn lock(in_flight: &Mutex<InFlightMap>) -> MutexGuard<'_, InFlightMap> {
    match in_flight.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl std::fmt::Debug for RequestDeduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDeduplicator").finish_non_exhaustive()
    }
}
