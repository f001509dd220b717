//! Pending requests tracker
//!
//! Tracks HTTP requests sent through a tunnel until their RESPONSE arrives.
//! Each entry owns its deadline timer; whoever removes an entry from the map
//! settles it, so a request is resolved or rejected exactly once.

use dashmap::DashMap;
use portway_proto::HttpResponsePayload;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::RelayError;

pub type RequestOutcome = Result<HttpResponsePayload, RelayError>;

/// One request awaiting its response
pub struct InFlightRequest {
    responder: oneshot::Sender<RequestOutcome>,
    deadline: CancellationToken,
    started_at: Instant,
}

impl InFlightRequest {
    /// Stop the timer and hand the outcome to the waiting caller
    fn settle(self, outcome: RequestOutcome) -> bool {
        self.deadline.cancel();
        self.responder.send(outcome).is_ok()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Arena of in-flight requests for one tunnel, keyed by request id
#[derive(Clone)]
pub struct PendingRequests {
    requests: Arc<DashMap<String, InFlightRequest>>,
    reserved: Arc<AtomicUsize>,
    limit: usize,
}

impl PendingRequests {
    pub fn new(limit: usize) -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
            reserved: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    /// Start tracking a new request
    ///
    /// Returns the generated request id and the receiver for its outcome, or
    /// `None` when `limit` requests are already in flight. The entry is
    /// rejected with [`RelayError::Timeout`] if nothing settles it within
    /// `timeout`.
    pub fn register(&self, timeout: Duration) -> Option<(String, oneshot::Receiver<RequestOutcome>)> {
        if self.reserved.fetch_add(1, Ordering::AcqRel) >= self.limit {
            self.reserved.fetch_sub(1, Ordering::AcqRel);
            return None;
        }

        let (tx, rx) = oneshot::channel();
        let deadline = CancellationToken::new();
        let mut entry = Some(InFlightRequest {
            responder: tx,
            deadline: deadline.clone(),
            started_at: Instant::now(),
        });

        let request_id = loop {
            let candidate = Uuid::new_v4().to_string();
            if let dashmap::mapref::entry::Entry::Vacant(slot) =
                self.requests.entry(candidate.clone())
            {
                if let Some(entry) = entry.take() {
                    slot.insert(entry);
                }
                break candidate;
            }
        };

        let requests = self.clone();
        let timer_id = request_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = deadline.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if let Some(entry) = requests.take(&timer_id) {
                        debug!("Request {} timed out after {:?}", timer_id, timeout);
                        entry.settle(Err(RelayError::Timeout(timeout)));
                    }
                }
            }
        });

        debug!("Registered pending request {}", request_id);
        Some((request_id, rx))
    }

    fn take(&self, request_id: &str) -> Option<InFlightRequest> {
        let (_, entry) = self.requests.remove(request_id)?;
        self.reserved.fetch_sub(1, Ordering::AcqRel);
        Some(entry)
    }

    /// Deliver a response
    ///
    /// Returns false when the request is unknown or already settled.
    pub fn resolve(&self, request_id: &str, response: HttpResponsePayload) -> bool {
        match self.take(request_id) {
            Some(entry) => {
                debug!(
                    "Routing response for request {} after {:?}",
                    request_id,
                    entry.elapsed()
                );
                entry.settle(Ok(response))
            }
            None => false,
        }
    }

    /// Fail a single request
    pub fn reject(&self, request_id: &str, error: RelayError) -> bool {
        match self.take(request_id) {
            Some(entry) => entry.settle(Err(error)),
            None => false,
        }
    }

    /// Forget a request without notifying the caller
    pub fn cancel(&self, request_id: &str) {
        if let Some(entry) = self.take(request_id) {
            entry.deadline.cancel();
            debug!("Cancelled pending request {}", request_id);
        }
    }

    /// Fail every in-flight request; returns how many were rejected
    pub fn reject_all(&self, error: RelayError) -> usize {
        let ids: Vec<String> = self.requests.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter_map(|id| self.take(id))
            .map(|entry| entry.settle(Err(error.clone())))
            .count()
    }

    pub fn count(&self) -> usize {
        self.requests.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portway_proto::Headers;

    const TIMEOUT: Duration = Duration::from_secs(30);

    fn ok_response(body: &str) -> HttpResponsePayload {
        HttpResponsePayload {
            status_code: 200,
            headers: Headers::new(),
            body: Some(body.to_string()),
        }
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let pending = PendingRequests::new(10);
        let (id, rx) = pending.register(TIMEOUT).unwrap();
        assert_eq!(pending.count(), 1);

        assert!(pending.resolve(&id, ok_response("ok")));
        assert_eq!(rx.await.unwrap(), Ok(ok_response("ok")));
        assert_eq!(pending.count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_response_is_noop() {
        let pending = PendingRequests::new(10);
        let (id, rx) = pending.register(TIMEOUT).unwrap();

        assert!(pending.resolve(&id, ok_response("first")));
        assert!(!pending.resolve(&id, ok_response("second")));
        assert!(!pending.reject(&id, RelayError::TunnelClosed));
        assert_eq!(rx.await.unwrap(), Ok(ok_response("first")));
    }

    #[tokio::test]
    async fn test_unknown_request_id() {
        let pending = PendingRequests::new(10);
        assert!(!pending.resolve("nope", ok_response("x")));
        pending.cancel("nope");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_and_removes() {
        let pending = PendingRequests::new(10);
        let (id, rx) = pending.register(Duration::from_secs(5)).unwrap();

        assert_eq!(
            rx.await.unwrap(),
            Err(RelayError::Timeout(Duration::from_secs(5)))
        );
        assert_eq!(pending.count(), 0);
        // late response after the deadline
        assert!(!pending.resolve(&id, ok_response("late")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_cancels_timer() {
        let pending = PendingRequests::new(10);
        let (id, rx) = pending.register(Duration::from_secs(5)).unwrap();
        assert!(pending.resolve(&id, ok_response("fast")));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rx.await.unwrap(), Ok(ok_response("fast")));
        assert_eq!(pending.count(), 0);
    }

    #[tokio::test]
    async fn test_reject_all() {
        let pending = PendingRequests::new(10);
        let receivers: Vec<_> = (0..3).map(|_| pending.register(TIMEOUT).unwrap().1).collect();

        assert_eq!(pending.reject_all(RelayError::TunnelClosed), 3);
        assert_eq!(pending.count(), 0);
        for rx in receivers {
            assert_eq!(rx.await.unwrap(), Err(RelayError::TunnelClosed));
        }
    }

    #[tokio::test]
    async fn test_limit_enforced_and_released() {
        let pending = PendingRequests::new(2);
        let (first, _rx1) = pending.register(TIMEOUT).unwrap();
        let (_second, _rx2) = pending.register(TIMEOUT).unwrap();
        assert!(pending.register(TIMEOUT).is_none());

        pending.cancel(&first);
        assert!(pending.register(TIMEOUT).is_some());
        assert_eq!(pending.count(), 2);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let pending = PendingRequests::new(1000);
        let ids: std::collections::HashSet<String> =
            (0..500).map(|_| pending.register(TIMEOUT).unwrap().0).collect();
        assert_eq!(ids.len(), 500);
    }

    #[tokio::test]
    async fn test_dropped_receiver() {
        let pending = PendingRequests::new(10);
        let (id, rx) = pending.register(TIMEOUT).unwrap();
        drop(rx);
        assert!(!pending.resolve(&id, ok_response("nobody listening")));
        assert_eq!(pending.count(), 0);
    }
}
