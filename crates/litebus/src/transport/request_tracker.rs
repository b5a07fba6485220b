use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, oneshot};

use crate::error::TransportError;

pub type RequestOutcome = Result<(), TransportError>;

/// Tracks in-flight hub requests and their reply channels
///
/// Request/acknowledge over a single socket:
/// 1. Transport sends a frame with a unique request id
/// 2. Calls track_request() to get a receiver and awaits it
/// 3. The socket reader sees the matching ack or error frame
/// 4. Calls complete_request() to resolve the waiting caller
pub struct RequestTracker {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<RequestOutcome>>>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Track a new request and return a receiver for its outcome
    pub async fn track_request(&self, request_id: String) -> oneshot::Receiver<RequestOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);
        rx
    }

    /// Resolve a tracked request
    ///
    /// Unknown ids (already completed or cancelled) are ignored.
    pub async fn complete_request(&self, request_id: &str, outcome: RequestOutcome) -> bool {
        if let Some(tx) = self.pending.lock().await.remove(request_id) {
            // Receiver may have been dropped by a cancelled caller
            let _ = tx.send(outcome);
            true
        } else {
            false
        }
    }

    /// Stop tracking a request, e.g. when its frame could not be sent
    pub async fn cancel_request(&self, request_id: &str) {
        self.pending.lock().await.remove(request_id);
    }

    /// Fail every pending request with `TransportError::Closed`
    pub async fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(TransportError::Closed));
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}
