//! Bounded handoff between the scanner and the registration workers.

use crate::pipeline::scanner::RegistrationRequest;

/// Bounded multi-producer/multi-consumer queue of registration requests.
///
/// The scanner is the single producer; registration workers share the
/// consuming side. `enqueue` suspends while the queue is full, `dequeue`
/// suspends while it is empty. After [`close`](Self::close) the buffered
/// requests drain and `dequeue` then returns `None`.
#[derive(Debug, Clone)]
pub struct RegistrationQueue {
    tx: async_channel::Sender<RegistrationRequest>,
    rx: async_channel::Receiver<RegistrationRequest>,
}

impl RegistrationQueue {
    /// Create a queue holding at most `capacity` requests.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity);
        Self { tx, rx }
    }

    /// Add a request, waiting for a free slot. Fails once the queue is closed.
    pub async fn enqueue(&self, request: RegistrationRequest) -> anyhow::Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| anyhow::anyhow!("Registration queue is closed"))
    }

    /// Take the next request, waiting for one to arrive. Returns `None` once
    /// the queue is closed and drained.
    pub async fn dequeue(&self) -> Option<RegistrationRequest> {
        self.rx.recv().await.ok()
    }

    /// Close the queue. Buffered requests remain consumable.
    pub fn close(&self) {
        self.tx.close();
    }

    /// Number of requests currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
