//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use sedesync_protocol::{
    FullSyncRequest, FullSyncResponse, PullRequest, PullResponse, PushRequest, PushResponse,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// A sync transport carries protocol messages to the peer (the hub).
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, in-process loopback, mock for testing).
pub trait SyncTransport: Send + Sync {
    /// Pushes a batch of records to the peer.
    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse>;

    /// Pulls one page of changes from the peer.
    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse>;

    /// Fetches canonical table snapshots from the peer.
    fn full_sync(&self, request: &FullSyncRequest) -> SyncResult<FullSyncResponse>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport connection.
    fn close(&self) -> SyncResult<()>;
}

/// A mock transport for testing.
///
/// Replies are queued per message kind and consumed in order; every
/// request is recorded.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    push_replies: Mutex<VecDeque<SyncResult<PushResponse>>>,
    pull_replies: Mutex<VecDeque<SyncResult<PullResponse>>>,
    full_replies: Mutex<VecDeque<SyncResult<FullSyncResponse>>>,
    pushes: Mutex<Vec<PushRequest>>,
    pulls: Mutex<Vec<PullRequest>>,
}

impl MockTransport {
    /// Creates a new connected mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            push_replies: Mutex::new(VecDeque::new()),
            pull_replies: Mutex::new(VecDeque::new()),
            full_replies: Mutex::new(VecDeque::new()),
            pushes: Mutex::new(Vec::new()),
            pulls: Mutex::new(Vec::new()),
        }
    }

    /// Queues the reply to the next push.
    pub fn queue_push(&self, reply: SyncResult<PushResponse>) {
        self.push_replies.lock().push_back(reply);
    }

    /// Queues the reply to the next pull.
    pub fn queue_pull(&self, reply: SyncResult<PullResponse>) {
        self.pull_replies.lock().push_back(reply);
    }

    /// Queues the reply to the next full sync.
    pub fn queue_full_sync(&self, reply: SyncResult<FullSyncResponse>) {
        self.full_replies.lock().push_back(reply);
    }

    /// Push requests received so far.
    pub fn push_requests(&self) -> Vec<PushRequest> {
        self.pushes.lock().clone()
    }

    /// Pull requests received so far.
    pub fn pull_requests(&self) -> Vec<PullRequest> {
        self.pulls.lock().clone()
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn next<T>(&self, queue: &Mutex<VecDeque<SyncResult<T>>>, kind: &str) -> SyncResult<T> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(SyncError::Protocol(format!("no mock {kind} reply queued"))))
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTransport for MockTransport {
    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.pushes.lock().push(request.clone());
        self.next(&self.push_replies, "push")
    }

    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.pulls.lock().push(request.clone());
        self.next(&self.pull_replies, "pull")
    }

    fn full_sync(&self, _request: &FullSyncRequest) -> SyncResult<FullSyncResponse> {
        self.next(&self.full_replies, "full sync")
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
