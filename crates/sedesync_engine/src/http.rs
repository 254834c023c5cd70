//! HTTP transport implementation.
//!
//! The hub exposes `/sync/push`, `/sync/pull` and `/sync/full`, each taking
//! and returning a CBOR body. The actual HTTP client is abstracted via a
//! trait so any library (reqwest, hyper, ureq) or an in-process loopback
//! can carry the bytes.

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use sedesync_protocol::{
    CborMessage, FullSyncRequest, FullSyncResponse, PullRequest, PullResponse, PushRequest,
    PushResponse,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Push endpoint.
pub const PUSH_PATH: &str = "/sync/push";
/// Pull endpoint.
pub const PULL_PATH: &str = "/sync/pull";
/// Full sync endpoint.
pub const FULL_SYNC_PATH: &str = "/sync/full";

/// Why an HTTP exchange produced no body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpFailure {
    /// No answer within the timeout.
    Timeout,
    /// The peer could not be reached.
    Unreachable(String),
    /// The peer answered with an error status.
    Status {
        /// HTTP status code.
        code: u16,
        /// Response body as text.
        message: String,
    },
}

impl HttpFailure {
    /// A 400 answer.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::Status {
            code: 400,
            message: message.into(),
        }
    }

    /// A 500 answer.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Status {
            code: 500,
            message: message.into(),
        }
    }
}

impl fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpFailure::Timeout => f.write_str("timed out"),
            HttpFailure::Unreachable(reason) => write!(f, "unreachable: {reason}"),
            HttpFailure::Status { code, message } => write!(f, "status {code}: {message}"),
        }
    }
}

impl From<HttpFailure> for SyncError {
    fn from(failure: HttpFailure) -> Self {
        match failure {
            HttpFailure::Timeout => SyncError::Timeout,
            HttpFailure::Unreachable(_) => SyncError::transport_retryable(failure.to_string()),
            HttpFailure::Status { code, .. } if code >= 500 => {
                SyncError::transport_retryable(failure.to_string())
            }
            HttpFailure::Status { .. } => SyncError::transport_fatal(failure.to_string()),
        }
    }
}

/// HTTP client abstraction.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the response body.
    fn post(&self, url: &str, body: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, HttpFailure>;

    /// Checks if the client is healthy.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based sync transport.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the hub (e.g., "https://central.example.org").
    base_url: String,
    client: C,
    timeout: Duration,
    connected: AtomicBool,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            timeout,
            connected: AtomicBool::new(true),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post_cbor<Req, Res>(&self, endpoint: &str, request: &Req) -> SyncResult<Res>
    where
        Req: CborMessage,
        Res: CborMessage,
    {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let body = request.encode()?;
        let url = format!("{}{}", self.base_url, endpoint);
        debug!(%url, bytes = body.len(), "posting sync message");
        let response = self.client.post(&url, body, self.timeout)?;

        Res::decode(&response).map_err(|e| SyncError::Protocol(format!("bad response: {e}")))
    }
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.post_cbor(PUSH_PATH, request)
    }

    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.post_cbor(PULL_PATH, request)
    }

    fn full_sync(&self, request: &FullSyncRequest) -> SyncResult<FullSyncResponse> {
        self.post_cbor(FULL_SYNC_PATH, request)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a POST to `path` and returns the response body.
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, HttpFailure>;
}

/// An HTTP client that routes requests directly to an in-process server.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, body: Vec<u8>, _timeout: Duration) -> Result<Vec<u8>, HttpFailure> {
        let path = url.find("/sync/").map(|i| &url[i..]).unwrap_or(url);
        self.server.handle_post(path, &body)
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
