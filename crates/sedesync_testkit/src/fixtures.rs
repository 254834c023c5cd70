//! Test fixtures: sample entities, nodes, transports and a small network.
//!
//! Provides a hub with a set of sites wired to it in memory, so tests can
//! capture changes at one site and watch them reach another.

use sedesync_core::{CaptureContext, CaptureOutcome, SiteNode, SyncHooks, SyncableEntity};
use sedesync_engine::{
    HttpFailure, LoopbackServer, RetryConfig, SyncConfig, SyncEngine, SyncError, SyncResult,
    SyncTransport,
};
use sedesync_protocol::{
    FieldValue, FullSyncRequest, FullSyncResponse, GlobalId, PullRequest, PullResponse, PushRequest,
    PushResponse, Site, SiteCode, SiteId, Snapshot,
};
use sedesync_server::{ServerConfig, ServerError, SyncServer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Table the sample patient lives in.
pub const PATIENTS: &str = "patients";

/// A site with the conventional display name for its code.
pub fn site(code: SiteCode) -> Site {
    let name = match code {
        SiteCode::Central => "Sede Central",
        SiteCode::Norte => "Sede Norte",
        SiteCode::Sur => "Sede Sur",
        SiteCode::Oriente => "Sede Oriente",
        SiteCode::Occidente => "Sede Occidente",
    };
    Site::new(code, name)
}

/// A sample clinical entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Patient {
    /// Global identifier.
    pub id: GlobalId,
    /// Owning site.
    pub site: SiteId,
    /// Site-local numeric id.
    pub local_id: Option<i64>,
    /// Full name.
    pub name: String,
    /// Contact phone.
    pub phone: String,
    /// Outstanding balance, kept as decimal text.
    pub balance: String,
}

impl Patient {
    /// A new patient registered at `site`.
    pub fn new(site: SiteId, name: impl Into<String>) -> Self {
        Self {
            id: GlobalId::new(),
            site,
            local_id: None,
            name: name.into(),
            phone: "555-0100".into(),
            balance: "0.00".into(),
        }
    }

    /// Sets the phone.
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = phone.into();
        self
    }

    /// Builds the patient a snapshot describes.
    pub fn from_snapshot(id: GlobalId, site: SiteId, snapshot: &Snapshot) -> Option<Self> {
        let text = |field: &str| match snapshot.get(field) {
            Some(FieldValue::Text(value)) => Some(value.clone()),
            _ => None,
        };
        Some(Self {
            id,
            site,
            local_id: None,
            name: text("name")?,
            phone: text("phone")?,
            balance: text("balance")?,
        })
    }
}

impl SyncableEntity for Patient {
    fn table(&self) -> &str {
        PATIENTS
    }

    fn global_id(&self) -> GlobalId {
        self.id
    }

    fn site_id(&self) -> SiteId {
        self.site
    }

    fn local_id(&self) -> Option<i64> {
        self.local_id
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::new()
            .with("name", self.name.as_str())
            .with("phone", self.phone.as_str())
            .with("balance", self.balance.as_str())
    }
}

impl SyncHooks for Patient {}

/// A node kept in a temporary directory.
pub struct TempNode {
    /// The node.
    pub node: SiteNode,
    /// The temporary directory (kept alive to prevent cleanup).
    pub dir: TempDir,
}

impl TempNode {
    /// Provisions a durable node for `site` in a fresh directory.
    pub fn open(site: Site) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let node = SiteNode::open(dir.path(), site).expect("Failed to open node");
        Self { node, dir }
    }

    /// Closes and reopens the node from its directory.
    pub fn reopen(self) -> Self {
        let Self { node, dir } = self;
        drop(node);
        let node = SiteNode::open_existing(dir.path()).expect("Failed to reopen node");
        Self { node, dir }
    }
}

impl std::ops::Deref for TempNode {
    type Target = SiteNode;

    fn deref(&self) -> &Self::Target {
        &self.node
    }
}

fn to_sync_error(err: ServerError) -> SyncError {
    if err.is_client_error() {
        SyncError::transport_fatal(err.to_string())
    } else {
        SyncError::transport_retryable(err.to_string())
    }
}

/// A transport that calls an in-process hub directly.
pub struct HubTransport {
    server: Arc<SyncServer>,
}

impl HubTransport {
    /// Creates a transport to `server`.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self { server }
    }
}

impl SyncTransport for HubTransport {
    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.server.handle_push(request.clone()).map_err(to_sync_error)
    }

    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.server.handle_pull(request.clone()).map_err(to_sync_error)
    }

    fn full_sync(&self, request: &FullSyncRequest) -> SyncResult<FullSyncResponse> {
        self.server
            .handle_full_sync(request.clone())
            .map_err(to_sync_error)
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn close(&self) -> SyncResult<()> {
        Ok(())
    }
}

/// Serves loopback HTTP requests from an in-process hub.
pub struct HubLoopback(pub Arc<SyncServer>);

impl LoopbackServer for HubLoopback {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, HttpFailure> {
        self.0.handle_post(path, body).map_err(|e| HttpFailure::Status {
            code: e.status_code(),
            message: e.to_string(),
        })
    }
}

/// Wraps a transport and fails the next calls with a retryable error.
pub struct FlakyTransport<T: SyncTransport> {
    inner: T,
    failures_left: AtomicUsize,
    calls: AtomicUsize,
}

impl<T: SyncTransport> FlakyTransport<T> {
    /// Wraps `inner`; the first `failures` calls fail.
    pub fn new(inner: T, failures: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    /// Makes the next `failures` calls fail.
    pub fn fail_next(&self, failures: usize) {
        self.failures_left.store(failures, Ordering::SeqCst);
    }

    /// Calls made so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn gate(&self) -> SyncResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(SyncError::transport_retryable("connection reset by peer"))
        } else {
            Ok(())
        }
    }
}

impl<T: SyncTransport> SyncTransport for FlakyTransport<T> {
    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.gate()?;
        self.inner.push(request)
    }

    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.gate()?;
        self.inner.pull(request)
    }

    fn full_sync(&self, request: &FullSyncRequest) -> SyncResult<FullSyncResponse> {
        self.gate()?;
        self.inner.full_sync(request)
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn close(&self) -> SyncResult<()> {
        self.inner.close()
    }
}

/// Engine configuration for tests: small batches and fast retries.
pub fn test_config() -> SyncConfig {
    SyncConfig::new()
        .with_push_batch_size(3)
        .with_pull_batch_size(3)
        .with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(5)),
        )
}

/// A hub plus sites registered with one engine, all in memory.
pub struct TestNetwork {
    /// The hub.
    pub hub: Arc<SyncServer>,
    /// The engine running every site.
    pub engine: Arc<SyncEngine>,
    sites: HashMap<SiteCode, Arc<SiteNode>>,
}

impl TestNetwork {
    /// A hub at Central and one site per code.
    pub fn new(codes: &[SiteCode]) -> Self {
        Self::with_config(codes, test_config())
    }

    /// Same as [`TestNetwork::new`] with a custom engine configuration.
    pub fn with_config(codes: &[SiteCode], config: SyncConfig) -> Self {
        let hub_node = Arc::new(SiteNode::in_memory(site(SiteCode::Central)));
        let hub = Arc::new(
            SyncServer::new(ServerConfig::default(), hub_node).expect("Failed to start hub"),
        );
        let engine = Arc::new(SyncEngine::new(config));
        let mut sites = HashMap::new();
        for &code in codes {
            let node = Arc::new(SiteNode::in_memory(site(code)));
            engine.register(
                Arc::clone(&node),
                hub.node().id(),
                Arc::new(HubTransport::new(Arc::clone(&hub))),
            );
            sites.insert(code, node);
        }
        Self { hub, engine, sites }
    }

    /// The node of a site.
    pub fn node(&self, code: SiteCode) -> Arc<SiteNode> {
        Arc::clone(self.sites.get(&code).expect("Site not in network"))
    }

    /// Id of a site.
    pub fn id(&self, code: SiteCode) -> SiteId {
        self.node(code).id()
    }

    /// Saves a patient at a site with capture on.
    pub fn save(&self, code: SiteCode, patient: &Patient) -> CaptureOutcome {
        self.node(code)
            .save_entity(patient, CaptureContext::Syncing)
            .expect("Failed to save patient")
    }

    /// Deletes a patient at a site with capture on.
    pub fn delete(&self, code: SiteCode, patient: &Patient) -> CaptureOutcome {
        self.node(code)
            .delete_entity(patient, CaptureContext::Syncing)
            .expect("Failed to delete patient")
    }

    /// Current fields of a patient at a site, `None` if absent or deleted.
    pub fn patient_at(&self, code: SiteCode, id: GlobalId) -> Option<Snapshot> {
        self.node(code)
            .entity(PATIENTS, id)
            .expect("Failed to read patient")
            .and_then(|row| row.payload)
    }

    /// Push then pull for every site, in code order.
    pub fn sync_all(&self) {
        let mut codes: Vec<SiteCode> = self.sites.keys().copied().collect();
        codes.sort_by_key(|c| c.as_str());
        for code in codes {
            self.engine
                .run_incremental(self.id(code))
                .expect("Incremental run failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sedesync_engine::{HttpTransport, LoopbackClient};

    #[test]
    fn patient_snapshot_round_trip() {
        let patient = Patient::new(SiteId::new(), "Ana Pérez").with_phone("555-0199");
        let back = Patient::from_snapshot(patient.id, patient.site, &patient.snapshot()).unwrap();
        assert_eq!(back, patient);
    }

    #[test]
    fn network_moves_a_patient() {
        let net = TestNetwork::new(&[SiteCode::Norte, SiteCode::Sur]);
        let patient = Patient::new(net.id(SiteCode::Norte), "Luis");
        net.save(SiteCode::Norte, &patient);

        net.sync_all();
        net.sync_all();
        assert_eq!(
            net.patient_at(SiteCode::Sur, patient.id),
            Some(patient.snapshot())
        );
    }

    #[test]
    fn loopback_http_reaches_the_hub() {
        let net = TestNetwork::new(&[]);
        let transport = HttpTransport::new(
            "http://central.local",
            LoopbackClient::new(HubLoopback(Arc::clone(&net.hub))),
            Duration::from_secs(1),
        );
        let page = transport
            .pull(&PullRequest::new(SiteId::new(), 0, 10))
            .unwrap();
        assert!(page.records.is_empty());
    }

    #[test]
    fn flaky_transport_recovers() {
        let net = TestNetwork::new(&[]);
        let flaky = FlakyTransport::new(HubTransport::new(Arc::clone(&net.hub)), 1);
        let request = PullRequest::new(SiteId::new(), 0, 10);
        assert!(flaky.pull(&request).unwrap_err().is_retryable());
        assert!(flaky.pull(&request).is_ok());
        assert_eq!(flaky.calls(), 2);
    }
}
