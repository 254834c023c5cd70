//! Opening a site, and optionally its hub, for one command.

use crate::error::{CliError, CliResult};
use sedesync_core::SiteNode;
use sedesync_engine::{
    HttpFailure, HttpTransport, LoopbackClient, LoopbackServer, SyncConfig, SyncEngine,
    SyncError, SyncResult, SyncTransport,
};
use sedesync_protocol::{
    FullSyncRequest, FullSyncResponse, PullRequest, PullResponse, PushRequest, PushResponse,
    SiteId,
};
use sedesync_server::{ServerConfig, SyncServer};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Base URL used for the in-process hub.
const LOCAL_HUB_URL: &str = "file://hub";

/// Serves sync POSTs from a hub opened in this process.
struct LocalHub(Arc<SyncServer>);

impl LoopbackServer for LocalHub {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, HttpFailure> {
        self.0.handle_post(path, body).map_err(|e| HttpFailure::Status {
            code: e.status_code(),
            message: e.to_string(),
        })
    }
}

/// Transport used when no hub directory was given.
struct Offline;

impl SyncTransport for Offline {
    fn push(&self, _request: &PushRequest) -> SyncResult<PushResponse> {
        Err(SyncError::NotConnected)
    }

    fn pull(&self, _request: &PullRequest) -> SyncResult<PullResponse> {
        Err(SyncError::NotConnected)
    }

    fn full_sync(&self, _request: &FullSyncRequest) -> SyncResult<FullSyncResponse> {
        Err(SyncError::NotConnected)
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn close(&self) -> SyncResult<()> {
        Ok(())
    }
}

/// A site registered with an engine for the duration of one command.
pub struct Session {
    /// Engine with the site registered.
    pub engine: SyncEngine,
    /// The site's node.
    pub node: Arc<SiteNode>,
    /// The hub, when its directory was given.
    pub hub: Option<Arc<SyncServer>>,
}

impl Session {
    /// Opens the site in `data`, connected to the hub in `hub` if given.
    pub fn open(data: &Path, hub: Option<&Path>, config: SyncConfig) -> CliResult<Self> {
        let node = Arc::new(SiteNode::open_existing(data)?);
        let engine = SyncEngine::new(config);

        let hub = match hub {
            Some(path) => {
                let hub_node = Arc::new(SiteNode::open_existing(path)?);
                if hub_node.id() == node.id() {
                    return Err(CliError::InvalidArgument(
                        "site and hub are the same node".into(),
                    ));
                }
                let server = Arc::new(SyncServer::new(ServerConfig::default(), hub_node)?);
                let transport = HttpTransport::new(
                    LOCAL_HUB_URL,
                    LoopbackClient::new(LocalHub(Arc::clone(&server))),
                    engine.config().timeout,
                );
                engine.register(Arc::clone(&node), server.node().id(), Arc::new(transport));
                debug!(hub = %server.node().site(), "hub opened");
                Some(server)
            }
            None => {
                // Watermarks are keyed by peer; without a hub none is read.
                engine.register(Arc::clone(&node), SiteId::nil(), Arc::new(Offline));
                None
            }
        };

        Ok(Self { engine, node, hub })
    }

    /// Opens the site and requires a hub.
    pub fn with_hub(
        data: &Path,
        hub: Option<&Path>,
        config: SyncConfig,
        command: &'static str,
    ) -> CliResult<Self> {
        let hub = hub.ok_or(CliError::HubRequired(command))?;
        Self::open(data, Some(hub), config)
    }

    /// Id of the site.
    pub fn site(&self) -> SiteId {
        self.node.id()
    }
}
