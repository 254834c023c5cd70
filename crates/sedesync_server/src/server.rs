//! Main hub server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler};
use sedesync_core::{CaptureContext, CaptureOutcome, CoreResult, SiteNode, SyncHooks};
use sedesync_protocol::{
    CborMessage, FullSyncRequest, FullSyncResponse, PullRequest, PullResponse, PushRequest,
    PushResponse, SyncMessage,
};
use std::sync::Arc;
use tracing::info;

/// Push endpoint.
pub const PUSH_PATH: &str = "/sync/push";
/// Pull endpoint.
pub const PULL_PATH: &str = "/sync/pull";
/// Full sync endpoint.
pub const FULL_SYNC_PATH: &str = "/sync/full";

/// The hub.
///
/// Sites push their changes here and pull everyone else's. The hub keeps
/// its own [`SiteNode`]: pushed records are applied to it and kept as
/// replicas in its log, which is what pulls are served from.
///
/// # Example
///
/// ```
/// use sedesync_core::SiteNode;
/// use sedesync_protocol::{Site, SiteCode};
/// use sedesync_server::{ServerConfig, SyncServer};
/// use std::sync::Arc;
///
/// let node = Arc::new(SiteNode::in_memory(Site::new(SiteCode::Central, "Sede Central")));
/// let server = SyncServer::new(ServerConfig::default(), node).unwrap();
///
/// // An HTTP front end would route POST bodies to server.handle_post()
/// assert_eq!(server.cursor().unwrap(), 0);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a hub over `node`.
    ///
    /// Local captures left PENDING by an earlier process are published.
    pub fn new(config: ServerConfig, node: Arc<SiteNode>) -> ServerResult<Self> {
        let published = node.publish_pending()?;
        if published > 0 {
            info!(published, "published leftover hub captures");
        }
        let context = Arc::new(HandlerContext::new(config, node));
        let handler = RequestHandler::new(Arc::clone(&context));
        Ok(Self { handler, context })
    }

    /// Handles a push request.
    pub fn handle_push(&self, request: PushRequest) -> ServerResult<PushResponse> {
        self.handler.handle_push(request)
    }

    /// Handles a pull request.
    pub fn handle_pull(&self, request: PullRequest) -> ServerResult<PullResponse> {
        self.handler.handle_pull(request)
    }

    /// Handles a full sync request.
    pub fn handle_full_sync(&self, request: FullSyncRequest) -> ServerResult<FullSyncResponse> {
        self.handler.handle_full_sync(request)
    }

    /// Handles a sync message (dispatches to the appropriate handler).
    pub fn handle_message(&self, message: SyncMessage) -> ServerResult<SyncMessage> {
        match message {
            SyncMessage::PushRequest(req) => self.handle_push(req).map(SyncMessage::PushResponse),
            SyncMessage::PullRequest(req) => self.handle_pull(req).map(SyncMessage::PullResponse),
            SyncMessage::FullSyncRequest(req) => self
                .handle_full_sync(req)
                .map(SyncMessage::FullSyncResponse),
            _ => Err(ServerError::InvalidRequest("unexpected message type".into())),
        }
    }

    /// Handles a CBOR POST body for one of the sync paths.
    pub fn handle_post(&self, path: &str, body: &[u8]) -> ServerResult<Vec<u8>> {
        let encoded = match path {
            PUSH_PATH => self.handle_push(PushRequest::decode(body)?)?.encode(),
            PULL_PATH => self.handle_pull(PullRequest::decode(body)?)?.encode(),
            FULL_SYNC_PATH => self.handle_full_sync(FullSyncRequest::decode(body)?)?.encode(),
            other => return Err(ServerError::UnknownPath(other.to_string())),
        };
        Ok(encoded?)
    }

    /// Saves an entity written at the hub and publishes the change.
    pub fn save_entity<E: SyncHooks>(&self, entity: &E) -> CoreResult<CaptureOutcome> {
        let outcome = self.context.node.save_entity(entity, CaptureContext::Syncing)?;
        self.context.node.publish_pending()?;
        Ok(outcome)
    }

    /// Deletes an entity at the hub and publishes the change.
    pub fn delete_entity<E: SyncHooks>(&self, entity: &E) -> CoreResult<CaptureOutcome> {
        let outcome = self.context.node.delete_entity(entity, CaptureContext::Syncing)?;
        self.context.node.publish_pending()?;
        Ok(outcome)
    }

    /// The hub's node.
    pub fn node(&self) -> &Arc<SiteNode> {
        &self.context.node
    }

    /// Head of the hub log.
    pub fn cursor(&self) -> CoreResult<u64> {
        self.context.node.changes().head()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sedesync_core::SyncableEntity;
    use sedesync_protocol::{GlobalId, Operation, RecordStatus, Site, SiteCode, SiteId, Snapshot};

    struct Doctor {
        id: GlobalId,
        site: SiteId,
        name: &'static str,
    }

    impl SyncableEntity for Doctor {
        fn table(&self) -> &str {
            "doctors"
        }
        fn global_id(&self) -> GlobalId {
            self.id
        }
        fn site_id(&self) -> SiteId {
            self.site
        }
        fn snapshot(&self) -> Snapshot {
            Snapshot::new().with("name", self.name)
        }
    }

    impl SyncHooks for Doctor {}

    fn server() -> SyncServer {
        let node = Arc::new(SiteNode::in_memory(Site::new(SiteCode::Central, "Sede Central")));
        SyncServer::new(ServerConfig::default(), node).unwrap()
    }

    #[test]
    fn server_lifecycle() {
        let server = server();
        assert_eq!(server.cursor().unwrap(), 0);
        assert_eq!(server.node().site().code, SiteCode::Central);
    }

    #[test]
    fn hub_writes_are_published_at_once() {
        let server = server();
        let doctor = Doctor {
            id: GlobalId::new(),
            site: server.node().id(),
            name: "Dra. Rojas",
        };
        let outcome = server.save_entity(&doctor).unwrap();
        assert_eq!(outcome.record().unwrap().operation, Operation::Create);

        let sequence = outcome.record().unwrap().sequence;
        let stored = server.node().changes().get(sequence).unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Synced);

        let page = server
            .handle_pull(PullRequest::new(SiteId::new(), 0, 10))
            .unwrap();
        assert_eq!(page.records.len(), 1);

        server.delete_entity(&doctor).unwrap();
        assert_eq!(server.cursor().unwrap(), 2);
    }

    #[test]
    fn post_dispatch() {
        let server = server();
        let body = PullRequest::new(SiteId::new(), 0, 10).encode().unwrap();
        let answer = server.handle_post(PULL_PATH, &body).unwrap();
        let page = PullResponse::decode(&answer).unwrap();
        assert!(page.records.is_empty());

        assert!(matches!(
            server.handle_post("/sync/handshake", &body),
            Err(ServerError::UnknownPath(_))
        ));
        assert!(server
            .handle_post(PUSH_PATH, &[0xff])
            .unwrap_err()
            .is_client_error());
    }

    #[test]
    fn message_dispatch() {
        let server = server();
        let message = SyncMessage::FullSyncRequest(FullSyncRequest {
            site: SiteId::new(),
            tables: None,
        });
        let response = server.handle_message(message).unwrap();
        assert!(matches!(response, SyncMessage::FullSyncResponse(_)));
    }
}
