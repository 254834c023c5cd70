//! Request handlers for sync endpoints.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use sedesync_core::{ApplyContext, ChangeQuery, SiteNode};
use sedesync_protocol::{
    ApplyOutcome, FullSyncRequest, FullSyncResponse, GlobalId, PullRequest, PullResponse,
    PushRequest, PushResponse, RecordOutcome, RejectReason,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Context shared by all handlers.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// The hub's node.
    pub node: Arc<SiteNode>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, node: Arc<SiteNode>) -> Self {
        Self { config, node }
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Applies a pushed batch and answers one outcome per record.
    ///
    /// Records that did not originate at the pushing site are rejected,
    /// and so are later records of the same global id.
    pub fn handle_push(&self, request: PushRequest) -> ServerResult<PushResponse> {
        let max = self.context.config.max_push_batch;
        if request.records.len() > max as usize {
            return Err(ServerError::BatchTooLarge {
                size: request.records.len(),
                max,
            });
        }

        let mut foreign: HashSet<(&str, GlobalId)> = HashSet::new();
        let mut early: Vec<Option<ApplyOutcome>> = Vec::with_capacity(request.records.len());
        let mut accepted = Vec::with_capacity(request.records.len());
        for record in &request.records {
            let key = (record.table.as_str(), record.global_id);
            if record.site_id != request.origin {
                warn!(
                    origin = %request.origin,
                    record_site = %record.site_id,
                    global_id = %record.global_id,
                    "pushed record from another site"
                );
                foreign.insert(key);
                early.push(Some(ApplyOutcome::rejected(RejectReason::ForeignOrigin)));
            } else if foreign.contains(&key) {
                early.push(Some(ApplyOutcome::rejected(
                    RejectReason::BlockedByEarlierFailure,
                )));
            } else {
                early.push(None);
                accepted.push(record.clone());
            }
        }

        let ctx = ApplyContext::push(request.origin, request.expected_cursor);
        let mut applied = self
            .context
            .node
            .apply_batch(&ctx, &accepted)?
            .into_iter();

        let mut outcomes = Vec::with_capacity(request.records.len());
        for (record, early) in request.records.iter().zip(early) {
            let outcome = match early {
                Some(outcome) => outcome,
                None => applied.next().ok_or_else(|| {
                    ServerError::Internal("apply returned too few outcomes".into())
                })?,
            };
            outcomes.push(RecordOutcome {
                sequence: record.sequence,
                global_id: record.global_id,
                outcome,
            });
        }
        Ok(PushResponse { outcomes })
    }

    /// Answers one page of SYNCED changes above the request cursor.
    ///
    /// The requesting site's own records are left out.
    pub fn handle_pull(&self, request: PullRequest) -> ServerResult<PullResponse> {
        let limit = request.limit.clamp(1, self.context.config.max_pull_batch);
        let page = self.context.node.changes().changes_since(&ChangeQuery {
            since: request.since,
            tables: request.tables,
            exclude_origin: Some(request.site),
            limit: limit as usize,
        })?;
        debug!(
            site = %request.site,
            since = request.since,
            records = page.records.len(),
            new_cursor = page.new_cursor,
            "pull served"
        );
        Ok(PullResponse::new(page.records, page.new_cursor, page.has_more))
    }

    /// Answers the live contents of the requested tables.
    pub fn handle_full_sync(&self, request: FullSyncRequest) -> ServerResult<FullSyncResponse> {
        let response = self.context.node.snapshot(request.tables.as_deref())?;
        debug!(
            site = %request.site,
            tables = response.tables.len(),
            cursor = response.cursor,
            "full sync served"
        );
        Ok(response)
    }
}
