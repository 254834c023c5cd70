//! The sync engine: push, pull and full sync for every registered site.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::lease::{LeaseGuard, SiteLeases};
use crate::reports::{
    CleanupReport, FullSyncReport, IncrementalReport, PullReport, PushReport, RetryReport,
    RunOutcome, StatusReport,
};
use crate::state::{SyncState, SyncStats};
use crate::transport::SyncTransport;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sedesync_core::{ApplyContext, Resolution, SiteNode};
use sedesync_protocol::{
    ApplyOutcome, ConflictDecision, ConflictEntry, ConflictId, FullSyncRequest, GlobalId,
    PullRequest, PushRequest, RecordStatus, RejectReason, SiteId,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One registered site: its node, its peer and the link to it.
struct SiteRuntime {
    node: Arc<SiteNode>,
    peer: SiteId,
    transport: Arc<dyn SyncTransport>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
}

impl SiteRuntime {
    fn id(&self) -> SiteId {
        self.node.id()
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Runs the sync protocol for the sites it has been given.
///
/// Every operation takes an explicit site id. Runs that talk to the peer
/// hold the site's lease for their whole duration: a manual run that finds
/// the lease held fails with [`SyncError::RunInProgress`], a scheduled one
/// is skipped.
///
/// # Example
///
/// ```ignore
/// let engine = SyncEngine::new(SyncConfig::default());
/// engine.register(Arc::new(node), hub_id, Arc::new(transport));
/// let report = engine.push(node_id)?;
/// ```
pub struct SyncEngine {
    config: SyncConfig,
    leases: SiteLeases,
    sites: RwLock<HashMap<SiteId, Arc<SiteRuntime>>>,
}

impl SyncEngine {
    /// Creates an engine with no sites.
    pub fn new(config: SyncConfig) -> Self {
        Self {
            leases: SiteLeases::new(config.lease_ttl),
            config,
            sites: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a site that syncs with `peer` over `transport`.
    ///
    /// Registering a site again replaces its node and link.
    pub fn register(&self, node: Arc<SiteNode>, peer: SiteId, transport: Arc<dyn SyncTransport>) {
        let site = node.id();
        info!(site = %node.site(), %peer, "site registered");
        self.sites.write().insert(
            site,
            Arc::new(SiteRuntime {
                node,
                peer,
                transport,
                state: RwLock::new(SyncState::Idle),
                stats: RwLock::new(SyncStats::default()),
                cancelled: AtomicBool::new(false),
            }),
        );
    }

    /// Registered site ids, in id order.
    pub fn sites(&self) -> Vec<SiteId> {
        let mut ids: Vec<SiteId> = self.sites.read().keys().copied().collect();
        ids.sort();
        ids
    }

    /// The node of a registered site.
    pub fn node(&self, site: SiteId) -> SyncResult<Arc<SiteNode>> {
        Ok(Arc::clone(&self.runtime(site)?.node))
    }

    /// The engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The lease table.
    pub fn leases(&self) -> &SiteLeases {
        &self.leases
    }

    fn runtime(&self, site: SiteId) -> SyncResult<Arc<SiteRuntime>> {
        self.sites
            .read()
            .get(&site)
            .cloned()
            .ok_or(SyncError::UnknownSite(site))
    }

    fn begin(&self, site: SiteId) -> SyncResult<(Arc<SiteRuntime>, LeaseGuard<'_>)> {
        let rt = self.runtime(site)?;
        let lease = self
            .leases
            .try_acquire(site)
            .ok_or(SyncError::RunInProgress(site))?;
        rt.cancelled.store(false, Ordering::SeqCst);
        Ok((rt, lease))
    }

    fn finish<T>(&self, rt: &SiteRuntime, result: &SyncResult<T>) {
        let mut stats = rt.stats.write();
        match result {
            Ok(_) => {
                stats.runs_completed += 1;
                stats.last_success = Some(Utc::now());
                stats.last_error = None;
                rt.set_state(SyncState::Idle);
            }
            Err(e) => {
                stats.runs_failed += 1;
                stats.last_error = Some(e.to_string());
                rt.set_state(SyncState::Error);
                warn!(site = %rt.id(), error = %e, "sync run failed");
            }
        }
    }

    /// Pushes every PENDING record of `site` to its peer.
    pub fn push(&self, site: SiteId) -> SyncResult<PushReport> {
        let (rt, lease) = self.begin(site)?;
        let result = self.push_all(&rt, &lease);
        self.finish(&rt, &result);
        result
    }

    /// Pulls the peer's changes above the stored watermark.
    ///
    /// An unscoped pull advances the watermark page by page. A pull scoped
    /// to tables leaves it untouched, since it skips other tables' records.
    pub fn pull(&self, site: SiteId, tables: Option<Vec<String>>) -> SyncResult<PullReport> {
        let (rt, lease) = self.begin(site)?;
        let result = rt
            .node
            .changes()
            .load_cursor(rt.peer)
            .map_err(SyncError::from)
            .and_then(|since| {
                let save = tables.is_none();
                self.pull_pages(&rt, &lease, since, tables, save)
            });
        self.finish(&rt, &result);
        result
    }

    /// Pulls the peer's changes above an explicit cursor.
    ///
    /// Records already applied are replayed idempotently. The stored
    /// watermark is never moved.
    pub fn pull_since(
        &self,
        site: SiteId,
        since: u64,
        tables: Option<Vec<String>>,
    ) -> SyncResult<PullReport> {
        let (rt, lease) = self.begin(site)?;
        let result = self.pull_pages(&rt, &lease, since, tables, false);
        self.finish(&rt, &result);
        result
    }

    /// Reconciles tables against the peer's canonical snapshot.
    ///
    /// When every table was requested and no row was skipped, the pull
    /// watermark is reset to the cursor captured with the snapshot.
    pub fn full_sync(
        &self,
        site: SiteId,
        tables: Option<Vec<String>>,
    ) -> SyncResult<FullSyncReport> {
        let (rt, lease) = self.begin(site)?;
        let result = self.reconcile_all(&rt, &lease, tables);
        self.finish(&rt, &result);
        result
    }

    /// Moves every FAILED record of `site` back to PENDING and pushes.
    pub fn retry_failed(&self, site: SiteId) -> SyncResult<RetryReport> {
        let (rt, lease) = self.begin(site)?;
        let result = (|| -> SyncResult<RetryReport> {
            let requeued = rt.node.changes().requeue_failed(site)?;
            info!(%site, requeued = requeued.len(), "failed records requeued");
            let push = self.push_all(&rt, &lease)?;
            Ok(RetryReport { requeued, push })
        })();
        self.finish(&rt, &result);
        result
    }

    /// One scheduled run: push, then pull.
    ///
    /// Returns [`RunOutcome::Skipped`] if another run holds the lease.
    pub fn run_incremental(&self, site: SiteId) -> SyncResult<RunOutcome> {
        let rt = self.runtime(site)?;
        let Some(lease) = self.leases.try_acquire(site) else {
            debug!(%site, "run skipped, lease held");
            rt.stats.write().runs_skipped += 1;
            return Ok(RunOutcome::Skipped);
        };
        rt.cancelled.store(false, Ordering::SeqCst);

        let result = (|| -> SyncResult<IncrementalReport> {
            let push = self.push_all(&rt, &lease)?;
            let since = rt.node.changes().load_cursor(rt.peer)?;
            let pull = self.pull_pages(&rt, &lease, since, None, true)?;
            Ok(IncrementalReport { push, pull })
        })();
        self.finish(&rt, &result);
        result.map(RunOutcome::Completed)
    }

    /// Deletes SYNCED records of `site` older than `retention`.
    pub fn cleanup(&self, site: SiteId, retention: Duration) -> SyncResult<CleanupReport> {
        let age = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.cleanup_before(site, cutoff)
    }

    /// Deletes SYNCED records last updated before `cutoff`.
    pub fn cleanup_before(
        &self,
        site: SiteId,
        cutoff: DateTime<Utc>,
    ) -> SyncResult<CleanupReport> {
        let rt = self.runtime(site)?;
        let deleted = rt.node.cleanup(cutoff)?;
        Ok(CleanupReport {
            site,
            cutoff,
            deleted,
        })
    }

    /// Operator view of one site.
    pub fn status(&self, site: SiteId) -> SyncResult<StatusReport> {
        let rt = self.runtime(site)?;
        let node = &rt.node;
        let report = StatusReport {
            site: node.site().clone(),
            state: *rt.state.read(),
            counts: node.changes().counts(site)?,
            open_conflicts: node.conflicts().len(),
            capture_warnings: node.capture().failure_count(),
            cursor: node.changes().load_cursor(rt.peer)?,
            lease_held: self.leases.is_held(site),
            stats: rt.stats.read().clone(),
        };
        Ok(report)
    }

    /// Operator view of every site.
    pub fn status_all(&self) -> SyncResult<Vec<StatusReport>> {
        self.sites().into_iter().map(|s| self.status(s)).collect()
    }

    /// Open conflicts of `site`, oldest first.
    pub fn conflicts(&self, site: SiteId) -> SyncResult<Vec<ConflictEntry>> {
        Ok(self.runtime(site)?.node.conflicts().list())
    }

    /// Resolves one conflict of `site`.
    pub fn resolve_conflict(
        &self,
        site: SiteId,
        id: ConflictId,
        decision: &ConflictDecision,
    ) -> SyncResult<Resolution> {
        let rt = self.runtime(site)?;
        Ok(rt.node.resolve_conflict(id, decision)?)
    }

    /// Asks the run in progress for `site` to stop at the next batch.
    pub fn cancel(&self, site: SiteId) -> SyncResult<()> {
        self.runtime(site)?.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Runs a transport call, retrying retryable failures with backoff.
    fn with_retry<T>(
        &self,
        rt: &SiteRuntime,
        mut call: impl FnMut() -> SyncResult<T>,
    ) -> SyncResult<T> {
        let retry = &self.config.retry;
        let resume = *rt.state.read();
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                rt.set_state(SyncState::RetryWait);
                std::thread::sleep(retry.delay_for_attempt(attempt));
                rt.stats.write().retries += 1;
                rt.check_cancelled()?;
                rt.set_state(resume);
            }
            match call() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    warn!(site = %rt.id(), attempt, error = %e, "transport call failed, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn renew(&self, rt: &SiteRuntime, lease: &LeaseGuard<'_>) -> SyncResult<()> {
        if lease.renew() {
            Ok(())
        } else {
            warn!(site = %rt.id(), "lease lost mid-run");
            Err(SyncError::RunInProgress(rt.id()))
        }
    }

    fn push_all(&self, rt: &SiteRuntime, lease: &LeaseGuard<'_>) -> SyncResult<PushReport> {
        let site = rt.id();
        let changes = rt.node.changes();
        let mut report = PushReport::new(site);

        let mut failed: HashSet<(String, GlobalId)> = changes
            .with_status(site, RecordStatus::Failed)?
            .into_iter()
            .map(|r| (r.table, r.global_id))
            .collect();

        rt.set_state(SyncState::Pushing);
        loop {
            rt.check_cancelled()?;
            let pending = changes.pending_for_site(site, self.config.push_batch_size as usize)?;
            if pending.is_empty() {
                break;
            }

            // Local settlements wait for the transport call, so a failed
            // call leaves every status as it was.
            let mut blocked = Vec::new();
            let mut held_here = Vec::new();
            let mut batch = Vec::with_capacity(pending.len());
            for record in pending {
                let key = (record.table.clone(), record.global_id);
                if failed.contains(&key) {
                    blocked.push(record);
                } else if rt
                    .node
                    .conflicts()
                    .open_for(&record.table, record.global_id)
                    .is_some()
                {
                    held_here.push(record);
                } else {
                    batch.push(record);
                }
            }

            let sent = if batch.is_empty() {
                None
            } else {
                let cursor = changes.load_cursor(rt.peer)?;
                let request = PushRequest::new(site, Some(cursor), batch);
                let response = self.with_retry(rt, || rt.transport.push(&request))?;
                if response.outcomes.len() != request.records.len()
                    || request
                        .records
                        .iter()
                        .zip(&response.outcomes)
                        .any(|(r, o)| r.sequence != o.sequence)
                {
                    return Err(SyncError::Protocol(format!(
                        "push answered {} outcomes for {} records",
                        response.outcomes.len(),
                        request.records.len()
                    )));
                }
                Some((request, response))
            };

            for record in &blocked {
                let reason = RejectReason::BlockedByEarlierFailure;
                changes.transition(
                    record.sequence,
                    RecordStatus::Pending,
                    RecordStatus::Failed,
                    Some(reason.to_string()),
                )?;
                report.record(record, ApplyOutcome::rejected(reason));
            }
            for record in &held_here {
                if let Some(conflict_id) = rt.node.hold_local(record)? {
                    report.record(
                        record,
                        ApplyOutcome::Conflict {
                            conflict_id,
                            opened: false,
                        },
                    );
                }
            }
            let Some((request, response)) = sent else {
                continue;
            };

            for (record, result) in request.records.iter().zip(response.outcomes) {
                let key = (record.table.clone(), record.global_id);
                match &result.outcome {
                    ApplyOutcome::Applied { .. } => {
                        changes.transition(
                            record.sequence,
                            RecordStatus::Pending,
                            RecordStatus::Synced,
                            None,
                        )?;
                    }
                    ApplyOutcome::Conflict { conflict_id, .. } => {
                        changes.flag(record.sequence, *conflict_id)?;
                    }
                    ApplyOutcome::Rejected { reason } => {
                        changes.transition(
                            record.sequence,
                            RecordStatus::Pending,
                            RecordStatus::Failed,
                            Some(reason.to_string()),
                        )?;
                        failed.insert(key);
                    }
                }
                report.record(record, result.outcome);
            }
            report.batches += 1;
            self.renew(rt, lease)?;
        }

        {
            let mut stats = rt.stats.write();
            stats.records_pushed += report.synced as u64;
            stats.conflicts += report.conflicts as u64;
        }
        info!(
            %site,
            batches = report.batches,
            synced = report.synced,
            conflicts = report.conflicts,
            failed = report.failed,
            "push finished"
        );
        Ok(report)
    }

    fn pull_pages(
        &self,
        rt: &SiteRuntime,
        lease: &LeaseGuard<'_>,
        since: u64,
        tables: Option<Vec<String>>,
        save: bool,
    ) -> SyncResult<PullReport> {
        let site = rt.id();
        let ctx = ApplyContext::pull(rt.peer);
        let mut report = PullReport::new(site, tables.clone(), since);
        let mut cursor = since;

        rt.set_state(SyncState::Pulling);
        loop {
            rt.check_cancelled()?;
            let request = PullRequest::new(site, cursor, self.config.pull_batch_size)
                .with_tables(tables.clone());
            let page = self.with_retry(rt, || rt.transport.pull(&request))?;
            if page.has_more && page.new_cursor <= cursor {
                return Err(SyncError::Protocol(format!(
                    "pull cursor stuck at {cursor}"
                )));
            }

            let outcomes = rt.node.apply_batch(&ctx, &page.records)?;
            for (record, outcome) in page.records.iter().zip(outcomes) {
                report.tally(record, outcome);
            }
            report.pages += 1;

            cursor = cursor.max(page.new_cursor);
            if save {
                rt.node.changes().save_cursor(rt.peer, cursor)?;
                report.cursor_saved = true;
            }
            report.cursor = cursor;
            self.renew(rt, lease)?;

            if !page.has_more {
                break;
            }
        }

        {
            let mut stats = rt.stats.write();
            stats.records_pulled += report.applied as u64;
            stats.conflicts += report.conflicts as u64;
        }
        info!(
            %site,
            pages = report.pages,
            applied = report.applied,
            duplicates = report.duplicates,
            conflicts = report.conflicts,
            failed = report.failed,
            cursor = report.cursor,
            "pull finished"
        );
        Ok(report)
    }

    fn reconcile_all(
        &self,
        rt: &SiteRuntime,
        lease: &LeaseGuard<'_>,
        tables: Option<Vec<String>>,
    ) -> SyncResult<FullSyncReport> {
        let site = rt.id();
        rt.set_state(SyncState::Reconciling);
        let request = FullSyncRequest {
            site,
            tables: tables.clone(),
        };
        let response = self.with_retry(rt, || rt.transport.full_sync(&request))?;
        self.renew(rt, lease)?;

        let remove_missing = self.config.full_sync.remove_missing;
        let mut report = FullSyncReport {
            site,
            tables: Vec::with_capacity(response.tables.len()),
            cursor: response.cursor,
            cursor_reset: false,
        };
        for snapshot in &response.tables {
            report
                .tables
                .push(rt.node.reconcile(snapshot, remove_missing)?);
        }

        if tables.is_none() && report.failed() == 0 {
            rt.node.changes().save_cursor(rt.peer, response.cursor)?;
            report.cursor_reset = true;
        }
        info!(
            %site,
            tables = report.tables.len(),
            failed = report.failed(),
            cursor = report.cursor,
            cursor_reset = report.cursor_reset,
            "full sync finished"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("sites", &self.sites.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::transport::MockTransport;
    use sedesync_core::CaptureContext;
    use sedesync_protocol::{
        ChangeRecord, Operation, PullResponse, PushResponse, RecordOutcome, Site, SiteCode,
        Snapshot,
    };

    struct Fixture {
        engine: SyncEngine,
        node: Arc<SiteNode>,
        hub: SiteId,
        transport: Arc<MockTransport>,
    }

    fn fixture() -> Fixture {
        let config = SyncConfig::new()
            .with_push_batch_size(2)
            .with_retry(RetryConfig::new(3).with_initial_delay(Duration::from_millis(1)));
        let engine = SyncEngine::new(config);
        let node = Arc::new(SiteNode::in_memory(Site::new(SiteCode::Norte, "Sede Norte")));
        let hub = SiteId::new();
        let transport = Arc::new(MockTransport::new());
        engine.register(Arc::clone(&node), hub, transport.clone());
        Fixture {
            engine,
            node,
            hub,
            transport,
        }
    }

    fn capture(node: &SiteNode, gid: GlobalId, op: Operation, name: &str) -> ChangeRecord {
        let payload = op.carries_payload().then(|| Snapshot::new().with("name", name));
        node.capture()
            .capture("patients", gid, None, op, payload, CaptureContext::Syncing)
            .record()
            .cloned()
            .unwrap()
    }

    fn answer(records: &[ChangeRecord], outcomes: Vec<ApplyOutcome>) -> PushResponse {
        PushResponse {
            outcomes: records
                .iter()
                .zip(outcomes)
                .map(|(r, outcome)| RecordOutcome {
                    sequence: r.sequence,
                    global_id: r.global_id,
                    outcome,
                })
                .collect(),
        }
    }

    #[test]
    fn push_sets_status_per_outcome() {
        let f = fixture();
        let (a, b) = (GlobalId::new(), GlobalId::new());
        let a1 = capture(&f.node, a, Operation::Create, "Ana");
        let b1 = capture(&f.node, b, Operation::Create, "Beto");
        let a2 = capture(&f.node, a, Operation::Update, "Ana M.");
        let b2 = capture(&f.node, b, Operation::Update, "Beto R.");

        let conflict = ConflictId::new();
        f.transport.queue_push(Ok(answer(
            &[a1.clone(), b1.clone()],
            vec![
                ApplyOutcome::rejected(RejectReason::AlreadyExists),
                ApplyOutcome::Conflict {
                    conflict_id: conflict,
                    opened: true,
                },
            ],
        )));

        f.transport.queue_push(Ok(answer(
            &[b2.clone()],
            vec![ApplyOutcome::Conflict {
                conflict_id: conflict,
                opened: false,
            }],
        )));

        let report = f.engine.push(f.node.id()).unwrap();
        assert_eq!(report.batches, 2);
        assert_eq!((report.synced, report.conflicts, report.failed), (0, 2, 2));

        let changes = f.node.changes();
        let status = |seq| changes.get(seq).unwrap().unwrap();
        assert_eq!(status(a1.sequence).status, RecordStatus::Failed);
        assert_eq!(
            status(a2.sequence).error_detail.as_deref(),
            Some("blocked by earlier failure")
        );
        assert_eq!(status(b1.sequence).conflict, Some(conflict));
        assert_eq!(status(b2.sequence).conflict, Some(conflict));
        assert_eq!(status(b2.sequence).status, RecordStatus::Pending);

        // The later change behind the peer's conflict travels so the peer
        // can hold it in its entry.
        let sent = f.transport.push_requests();
        assert_eq!(sent.len(), 2);
        let second: Vec<u64> = sent[1].records.iter().map(|r| r.sequence).collect();
        assert_eq!(second, vec![b2.sequence]);
    }

    #[test]
    fn blocked_records_wait_for_the_transport() {
        let f = fixture();
        let (g, other) = (GlobalId::new(), GlobalId::new());
        let g1 = capture(&f.node, g, Operation::Update, "Ana");
        f.node
            .changes()
            .transition(
                g1.sequence,
                RecordStatus::Pending,
                RecordStatus::Failed,
                Some("unknown record".into()),
            )
            .unwrap();
        let g2 = capture(&f.node, g, Operation::Update, "Ana M.");
        let fresh = capture(&f.node, other, Operation::Create, "Beto");
        for _ in 0..3 {
            f.transport
                .queue_push(Err(SyncError::transport_retryable("connection refused")));
        }

        assert!(f.engine.push(f.node.id()).unwrap_err().is_transport());
        let changes = f.node.changes();
        let status = |seq| changes.get(seq).unwrap().unwrap().status;
        assert_eq!(status(g2.sequence), RecordStatus::Pending);
        assert_eq!(status(fresh.sequence), RecordStatus::Pending);

        f.transport.queue_push(Ok(answer(
            &[fresh.clone()],
            vec![ApplyOutcome::applied()],
        )));
        let report = f.engine.push(f.node.id()).unwrap();
        assert_eq!((report.synced, report.failed), (1, 1));
        assert_eq!(status(g2.sequence), RecordStatus::Failed);
        assert_eq!(status(fresh.sequence), RecordStatus::Synced);
    }

    #[test]
    fn later_edit_behind_local_conflict_stays_home() {
        let f = fixture();
        let sur = SiteId::new();
        let gid = GlobalId::new();
        let remote = |seq: u64, op: Operation, name: &str| {
            let mut r = ChangeRecord::captured(
                sur,
                "patients",
                gid,
                op,
                Some(Snapshot::new().with("name", name)),
                Utc::now(),
            );
            r.sequence = seq;
            r.origin_sequence = seq;
            r
        };
        let pull = ApplyContext::pull(f.hub);
        f.node
            .apply_batch(&pull, &[remote(1, Operation::Create, "Ana")])
            .unwrap();
        let first = capture(&f.node, gid, Operation::Update, "Ana Norte");
        let outcomes = f
            .node
            .apply_batch(&pull, &[remote(2, Operation::Update, "Ana Sur")])
            .unwrap();
        let ApplyOutcome::Conflict { conflict_id, .. } = outcomes[0].clone() else {
            panic!("expected a conflict, got {:?}", outcomes[0]);
        };

        let later = capture(&f.node, gid, Operation::Update, "Ana Norte 2");
        let report = f.engine.push(f.node.id()).unwrap();
        assert_eq!(report.conflicts, 1);
        assert!(f.transport.push_requests().is_empty());

        let changes = f.node.changes();
        assert_eq!(changes.get(first.sequence).unwrap().unwrap().conflict, Some(conflict_id));
        assert_eq!(changes.get(later.sequence).unwrap().unwrap().conflict, Some(conflict_id));
        let entry = f.node.conflicts().get(conflict_id).unwrap();
        assert_eq!(entry.local.sequence, later.sequence);
        assert_eq!(
            entry.local.payload,
            Some(Snapshot::new().with("name", "Ana Norte 2"))
        );
    }

    #[test]
    fn transport_failure_leaves_statuses_alone() {
        let f = fixture();
        let record = capture(&f.node, GlobalId::new(), Operation::Create, "Ana");
        for _ in 0..3 {
            f.transport
                .queue_push(Err(SyncError::transport_retryable("connection refused")));
        }

        let err = f.engine.push(f.node.id()).unwrap_err();
        assert!(err.is_transport());
        assert_eq!(f.transport.push_requests().len(), 3);
        assert_eq!(
            f.node.changes().get(record.sequence).unwrap().unwrap().status,
            RecordStatus::Pending
        );

        let status = f.engine.status(f.node.id()).unwrap();
        assert_eq!(status.state, SyncState::Error);
        assert_eq!(status.stats.retries, 2);
        assert!(status.stats.last_error.is_some());
    }

    #[test]
    fn push_sends_watermark() {
        let f = fixture();
        f.node.changes().save_cursor(f.hub, 41).unwrap();
        let record = capture(&f.node, GlobalId::new(), Operation::Create, "Ana");
        f.transport.queue_push(Ok(answer(
            &[record.clone()],
            vec![ApplyOutcome::applied()],
        )));

        f.engine.push(f.node.id()).unwrap();
        let sent = f.transport.push_requests();
        assert_eq!(sent[0].expected_cursor, Some(41));
        assert_eq!(sent[0].origin, f.node.id());
        assert_eq!(
            f.node.changes().get(record.sequence).unwrap().unwrap().status,
            RecordStatus::Synced
        );
    }

    #[test]
    fn scoped_pull_keeps_watermark() {
        let f = fixture();
        f.transport.queue_pull(Ok(PullResponse::new(vec![], 9, false)));
        let report = f
            .engine
            .pull(f.node.id(), Some(vec!["patients".into()]))
            .unwrap();
        assert!(!report.cursor_saved);
        assert_eq!(f.node.changes().load_cursor(f.hub).unwrap(), 0);

        f.transport.queue_pull(Ok(PullResponse::new(vec![], 9, false)));
        let report = f.engine.pull(f.node.id(), None).unwrap();
        assert!(report.cursor_saved);
        assert_eq!(f.node.changes().load_cursor(f.hub).unwrap(), 9);
    }

    #[test]
    fn stuck_cursor_is_a_protocol_error() {
        let f = fixture();
        f.transport.queue_pull(Ok(PullResponse::new(vec![], 0, true)));
        assert!(matches!(
            f.engine.pull(f.node.id(), None),
            Err(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn manual_run_refused_while_lease_held() {
        let f = fixture();
        let site = f.node.id();
        let _lease = f.engine.leases().try_acquire(site).unwrap();

        assert!(matches!(f.engine.push(site), Err(SyncError::RunInProgress(s)) if s == site));
        assert_eq!(f.engine.run_incremental(site).unwrap(), RunOutcome::Skipped);
        assert_eq!(f.engine.status(site).unwrap().stats.runs_skipped, 1);
    }

    #[test]
    fn unknown_site() {
        let f = fixture();
        assert!(matches!(
            f.engine.status(SiteId::new()),
            Err(SyncError::UnknownSite(_))
        ));
    }
}
