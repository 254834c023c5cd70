//! Benchmark utilities.

#![warn(missing_docs)]

use chrono::Utc;
use rand::Rng;
use sedesync_protocol::{ChangeRecord, GlobalId, Operation, SiteId, Snapshot};

/// Table used by generated records.
pub const TABLE: &str = "patients";

/// A patient-like snapshot with a random phone and balance.
pub fn random_snapshot() -> Snapshot {
    let mut rng = rand::thread_rng();
    Snapshot::new()
        .with("name", format!("Paciente {}", rng.gen_range(0..100_000)))
        .with("phone", format!("555-{:04}", rng.gen_range(0..10_000)))
        .with(
            "balance",
            format!("{}.{:02}", rng.gen_range(0..100_000), rng.gen_range(0..100)),
        )
        .with("active", true)
}

/// `count` CREATE records from `site`, as they would arrive from a peer.
pub fn remote_creates(site: SiteId, count: usize) -> Vec<ChangeRecord> {
    (1..=count as u64)
        .map(|seq| {
            let mut record = ChangeRecord::captured(
                site,
                TABLE,
                GlobalId::new(),
                Operation::Create,
                Some(random_snapshot()),
                Utc::now(),
            );
            record.sequence = seq;
            record.origin_sequence = seq;
            record
        })
        .collect()
}

/// A CREATE followed by `updates` UPDATEs of one record, from `site`.
pub fn remote_history(site: SiteId, updates: usize) -> Vec<ChangeRecord> {
    let global_id = GlobalId::new();
    (0..=updates as u64)
        .map(|n| {
            let operation = if n == 0 {
                Operation::Create
            } else {
                Operation::Update
            };
            let mut record = ChangeRecord::captured(
                site,
                TABLE,
                global_id,
                operation,
                Some(random_snapshot()),
                Utc::now(),
            );
            record.sequence = n + 1;
            record.origin_sequence = n + 1;
            record
        })
        .collect()
}
