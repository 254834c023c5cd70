//! Per-site run leases.
//!
//! At most one run may work on a site at a time. A lease expires after
//! its TTL unless renewed, so a runner that died mid-run cannot keep the
//! site locked forever.

use parking_lot::Mutex;
use sedesync_protocol::SiteId;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: Uuid,
    expires_at: Instant,
}

/// Expiring run locks keyed by site id.
#[derive(Debug)]
pub struct SiteLeases {
    ttl: Duration,
    held: Mutex<HashMap<SiteId, Lease>>,
}

impl SiteLeases {
    /// Creates an empty lease table.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Takes the lease for `site`, or returns `None` if a live lease exists.
    ///
    /// An expired lease is taken over.
    pub fn try_acquire(&self, site: SiteId) -> Option<LeaseGuard<'_>> {
        let now = Instant::now();
        let mut held = self.held.lock();
        if let Some(current) = held.get(&site) {
            if current.expires_at > now {
                return None;
            }
            warn!(%site, lease = %current.token, "taking over expired lease");
        }
        let token = Uuid::new_v4();
        held.insert(
            site,
            Lease {
                token,
                expires_at: now + self.ttl,
            },
        );
        Some(LeaseGuard {
            leases: self,
            site,
            token,
        })
    }

    /// Whether a live lease exists for `site`.
    pub fn is_held(&self, site: SiteId) -> bool {
        self.held
            .lock()
            .get(&site)
            .is_some_and(|l| l.expires_at > Instant::now())
    }
}

/// A held lease, released on drop.
#[derive(Debug)]
pub struct LeaseGuard<'a> {
    leases: &'a SiteLeases,
    site: SiteId,
    token: Uuid,
}

impl LeaseGuard<'_> {
    /// Extends the lease by a full TTL.
    ///
    /// Returns false if the lease expired and was taken over.
    pub fn renew(&self) -> bool {
        let mut held = self.leases.held.lock();
        match held.get_mut(&self.site) {
            Some(lease) if lease.token == self.token => {
                lease.expires_at = Instant::now() + self.leases.ttl;
                true
            }
            _ => false,
        }
    }

    /// The leased site.
    pub fn site(&self) -> SiteId {
        self.site
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.leases.held.lock();
        if held.get(&self.site).is_some_and(|l| l.token == self.token) {
            held.remove(&self.site);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn one_holder_per_site() {
        let leases = SiteLeases::new(Duration::from_secs(60));
        let norte = SiteId::new();
        let sur = SiteId::new();

        let guard = leases.try_acquire(norte).unwrap();
        assert!(leases.try_acquire(norte).is_none());
        assert!(leases.try_acquire(sur).is_some());
        assert!(leases.is_held(norte));

        drop(guard);
        assert!(!leases.is_held(norte));
        assert!(leases.try_acquire(norte).is_some());
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let leases = SiteLeases::new(Duration::from_millis(200));
        let site = SiteId::new();

        let crashed = leases.try_acquire(site).unwrap();
        thread::sleep(Duration::from_millis(250));

        let next = leases.try_acquire(site).unwrap();
        assert!(!crashed.renew());
        drop(crashed);
        assert!(leases.is_held(site));
        assert!(next.renew());
    }
}
