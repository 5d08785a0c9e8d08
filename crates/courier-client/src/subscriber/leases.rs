// Leases received from the broker and not yet acked, nacked or expired. A lease
// is tracked from receipt, so messages held back by flow control are extended too.
use courier_common::LeaseId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Lease {
    pub(crate) charged_bytes: u64,
    pub(crate) received_at: Instant,
    /// Passed flow control and handed to the caller.
    pub(crate) admitted: bool,
}

impl Lease {
    pub(crate) fn held(received_at: Instant) -> Self {
        Self {
            charged_bytes: 0,
            received_at,
            admitted: false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct LeaseTable {
    leases: Mutex<HashMap<LeaseId, Lease>>,
}

/// Result of one extension sweep.
#[derive(Debug, Default)]
pub(crate) struct Sweep {
    pub(crate) live: Vec<LeaseId>,
    pub(crate) expired: Vec<Lease>,
}

impl LeaseTable {
    /// Track a message from the moment its frame arrives.
    pub(crate) fn hold(&self, lease_id: LeaseId, received_at: Instant) {
        self.insert(lease_id, Lease::held(received_at));
    }

    pub(crate) fn insert(&self, lease_id: LeaseId, lease: Lease) {
        self.leases.lock().insert(lease_id, lease);
    }

    /// Record the flow-control charge once a held-back message is admitted.
    /// `false` when the lease expired or was released while the message waited.
    pub(crate) fn admit(&self, lease_id: &LeaseId, charged_bytes: u64) -> bool {
        match self.leases.lock().get_mut(lease_id) {
            Some(lease) => {
                lease.charged_bytes = charged_bytes;
                lease.admitted = true;
                true
            }
            None => false,
        }
    }

    /// Removes the lease; `None` when it was never known or is already settled.
    pub(crate) fn remove(&self, lease_id: &LeaseId) -> Option<Lease> {
        self.leases.lock().remove(lease_id)
    }

    /// Drop leases held longer than `max_extension`; report the rest for extension.
    pub(crate) fn sweep(&self, now: Instant, max_extension: Duration) -> Sweep {
        let mut leases = self.leases.lock();
        let mut sweep = Sweep::default();
        leases.retain(|lease_id, lease| {
            if now.duration_since(lease.received_at) >= max_extension {
                sweep.expired.push(*lease);
                false
            } else {
                sweep.live.push(lease_id.clone());
                true
            }
        });
        sweep
    }

    /// Forget messages that were received but never admitted; their stream is gone.
    pub(crate) fn drop_held(&self) -> usize {
        let mut leases = self.leases.lock();
        let before = leases.len();
        leases.retain(|_, lease| lease.admitted);
        before - leases.len()
    }

    pub(crate) fn drain(&self) -> Vec<(LeaseId, Lease)> {
        self.leases.lock().drain().collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.leases.lock().len()
    }
}
