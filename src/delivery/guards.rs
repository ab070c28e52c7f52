//! Per-request delivery guard.
//!
//! At most one `deliver` call may run for a request at a time in this process.
//! Holding a [`DeliveryGuard`] is that permission; dropping it releases it.

use std::sync::Arc;

use dashmap::DashSet;

use crate::request::RequestId;

/// Set of requests with a delivery in progress.
#[derive(Debug, Clone, Default)]
pub struct DeliveryGuards {
    active: Arc<DashSet<RequestId>>,
}

impl DeliveryGuards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the request, or `None` if another delivery holds it.
    pub fn try_acquire(&self, id: RequestId) -> Option<DeliveryGuard> {
        self.active.insert(id).then(|| DeliveryGuard {
            id,
            active: self.active.clone(),
        })
    }

    pub fn is_active(&self, id: RequestId) -> bool {
        self.active.contains(&id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Released on drop, including on panic or cancellation of the holder.
#[derive(Debug)]
pub struct DeliveryGuard {
    id: RequestId,
    active: Arc<DashSet<RequestId>>,
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        self.active.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let guards = DeliveryGuards::new();
        let id = RequestId::new();

        let guard = guards.try_acquire(id).unwrap();
        assert!(guards.try_acquire(id).is_none());
        assert!(guards.is_active(id));

        // Other requests are independent.
        let other = guards.try_acquire(RequestId::new()).unwrap();
        assert_eq!(guards.active_count(), 2);

        drop(guard);
        assert!(guards.try_acquire(id).is_some());
        drop(other);
    }
}
