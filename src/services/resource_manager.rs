//! Concurrency and recursion-depth governance for one orchestrator instance.
//!
//! Accounting is local to the instance. A sub-orchestrator receives a budget
//! carved out of its parent's free slots, and those slots stay held in the
//! parent until the carved budget is dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::domain::errors::{OrchestrationError, OrchestrationResult};

#[derive(Debug, Default)]
struct Gauges {
    active: AtomicUsize,
    carved: AtomicUsize,
    reserved: AtomicUsize,
    peak_active: AtomicUsize,
}

/// Point-in-time accounting view.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub max_concurrent_agents: usize,
    pub current_active_agents: usize,
    pub carved_slots: usize,
    pub reserved_slots: usize,
    pub available_slots: usize,
    pub peak_active_agents: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotUse {
    Reserved,
    Active,
    Carved,
}

/// Held slots. Released when dropped.
#[derive(Debug)]
pub struct SlotReservation {
    _permit: OwnedSemaphorePermit,
    slots: usize,
    usage: SlotUse,
    gauges: Arc<Gauges>,
}

impl SlotReservation {
    fn new(permit: OwnedSemaphorePermit, slots: usize, gauges: Arc<Gauges>) -> Self {
        gauges.reserved.fetch_add(slots, Ordering::AcqRel);
        Self { _permit: permit, slots, usage: SlotUse::Reserved, gauges }
    }

    fn mark(&mut self, usage: SlotUse) {
        self.gauges.reserved.fetch_sub(self.slots, Ordering::AcqRel);
        match usage {
            SlotUse::Active => {
                let now = self.gauges.active.fetch_add(self.slots, Ordering::AcqRel) + self.slots;
                self.gauges.peak_active.fetch_max(now, Ordering::AcqRel);
            }
            SlotUse::Carved => {
                self.gauges.carved.fetch_add(self.slots, Ordering::AcqRel);
            }
            SlotUse::Reserved => {
                self.gauges.reserved.fetch_add(self.slots, Ordering::AcqRel);
            }
        }
        self.usage = usage;
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        let gauge = match self.usage {
            SlotUse::Reserved => &self.gauges.reserved,
            SlotUse::Active => &self.gauges.active,
            SlotUse::Carved => &self.gauges.carved,
        };
        gauge.fetch_sub(self.slots, Ordering::AcqRel);
    }
}

/// A child budget carved from a parent. Dropping it returns the slots.
#[derive(Debug)]
pub struct CarvedBudget {
    _reservation: SlotReservation,
    manager: ResourceManager,
}

impl CarvedBudget {
    pub fn manager(&self) -> &ResourceManager {
        &self.manager
    }
}

#[derive(Debug, Clone)]
pub struct ResourceManager {
    max_concurrent_agents: usize,
    max_recursion_depth: u32,
    semaphore: Arc<Semaphore>,
    gauges: Arc<Gauges>,
}

impl ResourceManager {
    pub fn new(max_concurrent_agents: usize, max_recursion_depth: u32) -> Self {
        let max_concurrent_agents = max_concurrent_agents.max(1);
        Self {
            max_concurrent_agents,
            max_recursion_depth,
            semaphore: Arc::new(Semaphore::new(max_concurrent_agents)),
            gauges: Arc::new(Gauges::default()),
        }
    }

    pub fn max_concurrent_agents(&self) -> usize {
        self.max_concurrent_agents
    }

    pub fn current_active_agents(&self) -> usize {
        self.gauges.active.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            max_concurrent_agents: self.max_concurrent_agents,
            current_active_agents: self.current_active_agents(),
            carved_slots: self.gauges.carved.load(Ordering::Acquire),
            reserved_slots: self.gauges.reserved.load(Ordering::Acquire),
            available_slots: self.available(),
            peak_active_agents: self.gauges.peak_active.load(Ordering::Acquire),
        }
    }

    /// Wait cooperatively until `n` slots are free, failing with
    /// `ResourceExhausted` once `timeout` elapses. Requests larger than the
    /// whole budget fail immediately.
    pub async fn reserve(&self, n: usize, timeout: Duration) -> OrchestrationResult<SlotReservation> {
        let exhausted = |waited: Duration| OrchestrationError::ResourceExhausted {
            requested: n,
            available: self.available(),
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        };

        if n > self.max_concurrent_agents {
            return Err(exhausted(Duration::ZERO));
        }
        let permits = u32::try_from(n).map_err(|_| exhausted(Duration::ZERO))?;

        let started = Instant::now();
        match tokio::time::timeout(timeout, self.semaphore.clone().acquire_many_owned(permits)).await {
            Ok(Ok(permit)) => Ok(SlotReservation::new(permit, n, self.gauges.clone())),
            Ok(Err(_)) | Err(_) => {
                tracing::debug!(requested = n, waited_ms = started.elapsed().as_millis(), "reservation timed out");
                Err(exhausted(started.elapsed()))
            }
        }
    }

    /// Reserve one slot for an agent entering Active.
    pub async fn reserve_agent_slot(&self, timeout: Duration) -> OrchestrationResult<SlotReservation> {
        let mut reservation = self.reserve(1, timeout).await?;
        reservation.mark(SlotUse::Active);
        Ok(reservation)
    }

    /// Carve a child budget of up to `desired` slots from the currently free
    /// slots. Waits for at least one slot.
    pub async fn carve(&self, desired: usize, timeout: Duration) -> OrchestrationResult<CarvedBudget> {
        let desired = desired.clamp(1, self.max_concurrent_agents);
        let take = self.available().clamp(1, desired);
        let mut reservation = self.reserve(take, timeout).await?;
        reservation.mark(SlotUse::Carved);

        tracing::debug!(carved = take, parent_max = self.max_concurrent_agents, "carved child budget");
        Ok(CarvedBudget {
            _reservation: reservation,
            manager: ResourceManager::new(take, self.max_recursion_depth),
        })
    }

    /// Enforce the recursion-depth ceiling.
    pub fn check_depth(&self, depth: u32) -> OrchestrationResult<()> {
        if depth > self.max_recursion_depth {
            return Err(OrchestrationError::DepthExceeded { depth, max_depth: self.max_recursion_depth });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ErrorKind;

    #[tokio::test]
    async fn test_reserve_and_release() {
        let rm = ResourceManager::new(3, 8);
        let r = rm.reserve(2, Duration::from_millis(10)).await.unwrap();
        assert_eq!(rm.available(), 1);
        assert_eq!(rm.snapshot().reserved_slots, 2);
        drop(r);
        assert_eq!(rm.available(), 3);
        assert_eq!(rm.snapshot().reserved_slots, 0);
    }

    #[tokio::test]
    async fn test_reserve_times_out_with_resource_exhausted() {
        let rm = ResourceManager::new(1, 8);
        let _held = rm.reserve_agent_slot(Duration::from_millis(10)).await.unwrap();
        let err = rm.reserve(1, Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_oversized_request_fails_immediately() {
        let rm = ResourceManager::new(2, 8);
        let started = Instant::now();
        assert!(rm.reserve(3, Duration::from_secs(5)).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_reserve_waits_for_release() {
        let rm = ResourceManager::new(1, 8);
        let held = rm.reserve_agent_slot(Duration::from_millis(10)).await.unwrap();

        let waiter = {
            let rm = rm.clone();
            tokio::spawn(async move { rm.reserve_agent_slot(Duration::from_secs(5)).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_active_gauge_and_peak() {
        let rm = ResourceManager::new(4, 8);
        let a = rm.reserve_agent_slot(Duration::from_millis(10)).await.unwrap();
        let b = rm.reserve_agent_slot(Duration::from_millis(10)).await.unwrap();
        assert_eq!(rm.current_active_agents(), 2);
        drop(a);
        drop(b);
        let snapshot = rm.snapshot();
        assert_eq!(snapshot.current_active_agents, 0);
        assert_eq!(snapshot.peak_active_agents, 2);
    }

    #[tokio::test]
    async fn test_carve_takes_from_parent() {
        let parent = ResourceManager::new(6, 8);
        let _busy = parent.reserve_agent_slot(Duration::from_millis(10)).await.unwrap();

        let carved = parent.carve(8, Duration::from_millis(10)).await.unwrap();
        assert_eq!(carved.manager().max_concurrent_agents(), 5);
        assert_eq!(parent.available(), 0);
        assert_eq!(parent.snapshot().carved_slots, 5);

        drop(carved);
        assert_eq!(parent.available(), 5);
        assert_eq!(parent.snapshot().carved_slots, 0);
    }

    #[test]
    fn test_depth_ceiling() {
        let rm = ResourceManager::new(1, 2);
        assert!(rm.check_depth(2).is_ok());
        assert_eq!(rm.check_depth(3).unwrap_err().kind(), ErrorKind::DepthExceeded);
    }
}
