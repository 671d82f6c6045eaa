//! Port allocation for site processes
//!
//! Ports come from a fixed inclusive range. Reservations live in memory only;
//! reconciliation rebuilds them from the set of live processes.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, warn};

use crate::error::PortsExhausted;

/// Hands out ports from `[low, high]`, lowest free port first
#[derive(Debug)]
pub struct PortAllocator {
    low: u16,
    high: u16,
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(low: u16, high: u16) -> Self {
        Self {
            low,
            high,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.low, self.high)
    }

    /// Reserve the lowest free port in the range
    pub fn allocate(&self) -> Result<u16, PortsExhausted> {
        let mut in_use = self.in_use.lock();

        let port = (self.low..=self.high)
            .find(|p| !in_use.contains(p))
            .ok_or(PortsExhausted {
                low: self.low,
                high: self.high,
            })?;

        in_use.insert(port);
        debug!(port, "Allocated port");
        Ok(port)
    }

    /// Return a port to the free pool. Releasing a free port is a no-op
    pub fn release(&self, port: u16) {
        if self.in_use.lock().remove(&port) {
            debug!(port, "Released port");
        }
    }

    /// Mark a specific port as reserved. Returns false if it is outside the range
    pub fn reserve(&self, port: u16) -> bool {
        if port < self.low || port > self.high {
            warn!(port, low = self.low, high = self.high, "Refusing to reserve port outside range");
            return false;
        }
        self.in_use.lock().insert(port);
        true
    }

    /// Keep only the reservations contained in `live` and reserve any live
    /// port not yet reserved. Returns the ports that were released.
    pub fn retain(&self, live: &HashSet<u16>) -> Vec<u16> {
        let mut in_use = self.in_use.lock();

        let ghosts: Vec<u16> = in_use.iter().copied().filter(|p| !live.contains(p)).collect();
        for port in &ghosts {
            in_use.remove(port);
        }
        for &port in live {
            if port >= self.low && port <= self.high {
                in_use.insert(port);
            }
        }

        ghosts
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.in_use.lock().contains(&port)
    }

    /// Snapshot of reserved ports in ascending order
    pub fn in_use(&self) -> Vec<u16> {
        self.in_use.lock().iter().copied().collect()
    }

    pub fn free_count(&self) -> usize {
        let total = (self.high as usize + 1).saturating_sub(self.low as usize);
        total - self.in_use.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_lowest_free_port() {
        let ports = PortAllocator::new(3010, 3012);
        assert_eq!(ports.allocate().unwrap(), 3010);
        assert_eq!(ports.allocate().unwrap(), 3011);

        ports.release(3010);
        assert_eq!(ports.allocate().unwrap(), 3010);
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let ports = PortAllocator::new(3010, 3011);
        ports.allocate().unwrap();
        ports.allocate().unwrap();

        let err = ports.allocate().unwrap_err();
        assert_eq!(err, PortsExhausted { low: 3010, high: 3011 });
        assert_eq!(ports.free_count(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let ports = PortAllocator::new(3010, 3019);
        let port = ports.allocate().unwrap();

        ports.release(port);
        ports.release(port);
        ports.release(4000);

        assert!(!ports.is_reserved(port));
        assert_eq!(ports.free_count(), 10);
    }

    #[test]
    fn test_reserve_rejects_out_of_range() {
        let ports = PortAllocator::new(3010, 3019);
        assert!(ports.reserve(3015));
        assert!(!ports.reserve(80));
        assert_eq!(ports.in_use(), vec![3015]);
        assert_eq!(ports.allocate().unwrap(), 3010);
    }

    #[test]
    fn test_retain_releases_ghosts() {
        let ports = PortAllocator::new(3010, 3019);
        for _ in 0..3 {
            ports.allocate().unwrap();
        }

        let live: HashSet<u16> = [3011, 3015].into_iter().collect();
        let released = ports.retain(&live);

        assert_eq!(released, vec![3010, 3012]);
        assert_eq!(ports.in_use(), vec![3011, 3015]);
    }

    #[test]
    fn test_single_port_range() {
        let ports = PortAllocator::new(3010, 3010);
        assert_eq!(ports.free_count(), 1);
        assert_eq!(ports.allocate().unwrap(), 3010);
        assert!(ports.allocate().is_err());
    }
}
