//! Public TCP port allocation

use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::{Mutex, PoisonError};
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::error::RelayError;

/// Hands out ports from a range by sampling and binding
///
/// A port counts as allocated from the moment it is reserved until
/// [`release`](Self::release); binding is the availability check, so there is
/// no window between checking and listening.
pub struct PortAllocator {
    bind_addr: IpAddr,
    range: RangeInclusive<u16>,
    max_attempts: u32,
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(bind_addr: IpAddr, range: RangeInclusive<u16>, max_attempts: u32) -> Self {
        Self {
            bind_addr,
            range,
            max_attempts: max_attempts.max(1),
            allocated: Mutex::new(HashSet::new()),
        }
    }

    fn allocated(&self) -> std::sync::MutexGuard<'_, HashSet<u16>> {
        self.allocated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve a free port and bind a listener on it
    pub async fn allocate(&self) -> Result<(u16, TcpListener), RelayError> {
        for attempt in 1..=self.max_attempts {
            let port = rand::thread_rng().gen_range(self.range.clone());

            if !self.allocated().insert(port) {
                debug!("Port {} already allocated (attempt {})", port, attempt);
                continue;
            }

            match TcpListener::bind(SocketAddr::new(self.bind_addr, port)).await {
                Ok(listener) => {
                    debug!("Allocated port {} on attempt {}", port, attempt);
                    return Ok((port, listener));
                }
                Err(e) => {
                    debug!("Port {} not bindable: {}", port, e);
                    self.allocated().remove(&port);
                    // let recently aborted listeners finish dropping
                    tokio::task::yield_now().await;
                }
            }
        }

        warn!(
            "Port range {}-{} exhausted after {} attempts",
            self.range.start(),
            self.range.end(),
            self.max_attempts
        );
        Err(RelayError::AllocationExhausted(self.max_attempts))
    }

    /// Return a port to the pool
    pub fn release(&self, port: u16) -> bool {
        self.allocated().remove(&port)
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.allocated().contains(&port)
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_allocated_ports_are_distinct() {
        let allocator = PortAllocator::new(LOCALHOST, 41000..=41999, 64);
        let mut listeners = Vec::new();
        let mut ports = HashSet::new();
        for _ in 0..5 {
            let (port, listener) = allocator.allocate().await.unwrap();
            assert!((41000..=41999).contains(&port));
            assert_eq!(listener.local_addr().unwrap().port(), port);
            assert!(ports.insert(port));
            listeners.push(listener);
        }
        assert_eq!(allocator.allocated_count(), 5);
    }

    #[tokio::test]
    async fn test_exhausted_range() {
        let allocator = PortAllocator::new(LOCALHOST, 42100..=42100, 4);
        let (port, _listener) = allocator.allocate().await.unwrap();
        assert_eq!(port, 42100);

        assert_eq!(
            allocator.allocate().await.unwrap_err(),
            RelayError::AllocationExhausted(4)
        );
    }

    #[tokio::test]
    async fn test_release_makes_port_eligible() {
        let allocator = PortAllocator::new(LOCALHOST, 42200..=42200, 4);
        let (port, listener) = allocator.allocate().await.unwrap();
        drop(listener);

        assert!(allocator.release(port));
        assert!(!allocator.is_allocated(port));
        let (again, _listener) = allocator.allocate().await.unwrap();
        assert_eq!(again, port);
    }

    #[tokio::test]
    async fn test_skips_ports_bound_elsewhere() {
        let _squatter = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 42300)).unwrap();
        let allocator = PortAllocator::new(LOCALHOST, 42300..=42300, 3);

        assert!(matches!(
            allocator.allocate().await,
            Err(RelayError::AllocationExhausted(3))
        ));
        assert!(!allocator.is_allocated(42300));
    }
}
