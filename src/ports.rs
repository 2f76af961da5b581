use crate::error::{NetjailError, Result};
use std::collections::HashSet;

/// Hands out concrete host ports for dynamic (`host_port: 0`) mappings from
/// a fixed window, skipping ports already held by live attachments.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    start: u16,
    total: u16,
}

impl PortAllocator {
    pub fn new(start: u16, total: u16) -> Self {
        Self { start, total }
    }

    /// Allocates `count` distinct ports not present in `in_use`, in
    /// ascending window order.
    pub fn allocate(&self, count: usize, in_use: &HashSet<u16>) -> Result<Vec<u16>> {
        let end = u32::from(self.start) + u32::from(self.total);
        let mut allocated = Vec::with_capacity(count);

        for candidate in u32::from(self.start)..end {
            if allocated.len() == count {
                break;
            }
            let port = candidate as u16;
            if !in_use.contains(&port) {
                allocated.push(port);
            }
        }

        if allocated.len() < count {
            return Err(NetjailError::PortAllocation(format!(
                "Requested {} dynamic ports but only {} free in window {}..{}",
                count,
                allocated.len(),
                self.start,
                end
            )));
        }
        Ok(allocated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocates_from_window_start() {
        let allocator = PortAllocator::new(60000, 56);
        let ports = allocator.allocate(2, &HashSet::new()).unwrap();
        assert_eq!(ports, vec![60000, 60001]);
    }

    #[test]
    fn test_skips_ports_in_use() {
        let allocator = PortAllocator::new(60000, 56);
        let in_use: HashSet<u16> = [60000, 60002].into();
        let ports = allocator.allocate(3, &in_use).unwrap();
        assert_eq!(ports, vec![60001, 60003, 60004]);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let allocator = PortAllocator::new(60000, 2);
        let err = allocator.allocate(3, &HashSet::new()).unwrap_err();
        assert!(err.to_string().contains("only 2 free"));
    }

    #[test]
    fn test_window_end_is_exclusive() {
        let allocator = PortAllocator::new(60000, 2);
        let ports = allocator.allocate(2, &HashSet::new()).unwrap();
        assert_eq!(ports, vec![60000, 60001]);
    }

    #[test]
    fn test_zero_count_allocates_nothing() {
        let allocator = PortAllocator::new(60000, 56);
        assert!(allocator.allocate(0, &HashSet::new()).unwrap().is_empty());
    }
}
