//! Per-job port allocation.
//!
//! Each concurrent job owns an allocator seeded with a disjoint base port, so
//! fixtures never reach for a global counter.

use parking_lot::Mutex;

pub struct PortAllocator {
    next: Mutex<u16>,
}

impl PortAllocator {
    pub fn new(base_port: u16) -> Self {
        Self {
            next: Mutex::new(base_port),
        }
    }

    pub fn next_port(&self) -> u16 {
        let mut next = self.next.lock();
        let port = *next;
        // Running out of the 16-bit range means a misconfigured base port.
        *next = next.checked_add(1).expect("port allocator exhausted");
        port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_sequential_from_the_base() {
        let allocator = PortAllocator::new(20000);
        assert_eq!(allocator.next_port(), 20000);
        assert_eq!(allocator.next_port(), 20001);
        assert_eq!(allocator.next_port(), 20002);
    }
}
