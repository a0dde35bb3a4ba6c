//! Stream id allocation.
//!
//! Client-issued ids are odd starting at 1, server-issued ids are even starting
//! at 2. Id 0 is the control channel. Ids are never reused within a session.

use crate::error::TetherError;
use crate::frame::MAX_STREAM_ID;
use crate::state::Role;
use std::sync::atomic::{AtomicU32, Ordering};

pub type StreamId = u32;

/// Issues stream ids for one side of a session
#[derive(Debug)]
pub struct StreamIdAllocator {
    next: AtomicU32,
}

impl StreamIdAllocator {
    /// Allocator for the initiator role (odd ids)
    pub fn client() -> Self {
        Self::starting_at(1)
    }

    /// Allocator for the acceptor role (even ids)
    pub fn server() -> Self {
        Self::starting_at(2)
    }

    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Client => Self::client(),
            Role::Server => Self::server(),
        }
    }

    fn starting_at(first: StreamId) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Take the next id
    ///
    /// Fails once the id space is used up; the allocator stays exhausted.
    pub fn next(&self) -> Result<StreamId, TetherError> {
        let mut current = self.next.load(Ordering::Acquire);
        loop {
            if current > MAX_STREAM_ID {
                return Err(TetherError::IdSpaceExhausted);
            }
            // past the max the counter parks above MAX_STREAM_ID
            let following = current.saturating_add(2);
            match self.next.compare_exchange_weak(
                current,
                following,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_client_ids_are_odd() {
        let ids = StreamIdAllocator::client();
        assert_eq!(ids.next().unwrap(), 1);
        assert_eq!(ids.next().unwrap(), 3);
        assert_eq!(ids.next().unwrap(), 5);
    }

    #[test]
    fn test_server_ids_are_even() {
        let ids = StreamIdAllocator::for_role(Role::Server);
        assert_eq!(ids.next().unwrap(), 2);
        assert_eq!(ids.next().unwrap(), 4);
    }

    #[test]
    fn test_exhaustion() {
        let ids = StreamIdAllocator::starting_at(MAX_STREAM_ID - 2);
        assert_eq!(ids.next().unwrap(), MAX_STREAM_ID - 2);
        assert_eq!(ids.next().unwrap(), MAX_STREAM_ID);
        assert_eq!(ids.next(), Err(TetherError::IdSpaceExhausted));
        assert_eq!(ids.next(), Err(TetherError::IdSpaceExhausted));

        let ids = StreamIdAllocator::starting_at(MAX_STREAM_ID - 1);
        assert_eq!(ids.next().unwrap(), MAX_STREAM_ID - 1);
        assert_eq!(ids.next(), Err(TetherError::IdSpaceExhausted));
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let ids = Arc::new(StreamIdAllocator::client());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || {
                    (0..250).map(|_| ids.next().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert_eq!(id % 2, 1);
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
