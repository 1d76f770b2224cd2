//! Per-queue cache fill state machine.
//!
//! `Uninitialized → Filling → Ok`, with `Ok → Filling` when the
//! consistency check finds the cache lying. Both claims are
//! compare-and-swap transitions so exactly one fill task can be in
//! flight per queue; a plain read-then-write here would let two cold
//! callers both start copying.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheState {
    /// No fill has been claimed for this queue yet.
    Uninitialized = 0,
    /// A fill task is copying durable contents into the cache; reads go
    /// to the durable store, writes go to both.
    Filling = 1,
    /// The cache mirrors the durable store; reads are served from it.
    Ok = 2,
}

impl From<u8> for CacheState {
    fn from(value: u8) -> Self {
        match value {
            1 => CacheState::Filling,
            2 => CacheState::Ok,
            _ => CacheState::Uninitialized,
        }
    }
}

pub struct QueueCacheState {
    state: AtomicU8,
}

impl QueueCacheState {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(CacheState::Uninitialized as u8),
        }
    }

    pub fn state(&self) -> CacheState {
        CacheState::from(self.state.load(Ordering::Acquire))
    }

    /// Claim the cold-start fill. Returns true for exactly one caller.
    pub fn claim_fill(&self) -> bool {
        self.state
            .compare_exchange(
                CacheState::Uninitialized as u8,
                CacheState::Filling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Claim a re-fill after an inconsistency was detected. Only valid
    /// from Ok, so a running fill is never doubled.
    pub fn claim_refill(&self) -> bool {
        self.state
            .compare_exchange(
                CacheState::Ok as u8,
                CacheState::Filling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Fill finished; reads switch to the cache.
    pub fn complete_fill(&self) {
        let _ = self.state.compare_exchange(
            CacheState::Filling as u8,
            CacheState::Ok as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Fill failed; drop back to Uninitialized so the next access
    /// re-claims.
    pub fn abort_fill(&self) {
        self.state
            .store(CacheState::Uninitialized as u8, Ordering::Release);
    }
}

impl Default for QueueCacheState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_single_claim() {
        let state = QueueCacheState::new();
        assert_eq!(state.state(), CacheState::Uninitialized);
        assert!(state.claim_fill());
        assert!(!state.claim_fill());
        assert_eq!(state.state(), CacheState::Filling);

        state.complete_fill();
        assert_eq!(state.state(), CacheState::Ok);
    }

    #[test]
    fn test_refill_only_from_ok() {
        let state = QueueCacheState::new();
        assert!(!state.claim_refill());

        state.claim_fill();
        assert!(!state.claim_refill());

        state.complete_fill();
        assert!(state.claim_refill());
        assert!(!state.claim_refill());
        assert_eq!(state.state(), CacheState::Filling);
    }

    #[test]
    fn test_abort_allows_reclaim() {
        let state = QueueCacheState::new();
        state.claim_fill();
        state.abort_fill();
        assert_eq!(state.state(), CacheState::Uninitialized);
        assert!(state.claim_fill());
    }

    #[test]
    fn test_concurrent_claims_yield_one_winner() {
        let state = Arc::new(QueueCacheState::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let state = state.clone();
            handles.push(std::thread::spawn(move || state.claim_fill()));
        }
        let winners: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }
}
