//! Per-bank conflict resolution for a banked store.
//!
//! Every tick each requestor (transfer engine, scheduler ports, reduce unit)
//! presents at most one request. A request names every bank its access
//! touches: a wide beat, a weight row or a column of activations may span
//! several. A request is granted only when it wins all of its banks, so no
//! bank ever serves two requestors in the same tick. Losers re-request on
//! the next tick.
//!
//! # Policy
//!
//! Requests are granted greedily, in this order, while every bank they
//! name is still free:
//!
//! 1. Priority-3 requests, lowest requestor index first. Round-robin
//!    pointers are left alone.
//! 2. The rest, nearest first: a request's distance is how far past a
//!    bank's pointer its requestor sits (modulo the requestor count),
//!    minimised over its banks. Ties go to the lower index. A granted
//!    request moves the pointer of each of its banks to one past it.
//!
//! With single-bank requests this is plain per-bank round robin, and
//! without priority-3 traffic a requestor waits at most
//! `num_requestors - 1` ticks behind any bank.
//!
//! # Usage
//!
//! ```ignore
//! use tritone_emu::device::arbiter::{AccessKind, ArbiterRequest, BankArbiter};
//!
//! let mut arbiter = BankArbiter::new(8, 5);
//! let result = arbiter.arbitrate(&[
//!     ArbiterRequest::new(0, 3, AccessKind::Write, 1),
//!     ArbiterRequest::spanning(2, &[1, 2, 3], AccessKind::Read, 1),
//! ]);
//! assert!(result.is_granted(0));
//! assert!(result.is_stalled(2));
//! ```

use smallvec::SmallVec;

use super::banked_store::BufferClass;
use super::tritone_spec::MAX_PRIORITY;

/// Fixed requestor indices shared by every store's arbiter.
pub mod requestor {
    pub const DMA: usize = 0;
    pub const WEIGHT_PORT: usize = 1;
    pub const ACTIVATION_PORT: usize = 2;
    pub const OUTPUT_PORT: usize = 3;
    pub const REDUCE: usize = 4;

    pub const COUNT: usize = 5;
}

/// Direction of a bank access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// Banks touched by one request.
pub type BankSet = SmallVec<[usize; 8]>;

/// Word addresses touched by one step.
pub type AddressSet = SmallVec<[u32; 8]>;

/// One requestor's bid for a set of banks in the current tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbiterRequest {
    pub requestor: usize,
    /// Sorted, without duplicates.
    pub banks: BankSet,
    pub kind: AccessKind,
    /// 0..=3. Values above 3 are clamped.
    pub priority: u8,
}

impl ArbiterRequest {
    pub fn new(requestor: usize, bank: usize, kind: AccessKind, priority: u8) -> Self {
        Self::spanning(requestor, &[bank], kind, priority)
    }

    /// Request for every bank in `banks`, all or nothing.
    pub fn spanning(requestor: usize, banks: &[usize], kind: AccessKind, priority: u8) -> Self {
        let mut banks: BankSet = banks.iter().copied().collect();
        banks.sort_unstable();
        banks.dedup();
        Self {
            requestor,
            banks,
            kind,
            priority: priority.min(MAX_PRIORITY),
        }
    }

    fn is_urgent(&self) -> bool {
        self.priority >= MAX_PRIORITY
    }
}

/// A component's store access for the coming tick, before arbitration.
///
/// Carries every word address the step touches, leading address first; the
/// orchestrator maps them to banks of the addressed store and attaches the
/// configured priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRequest {
    pub requestor: usize,
    pub class: BufferClass,
    pub addresses: AddressSet,
    pub kind: AccessKind,
}

impl PortRequest {
    pub fn single(requestor: usize, class: BufferClass, address: u32, kind: AccessKind) -> Self {
        Self::spanning(requestor, class, std::iter::once(address), kind)
    }

    pub fn spanning(
        requestor: usize,
        class: BufferClass,
        addresses: impl IntoIterator<Item = u32>,
        kind: AccessKind,
    ) -> Self {
        Self {
            requestor,
            class,
            addresses: addresses.into_iter().collect(),
            kind,
        }
    }

    /// First address of the step.
    pub fn address(&self) -> u32 {
        self.addresses.first().copied().unwrap_or_default()
    }
}

/// Per-requestor outcome of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrantStatus {
    /// No request this tick.
    #[default]
    Idle,
    Granted,
    /// Lost arbitration; retry next tick.
    Stalled,
}

/// Outcome of one arbitration round, indexed by requestor.
#[derive(Debug, Clone)]
pub struct ArbitrationResult {
    statuses: SmallVec<[GrantStatus; 8]>,
}

impl ArbitrationResult {
    fn new(num_requestors: usize) -> Self {
        Self {
            statuses: SmallVec::from_elem(GrantStatus::Idle, num_requestors),
        }
    }

    pub fn status(&self, requestor: usize) -> GrantStatus {
        self.statuses.get(requestor).copied().unwrap_or_default()
    }

    pub fn is_granted(&self, requestor: usize) -> bool {
        self.status(requestor) == GrantStatus::Granted
    }

    pub fn is_stalled(&self, requestor: usize) -> bool {
        self.status(requestor) == GrantStatus::Stalled
    }

    pub fn grant_count(&self) -> usize {
        self.statuses.iter().filter(|s| **s == GrantStatus::Granted).count()
    }
}

/// Arbiter statistics.
#[derive(Debug, Clone, Default)]
pub struct ArbiterStats {
    /// Ticks in which two or more requestors targeted the bank.
    pub bank_conflicts: Vec<u64>,
    /// Sum of `bank_conflicts`.
    pub total_conflicts: u64,
    /// Requests granted.
    pub grants: u64,
    /// Requests stalled.
    pub stalls: u64,
    /// Contested grants won by a priority-3 request.
    pub priority_overrides: u64,
}

/// Priority + per-bank round-robin arbiter.
#[derive(Debug, Clone)]
pub struct BankArbiter {
    num_banks: usize,
    num_requestors: usize,
    /// Next requestor to favour, one pointer per bank.
    rr_pointer: Vec<usize>,
    stats: ArbiterStats,
}

impl BankArbiter {
    pub fn new(num_banks: usize, num_requestors: usize) -> Self {
        Self {
            num_banks,
            num_requestors,
            rr_pointer: vec![0; num_banks],
            stats: ArbiterStats {
                bank_conflicts: vec![0; num_banks],
                ..Default::default()
            },
        }
    }

    pub fn num_banks(&self) -> usize {
        self.num_banks
    }

    pub fn num_requestors(&self) -> usize {
        self.num_requestors
    }

    /// Current round-robin pointer of a bank.
    pub fn pointer(&self, bank: usize) -> usize {
        self.rr_pointer.get(bank).copied().unwrap_or(0)
    }

    /// Resolve one tick worth of requests.
    pub fn arbitrate(&mut self, requests: &[ArbiterRequest]) -> ArbitrationResult {
        let mut result = ArbitrationResult::new(self.num_requestors);

        // One request per requestor; later duplicates are dropped.
        let mut accepted: SmallVec<[&ArbiterRequest; 8]> = SmallVec::new();
        for req in requests {
            if req.requestor >= self.num_requestors
                || req.banks.is_empty()
                || req.banks.iter().any(|b| *b >= self.num_banks)
            {
                log::warn!(
                    "Arbiter request out of range: requestor={} banks={:?}",
                    req.requestor, req.banks
                );
                continue;
            }
            if accepted.iter().any(|r| r.requestor == req.requestor) {
                log::warn!("Requestor {} issued more than one request this tick", req.requestor);
                continue;
            }
            accepted.push(req);
        }

        let mut contested: SmallVec<[bool; 16]> = SmallVec::from_elem(false, self.num_banks);
        for bank in 0..self.num_banks {
            let contenders = accepted.iter().filter(|r| r.banks.contains(&bank)).count();
            if contenders > 1 {
                contested[bank] = true;
                self.stats.bank_conflicts[bank] += 1;
                self.stats.total_conflicts += 1;
            }
        }

        let pointers = &self.rr_pointer;
        let n = self.num_requestors;
        accepted.sort_by_key(|r| {
            let distance = r
                .banks
                .iter()
                .map(|b| (r.requestor + n - pointers[*b]) % n)
                .min()
                .unwrap_or(n);
            (!r.is_urgent(), if r.is_urgent() { 0 } else { distance }, r.requestor)
        });

        let mut owner: SmallVec<[Option<usize>; 16]> = SmallVec::from_elem(None, self.num_banks);
        for req in &accepted {
            if let Some(holder) = req.banks.iter().find_map(|b| owner[*b]) {
                result.statuses[req.requestor] = GrantStatus::Stalled;
                self.stats.stalls += 1;
                log::trace!("Banks {:?}: requestor {} lost to {}", req.banks, req.requestor, holder);
                continue;
            }
            for bank in &req.banks {
                owner[*bank] = Some(req.requestor);
            }
            result.statuses[req.requestor] = GrantStatus::Granted;
            self.stats.grants += 1;
            if req.is_urgent() {
                if req.banks.iter().any(|b| contested[*b]) {
                    self.stats.priority_overrides += 1;
                }
            } else {
                for bank in &req.banks {
                    self.rr_pointer[*bank] = (req.requestor + 1) % n;
                }
            }
        }

        result
    }

    pub fn stats(&self) -> &ArbiterStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ArbiterStats {
            bank_conflicts: vec![0; self.num_banks],
            ..Default::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(requestor: usize, bank: usize) -> ArbiterRequest {
        ArbiterRequest::new(requestor, bank, AccessKind::Read, 1)
    }

    #[test]
    fn test_single_request_granted() {
        let mut arbiter = BankArbiter::new(4, 3);
        let result = arbiter.arbitrate(&[read(1, 2)]);
        assert!(result.is_granted(1));
        assert_eq!(result.status(0), GrantStatus::Idle);
        assert_eq!(arbiter.stats().total_conflicts, 0);
        assert_eq!(arbiter.pointer(2), 2);
    }

    #[test]
    fn test_distinct_banks_no_conflict() {
        let mut arbiter = BankArbiter::new(4, 3);
        let result = arbiter.arbitrate(&[read(0, 0), read(1, 1), read(2, 2)]);
        assert_eq!(result.grant_count(), 3);
        assert_eq!(arbiter.stats().stalls, 0);
    }

    #[test]
    fn test_at_most_one_grant_per_bank() {
        let mut arbiter = BankArbiter::new(2, 4);
        for _ in 0..20 {
            let result = arbiter.arbitrate(&[read(0, 1), read(1, 1), read(2, 1), read(3, 0)]);
            let on_bank1 = (0..3).filter(|r| result.is_granted(*r)).count();
            assert_eq!(on_bank1, 1);
            assert!(result.is_granted(3));
        }
        assert_eq!(arbiter.stats().bank_conflicts[1], 20);
        assert_eq!(arbiter.stats().bank_conflicts[0], 0);
        assert_eq!(arbiter.stats().total_conflicts, 20);
    }

    #[test]
    fn test_round_robin_fairness() {
        let mut arbiter = BankArbiter::new(1, 3);
        let requests = [read(0, 0), read(1, 0), read(2, 0)];
        let mut grant_order = Vec::new();
        for _ in 0..6 {
            let result = arbiter.arbitrate(&requests);
            grant_order.push((0..3).find(|r| result.is_granted(*r)).unwrap());
        }
        assert_eq!(grant_order, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_bounded_wait() {
        let n = 5;
        let mut arbiter = BankArbiter::new(1, n);
        let requests: Vec<_> = (0..n).map(|r| read(r, 0)).collect();
        let mut waited = vec![0usize; n];
        for _ in 0..50 {
            let result = arbiter.arbitrate(&requests);
            for r in 0..n {
                if result.is_granted(r) {
                    waited[r] = 0;
                } else {
                    waited[r] += 1;
                    assert!(waited[r] < n, "requestor {} waited {} ticks", r, waited[r]);
                }
            }
        }
    }

    #[test]
    fn test_pointer_skips_absent_requestors() {
        let mut arbiter = BankArbiter::new(1, 4);
        // Pointer at 0, only 2 and 3 request: 2 wins, pointer -> 3
        let result = arbiter.arbitrate(&[read(3, 0), read(2, 0)]);
        assert!(result.is_granted(2));
        assert!(result.is_stalled(3));
        assert_eq!(arbiter.pointer(0), 3);

        let result = arbiter.arbitrate(&[read(3, 0), read(2, 0)]);
        assert!(result.is_granted(3));
        assert_eq!(arbiter.pointer(0), 0);
    }

    #[test]
    fn test_priority_override() {
        let mut arbiter = BankArbiter::new(1, 4);
        // Advance the pointer so round robin would favour requestor 2
        arbiter.arbitrate(&[read(1, 0)]);
        assert_eq!(arbiter.pointer(0), 2);

        let urgent_a = ArbiterRequest::new(3, 0, AccessKind::Write, 3);
        let urgent_b = ArbiterRequest::new(1, 0, AccessKind::Write, 3);
        let result = arbiter.arbitrate(&[read(2, 0), urgent_a, urgent_b]);
        assert!(result.is_granted(1), "lowest-indexed priority-3 requestor wins");
        assert!(result.is_stalled(2));
        assert!(result.is_stalled(3));
        assert_eq!(arbiter.pointer(0), 2, "override leaves pointer untouched");
        assert_eq!(arbiter.stats().priority_overrides, 1);
    }

    #[test]
    fn test_priority_three_can_starve() {
        let mut arbiter = BankArbiter::new(1, 2);
        let urgent = ArbiterRequest::new(0, 0, AccessKind::Read, 3);
        for _ in 0..10 {
            let result = arbiter.arbitrate(&[urgent.clone(), read(1, 0)]);
            assert!(result.is_stalled(1));
        }
    }

    #[test]
    fn test_duplicate_request_ignored() {
        let mut arbiter = BankArbiter::new(2, 2);
        let result = arbiter.arbitrate(&[read(0, 0), read(0, 1), read(1, 1)]);
        assert!(result.is_granted(0));
        // Second request of requestor 0 at bank 1 never competed
        assert!(result.is_granted(1));
        assert_eq!(arbiter.stats().total_conflicts, 0);
    }

    #[test]
    fn test_spanning_request_is_all_or_nothing() {
        let mut arbiter = BankArbiter::new(8, 3);
        // Requestor 0 wins bank 5 by round robin, so the spanning request
        // from 2 is stalled on every bank, including the free ones.
        let wide = ArbiterRequest::spanning(2, &[2, 5, 0], AccessKind::Read, 1);
        let result = arbiter.arbitrate(&[read(0, 5), wide.clone()]);
        assert!(result.is_granted(0));
        assert!(result.is_stalled(2));
        assert_eq!(arbiter.stats().bank_conflicts[5], 1);
        assert_eq!(arbiter.stats().bank_conflicts[2], 0);
        assert_eq!(arbiter.stats().total_conflicts, 1);

        // Pointer at bank 5 moved past 0: the spanning request wins next.
        let result = arbiter.arbitrate(&[read(0, 5), wide]);
        assert!(result.is_granted(2));
        assert!(result.is_stalled(0));
        for bank in [0, 2, 5] {
            assert_eq!(arbiter.pointer(bank), 0);
        }
    }

    #[test]
    fn test_overlapping_spans_alternate() {
        let mut arbiter = BankArbiter::new(4, 2);
        let a = ArbiterRequest::spanning(0, &[0, 1], AccessKind::Read, 1);
        let b = ArbiterRequest::spanning(1, &[1, 2], AccessKind::Write, 1);
        let mut order = Vec::new();
        for _ in 0..4 {
            let result = arbiter.arbitrate(&[a.clone(), b.clone()]);
            assert_eq!(result.grant_count(), 1);
            order.push((0..2).find(|r| result.is_granted(*r)).unwrap());
        }
        assert_eq!(order, vec![0, 1, 0, 1]);
        assert_eq!(arbiter.stats().total_conflicts, 4);
    }

    #[test]
    fn test_free_banks_do_not_count_as_conflicts() {
        let mut arbiter = BankArbiter::new(4, 2);
        let a = ArbiterRequest::spanning(0, &[0, 1], AccessKind::Read, 1);
        let b = ArbiterRequest::spanning(1, &[2, 3], AccessKind::Read, 1);
        let result = arbiter.arbitrate(&[a, b]);
        assert_eq!(result.grant_count(), 2);
        assert_eq!(arbiter.stats().total_conflicts, 0);
    }

    #[test]
    fn test_reset_stats() {
        let mut arbiter = BankArbiter::new(1, 2);
        arbiter.arbitrate(&[read(0, 0), read(1, 0)]);
        assert_eq!(arbiter.stats().stalls, 1);
        arbiter.reset_stats();
        assert_eq!(arbiter.stats().stalls, 0);
        assert_eq!(arbiter.stats().bank_conflicts, vec![0]);
        // Pointer state survives a stats reset
        assert_eq!(arbiter.pointer(0), 1);
    }
}
