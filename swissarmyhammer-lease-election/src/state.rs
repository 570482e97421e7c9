//! In-memory election state
//!
//! The only state shared by the two election loops. Every transition is a
//! short critical section under one mutex; no I/O happens while it is held.
//! A Follower can only become Leader through [`ElectionState::promote`] after
//! a successful lease write, and a Leader only stops being one through
//! [`ElectionState::self_check`] or, once the loops are cancelled,
//! [`ElectionState::resign`].

use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Inner {
    is_leader: bool,
    lease_expiration_us: i64,
    forbid_campaign_until_us: i64,
}

/// Result of a self-check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfCheck {
    /// Not leader, nothing to check
    Follower,
    /// Leader with more than half a lease left
    Safe,
    /// Demoted by this check
    Demoted,
}

/// Leader flag, lease expiration and cooldown deadline
#[derive(Debug, Default)]
pub struct ElectionState {
    inner: Mutex<Inner>,
}

impl ElectionState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_leader(&self) -> bool {
        self.lock().is_leader
    }

    pub fn lease_expiration_us(&self) -> i64 {
        self.lock().lease_expiration_us
    }

    /// Whether a campaign is allowed at `now_us`
    pub fn may_campaign(&self, now_us: i64) -> bool {
        let inner = self.lock();
        !inner.is_leader && now_us >= inner.forbid_campaign_until_us
    }

    /// Become leader after a successful campaign write
    ///
    /// Returns false if this instance was already leader.
    pub fn promote(&self, expiration_us: i64) -> bool {
        let mut inner = self.lock();
        let was_leader = inner.is_leader;
        inner.is_leader = true;
        inner.lease_expiration_us = inner.lease_expiration_us.max(expiration_us);
        !was_leader
    }

    /// Record a successful renewal write
    ///
    /// Ignored when a concurrent self-check demoted us while the write was in
    /// flight; renewals never promote.
    pub fn renew(&self, expiration_us: i64) -> bool {
        let mut inner = self.lock();
        if !inner.is_leader {
            return false;
        }
        inner.lease_expiration_us = inner.lease_expiration_us.max(expiration_us);
        true
    }

    /// Demote when less than half the lease remains
    ///
    /// On demotion, campaigning is forbidden until `now_us + forbid_campaign_us`.
    pub fn self_check(
        &self,
        now_us: i64,
        lease_timeout_us: i64,
        forbid_campaign_us: i64,
    ) -> SelfCheck {
        let mut inner = self.lock();
        if !inner.is_leader {
            return SelfCheck::Follower;
        }
        let margin = inner.lease_expiration_us.saturating_sub(now_us);
        if margin > lease_timeout_us / 2 {
            return SelfCheck::Safe;
        }
        inner.is_leader = false;
        if forbid_campaign_us > 0 {
            inner.forbid_campaign_until_us = now_us.saturating_add(forbid_campaign_us);
        }
        SelfCheck::Demoted
    }

    /// Silent demotion used by shutdown and preemption
    ///
    /// Returns whether this instance was leader.
    pub fn resign(&self) -> bool {
        let mut inner = self.lock();
        std::mem::replace(&mut inner.is_leader, false)
    }
}
