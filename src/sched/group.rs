//! Job groups.
//!
//! A group is a barrier over a set of jobs with an optional continuation
//! submitted when the last member completes. Membership accounting mirrors
//! the job submission guard: a fresh group holds one guard reference that
//! `group_submit` drops, so the continuation cannot fire while members are
//! still being added. Groups are destroyed explicitly, never automatically,
//! and own a bump arena for their members' scratch memory.

use super::job::JobHandle;
use crate::utils::arena::Arena;

impl_handle!(GroupHandle);

pub(crate) struct Group {
    /// Members not yet completed, plus one guard reference dropped by
    /// `group_submit`.
    pub remaining: u32,
    pub submitted: bool,
    pub done: bool,
    pub continuation: Option<JobHandle>,
    /// Slot indices of every job ever added; diagnostic only.
    pub members: Vec<u32>,
    pub arena: Arena,
}

impl Group {
    pub fn new(arena_capacity: usize) -> Group {
        Group {
            remaining: 1,
            submitted: false,
            done: false,
            continuation: None,
            members: Vec::new(),
            arena: Arena::with_capacity(arena_capacity),
        }
    }

    /// Drops one reference; true when the group just closed.
    pub fn complete_one(&mut self) -> bool {
        debug_assert!(self.remaining > 0);
        self.remaining -= 1;
        if self.remaining == 0 && self.submitted && !self.done {
            self.done = true;
            true
        } else {
            false
        }
    }
}
