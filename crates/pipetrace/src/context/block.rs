//! Draw blocking.
//!
//! Every draw passes through [`DrawGate::check`] twice, once with [`BlockFlags::BEFORE`] before
//! the backend sees it and once with [`BlockFlags::AFTER`]. The debugger pauses draws by setting
//! `blocker` bits (or a [`DrawRule`]) and releases them with step/unblock.

use parking_lot::{Condvar, Mutex};
use pipetrace_protocol::{BLOCK_AFTER, BLOCK_BEFORE, BLOCK_MASK, BLOCK_RULE};

use super::state::BoundState;
use crate::pipe::{Handle, ShaderStage};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BlockFlags: u32 {
        const BEFORE = BLOCK_BEFORE;
        const AFTER = BLOCK_AFTER;
        /// A draw rule is active (in `blocker`) or caused the block (in `blocked`).
        const RULE = BLOCK_RULE;
        const MASK = BLOCK_MASK;
    }
}

impl BlockFlags {
    const PHASES: BlockFlags = BlockFlags::BEFORE.union(BlockFlags::AFTER);
}

/// Conditional filter that forces matching draws to block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrawRule {
    pub vertex: Option<Handle>,
    pub fragment: Option<Handle>,
    pub texture: Option<Handle>,
    pub surface: Option<Handle>,
    /// Phases (`BEFORE`/`AFTER`) the rule blocks in.
    pub blocker: BlockFlags,
}

impl DrawRule {
    pub fn shader(&self, stage: ShaderStage) -> Option<Handle> {
        match stage {
            ShaderStage::Vertex => self.vertex,
            ShaderStage::Fragment => self.fragment,
        }
    }

    /// Any named identity currently bound is a match.
    pub fn matches(&self, bound: &BoundState) -> bool {
        let shader_match = ShaderStage::ALL
            .into_iter()
            .any(|stage| self.shader(stage).is_some_and(|s| bound.shader(stage) == Some(s)));
        let surface_match = self.surface.is_some_and(|s| bound.is_surface_bound(s));
        let texture_match = self.texture.is_some_and(|t| bound.is_texture_bound(t));
        shader_match || surface_match || texture_match
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockState {
    /// Configured: when to block.
    pub blocker: BlockFlags,
    /// Live: what is blocked right now.
    pub blocked: BlockFlags,
    pub rule: DrawRule,
}

impl BlockState {
    fn release(&mut self, flags: BlockFlags) {
        if self.blocked.contains(BlockFlags::RULE) && flags.contains(BlockFlags::RULE) {
            self.blocked = BlockFlags::empty();
            return;
        }
        self.blocked.remove(flags);
        // RULE only means something next to the phase it blocked.
        if !self.blocked.intersects(BlockFlags::PHASES) {
            self.blocked = BlockFlags::empty();
        }
    }
}

#[derive(Debug, Default)]
struct GateInner {
    state: BlockState,
    cancelled: bool,
}

/// One context's block state plus the condition variable its draw thread waits on.
#[derive(Debug, Default)]
pub struct DrawGate {
    inner: Mutex<GateInner>,
    cond: Condvar,
}

impl DrawGate {
    pub fn new(blocker: BlockFlags) -> Self {
        Self {
            inner: Mutex::new(GateInner {
                state: BlockState {
                    blocker,
                    ..BlockState::default()
                },
                cancelled: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn snapshot(&self) -> BlockState {
        self.inner.lock().state
    }

    /// Blocks the calling draw thread while `phase` is blocked.
    ///
    /// `notify` runs (under the gate lock) once if this call transitions into the blocked state.
    /// Returns the `blocked` bits this draw was held on, or empty if it passed straight through.
    pub fn check(
        &self,
        phase: BlockFlags,
        bound: &BoundState,
        notify: impl FnOnce(BlockFlags),
    ) -> BlockFlags {
        let mut inner = self.inner.lock();
        if inner.cancelled {
            return BlockFlags::empty();
        }

        let state = &mut inner.state;
        if state.blocker.intersects(phase) {
            state.blocked |= phase;
        } else if state.rule.blocker.intersects(phase)
            && state.blocker.contains(BlockFlags::RULE)
            && state.rule.matches(bound)
        {
            state.blocked |= phase | BlockFlags::RULE;
        }

        let held = inner.state.blocked;
        if !held.intersects(phase) {
            return BlockFlags::empty();
        }

        notify(held);
        while inner.state.blocked.intersects(phase) && !inner.cancelled {
            self.cond.wait(&mut inner);
        }
        held
    }

    pub fn block(&self, flags: BlockFlags) {
        self.inner.lock().state.blocker |= flags & BlockFlags::MASK;
    }

    /// Release the paused draw without changing the blocker, so the next draw blocks again.
    pub fn step(&self, flags: BlockFlags) {
        let mut inner = self.inner.lock();
        inner.state.release(flags);
        self.cond.notify_all();
    }

    /// Release the paused draw and stop blocking on `flags`.
    pub fn unblock(&self, flags: BlockFlags) {
        let mut inner = self.inner.lock();
        inner.state.release(flags);
        inner.state.blocker.remove(flags);
        self.cond.notify_all();
    }

    pub fn set_rule(&self, rule: DrawRule) {
        let mut inner = self.inner.lock();
        inner.state.rule = rule;
        inner.state.blocker |= BlockFlags::RULE;
        self.cond.notify_all();
    }

    /// Permanently lets every current and future draw through. Used when the context goes away.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        inner.cancelled = true;
        inner.state.blocked = BlockFlags::empty();
        self.cond.notify_all();
    }

    /// True while some draw is parked in [`DrawGate::check`].
    pub fn is_blocked(&self) -> bool {
        !self.inner.lock().state.blocked.is_empty()
    }
}
