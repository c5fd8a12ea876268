//! Single-flight refresh state machine.
//!
//! [`RefreshGate`] is the `{Idle, Refreshing}` machine that decides which
//! caller performs a credential refresh and holds everyone else in a FIFO
//! queue until it settles. It contains no I/O; the coordinator drives it
//! under a mutex and performs the network calls between transitions.
//!
//! Every successful refresh bumps a generation counter. A caller records
//! the generation before sending; if it has moved by the time the response
//! comes back expired, the request was sent with a token that has already
//! been replaced and is replayed instead of refreshing again.
//!
//! ```text
//!            try_begin() == true
//!   Idle ─────────────────────────▶ Refreshing { queue }
//!    ▲                                  │  enqueue(item)
//!    └──── drain_success / drain_failure┘
//! ```

use std::collections::VecDeque;

/// Current state of the gate.
#[derive(Debug)]
pub enum RefreshState<T> {
    /// No refresh in flight.
    Idle,

    /// A refresh is in flight; `queue` holds requests waiting on it.
    Refreshing { queue: VecDeque<T> },
}

/// Outcome of [`RefreshGate::admit`].
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<T> {
    /// The caller owns the refresh and gets its item back.
    Leader(T),

    /// The item was queued behind the in-flight refresh.
    Queued,

    /// A refresh completed after the caller's generation was recorded; the
    /// item is handed back for a direct replay.
    Superseded(T),
}

/// Mutual exclusion around the refresh critical section.
///
/// Generic over the queued item so it can be tested without network code.
#[derive(Debug)]
pub struct RefreshGate<T> {
    state: RefreshState<T>,
    generation: u64,
}

impl<T> RefreshGate<T> {
    pub fn new() -> Self {
        Self {
            state: RefreshState::Idle,
            generation: 0,
        }
    }

    pub fn state(&self) -> &RefreshState<T> {
        &self.state
    }

    /// Number of refreshes that have succeeded so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(self.state, RefreshState::Refreshing { .. })
    }

    /// Number of queued items (always 0 while idle).
    pub fn queued(&self) -> usize {
        match &self.state {
            RefreshState::Idle => 0,
            RefreshState::Refreshing { queue } => queue.len(),
        }
    }

    /// Claim the refresh. Returns `true` if the caller is now the only one
    /// allowed to refresh, `false` if a refresh is already in flight.
    pub fn try_begin(&mut self) -> bool {
        match self.state {
            RefreshState::Idle => {
                self.state = RefreshState::Refreshing {
                    queue: VecDeque::new(),
                };
                true
            }
            RefreshState::Refreshing { .. } => false,
        }
    }

    /// Queue an item behind the in-flight refresh.
    ///
    /// Hands the item back if no refresh is in flight.
    pub fn enqueue(&mut self, item: T) -> Result<(), T> {
        match &mut self.state {
            RefreshState::Idle => Err(item),
            RefreshState::Refreshing { queue } => {
                queue.push_back(item);
                Ok(())
            }
        }
    }

    /// Route an item whose request came back expired.
    ///
    /// `seen` is the generation recorded before the request was sent. If a
    /// refresh has succeeded since, the item is superseded. Otherwise it
    /// begins a refresh if idle or queues behind the one in flight. All
    /// three decisions happen under one borrow, so a caller can never
    /// observe `Idle` after the refresh that already covers it.
    pub fn admit(&mut self, item: T, seen: u64) -> Admission<T> {
        if seen != self.generation {
            return Admission::Superseded(item);
        }
        if self.try_begin() {
            return Admission::Leader(item);
        }
        match self.enqueue(item) {
            Ok(()) => Admission::Queued,
            Err(item) => Admission::Leader(item),
        }
    }

    /// The refresh succeeded: return to idle and hand back the queue in
    /// arrival order for replay.
    pub fn drain_success(&mut self) -> Vec<T> {
        if self.is_refreshing() {
            self.generation += 1;
        }
        self.drain()
    }

    /// The refresh failed: return to idle and hand back the queue in arrival
    /// order for rejection.
    pub fn drain_failure(&mut self) -> Vec<T> {
        self.drain()
    }

    fn drain(&mut self) -> Vec<T> {
        match std::mem::replace(&mut self.state, RefreshState::Idle) {
            RefreshState::Idle => Vec::new(),
            RefreshState::Refreshing { queue } => queue.into(),
        }
    }
}

impl<T> Default for RefreshGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// How many times a request has already been replayed after a refresh.
///
/// Threaded by value through the send path instead of flagging the request,
/// so a request can never loop through refresh more than [`MAX_REPLAYS`]
/// times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attempt(u32);

/// Replays allowed after the first pass.
pub const MAX_REPLAYS: u32 = 1;

impl Attempt {
    /// The first pass of a request.
    pub const FIRST: Attempt = Attempt(0);

    pub fn number(self) -> u32 {
        self.0
    }

    /// The attempt used when replaying after a refresh.
    pub fn next(self) -> Attempt {
        Attempt(self.0 + 1)
    }

    /// Whether an expired-credential response on this attempt may still
    /// trigger or wait for a refresh.
    pub fn may_refresh(self) -> bool {
        self.0 < MAX_REPLAYS
    }
}
