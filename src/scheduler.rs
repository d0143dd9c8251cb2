//! Single-shot timer scheduling.
//!
//! The protocol engines never block and never own an event loop. They arm
//! single-shot timers through the [`Scheduler`] trait and are re-entered
//! later via `on_timer` with the [`TimerToken`] they armed. Recurrence is
//! always explicit re-arming; there are no hidden periodic timers.
//!
//! Embedders with their own event loop implement [`Scheduler`] directly.
//! [`ManualScheduler`] is a minimal in-process implementation (binary heap
//! of deadlines) for embedders without one, and for the test suite.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Protocol family owning a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Proto {
    Dhcp4,
    Dhcp6,
    Ndisc,
}

/// What a timer means to its owning engine.
///
/// The engine dispatches on its *current state* when the timer fires, so a
/// kind names a concern (retransmission, renewal, ...) rather than a stored
/// callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerKind {
    /// Deferred start: randomized initial delay, NAK backoff, or the
    /// randomized re-DISCOVER delay after a duplicate address.
    Start,
    /// Retransmit the in-flight message.
    Retransmit,
    /// Lease T1 reached.
    Renew,
    /// Lease T2 reached.
    Rebind,
    /// Lease lifetime reached.
    Expire,
    /// Shared router/prefix lifetime expiry (ND engine).
    RouterExpire,
    /// Next Router Solicitation of the current burst.
    Solicit,
}

/// Identifies one armed timer: which interface, which engine, which concern.
///
/// Arming a token always replaces any earlier timer with the same token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerToken {
    pub ifindex: u32,
    pub proto: Proto,
    pub kind: TimerKind,
}

impl TimerToken {
    pub fn new(ifindex: u32, proto: Proto, kind: TimerKind) -> Self {
        Self {
            ifindex,
            proto,
            kind,
        }
    }
}

/// Timer registration surface the engines require from the event loop.
pub trait Scheduler {
    /// Arm `token` to fire after `delay`. Re-arming an already-armed token
    /// replaces the earlier registration; a token fires at most once per
    /// arming.
    fn schedule_once(&mut self, delay: Duration, token: TimerToken);

    /// Cancel an armed token. Cancelling an unarmed token is a no-op.
    fn cancel(&mut self, token: TimerToken);
}

#[derive(Debug)]
struct HeapEntry {
    deadline: Instant,
    seq: u64,
    token: TimerToken,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// In-process scheduler backed by a binary heap of deadlines.
///
/// Cancellation is lazy: cancelled or superseded entries stay in the heap
/// and are skipped when popped. `pop_due` returns tokens whose deadline has
/// passed, one at a time, so the embedder's loop can re-enter the engines
/// one callback at a time to completion.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    // Latest arming per token; entries with a stale seq are skipped.
    live: std::collections::HashMap<TimerToken, u64>,
    next_seq: u64,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next armed deadline, if any timer is live.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap
            .iter()
            .filter(|Reverse(e)| self.live.get(&e.token) == Some(&e.seq))
            .map(|Reverse(e)| e.deadline)
            .min()
    }

    /// Pop the next token whose deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerToken> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                return None;
            }
            let Reverse(entry) = self.heap.pop().expect("peeked entry");
            if self.live.get(&entry.token) == Some(&entry.seq) {
                self.live.remove(&entry.token);
                return Some(entry.token);
            }
            // stale: superseded or cancelled
        }
        None
    }

    /// Number of currently-armed timers.
    pub fn armed(&self) -> usize {
        self.live.len()
    }

    /// Whether a specific token is armed.
    pub fn is_armed(&self, token: TimerToken) -> bool {
        self.live.contains_key(&token)
    }

    /// Deadline of a specific armed token.
    pub fn deadline_of(&self, token: TimerToken) -> Option<Instant> {
        let seq = *self.live.get(&token)?;
        self.heap
            .iter()
            .find(|Reverse(e)| e.token == token && e.seq == seq)
            .map(|Reverse(e)| e.deadline)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&mut self, delay: Duration, token: TimerToken) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(token, seq);
        self.heap.push(Reverse(HeapEntry {
            deadline: Instant::now() + delay,
            seq,
            token,
        }));
    }

    fn cancel(&mut self, token: TimerToken) {
        self.live.remove(&token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(kind: TimerKind) -> TimerToken {
        TimerToken::new(1, Proto::Dhcp4, kind)
    }

    #[test]
    fn test_rearm_replaces_earlier() {
        let mut s = ManualScheduler::new();
        s.schedule_once(Duration::from_secs(10), token(TimerKind::Renew));
        s.schedule_once(Duration::from_millis(0), token(TimerKind::Renew));
        assert_eq!(s.armed(), 1);
        let fired = s.pop_due(Instant::now() + Duration::from_millis(1));
        assert_eq!(fired, Some(token(TimerKind::Renew)));
        // The superseded 10s entry must not fire later.
        assert_eq!(s.pop_due(Instant::now() + Duration::from_secs(60)), None);
    }

    #[test]
    fn test_cancel_is_noop_when_unarmed() {
        let mut s = ManualScheduler::new();
        s.cancel(token(TimerKind::Expire));
        assert_eq!(s.armed(), 0);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mut s = ManualScheduler::new();
        s.schedule_once(Duration::from_millis(0), token(TimerKind::Retransmit));
        s.cancel(token(TimerKind::Retransmit));
        assert_eq!(s.pop_due(Instant::now() + Duration::from_secs(1)), None);
    }

    #[test]
    fn test_due_order() {
        let mut s = ManualScheduler::new();
        s.schedule_once(Duration::from_millis(20), token(TimerKind::Rebind));
        s.schedule_once(Duration::from_millis(10), token(TimerKind::Renew));
        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(s.pop_due(later), Some(token(TimerKind::Renew)));
        assert_eq!(s.pop_due(later), Some(token(TimerKind::Rebind)));
        assert_eq!(s.pop_due(later), None);
    }
}
