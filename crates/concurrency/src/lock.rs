//! Per-reference lock word
//!
//! Every reference carries one `AtomicU64` that encodes its lock state:
//!
//! ```text
//!  63 62 61                                                    0
//! +-----+-------------------------------------------------------+
//! |mode |  Read: number of readers / Write, Exclusive: owner id |
//! +-----+-------------------------------------------------------+
//! ```
//!
//! Acquisition is a CAS loop with a bounded exponential spin. There is no
//! OS-level blocking on this path: a lock that cannot be taken within the
//! spin budget is reported back to the caller, which turns it into a
//! conflict.
//!
//! Upgrade rules:
//! - Read → Write/Exclusive only when the caller is the sole reader
//! - Write → Exclusive when the caller owns the write lock

use gamma_core::{LockMode, TxnId};
use std::sync::atomic::{AtomicU64, Ordering};

const MODE_SHIFT: u32 = 62;
const PAYLOAD_MASK: u64 = (1 << MODE_SHIFT) - 1;

const MODE_NONE: u64 = 0;
const MODE_READ: u64 = 1;
const MODE_WRITE: u64 = 2;
const MODE_EXCLUSIVE: u64 = 3;

fn mode_bits(mode: LockMode) -> u64 {
    match mode {
        LockMode::None => MODE_NONE,
        LockMode::Read => MODE_READ,
        LockMode::Write => MODE_WRITE,
        LockMode::Exclusive => MODE_EXCLUSIVE,
    }
}

fn decode_mode(word: u64) -> LockMode {
    match word >> MODE_SHIFT {
        MODE_READ => LockMode::Read,
        MODE_WRITE => LockMode::Write,
        MODE_EXCLUSIVE => LockMode::Exclusive,
        _ => LockMode::None,
    }
}

fn encode(mode: LockMode, payload: u64) -> u64 {
    (mode_bits(mode) << MODE_SHIFT) | (payload & PAYLOAD_MASK)
}

/// Busy-wait for round `round` of a bounded spin
pub(crate) fn spin_backoff(round: u32) {
    let iterations = 1u32 << round.min(6);
    for _ in 0..iterations {
        std::hint::spin_loop();
    }
    if round >= 6 {
        std::thread::yield_now();
    }
}

/// Atomic lock state of a single reference
#[derive(Debug, Default)]
pub struct LockWord(AtomicU64);

impl LockWord {
    /// Create an unlocked word
    pub const fn new() -> Self {
        LockWord(AtomicU64::new(0))
    }

    /// Create a word already held exclusively by `owner`
    pub(crate) fn new_exclusive(owner: TxnId) -> Self {
        LockWord(AtomicU64::new(encode(LockMode::Exclusive, owner.as_u64())))
    }

    /// Current mode
    pub fn mode(&self) -> LockMode {
        decode_mode(self.0.load(Ordering::Acquire))
    }

    /// Owner of a Write or Exclusive lock
    pub fn owner(&self) -> Option<TxnId> {
        let word = self.0.load(Ordering::Acquire);
        match decode_mode(word) {
            LockMode::Write | LockMode::Exclusive => Some(TxnId::new(word & PAYLOAD_MASK)),
            _ => None,
        }
    }

    /// Number of Read lock holders
    pub fn reader_count(&self) -> u64 {
        let word = self.0.load(Ordering::Acquire);
        match decode_mode(word) {
            LockMode::Read => word & PAYLOAD_MASK,
            _ => 0,
        }
    }

    /// Mode held by a transaction other than `me` that prevents `me` from
    /// reading, i.e. an Exclusive lock.
    pub fn exclusive_by_other(&self, me: TxnId) -> Option<LockMode> {
        let word = self.0.load(Ordering::Acquire);
        match decode_mode(word) {
            LockMode::Exclusive if word & PAYLOAD_MASK != me.as_u64() => Some(LockMode::Exclusive),
            _ => None,
        }
    }

    /// Write or Exclusive lock held by a transaction other than `me`
    pub fn write_locked_by_other(&self, me: TxnId) -> Option<LockMode> {
        let word = self.0.load(Ordering::Acquire);
        match decode_mode(word) {
            mode @ (LockMode::Write | LockMode::Exclusive)
                if word & PAYLOAD_MASK != me.as_u64() =>
            {
                Some(mode)
            }
            _ => None,
        }
    }

    /// Spin until no other transaction holds the Exclusive lock.
    ///
    /// Returns `Err(Exclusive)` if the spin budget runs out.
    pub fn await_not_exclusive(&self, me: TxnId, spin_count: u32) -> Result<(), LockMode> {
        for round in 0..=spin_count {
            if self.exclusive_by_other(me).is_none() {
                return Ok(());
            }
            spin_backoff(round);
        }
        match self.exclusive_by_other(me) {
            None => Ok(()),
            Some(mode) => Err(mode),
        }
    }

    /// Single CAS attempt to move from `held` to `requested`.
    ///
    /// `held` is what `me` already holds on this word. Requests not stronger
    /// than `held` succeed trivially. On incompatibility returns the mode that
    /// blocks the request.
    pub fn try_acquire(
        &self,
        me: TxnId,
        held: LockMode,
        requested: LockMode,
    ) -> Result<(), LockMode> {
        if requested <= held {
            return Ok(());
        }
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let mode = decode_mode(current);
            let payload = current & PAYLOAD_MASK;
            let next = match (requested, held, mode) {
                (LockMode::Read, LockMode::None, LockMode::None) => encode(LockMode::Read, 1),
                (LockMode::Read, LockMode::None, LockMode::Read) => {
                    encode(LockMode::Read, payload + 1)
                }
                (_, LockMode::None, LockMode::None) => encode(requested, me.as_u64()),
                // Sole reader may upgrade
                (_, LockMode::Read, LockMode::Read) if payload == 1 => {
                    encode(requested, me.as_u64())
                }
                (LockMode::Exclusive, LockMode::Write, LockMode::Write)
                    if payload == me.as_u64() =>
                {
                    encode(LockMode::Exclusive, me.as_u64())
                }
                (_, _, blocking) => return Err(blocking),
            };
            match self
                .0
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Acquire `requested`, spinning up to `spin_count` rounds.
    ///
    /// Returns the blocking mode if the lock could not be obtained.
    pub fn acquire(
        &self,
        me: TxnId,
        held: LockMode,
        requested: LockMode,
        spin_count: u32,
    ) -> Result<(), LockMode> {
        let mut blocking = LockMode::None;
        for round in 0..=spin_count {
            match self.try_acquire(me, held, requested) {
                Ok(()) => return Ok(()),
                Err(mode) => blocking = mode,
            }
            spin_backoff(round);
        }
        Err(blocking)
    }

    /// Release whatever `me` holds (`held`) on this word
    pub fn release(&self, me: TxnId, held: LockMode) {
        match held {
            LockMode::None => {}
            LockMode::Read => {
                let mut current = self.0.load(Ordering::Acquire);
                loop {
                    let count = current & PAYLOAD_MASK;
                    debug_assert_eq!(decode_mode(current), LockMode::Read);
                    let next = if count <= 1 {
                        0
                    } else {
                        encode(LockMode::Read, count - 1)
                    };
                    match self.0.compare_exchange(
                        current,
                        next,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        Err(actual) => current = actual,
                    }
                }
            }
            LockMode::Write | LockMode::Exclusive => {
                debug_assert_eq!(self.owner(), Some(me));
                self.0.store(0, Ordering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(LockWord: Send, Sync);

    fn txn(id: u64) -> TxnId {
        TxnId::new(id)
    }

    #[test]
    fn test_read_locks_are_shared() {
        let lock = LockWord::new();
        lock.try_acquire(txn(1), LockMode::None, LockMode::Read).unwrap();
        lock.try_acquire(txn(2), LockMode::None, LockMode::Read).unwrap();
        assert_eq!(lock.mode(), LockMode::Read);
        assert_eq!(lock.reader_count(), 2);

        lock.release(txn(1), LockMode::Read);
        assert_eq!(lock.reader_count(), 1);
        lock.release(txn(2), LockMode::Read);
        assert_eq!(lock.mode(), LockMode::None);
    }

    #[test]
    fn test_write_lock_excludes_others() {
        let lock = LockWord::new();
        lock.try_acquire(txn(1), LockMode::None, LockMode::Write).unwrap();
        assert_eq!(lock.owner(), Some(txn(1)));
        assert_eq!(
            lock.try_acquire(txn(2), LockMode::None, LockMode::Read),
            Err(LockMode::Write)
        );
        assert_eq!(
            lock.try_acquire(txn(2), LockMode::None, LockMode::Write),
            Err(LockMode::Write)
        );
        assert_eq!(lock.write_locked_by_other(txn(2)), Some(LockMode::Write));
        assert_eq!(lock.write_locked_by_other(txn(1)), None);
        // Write lock does not stop readers from reading
        assert_eq!(lock.exclusive_by_other(txn(2)), None);
    }

    #[test]
    fn test_upgrade_sole_reader() {
        let lock = LockWord::new();
        lock.try_acquire(txn(1), LockMode::None, LockMode::Read).unwrap();
        lock.try_acquire(txn(1), LockMode::Read, LockMode::Exclusive).unwrap();
        assert_eq!(lock.mode(), LockMode::Exclusive);
        assert_eq!(lock.owner(), Some(txn(1)));
        lock.release(txn(1), LockMode::Exclusive);
        assert_eq!(lock.mode(), LockMode::None);
    }

    #[test]
    fn test_upgrade_refused_with_other_readers() {
        let lock = LockWord::new();
        lock.try_acquire(txn(1), LockMode::None, LockMode::Read).unwrap();
        lock.try_acquire(txn(2), LockMode::None, LockMode::Read).unwrap();
        assert_eq!(
            lock.try_acquire(txn(1), LockMode::Read, LockMode::Write),
            Err(LockMode::Read)
        );
        assert_eq!(lock.reader_count(), 2);
    }

    #[test]
    fn test_write_to_exclusive_upgrade() {
        let lock = LockWord::new();
        lock.try_acquire(txn(3), LockMode::None, LockMode::Write).unwrap();
        lock.try_acquire(txn(3), LockMode::Write, LockMode::Exclusive).unwrap();
        assert_eq!(lock.mode(), LockMode::Exclusive);
        assert_eq!(lock.exclusive_by_other(txn(4)), Some(LockMode::Exclusive));
        assert_eq!(lock.exclusive_by_other(txn(3)), None);
    }

    #[test]
    fn test_weaker_request_is_noop() {
        let lock = LockWord::new();
        lock.try_acquire(txn(1), LockMode::None, LockMode::Exclusive).unwrap();
        lock.try_acquire(txn(1), LockMode::Exclusive, LockMode::Read).unwrap();
        assert_eq!(lock.mode(), LockMode::Exclusive);
    }

    #[test]
    fn test_bounded_spin_gives_up() {
        let lock = LockWord::new_exclusive(txn(9));
        assert_eq!(
            lock.acquire(txn(1), LockMode::None, LockMode::Write, 3),
            Err(LockMode::Exclusive)
        );
        assert_eq!(lock.await_not_exclusive(txn(1), 3), Err(LockMode::Exclusive));
        assert_eq!(lock.await_not_exclusive(txn(9), 3), Ok(()));
    }

    #[test]
    fn test_concurrent_readers_balance() {
        use std::sync::Arc;
        use std::thread;

        let lock = Arc::new(LockWord::new());
        let handles: Vec<_> = (1..=8u64)
            .map(|id| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        lock.acquire(txn(id), LockMode::None, LockMode::Read, 64)
                            .unwrap();
                        lock.release(txn(id), LockMode::Read);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(lock.mode(), LockMode::None);
    }
}
