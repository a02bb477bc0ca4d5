//! The per-CPU run queue: 128 FIFO queues indexed by priority, a bitmap of
//! non-empty levels, and a cached highest-priority value.
//!
//! Invariants maintained here (and checked by the tests):
//! - the bitmap bit for priority P is set iff queue P is non-empty;
//! - the cached highest priority equals the lowest-numbered set bit, or
//!   `PRI_MAX` when the queue is empty.
//!
//! The queued count and migratable count are kept in atomics outside the
//! lock so the migration paths can pre-check them without touching the
//! remote lock.

use core::sync::atomic::{AtomicU32, Ordering};

use intrusive_collections::LinkedList;

use super::{bitmap::PriorityBitmap, Pri, PRI_COUNT, PRI_MAX, PRI_NONE};
use crate::{
    lwp::{LwpFlags, LwpRef, RunLinkAdapter, TS_NONE},
    spinlock::{LockGuard, Spinlock},
};

pub struct RunQueue {
    inner: Spinlock<RqInner>,
    /// Number of queued LWPs.
    count: AtomicU32,
    /// Number of queued LWPs eligible for migration.
    mcount: AtomicU32,
    /// Exponential moving average of `mcount`, maintained by the balancer.
    avgcount: AtomicU32,
    /// Lock-free mirror of the cached highest priority.
    highest: AtomicU32,
}

pub(crate) struct RqInner {
    bitmap: PriorityBitmap,
    queues: [LinkedList<RunLinkAdapter>; PRI_COUNT],
    highest: Pri,
}

impl RqInner {
    fn new() -> Self {
        Self {
            bitmap: PriorityBitmap::new(),
            queues: core::array::from_fn(|_| LinkedList::new(RunLinkAdapter::new())),
            highest: PRI_MAX,
        }
    }

    pub(crate) fn push(&mut self, l: LwpRef) {
        let pri = l.pri();
        assert!((pri as usize) < PRI_COUNT, "priority out of range");
        assert!(!l.run_link.is_linked(), "lwp {} already queued", l.id());
        l.sched.rq_pri.store(pri, Ordering::Release);
        if self.queues[pri as usize].is_empty() {
            self.bitmap.set(pri);
        }
        self.queues[pri as usize].push_back(l);
        if pri < self.highest {
            self.highest = pri;
        }
    }

    pub(crate) fn remove(&mut self, l: &LwpRef) {
        let pri = l.sched.rq_pri.swap(PRI_NONE, Ordering::AcqRel);
        assert!(pri != PRI_NONE, "lwp {} not on a run queue", l.id());
        assert!(l.run_link.is_linked());
        // SAFETY: rq_pri records the queue the lwp was pushed onto, and the
        // link was verified above; the element is therefore in this list.
        let mut cursor = unsafe { self.queues[pri as usize].cursor_mut_from_ptr(&**l) };
        cursor.remove().expect("cursor must point at the lwp");
        self.queue_drained(pri);
    }

    pub(crate) fn pop_highest(&mut self) -> Option<LwpRef> {
        let pri = self.bitmap.highest()?;
        assert_eq!(pri, self.highest, "stale highest-priority cache");
        let l = self.queues[pri as usize]
            .pop_front()
            .expect("bitmap bit set for an empty queue");
        l.sched.rq_pri.store(PRI_NONE, Ordering::Release);
        self.queue_drained(pri);
        Some(l)
    }

    /// Clear the bitmap bit and rescan the cache if priority `pri` drained.
    fn queue_drained(&mut self, pri: Pri) {
        if self.queues[pri as usize].is_empty() {
            self.bitmap.clear(pri);
            if pri == self.highest {
                self.highest = self.bitmap.highest().unwrap_or(PRI_MAX);
            }
        }
    }

    pub(crate) fn highest(&self) -> Pri {
        self.highest
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    /// Find, unlink, and return the best steal candidate: the most
    /// important queued LWP that is migratable, not a kernel-internal
    /// thread, and not cache-hot on this queue's CPU.
    pub(crate) fn steal_candidate(&mut self, now: u64, cacheht: u64) -> Option<LwpRef> {
        let mut pri = self.bitmap.highest();
        while let Some(p) = pri {
            let mut cursor = self.queues[p as usize].front_mut();
            while let Some(l) = cursor.get() {
                let hot = {
                    let lr = l.sched.lrtime.load(Ordering::Acquire);
                    lr != TS_NONE && now.saturating_sub(lr) < cacheht
                };
                if !hot && l.migratable() && !l.flags().intersects(LwpFlags::SYSTEM) {
                    let taken = cursor.remove().expect("cursor points at a candidate");
                    taken.sched.rq_pri.store(PRI_NONE, Ordering::Release);
                    self.queue_drained(p);
                    return Some(taken);
                }
                cursor.move_next();
            }
            pri = self.bitmap.next_below(p);
        }
        None
    }
}

impl RunQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Spinlock::new(RqInner::new()),
            count: AtomicU32::new(0),
            mcount: AtomicU32::new(0),
            avgcount: AtomicU32::new(0),
            highest: AtomicU32::new(PRI_MAX),
        }
    }

    pub(crate) fn lock(&self) -> LockGuard<'_, RqInner> {
        self.inner.lock()
    }

    /// Publish count/cache updates after mutating the locked inner state.
    /// Must be called while the inner lock is still held.
    pub(crate) fn note_insert(&self, inner: &RqInner, l: &LwpRef) {
        self.count.fetch_add(1, Ordering::Release);
        if l.migratable() {
            self.mcount.fetch_add(1, Ordering::Release);
        }
        self.highest.store(inner.highest(), Ordering::Release);
    }

    pub(crate) fn note_remove(&self, inner: &RqInner, l: &LwpRef) {
        let old = self.count.fetch_sub(1, Ordering::Release);
        assert!(old > 0, "run queue count underflow");
        if l.migratable() {
            let old = self.mcount.fetch_sub(1, Ordering::Release);
            assert!(old > 0, "migratable count underflow");
        }
        self.highest.store(inner.highest(), Ordering::Release);
    }

    pub fn len(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn migratable_len(&self) -> u32 {
        self.mcount.load(Ordering::Acquire)
    }

    /// Cached highest queued priority; `PRI_MAX` when empty.
    pub fn highest_pri(&self) -> Pri {
        self.highest.load(Ordering::Acquire)
    }

    pub(crate) fn avgcount(&self) -> u32 {
        self.avgcount.load(Ordering::Acquire)
    }

    pub(crate) fn set_avgcount(&self, v: u32) {
        self.avgcount.store(v, Ordering::Release);
    }

    /// Convenience wrappers for single-queue operations.
    pub(crate) fn insert(&self, l: LwpRef) {
        let mut inner = self.lock();
        inner.push(l.clone());
        self.note_insert(&inner, &l);
    }

    pub(crate) fn remove(&self, l: &LwpRef) {
        let mut inner = self.lock();
        inner.remove(l);
        self.note_remove(&inner, l);
    }

    pub(crate) fn take_highest(&self) -> Option<LwpRef> {
        let mut inner = self.lock();
        let l = inner.pop_highest()?;
        self.note_remove(&inner, &l);
        Some(l)
    }
}

impl core::fmt::Debug for RunQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "rq {{ count: {}, mcount: {}, highest: {} [",
            self.len(),
            self.migratable_len(),
            inner.highest()
        )?;
        let mut pri = inner.bitmap.highest();
        while let Some(p) = pri {
            write!(f, " {}:{}", p, inner.queues[p as usize].iter().count())?;
            pri = inner.bitmap.next_below(p);
        }
        write!(f, " ] }}")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lwp::{Lwp, LwpFlags};

    fn consistent(rq: &RunQueue) {
        let inner = rq.lock();
        let mut count = 0;
        let mut min = None;
        for p in 0..PRI_COUNT as Pri {
            let n = inner.queues[p as usize].iter().count();
            assert_eq!(inner.bitmap.is_set(p), n > 0, "bitmap mismatch at {p}");
            if n > 0 && min.is_none() {
                min = Some(p);
            }
            count += n;
        }
        assert_eq!(inner.highest(), min.unwrap_or(PRI_MAX));
        assert_eq!(rq.len() as usize, count);
    }

    #[test]
    fn bitmap_queue_consistency() {
        let rq = RunQueue::new();
        consistent(&rq);
        let a = Lwp::new(10, LwpFlags::empty(), 0);
        let b = Lwp::new(60, LwpFlags::empty(), 0);
        let c = Lwp::new(5, LwpFlags::BOUND, 0);
        rq.insert(a.clone());
        consistent(&rq);
        rq.insert(b.clone());
        consistent(&rq);
        rq.insert(c.clone());
        consistent(&rq);
        assert_eq!(rq.highest_pri(), 5);
        assert_eq!(rq.len(), 3);
        assert_eq!(rq.migratable_len(), 2);

        rq.remove(&c);
        consistent(&rq);
        assert_eq!(rq.highest_pri(), 10);
        rq.remove(&a);
        consistent(&rq);
        assert_eq!(rq.highest_pri(), 60);
        rq.remove(&b);
        consistent(&rq);
        assert_eq!(rq.highest_pri(), PRI_MAX);
        assert!(rq.is_empty());
    }

    #[test]
    fn take_respects_priority_then_fifo() {
        let rq = RunQueue::new();
        let l10 = Lwp::new(10, LwpFlags::empty(), 0);
        let l60a = Lwp::new(60, LwpFlags::empty(), 0);
        let l60b = Lwp::new(60, LwpFlags::empty(), 0);
        let l5 = Lwp::new(5, LwpFlags::empty(), 0);
        for l in [&l10, &l60a, &l60b, &l5] {
            rq.insert(l.clone());
        }
        let order: Vec<u64> = core::iter::from_fn(|| rq.take_highest())
            .map(|l| l.id())
            .collect();
        assert_eq!(order, vec![l5.id(), l10.id(), l60a.id(), l60b.id()]);
        consistent(&rq);
    }

    #[test]
    fn steal_skips_bound_system_and_hot() {
        let rq = RunQueue::new();
        let bound = Lwp::new(10, LwpFlags::BOUND, 0);
        let system = Lwp::new(20, LwpFlags::SYSTEM, 0);
        let hot = Lwp::new(30, LwpFlags::empty(), 0);
        hot.sched.lrtime.store(95, Ordering::Release);
        let cold = Lwp::new(40, LwpFlags::empty(), 0);
        for l in [&bound, &system, &hot, &cold] {
            rq.insert(l.clone());
        }
        let got = {
            let mut inner = rq.lock();
            let got = inner.steal_candidate(100, 10).unwrap();
            rq.note_remove(&inner, &got);
            got
        };
        assert_eq!(got.id(), cold.id());
        consistent(&rq);
        // Nothing else is eligible.
        assert!(rq.lock().steal_candidate(100, 10).is_none());
    }

    #[test]
    #[should_panic(expected = "already queued")]
    fn double_insert_is_fatal() {
        let rq = RunQueue::new();
        let l = Lwp::new(60, LwpFlags::empty(), 0);
        rq.insert(l.clone());
        rq.insert(l);
    }

    #[test]
    #[should_panic(expected = "not on a run queue")]
    fn remove_unqueued_is_fatal() {
        let rq = RunQueue::new();
        let l = Lwp::new(60, LwpFlags::empty(), 0);
        rq.remove(&l);
    }
}
