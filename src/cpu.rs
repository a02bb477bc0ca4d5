//! Per-CPU context: run queue, softint state, IPL/preemption model, and
//! counters. One `Cpu` per execution unit, created at bring-up and never
//! torn down while the [`System`](crate::System) is alive.

pub mod ipi;

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use alloc::{sync::Arc, vec::Vec};

use crate::{
    interrupt::{Ipl, KPreemptGuard, SplGuard},
    sched::{rq::RunQueue, Pri, PRI_NONE},
    softint::SoftCpu,
    spinlock::Spinlock,
};

pub type CpuId = u32;

#[derive(Debug, Default)]
pub struct CpuStats {
    /// LWPs taken off a remote CPU's queue by this CPU.
    pub steals: AtomicU64,
    /// LWPs this CPU sent elsewhere on wakeup.
    pub migrations: AtomicU64,
    /// Reschedule requests raised against this CPU.
    pub preempts: AtomicU64,
    /// Softint handler invocations dispatched here, all levels. Per-level
    /// counts live on the level itself.
    pub softint_dispatch: AtomicU64,
    /// Times a softint dispatch thread blocked mid-drain, all levels.
    pub softint_block: AtomicU64,
}

pub struct Cpu {
    id: CpuId,
    online: AtomicBool,
    pub rq: RunQueue,
    pub(crate) soft: SoftCpu,
    /// Priority of the LWP currently running here; `PRI_NONE` when idle.
    current_pri: AtomicU32,
    /// Remaining time-slice of the running LWP, ticks.
    slice_left: AtomicU32,
    resched: AtomicBool,
    ipl: AtomicU32,
    preempt: AtomicU32,
    pub stats: CpuStats,
    ipi_tasks: Spinlock<Vec<Arc<ipi::IpiTask>>>,
}

impl Cpu {
    pub(crate) fn new(id: CpuId) -> Self {
        Self {
            id,
            online: AtomicBool::new(true),
            rq: RunQueue::new(),
            soft: SoftCpu::new(),
            current_pri: AtomicU32::new(PRI_NONE),
            slice_left: AtomicU32::new(0),
            resched: AtomicBool::new(false),
            ipl: AtomicU32::new(Ipl::None as u32),
            preempt: AtomicU32::new(0),
            stats: CpuStats::default(),
            ipi_tasks: Spinlock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Priority currently running on this CPU, `PRI_NONE` when idle.
    pub fn current_pri(&self) -> Pri {
        self.current_pri.load(Ordering::Acquire)
    }

    pub(crate) fn set_current_pri(&self, pri: Pri) {
        self.current_pri.store(pri, Ordering::Release);
    }

    pub fn is_idle(&self) -> bool {
        self.current_pri() == PRI_NONE && self.rq.is_empty()
    }

    pub(crate) fn slice_left(&self) -> u32 {
        self.slice_left.load(Ordering::Acquire)
    }

    pub(crate) fn set_slice_left(&self, ticks: u32) {
        self.slice_left.store(ticks, Ordering::Release);
    }

    /// Consume one tick of the running slice; true when it has expired.
    pub(crate) fn slice_tick(&self) -> bool {
        let left = self.slice_left.load(Ordering::Acquire);
        if left <= 1 {
            self.slice_left.store(0, Ordering::Release);
            true
        } else {
            self.slice_left.store(left - 1, Ordering::Release);
            false
        }
    }

    pub(crate) fn set_resched(&self) {
        if !self.resched.swap(true, Ordering::AcqRel) {
            self.stats.preempts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Test-and-clear the reschedule request.
    pub fn take_resched(&self) -> bool {
        self.resched.swap(false, Ordering::AcqRel)
    }

    pub fn needs_resched(&self) -> bool {
        self.resched.load(Ordering::Acquire)
    }

    pub fn current_ipl(&self) -> Ipl {
        Ipl::from_raw(self.ipl.load(Ordering::Acquire))
    }

    pub(crate) fn set_ipl(&self, ipl: Ipl) {
        self.ipl.store(ipl as u32, Ordering::Release);
    }

    /// Raise the interrupt priority level, restoring it when the guard
    /// drops.
    pub fn splraise(&self, ipl: Ipl) -> SplGuard<'_> {
        SplGuard::raise(self, ipl)
    }

    /// Disable preemption on this CPU for the lifetime of the guard.
    pub fn kpreempt_disable(&self) -> KPreemptGuard<'_> {
        KPreemptGuard::enter(self)
    }

    pub(crate) fn preempt_disable(&self) {
        self.preempt.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn preempt_enable(&self) {
        let old = self.preempt.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "preemption depth underflow");
    }

    /// Whether preemption is currently held off on this CPU, either by an
    /// explicit guard or by running above IPL_NONE.
    pub fn preempt_disabled(&self) -> bool {
        self.preempt.load(Ordering::Acquire) > 0 || self.current_ipl() > Ipl::None
    }

    pub(crate) fn preempt_depth(&self) -> u32 {
        self.preempt.load(Ordering::Acquire)
    }

    pub(crate) fn enqueue_ipi_task(&self, task: Arc<ipi::IpiTask>) {
        task.outstanding.fetch_add(1, Ordering::SeqCst);
        self.ipi_tasks.lock().push(task);
    }

    pub(crate) fn drain_ipi_tasks(&self) -> Vec<Arc<ipi::IpiTask>> {
        let mut tasks = self.ipi_tasks.lock();
        core::mem::take(&mut *tasks)
    }
}

impl core::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cpu")
            .field("id", &self.id)
            .field("online", &self.is_online())
            .field("current_pri", &self.current_pri())
            .field("rq", &self.rq)
            .finish()
    }
}
