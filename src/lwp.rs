//! Light-weight process (LWP): the schedulable thread unit.
//!
//! An LWP here is pure scheduling state; execution contexts, stacks, and
//! address spaces belong to the embedder. The intrusive `run_link` puts an
//! LWP on exactly one run queue at a time.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use intrusive_collections::{intrusive_adapter, linked_list::AtomicLink};

use crate::sched::{Pri, PRI_NONE};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct LwpFlags: u32 {
        /// Bound to its CPU; never migrated or stolen.
        const BOUND = 1 << 0;
        /// Kernel-internal thread; excluded from work stealing.
        const SYSTEM = 1 << 1;
        /// Softint dispatch thread for one (CPU, level) pair.
        const SOFTINT = 1 << 2;
        /// Idle LWP; never enters a run queue.
        const IDLE = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum LwpState {
    Starting = 0,
    Runnable = 1,
    Running = 2,
    Sleeping = 3,
}

impl LwpState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => LwpState::Starting,
            1 => LwpState::Runnable,
            2 => LwpState::Running,
            _ => LwpState::Sleeping,
        }
    }
}

/// Sentinel for the tick-stamp fields below. Tick 0 is a valid timestamp
/// (threads run and sleep on a freshly booted system), so "never" gets a
/// value the clock can not produce.
pub(crate) const TS_NONE: u64 = u64::MAX;

/// Per-LWP scheduling extension, attached by `sched_lwp_fork`.
#[derive(Debug)]
pub struct SchedInfo {
    /// Computed time-slice, ticks.
    pub(crate) timeslice: AtomicU32,
    /// Priority the LWP is queued at, or `PRI_NONE` if not queued.
    pub(crate) rq_pri: AtomicU32,
    /// Tick stamp of the last dispatch onto a CPU; `TS_NONE` means never
    /// ran.
    pub(crate) lrtime: AtomicU64,
    /// Tick stamp at which the LWP went to sleep; `TS_NONE` means not
    /// sleeping.
    pub(crate) sleep_start: AtomicU64,
    /// Whole seconds spent in the current sleep, maintained by pstats.
    pub(crate) slptime: AtomicU32,
    /// Decaying sums of sleep and run time, for the batch/interactive
    /// estimate.
    pub(crate) slpsum: AtomicU64,
    pub(crate) runsum: AtomicU64,
}

impl SchedInfo {
    fn new() -> Self {
        Self {
            timeslice: AtomicU32::new(0),
            rq_pri: AtomicU32::new(PRI_NONE),
            lrtime: AtomicU64::new(TS_NONE),
            sleep_start: AtomicU64::new(TS_NONE),
            slptime: AtomicU32::new(0),
            slpsum: AtomicU64::new(0),
            runsum: AtomicU64::new(0),
        }
    }

    pub fn timeslice(&self) -> u32 {
        self.timeslice.load(Ordering::Acquire)
    }

    /// Batch threads accumulate more run time than sleep time.
    pub fn is_batch(&self) -> bool {
        self.runsum.load(Ordering::Relaxed) > self.slpsum.load(Ordering::Relaxed)
    }
}

pub struct Lwp {
    id: u64,
    flags: AtomicU32,
    pri: AtomicU32,
    state: AtomicU32,
    /// CPU the LWP belongs to (its run queue owner when runnable).
    cpu: AtomicU32,
    pub sched: SchedInfo,
    pub(crate) run_link: AtomicLink,
}

pub type LwpRef = Arc<Lwp>;

intrusive_adapter!(pub RunLinkAdapter = LwpRef: Lwp { run_link: AtomicLink });

static LWP_IDS: AtomicU64 = AtomicU64::new(1);

impl Lwp {
    pub fn new(pri: Pri, flags: LwpFlags, cpu: u32) -> LwpRef {
        Arc::new(Self {
            id: LWP_IDS.fetch_add(1, Ordering::Relaxed),
            flags: AtomicU32::new(flags.bits()),
            pri: AtomicU32::new(pri),
            state: AtomicU32::new(LwpState::Starting as u32),
            cpu: AtomicU32::new(cpu),
            sched: SchedInfo::new(),
            run_link: AtomicLink::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn flags(&self) -> LwpFlags {
        LwpFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub fn pri(&self) -> Pri {
        self.pri.load(Ordering::Acquire)
    }

    pub(crate) fn set_pri(&self, pri: Pri) {
        self.pri.store(pri, Ordering::Release);
    }

    pub fn state(&self) -> LwpState {
        LwpState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: LwpState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn cpu_id(&self) -> u32 {
        self.cpu.load(Ordering::Acquire)
    }

    pub(crate) fn set_cpu_id(&self, cpu: u32) {
        self.cpu.store(cpu, Ordering::Release);
    }

    /// Whether this LWP may be moved off its current CPU.
    pub fn migratable(&self) -> bool {
        !self.flags().intersects(LwpFlags::BOUND)
    }
}

impl core::fmt::Debug for Lwp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Lwp")
            .field("id", &self.id)
            .field("pri", &self.pri())
            .field("state", &self.state())
            .field("cpu", &self.cpu_id())
            .field("flags", &self.flags())
            .finish()
    }
}
