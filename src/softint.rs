//! Software-interrupt dispatch.
//!
//! Handlers are registered once, globally, and replicated to every CPU.
//! Each CPU owns four softint levels; each level has a FIFO of pending
//! handler slots and a dedicated, CPU-bound dispatch LWP that drains the
//! FIFO at the level's IPL. Scheduling an already-pending handler on the
//! same CPU coalesces into the existing queue entry.
//!
//! A CPU never touches another CPU's pending state directly. Cross-CPU
//! scheduling goes through the IPI layer and runs as a local schedule on
//! the target.

use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::{
    cpu::{Cpu, CpuId},
    interrupt::Ipl,
    lwp::{Lwp, LwpFlags, LwpRef},
    once::Once,
    sched::{Pri, PRI_SOFTBIO, PRI_SOFTCLOCK, PRI_SOFTNET, PRI_SOFTSERIAL},
    spinlock::{spin_wait_until, Spinlock},
    System,
};

/// Size of the handler table, including the reserved slot 0.
pub const MAX_SOFTINTS: usize = 64;

/// The four softint levels, lowest-urgency first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SoftLevelKind {
    Clock = 0,
    Bio = 1,
    Net = 2,
    Serial = 3,
}

pub(crate) const NLEVELS: usize = 4;

impl SoftLevelKind {
    pub const ALL: [SoftLevelKind; NLEVELS] = [
        SoftLevelKind::Clock,
        SoftLevelKind::Bio,
        SoftLevelKind::Net,
        SoftLevelKind::Serial,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => SoftLevelKind::Clock,
            1 => SoftLevelKind::Bio,
            2 => SoftLevelKind::Net,
            _ => SoftLevelKind::Serial,
        }
    }

    /// IPL the handlers of this level run at.
    pub fn ipl(self) -> Ipl {
        match self {
            SoftLevelKind::Clock => Ipl::SoftClock,
            SoftLevelKind::Bio => Ipl::SoftBio,
            SoftLevelKind::Net => Ipl::SoftNet,
            SoftLevelKind::Serial => Ipl::SoftSerial,
        }
    }

    /// Scheduling priority of this level's dispatch LWP. More urgent
    /// levels get numerically lower (more important) priorities, all above
    /// every ordinary thread.
    pub fn pri(self) -> Pri {
        match self {
            SoftLevelKind::Clock => PRI_SOFTCLOCK,
            SoftLevelKind::Bio => PRI_SOFTBIO,
            SoftLevelKind::Net => PRI_SOFTNET,
            SoftLevelKind::Serial => PRI_SOFTSERIAL,
        }
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SoftintFlags: u32 {
        /// Handler takes its own locks; no global serialization needed.
        const MPSAFE = 1 << 0;
        /// Handler may be scheduled onto a remote CPU.
        const XCPU = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SoftintError {
    /// All handler slots are in use.
    TableFull,
}

impl core::fmt::Display for SoftintError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SoftintError::TableFull => write!(f, "softint handler table full"),
        }
    }
}

/// Opaque registration handle returned by
/// [`softint_establish`](System::softint_establish).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SoftintHandle(u32);

impl SoftintHandle {
    fn index(self) -> usize {
        self.0 as usize
    }
}

pub type SoftintFn = Arc<dyn Fn() + Send + Sync>;

/// Hook for the embedder to override how an idle level gets its dispatch
/// LWP running (a machine-level fast path). When unset, activation goes
/// through the ordinary scheduler.
pub trait SoftintTrigger: Send + Sync {
    fn trigger(&self, sys: &System, ci: &Cpu, level: SoftLevelKind);

    /// Kick a remote CPU into draining its IPI queue. The default relies
    /// on the embedder calling [`System::run_ipi_tasks`] itself.
    fn notify_remote(&self, _sys: &System, _target: &Cpu) {}
}

#[derive(Clone)]
struct SoftSlot {
    level: SoftLevelKind,
    flags: SoftintFlags,
}

/// Global registration table, shared by all CPUs.
pub(crate) struct SoftintRegistry {
    slots: Spinlock<Vec<Option<SoftSlot>>>,
    trigger: Once<Box<dyn SoftintTrigger>>,
}

impl SoftintRegistry {
    pub(crate) fn new(_ncpu: usize) -> Self {
        let mut slots = Vec::with_capacity(MAX_SOFTINTS);
        slots.resize(MAX_SOFTINTS, None);
        Self {
            slots: Spinlock::new(slots),
            trigger: Once::new(),
        }
    }
}

const LEVEL_NONE: u32 = u32::MAX;
const EXECUTING_NONE: u32 = u32::MAX;

/// Per-CPU replica of one handler slot. `level` doubles as the liveness
/// flag (`LEVEL_NONE` when the slot is free or torn down).
struct SlotCell {
    level: AtomicU32,
    pending: core::sync::atomic::AtomicBool,
    func: Spinlock<Option<SoftintFn>>,
}

impl SlotCell {
    fn new() -> Self {
        Self {
            level: AtomicU32::new(LEVEL_NONE),
            pending: core::sync::atomic::AtomicBool::new(false),
            func: Spinlock::new(None),
        }
    }
}

struct LevelQueue {
    fifo: VecDeque<u32>,
    /// True from the moment the level is activated until its dispatch
    /// drain finds the FIFO empty. At most one activation is in flight.
    active: bool,
}

pub(crate) struct SoftLevel {
    queue: Spinlock<LevelQueue>,
    /// Slot currently running on this level, `EXECUTING_NONE` otherwise.
    executing: AtomicU32,
    lwp: Once<LwpRef>,
    /// Handler invocations dispatched on this level.
    dispatched: AtomicU64,
    /// Times this level's dispatch thread blocked mid-drain.
    blocked: AtomicU64,
}

impl SoftLevel {
    fn new() -> Self {
        Self {
            queue: Spinlock::new(LevelQueue {
                fifo: VecDeque::new(),
                active: false,
            }),
            executing: AtomicU32::new(EXECUTING_NONE),
            lwp: Once::new(),
            dispatched: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
        }
    }
}

/// Per-CPU softint state.
pub(crate) struct SoftCpu {
    slots: Box<[SlotCell]>,
    levels: [SoftLevel; NLEVELS],
}

impl SoftCpu {
    pub(crate) fn new() -> Self {
        Self {
            slots: (0..MAX_SOFTINTS).map(|_| SlotCell::new()).collect(),
            levels: [
                SoftLevel::new(),
                SoftLevel::new(),
                SoftLevel::new(),
                SoftLevel::new(),
            ],
        }
    }
}

impl System {
    /// Create the per-CPU, per-level dispatch LWPs. Called once at
    /// bring-up.
    pub(crate) fn softint_init(&self) {
        for ci in self.cpus() {
            for level in SoftLevelKind::ALL {
                ci.soft.levels[level.index()].lwp.call_once(|| {
                    Lwp::new(
                        level.pri(),
                        LwpFlags::BOUND | LwpFlags::SYSTEM | LwpFlags::SOFTINT,
                        ci.id(),
                    )
                });
            }
        }
    }

    /// Install a machine-level trigger. Must be called at most once,
    /// before any softint is scheduled through it.
    pub fn set_trigger(&self, t: Box<dyn SoftintTrigger>) {
        assert!(
            self.soft.trigger.poll().is_none(),
            "softint trigger already installed"
        );
        self.soft.trigger.call_once(|| t);
    }

    /// The dispatch LWP for `(cpu, level)`.
    pub fn softint_lwp(&self, cpu: CpuId, level: SoftLevelKind) -> LwpRef {
        self.cpu(cpu).soft.levels[level.index()].lwp.wait().clone()
    }

    /// Handler invocations dispatched for `(cpu, level)`.
    pub fn softint_dispatched(&self, cpu: CpuId, level: SoftLevelKind) -> u64 {
        self.cpu(cpu).soft.levels[level.index()]
            .dispatched
            .load(Ordering::Relaxed)
    }

    /// Times the `(cpu, level)` dispatch thread blocked mid-drain.
    pub fn softint_blocked(&self, cpu: CpuId, level: SoftLevelKind) -> u64 {
        self.cpu(cpu).soft.levels[level.index()]
            .blocked
            .load(Ordering::Relaxed)
    }

    /// Charge a block to the level whose dispatch LWP `l` is. Called from
    /// the sleep path when a softint thread blocks inside a handler.
    pub(crate) fn softint_note_block(&self, l: &LwpRef) {
        let ci = self.cpu(l.cpu_id());
        ci.stats.softint_block.fetch_add(1, Ordering::Relaxed);
        for sl in &ci.soft.levels {
            if sl.lwp.poll().map_or(false, |w| w.id() == l.id()) {
                sl.blocked.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }

    /// Register `func` to run at `level` and replicate it to every CPU.
    pub fn softint_establish(
        &self,
        level: SoftLevelKind,
        flags: SoftintFlags,
        func: SoftintFn,
    ) -> Result<SoftintHandle, SoftintError> {
        let mut slots = self.soft.slots.lock();
        // Slot 0 stays reserved so a zeroed handle is never valid.
        let Some(ix) = (1..MAX_SOFTINTS).find(|&ix| slots[ix].is_none()) else {
            log::warn!("softint_establish: handler table full");
            return Err(SoftintError::TableFull);
        };
        slots[ix] = Some(SoftSlot { level, flags });
        for ci in self.cpus() {
            let cell = &ci.soft.slots[ix];
            *cell.func.lock() = Some(func.clone());
            cell.level.store(level as u32, Ordering::Release);
        }
        log::trace!("softint {} established at {:?}", ix, level);
        Ok(SoftintHandle(ix as u32))
    }

    /// Mark `h` pending on the calling CPU `ci` and activate its level if
    /// idle. Idempotent while the handler is already pending here. The
    /// caller must have preemption disabled.
    pub fn softint_schedule(&self, ci: &Cpu, h: SoftintHandle) {
        assert!(
            ci.preempt_disabled(),
            "softint_schedule with preemption enabled"
        );
        let ix = h.index();
        let cell = &ci.soft.slots[ix];
        if cell.pending.swap(true, Ordering::AcqRel) {
            // Already queued here; the dispatch drain will pick it up.
            return;
        }
        let raw = cell.level.load(Ordering::Acquire);
        if raw == LEVEL_NONE {
            log::warn!("softint_schedule on a dead handle {}", ix);
            cell.pending.store(false, Ordering::Release);
            return;
        }
        let level = SoftLevelKind::from_raw(raw);
        let activate = {
            let mut q = ci.soft.levels[level.index()].queue.lock();
            q.fifo.push_back(ix as u32);
            if q.active {
                false
            } else {
                q.active = true;
                true
            }
        };
        if activate {
            self.softint_trigger(ci, level);
        }
    }

    /// Schedule `h` on `target`, which may be a remote CPU. The handler
    /// must have been established with [`SoftintFlags::XCPU`].
    pub fn softint_schedule_cpu(&self, sender: &Cpu, h: SoftintHandle, target: CpuId) {
        {
            let slots = self.soft.slots.lock();
            let slot = slots[h.index()]
                .as_ref()
                .expect("softint_schedule_cpu on a dead handle");
            assert!(
                slot.flags.contains(SoftintFlags::XCPU),
                "softint {} not registered for cross-cpu use",
                h.index()
            );
        }
        if target == sender.id() {
            self.softint_schedule(sender, h);
            return;
        }
        self.ipi_send(
            sender,
            target,
            Box::new(move |sys, ci| {
                let _p = ci.kpreempt_disable();
                sys.softint_schedule(ci, h);
            }),
        );
    }

    /// Get an idle level's dispatch LWP running on `ci`.
    fn softint_trigger(&self, ci: &Cpu, level: SoftLevelKind) {
        if let Some(t) = self.soft.trigger.poll() {
            t.trigger(self, ci, level);
            return;
        }
        let lwp = ci.soft.levels[level.index()].lwp.wait().clone();
        if lwp.sched.rq_pri.load(Ordering::Acquire) == crate::sched::PRI_NONE {
            self.sched_enqueue(ci, lwp, false);
        }
    }

    pub(crate) fn softint_notify_remote(&self, target: &Cpu) {
        if let Some(t) = self.soft.trigger.poll() {
            t.notify_remote(self, target);
        }
    }

    /// Drain one level on `ci`. This is the body of the level's dispatch
    /// LWP: pop pending slots in FIFO order and run each handler at the
    /// level's IPL until the queue is empty, then deactivate.
    ///
    /// The pending mark is cleared before the handler runs, so a handler
    /// that re-schedules itself lands back on the FIFO and runs again
    /// within the same drain.
    pub fn softint_execute(&self, ci: &Cpu, level: SoftLevelKind) {
        let sl = &ci.soft.levels[level.index()];
        loop {
            let ix = {
                let mut q = sl.queue.lock();
                match q.fifo.pop_front() {
                    Some(ix) => ix as usize,
                    None => {
                        q.active = false;
                        break;
                    }
                }
            };
            let cell = &ci.soft.slots[ix];
            // Publish the executing slot before clearing the pending mark;
            // disestablish checks them in the opposite order and must never
            // observe a quiet window while the handler is between the two.
            sl.executing.store(ix as u32, Ordering::Release);
            cell.pending.store(false, Ordering::Release);
            // A disestablish may have raced the queue entry; skip torn-down
            // slots.
            let Some(func) = cell.func.lock().clone() else {
                sl.executing.store(EXECUTING_NONE, Ordering::Release);
                continue;
            };
            let depth = ci.preempt_depth();
            {
                let _spl = ci.splraise(level.ipl());
                func();
                assert_eq!(
                    ci.current_ipl(),
                    level.ipl(),
                    "softint handler leaked an spl level"
                );
            }
            assert_eq!(
                ci.preempt_depth(),
                depth,
                "softint handler leaked a preemption hold"
            );
            sl.executing.store(EXECUTING_NONE, Ordering::Release);
            sl.dispatched.fetch_add(1, Ordering::Relaxed);
            ci.stats.softint_dispatch.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Unregister `h`. Blocks until the handler is neither pending nor
    /// executing on any CPU, then tears down every replica. Scheduling `h`
    /// after this returns is a warned no-op.
    pub fn softint_disestablish(&self, h: SoftintHandle) {
        let ix = h.index();
        spin_wait_until(
            || {
                let quiet = self.cpus().all(|ci| {
                    !ci.soft.slots[ix].pending.load(Ordering::Acquire)
                        && self
                            .levels_of(ci)
                            .all(|sl| sl.executing.load(Ordering::Acquire) != ix as u32)
                });
                quiet.then_some(())
            },
            || core::hint::spin_loop(),
        );
        let mut slots = self.soft.slots.lock();
        assert!(slots[ix].is_some(), "softint {} not established", ix);
        slots[ix] = None;
        for ci in self.cpus() {
            let cell = &ci.soft.slots[ix];
            cell.level.store(LEVEL_NONE, Ordering::Release);
            *cell.func.lock() = None;
        }
        log::trace!("softint {} disestablished", ix);
    }

    fn levels_of<'a>(&self, ci: &'a Cpu) -> impl Iterator<Item = &'a SoftLevel> {
        ci.soft.levels.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    fn counting_handler() -> (SoftintFn, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let f: SoftintFn = Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (f, counter)
    }

    /// Run the dispatch LWP the way the scheduler would: pick it off the
    /// run queue, drain the level, go idle.
    fn dispatch_once(sys: &System, cpu: CpuId, level: SoftLevelKind) {
        let ci = sys.cpu(cpu);
        let l = sys.sched_nextlwp(ci).expect("dispatch lwp queued");
        assert_eq!(l.id(), sys.softint_lwp(cpu, level).id());
        sys.softint_execute(ci, level);
        sys.sched_idle(ci);
    }

    #[test]
    fn schedule_coalesces_until_dispatch() {
        let sys = System::new(1);
        let ci = sys.cpu(0);
        let (f, counter) = counting_handler();
        let h = sys
            .softint_establish(SoftLevelKind::Net, SoftintFlags::MPSAFE, f)
            .unwrap();

        {
            let _p = ci.kpreempt_disable();
            sys.softint_schedule(ci, h);
            sys.softint_schedule(ci, h);
            sys.softint_schedule(ci, h);
        }
        dispatch_once(&sys, 0, SoftLevelKind::Net);
        assert_eq!(counter.load(Ordering::SeqCst), 1, "three schedules, one run");
        assert!(sys.sched_nextlwp(ci).is_none(), "cpu idle after the drain");

        // The next schedule starts a fresh activation.
        {
            let _p = ci.kpreempt_disable();
            sys.softint_schedule(ci, h);
        }
        dispatch_once(&sys, 0, SoftLevelKind::Net);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handlers_run_in_schedule_order() {
        let sys = System::new(1);
        let ci = sys.cpu(0);
        let order = Arc::new(Spinlock::new(Vec::new()));
        let mut handles = Vec::new();
        for tag in 0..3u32 {
            let o = order.clone();
            let f: SoftintFn = Arc::new(move || o.lock().push(tag));
            handles.push(
                sys.softint_establish(SoftLevelKind::Bio, SoftintFlags::MPSAFE, f)
                    .unwrap(),
            );
        }
        {
            let _p = ci.kpreempt_disable();
            sys.softint_schedule(ci, handles[2]);
            sys.softint_schedule(ci, handles[0]);
            sys.softint_schedule(ci, handles[1]);
        }
        dispatch_once(&sys, 0, SoftLevelKind::Bio);
        assert_eq!(*order.lock(), vec![2, 0, 1]);
    }

    #[test]
    fn reschedule_during_execution_runs_in_same_drain() {
        let sys = Arc::new(System::new(1));
        let (tx, counter) = {
            let counter = Arc::new(AtomicUsize::new(0));
            (counter.clone(), counter)
        };
        let handle = Arc::new(Spinlock::new(None::<SoftintHandle>));
        let hslot = handle.clone();
        let s = sys.clone();
        let f: SoftintFn = Arc::new(move || {
            let n = tx.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                // First run re-arms itself; pending was already cleared so
                // this lands back on the queue.
                let ci = s.cpu(0);
                let _p = ci.kpreempt_disable();
                s.softint_schedule(ci, hslot.lock().unwrap());
            }
        });
        let h = sys
            .softint_establish(SoftLevelKind::Clock, SoftintFlags::MPSAFE, f)
            .unwrap();
        *handle.lock() = Some(h);

        let ci = sys.cpu(0);
        {
            let _p = ci.kpreempt_disable();
            sys.softint_schedule(ci, h);
        }
        dispatch_once(&sys, 0, SoftLevelKind::Clock);
        assert_eq!(counter.load(Ordering::SeqCst), 2, "re-arm ran in the same drain");
        assert!(sys.sched_nextlwp(ci).is_none());
    }

    #[test]
    fn active_level_is_not_reactivated() {
        let sys = System::new(1);
        let ci = sys.cpu(0);
        let (fa, ca) = counting_handler();
        let (fb, cb) = counting_handler();
        let ha = sys
            .softint_establish(SoftLevelKind::Serial, SoftintFlags::MPSAFE, fa)
            .unwrap();
        let hb = sys
            .softint_establish(SoftLevelKind::Serial, SoftintFlags::MPSAFE, fb)
            .unwrap();

        {
            let _p = ci.kpreempt_disable();
            sys.softint_schedule(ci, ha);
        }
        // The level is active: the dispatch lwp is queued exactly once and
        // a second handler does not queue it again.
        let lwp = sys.sched_nextlwp(ci).unwrap();
        assert_eq!(lwp.id(), sys.softint_lwp(0, SoftLevelKind::Serial).id());
        {
            let _p = ci.kpreempt_disable();
            sys.softint_schedule(ci, hb);
        }
        assert!(ci.rq.is_empty(), "no second activation while active");
        sys.softint_execute(ci, SoftLevelKind::Serial);
        assert_eq!(ca.load(Ordering::SeqCst), 1);
        assert_eq!(cb.load(Ordering::SeqCst), 1, "late handler joined the drain");
    }

    #[test]
    fn handler_runs_at_level_ipl() {
        let sys = Arc::new(System::new(1));
        let s = sys.clone();
        let seen = Arc::new(Spinlock::new(None));
        let out = seen.clone();
        let f: SoftintFn = Arc::new(move || {
            *out.lock() = Some(s.cpu(0).current_ipl());
        });
        let h = sys
            .softint_establish(SoftLevelKind::Bio, SoftintFlags::MPSAFE, f)
            .unwrap();
        let ci = sys.cpu(0);
        {
            let _p = ci.kpreempt_disable();
            sys.softint_schedule(ci, h);
        }
        dispatch_once(&sys, 0, SoftLevelKind::Bio);
        assert_eq!(*seen.lock(), Some(Ipl::SoftBio));
    }

    #[test]
    fn establish_fails_when_table_full() {
        let sys = System::new(1);
        let mut handles = Vec::new();
        loop {
            let (f, _) = counting_handler();
            match sys.softint_establish(SoftLevelKind::Net, SoftintFlags::MPSAFE, f) {
                Ok(h) => handles.push(h),
                Err(e) => {
                    assert_eq!(e, SoftintError::TableFull);
                    break;
                }
            }
        }
        // Slot 0 is reserved.
        assert_eq!(handles.len(), MAX_SOFTINTS - 1);
        // Disestablishing frees a slot for reuse.
        sys.softint_disestablish(handles.pop().unwrap());
        let (f, _) = counting_handler();
        assert!(sys
            .softint_establish(SoftLevelKind::Net, SoftintFlags::MPSAFE, f)
            .is_ok());
    }

    #[test]
    fn schedule_after_disestablish_is_a_noop() {
        let sys = System::new(1);
        let ci = sys.cpu(0);
        let (f, counter) = counting_handler();
        let h = sys
            .softint_establish(SoftLevelKind::Net, SoftintFlags::MPSAFE, f)
            .unwrap();
        {
            let _p = ci.kpreempt_disable();
            sys.softint_schedule(ci, h);
        }
        dispatch_once(&sys, 0, SoftLevelKind::Net);
        sys.softint_disestablish(h);

        {
            let _p = ci.kpreempt_disable();
            sys.softint_schedule(ci, h);
        }
        assert!(ci.rq.is_empty());
        sys.softint_execute(ci, SoftLevelKind::Net);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cross_cpu_schedule_lands_on_target() {
        let sys = System::new(2);
        let (f, counter) = counting_handler();
        let h = sys
            .softint_establish(
                SoftLevelKind::Net,
                SoftintFlags::MPSAFE | SoftintFlags::XCPU,
                f,
            )
            .unwrap();
        sys.softint_schedule_cpu(sys.cpu(0), h, 1);
        // Nothing happens until the IPI is delivered on the target.
        assert!(sys.cpu(1).rq.is_empty());
        sys.run_ipi_tasks(1);
        dispatch_once(&sys, 1, SoftLevelKind::Net);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(
            sys.cpu(1)
                .stats
                .softint_dispatch
                .load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    #[should_panic(expected = "not registered for cross-cpu")]
    fn cross_cpu_requires_xcpu_flag() {
        let sys = System::new(2);
        let (f, _) = counting_handler();
        let h = sys
            .softint_establish(SoftLevelKind::Net, SoftintFlags::MPSAFE, f)
            .unwrap();
        sys.softint_schedule_cpu(sys.cpu(0), h, 1);
    }

    #[test]
    #[should_panic(expected = "preemption enabled")]
    fn schedule_requires_preemption_disabled() {
        let sys = System::new(1);
        let (f, _) = counting_handler();
        let h = sys
            .softint_establish(SoftLevelKind::Net, SoftintFlags::MPSAFE, f)
            .unwrap();
        sys.softint_schedule(sys.cpu(0), h);
    }

    #[test]
    fn blocking_handler_is_charged_to_its_level() {
        let sys = Arc::new(System::new(1));
        let s = sys.clone();
        let f: SoftintFn = Arc::new(move || {
            // The handler takes a sleeping lock; the sleep path charges
            // the block to the dispatch thread's level.
            let me = s.softint_lwp(0, SoftLevelKind::Bio);
            s.sched_slept(&me);
        });
        let h = sys
            .softint_establish(SoftLevelKind::Bio, SoftintFlags::MPSAFE, f)
            .unwrap();
        let ci = sys.cpu(0);
        {
            let _p = ci.kpreempt_disable();
            sys.softint_schedule(ci, h);
        }
        dispatch_once(&sys, 0, SoftLevelKind::Bio);
        assert_eq!(sys.softint_blocked(0, SoftLevelKind::Bio), 1);
        assert_eq!(sys.softint_dispatched(0, SoftLevelKind::Bio), 1);
        assert_eq!(ci.stats.softint_block.load(Ordering::Relaxed), 1);
        // Other levels are untouched.
        assert_eq!(sys.softint_blocked(0, SoftLevelKind::Net), 0);
        assert_eq!(sys.softint_dispatched(0, SoftLevelKind::Net), 0);
    }

    struct RecordingTrigger(Arc<AtomicUsize>);

    impl SoftintTrigger for RecordingTrigger {
        fn trigger(&self, _sys: &System, _ci: &Cpu, _level: SoftLevelKind) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn custom_trigger_replaces_the_scheduler_path() {
        let sys = System::new(1);
        let fired = Arc::new(AtomicUsize::new(0));
        sys.set_trigger(Box::new(RecordingTrigger(fired.clone())));
        let (f, _) = counting_handler();
        let h = sys
            .softint_establish(SoftLevelKind::Net, SoftintFlags::MPSAFE, f)
            .unwrap();
        let ci = sys.cpu(0);
        {
            let _p = ci.kpreempt_disable();
            sys.softint_schedule(ci, h);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(ci.rq.is_empty(), "default enqueue path was bypassed");
    }

    #[test]
    #[should_panic(expected = "trigger already installed")]
    fn second_trigger_is_rejected() {
        let sys = System::new(1);
        sys.set_trigger(Box::new(RecordingTrigger(Arc::new(AtomicUsize::new(0)))));
        sys.set_trigger(Box::new(RecordingTrigger(Arc::new(AtomicUsize::new(0)))));
    }
}
