//! The M2 scheduling policy: time-slice management, priority aging and
//! wakeup boosting, migration-target selection, work stealing, and the
//! periodic load balancer.
//!
//! Every entry point here takes the CPU context it operates on explicitly;
//! cross-CPU movement happens only in `sched_catchlwp` (under an
//! index-ordered double lock) and in the wakeup path (which only picks a
//! target; the enqueue itself is a normal single-queue insert).

use core::sync::atomic::Ordering;

use super::{pri_is_realtime, Pri, PRI_MAX, PRI_NONE, PRI_TS_FIRST, NZERO};
use crate::{
    clock::HZ,
    cpu::Cpu,
    lwp::{LwpFlags, LwpRef, LwpState, TS_NONE},
    System, NO_WORKER,
};

impl System {
    /// Attach scheduling state to a new LWP. The child inherits its
    /// parent's priority; its accounting sums start empty.
    pub fn sched_lwp_fork(&self, parent: Option<&LwpRef>, child: &LwpRef) {
        if let Some(p) = parent {
            child.set_pri(p.pri());
        }
        child
            .sched
            .timeslice
            .store(self.tune.timeslice(child.pri()), Ordering::Release);
    }

    /// Detach scheduling state. The LWP must no longer be queued.
    pub fn sched_lwp_exit(&self, l: &LwpRef) {
        assert_eq!(
            l.sched.rq_pri.load(Ordering::Acquire),
            PRI_NONE,
            "exiting lwp {} still queued",
            l.id()
        );
    }

    /// Hook for the thread lifecycle manager; the M2 policy needs no work
    /// here beyond what `sched_enqueue` already does.
    pub fn sched_setrunnable(&self, _l: &LwpRef) {}

    /// Map a nice value onto the time-sharing band. Real-time LWPs are
    /// unaffected.
    pub fn sched_nice(&self, l: &LwpRef, nice: i32) {
        if pri_is_realtime(l.pri()) {
            return;
        }
        let nice = nice.clamp(-(NZERO as i32), NZERO as i32 - 1);
        let pri = (PRI_TS_FIRST as i32 + NZERO as i32 + nice) as Pri;
        l.set_pri(pri.min(PRI_MAX));
        log::trace!("lwp {} niced to pri {}", l.id(), l.pri());
    }

    /// Make `l` runnable on `ci`'s queue. `swtch` is true when this is a
    /// re-queue of a thread that was just running here (involuntary switch
    /// or yield), which refreshes its cache-affinity stamp; a fresh wakeup
    /// leaves the stamp from its last dispatch.
    pub fn sched_enqueue(&self, ci: &Cpu, l: LwpRef, swtch: bool) {
        assert!(!l.flags().intersects(LwpFlags::IDLE));
        let pri = l.pri();
        l.sched
            .timeslice
            .store(self.tune.timeslice(pri), Ordering::Release);
        if swtch {
            l.sched
                .lrtime
                .store(self.clock.current_ticks(), Ordering::Release);
        }
        l.set_cpu_id(ci.id());
        l.set_state(LwpState::Runnable);
        log::trace!("enqueue lwp {} pri {} on cpu {}", l.id(), pri, ci.id());
        ci.rq.insert(l);
        if pri < ci.current_pri() {
            ci.set_resched();
        }
    }

    /// Remove `l` from `ci`'s queue (e.g. priority change, exit while
    /// runnable).
    pub fn sched_dequeue(&self, ci: &Cpu, l: &LwpRef) {
        assert_eq!(l.cpu_id(), ci.id(), "dequeue from the wrong cpu");
        ci.rq.remove(l);
    }

    /// Pick the next LWP to run on `ci`. An empty queue on a
    /// multiprocessor resets the load-average counter and tries to steal
    /// from the CPU the last balance pass designated.
    pub fn sched_nextlwp(&self, ci: &Cpu) -> Option<LwpRef> {
        if ci.rq.is_empty() {
            if self.ncpu() == 1 {
                return None;
            }
            ci.rq.set_avgcount(0);
            self.sched_catchlwp(ci)?;
        }
        let l = ci.rq.take_highest()?;
        self.dispatch(ci, &l);
        Some(l)
    }

    fn dispatch(&self, ci: &Cpu, l: &LwpRef) {
        ci.set_current_pri(l.pri());
        ci.set_slice_left(l.sched.timeslice());
        l.sched
            .lrtime
            .store(self.clock.current_ticks(), Ordering::Release);
        l.set_state(LwpState::Running);
        l.set_cpu_id(ci.id());
        log::trace!("dispatch lwp {} pri {} on cpu {}", l.id(), l.pri(), ci.id());
    }

    /// Mark `ci` as running nothing.
    pub fn sched_idle(&self, ci: &Cpu) {
        ci.set_current_pri(PRI_NONE);
    }

    /// Whether `ci` has anything runnable queued.
    pub fn sched_curcpu_runnable_p(&self, ci: &Cpu) -> bool {
        !ci.rq.is_empty()
    }

    /// Choose the CPU a waking, migratable LWP should run on.
    pub fn sched_takecpu<'a>(&'a self, curci: &'a Cpu, l: &LwpRef) -> &'a Cpu {
        let home = self.cpu(l.cpu_id());
        if !l.migratable() {
            return home;
        }
        let pri = l.pri();

        // Stay put if the home CPU has nothing to do.
        if home.is_online() && home.is_idle() {
            return home;
        }

        // Stay put while the cache is still warm from the last run, as
        // long as the thread will not be starved behind something more
        // important.
        let now = self.clock.current_ticks();
        let lr = l.sched.lrtime.load(Ordering::Acquire);
        let start = l.sched.sleep_start.load(Ordering::Acquire);
        let slept = if start == TS_NONE {
            0
        } else {
            now.saturating_sub(start)
        };
        let hot = lr != TS_NONE && now.saturating_sub(lr) < self.tune.cacheht_time() as u64;
        if home.is_online() && hot && slept <= 1 && pri <= home.current_pri() {
            return home;
        }

        // Prefer the waker's CPU if the wakee outranks whatever runs
        // there.
        if curci.is_online() && pri < curci.current_pri() {
            return curci;
        }

        // Otherwise scan for the CPU under the least important pressure:
        // maximize min(running priority, best queued priority), breaking
        // ties toward the shorter queue.
        let mut best: Option<(&Cpu, Pri, u32)> = None;
        for c in self.cpus() {
            if !c.is_online() {
                continue;
            }
            let pressure = c.current_pri().min(c.rq.highest_pri() as Pri);
            let depth = c.rq.len();
            let better = match best {
                None => true,
                Some((_, bp, bd)) => pressure > bp || (pressure == bp && depth < bd),
            };
            if better {
                best = Some((c, pressure, depth));
            }
        }
        best.map(|(c, _, _)| c).unwrap_or(home)
    }

    /// Work stealing: move one eligible LWP from the designated busiest
    /// CPU onto `ci`'s queue. Returns the moved LWP, or `None` when
    /// stealing is not profitable.
    pub fn sched_catchlwp(&self, ci: &Cpu) -> Option<LwpRef> {
        let worker = self.worker_cpu.load(Ordering::Acquire);
        if worker == NO_WORKER || worker == ci.id() {
            return None;
        }
        let target = self.cpu(worker);
        let min_catch = self.tune.min_catch();
        // Lockless pre-check; gives up early rather than bouncing the
        // remote lock around.
        if !target.is_online() || target.rq.migratable_len() < min_catch {
            return None;
        }

        // Double-lock in CPU-index order.
        let (lo, hi) = if ci.id() < target.id() {
            (ci, target)
        } else {
            (target, ci)
        };
        let lo_guard = lo.rq.lock();
        let hi_guard = hi.rq.lock();
        let (mut local, mut remote) = if ci.id() < target.id() {
            (lo_guard, hi_guard)
        } else {
            (hi_guard, lo_guard)
        };

        // The world may have changed while we were acquiring; recheck.
        if target.rq.migratable_len() < min_catch {
            return None;
        }

        let now = self.clock.current_ticks();
        let l = remote.steal_candidate(now, self.tune.cacheht_time() as u64)?;
        target.rq.note_remove(&remote, &l);
        l.set_cpu_id(ci.id());
        local.push(l.clone());
        ci.rq.note_insert(&local, &l);
        drop(local);
        drop(remote);

        ci.stats.steals.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "cpu {} stole lwp {} from cpu {}",
            ci.id(),
            l.id(),
            target.id()
        );
        Some(l)
    }

    /// Periodic balance pass: exponential moving average of each CPU's
    /// migratable count; the highest average becomes the steal target for
    /// subsequent `sched_catchlwp` calls. Runs every `balance_period`.
    pub fn sched_balance(&self) {
        let mut worker = NO_WORKER;
        let mut max_avg = 0;
        for ci in self.cpus() {
            let avg = (ci.rq.avgcount() + ci.rq.migratable_len()) >> 1;
            ci.rq.set_avgcount(avg);
            if ci.is_online() && avg > max_avg {
                max_avg = avg;
                worker = ci.id();
            }
        }
        self.worker_cpu.store(worker, Ordering::Release);
        if worker != NO_WORKER {
            log::trace!("balance pass picked worker cpu {}", worker);
        }
    }

    /// Once-per-tick accounting for the LWP running on `ci`. Returns true
    /// when the caller should yield the CPU.
    pub fn sched_tick(&self, ci: &Cpu, curlwp: &LwpRef) -> bool {
        curlwp.sched.runsum.fetch_add(1, Ordering::Relaxed);
        if !ci.slice_tick() {
            return false;
        }
        let pri = curlwp.pri();
        if pri_is_realtime(pri) {
            // Real-time: renew unconditionally.
            ci.set_slice_left(self.tune.timeslice(pri));
            return false;
        }
        // Time-sharing: age one step toward batch.
        let aged = (pri + 1).min(PRI_MAX);
        curlwp.set_pri(aged);
        ci.set_current_pri(aged);
        let ts = self.tune.timeslice(aged);
        curlwp.sched.timeslice.store(ts, Ordering::Release);
        if !ci.rq.is_empty() && ci.rq.highest_pri() <= aged {
            ci.set_resched();
            true
        } else {
            // No better candidate; keep running without a switch.
            ci.set_slice_left(ts);
            false
        }
    }

    /// Note that `l` went to sleep.
    pub fn sched_slept(&self, l: &LwpRef) {
        l.sched
            .sleep_start
            .store(self.clock.current_ticks(), Ordering::Release);
        l.set_state(LwpState::Sleeping);
        if l.flags().intersects(LwpFlags::SOFTINT) {
            self.softint_note_block(l);
        }
    }

    /// Wake `l`: boost interactive sleepers and pick the CPU to enqueue
    /// on. The caller enqueues the LWP on the returned CPU.
    pub fn sched_wakeup<'a>(&'a self, curci: &'a Cpu, l: &LwpRef) -> &'a Cpu {
        let now = self.clock.current_ticks();
        let start = l.sched.sleep_start.load(Ordering::Acquire);
        let slept = if start == TS_NONE {
            0
        } else {
            now.saturating_sub(start)
        };
        if slept >= HZ || l.sched.slptime.load(Ordering::Acquire) >= 1 {
            let boosted = self.tune.boost_pri(l.pri());
            log::trace!("boost lwp {}: pri {} -> {}", l.id(), l.pri(), boosted);
            l.set_pri(boosted);
        }
        l.sched.slpsum.fetch_add(slept, Ordering::Relaxed);
        l.sched.slptime.store(0, Ordering::Release);

        let target = if l.migratable() && !l.flags().intersects(LwpFlags::SYSTEM) {
            self.sched_takecpu(curci, l)
        } else {
            self.cpu(l.cpu_id())
        };
        if target.id() != l.cpu_id() {
            curci.stats.migrations.fetch_add(1, Ordering::Relaxed);
            l.set_cpu_id(target.id());
        }
        // sleep_start cleared only after takecpu used it for the
        // cache-hot decision.
        l.sched.sleep_start.store(TS_NONE, Ordering::Release);
        target
    }

    /// Periodic (roughly once per second) per-LWP accounting.
    pub fn sched_pstats_hook(&self, l: &LwpRef) {
        match l.state() {
            LwpState::Sleeping => {
                l.sched.slptime.fetch_add(1, Ordering::AcqRel);
                l.sched.slpsum.fetch_add(HZ, Ordering::Relaxed);
            }
            _ => {
                // Decay the sums so old behavior stops dominating the
                // batch/interactive estimate.
                let r = l.sched.runsum.load(Ordering::Relaxed);
                l.sched.runsum.store(r >> 1, Ordering::Relaxed);
                let s = l.sched.slpsum.load(Ordering::Relaxed);
                l.sched.slpsum.store(s >> 1, Ordering::Relaxed);
            }
        }
    }
}
