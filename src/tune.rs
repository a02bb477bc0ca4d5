//! Runtime-adjustable scheduler parameters and the precomputed
//! priority -> time-slice / wakeup-boost tables.
//!
//! The tables are arrays of atomics so the hot paths read them without a
//! lock; mutation happens rarely, under a sweep of every CPU's run-queue
//! lock so a reschedule never observes a half-updated table.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::{
    clock::mstohz,
    sched::{Pri, PRI_COUNT, PRI_TS_FIRST},
    System,
};

/// Fixed real-time band time-slice, milliseconds.
pub const RT_TS_MS: u64 = 100;

/// Number of time-sharing priority levels.
const TS_LEVELS: u64 = PRI_COUNT as u64 - PRI_TS_FIRST as u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TuneError {
    /// The requested value violates a bound or a cross-parameter
    /// constraint.
    Invalid,
}

impl core::fmt::Display for TuneError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TuneError::Invalid => write!(f, "invalid tunable value"),
        }
    }
}

pub struct Tune {
    /// Time-sharing slice bounds, milliseconds. Constraint: mints < maxts.
    mints_ms: AtomicU32,
    maxts_ms: AtomicU32,
    /// Cache-affinity window, ticks.
    cacheht_time: AtomicU32,
    /// Balancing cadence, ticks.
    balance_period: AtomicU32,
    /// Migratable-thread threshold for work stealing.
    min_catch: AtomicU32,
    /// Priority -> time-slice, ticks.
    ts_map: [AtomicU32; PRI_COUNT],
    /// Priority -> boosted priority applied on wakeup after a long sleep.
    high_pri: [AtomicU32; PRI_COUNT],
}

const DEF_MINTS_MS: u32 = 50;
const DEF_MAXTS_MS: u32 = 150;
const DEF_CACHEHT_MS: u64 = 20;
const DEF_BALANCE_MS: u64 = 300;

impl Tune {
    pub(crate) fn new(ncpu: usize) -> Self {
        const Z: AtomicU32 = AtomicU32::new(0);
        let min_catch = (usize::BITS - 1 - ncpu.leading_zeros()).clamp(1, 4);
        let tune = Self {
            mints_ms: AtomicU32::new(DEF_MINTS_MS),
            maxts_ms: AtomicU32::new(DEF_MAXTS_MS),
            cacheht_time: AtomicU32::new(mstohz(DEF_CACHEHT_MS) as u32),
            balance_period: AtomicU32::new(mstohz(DEF_BALANCE_MS) as u32),
            min_catch: AtomicU32::new(min_catch),
            ts_map: [Z; PRI_COUNT],
            high_pri: [Z; PRI_COUNT],
        };
        tune.precalc();
        tune
    }

    /// Recompute both tables from the current slice bounds.
    fn precalc(&self) {
        let mints = self.mints_ms.load(Ordering::Acquire) as u64;
        let maxts = self.maxts_ms.load(Ordering::Acquire) as u64;
        for p in 0..PRI_COUNT as Pri {
            let (ts_ms, boost) = if p < PRI_TS_FIRST {
                (RT_TS_MS, p)
            } else {
                let step = p as u64 - PRI_TS_FIRST as u64;
                let ts = mints + step * (maxts - mints) / (TS_LEVELS - 1);
                (ts, PRI_TS_FIRST + (p - PRI_TS_FIRST) / 2)
            };
            self.ts_map[p as usize].store(mstohz(ts_ms) as u32, Ordering::Release);
            self.high_pri[p as usize].store(boost, Ordering::Release);
        }
    }

    /// Time-slice for priority `pri`, ticks.
    pub fn timeslice(&self, pri: Pri) -> u32 {
        self.ts_map[pri as usize].load(Ordering::Acquire)
    }

    /// Wakeup-boost target for priority `pri`.
    pub fn boost_pri(&self, pri: Pri) -> Pri {
        self.high_pri[pri as usize].load(Ordering::Acquire)
    }

    pub fn mints_ms(&self) -> u32 {
        self.mints_ms.load(Ordering::Acquire)
    }

    pub fn maxts_ms(&self) -> u32 {
        self.maxts_ms.load(Ordering::Acquire)
    }

    pub fn cacheht_time(&self) -> u32 {
        self.cacheht_time.load(Ordering::Acquire)
    }

    pub fn balance_period(&self) -> u32 {
        self.balance_period.load(Ordering::Acquire)
    }

    pub fn min_catch(&self) -> u32 {
        self.min_catch.load(Ordering::Acquire)
    }
}

impl System {
    /// Hold every CPU's run-queue lock, in CPU-index order, while `f`
    /// mutates shared scheduling parameters.
    fn with_all_rq_locked(&self, f: impl FnOnce()) {
        let guards: alloc::vec::Vec<_> = self.cpus().map(|ci| ci.rq.lock()).collect();
        f();
        drop(guards);
    }

    /// Set the upper time-sharing slice bound, milliseconds.
    pub fn set_maxts(&self, ms: u32) -> Result<(), TuneError> {
        if ms <= self.tune.mints_ms() || ms > 60_000 {
            return Err(TuneError::Invalid);
        }
        self.with_all_rq_locked(|| {
            self.tune.maxts_ms.store(ms, Ordering::Release);
            self.tune.precalc();
        });
        Ok(())
    }

    /// Set the lower time-sharing slice bound, milliseconds.
    pub fn set_mints(&self, ms: u32) -> Result<(), TuneError> {
        if ms < 1 || ms >= self.tune.maxts_ms() {
            return Err(TuneError::Invalid);
        }
        self.with_all_rq_locked(|| {
            self.tune.mints_ms.store(ms, Ordering::Release);
            self.tune.precalc();
        });
        Ok(())
    }

    /// Set the cache-affinity window, milliseconds.
    pub fn set_cacheht_time(&self, ms: u32) -> Result<(), TuneError> {
        if ms > 60_000 {
            return Err(TuneError::Invalid);
        }
        self.tune
            .cacheht_time
            .store(mstohz(ms as u64) as u32, Ordering::Release);
        Ok(())
    }

    /// Set the balancing cadence, milliseconds.
    pub fn set_balance_period(&self, ms: u32) -> Result<(), TuneError> {
        if ms < 10 || ms > 60_000 {
            return Err(TuneError::Invalid);
        }
        self.tune
            .balance_period
            .store(mstohz(ms as u64) as u32, Ordering::Release);
        Ok(())
    }

    /// Set the work-stealing threshold.
    pub fn set_min_catch(&self, n: u32) -> Result<(), TuneError> {
        if !(1..=4).contains(&n) {
            return Err(TuneError::Invalid);
        }
        self.tune.min_catch.store(n, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        clock::mstohz,
        sched::{PRI_MAX, PRI_TS_FIRST},
    };

    #[test]
    fn ts_map_monotonic_and_bounded() {
        let sys = System::new(1);
        let t = sys.tune();
        let min = mstohz(t.mints_ms() as u64) as u32;
        let max = mstohz(t.maxts_ms() as u64) as u32;
        let mut prev = 0;
        for p in PRI_TS_FIRST..=PRI_MAX {
            let ts = t.timeslice(p);
            assert!(ts >= min && ts <= max, "slice {ts} out of [{min}, {max}]");
            assert!(ts >= prev, "ts_map not monotonic at {p}");
            prev = ts;
        }
        assert_eq!(t.timeslice(PRI_TS_FIRST), min);
        assert_eq!(t.timeslice(PRI_MAX), max);
    }

    #[test]
    fn rt_band_fixed_slice() {
        let sys = System::new(1);
        for p in 0..PRI_TS_FIRST {
            assert_eq!(sys.tune().timeslice(p), mstohz(RT_TS_MS) as u32);
        }
    }

    #[test]
    fn boost_table_targets_rt_adjacent() {
        let sys = System::new(1);
        let t = sys.tune();
        for p in 0..PRI_TS_FIRST {
            assert_eq!(t.boost_pri(p), p);
        }
        for p in PRI_TS_FIRST..=PRI_MAX {
            let b = t.boost_pri(p);
            assert!(b >= PRI_TS_FIRST, "boost must stay in the ts band");
            assert!(b <= p, "boost never lowers importance");
        }
        assert_eq!(t.boost_pri(PRI_TS_FIRST), PRI_TS_FIRST);
    }

    #[test]
    fn crossed_bounds_rejected_without_mutation() {
        let sys = System::new(1);
        assert_eq!(sys.tune().maxts_ms(), 150);
        assert_eq!(sys.set_maxts(100), Ok(()));
        let before = (sys.tune().mints_ms(), sys.tune().maxts_ms());
        assert_eq!(sys.set_mints(200), Err(TuneError::Invalid));
        assert_eq!((sys.tune().mints_ms(), sys.tune().maxts_ms()), before);
        assert_eq!(sys.set_maxts(40), Err(TuneError::Invalid));
        assert_eq!((sys.tune().mints_ms(), sys.tune().maxts_ms()), before);
    }

    #[test]
    fn min_catch_scales_with_ncpu() {
        assert_eq!(System::new(1).tune().min_catch(), 1);
        assert_eq!(System::new(2).tune().min_catch(), 1);
        assert_eq!(System::new(4).tune().min_catch(), 2);
        assert_eq!(System::new(64).tune().min_catch(), 4);
        let sys = System::new(2);
        assert_eq!(sys.set_min_catch(0), Err(TuneError::Invalid));
        assert_eq!(sys.set_min_catch(3), Ok(()));
        assert_eq!(sys.tune().min_catch(), 3);
    }
}
