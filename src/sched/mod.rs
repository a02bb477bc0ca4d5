//! Priority-tiered, per-CPU run-queue scheduling.
//!
//! The priority space has 128 levels; numerically lower is more important.
//! Levels 0..50 form the real-time band (fixed time-slice), 50..128 the
//! time-sharing band (time-slice interpolated between the `mints`/`maxts`
//! tunables). Each CPU owns one [`rq::RunQueue`]; cross-CPU movement only
//! happens through the migration paths in [`m2`].

pub mod bitmap;
pub mod m2;
pub mod rq;

/// A scheduling priority. Lower values are more important.
pub type Pri = u32;

/// Number of priority levels.
pub const PRI_COUNT: usize = 128;

/// Lowest priority; also the empty-run-queue sentinel for the cached
/// highest-priority value.
pub const PRI_MAX: Pri = PRI_COUNT as Pri - 1;

/// First priority of the time-sharing band. Everything below is real-time.
pub const PRI_TS_FIRST: Pri = 50;

/// "Not a priority" sentinel, used for the `rq_pri` of an unqueued LWP and
/// for the running priority of an idle CPU.
pub const PRI_NONE: Pri = u32::MAX;

/// Priorities of the per-level softint dispatch threads, at the very top of
/// the real-time band. Serial outranks net outranks bio outranks clock.
pub const PRI_SOFTSERIAL: Pri = 0;
pub const PRI_SOFTNET: Pri = 1;
pub const PRI_SOFTBIO: Pri = 2;
pub const PRI_SOFTCLOCK: Pri = 3;

/// Default priority of a nice-0 time-sharing LWP.
pub const PRI_TS_DEFAULT: Pri = PRI_TS_FIRST + NZERO;

/// Offset applied when mapping nice values into the time-sharing band.
pub const NZERO: Pri = 20;

pub const fn pri_is_realtime(pri: Pri) -> bool {
    pri < PRI_TS_FIRST
}
