//! Per-CPU deferred-execution (softint) dispatch and an MP-aware,
//! bitmap-indexed run-queue scheduler.
//!
//! The crate models a symmetric-multiprocessing kernel core: every CPU owns
//! a [`cpu::Cpu`] context holding its run queue and its four software
//! interrupt levels. All state hangs off a [`System`] handle so that no
//! hidden globals exist and multiple instances can coexist (which is also
//! what makes the core testable on a host).
//!
//! The machine-dependent pieces are reduced to three seams: a tick clock
//! advanced by the embedder ([`clock::Clock`]),
//! a softint trigger hook ([`softint::SoftintTrigger`]), and explicit
//! delivery of cross-CPU requests ([`System::run_ipi_tasks`]).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod clock;
pub mod cpu;
pub mod interrupt;
pub mod lwp;
pub mod once;
pub mod sched;
pub mod softint;
pub mod spinlock;
pub mod tune;

use alloc::boxed::Box;
use core::sync::atomic::AtomicU32;

use crate::{
    cpu::{Cpu, CpuId},
    softint::SoftintRegistry,
    tune::Tune,
};

/// Owner of all per-CPU contexts and the shared registration state.
///
/// Constructed once at bring-up with the number of CPUs; the CPUs never go
/// away while the `System` is alive.
pub struct System {
    cpus: Box<[Cpu]>,
    clock: clock::Clock,
    tune: Tune,
    soft: SoftintRegistry,
    /// CPU designated by the last balance pass as the steal target, or
    /// `NO_WORKER` if none.
    worker_cpu: AtomicU32,
}

pub(crate) const NO_WORKER: u32 = u32::MAX;

impl System {
    /// Bring up a system with `ncpu` CPUs. All CPUs come online immediately
    /// and each gets its four softint dispatch threads.
    pub fn new(ncpu: usize) -> Self {
        assert!(ncpu > 0, "a system needs at least one cpu");
        let cpus = (0..ncpu as u32).map(Cpu::new).collect::<Box<[Cpu]>>();
        let sys = Self {
            cpus,
            clock: clock::Clock::new(),
            tune: Tune::new(ncpu),
            soft: SoftintRegistry::new(ncpu),
            worker_cpu: AtomicU32::new(NO_WORKER),
        };
        sys.softint_init();
        sys
    }

    pub fn ncpu(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, id: CpuId) -> &Cpu {
        &self.cpus[id as usize]
    }

    pub fn cpus(&self) -> impl Iterator<Item = &Cpu> {
        self.cpus.iter()
    }

    pub fn clock(&self) -> &clock::Clock {
        &self.clock
    }

    pub fn tune(&self) -> &Tune {
        &self.tune
    }
}
