//! Interrupt-priority-level and preemption model.
//!
//! There is no interrupt hardware behind this crate; the interrupt-context
//! contracts survive as checkable state instead. Each CPU carries a current
//! IPL and a preemption-disable depth, and the softint entry points assert
//! against them (`softint_schedule` requires preemption disabled; a handler
//! must not leak a raised IPL or a preemption reference).

use crate::cpu::Cpu;

/// Interrupt priority levels, lowest first. The four softint levels sit
/// between normal execution and the scheduler level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum Ipl {
    None = 0,
    SoftClock = 1,
    SoftBio = 2,
    SoftNet = 3,
    SoftSerial = 4,
    Sched = 5,
    High = 6,
}

impl Ipl {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Ipl::None,
            1 => Ipl::SoftClock,
            2 => Ipl::SoftBio,
            3 => Ipl::SoftNet,
            4 => Ipl::SoftSerial,
            5 => Ipl::Sched,
            _ => Ipl::High,
        }
    }
}

/// RAII guard for a raised IPL; restores the previous level on drop.
pub struct SplGuard<'a> {
    cpu: &'a Cpu,
    prev: Ipl,
}

impl<'a> SplGuard<'a> {
    pub(crate) fn raise(cpu: &'a Cpu, ipl: Ipl) -> Self {
        let prev = cpu.current_ipl();
        assert!(ipl >= prev, "splraise would lower the ipl");
        cpu.set_ipl(ipl);
        Self { cpu, prev }
    }
}

impl Drop for SplGuard<'_> {
    fn drop(&mut self) {
        self.cpu.set_ipl(self.prev);
    }
}

/// RAII guard holding preemption disabled on a CPU.
pub struct KPreemptGuard<'a> {
    cpu: &'a Cpu,
}

impl<'a> KPreemptGuard<'a> {
    pub(crate) fn enter(cpu: &'a Cpu) -> Self {
        cpu.preempt_disable();
        Self { cpu }
    }
}

impl Drop for KPreemptGuard<'_> {
    fn drop(&mut self) {
        self.cpu.preempt_enable();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::System;

    #[test]
    fn spl_nests_and_restores() {
        let sys = System::new(1);
        let ci = sys.cpu(0);
        assert_eq!(ci.current_ipl(), Ipl::None);
        {
            let _g = ci.splraise(Ipl::SoftNet);
            assert_eq!(ci.current_ipl(), Ipl::SoftNet);
            {
                let _g2 = ci.splraise(Ipl::High);
                assert_eq!(ci.current_ipl(), Ipl::High);
            }
            assert_eq!(ci.current_ipl(), Ipl::SoftNet);
        }
        assert_eq!(ci.current_ipl(), Ipl::None);
    }

    #[test]
    #[should_panic(expected = "splraise would lower")]
    fn spl_cannot_lower() {
        let sys = System::new(1);
        let ci = sys.cpu(0);
        let _hi = ci.splraise(Ipl::Sched);
        let _lo = ci.splraise(Ipl::SoftClock);
    }

    #[test]
    fn preemption_depth() {
        let sys = System::new(1);
        let ci = sys.cpu(0);
        assert!(!ci.preempt_disabled());
        {
            let _p = ci.kpreempt_disable();
            assert!(ci.preempt_disabled());
            {
                let _p2 = ci.kpreempt_disable();
                assert!(ci.preempt_disabled());
            }
            assert!(ci.preempt_disabled());
        }
        assert!(!ci.preempt_disabled());
    }
}
