//! Cross-CPU requests.
//!
//! A CPU never writes a remote CPU's softint queues directly; it enqueues a
//! task on the target and the target runs it locally. Delivery is explicit:
//! the embedder's IPI vector (or a test) calls [`System::run_ipi_tasks`]
//! on the target CPU.

use alloc::{boxed::Box, sync::Arc};
use core::sync::atomic::AtomicU64;

use crate::{
    cpu::{Cpu, CpuId},
    System,
};

pub struct IpiTask {
    pub(crate) outstanding: AtomicU64,
    pub(crate) func: Box<dyn Fn(&System, &Cpu) + Send + Sync>,
}

impl System {
    /// Queue `f` for execution on `target`. If `target` is the sending CPU
    /// the task runs immediately instead of round-tripping through the
    /// queue.
    pub(crate) fn ipi_send(
        &self,
        sender: &Cpu,
        target: CpuId,
        f: Box<dyn Fn(&System, &Cpu) + Send + Sync>,
    ) {
        let target = self.cpu(target);
        if target.id() == sender.id() {
            f(self, target);
            return;
        }
        target.enqueue_ipi_task(Arc::new(IpiTask {
            outstanding: AtomicU64::new(0),
            func: f,
        }));
        self.softint_notify_remote(target);
    }

    /// Run all queued cross-CPU tasks on `cpu`. Called from the target
    /// CPU's interrupt path.
    pub fn run_ipi_tasks(&self, cpu: CpuId) {
        let ci = self.cpu(cpu);
        for task in ci.drain_ipi_tasks() {
            (task.func)(self, ci);
            task.outstanding
                .fetch_sub(1, core::sync::atomic::Ordering::Release);
        }
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}
