// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU, per-LLC, per-node and per-task contexts. CPU and LLC contexts
//! are built once at init and frozen into flat arrays; fields shared across
//! CPUs use relaxed atomics. Task contexts are owned by the host's task
//! local storage and passed back by mutable borrow.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use duoq_arena::Atq;
use duoq_arena::MinHeap;
use duoq_arena::ScxBitmap;
use duoq_arena::SpinLock;

use crate::stats::StatCounters;
use crate::MAX_LLCS;

/// Sentinel for "no pick-2 target latched".
pub const NO_LLC: usize = MAX_LLCS;

#[inline]
pub fn scale_by_weight(weight: u64, value: u64) -> u64 {
    value * weight / 100
}

#[inline]
pub fn scale_by_weight_inverse(weight: u64, value: u64) -> u64 {
    value * 100 / weight.max(1)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskFlags(u32);

impl TaskFlags {
    pub const INTERACTIVE: u32 = 1 << 0;
    pub const WAS_NICE: u32 = 1 << 1;
    pub const ALL_CPUS: u32 = 1 << 2;

    #[inline]
    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    #[inline]
    pub fn clear(&mut self, flag: u32) {
        self.0 &= !flag;
    }

    #[inline]
    pub fn test(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    #[inline]
    pub fn assign(&mut self, flag: u32, on: bool) {
        if on {
            self.set(flag);
        } else {
            self.clear(flag);
        }
    }
}

/// Task scheduling state, seeded at init_task and freed at exit_task.
#[derive(Clone, Debug)]
pub struct TaskCtx {
    pub dsq_id: u64,
    pub slice_ns: u64,
    pub llc_id: usize,
    pub dsq_index: usize,
    pub flags: TaskFlags,
    pub node_id: usize,

    pub last_run_at: u64,
    pub last_run_started: u64,
    /// Runs remaining on the current LLC before pick-2 migration is allowed.
    pub llc_runs: u64,

    pub last_dsq_id: u64,
    pub last_dsq_index: usize,
    /// Enqueue flags captured for the ATQ path.
    pub enq_flags: u64,
}

impl TaskCtx {
    pub fn is_interactive(&self) -> bool {
        self.flags.test(TaskFlags::INTERACTIVE)
    }

    pub fn all_cpus(&self) -> bool {
        self.flags.test(TaskFlags::ALL_CPUS)
    }
}

pub struct CpuCtx {
    pub id: usize,
    pub llc_id: usize,
    pub node_id: usize,
    pub core_id: usize,
    pub smt_sibling: Option<usize>,
    pub is_big: bool,
    /// Relative performance class for the idle CPU priority heap.
    pub perf_priority: u64,

    pub affn_dsq: u64,
    pub llc_dsq: u64,
    pub mig_dsq: u64,
    pub mig_atq: Option<Arc<Atq>>,

    flags: AtomicU32,
    pub dsq_index: AtomicUsize,
    pub slice_ns: AtomicU64,
    pub ran_for: AtomicU64,

    pub local_stats: StatCounters,
}

impl CpuCtx {
    pub const F_INTERACTIVE: u32 = 1 << 0;
    pub const F_NICE_TASK: u32 = 1 << 2;

    #[inline]
    pub fn set_flag(&self, flag: u32, on: bool) {
        if on {
            self.flags.fetch_or(flag, Ordering::Relaxed);
        } else {
            self.flags.fetch_and(!flag, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn test_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Relaxed) & flag != 0
    }
}

pub struct CpuCtxInit {
    pub id: usize,
    pub llc_id: usize,
    pub node_id: usize,
    pub core_id: usize,
    pub smt_sibling: Option<usize>,
    pub is_big: bool,
    pub perf_priority: u64,
    pub affn_dsq: u64,
    pub llc_dsq: u64,
    pub mig_dsq: u64,
    pub mig_atq: Option<Arc<Atq>>,
}

impl From<CpuCtxInit> for CpuCtx {
    fn from(init: CpuCtxInit) -> Self {
        Self {
            id: init.id,
            llc_id: init.llc_id,
            node_id: init.node_id,
            core_id: init.core_id,
            smt_sibling: init.smt_sibling,
            is_big: init.is_big,
            perf_priority: init.perf_priority,
            affn_dsq: init.affn_dsq,
            llc_dsq: init.llc_dsq,
            mig_dsq: init.mig_dsq,
            mig_atq: init.mig_atq,
            flags: AtomicU32::new(0),
            dsq_index: AtomicUsize::new(0),
            slice_ns: AtomicU64::new(1),
            ran_for: AtomicU64::new(0),
            local_stats: StatCounters::new(),
        }
    }
}

pub struct LlcCtx {
    pub id: usize,
    pub node_id: usize,
    pub index: usize,
    pub nr_cpus: usize,
    pub dsq: u64,
    pub mig_dsq: u64,
    pub nr_shards: usize,
    pub shard_dsqs: Vec<u64>,

    pub vtime: AtomicU64,
    pub load: AtomicU64,
    pub affn_load: AtomicU64,
    pub intr_load: AtomicU64,
    pub dsq_load: Vec<AtomicU64>,
    state_flags: AtomicU32,

    /// Pick-2 target latched by the load balance timer, NO_LLC when clear.
    pub lb_llc_id: AtomicUsize,
    pub last_period_ns: AtomicU64,

    pub cpumask: Arc<ScxBitmap>,
    pub big_cpumask: Arc<ScxBitmap>,
    pub little_cpumask: Arc<ScxBitmap>,
    pub node_cpumask: Arc<ScxBitmap>,
    pub tmp_cpumask: Arc<ScxBitmap>,
    pub idle_cpumask: Option<Arc<ScxBitmap>>,
    pub idle_smtmask: Option<Arc<ScxBitmap>>,

    pub idle_cpu_heap: Option<SpinLock<MinHeap>>,
    pub mig_atq: Option<Arc<Atq>>,
}

impl LlcCtx {
    const F_SATURATED: u32 = 1 << 0;

    #[inline]
    pub fn is_saturated(&self) -> bool {
        self.state_flags.load(Ordering::Relaxed) & Self::F_SATURATED != 0
    }

    #[inline]
    pub fn set_saturated(&self, on: bool) {
        if on {
            self.state_flags.fetch_or(Self::F_SATURATED, Ordering::Relaxed);
        } else {
            self.state_flags.fetch_and(!Self::F_SATURATED, Ordering::Relaxed);
        }
    }

    /// Consume the latched pick-2 hint, if any.
    pub fn take_lb_hint(&self) -> Option<usize> {
        let hint = self.lb_llc_id.swap(NO_LLC, Ordering::Relaxed);
        (hint != NO_LLC).then_some(hint)
    }
}

impl LlcCtx {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        node_id: usize,
        index: usize,
        nr_cpus: usize,
        dsq: u64,
        mig_dsq: u64,
        nr_shards: usize,
        shard_dsqs: Vec<u64>,
        nr_dsqs: usize,
        cpumask: Arc<ScxBitmap>,
        big_cpumask: Arc<ScxBitmap>,
        little_cpumask: Arc<ScxBitmap>,
        node_cpumask: Arc<ScxBitmap>,
        tmp_cpumask: Arc<ScxBitmap>,
        idle_cpumask: Option<Arc<ScxBitmap>>,
        idle_smtmask: Option<Arc<ScxBitmap>>,
        idle_cpu_heap: Option<SpinLock<MinHeap>>,
        mig_atq: Option<Arc<Atq>>,
    ) -> Self {
        Self {
            id,
            node_id,
            index,
            nr_cpus,
            dsq,
            mig_dsq,
            nr_shards,
            shard_dsqs,
            vtime: AtomicU64::new(0),
            load: AtomicU64::new(0),
            affn_load: AtomicU64::new(0),
            intr_load: AtomicU64::new(0),
            dsq_load: (0..nr_dsqs).map(|_| AtomicU64::new(0)).collect(),
            state_flags: AtomicU32::new(0),
            lb_llc_id: AtomicUsize::new(NO_LLC),
            last_period_ns: AtomicU64::new(0),
            cpumask,
            big_cpumask,
            little_cpumask,
            node_cpumask,
            tmp_cpumask,
            idle_cpumask,
            idle_smtmask,
            idle_cpu_heap,
            mig_atq,
        }
    }
}

pub struct NodeCtx {
    pub id: usize,
    pub cpumask: Arc<ScxBitmap>,
    pub big_cpumask: Arc<ScxBitmap>,
}

// Enqueue promise side effect flags.
pub const PROMISE_F_KICK_IDLE: u32 = 1 << 0;
pub const PROMISE_F_HAS_CLEARED_IDLE: u32 = 1 << 1;

/// Terminal state of a single enqueue invocation. Splitting the decision
/// from its completion lets an embedder defer the insertion.
#[derive(Clone, Debug, Default)]
pub enum EnqueueKind {
    #[default]
    Failed,
    Complete,
    Fifo {
        dsq_id: u64,
        slice_ns: u64,
        enq_flags: u64,
    },
    Vtime {
        dsq_id: u64,
        slice_ns: u64,
        vtime: u64,
        enq_flags: u64,
    },
    AtqFifo {
        atq: Arc<Atq>,
        fallback_dsq: u64,
        slice_ns: u64,
        enq_flags: u64,
    },
    AtqVtime {
        atq: Arc<Atq>,
        fallback_dsq: u64,
        slice_ns: u64,
        vtime: u64,
        enq_flags: u64,
    },
}

#[derive(Clone, Debug, Default)]
pub struct EnqueuePromise {
    pub kind: EnqueueKind,
    pub cpu: usize,
    pub flags: u32,
}

impl EnqueuePromise {
    #[inline]
    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    #[inline]
    pub fn clear_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    #[inline]
    pub fn test_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    #[inline]
    pub fn assign_flag(&mut self, flag: u32, on: bool) {
        if on {
            self.set_flag(flag);
        } else {
            self.clear_flag(flag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_flags() {
        let mut flags = TaskFlags::default();
        flags.set(TaskFlags::INTERACTIVE);
        flags.set(TaskFlags::ALL_CPUS);
        assert!(flags.test(TaskFlags::INTERACTIVE));
        assert!(!flags.test(TaskFlags::WAS_NICE));
        flags.clear(TaskFlags::INTERACTIVE);
        assert!(!flags.test(TaskFlags::INTERACTIVE));
        assert!(flags.test(TaskFlags::ALL_CPUS));
        flags.assign(TaskFlags::WAS_NICE, true);
        assert!(flags.test(TaskFlags::WAS_NICE));
    }

    #[test]
    fn test_weight_scaling() {
        assert_eq!(scale_by_weight(100, 1000), 1000);
        assert_eq!(scale_by_weight(50, 1000), 500);
        assert_eq!(scale_by_weight_inverse(50, 1000), 2000);
        // Integer truncation is part of the contract.
        assert_eq!(scale_by_weight(33, 100), 33);
        assert_eq!(scale_by_weight_inverse(33, 100), 303);
    }
}
