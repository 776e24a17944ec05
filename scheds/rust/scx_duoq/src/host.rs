// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The contract with the scheduler extension host. The scheduler never
//! touches kernel state directly; everything it needs from the host runtime
//! is expressed through the [`Host`] trait, and everything the host knows
//! about a task is passed in as a [`Task`] view. Marshalling between these
//! portable types and the host's own representations is the embedder's
//! problem.

use anyhow::Result;

use duoq_arena::Cpumask;

// Wake flags.
pub const WAKE_FORK: u64 = 0x02;
pub const WAKE_TTWU: u64 = 0x04;
pub const WAKE_SYNC: u64 = 0x08;

// Enqueue flags.
pub const ENQ_WAKEUP: u64 = 1;
pub const ENQ_HEAD: u64 = 1 << 4;
/// Set by the host when select_cpu ran for this wakeup.
pub const ENQ_CPU_SELECTED: u64 = 1 << 10;
pub const ENQ_PREEMPT: u64 = 1 << 32;

// Kick flags.
pub const KICK_IDLE: u64 = 1;

/// Maximum relative performance level for `cpuperf_set`.
pub const CPUPERF_ONE: u32 = 1024;

// Builtin DSQ ids owned by the host.
pub const DSQ_FLAG_BUILTIN: u64 = 1 << 63;
pub const DSQ_INVALID: u64 = DSQ_FLAG_BUILTIN;
pub const DSQ_LOCAL: u64 = DSQ_FLAG_BUILTIN | 2;
pub const DSQ_LOCAL_ON: u64 = DSQ_FLAG_BUILTIN | (1 << 62);

/// The local DSQ of a specific CPU.
#[inline]
pub fn local_on(cpu: usize) -> u64 {
    DSQ_LOCAL_ON | cpu as u64
}

/// Timers the scheduler registers at init and the host fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// Pick-2 load balancing and auto-slice, default every 250ms.
    LoadBalance,
    /// Deferred wakeup kicks and stats aggregation, default every min slice.
    Wakeup,
}

/// Head of a DSQ as seen by `dsq_peek`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueuedTask {
    pub pid: i32,
    pub vtime: u64,
}

/// The task currently executing the wakeup, for WAKE_SYNC placement.
#[derive(Clone, Copy, Debug)]
pub struct WakerRef {
    pub cpu: usize,
    pub llc_id: usize,
}

/// Host owned view of a schedulable task. The host materializes one per
/// callback; `dsq_vtime` and `slice_ns` writes are pushed back to the task.
#[derive(Clone, Debug)]
pub struct Task {
    pub pid: i32,
    /// CPU the task last ran on (or was assigned by select_cpu).
    pub cpu: usize,
    /// Scheduling weight, 100 is nominal.
    pub weight: u64,
    pub is_kthread: bool,
    pub nr_cpus_allowed: usize,
    pub cpus_allowed: Cpumask,
    pub dsq_vtime: u64,
    pub slice_ns: u64,
    /// Still queued for execution (keep_running must refuse it).
    pub queued: bool,
}

/// Outbound primitives provided by the host runtime. All operations are
/// non-blocking; DSQ membership is host synchronized.
pub trait Host: Send + Sync {
    /// Monotone nanoseconds.
    fn now(&self) -> u64;

    fn prandom_u32(&self) -> u32;

    fn nr_cpu_ids(&self) -> usize;

    fn dsq_create(&self, dsq_id: u64, node_id: usize) -> Result<()>;

    fn dsq_insert(&self, pid: i32, dsq_id: u64, slice_ns: u64, enq_flags: u64);

    fn dsq_insert_vtime(&self, pid: i32, dsq_id: u64, slice_ns: u64, vtime: u64, enq_flags: u64);

    /// Move the head of `dsq_id` to `cpu`'s local DSQ. Returns false when
    /// the queue was empty.
    fn dsq_move_to_local(&self, cpu: usize, dsq_id: u64) -> bool;

    fn dsq_peek(&self, dsq_id: u64) -> Option<QueuedTask>;

    fn dsq_nr_queued(&self, dsq_id: u64) -> u64;

    /// Atomically claim an idle CPU. Returns true when the CPU was idle and
    /// this caller cleared it.
    fn test_and_clear_cpu_idle(&self, cpu: usize) -> bool;

    /// Snapshot of the host's idle CPU mask.
    fn idle_cpumask(&self) -> Cpumask;

    /// Snapshot of the host's fully-idle SMT core mask.
    fn idle_smtmask(&self) -> Cpumask;

    fn kick_cpu(&self, cpu: usize, flags: u64);

    fn cpuperf_set(&self, cpu: usize, perf: u32);

    /// Arm `timer` to fire once after `delay_ns`. The host invokes
    /// `Scheduler::timer_expired`, which returns the next delay.
    fn timer_arm(&self, timer: TimerKind, delay_ns: u64) -> Result<()>;

    /// Re-enqueue every task sitting on `cpu`'s local DSQ (the host lost
    /// the CPU).
    fn reenqueue_local(&self, cpu: usize);

    /// Report an unrecoverable logic violation. The host ejects the
    /// scheduler.
    fn report_error(&self, msg: &str);
}
