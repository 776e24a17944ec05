// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scheduler configuration, grouped the way the tunables are consumed:
//! topology sizing, timeline (slice) policy, load balancer tuning and the
//! scheduler feature toggles. All values are fixed at init.

use crate::SchedMode;

pub const NSEC_PER_USEC: u64 = 1000;
pub const NSEC_PER_MSEC: u64 = 1000 * NSEC_PER_USEC;

pub const LOAD_BALANCE_SLACK: u64 = 20;

#[derive(Clone, Debug)]
pub struct TopoConfig {
    pub nr_cpus: usize,
    pub nr_llcs: usize,
    pub nr_nodes: usize,
    pub smt_enabled: bool,
    pub has_little_cores: bool,
}

#[derive(Clone, Debug)]
pub struct TimelineConfig {
    pub min_slice_us: u64,
    pub max_exec_ns: u64,
    pub autoslice: bool,
    pub deadline: bool,
    /// Wakeup timer period; 0 means track the interactive slice.
    pub wakeup_timer_ns: u64,
    pub deferred_wakeups: bool,
}

#[derive(Clone, Debug)]
pub struct LbConfig {
    pub backoff_ns: u64,
    pub dispatch_lb_busy: u64,
    pub min_llc_runs_pick2: u64,
    pub min_nr_queued_pick2: u64,
    pub slack_factor: u64,
    pub wakeup_lb_busy: u64,

    pub dispatch_lb_interactive: bool,
    pub dispatch_pick2_disable: bool,
    pub eager_load_balance: bool,
    pub max_dsq_pick2: bool,
    pub wakeup_llc_migrations: bool,
    pub single_llc_mode: bool,
}

#[derive(Clone, Debug)]
pub struct DuoqConfig {
    pub nr_dsqs_per_llc: usize,
    pub init_dsq_index: usize,
    pub dsq_shift: u64,
    pub interactive_ratio: u32,
    pub saturated_percent: u32,
    pub sched_mode: SchedMode,
    pub llc_shards: usize,

    pub atq_enabled: bool,
    pub cpu_priority: bool,
    pub task_slice: bool,
    pub freq_control: bool,
    pub interactive_sticky: bool,
    pub keep_running_enabled: bool,
    pub kthreads_local: bool,
    pub arena_idle_tracking: bool,
}

/// A full init-time config. `SchedulerOpts::to_config` is the only
/// constructor; the option defaults live on the CLI surface.
#[derive(Clone, Debug)]
pub struct Config {
    pub topo: TopoConfig,
    pub timeline: TimelineConfig,
    pub lb: LbConfig,
    pub duoq: DuoqConfig,
    /// Initial per-class slice table, increasing.
    pub dsq_time_slices: Vec<u64>,
}
