// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! scx_duoq: a multi-queue, topology aware scheduler core where load
//! balancing is done using a pick two algorithm. The host runtime (kernel
//! shim, or the bundled simulator) drives the callback surface in
//! [`sched::Scheduler`]; everything the scheduler needs back from the host
//! goes through [`host::Host`].

pub mod balance;
pub mod config;
pub mod dsq;
pub mod host;
pub mod pick;
pub mod sched;
pub mod sim;
pub mod stats;
pub mod timers;
pub mod types;

pub use config::Config;
pub use host::Host;
pub use host::Task;
pub use sched::Scheduler;

use anyhow::bail;
use anyhow::Result;
use clap::Parser;
use clap::ValueEnum;

use duoq_arena::Topology;

pub const MAX_CPUS: usize = 512;
pub const MAX_NUMA_NODES: usize = 64;
pub const MAX_LLCS: usize = 64;
pub const MAX_DSQS_PER_LLC: usize = 8;
pub const MAX_LLC_SHARDS: usize = 8;

lazy_static::lazy_static! {
    pub static ref TOPO: Topology = Topology::new().unwrap();
}

fn get_default_llc_runs() -> u64 {
    let n_llcs = TOPO.all_llcs.len() as f64;
    let llc_runs = n_llcs.log2();
    llc_runs as u64
}

fn get_default_single_llc() -> bool {
    TOPO.all_llcs.len() == 1
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum SchedMode {
    /// Default mode for most workloads.
    Default,
    /// Performance mode prioritizes scheduling on Big cores.
    Performance,
    /// Efficiency mode prioritizes scheduling on little cores.
    Efficiency,
}

#[derive(Debug, Parser)]
pub struct SchedulerOpts {
    /// Disables per-cpu kthreads directly dispatched into local dsqs.
    #[clap(short = 'k', long, action = clap::ArgAction::SetTrue)]
    pub disable_kthreads_local: bool,

    /// Enables autoslice tuning
    #[clap(short = 'a', long, action = clap::ArgAction::SetTrue)]
    pub autoslice: bool,

    /// Ratio of interactive tasks for autoslice tuning, percent value from 1-99.
    #[clap(short = 'r', long, default_value = "10")]
    pub interactive_ratio: usize,

    /// Enables deadline scheduling
    #[clap(long, action = clap::ArgAction::SetTrue)]
    pub deadline: bool,

    /// ***DEPRECATED*** Disables eager pick2 load balancing.
    #[clap(short = 'e', long, help="DEPRECATED", action = clap::ArgAction::SetTrue)]
    pub eager_load_balance: bool,

    /// Enables CPU frequency control.
    #[clap(short = 'f', long, action = clap::ArgAction::SetTrue)]
    pub freq_control: bool,

    /// Interactive tasks stay sticky to their CPU if no idle CPU is found.
    #[clap(short = 'y', long, action = clap::ArgAction::SetTrue)]
    pub interactive_sticky: bool,

    /// Disables pick2 load balancing on the dispatch path.
    #[clap(short = 'd', long, action = clap::ArgAction::SetTrue)]
    pub dispatch_pick2_disable: bool,

    /// ***DEPRECATED*** Enables pick2 load balancing on the dispatch path when LLC utilization
    /// is under the specified utilization.
    #[clap(long, default_value = "75", value_parser = clap::value_parser!(u64).range(0..100))]
    pub dispatch_lb_busy: u64,

    /// Enables pick2 load balancing on the dispatch path for interactive tasks.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub dispatch_lb_interactive: bool,

    /// Enable tasks to run beyond their timeslice if the CPU is idle.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    pub keep_running: bool,

    /// Use a bounded priority queue (ATQ) for migration eligible tasks.
    #[clap(long, default_value_t = false, action = clap::ArgAction::Set)]
    pub atq_enabled: bool,

    /// Schedule based on preferred core values available on some x86 systems with the appropriate
    /// CPU frequency governor (ex: amd-pstate).
    #[clap(long, default_value_t = false, action = clap::ArgAction::Set)]
    pub cpu_priority: bool,

    /// *DEPRECATED* Minimum load for load balancing on the wakeup path, 0 to disable.
    #[clap(long, default_value = "0", help="DEPRECATED", value_parser = clap::value_parser!(u64).range(0..99))]
    pub wakeup_lb_busy: u64,

    /// Allow LLC migrations on the wakeup path.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    pub wakeup_llc_migrations: bool,

    /// Only pick2 load balance from the max DSQ.
    #[clap(long, default_value="false", action = clap::ArgAction::Set)]
    pub max_dsq_pick2: bool,

    /// Task slice tracking, slices are automatically scaled based on utilization rather than the
    /// predetermined slice index.
    #[clap(long, default_value="false", action = clap::ArgAction::Set)]
    pub task_slice: bool,

    /// Scheduling min slice duration in microseconds.
    #[clap(short = 's', long, default_value = "100")]
    pub min_slice_us: u64,

    /// Scheduler mode
    #[arg(value_enum, long, default_value_t = SchedMode::Default)]
    pub sched_mode: SchedMode,

    /// Slack factor for load balancing, load balancing is not performed if load is within slack
    /// factor percent.
    #[clap(long, default_value = "5", value_parser = clap::value_parser!(u64).range(0..99))]
    pub lb_slack_factor: u64,

    /// Backoff between dispatch pick2 attempts per LLC, in nanoseconds.
    #[clap(long, default_value = "5000000")]
    pub backoff_ns: u64,

    /// Number of runs on the LLC before a task becomes eligible for pick2 migration on the
    /// wakeup path.
    #[clap(short = 'l', long, default_value_t = get_default_llc_runs())]
    pub min_llc_runs_pick2: u64,

    /// Saturated percent is the percent at which the system is considered saturated in terms of
    /// free CPUs.
    #[clap(long, default_value_t = 5)]
    pub saturated_percent: u32,

    /// Manual definition of slice intervals in microseconds for DSQs, must be equal to number of
    /// dumb_queues.
    #[clap(short = 't', long, value_parser = clap::value_parser!(u64), default_values_t = [0;0])]
    pub dsq_time_slices: Vec<u64>,

    /// DSQ scaling shift, each queue min timeslice is shifted by the scaling shift.
    #[clap(short = 'x', long, default_value = "2")]
    pub dsq_shift: u64,

    /// Minimum number of queued tasks to use pick2 balancing, 0 to always enabled.
    #[clap(short = 'm', long, default_value = "10")]
    pub min_nr_queued_pick2: u64,

    /// Number of dumb DSQs.
    #[clap(short = 'q', long, default_value = "3")]
    pub dumb_queues: usize,

    /// Initial DSQ for tasks.
    #[clap(short = 'i', long, default_value = "0")]
    pub init_dsq_index: usize,

    /// Number of LLC DSQ shards, 0 to disable sharding.
    #[clap(long, default_value = "0")]
    pub llc_shards: usize,

    /// Keep a private per LLC copy of the idle CPU masks for wakeup placement.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub arena_idle_tracking: bool,

    /// Single LLC mode, disables cross LLC migration entirely.
    #[clap(long, default_value_t = get_default_single_llc(), action = clap::ArgAction::Set)]
    pub single_llc_mode: bool,

    /// Defer wakeup kicks to the wakeup timer instead of kicking from the enqueue path.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub deferred_wakeups: bool,

    /// Wakeup timer period in microseconds, 0 to track the interactive slice.
    #[clap(long, default_value = "0")]
    pub wakeup_timer_us: u64,
}

pub fn dsq_slice_ns(dsq_index: u64, min_slice_us: u64, dsq_shift: u64) -> u64 {
    if dsq_index == 0 {
        1000 * min_slice_us
    } else {
        1000 * (min_slice_us << (dsq_index as u32) << dsq_shift)
    }
}

impl SchedulerOpts {
    /// Validate the options against a topology and expand them into the
    /// init-time config.
    pub fn to_config(&self, topo: &Topology) -> Result<Config> {
        if self.dumb_queues == 0 || self.dumb_queues > MAX_DSQS_PER_LLC {
            bail!("Invalid number of dumb_queues {}", self.dumb_queues);
        }
        if self.init_dsq_index > self.dumb_queues - 1 {
            bail!("Invalid init_dsq_index {}", self.init_dsq_index);
        }
        if self.llc_shards > MAX_LLC_SHARDS {
            bail!("Invalid number of llc_shards {}", self.llc_shards);
        }
        if topo.nr_cpu_ids > MAX_CPUS {
            bail!("Invalid number of CPUs {}", topo.nr_cpu_ids);
        }
        if topo.nr_llcs() > MAX_LLCS || topo.nr_nodes() > MAX_NUMA_NODES {
            bail!("Invalid topology {} LLCs {} nodes", topo.nr_llcs(), topo.nr_nodes());
        }

        let mut slices = Vec::with_capacity(self.dumb_queues);
        if !self.dsq_time_slices.is_empty() {
            if self.dsq_time_slices.len() != self.dumb_queues {
                bail!(
                    "Invalid number of dsq_time_slices, got {} need {}",
                    self.dsq_time_slices.len(),
                    self.dumb_queues,
                );
            }
            for vals in self.dsq_time_slices.windows(2) {
                if vals[0] >= vals[1] {
                    bail!("DSQ time slices must be in increasing order");
                }
            }
            for (i, slice) in self.dsq_time_slices.iter().enumerate() {
                log::info!("DSQ[{}] slice_ns {}", i, slice * 1000);
                slices.push(slice * 1000);
            }
        } else {
            for i in 0..self.dumb_queues {
                let slice_ns = dsq_slice_ns(i as u64, self.min_slice_us, self.dsq_shift);
                log::info!("DSQ[{}] slice_ns {}", i, slice_ns);
                slices.push(slice_ns);
            }
        }

        if self.autoslice && (self.interactive_ratio == 0 || self.interactive_ratio > 99) {
            bail!(
                "Invalid interactive_ratio {}, must be between 1-99",
                self.interactive_ratio
            );
        }

        Ok(Config {
            topo: config::TopoConfig {
                nr_cpus: topo.nr_cpu_ids,
                nr_llcs: topo.nr_llcs(),
                nr_nodes: topo.nr_nodes(),
                smt_enabled: topo.smt_enabled,
                has_little_cores: topo.has_little_cores(),
            },
            timeline: config::TimelineConfig {
                min_slice_us: self.min_slice_us,
                max_exec_ns: 2 * slices[self.dumb_queues - 1],
                autoslice: self.autoslice,
                deadline: self.deadline,
                wakeup_timer_ns: self.wakeup_timer_us * 1000,
                deferred_wakeups: self.deferred_wakeups,
            },
            lb: config::LbConfig {
                backoff_ns: self.backoff_ns,
                dispatch_lb_busy: self.dispatch_lb_busy,
                min_llc_runs_pick2: self.min_llc_runs_pick2,
                min_nr_queued_pick2: self.min_nr_queued_pick2,
                slack_factor: self.lb_slack_factor,
                wakeup_lb_busy: self.wakeup_lb_busy,
                dispatch_lb_interactive: self.dispatch_lb_interactive,
                dispatch_pick2_disable: self.dispatch_pick2_disable,
                eager_load_balance: !self.eager_load_balance,
                max_dsq_pick2: self.max_dsq_pick2,
                wakeup_llc_migrations: self.wakeup_llc_migrations,
                single_llc_mode: self.single_llc_mode || topo.nr_llcs() == 1,
            },
            duoq: config::DuoqConfig {
                nr_dsqs_per_llc: self.dumb_queues,
                init_dsq_index: self.init_dsq_index,
                dsq_shift: self.dsq_shift,
                interactive_ratio: self.interactive_ratio as u32,
                saturated_percent: self.saturated_percent,
                sched_mode: self.sched_mode.clone(),
                llc_shards: self.llc_shards,
                atq_enabled: self.atq_enabled,
                cpu_priority: self.cpu_priority,
                task_slice: self.task_slice,
                freq_control: self.freq_control,
                interactive_sticky: self.interactive_sticky,
                keep_running_enabled: self.keep_running,
                kthreads_local: !self.disable_kthreads_local,
                arena_idle_tracking: self.arena_idle_tracking,
            },
            dsq_time_slices: slices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duoq_arena::topology::TopoCpu;
    use duoq_arena::CoreType;

    fn test_topo() -> Topology {
        let cpus = (0..4)
            .map(|id| TopoCpu {
                id,
                core_id: id,
                llc_id: id / 2,
                node_id: 0,
                smt_sibling: None,
                core_type: CoreType::Big { turbo: false },
            })
            .collect();
        Topology::from_cpus(cpus).unwrap()
    }

    fn opts(args: &[&str]) -> SchedulerOpts {
        let mut full = vec!["scx_duoq"];
        full.extend_from_slice(args);
        SchedulerOpts::parse_from(full)
    }

    #[test]
    fn test_default_slices() {
        let cfg = opts(&[]).to_config(&test_topo()).unwrap();
        assert_eq!(cfg.dsq_time_slices.len(), 3);
        assert_eq!(cfg.dsq_time_slices[0], 100_000);
        assert_eq!(cfg.dsq_time_slices[1], 100_000 << 1 << 2);
        assert_eq!(cfg.dsq_time_slices[2], 100_000 << 2 << 2);
        assert_eq!(cfg.timeline.max_exec_ns, 2 * cfg.dsq_time_slices[2]);
    }

    #[test]
    fn test_manual_slices_must_increase() {
        assert!(opts(&["-t", "300", "-t", "200", "-t", "400"])
            .to_config(&test_topo())
            .is_err());
        let cfg = opts(&["-t", "100", "-t", "200", "-t", "400"])
            .to_config(&test_topo())
            .unwrap();
        assert_eq!(cfg.dsq_time_slices, vec![100_000, 200_000, 400_000]);
    }

    #[test]
    fn test_init_dsq_index_bounds() {
        assert!(opts(&["-i", "3"]).to_config(&test_topo()).is_err());
        assert!(opts(&["-i", "2"]).to_config(&test_topo()).is_ok());
    }

    #[test]
    fn test_interactive_ratio_bounds() {
        assert!(opts(&["-a", "-r", "0"]).to_config(&test_topo()).is_err());
        assert!(opts(&["-a", "-r", "50"]).to_config(&test_topo()).is_ok());
    }

    #[test]
    fn test_single_llc_forced_on_single_llc_topo() {
        let cpus = (0..2)
            .map(|id| TopoCpu {
                id,
                core_id: id,
                llc_id: 0,
                node_id: 0,
                smt_sibling: None,
                core_type: CoreType::Big { turbo: false },
            })
            .collect();
        let topo = Topology::from_cpus(cpus).unwrap();
        let cfg = opts(&["--single-llc-mode", "false"]).to_config(&topo).unwrap();
        assert!(cfg.lb.single_llc_mode);
    }
}
