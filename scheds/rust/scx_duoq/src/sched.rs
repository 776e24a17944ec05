// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The scheduler core: context construction at init and the callback
//! surface the host drives (select_cpu, enqueue, dispatch, running,
//! stopping, update_idle plus the lifecycle callbacks). Callbacks take
//! `&self`; everything shared across CPUs is a relaxed atomic.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use log::info;
use log::trace;
use log::warn;

use duoq_arena::Atq;
use duoq_arena::AtqEntry;
use duoq_arena::BitmapPool;
use duoq_arena::CoreType;
use duoq_arena::MinHeap;
use duoq_arena::ScxBitmap;
use duoq_arena::SpinLock;
use duoq_arena::Topology;

use crate::config::Config;
use crate::config::DuoqConfig;
use crate::config::LbConfig;
use crate::config::TimelineConfig;
use crate::config::TopoConfig;
use crate::dsq;
use crate::host;
use crate::host::Host;
use crate::host::Task;
use crate::host::TimerKind;
use crate::host::WakerRef;
use crate::host::CPUPERF_ONE;
use crate::host::ENQ_CPU_SELECTED;
use crate::host::ENQ_PREEMPT;
use crate::host::KICK_IDLE;
use crate::stats::Metrics;
use crate::stats::StatCounters;
use crate::stats::StatIdx;
use crate::timers::LB_TIMER_INTERVAL_NS;
use crate::types::scale_by_weight;
use crate::types::scale_by_weight_inverse;
use crate::types::CpuCtx;
use crate::types::CpuCtxInit;
use crate::types::EnqueueKind;
use crate::types::EnqueuePromise;
use crate::types::LlcCtx;
use crate::types::NodeCtx;
use crate::types::TaskCtx;
use crate::types::TaskFlags;
use crate::types::PROMISE_F_HAS_CLEARED_IDLE;
use crate::types::PROMISE_F_KICK_IDLE;
use crate::MAX_DSQS_PER_LLC;
use crate::MAX_LLC_SHARDS;

#[inline]
fn log2_u32(v: u32) -> u32 {
    if v == 0 {
        0
    } else {
        31 - v.leading_zeros()
    }
}

pub struct Scheduler<H: Host> {
    host: Arc<H>,
    cfg: Config,

    cpus: Box<[Option<CpuCtx>]>,
    llcs: Box<[LlcCtx]>,
    nodes: Box<[NodeCtx]>,

    all_cpumask: Arc<ScxBitmap>,
    big_cpumask: Arc<ScxBitmap>,
    /// CPUs owed a deferred idle kick.
    pub(crate) kick_mask: Arc<ScxBitmap>,

    dsq_time_slices: [AtomicU64; MAX_DSQS_PER_LLC],
    pub(crate) min_slice_ns: u64,

    saturated: AtomicBool,
    overloaded: AtomicBool,
    min_llc_runs_pick2: AtomicU64,
    pub(crate) llc_lb_offset: AtomicUsize,

    pub(crate) deferred_wakeups: AtomicBool,
    pub(crate) stats_enabled: AtomicBool,
    pub(crate) timer_ticks: AtomicU64,
    pub(crate) cpu_util: AtomicU64,
    pub(crate) cpu_util_avg: AtomicU64,
    pub(crate) stats: StatCounters,

    exit_info: SpinLock<Option<String>>,
}

impl<H: Host> Scheduler<H> {
    pub fn init(host: Arc<H>, topo: &Topology, cfg: Config) -> Result<Self> {
        let duoq = &cfg.duoq;
        if duoq.nr_dsqs_per_llc == 0 || duoq.nr_dsqs_per_llc > MAX_DSQS_PER_LLC {
            bail!("invalid nr_dsqs_per_llc {}", duoq.nr_dsqs_per_llc);
        }
        if duoq.init_dsq_index >= duoq.nr_dsqs_per_llc {
            bail!("invalid init_dsq_index {}", duoq.init_dsq_index);
        }
        if cfg.dsq_time_slices.len() != duoq.nr_dsqs_per_llc {
            bail!(
                "need {} slice values, got {}",
                duoq.nr_dsqs_per_llc,
                cfg.dsq_time_slices.len()
            );
        }

        let nr_llcs = cfg.topo.nr_llcs;
        let nr_cpus = cfg.topo.nr_cpus;
        let pool = BitmapPool::new(nr_llcs * 7 + cfg.topo.nr_nodes * 2 + 3, nr_cpus);

        let mut llcs: Vec<LlcCtx> = Vec::with_capacity(nr_llcs);
        for llc in topo.all_llcs.values() {
            let dsq_id = dsq::llc_dsq_id(llc.id);
            host.dsq_create(dsq_id, llc.node_id)
                .with_context(|| format!("failed to create DSQ {}", dsq_id))?;

            let mig_dsq = dsq::mig_dsq_id(llc.id);
            host.dsq_create(mig_dsq, llc.node_id)
                .with_context(|| format!("failed to create DSQ {}", mig_dsq))?;

            let nr_shards = if duoq.llc_shards > 1 {
                duoq.llc_shards.min(llc.cpus.len()).min(MAX_LLC_SHARDS)
            } else {
                0
            };
            let mut shard_dsqs = Vec::with_capacity(nr_shards);
            for shard in 0..nr_shards {
                let shard_dsq = dsq::shard_dsq_id(llc.id, shard);
                host.dsq_create(shard_dsq, llc.node_id).with_context(|| {
                    format!("failed to create shard DSQ {} for LLC {}", shard_dsq, llc.id)
                })?;
                shard_dsqs.push(shard_dsq);
            }

            let mig_atq = (duoq.atq_enabled && nr_llcs > 1)
                .then(|| Arc::new(Atq::new(false, nr_cpus)));

            let idle_cpumask = if duoq.arena_idle_tracking {
                Some(pool.alloc()?)
            } else {
                None
            };
            let idle_smtmask = if duoq.arena_idle_tracking && cfg.topo.smt_enabled {
                Some(pool.alloc()?)
            } else {
                None
            };
            let idle_cpu_heap = duoq
                .cpu_priority
                .then(|| SpinLock::new(MinHeap::new(llc.cpus.len())));

            llcs.push(LlcCtx::new(
                llc.id,
                llc.node_id,
                llc.id,
                llc.cpus.len(),
                dsq_id,
                mig_dsq,
                nr_shards,
                shard_dsqs,
                duoq.nr_dsqs_per_llc,
                pool.alloc()?,
                pool.alloc()?,
                pool.alloc()?,
                pool.alloc()?,
                pool.alloc()?,
                idle_cpumask,
                idle_smtmask,
                idle_cpu_heap,
                mig_atq,
            ));
        }

        let mut nodes: Vec<NodeCtx> = Vec::with_capacity(cfg.topo.nr_nodes);
        for node in topo.nodes.values() {
            nodes.push(NodeCtx {
                id: node.id,
                cpumask: pool.alloc()?,
                big_cpumask: pool.alloc()?,
            });
        }

        let all_cpumask = pool.alloc()?;
        let big_cpumask = pool.alloc()?;
        let kick_mask = pool.alloc()?;

        let mut cpus: Vec<Option<CpuCtx>> = (0..nr_cpus).map(|_| None).collect();
        for cpu in topo.all_cpus.values() {
            let llcx = &llcs[cpu.llc_id];
            let nodec = &nodes[cpu.node_id];

            let affn_dsq = dsq::cpu_dsq_id(cpu.id);
            host.dsq_create(affn_dsq, cpu.node_id)
                .with_context(|| format!("failed to create DSQ {}", affn_dsq))?;

            let llc_dsq = if llcx.nr_shards > 1 {
                llcx.shard_dsqs[cpu.core_id % llcx.nr_shards]
            } else {
                llcx.dsq
            };

            let is_big = matches!(cpu.core_type, CoreType::Big { .. });
            let perf_priority = match cpu.core_type {
                CoreType::Big { turbo: true } => 4,
                CoreType::Big { turbo: false } => 2,
                CoreType::Little => 1,
            };

            all_cpumask.set(cpu.id)?;
            nodec.cpumask.set(cpu.id)?;
            llcx.cpumask.set(cpu.id)?;
            if is_big {
                big_cpumask.set(cpu.id)?;
                nodec.big_cpumask.set(cpu.id)?;
                llcx.big_cpumask.set(cpu.id)?;
            } else {
                llcx.little_cpumask.set(cpu.id)?;
            }

            cpus[cpu.id] = Some(CpuCtx::from(CpuCtxInit {
                id: cpu.id,
                llc_id: cpu.llc_id,
                node_id: cpu.node_id,
                core_id: cpu.core_id,
                smt_sibling: cpu.smt_sibling,
                is_big,
                perf_priority,
                affn_dsq,
                llc_dsq,
                mig_dsq: llcx.mig_dsq,
                mig_atq: llcx.mig_atq.clone(),
            }));

            trace!(
                "CFG CPU[{}]NODE[{}]LLC[{}] initialized",
                cpu.id,
                cpu.node_id,
                cpu.llc_id
            );
        }

        for llcx in llcs.iter() {
            llcx.node_cpumask.copy_from(&nodes[llcx.node_id].cpumask);
        }

        let dsq_time_slices: [AtomicU64; MAX_DSQS_PER_LLC] =
            std::array::from_fn(|i| AtomicU64::new(cfg.dsq_time_slices.get(i).copied().unwrap_or(0)));
        let min_slice_ns = 1000 * cfg.timeline.min_slice_us;

        host.timer_arm(TimerKind::LoadBalance, LB_TIMER_INTERVAL_NS)
            .context("failed to arm load balance timer")?;

        let wakeup_period = if cfg.timeline.wakeup_timer_ns > 0 {
            cfg.timeline.wakeup_timer_ns
        } else {
            cfg.dsq_time_slices[0]
        };
        let wakeup_armed = match host.timer_arm(TimerKind::Wakeup, wakeup_period) {
            Ok(()) => true,
            Err(e) => {
                warn!("wakeup timer failed to arm, using synchronous kicks: {}", e);
                false
            }
        };

        info!(
            "duoq init: {} CPUs {} LLCs {} nodes smt {} little {}",
            nr_cpus,
            nr_llcs,
            cfg.topo.nr_nodes,
            cfg.topo.smt_enabled,
            cfg.topo.has_little_cores
        );

        let deferred = cfg.timeline.deferred_wakeups && wakeup_armed;
        Ok(Self {
            host,
            cfg,
            cpus: cpus.into_boxed_slice(),
            llcs: llcs.into_boxed_slice(),
            nodes: nodes.into_boxed_slice(),
            all_cpumask,
            big_cpumask,
            kick_mask,
            dsq_time_slices,
            min_slice_ns,
            saturated: AtomicBool::new(false),
            overloaded: AtomicBool::new(false),
            min_llc_runs_pick2: AtomicU64::new(1),
            llc_lb_offset: AtomicUsize::new(1),
            deferred_wakeups: AtomicBool::new(deferred),
            stats_enabled: AtomicBool::new(true),
            timer_ticks: AtomicU64::new(0),
            cpu_util: AtomicU64::new(0),
            cpu_util_avg: AtomicU64::new(0),
            stats: StatCounters::new(),
            exit_info: SpinLock::new(None),
        })
    }

    pub(crate) fn host(&self) -> &H {
        &self.host
    }

    pub fn topo_cfg(&self) -> &TopoConfig {
        &self.cfg.topo
    }

    pub fn timeline_cfg(&self) -> &TimelineConfig {
        &self.cfg.timeline
    }

    pub fn lb_cfg(&self) -> &LbConfig {
        &self.cfg.lb
    }

    pub fn duoq_cfg(&self) -> &DuoqConfig {
        &self.cfg.duoq
    }

    pub fn cpu_ctx(&self, cpu: usize) -> Option<&CpuCtx> {
        self.cpus.get(cpu).and_then(|c| c.as_ref())
    }

    /// CPUs without topology fall back to the first initialized CPU; init
    /// guarantees at least one.
    pub(crate) fn cpu_ctx_or_first(&self, cpu: usize) -> Option<&CpuCtx> {
        self.cpu_ctx(cpu)
            .or_else(|| self.cpus.iter().flatten().next())
    }

    pub fn llc_ctx(&self, llc_id: usize) -> Option<&LlcCtx> {
        self.llcs.get(llc_id)
    }

    pub(crate) fn cpu_llc_ctx(&self, cpu: usize) -> Option<&LlcCtx> {
        self.cpu_ctx(cpu).and_then(|c| self.llc_ctx(c.llc_id))
    }

    pub fn node_ctx(&self, node_id: usize) -> Option<&NodeCtx> {
        self.nodes.get(node_id)
    }

    pub fn nr_llcs(&self) -> usize {
        self.llcs.len()
    }

    pub(crate) fn all_cpumask(&self) -> &ScxBitmap {
        &self.all_cpumask
    }

    pub fn big_cpumask(&self) -> &ScxBitmap {
        &self.big_cpumask
    }

    pub(crate) fn smt_sibling(&self, cpu: usize) -> Option<usize> {
        self.cpu_ctx(cpu).and_then(|c| c.smt_sibling)
    }

    pub fn is_saturated(&self) -> bool {
        self.saturated.load(Ordering::Relaxed)
    }

    pub fn is_overloaded(&self) -> bool {
        self.overloaded.load(Ordering::Relaxed)
    }

    pub fn min_llc_runs(&self) -> u64 {
        self.min_llc_runs_pick2.load(Ordering::Relaxed)
    }

    pub(crate) fn rand_llc_ctx(&self) -> &LlcCtx {
        let idx = self.host.prandom_u32() as usize % self.llcs.len();
        &self.llcs[idx]
    }

    pub(crate) fn stat_inc(&self, idx: StatIdx, cpu: usize) {
        match self.cpu_ctx(cpu) {
            Some(cpuc) => cpuc.local_stats.inc(idx),
            None => self.stats.inc(idx),
        }
    }

    pub fn dsq_time_slice(&self, dsq_index: usize) -> u64 {
        if dsq_index >= self.cfg.duoq.nr_dsqs_per_llc {
            self.host.report_error("invalid DSQ index");
            return self.min_dsq_time_slice();
        }
        self.dsq_time_slices[dsq_index].load(Ordering::Relaxed)
    }

    pub(crate) fn load_dsq_time_slice(&self, dsq_index: usize) -> u64 {
        self.dsq_time_slices[dsq_index].load(Ordering::Relaxed)
    }

    pub(crate) fn store_dsq_time_slice(&self, dsq_index: usize, slice_ns: u64) {
        self.dsq_time_slices[dsq_index].store(slice_ns, Ordering::Relaxed);
    }

    pub fn max_dsq_time_slice(&self) -> u64 {
        self.load_dsq_time_slice(self.cfg.duoq.nr_dsqs_per_llc - 1)
    }

    pub fn min_dsq_time_slice(&self) -> u64 {
        self.load_dsq_time_slice(0)
    }

    pub(crate) fn clamp_slice(&self, slice_ns: u64) -> u64 {
        slice_ns
            .max(self.min_dsq_time_slice())
            .min(self.max_dsq_time_slice())
    }

    fn task_slice_ns(&self, task: &Task, slice_ns: u64) -> u64 {
        self.clamp_slice(scale_by_weight(task.weight, slice_ns))
    }

    fn task_dsq_slice_ns(&self, task: &Task, dsq_index: usize) -> u64 {
        self.task_slice_ns(task, self.dsq_time_slice(dsq_index))
    }

    pub(crate) fn refresh_llc_runs(&self, taskc: &mut TaskCtx) {
        taskc.llc_runs = self.min_llc_runs_pick2.load(Ordering::Relaxed);
    }

    /// Only the shortest duration DSQ is considered interactive.
    pub fn is_interactive(&self, taskc: &TaskCtx) -> bool {
        self.cfg.duoq.nr_dsqs_per_llc > 1 && taskc.dsq_index == 0
    }

    pub(crate) fn can_migrate(&self, taskc: &TaskCtx, llcx: &LlcCtx) -> bool {
        let lb = &self.cfg.lb;
        if lb.single_llc_mode {
            return false;
        }

        if self.cfg.topo.nr_llcs < 2
            || !taskc.all_cpus()
            || (!lb.dispatch_lb_interactive && taskc.is_interactive())
        {
            return false;
        }

        if lb.max_dsq_pick2 && taskc.dsq_index != self.cfg.duoq.nr_dsqs_per_llc - 1 {
            return false;
        }

        if taskc.llc_runs > 0 {
            return false;
        }

        if self.is_saturated() || self.is_overloaded() {
            return true;
        }

        llcx.is_saturated()
    }

    pub(crate) fn llc_nr_queued(&self, llcx: &LlcCtx) -> u64 {
        let mut nr_queued = self.host.dsq_nr_queued(llcx.dsq);
        if self.cfg.topo.nr_llcs > 1 {
            if self.cfg.duoq.atq_enabled {
                if let Some(atq) = &llcx.mig_atq {
                    nr_queued += atq.nr_queued() as u64;
                }
            } else {
                nr_queued += self.host.dsq_nr_queued(llcx.mig_dsq);
            }
        }
        nr_queued
    }

    /// Clamp the task vtime within the LLC: at most one weight scaled max
    /// slice behind the cursor, reset to the cursor on LLC migration.
    fn update_vtime(&self, task: &mut Task, cpu_llc_id: usize, taskc: &TaskCtx, llcx: &LlcCtx) {
        if taskc.llc_id == cpu_llc_id {
            let vtime = llcx.vtime.load(Ordering::Relaxed);
            if task.dsq_vtime >= vtime {
                return;
            }
            let scaled_max = scale_by_weight(task.weight, self.max_dsq_time_slice());
            if task.dsq_vtime < vtime.saturating_sub(scaled_max) {
                task.dsq_vtime = vtime - scaled_max;
            }
            return;
        }

        task.dsq_vtime = llcx.vtime.load(Ordering::Relaxed);
    }

    /// Congestion scaled slice: fewer idle CPUs and more queued tasks mean
    /// a shorter slice.
    fn set_deadline_slice(&self, task: &Task, taskc: &mut TaskCtx, llcx: &LlcCtx) {
        let max_ns = scale_by_weight(task.weight, self.max_dsq_time_slice());
        let nr_queued = self.llc_nr_queued(llcx);
        let nr_idle = (self.host.idle_cpumask().weight() as u64).max(1);

        taskc.slice_ns = if nr_queued > nr_idle {
            (max_ns * nr_idle) / nr_queued
        } else {
            max_ns
        };
        taskc.slice_ns = self.clamp_slice(taskc.slice_ns);
    }

    fn keep_running(&self, cpuc: &CpuCtx, llcx: &LlcCtx, task: &mut Task) -> bool {
        // Only tasks outside the least interactive DSQ can keep running.
        if !self.cfg.duoq.keep_running_enabled
            || cpuc.dsq_index.load(Ordering::Relaxed) == self.cfg.duoq.nr_dsqs_per_llc - 1
            || task.queued
            || cpuc.ran_for.load(Ordering::Relaxed) >= self.cfg.timeline.max_exec_ns
        {
            return false;
        }

        if self.llc_nr_queued(llcx) >= llcx.nr_cpus as u64 {
            return false;
        }

        let slice_ns = self.task_slice_ns(task, cpuc.slice_ns.load(Ordering::Relaxed));
        cpuc.ran_for.fetch_add(slice_ns, Ordering::Relaxed);
        task.slice_ns = slice_ns;
        self.stat_inc(StatIdx::Keep, cpuc.id);
        true
    }

    pub fn select_cpu(
        &self,
        task: &mut Task,
        taskc: &mut TaskCtx,
        prev_cpu: usize,
        wake_flags: u64,
        waker: Option<WakerRef>,
    ) -> usize {
        let result = if !taskc.all_cpus() {
            self.pick_idle_affinitized_cpu(task, taskc, prev_cpu)
        } else {
            self.pick_idle_cpu(task, taskc, prev_cpu, wake_flags, waker)
        };

        if result.claimed {
            self.stat_inc(StatIdx::Idle, result.cpu);
            self.host
                .dsq_insert(task.pid, host::local_on(result.cpu), taskc.slice_ns, 0);
        }
        trace!(
            "SELECT [{}] {}->{} idle {}",
            task.pid,
            prev_cpu,
            result.cpu,
            result.claimed
        );

        result.cpu
    }

    /// Perform the enqueue logic for the task but don't enqueue it where
    /// possible. The returned promise is completed by
    /// [`Self::complete_enqueue`]; an embedder may defer completion. The
    /// Complete case must be deterministic.
    pub fn async_enqueue(
        &self,
        task: &mut Task,
        taskc: &mut TaskCtx,
        mut enq_flags: u64,
    ) -> EnqueuePromise {
        let mut ret = EnqueuePromise::default();
        let mut cpu = task.cpu;
        let arena = self.cfg.duoq.arena_idle_tracking;

        /*
         * Per-cpu kthreads are considered interactive and dispatched
         * directly into the local DSQ.
         */
        if self.cfg.duoq.kthreads_local && task.is_kthread && task.nr_cpus_allowed == 1 {
            self.stat_inc(StatIdx::Direct, cpu);
            self.host.dsq_insert(
                task.pid,
                host::local_on(cpu),
                self.max_dsq_time_slice(),
                enq_flags,
            );
            if self.host.test_and_clear_cpu_idle(cpu) {
                self.host.kick_cpu(cpu, KICK_IDLE);
            }
            ret.kind = EnqueueKind::Complete;
            ret.cpu = cpu;
            return ret;
        }

        // Handle affinitized tasks separately.
        if !taskc.all_cpus() || task.nr_cpus_allowed != self.cfg.topo.nr_cpus {
            let has_cleared_idle;
            if enq_flags & ENQ_CPU_SELECTED == 0 || !task.cpus_allowed.test_cpu(cpu) {
                let pick = self.pick_idle_affinitized_cpu(task, taskc, cpu);
                cpu = pick.cpu;
                has_cleared_idle = pick.claimed;
            } else {
                has_cleared_idle = self.host.test_and_clear_cpu_idle(cpu);
                if has_cleared_idle && arena {
                    if let Some(llcx) = self.cpu_llc_ctx(cpu) {
                        self.llc_clear_idle(llcx, cpu);
                    }
                }
            }
            ret.assign_flag(PROMISE_F_HAS_CLEARED_IDLE, has_cleared_idle);
            ret.cpu = cpu;

            let Some(cpuc) = self.cpu_ctx_or_first(cpu) else {
                self.host.report_error("no valid CPU contexts");
                return ret;
            };
            cpu = cpuc.id;
            ret.cpu = cpu;
            let Some(llcx) = self.llc_ctx(cpuc.llc_id) else {
                self.host.report_error("no LLC context for CPU");
                return ret;
            };

            self.stat_inc(StatIdx::EnqCpu, cpu);
            taskc.dsq_id = cpuc.affn_dsq;
            self.update_vtime(task, cpuc.llc_id, taskc, llcx);
            if self.cfg.timeline.deadline {
                self.set_deadline_slice(task, taskc, llcx);
            }

            if cpuc.test_flag(CpuCtx::F_NICE_TASK) {
                enq_flags |= ENQ_PREEMPT;
            }

            // Idle affinitized tasks can be direct dispatched.
            if (ret.test_flag(PROMISE_F_HAS_CLEARED_IDLE) || cpuc.test_flag(CpuCtx::F_NICE_TASK))
                && task.cpus_allowed.test_cpu(cpu)
            {
                ret.kind = EnqueueKind::Fifo {
                    dsq_id: host::local_on(cpu),
                    slice_ns: taskc.slice_ns,
                    enq_flags,
                };
                if ret.test_flag(PROMISE_F_HAS_CLEARED_IDLE) {
                    ret.set_flag(PROMISE_F_KICK_IDLE);
                }
                return ret;
            }

            ret.kind = EnqueueKind::Vtime {
                dsq_id: taskc.dsq_id,
                slice_ns: taskc.slice_ns,
                vtime: task.dsq_vtime,
                enq_flags,
            };
            trace!(
                "ENQUEUE [{}] weight {} slice {} vtime {}",
                task.pid,
                task.weight,
                taskc.slice_ns,
                task.dsq_vtime
            );
            return ret;
        }

        // If an idle CPU hasn't been found in select_cpu find one now.
        if enq_flags & ENQ_CPU_SELECTED == 0 {
            let pick = self.pick_idle_cpu(task, taskc, cpu, 0, None);
            cpu = pick.cpu;
            ret.assign_flag(PROMISE_F_HAS_CLEARED_IDLE, pick.claimed);

            let Some(cpuc) = self.cpu_ctx_or_first(cpu) else {
                self.host.report_error("no valid CPU contexts");
                return ret;
            };
            let Some(llcx) = self.llc_ctx(cpuc.llc_id) else {
                self.host.report_error("no LLC context for CPU");
                return ret;
            };

            ret.cpu = cpu;
            self.update_vtime(task, cpuc.llc_id, taskc, llcx);
            if self.cfg.timeline.deadline {
                self.set_deadline_slice(task, taskc, llcx);
            }

            if cpuc.test_flag(CpuCtx::F_NICE_TASK) {
                enq_flags |= ENQ_PREEMPT;
            }

            if (ret.test_flag(PROMISE_F_HAS_CLEARED_IDLE) || cpuc.test_flag(CpuCtx::F_NICE_TASK))
                && task.cpus_allowed.test_cpu(cpu)
            {
                ret.kind = EnqueueKind::Fifo {
                    dsq_id: host::local_on(cpu),
                    slice_ns: taskc.slice_ns,
                    enq_flags,
                };
                if ret.test_flag(PROMISE_F_HAS_CLEARED_IDLE) {
                    ret.set_flag(PROMISE_F_KICK_IDLE);
                }
                return ret;
            }

            if self.can_migrate(taskc, llcx) {
                taskc.dsq_id = llcx.mig_dsq;
                if let (true, Some(atq)) = (self.cfg.duoq.atq_enabled, &llcx.mig_atq) {
                    taskc.enq_flags = enq_flags;
                    ret.kind = EnqueueKind::AtqVtime {
                        atq: atq.clone(),
                        fallback_dsq: cpuc.llc_dsq,
                        slice_ns: taskc.slice_ns,
                        vtime: task.dsq_vtime,
                        enq_flags,
                    };
                } else {
                    ret.kind = EnqueueKind::Vtime {
                        dsq_id: taskc.dsq_id,
                        slice_ns: taskc.slice_ns,
                        vtime: task.dsq_vtime,
                        enq_flags,
                    };
                }
                self.stat_inc(StatIdx::EnqMig, cpu);
            } else {
                taskc.dsq_id = cpuc.llc_dsq;
                ret.kind = EnqueueKind::Vtime {
                    dsq_id: taskc.dsq_id,
                    slice_ns: taskc.slice_ns,
                    vtime: task.dsq_vtime,
                    enq_flags,
                };
                self.stat_inc(StatIdx::EnqLlc, cpu);
            }
            return ret;
        }

        // select_cpu ran for this wakeup but didn't direct dispatch.
        let Some(cpuc) = self.cpu_ctx_or_first(task.cpu) else {
            self.host.report_error("no valid CPU contexts");
            return ret;
        };
        let Some(llcx) = self.llc_ctx(cpuc.llc_id) else {
            self.host.report_error("no LLC context for CPU");
            return ret;
        };
        cpu = cpuc.id;
        ret.cpu = cpu;

        if cpuc.test_flag(CpuCtx::F_NICE_TASK) {
            enq_flags |= ENQ_PREEMPT;
        }

        self.update_vtime(task, cpuc.llc_id, taskc, llcx);
        if self.cfg.timeline.deadline {
            self.set_deadline_slice(task, taskc, llcx);
        }

        let has_cleared_idle = self.host.test_and_clear_cpu_idle(cpu);
        if has_cleared_idle && arena {
            self.llc_clear_idle(llcx, cpu);
        }
        ret.assign_flag(PROMISE_F_HAS_CLEARED_IDLE, has_cleared_idle);

        if has_cleared_idle || cpuc.test_flag(CpuCtx::F_NICE_TASK) {
            let dsq_id = if cpu < self.cfg.topo.nr_cpus && task.cpus_allowed.test_cpu(cpu) {
                host::local_on(cpu)
            } else {
                host::local_on(task.cpu)
            };
            ret.kind = EnqueueKind::Fifo {
                dsq_id,
                slice_ns: taskc.slice_ns,
                enq_flags,
            };
            if has_cleared_idle {
                ret.set_flag(PROMISE_F_KICK_IDLE);
            }
            return ret;
        }

        if self.can_migrate(taskc, llcx) {
            taskc.dsq_id = llcx.mig_dsq;
            self.stat_inc(StatIdx::EnqMig, cpu);
            if let (true, Some(atq)) = (self.cfg.duoq.atq_enabled, &llcx.mig_atq) {
                taskc.enq_flags = enq_flags;
                ret.kind = EnqueueKind::AtqVtime {
                    atq: atq.clone(),
                    fallback_dsq: cpuc.llc_dsq,
                    slice_ns: taskc.slice_ns,
                    vtime: task.dsq_vtime,
                    enq_flags,
                };
                return ret;
            }
        } else {
            taskc.dsq_id = cpuc.llc_dsq;
            self.stat_inc(StatIdx::EnqLlc, cpu);
        }

        trace!(
            "ENQUEUE [{}] weight {} slice {} vtime {}",
            task.pid,
            task.weight,
            taskc.slice_ns,
            task.dsq_vtime
        );

        ret.kind = EnqueueKind::Vtime {
            dsq_id: taskc.dsq_id,
            slice_ns: taskc.slice_ns,
            vtime: task.dsq_vtime,
            enq_flags,
        };
        ret
    }

    pub fn complete_enqueue(&self, pro: &mut EnqueuePromise, task: &Task) {
        match &pro.kind {
            EnqueueKind::Complete => {}
            EnqueueKind::Fifo {
                dsq_id,
                slice_ns,
                enq_flags,
            } => {
                self.host.dsq_insert(task.pid, *dsq_id, *slice_ns, *enq_flags);
            }
            EnqueueKind::Vtime {
                dsq_id,
                slice_ns,
                vtime,
                enq_flags,
            } => {
                self.host
                    .dsq_insert_vtime(task.pid, *dsq_id, *slice_ns, *vtime, *enq_flags);
            }
            EnqueueKind::AtqFifo {
                atq,
                fallback_dsq,
                slice_ns,
                enq_flags,
            } => {
                let entry = AtqEntry {
                    pid: task.pid,
                    vtime: task.dsq_vtime,
                    slice_ns: *slice_ns,
                    enq_flags: *enq_flags,
                };
                if atq.insert_fifo(entry).is_ok() {
                    self.stat_inc(StatIdx::AtqEnq, pro.cpu);
                } else {
                    // The ATQ was full, fallback to the DSQ.
                    self.host
                        .dsq_insert(task.pid, *fallback_dsq, *slice_ns, *enq_flags);
                    self.stat_inc(StatIdx::AtqReenq, pro.cpu);
                }
            }
            EnqueueKind::AtqVtime {
                atq,
                fallback_dsq,
                slice_ns,
                vtime,
                enq_flags,
            } => {
                let entry = AtqEntry {
                    pid: task.pid,
                    vtime: *vtime,
                    slice_ns: *slice_ns,
                    enq_flags: *enq_flags,
                };
                if atq.insert_vtime(entry).is_ok() {
                    self.stat_inc(StatIdx::AtqEnq, pro.cpu);
                } else {
                    // The ATQ was full, fallback to the DSQ.
                    self.host
                        .dsq_insert_vtime(task.pid, *fallback_dsq, *slice_ns, *vtime, *enq_flags);
                    self.stat_inc(StatIdx::AtqReenq, pro.cpu);
                }
            }
            EnqueueKind::Failed => {
                // Should have already errored with a more specific message.
                self.host.report_error("duoq enqueue failed");
            }
        }

        if pro.test_flag(PROMISE_F_KICK_IDLE) {
            self.stat_inc(StatIdx::Idle, pro.cpu);
            if self.deferred_wakeups.load(Ordering::Relaxed) {
                let _ = self.kick_mask.atomic_set(pro.cpu);
            } else {
                self.host.kick_cpu(pro.cpu, KICK_IDLE);
            }
        }

        pro.kind = EnqueueKind::Complete;
    }

    pub fn enqueue(&self, task: &mut Task, taskc: &mut TaskCtx, enq_flags: u64) {
        let mut pro = self.async_enqueue(task, taskc, enq_flags);
        self.complete_enqueue(&mut pro, task);
    }

    pub fn dispatch(&self, cpu: usize, mut prev: Option<&mut Task>) {
        let Some(cpuc) = self.cpu_ctx_or_first(cpu) else {
            self.host.report_error("no valid CPU contexts in dispatch");
            return;
        };

        let mut min_vtime = 0u64;
        let mut dsq_id = 0u64;
        let mut min_atq: Option<&Arc<Atq>> = None;
        let mut peeked: Option<AtqEntry> = None;

        // Under saturation skip the fairness peeks and drain in fixed
        // order.
        if !self.is_saturated() {
            if let Some(head) = self.host.dsq_peek(cpuc.affn_dsq) {
                if head.vtime < min_vtime || min_vtime == 0 {
                    min_vtime = head.vtime;
                    dsq_id = cpuc.affn_dsq;
                }
            }
            if let Some(head) = self.host.dsq_peek(cpuc.llc_dsq) {
                if head.vtime < min_vtime || min_vtime == 0 {
                    min_vtime = head.vtime;
                    dsq_id = cpuc.llc_dsq;
                }
            }
            if self.cfg.topo.nr_llcs > 1 {
                if self.cfg.duoq.atq_enabled {
                    if let Some(atq) = &cpuc.mig_atq {
                        if let Some(head) = atq.peek() {
                            if head.vtime < min_vtime || min_vtime == 0 {
                                min_vtime = head.vtime;
                                min_atq = Some(atq);
                                peeked = Some(head);
                            }
                        }
                    }
                } else if let Some(head) = self.host.dsq_peek(cpuc.mig_dsq) {
                    if head.vtime < min_vtime || min_vtime == 0 {
                        min_vtime = head.vtime;
                        dsq_id = cpuc.mig_dsq;
                    }
                }
            }
        }

        if dsq_id != 0 {
            trace!("DISPATCH cpu[{}] min_vtime {} dsq_id {}", cpu, min_vtime, dsq_id);
        }

        // First try the source with the lowest vtime for fairness.
        if let Some(atq) = min_atq {
            if let Some(entry) = atq.pop() {
                if Some(entry.pid) == peeked.map(|head| head.pid) {
                    self.host
                        .dsq_insert(entry.pid, host::local_on(cpu), entry.slice_ns, entry.enq_flags);
                    return;
                }
                /*
                 * A racing dispatcher won the peeked task. The popped task
                 * may have a later vtime, so put it back in vtime order.
                 */
                self.host.dsq_insert_vtime(
                    entry.pid,
                    cpuc.llc_dsq,
                    entry.slice_ns,
                    entry.vtime,
                    entry.enq_flags,
                );
                self.stat_inc(StatIdx::AtqReenq, cpu);
            }
        } else if dsq::valid_dsq(dsq_id) && self.host.dsq_move_to_local(cpu, dsq_id) {
            return;
        }

        // Affinitized tasks are a minority, but their DSQ must not starve.
        if dsq_id != cpuc.affn_dsq && self.host.dsq_move_to_local(cpu, cpuc.affn_dsq) {
            return;
        }

        if self.cfg.duoq.llc_shards > 1 {
            // First the CPU's assigned shard, then steal from siblings.
            if dsq_id != cpuc.llc_dsq && self.host.dsq_move_to_local(cpu, cpuc.llc_dsq) {
                return;
            }
            if let Some(llcx) = self.llc_ctx(cpuc.llc_id) {
                if llcx.nr_shards > 1 {
                    let offset = cpuc.id % llcx.nr_shards;
                    for i in 0..llcx.nr_shards {
                        let shard_dsq = llcx.shard_dsqs[(offset + i) % llcx.nr_shards];
                        if shard_dsq != cpuc.llc_dsq
                            && shard_dsq != dsq_id
                            && self.host.dsq_move_to_local(cpu, shard_dsq)
                        {
                            return;
                        }
                    }
                }
            }
        } else if dsq_id != cpuc.llc_dsq && self.host.dsq_move_to_local(cpu, cpuc.llc_dsq) {
            return;
        }

        if self.cfg.duoq.atq_enabled {
            if let Some(atq) = &cpuc.mig_atq {
                if let Some(entry) = atq.pop() {
                    self.host
                        .dsq_insert(entry.pid, host::local_on(cpu), entry.slice_ns, entry.enq_flags);
                    return;
                }
            }
        } else if dsq_id != cpuc.mig_dsq && self.host.dsq_move_to_local(cpu, cpuc.mig_dsq) {
            return;
        }

        let Some(llcx) = self.llc_ctx(cpuc.llc_id) else {
            self.host.report_error("invalid llc id in dispatch");
            return;
        };

        if let Some(prev) = prev.as_deref_mut() {
            if self.keep_running(cpuc, llcx, prev) {
                return;
            }
        }

        self.dispatch_pick_two(cpu, llcx, cpuc);
    }

    pub fn running(&self, task: &Task, taskc: &mut TaskCtx) {
        let task_cpu = task.cpu;
        let Some(cpuc) = self.cpu_ctx_or_first(task_cpu) else {
            self.host.report_error("no valid CPU contexts in running");
            return;
        };
        let Some(llcx) = self.llc_ctx(cpuc.llc_id) else {
            self.host.report_error("no LLC context in running");
            return;
        };

        if taskc.llc_id != cpuc.llc_id {
            self.refresh_llc_runs(taskc);
            self.stat_inc(StatIdx::LlcMigration, task_cpu);
            trace!(
                "RUNNING [{}] llc {}->{}",
                task.pid,
                taskc.llc_id,
                llcx.id
            );
        } else if taskc.llc_runs == 0 {
            self.refresh_llc_runs(taskc);
        } else {
            taskc.llc_runs -= 1;
        }
        if taskc.node_id != cpuc.node_id {
            self.stat_inc(StatIdx::NodeMigration, task_cpu);
        }

        taskc.llc_id = llcx.id;
        taskc.node_id = llcx.node_id;
        taskc.flags.assign(TaskFlags::WAS_NICE, task.weight < 100);

        cpuc.set_flag(CpuCtx::F_INTERACTIVE, taskc.is_interactive());
        cpuc.dsq_index.store(taskc.dsq_index, Ordering::Relaxed);
        cpuc.set_flag(CpuCtx::F_NICE_TASK, task.weight < 100);
        cpuc.slice_ns.store(taskc.slice_ns, Ordering::Relaxed);
        cpuc.ran_for.store(0, Ordering::Relaxed);

        // Raise the LLC vtime cursor, bounded to one max slice ahead.
        // Racy, but don't care.
        let vtime = llcx.vtime.load(Ordering::Relaxed);
        if task.dsq_vtime > vtime && task.dsq_vtime < vtime + self.max_dsq_time_slice() {
            let _ = llcx
                .vtime
                .compare_exchange(vtime, task.dsq_vtime, Ordering::Relaxed, Ordering::Relaxed);
        }

        // If the task is running in the least interactive DSQ, bump the
        // frequency.
        if self.cfg.duoq.freq_control && taskc.dsq_index == self.cfg.duoq.nr_dsqs_per_llc - 1 {
            self.host.cpuperf_set(task_cpu, CPUPERF_ONE);
        }

        let now = self.host.now();
        if taskc.last_run_started == 0 {
            taskc.last_run_started = now;
        }
        taskc.last_run_at = now;
    }

    pub fn stopping(&self, task: &mut Task, taskc: &mut TaskCtx, runnable: bool) {
        let now = self.host.now();
        let Some(llcx) = self.llc_ctx(taskc.llc_id) else {
            return;
        };

        if taskc.dsq_index >= self.cfg.duoq.nr_dsqs_per_llc {
            self.host.report_error("taskc invalid dsq index");
            return;
        }

        // When a nice task ran the cpu_ctx has to be updated so that tasks
        // are no longer enqueued to the local DSQ.
        if taskc.flags.test(TaskFlags::WAS_NICE) {
            if let Some(cpuc) = self.cpu_ctx(task.cpu) {
                cpuc.set_flag(CpuCtx::F_NICE_TASK, false);
                taskc.flags.clear(TaskFlags::WAS_NICE);
            }
        }

        taskc.last_dsq_id = taskc.dsq_id;
        taskc.last_dsq_index = taskc.dsq_index;

        let last_dsq_slice_ns = taskc.slice_ns;
        let used = now.saturating_sub(taskc.last_run_at);
        let scaled_used = scale_by_weight_inverse(task.weight, used);

        task.dsq_vtime += scaled_used;
        llcx.vtime.fetch_add(used, Ordering::Relaxed);
        llcx.load.fetch_add(used, Ordering::Relaxed);
        if let Some(dsq_load) = llcx.dsq_load.get(taskc.dsq_index) {
            dsq_load.fetch_add(used, Ordering::Relaxed);
        }

        if taskc.is_interactive() {
            llcx.intr_load.fetch_add(used, Ordering::Relaxed);
        }
        if !taskc.all_cpus() {
            // Note that affinitized load is absolute load, not scaled.
            llcx.affn_load.fetch_add(used, Ordering::Relaxed);
        }

        trace!(
            "STOPPING [{}] weight {} slice {} used {} scaled {}",
            task.pid,
            task.weight,
            last_dsq_slice_ns,
            used,
            scaled_used
        );

        if !runnable {
            let used = now.saturating_sub(taskc.last_run_started);
            // On stopping determine if the task can move to a longer DSQ
            // by comparing the used time to the scaled DSQ slice.
            if used >= (9 * last_dsq_slice_ns) / 10 {
                if taskc.dsq_index < self.cfg.duoq.nr_dsqs_per_llc - 1 && task.weight >= 100 {
                    taskc.dsq_index += 1;
                    self.stat_inc(StatIdx::DsqChange, task.cpu);
                } else {
                    self.stat_inc(StatIdx::DsqSame, task.cpu);
                }
            // If under half the slice was consumed move the task back down.
            } else if used < last_dsq_slice_ns / 2 {
                if taskc.dsq_index > 0 {
                    taskc.dsq_index -= 1;
                    self.stat_inc(StatIdx::DsqChange, task.cpu);
                } else {
                    self.stat_inc(StatIdx::DsqSame, task.cpu);
                }
            } else {
                self.stat_inc(StatIdx::DsqSame, task.cpu);
            }

            // nice tasks can only get the minimal amount of non
            // interactive slice.
            if task.weight < 100 && taskc.dsq_index > 1 {
                taskc.dsq_index = 1;
            }

            if self.cfg.duoq.task_slice {
                if used >= (7 * last_dsq_slice_ns) / 8 {
                    taskc.slice_ns = self.clamp_slice((5 * taskc.slice_ns) >> 2);
                } else if used < last_dsq_slice_ns / 2 {
                    taskc.slice_ns = self.clamp_slice((7 * taskc.slice_ns) >> 3);
                }
            } else {
                taskc.slice_ns = self.task_dsq_slice_ns(task, taskc.dsq_index);
            }
            taskc.last_run_started = 0;
            taskc
                .flags
                .assign(TaskFlags::INTERACTIVE, self.is_interactive(taskc));
        }
    }

    pub fn update_idle(&self, cpu: usize, idle: bool) {
        let idle_mask = self.host.idle_cpumask();
        let percent_idle = (100 * idle_mask.weight() / self.cfg.topo.nr_cpus.max(1)) as u32;
        let saturated = percent_idle < self.cfg.duoq.saturated_percent;
        self.saturated.store(saturated, Ordering::Relaxed);

        // Low idle headroom raises the migration budget so tasks stay put.
        let min_runs = if saturated {
            2.min(self.cfg.lb.min_llc_runs_pick2)
        } else {
            let llc_scaler = log2_u32(self.cfg.topo.nr_llcs as u32) as u64;
            (log2_u32(percent_idle) as u64 + llc_scaler).min(self.cfg.lb.min_llc_runs_pick2)
        };
        self.min_llc_runs_pick2.store(min_runs, Ordering::Relaxed);

        let Some(llcx) = self.cpu_llc_ctx(cpu) else {
            return;
        };
        if percent_idle == 0 {
            self.overloaded.store(true, Ordering::Relaxed);
        }

        if idle {
            llcx.set_saturated(false);
            self.overloaded.store(false, Ordering::Relaxed);
        } else {
            llcx.tmp_cpumask.and_cpumask(&llcx.cpumask, &idle_mask);
            if llcx.tmp_cpumask.is_empty() {
                llcx.set_saturated(true);
            }
        }

        /*
         * With arena idle tracking the private masks are the source of
         * truth for wakeup placement; mirror the transition into them.
         */
        if self.cfg.duoq.arena_idle_tracking {
            if idle {
                self.llc_set_idle(llcx, cpu);
            } else {
                self.llc_clear_idle(llcx, cpu);
            }
        }

        if !self.cfg.duoq.cpu_priority || !idle {
            return;
        }

        let priority = self.cpu_ctx(cpu).map(|c| c.perf_priority).unwrap_or(1);
        // Since we use a minheap convert the highest prio to lowest score.
        let idle_score = self.host.now().saturating_sub((1 << 7) * priority);
        if let Some(heap) = &llcx.idle_cpu_heap {
            let _ = heap.lock().insert(cpu, idle_score);
        }
    }

    pub fn init_task(&self, task: &mut Task) -> Result<TaskCtx> {
        let Some(cpuc) = self.cpu_ctx_or_first(task.cpu) else {
            bail!("no valid CPU contexts available");
        };
        let Some(llcx) = self.llc_ctx(cpuc.llc_id) else {
            bail!("no LLC context for CPU {}", cpuc.id);
        };

        let slice_ns = scale_by_weight(
            task.weight,
            self.dsq_time_slice(self.cfg.duoq.init_dsq_index),
        );

        // Adjust the starting index based on niceness.
        let dsq_index = if task.weight == 100 {
            self.cfg.duoq.init_dsq_index
        } else if task.weight < 100 {
            0
        } else {
            self.cfg.duoq.nr_dsqs_per_llc - 1
        };

        let mut taskc = TaskCtx {
            dsq_id: host::DSQ_INVALID,
            slice_ns,
            llc_id: cpuc.llc_id,
            dsq_index,
            flags: TaskFlags::default(),
            node_id: cpuc.node_id,
            last_run_at: 0,
            last_run_started: 0,
            llc_runs: 0,
            last_dsq_id: 0,
            last_dsq_index: dsq_index,
            enq_flags: 0,
        };

        taskc.flags.assign(
            TaskFlags::ALL_CPUS,
            task.nr_cpus_allowed == self.cfg.topo.nr_cpus,
        );
        taskc
            .flags
            .assign(TaskFlags::INTERACTIVE, self.is_interactive(&taskc));

        task.dsq_vtime = llcx.vtime.load(Ordering::Relaxed);
        self.refresh_llc_runs(&mut taskc);

        // Leaving the DSQ id invalid causes the task to be randomized on a
        // LLC on its first wakeup.
        if !taskc.all_cpus() {
            taskc.dsq_id = cpuc.llc_dsq;
        }

        Ok(taskc)
    }

    pub fn exit_task(&self, _taskc: TaskCtx) {}

    pub fn set_cpumask(&self, task: &Task, taskc: &mut TaskCtx) {
        taskc.flags.assign(
            TaskFlags::ALL_CPUS,
            task.nr_cpus_allowed == self.cfg.topo.nr_cpus,
        );
    }

    pub fn cpu_release(&self, cpu: usize) {
        self.host.reenqueue_local(cpu);
    }

    pub fn exit(&self, reason: &str) {
        info!("EXIT: {}", reason);
        *self.exit_info.lock() = Some(reason.to_string());
    }

    pub fn exit_reason(&self) -> Option<String> {
        self.exit_info.lock().clone()
    }

    pub fn set_stats_enabled(&self, enabled: bool) {
        self.stats_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> Metrics {
        self.aggregate_cpu_stats();
        Metrics::from_counters(&self.stats, self.cpu_util_avg.load(Ordering::Relaxed))
    }

    pub(crate) fn aggregate_cpu_stats(&self) {
        for cpuc in self.cpus.iter().flatten() {
            for idx in 0..crate::stats::NR_STATS {
                let stat = crate::stats::STAT_IDX_ALL[idx];
                let val = cpuc.local_stats.take(stat);
                if val > 0 {
                    self.stats.add(stat, val);
                }
            }
        }
    }
}
