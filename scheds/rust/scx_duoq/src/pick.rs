// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Idle CPU selection. Candidates are scanned word-at-a-time from a source
//! mask intersected with an idle view, then claimed atomically through the
//! LLC's private idle masks (arena tracking) and the host's test-and-clear
//! primitive. The ordered policy follows the wakeup ladder: prev CPU, sync
//! wake placement, mode preferences, the pick-2 hint, local LLC, then
//! saturation widening to the node and the whole system.

use duoq_arena::Cpumask;
use duoq_arena::ScxBitmap;

use crate::dsq::valid_dsq;
use crate::host::Host;
use crate::host::Task;
use crate::host::WakerRef;
use crate::host::WAKE_SYNC;
use crate::sched::Scheduler;
use crate::stats::StatIdx;
use crate::types::LlcCtx;
use crate::types::TaskCtx;
use crate::SchedMode;

pub(crate) const MAX_WORDS: usize = crate::MAX_CPUS / 64;

#[derive(Clone, Debug)]
pub(crate) struct IdleSnapshot {
    pub cpumask: Cpumask,
    pub smtmask: Cpumask,
}

#[derive(Clone, Copy, Debug)]
pub struct PickResult {
    pub cpu: usize,
    pub claimed: bool,
}

/// Where "is this CPU idle" is answered from: the LLC's private masks when
/// arena idle tracking is on, a host snapshot otherwise.
pub(crate) enum IdleFilter<'a> {
    Arena(&'a LlcCtx),
    Snapshot(&'a IdleSnapshot),
}

impl IdleFilter<'_> {
    #[inline]
    fn word(&self, idx: usize, core: bool) -> u64 {
        match self {
            IdleFilter::Arena(llc) => {
                let mask = if core {
                    llc.idle_smtmask.as_ref()
                } else {
                    llc.idle_cpumask.as_ref()
                };
                mask.map(|m| m.word(idx)).unwrap_or(0)
            }
            IdleFilter::Snapshot(snap) => {
                let words = if core {
                    snap.smtmask.words()
                } else {
                    snap.cpumask.words()
                };
                words.get(idx).copied().unwrap_or(0)
            }
        }
    }
}

impl<H: Host> Scheduler<H> {
    pub(crate) fn idle_snapshot(&self) -> IdleSnapshot {
        IdleSnapshot {
            cpumask: self.host().idle_cpumask(),
            smtmask: self.host().idle_smtmask(),
        }
    }

    pub(crate) fn idle_filter<'a>(
        &self,
        llc: &'a LlcCtx,
        snapshot: Option<&'a IdleSnapshot>,
    ) -> IdleFilter<'a> {
        match snapshot {
            None => IdleFilter::Arena(llc),
            Some(snap) => IdleFilter::Snapshot(snap),
        }
    }

    /// Clear `cpu` from the LLC's private idle masks. The SMT mask loses
    /// both siblings since the core is no longer fully idle.
    pub(crate) fn llc_clear_idle(&self, llc: &LlcCtx, cpu: usize) {
        if let Some(mask) = &llc.idle_cpumask {
            let _ = mask.atomic_clear(cpu);
        }
        if self.topo_cfg().smt_enabled {
            if let Some(smt) = &llc.idle_smtmask {
                let _ = smt.atomic_clear(cpu);
                if let Some(sib) = self.smt_sibling(cpu) {
                    let _ = smt.atomic_clear(sib);
                }
            }
        }
    }

    /// Mark `cpu` idle in the LLC's private masks. A CPU lands in the SMT
    /// mask only when its sibling is idle too.
    pub(crate) fn llc_set_idle(&self, llc: &LlcCtx, cpu: usize) {
        if let Some(mask) = &llc.idle_cpumask {
            let _ = mask.atomic_set(cpu);
        }
        if self.topo_cfg().smt_enabled {
            if let (Some(mask), Some(smt)) = (&llc.idle_cpumask, &llc.idle_smtmask) {
                if let Some(sib) = self.smt_sibling(cpu) {
                    if mask.test(sib) {
                        let _ = smt.atomic_set(cpu);
                        let _ = smt.atomic_set(sib);
                    }
                }
            }
        }
    }

    /// Claim `cpu` through the arena masks (when tracked) and the host.
    fn claim_cpu(&self, llc: Option<&LlcCtx>, cpu: usize) -> bool {
        if self.duoq_cfg().arena_idle_tracking {
            if let Some(llc) = llc {
                if let Some(mask) = &llc.idle_cpumask {
                    if !mask.test_and_clear(cpu).unwrap_or(false) {
                        return false;
                    }
                    self.llc_clear_idle(llc, cpu);
                    self.host().test_and_clear_cpu_idle(cpu);
                    return true;
                }
            }
        }
        self.host().test_and_clear_cpu_idle(cpu)
    }

    /// Scan `src` restricted to `filter` (and optionally `allowed`) and
    /// claim the first claimable CPU, preferring fully idle SMT cores when
    /// `require_core` is set.
    pub(crate) fn pick_and_claim(
        &self,
        src: &ScxBitmap,
        llc_for_claim: Option<&LlcCtx>,
        filter: &IdleFilter<'_>,
        require_core: bool,
        allowed: Option<&Cpumask>,
    ) -> Option<usize> {
        let core = require_core && self.topo_cfg().smt_enabled;
        let nr_cpus = self.topo_cfg().nr_cpus;
        let nr_words = src.nr_words().min(MAX_WORDS);
        for idx in 0..nr_words {
            let mut word = src.word(idx) & filter.word(idx, core);
            if let Some(allowed) = allowed {
                word &= allowed.words().get(idx).copied().unwrap_or(0);
            }
            while word != 0 {
                let bit = word.trailing_zeros() as usize;
                word &= word - 1;
                let cpu = idx * 64 + bit;
                if cpu >= nr_cpus {
                    continue;
                }
                if self.claim_cpu(llc_for_claim, cpu) {
                    return Some(cpu);
                }
            }
        }
        None
    }

    /// A uniformly random CPU from the task's allowed set.
    fn any_allowed_cpu(&self, task: &Task) -> usize {
        let weight = task.cpus_allowed.weight();
        if weight == 0 {
            return task.cpu;
        }
        let nth = self.host().prandom_u32() as usize % weight;
        task.cpus_allowed.iter().nth(nth).unwrap_or(task.cpu)
    }

    /// Reduced picker for tasks pinned below full width: prev CPU, then the
    /// LLC and node intersected with the allowed set, then anywhere allowed.
    pub(crate) fn pick_idle_affinitized_cpu(
        &self,
        task: &Task,
        taskc: &TaskCtx,
        prev_cpu: usize,
    ) -> PickResult {
        let arena = self.duoq_cfg().arena_idle_tracking;

        let llcx = match self.llc_ctx(taskc.llc_id) {
            Some(llcx) => llcx,
            None => {
                return PickResult {
                    cpu: self.any_allowed_cpu(task),
                    claimed: false,
                }
            }
        };

        if task.cpus_allowed.test_cpu(prev_cpu) && self.host().test_and_clear_cpu_idle(prev_cpu) {
            if arena {
                self.llc_clear_idle(llcx, prev_cpu);
            }
            return PickResult {
                cpu: prev_cpu,
                claimed: true,
            };
        }

        let snapshot = if arena { None } else { Some(self.idle_snapshot()) };
        let filter = self.idle_filter(llcx, snapshot.as_ref());

        if self.topo_cfg().smt_enabled {
            if let Some(cpu) =
                self.pick_and_claim(&llcx.cpumask, Some(llcx), &filter, true, Some(&task.cpus_allowed))
            {
                return PickResult { cpu, claimed: true };
            }
        }
        if let Some(cpu) =
            self.pick_and_claim(&llcx.cpumask, Some(llcx), &filter, false, Some(&task.cpus_allowed))
        {
            return PickResult { cpu, claimed: true };
        }

        // Widen to the node. Claims go through the host; private masks of
        // sibling LLCs self-heal on their next update_idle.
        let node_snap = snapshot.unwrap_or_else(|| self.idle_snapshot());
        let node_filter = IdleFilter::Snapshot(&node_snap);
        if let Some(cpu) = self.pick_and_claim(
            &llcx.node_cpumask,
            None,
            &node_filter,
            false,
            Some(&task.cpus_allowed),
        ) {
            return PickResult { cpu, claimed: true };
        }

        PickResult {
            cpu: self.any_allowed_cpu(task),
            claimed: false,
        }
    }

    pub(crate) fn pick_idle_cpu(
        &self,
        task: &Task,
        taskc: &TaskCtx,
        prev_cpu: usize,
        wake_flags: u64,
        waker: Option<WakerRef>,
    ) -> PickResult {
        let interactive = taskc.is_interactive();
        let arena = self.duoq_cfg().arena_idle_tracking;
        let smt = self.topo_cfg().smt_enabled;
        let nr_llcs = self.topo_cfg().nr_llcs;

        let stay = |cpu| PickResult {
            cpu,
            claimed: false,
        };

        // Interactive tasks can short circuit all placement and stay
        // sticky to prev_cpu.
        if self.duoq_cfg().interactive_sticky && interactive {
            let claimed = self.host().test_and_clear_cpu_idle(prev_cpu);
            if claimed && arena {
                if let Some(llcx) = self.llc_ctx(taskc.llc_id) {
                    self.llc_clear_idle(llcx, prev_cpu);
                }
            }
            return PickResult {
                cpu: prev_cpu,
                claimed,
            };
        }

        let mut llcx = match self.llc_ctx(taskc.llc_id) {
            Some(llcx) => llcx,
            None => return stay(prev_cpu),
        };
        let snapshot = if arena { None } else { Some(self.idle_snapshot()) };

        // Most wakeups land back on a still idle prev_cpu; check it before
        // anything expensive. Non-interactive tasks prefer a fully idle
        // core so they are not disturbed by a sibling.
        let prev_idle = if arena {
            let mask = if smt && !interactive {
                llcx.idle_smtmask.as_ref()
            } else {
                llcx.idle_cpumask.as_ref()
            };
            mask.map(|m| m.test(prev_cpu)).unwrap_or(false)
        } else {
            let snap = snapshot.as_ref().unwrap();
            let mask = if smt && !interactive {
                &snap.smtmask
            } else {
                &snap.cpumask
            };
            mask.test_cpu(prev_cpu)
        };
        if prev_idle && self.host().test_and_clear_cpu_idle(prev_cpu) {
            if arena {
                self.llc_clear_idle(llcx, prev_cpu);
            }
            return PickResult {
                cpu: prev_cpu,
                claimed: true,
            };
        }

        let migratable = self.can_migrate(taskc, llcx);
        if nr_llcs > 1
            && (llcx.is_saturated() || self.is_saturated() || self.is_overloaded())
            && !migratable
        {
            return stay(prev_cpu);
        }

        // Fresh tasks have no DSQ yet; randomize them across LLCs.
        if !valid_dsq(taskc.dsq_id) {
            llcx = self.rand_llc_ctx();
        }

        /*
         * If the current task is waking up another task and releasing the
         * CPU (WAKE_SYNC), attempt to migrate the wakee close to the waker.
         */
        if wake_flags & WAKE_SYNC != 0 {
            // Interactive tasks aren't worth migrating across LLCs.
            if interactive || (nr_llcs == 2 && self.topo_cfg().nr_nodes == 2) {
                let filter = self.idle_filter(llcx, snapshot.as_ref());
                if let Some(cpu) = self.pick_and_claim(&llcx.cpumask, Some(llcx), &filter, false, None)
                {
                    self.stat_inc(StatIdx::WakeLlc, cpu);
                    return PickResult { cpu, claimed: true };
                }
                // Nothing idle, stay sticky
                self.stat_inc(StatIdx::WakePrev, prev_cpu);
                return stay(prev_cpu);
            }

            let Some(waker) = waker else {
                self.stat_inc(StatIdx::WakePrev, prev_cpu);
                return stay(prev_cpu);
            };

            if waker.llc_id == llcx.id || !self.lb_cfg().wakeup_llc_migrations {
                let filter = self.idle_filter(llcx, snapshot.as_ref());
                // Try an idle smt core in the LLC, then any idle CPU.
                if smt {
                    if let Some(cpu) =
                        self.pick_and_claim(&llcx.cpumask, Some(llcx), &filter, true, None)
                    {
                        self.stat_inc(StatIdx::WakeLlc, cpu);
                        return PickResult { cpu, claimed: true };
                    }
                }
                if let Some(cpu) = self.pick_and_claim(&llcx.cpumask, Some(llcx), &filter, false, None)
                {
                    self.stat_inc(StatIdx::WakeLlc, cpu);
                    return PickResult { cpu, claimed: true };
                }
                // Nothing idle, stay sticky
                self.stat_inc(StatIdx::WakePrev, prev_cpu);
                return stay(prev_cpu);
            }

            // Wakeup LLC migrations are allowed, follow the waker.
            let Some(waker_llcx) = self.llc_ctx(waker.llc_id) else {
                self.stat_inc(StatIdx::WakePrev, prev_cpu);
                return stay(prev_cpu);
            };
            let filter = self.idle_filter(waker_llcx, snapshot.as_ref());
            if let Some(cpu) =
                self.pick_and_claim(&waker_llcx.cpumask, Some(waker_llcx), &filter, true, None)
            {
                self.stat_inc(StatIdx::WakeMig, cpu);
                return PickResult { cpu, claimed: true };
            }
            if let Some(cpu) =
                self.pick_and_claim(&waker_llcx.cpumask, Some(waker_llcx), &filter, false, None)
            {
                self.stat_inc(StatIdx::WakeMig, cpu);
                return PickResult { cpu, claimed: true };
            }

            // Nothing idle, move to the waker CPU.
            self.stat_inc(StatIdx::WakeMig, waker.cpu);
            return stay(waker.cpu);
        }

        if self.duoq_cfg().sched_mode == SchedMode::Performance && self.topo_cfg().has_little_cores {
            let filter = self.idle_filter(llcx, snapshot.as_ref());
            if let Some(cpu) = self.pick_and_claim(&llcx.big_cpumask, Some(llcx), &filter, true, None)
            {
                return PickResult { cpu, claimed: true };
            }
            if let Some(cpu) = self.pick_and_claim(&llcx.big_cpumask, Some(llcx), &filter, false, None)
            {
                return PickResult { cpu, claimed: true };
            }
        }

        if self.duoq_cfg().sched_mode == SchedMode::Efficiency && self.topo_cfg().has_little_cores {
            let filter = self.idle_filter(llcx, snapshot.as_ref());
            if let Some(cpu) =
                self.pick_and_claim(&llcx.little_cpumask, Some(llcx), &filter, true, None)
            {
                return PickResult { cpu, claimed: true };
            }
            if let Some(cpu) =
                self.pick_and_claim(&llcx.little_cpumask, Some(llcx), &filter, false, None)
            {
                return PickResult { cpu, claimed: true };
            }
        }

        // A latched pick-2 hint redirects the search to drain the peer LLC
        // once the task has exhausted its migration budget.
        if taskc.llc_runs == 0 {
            if let Some(target) = llcx.take_lb_hint() {
                match self.llc_ctx(target) {
                    Some(target_llcx) => {
                        llcx = target_llcx;
                        self.stat_inc(StatIdx::SelectPick2, prev_cpu);
                    }
                    None => return stay(prev_cpu),
                }
            }
        }

        if self.topo_cfg().has_little_cores {
            let filter = self.idle_filter(llcx, snapshot.as_ref());
            if interactive {
                if let Some(cpu) =
                    self.pick_and_claim(&llcx.little_cpumask, Some(llcx), &filter, false, None)
                {
                    return PickResult { cpu, claimed: true };
                }
            } else if let Some(cpu) =
                self.pick_and_claim(&llcx.big_cpumask, Some(llcx), &filter, true, None)
            {
                return PickResult { cpu, claimed: true };
            }
        }

        // Next try in the local LLC (usually succeeds): a fully idle core
        // first, then any idle CPU.
        let filter = self.idle_filter(llcx, snapshot.as_ref());
        if let Some(cpu) = self.pick_and_claim(&llcx.cpumask, Some(llcx), &filter, true, None) {
            return PickResult { cpu, claimed: true };
        }
        if let Some(cpu) = self.pick_and_claim(&llcx.cpumask, Some(llcx), &filter, false, None) {
            return PickResult { cpu, claimed: true };
        }

        if nr_llcs > 1 && llcx.is_saturated() && migratable {
            let wide_snap = snapshot.unwrap_or_else(|| self.idle_snapshot());
            let wide = IdleFilter::Snapshot(&wide_snap);
            if let Some(cpu) = self.pick_and_claim(&llcx.node_cpumask, None, &wide, true, None) {
                return PickResult { cpu, claimed: true };
            }
            if let Some(cpu) = self.pick_and_claim(&llcx.node_cpumask, None, &wide, false, None) {
                return PickResult { cpu, claimed: true };
            }
            if self.is_saturated() {
                if let Some(cpu) = self.pick_and_claim(self.all_cpumask(), None, &wide, true, None) {
                    return PickResult { cpu, claimed: true };
                }
                if let Some(cpu) = self.pick_and_claim(self.all_cpumask(), None, &wide, false, None)
                {
                    return PickResult { cpu, claimed: true };
                }
            }
        }

        stay(prev_cpu)
    }
}
