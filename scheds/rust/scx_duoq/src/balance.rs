// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Pick-2 load balancing. A periodic pass compares each LLC against a
//! rotating peer and latches a drain hint when the imbalance exceeds the
//! slack factor; the dispatch path samples two random LLCs when a CPU runs
//! dry and consumes from the heavier one first, which conserves work better
//! than draining the lighter on machines with many LLCs.

use std::sync::atomic::Ordering;

use log::debug;
use log::trace;

use crate::host::Host;
use crate::sched::Scheduler;
use crate::stats::StatIdx;
use crate::types::CpuCtx;
use crate::types::LlcCtx;
use crate::types::NO_LLC;

impl<H: Host> Scheduler<H> {
    /// Move one task from `llcx`'s migration queue to `cpu`'s local DSQ.
    fn consume_llc(&self, cpu: usize, llcx: &LlcCtx) -> bool {
        if self.duoq_cfg().atq_enabled {
            if let Some(atq) = &llcx.mig_atq {
                if atq.nr_queued() > 0 {
                    if let Some(entry) = atq.pop() {
                        trace!("ATQ consume {} from LLC {}", entry.pid, llcx.id);
                        self.host().dsq_insert(
                            entry.pid,
                            crate::host::local_on(cpu),
                            entry.slice_ns,
                            entry.enq_flags,
                        );
                    }
                    return false;
                }
            }
        }

        if self.host().dsq_move_to_local(cpu, llcx.mig_dsq) {
            self.stat_inc(StatIdx::DispatchPick2, cpu);
            return true;
        }

        false
    }

    pub(crate) fn dispatch_pick_two(&self, cpu: usize, cur_llcx: &LlcCtx, _cpuc: &CpuCtx) {
        let lb = self.lb_cfg();
        let nr_llcs = self.topo_cfg().nr_llcs;

        if lb.single_llc_mode || nr_llcs == 1 || lb.dispatch_pick2_disable {
            return;
        }

        if lb.min_nr_queued_pick2 > 0 && self.llc_nr_queued(cur_llcx) < lb.min_nr_queued_pick2 {
            return;
        }

        if lb.backoff_ns > 0 {
            let now = self.host().now();
            if now.saturating_sub(cur_llcx.last_period_ns.load(Ordering::Relaxed)) < lb.backoff_ns
            {
                return;
            }
        }

        /*
         * Randomly choose two LLCs and consume from the one with the
         * larger load first, falling back to the second.
         */
        let left = if nr_llcs == 2 {
            self.llc_ctx(0)
        } else {
            Some(self.rand_llc_ctx())
        };
        let right = if nr_llcs == 2 {
            self.llc_ctx(1)
        } else {
            Some(self.rand_llc_ctx())
        };
        let (Some(left), Some(mut right)) = (left, right) else {
            return;
        };

        if left.id == right.id {
            let idx = cur_llcx.load.load(Ordering::Relaxed) as usize % nr_llcs;
            match self.llc_ctx(idx) {
                Some(other) => right = other,
                None => return,
            }
        }

        let (mut first, mut second) =
            if right.load.load(Ordering::Relaxed) > left.load.load(Ordering::Relaxed) {
                (right, left)
            } else {
                (left, right)
            };

        // With two LLCs the current one may come up first even though its
        // own queues were just checked; start with the other.
        if nr_llcs == 2 && first.id == cur_llcx.id {
            first = second;
            second = cur_llcx;
        }

        trace!(
            "PICK2 cpu[{}] first[{}] {} second[{}] {}",
            cpu,
            first.id,
            first.load.load(Ordering::Relaxed),
            second.id,
            second.load.load(Ordering::Relaxed)
        );

        let cur_load = cur_llcx.load.load(Ordering::Relaxed);
        let cur_load = cur_load + ((cur_load * lb.slack_factor) / 100);

        if first.load.load(Ordering::Relaxed) >= cur_load && self.consume_llc(cpu, first) {
            return;
        }

        if second.load.load(Ordering::Relaxed) >= cur_load && self.consume_llc(cpu, second) {
            return;
        }

        if self.is_saturated() {
            if self.consume_llc(cpu, first) {
                return;
            }
            if self.consume_llc(cpu, second) {
                return;
            }

            // A saturated system load balances aggressively.
            if nr_llcs > 2 && self.consume_llc(cpu, self.rand_llc_ctx()) {}
        }
    }

    /// Periodic pass: latch pick-2 hints from pairwise imbalance, adapt
    /// the interactive slice toward the configured ratio and reset the per
    /// period load counters.
    pub(crate) fn load_balance_timer(&self) -> bool {
        let nr_llcs = self.topo_cfg().nr_llcs;
        let nr_dsqs = self.duoq_cfg().nr_dsqs_per_llc;

        let mut load_sum: u64 = 0;
        let mut interactive_sum: u64 = 0;

        let offset = self.llc_lb_offset.load(Ordering::Relaxed);
        for llc_index in 0..nr_llcs {
            let Some(llcx) = self.llc_ctx(llc_index) else {
                return false;
            };
            let lb_llc_index = (llc_index + offset) % nr_llcs;
            let Some(lb_llcx) = self.llc_ctx(lb_llc_index) else {
                return false;
            };

            let load = llcx.load.load(Ordering::Relaxed);
            let lb_load = lb_llcx.load.load(Ordering::Relaxed);
            load_sum += load;
            interactive_sum += llcx.intr_load.load(Ordering::Relaxed);

            let load_imbalance = if load > lb_load {
                (100 * (load - lb_load)) / load
            } else {
                0
            };

            let lb_slack = if self.lb_cfg().slack_factor > 0 {
                self.lb_cfg().slack_factor
            } else {
                crate::config::LOAD_BALANCE_SLACK
            };

            if load_imbalance > lb_slack {
                llcx.lb_llc_id.store(lb_llc_index, Ordering::Relaxed);
            } else {
                llcx.lb_llc_id.store(NO_LLC, Ordering::Relaxed);
            }

            debug!(
                "LB llcx[{}] {} lb_llcx[{}] {} imbalance {}",
                llc_index, load, lb_llc_index, lb_load, load_imbalance
            );
        }

        debug!(
            "LB Total load {}, Total interactive {}",
            load_sum, interactive_sum
        );

        if nr_llcs > 1 {
            self.llc_lb_offset
                .store((offset % (nr_llcs - 1)) + 1, Ordering::Relaxed);
        }

        let autoslice = self.timeline_cfg().autoslice;
        if autoslice && load_sum > 0 && load_sum >= interactive_sum {
            if interactive_sum == 0 {
                self.store_dsq_time_slice(0, (11 * self.load_dsq_time_slice(0)) / 10);
                self.rescale_dsq_time_slices();
            } else {
                let ideal_sum =
                    (load_sum * self.duoq_cfg().interactive_ratio as u64) / 100;
                debug!("LB autoslice ideal/sum {}/{}", ideal_sum, interactive_sum);
                if interactive_sum < ideal_sum {
                    self.store_dsq_time_slice(0, (11 * self.load_dsq_time_slice(0)) / 10);
                } else {
                    self.store_dsq_time_slice(
                        0,
                        ((10 * self.load_dsq_time_slice(0)) / 11).max(self.min_slice_ns),
                    );
                }
                self.rescale_dsq_time_slices();
            }
        }

        let now = self.host().now();
        for llc_index in 0..nr_llcs {
            let Some(llcx) = self.llc_ctx(llc_index) else {
                return false;
            };
            llcx.load.store(0, Ordering::Relaxed);
            llcx.intr_load.store(0, Ordering::Relaxed);
            llcx.affn_load.store(0, Ordering::Relaxed);
            llcx.last_period_ns.store(now, Ordering::Relaxed);
            for dsq_load in llcx.dsq_load.iter() {
                dsq_load.store(0, Ordering::Relaxed);
            }
        }

        // The rescale keeps the slice table monotonic, but autoslice may
        // have floored the interactive slice; fix up any inversions.
        if autoslice {
            for j in 1..nr_dsqs {
                if self.load_dsq_time_slice(j) < self.load_dsq_time_slice(j - 1) {
                    self.store_dsq_time_slice(
                        j,
                        self.load_dsq_time_slice(j - 1) << self.duoq_cfg().dsq_shift,
                    );
                }
                debug!("LB autoslice slice[{}] {}", j, self.load_dsq_time_slice(j));
            }
        }

        true
    }

    fn rescale_dsq_time_slices(&self) {
        let base = self.load_dsq_time_slice(0);
        for j in 1..self.duoq_cfg().nr_dsqs_per_llc {
            self.store_dsq_time_slice(j, base << j << self.duoq_cfg().dsq_shift);
        }
    }
}
