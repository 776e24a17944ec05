// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Periodic work. Two cooperative timers are registered with the host at
//! init: the load balance timer and the wakeup timer. The wakeup timer
//! drains the deferred kick bits set on the enqueue path, batches per-CPU
//! stat buckets into the global counters and tracks a smoothed CPU
//! utilization, slowing itself down when there is nothing to watch.

use std::sync::atomic::Ordering;

use crate::config::NSEC_PER_MSEC;
use crate::host::local_on;
use crate::host::Host;
use crate::host::TimerKind;
use crate::host::KICK_IDLE;
use crate::pick::MAX_WORDS;
use crate::sched::Scheduler;

pub const LB_TIMER_INTERVAL_NS: u64 = 250 * NSEC_PER_MSEC;

/// Aggregate per-CPU stat buckets every N wakeup ticks.
const STATS_AGG_TICKS: u64 = 10;

impl<H: Host> Scheduler<H> {
    /// Host callback on timer expiry. Returns the delay to re-arm with, or
    /// None to stop the timer.
    pub fn timer_expired(&self, timer: TimerKind) -> Option<u64> {
        match timer {
            TimerKind::LoadBalance => self
                .load_balance_timer()
                .then_some(LB_TIMER_INTERVAL_NS),
            TimerKind::Wakeup => Some(self.wakeup_timer()),
        }
    }

    fn wakeup_timer(&self) -> u64 {
        let ticks = self.timer_ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let nr_cpus = self.topo_cfg().nr_cpus;

        let idle_mask = self.host().idle_cpumask();

        /*
         * Kick idle CPUs with pending local work. Tasks are only marked on
         * the enqueue path; the kick itself happens here so the enqueue
         * hot path stays cheap.
         */
        let nr_words = self.kick_mask.nr_words().min(MAX_WORDS);
        for idx in 0..nr_words {
            let mut word = self.kick_mask.word(idx);
            while word != 0 {
                let bit = word.trailing_zeros() as usize;
                word &= word - 1;
                let cpu = idx * 64 + bit;
                if cpu >= nr_cpus {
                    continue;
                }

                if self.host().dsq_nr_queued(local_on(cpu)) == 0 {
                    let _ = self.kick_mask.atomic_clear(cpu);
                    continue;
                }

                if idle_mask.test_cpu(cpu) {
                    let _ = self.kick_mask.atomic_clear(cpu);
                    self.host().kick_cpu(cpu, KICK_IDLE);
                }
            }
        }

        // Utilization from the idle mask weight, scaled to 0-1024, with an
        // EMA of 3/4 old + 1/4 new.
        let busy = nr_cpus.saturating_sub(idle_mask.weight()) as u64;
        let util = (busy * 1024) / nr_cpus.max(1) as u64;
        self.cpu_util.store(util, Ordering::Relaxed);
        let old = self.cpu_util_avg.load(Ordering::Relaxed);
        self.cpu_util_avg
            .store((old - (old >> 2)) + (util >> 2), Ordering::Relaxed);

        let stats_enabled = self.stats_enabled.load(Ordering::Relaxed);
        if stats_enabled && ticks % STATS_AGG_TICKS == 0 {
            self.aggregate_cpu_stats();
        }

        let base_period = if self.timeline_cfg().wakeup_timer_ns > 0 {
            self.timeline_cfg().wakeup_timer_ns
        } else {
            self.min_dsq_time_slice()
        };

        // Slow down when nobody consumes stats or the system is mostly
        // idle.
        if !stats_enabled {
            base_period * 10
        } else if util < 100 {
            base_period * 4
        } else {
            base_period
        }
    }
}
