// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::sleep;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use scx_stats::prelude::*;
use scx_stats_derive::stat_doc;
use scx_stats_derive::Stats;
use serde::Deserialize;
use serde::Serialize;

/// Scheduling event counters. Hot paths bump a per-CPU bucket; the wakeup
/// timer batches buckets into the global counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum StatIdx {
    Direct,
    Idle,
    Keep,
    DsqChange,
    DsqSame,
    EnqCpu,
    EnqLlc,
    EnqMig,
    SelectPick2,
    DispatchPick2,
    LlcMigration,
    NodeMigration,
    WakePrev,
    WakeLlc,
    WakeMig,
    AtqEnq,
    AtqReenq,
}

pub const NR_STATS: usize = StatIdx::AtqReenq as usize + 1;

pub const STAT_IDX_ALL: [StatIdx; NR_STATS] = [
    StatIdx::Direct,
    StatIdx::Idle,
    StatIdx::Keep,
    StatIdx::DsqChange,
    StatIdx::DsqSame,
    StatIdx::EnqCpu,
    StatIdx::EnqLlc,
    StatIdx::EnqMig,
    StatIdx::SelectPick2,
    StatIdx::DispatchPick2,
    StatIdx::LlcMigration,
    StatIdx::NodeMigration,
    StatIdx::WakePrev,
    StatIdx::WakeLlc,
    StatIdx::WakeMig,
    StatIdx::AtqEnq,
    StatIdx::AtqReenq,
];

#[derive(Debug)]
pub struct StatCounters {
    counters: [AtomicU64; NR_STATS],
}

impl StatCounters {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn inc(&self, idx: StatIdx) {
        self.add(idx, 1);
    }

    #[inline]
    pub fn add(&self, idx: StatIdx, amount: u64) {
        self.counters[idx as usize].fetch_add(amount, Ordering::Relaxed);
    }

    pub fn read(&self, idx: StatIdx) -> u64 {
        self.counters[idx as usize].load(Ordering::Relaxed)
    }

    /// Drain a counter, returning the accumulated value.
    pub fn take(&self, idx: StatIdx) -> u64 {
        self.counters[idx as usize].swap(0, Ordering::Relaxed)
    }
}

impl Default for StatCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[stat_doc]
#[derive(Clone, Debug, Default, Serialize, Deserialize, Stats)]
#[serde(default)]
#[stat(top)]
pub struct Metrics {
    #[stat(desc = "Direct dispatches to a local DSQ")]
    pub direct: u64,
    #[stat(desc = "Dispatches to an idle CPU")]
    pub idle: u64,
    #[stat(desc = "Tasks kept running past their slice")]
    pub keep: u64,
    #[stat(desc = "DSQ class changes")]
    pub dsq_change: u64,
    #[stat(desc = "Stopping events that kept the DSQ class")]
    pub dsq_same: u64,
    #[stat(desc = "Enqueues to an affinitized DSQ")]
    pub enq_cpu: u64,
    #[stat(desc = "Enqueues to a LLC DSQ")]
    pub enq_llc: u64,
    #[stat(desc = "Enqueues to a migration DSQ/ATQ")]
    pub enq_mig: u64,
    #[stat(desc = "Pick-2 redirections on the wakeup path")]
    pub select_pick2: u64,
    #[stat(desc = "Pick-2 dispatches")]
    pub dispatch_pick2: u64,
    #[stat(desc = "LLC migrations")]
    pub llc_migrations: u64,
    #[stat(desc = "NUMA node migrations")]
    pub node_migrations: u64,
    #[stat(desc = "Wakeups kept on prev CPU")]
    pub wake_prev: u64,
    #[stat(desc = "Wakeups to an idle CPU in the LLC")]
    pub wake_llc: u64,
    #[stat(desc = "Wakeups migrated to the waker LLC")]
    pub wake_mig: u64,
    #[stat(desc = "ATQ enqueues")]
    pub atq_enq: u64,
    #[stat(desc = "ATQ re-enqueues after a peek/pop race or full queue")]
    pub atq_reenq: u64,
    #[stat(desc = "Smoothed CPU utilization (0-1024)")]
    pub cpu_util_avg: u64,
}

impl Metrics {
    pub fn from_counters(stats: &StatCounters, cpu_util_avg: u64) -> Self {
        Self {
            direct: stats.read(StatIdx::Direct),
            idle: stats.read(StatIdx::Idle),
            keep: stats.read(StatIdx::Keep),
            dsq_change: stats.read(StatIdx::DsqChange),
            dsq_same: stats.read(StatIdx::DsqSame),
            enq_cpu: stats.read(StatIdx::EnqCpu),
            enq_llc: stats.read(StatIdx::EnqLlc),
            enq_mig: stats.read(StatIdx::EnqMig),
            select_pick2: stats.read(StatIdx::SelectPick2),
            dispatch_pick2: stats.read(StatIdx::DispatchPick2),
            llc_migrations: stats.read(StatIdx::LlcMigration),
            node_migrations: stats.read(StatIdx::NodeMigration),
            wake_prev: stats.read(StatIdx::WakePrev),
            wake_llc: stats.read(StatIdx::WakeLlc),
            wake_mig: stats.read(StatIdx::WakeMig),
            atq_enq: stats.read(StatIdx::AtqEnq),
            atq_reenq: stats.read(StatIdx::AtqReenq),
            cpu_util_avg,
        }
    }

    fn delta(&self, prev: &Self) -> Self {
        Self {
            direct: self.direct - prev.direct,
            idle: self.idle - prev.idle,
            keep: self.keep - prev.keep,
            dsq_change: self.dsq_change - prev.dsq_change,
            dsq_same: self.dsq_same - prev.dsq_same,
            enq_cpu: self.enq_cpu - prev.enq_cpu,
            enq_llc: self.enq_llc - prev.enq_llc,
            enq_mig: self.enq_mig - prev.enq_mig,
            select_pick2: self.select_pick2 - prev.select_pick2,
            dispatch_pick2: self.dispatch_pick2 - prev.dispatch_pick2,
            llc_migrations: self.llc_migrations - prev.llc_migrations,
            node_migrations: self.node_migrations - prev.node_migrations,
            wake_prev: self.wake_prev - prev.wake_prev,
            wake_llc: self.wake_llc - prev.wake_llc,
            wake_mig: self.wake_mig - prev.wake_mig,
            atq_enq: self.atq_enq - prev.atq_enq,
            atq_reenq: self.atq_reenq - prev.atq_reenq,
            // Gauge, not a counter.
            cpu_util_avg: self.cpu_util_avg,
        }
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "[{}] util/1024 {:>4} | direct {:<5} idle {:<5} keep {:<5} wake prev/llc/mig {}/{}/{}",
            chrono::Local::now().format("%H:%M:%S"),
            self.cpu_util_avg,
            self.direct,
            self.idle,
            self.keep,
            self.wake_prev,
            self.wake_llc,
            self.wake_mig,
        )?;
        writeln!(
            w,
            "          enq cpu/llc/mig {}/{}/{} | dsq +- {}/{} | pick2 sel/disp {}/{} | mig llc/node {}/{} | atq {}/{}",
            self.enq_cpu,
            self.enq_llc,
            self.enq_mig,
            self.dsq_change,
            self.dsq_same,
            self.select_pick2,
            self.dispatch_pick2,
            self.llc_migrations,
            self.node_migrations,
            self.atq_enq,
            self.atq_reenq,
        )?;
        Ok(())
    }
}

pub fn server_data() -> StatsServerData<(), Metrics> {
    let open: Box<dyn StatsOpener<(), Metrics>> = Box::new(move |(req_ch, res_ch)| {
        req_ch.send(())?;
        let mut prev = res_ch.recv()?;

        let read: Box<dyn StatsReader<(), Metrics>> = Box::new(move |_args, (req_ch, res_ch)| {
            req_ch.send(())?;
            let cur = res_ch.recv()?;
            let delta = cur.delta(&prev);
            prev = cur;
            delta.to_json()
        });

        Ok(read)
    });

    StatsServerData::new()
        .add_meta(Metrics::meta())
        .add_ops("top", StatsOps { open, close: None })
}

pub fn monitor(intv: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut retry_cnt: u32 = 0;
    const RETRY_CNT: u32 = 5;

    while !shutdown.load(Ordering::Relaxed) {
        let mut client = match StatsClient::new().connect(None) {
            Ok(v) => v,
            Err(e) => {
                if retry_cnt >= RETRY_CNT {
                    bail!("failed to connect to stats server: {}", e);
                }
                retry_cnt += 1;
                sleep(Duration::from_secs(1));
                continue;
            }
        };
        retry_cnt = 0;

        while !shutdown.load(Ordering::Relaxed) {
            let metrics = match client.request::<Metrics>("stats", vec![]) {
                Ok(v) => v,
                Err(_) => break,
            };
            metrics.format(&mut std::io::stdout())?;
            sleep(intv);
        }
    }

    Ok(())
}
