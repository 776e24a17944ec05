// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;
use scx_stats::prelude::*;

use scx_duoq::sim::SimHost;
use scx_duoq::sim::Simulation;
use scx_duoq::stats;
use scx_duoq::Scheduler;
use scx_duoq::SchedulerOpts;
use scx_duoq::TOPO;

/// scx_duoq: a pick two load balancing scheduler.
///
/// The scheduler core runs against whatever host embeds it; this binary
/// drives it with the bundled deterministic simulator on the detected
/// machine topology, which is useful for tuning slice and load balancer
/// parameters and for watching the scheduler's counters.
#[derive(Debug, Parser)]
struct Args {
    /// Enable verbose output, including scheduler tracing. Specify multiple
    /// times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable stats monitoring with the specified interval.
    #[clap(long)]
    stats: Option<f64>,

    /// Run in stats monitoring mode with the specified interval, the
    /// scheduler is not launched.
    #[clap(long)]
    monitor: Option<f64>,

    /// Number of synthetic tasks to simulate.
    #[clap(long, default_value = "64")]
    sim_tasks: usize,

    /// Simulated duration in virtual seconds.
    #[clap(long, default_value = "60")]
    sim_duration_secs: u64,

    #[command(flatten)]
    sched: SchedulerOpts,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let llv = match args.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    simplelog::TermLogger::init(
        llv,
        simplelog::ConfigBuilder::new()
            .set_time_level(simplelog::LevelFilter::Error)
            .set_location_level(simplelog::LevelFilter::Off)
            .set_target_level(simplelog::LevelFilter::Off)
            .set_thread_level(simplelog::LevelFilter::Off)
            .build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })?;

    if let Some(intv) = args.monitor {
        return stats::monitor(Duration::from_secs_f64(intv), shutdown);
    }

    let topo = &*TOPO;
    let cfg = args.sched.to_config(topo)?;
    let host = Arc::new(SimHost::new(topo));
    let sched = Arc::new(Scheduler::init(host.clone(), topo, cfg)?);

    let stats_server = StatsServer::new(stats::server_data()).launch()?;
    let (res_ch, req_ch) = stats_server.channels();

    let stats_thread = args.stats.map(|intv| {
        let shutdown_copy = shutdown.clone();
        std::thread::spawn(move || {
            let _ = stats::monitor(Duration::from_secs_f64(intv), shutdown_copy);
        })
    });

    let mut sim = Simulation::new(host.clone(), sched.clone(), topo, args.sim_tasks)?;
    let started_at = chrono::Local::now();
    info!(
        "scx_duoq starting: {} tasks on {} CPUs / {} LLCs",
        args.sim_tasks,
        topo.nr_cpus(),
        topo.nr_llcs()
    );

    let end = sim.now() + args.sim_duration_secs * 1_000_000_000;
    while !shutdown.load(Ordering::Relaxed) && sim.now() < end {
        sim.run_for(10_000_000);
        if req_ch.try_recv().is_ok() {
            res_ch.send(sched.metrics())?;
        }
    }

    sched.exit("simulation complete");
    shutdown.store(true, Ordering::Relaxed);
    if let Some(thread) = stats_thread {
        let _ = thread.join();
    }

    let metrics = sched.metrics();
    metrics.format(&mut std::io::stdout())?;
    for error in host.errors() {
        log::warn!("host error: {}", error);
    }
    info!(
        "simulated {}s in {}",
        args.sim_duration_secs,
        chrono::Local::now()
            .signed_duration_since(started_at)
            .num_milliseconds() as f64
            / 1000.0
    );

    Ok(())
}
