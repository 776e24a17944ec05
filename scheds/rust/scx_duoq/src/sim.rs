// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Deterministic in-process host. `SimHost` implements the full outbound
//! contract on virtual time: FIFO/vtime DSQs, per-CPU local queues, an idle
//! mask model, manual timers and a seedable PRNG. `Simulation` drives a
//! synthetic workload through the callback surface; the integration tests
//! script the host directly.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::bail;
use anyhow::Result;
use log::debug;

use duoq_arena::Cpumask;
use duoq_arena::Topology;

use crate::host;
use crate::host::Host;
use crate::host::QueuedTask;
use crate::host::Task;
use crate::host::TimerKind;
use crate::sched::Scheduler;
use crate::types::TaskCtx;

#[derive(Clone, Copy, Debug)]
pub struct SimQueued {
    pub pid: i32,
    pub slice_ns: u64,
    pub vtime: Option<u64>,
    pub enq_flags: u64,
}

#[derive(Default)]
struct Dsq {
    entries: Vec<SimQueued>,
}

impl Dsq {
    fn insert_fifo(&mut self, entry: SimQueued) {
        self.entries.push(entry);
    }

    fn insert_vtime(&mut self, entry: SimQueued) {
        let vtime = entry.vtime.unwrap_or(0);
        let pos = self
            .entries
            .iter()
            .position(|other| other.vtime.unwrap_or(0) > vtime)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
    }

    fn pop(&mut self) -> Option<SimQueued> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }
}

fn local_cpu_of(dsq_id: u64) -> Option<usize> {
    (dsq_id & host::DSQ_LOCAL_ON == host::DSQ_LOCAL_ON)
        .then_some((dsq_id & 0x3fff_ffff) as usize)
}

pub struct SimHost {
    nr_cpu_ids: usize,
    smt_siblings: Vec<Option<usize>>,
    now: AtomicU64,
    rng: Mutex<u64>,
    forced_random: Mutex<VecDeque<u32>>,
    dsqs: Mutex<HashMap<u64, Dsq>>,
    locals: Mutex<Vec<Dsq>>,
    idle: Mutex<Cpumask>,
    kicks: Mutex<Vec<(usize, u64)>>,
    errors: Mutex<Vec<String>>,
    timers: Mutex<Vec<(TimerKind, u64)>>,
    reenqueued: Mutex<Vec<usize>>,
}

impl SimHost {
    pub fn new(topo: &Topology) -> Self {
        let nr_cpu_ids = topo.nr_cpu_ids;
        let mut smt_siblings = vec![None; nr_cpu_ids];
        for cpu in topo.all_cpus.values() {
            smt_siblings[cpu.id] = cpu.smt_sibling;
        }
        Self {
            nr_cpu_ids,
            smt_siblings,
            now: AtomicU64::new(1),
            rng: Mutex::new(0x9e3779b97f4a7c15),
            forced_random: Mutex::new(VecDeque::new()),
            dsqs: Mutex::new(HashMap::new()),
            locals: Mutex::new((0..nr_cpu_ids).map(|_| Dsq::default()).collect()),
            idle: Mutex::new(Cpumask::new(nr_cpu_ids)),
            kicks: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
            reenqueued: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, delta_ns: u64) {
        self.now.fetch_add(delta_ns, Ordering::Relaxed);
    }

    pub fn set_idle(&self, cpu: usize, idle: bool) {
        let mut mask = self.idle.lock().unwrap();
        if idle {
            let _ = mask.set_cpu(cpu);
        } else {
            let _ = mask.clear_cpu(cpu);
        }
    }

    pub fn cpu_idle(&self, cpu: usize) -> bool {
        self.idle.lock().unwrap().test_cpu(cpu)
    }

    pub fn set_all_idle(&self, idle: bool) {
        for cpu in 0..self.nr_cpu_ids {
            self.set_idle(cpu, idle);
        }
    }

    /// Force the next `prandom_u32` results, then fall back to xorshift.
    pub fn push_random(&self, values: &[u32]) {
        self.forced_random.lock().unwrap().extend(values);
    }

    pub fn local_queue(&self, cpu: usize) -> Vec<i32> {
        self.locals.lock().unwrap()[cpu]
            .entries
            .iter()
            .map(|e| e.pid)
            .collect()
    }

    pub fn take_local(&self, cpu: usize) -> Option<SimQueued> {
        self.locals.lock().unwrap()[cpu].pop()
    }

    pub fn dsq_pids(&self, dsq_id: u64) -> Vec<i32> {
        self.dsqs
            .lock()
            .unwrap()
            .get(&dsq_id)
            .map(|dsq| dsq.entries.iter().map(|e| e.pid).collect())
            .unwrap_or_default()
    }

    pub fn kicks(&self) -> Vec<(usize, u64)> {
        self.kicks.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    pub fn reenqueued_cpus(&self) -> Vec<usize> {
        self.reenqueued.lock().unwrap().clone()
    }

    /// Remove and return timers whose deadline has passed.
    pub fn due_timers(&self) -> Vec<TimerKind> {
        let now = self.now.load(Ordering::Relaxed);
        let mut timers = self.timers.lock().unwrap();
        let due: Vec<TimerKind> = timers
            .iter()
            .filter(|(_, deadline)| *deadline <= now)
            .map(|(kind, _)| *kind)
            .collect();
        timers.retain(|(_, deadline)| *deadline > now);
        due
    }

    fn insert(&self, dsq_id: u64, entry: SimQueued, vtime_order: bool) {
        if let Some(cpu) = local_cpu_of(dsq_id) {
            let mut locals = self.locals.lock().unwrap();
            if cpu < locals.len() {
                locals[cpu].insert_fifo(entry);
            }
            return;
        }
        let mut dsqs = self.dsqs.lock().unwrap();
        let dsq = dsqs.entry(dsq_id).or_default();
        if vtime_order {
            dsq.insert_vtime(entry);
        } else {
            dsq.insert_fifo(entry);
        }
    }
}

impl Host for SimHost {
    fn now(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    fn prandom_u32(&self) -> u32 {
        if let Some(forced) = self.forced_random.lock().unwrap().pop_front() {
            return forced;
        }
        let mut state = self.rng.lock().unwrap();
        let mut x = *state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        *state = x;
        (x >> 32) as u32
    }

    fn nr_cpu_ids(&self) -> usize {
        self.nr_cpu_ids
    }

    fn dsq_create(&self, dsq_id: u64, _node_id: usize) -> Result<()> {
        let mut dsqs = self.dsqs.lock().unwrap();
        if dsqs.contains_key(&dsq_id) {
            bail!("DSQ {} already exists", dsq_id);
        }
        dsqs.insert(dsq_id, Dsq::default());
        Ok(())
    }

    fn dsq_insert(&self, pid: i32, dsq_id: u64, slice_ns: u64, enq_flags: u64) {
        let entry = SimQueued {
            pid,
            slice_ns,
            vtime: None,
            enq_flags,
        };
        self.insert(dsq_id, entry, false);
    }

    fn dsq_insert_vtime(&self, pid: i32, dsq_id: u64, slice_ns: u64, vtime: u64, enq_flags: u64) {
        let entry = SimQueued {
            pid,
            slice_ns,
            vtime: Some(vtime),
            enq_flags,
        };
        self.insert(dsq_id, entry, true);
    }

    fn dsq_move_to_local(&self, cpu: usize, dsq_id: u64) -> bool {
        let entry = {
            let mut dsqs = self.dsqs.lock().unwrap();
            match dsqs.get_mut(&dsq_id) {
                Some(dsq) => dsq.pop(),
                None => None,
            }
        };
        match entry {
            Some(entry) => {
                let mut locals = self.locals.lock().unwrap();
                if cpu < locals.len() {
                    locals[cpu].insert_fifo(entry);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    fn dsq_peek(&self, dsq_id: u64) -> Option<QueuedTask> {
        self.dsqs
            .lock()
            .unwrap()
            .get(&dsq_id)
            .and_then(|dsq| dsq.entries.first())
            .map(|entry| QueuedTask {
                pid: entry.pid,
                vtime: entry.vtime.unwrap_or(0),
            })
    }

    fn dsq_nr_queued(&self, dsq_id: u64) -> u64 {
        if let Some(cpu) = local_cpu_of(dsq_id) {
            let locals = self.locals.lock().unwrap();
            return locals.get(cpu).map(|l| l.entries.len()).unwrap_or(0) as u64;
        }
        self.dsqs
            .lock()
            .unwrap()
            .get(&dsq_id)
            .map(|dsq| dsq.entries.len())
            .unwrap_or(0) as u64
    }

    fn test_and_clear_cpu_idle(&self, cpu: usize) -> bool {
        let mut mask = self.idle.lock().unwrap();
        if mask.test_cpu(cpu) {
            let _ = mask.clear_cpu(cpu);
            true
        } else {
            false
        }
    }

    fn idle_cpumask(&self) -> Cpumask {
        self.idle.lock().unwrap().clone()
    }

    fn idle_smtmask(&self) -> Cpumask {
        let mask = self.idle.lock().unwrap();
        let mut smt = Cpumask::new(self.nr_cpu_ids);
        for cpu in 0..self.nr_cpu_ids {
            if !mask.test_cpu(cpu) {
                continue;
            }
            let core_idle = match self.smt_siblings[cpu] {
                Some(sib) => mask.test_cpu(sib),
                None => true,
            };
            if core_idle {
                let _ = smt.set_cpu(cpu);
            }
        }
        smt
    }

    fn kick_cpu(&self, cpu: usize, flags: u64) {
        self.kicks.lock().unwrap().push((cpu, flags));
    }

    fn cpuperf_set(&self, _cpu: usize, _perf: u32) {}

    fn timer_arm(&self, timer: TimerKind, delay_ns: u64) -> Result<()> {
        let deadline = self.now.load(Ordering::Relaxed) + delay_ns;
        self.timers.lock().unwrap().push((timer, deadline));
        Ok(())
    }

    fn reenqueue_local(&self, cpu: usize) {
        self.reenqueued.lock().unwrap().push(cpu);
    }

    fn report_error(&self, msg: &str) {
        self.errors.lock().unwrap().push(msg.to_string());
    }
}

enum SimState {
    Sleeping { until: u64 },
    Queued,
    Running { until: u64, burst_left: u64 },
}

struct SimTask {
    task: Task,
    taskc: TaskCtx,
    state: SimState,
    /// Burst length when woken; short bursts model interactive tasks.
    burst_ns: u64,
    think_ns: u64,
}

/// Synthetic workload driver for the binary: a mix of short burst and
/// batch tasks run on virtual time against a `SimHost`.
pub struct Simulation {
    host: Arc<SimHost>,
    sched: Arc<Scheduler<SimHost>>,
    tasks: HashMap<i32, SimTask>,
    tick_ns: u64,
    current: Vec<Option<i32>>,
}

impl Simulation {
    pub fn new(
        host: Arc<SimHost>,
        sched: Arc<Scheduler<SimHost>>,
        topo: &Topology,
        nr_tasks: usize,
    ) -> Result<Self> {
        let nr_cpus = topo.nr_cpu_ids;
        host.set_all_idle(true);
        for cpu in 0..nr_cpus {
            sched.update_idle(cpu, true);
        }

        let mut tasks = HashMap::new();
        for i in 0..nr_tasks {
            let pid = 1000 + i as i32;
            let mut allowed = Cpumask::new(nr_cpus);
            allowed.set_all();
            let mut task = Task {
                pid,
                cpu: i % nr_cpus,
                weight: 100,
                is_kthread: false,
                nr_cpus_allowed: nr_cpus,
                cpus_allowed: allowed,
                dsq_vtime: 0,
                slice_ns: 0,
                queued: false,
            };
            let taskc = sched.init_task(&mut task)?;
            // Even pids are short burst wakers, odd pids run long batches.
            let (burst_ns, think_ns) = if pid % 2 == 0 {
                (50_000, 400_000)
            } else {
                (3_000_000, 100_000)
            };
            tasks.insert(
                pid,
                SimTask {
                    task,
                    taskc,
                    state: SimState::Sleeping {
                        until: host.now() + (pid as u64 % 7) * 10_000,
                    },
                    burst_ns,
                    think_ns,
                },
            );
        }

        Ok(Self {
            host,
            sched,
            tasks,
            tick_ns: 25_000,
            current: vec![None; nr_cpus],
        })
    }

    /// Advance virtual time by one tick, waking, dispatching and stopping
    /// tasks as their deadlines pass.
    pub fn step(&mut self) {
        self.host.advance(self.tick_ns);
        let now = self.host.now();

        for kind in self.host.due_timers() {
            if let Some(next) = self.sched.timer_expired(kind) {
                let _ = self.host.timer_arm(kind, next);
            }
        }

        // Wake sleepers.
        let pids: Vec<i32> = self.tasks.keys().copied().collect();
        for pid in &pids {
            let entry = self.tasks.get_mut(pid).unwrap();
            if let SimState::Sleeping { until } = entry.state {
                if until <= now {
                    let prev_cpu = entry.task.cpu;
                    let cpu = self.sched.select_cpu(
                        &mut entry.task,
                        &mut entry.taskc,
                        prev_cpu,
                        0,
                        None,
                    );
                    entry.task.cpu = cpu;
                    if !self.host.local_queue(cpu).contains(pid) {
                        self.sched.enqueue(
                            &mut entry.task,
                            &mut entry.taskc,
                            host::ENQ_WAKEUP | host::ENQ_CPU_SELECTED,
                        );
                    }
                    entry.state = SimState::Queued;
                }
            }
        }

        // Finish running tasks whose slice or burst expired.
        for cpu in 0..self.current.len() {
            let Some(pid) = self.current[cpu] else {
                continue;
            };
            let entry = self.tasks.get_mut(&pid).unwrap();
            let SimState::Running { until, burst_left } = entry.state else {
                continue;
            };
            if until > now {
                continue;
            }

            let ran = entry.task.slice_ns.min(burst_left);
            let burst_left = burst_left.saturating_sub(ran);
            let runnable = burst_left > 0;
            self.sched
                .stopping(&mut entry.task, &mut entry.taskc, runnable);
            self.current[cpu] = None;
            if runnable {
                entry.state = SimState::Queued;
                entry.task.cpu = cpu;
                self.sched.enqueue(&mut entry.task, &mut entry.taskc, 0);
            } else {
                entry.state = SimState::Sleeping {
                    until: now + entry.think_ns,
                };
            }
        }

        // Fill idle CPUs from their local queues, dispatching when dry.
        for cpu in 0..self.current.len() {
            if self.current[cpu].is_some() {
                continue;
            }

            if self.host.local_queue(cpu).is_empty() {
                self.sched.dispatch(cpu, None);
            }

            match self.host.take_local(cpu) {
                Some(queued) => {
                    self.host.set_idle(cpu, false);
                    self.sched.update_idle(cpu, false);
                    let entry = self.tasks.get_mut(&queued.pid).unwrap();
                    entry.task.cpu = cpu;
                    entry.task.slice_ns = queued.slice_ns;
                    self.sched.running(&entry.task, &mut entry.taskc);
                    let burst_left = entry.burst_ns;
                    entry.state = SimState::Running {
                        until: now + queued.slice_ns.min(burst_left),
                        burst_left,
                    };
                    self.current[cpu] = Some(queued.pid);
                }
                None => {
                    if !self.host.cpu_idle(cpu) {
                        self.host.set_idle(cpu, true);
                        self.sched.update_idle(cpu, true);
                    }
                }
            }
        }
    }

    pub fn run_for(&mut self, duration_ns: u64) {
        let end = self.host.now() + duration_ns;
        while self.host.now() < end {
            self.step();
        }
        debug!("simulation advanced to {}", self.host.now());
    }

    pub fn now(&self) -> u64 {
        self.host.now()
    }
}
