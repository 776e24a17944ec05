// SPDX-License-Identifier: GPL-2.0
//
// Four level topology model: system -> NUMA node -> LLC -> CPU. Built once
// at init and immutable afterwards. LLC and node ids are dense so contexts
// can live in flat arrays indexed by id.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use log::debug;
use log::warn;
use serde::Deserialize;
use serde::Serialize;
use sscanf::sscanf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreType {
    Big { turbo: bool },
    Little,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopoCpu {
    pub id: usize,
    pub core_id: usize,
    pub llc_id: usize,
    pub node_id: usize,
    /// The other hardware thread of this core, when SMT is enabled.
    pub smt_sibling: Option<usize>,
    pub core_type: CoreType,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopoLlc {
    pub id: usize,
    pub node_id: usize,
    pub cpus: Vec<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopoNode {
    pub id: usize,
    pub llcs: Vec<usize>,
    pub cpus: Vec<usize>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Topology {
    pub all_cpus: BTreeMap<usize, TopoCpu>,
    pub all_llcs: BTreeMap<usize, TopoLlc>,
    pub nodes: BTreeMap<usize, TopoNode>,
    pub smt_enabled: bool,
    /// One past the largest online CPU id; sizes every per-CPU array.
    pub nr_cpu_ids: usize,
}

impl Topology {
    /// Build the tree bottom-up from per-CPU records, enforcing the init
    /// time invariants: unique CPU ids, dense LLC/node ids, and a single
    /// owning node per LLC.
    pub fn from_cpus(cpus: Vec<TopoCpu>) -> Result<Self> {
        if cpus.is_empty() {
            bail!("topology has no CPUs");
        }

        let mut all_cpus: BTreeMap<usize, TopoCpu> = BTreeMap::new();
        let mut all_llcs: BTreeMap<usize, TopoLlc> = BTreeMap::new();
        let mut nodes: BTreeMap<usize, TopoNode> = BTreeMap::new();

        for cpu in cpus {
            if all_cpus.contains_key(&cpu.id) {
                bail!("duplicate CPU id {}", cpu.id);
            }

            let llc = all_llcs.entry(cpu.llc_id).or_insert_with(|| TopoLlc {
                id: cpu.llc_id,
                node_id: cpu.node_id,
                cpus: Vec::new(),
            });
            if llc.node_id != cpu.node_id {
                bail!(
                    "LLC {} spans nodes {} and {}",
                    cpu.llc_id,
                    llc.node_id,
                    cpu.node_id
                );
            }
            llc.cpus.push(cpu.id);

            let node = nodes.entry(cpu.node_id).or_insert_with(|| TopoNode {
                id: cpu.node_id,
                llcs: Vec::new(),
                cpus: Vec::new(),
            });
            node.cpus.push(cpu.id);
            if !node.llcs.contains(&cpu.llc_id) {
                node.llcs.push(cpu.llc_id);
            }

            all_cpus.insert(cpu.id, cpu);
        }

        for (want, (have, _)) in all_llcs.iter().enumerate() {
            if want != *have {
                bail!("LLC ids are not dense, missing {}", want);
            }
        }
        for (want, (have, _)) in nodes.iter().enumerate() {
            if want != *have {
                bail!("node ids are not dense, missing {}", want);
            }
        }

        for cpu in all_cpus.values() {
            if let Some(sib) = cpu.smt_sibling {
                if !all_cpus.contains_key(&sib) {
                    bail!("CPU {} has unknown SMT sibling {}", cpu.id, sib);
                }
            }
        }

        let smt_enabled = all_cpus.values().any(|c| c.smt_sibling.is_some());
        let nr_cpu_ids = all_cpus.keys().max().unwrap() + 1;

        Ok(Self {
            all_cpus,
            all_llcs,
            nodes,
            smt_enabled,
            nr_cpu_ids,
        })
    }

    /// Discover the topology of the running system from sysfs.
    pub fn new() -> Result<Self> {
        let node_of_cpu = read_node_map()?;

        struct RawCpu {
            id: usize,
            core_id: usize,
            llc_kernel_id: usize,
            node_kernel_id: usize,
            smt_sibling: Option<usize>,
            capacity: Option<usize>,
            turbo: bool,
        }

        let mut raw: Vec<RawCpu> = Vec::new();
        for entry in
            glob("/sys/devices/system/cpu/cpu[0-9]*").context("failed to glob cpu directories")?
        {
            let path = entry?;
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow!("invalid cpu directory {:?}", path))?;
            let id = match sscanf!(name, "cpu{usize}") {
                Ok(id) => id,
                Err(_) => continue,
            };

            // cpu0 has no online file and is always online.
            let online = path.join("online");
            if online.exists() && read_file_usize(&online).unwrap_or(1) == 0 {
                debug!("CPU[{}] offline, skipping", id);
                continue;
            }

            let core_id = read_file_usize(&path.join("topology/core_id")).unwrap_or(id);
            let llc_kernel_id = read_file_usize(&path.join("cache/index3/id"))
                .or_else(|_| read_file_usize(&path.join("cache/index2/id")))
                .unwrap_or(0);
            let node_kernel_id = node_of_cpu.get(&id).copied().unwrap_or(0);

            let smt_sibling = fs::read_to_string(path.join("topology/thread_siblings_list"))
                .ok()
                .and_then(|s| parse_cpulist(s.trim()).ok())
                .and_then(|sibs| sibs.into_iter().find(|&s| s != id));

            let capacity = read_file_usize(&path.join("cpu_capacity")).ok();
            let base_freq = read_file_usize(&path.join("cpufreq/base_frequency")).unwrap_or(0);
            let max_freq = read_file_usize(&path.join("cpufreq/cpuinfo_max_freq")).unwrap_or(0);
            let turbo = base_freq > 0 && max_freq > base_freq;

            raw.push(RawCpu {
                id,
                core_id,
                llc_kernel_id,
                node_kernel_id,
                smt_sibling,
                capacity,
                turbo,
            });
        }

        if raw.is_empty() {
            bail!("no online CPUs found in sysfs");
        }

        let max_capacity = raw.iter().filter_map(|c| c.capacity).max();

        // An offline sibling is no sibling.
        let online: Vec<usize> = raw.iter().map(|c| c.id).collect();
        for cpu in raw.iter_mut() {
            if let Some(sib) = cpu.smt_sibling {
                if !online.contains(&sib) {
                    cpu.smt_sibling = None;
                }
            }
        }

        let mut llc_ids: Vec<usize> = raw.iter().map(|c| c.llc_kernel_id).collect();
        llc_ids.sort_unstable();
        llc_ids.dedup();
        let mut node_ids: Vec<usize> = raw.iter().map(|c| c.node_kernel_id).collect();
        node_ids.sort_unstable();
        node_ids.dedup();

        let cpus = raw
            .into_iter()
            .map(|c| {
                let core_type = match (c.capacity, max_capacity) {
                    (Some(cap), Some(max)) if cap < max => CoreType::Little,
                    _ => CoreType::Big { turbo: c.turbo },
                };
                TopoCpu {
                    id: c.id,
                    core_id: c.core_id,
                    llc_id: llc_ids.binary_search(&c.llc_kernel_id).unwrap(),
                    node_id: node_ids.binary_search(&c.node_kernel_id).unwrap(),
                    smt_sibling: c.smt_sibling,
                    core_type,
                }
            })
            .collect();

        Self::from_cpus(cpus)
    }

    pub fn nr_cpus(&self) -> usize {
        self.all_cpus.len()
    }

    pub fn nr_llcs(&self) -> usize {
        self.all_llcs.len()
    }

    pub fn nr_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn has_little_cores(&self) -> bool {
        self.all_cpus
            .values()
            .any(|c| c.core_type == CoreType::Little)
    }
}

fn read_file_usize(path: &Path) -> Result<usize> {
    let content = fs::read_to_string(path)?;
    content
        .trim()
        .parse::<usize>()
        .with_context(|| format!("failed to parse {:?}", path))
}

/// Map cpu id -> NUMA node kernel id from /sys/devices/system/node.
fn read_node_map() -> Result<BTreeMap<usize, usize>> {
    let mut map = BTreeMap::new();
    let entries = match glob("/sys/devices/system/node/node[0-9]*") {
        Ok(entries) => entries,
        Err(e) => {
            warn!("failed to glob node directories: {}", e);
            return Ok(map);
        }
    };
    for entry in entries {
        let path = entry?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("invalid node directory {:?}", path))?;
        let node_id = match sscanf!(name, "node{usize}") {
            Ok(id) => id,
            Err(_) => continue,
        };
        let cpulist = match fs::read_to_string(path.join("cpulist")) {
            Ok(s) => s,
            Err(_) => continue,
        };
        for cpu in parse_cpulist(cpulist.trim())? {
            map.insert(cpu, node_id);
        }
    }
    Ok(map)
}

/// Parse a kernel cpulist such as "0-3,8,10-11".
pub fn parse_cpulist(list: &str) -> Result<Vec<usize>> {
    let mut cpus = Vec::new();
    for token in list.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.split_once('-') {
            Some((start, end)) => {
                let start: usize = start.trim().parse().context("invalid cpulist range")?;
                let end: usize = end.trim().parse().context("invalid cpulist range")?;
                if start > end {
                    bail!("invalid cpulist range {}", token);
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(token.parse().context("invalid cpulist entry")?),
        }
    }
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(id: usize, core: usize, llc: usize, node: usize, sib: Option<usize>) -> TopoCpu {
        TopoCpu {
            id,
            core_id: core,
            llc_id: llc,
            node_id: node,
            smt_sibling: sib,
            core_type: CoreType::Big { turbo: false },
        }
    }

    #[test]
    fn test_from_cpus() {
        let topo = Topology::from_cpus(vec![
            cpu(0, 0, 0, 0, Some(1)),
            cpu(1, 0, 0, 0, Some(0)),
            cpu(2, 1, 1, 0, Some(3)),
            cpu(3, 1, 1, 0, Some(2)),
        ])
        .unwrap();
        assert_eq!(topo.nr_cpus(), 4);
        assert_eq!(topo.nr_llcs(), 2);
        assert_eq!(topo.nr_nodes(), 1);
        assert!(topo.smt_enabled);
        assert_eq!(topo.nr_cpu_ids, 4);
        assert_eq!(topo.all_llcs[&1].cpus, vec![2, 3]);
        assert_eq!(topo.nodes[&0].llcs, vec![0, 1]);

        // Topology consistency: node(llc(c)) == node(c) and the CPU is in
        // its LLC's span.
        for c in topo.all_cpus.values() {
            let llc = &topo.all_llcs[&c.llc_id];
            assert_eq!(llc.node_id, c.node_id);
            assert!(llc.cpus.contains(&c.id));
            assert!(topo.nodes[&c.node_id].cpus.contains(&c.id));
        }
    }

    #[test]
    fn test_rejects_duplicate_cpu() {
        let err = Topology::from_cpus(vec![cpu(0, 0, 0, 0, None), cpu(0, 0, 0, 0, None)]);
        assert!(err.is_err());
    }

    #[test]
    fn test_rejects_llc_spanning_nodes() {
        let err = Topology::from_cpus(vec![cpu(0, 0, 0, 0, None), cpu(1, 1, 0, 1, None)]);
        assert!(err.is_err());
    }

    #[test]
    fn test_rejects_sparse_llc_ids() {
        let err = Topology::from_cpus(vec![cpu(0, 0, 0, 0, None), cpu(1, 1, 2, 0, None)]);
        assert!(err.is_err());
    }

    #[test]
    fn test_parse_cpulist() {
        assert_eq!(parse_cpulist("0-3,8,10-11").unwrap(), vec![0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(parse_cpulist("4").unwrap(), vec![4]);
        assert!(parse_cpulist("3-1").is_err());
        assert!(parse_cpulist("a").is_err());
    }
}
