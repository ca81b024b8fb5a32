//! Host inventory queries.
//!
//! CPU, memory and disk information served to cluster managers so they
//! can place and size node processes.

use sysinfo::System;

use crate::error::Result;

/// One logical CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    pub cpu_id: u32,
    pub numa_node_id: u32,
    pub core_id: u32,
}

/// CPU topology of this host.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    pub num_cpus: u32,
    pub num_numa_nodes: u32,
    pub cpus_per_core: u32,
    pub cpus: Vec<CpuInfo>,
}

/// Memory of one NUMA node.
#[derive(Debug, Clone, Copy)]
pub struct MemNode {
    pub numa_node_id: u32,
    pub megabytes: u64,
}

/// Memory layout of this host.
#[derive(Debug, Clone)]
pub struct MemTopology {
    pub total_megabytes: u64,
    pub nodes: Vec<MemNode>,
}

/// Inspect the CPU topology. `None` when nothing can be discovered.
pub fn cpu_topology() -> Option<CpuTopology> {
    let sys = System::new_all();
    let num_cpus = sys.cpus().len() as u32;
    if num_cpus == 0 {
        return None;
    }
    let physical = sys
        .physical_core_count()
        .map(|c| c as u32)
        .filter(|&c| c > 0)
        .unwrap_or(num_cpus);
    let cpus_per_core = (num_cpus / physical).max(1);
    let cpus = (0..num_cpus)
        .map(|cpu_id| CpuInfo {
            cpu_id,
            numa_node_id: 0,
            core_id: cpu_id / cpus_per_core,
        })
        .collect();
    Some(CpuTopology {
        num_cpus,
        num_numa_nodes: 1,
        cpus_per_core,
        cpus,
    })
}

/// Inspect the memory layout. `None` when nothing can be discovered.
pub fn mem_topology() -> Option<MemTopology> {
    let sys = System::new_all();
    let total = sys.total_memory();
    if total == 0 {
        return None;
    }
    let megabytes = total / (1024 * 1024);
    Some(MemTopology {
        total_megabytes: megabytes,
        nodes: vec![MemNode {
            numa_node_id: 0,
            megabytes,
        }],
    })
}

/// Free disk space below `dir` in bytes. `None` when the directory
/// cannot be probed; the caller must not reveal why, so that peers
/// cannot test for the existence of arbitrary paths.
pub fn disk_free_bytes(dir: &str) -> Option<u64> {
    let stat = nix::sys::statvfs::statvfs(dir).ok()?;
    let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    if free == 0 {
        return None;
    }
    Some(free)
}

/// Probe result preserving no information about the failure.
pub fn disk_info(dir: &str) -> Result<Option<u64>> {
    Ok(disk_free_bytes(dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_topology_sane() {
        let topo = cpu_topology().expect("host has cpus");
        assert!(topo.num_cpus >= 1);
        assert_eq!(topo.cpus.len(), topo.num_cpus as usize);
        assert!(topo.cpus_per_core >= 1);
        for cpu in &topo.cpus {
            assert!(cpu.numa_node_id < topo.num_numa_nodes);
        }
    }

    #[test]
    fn test_mem_topology_sane() {
        let topo = mem_topology().expect("host has memory");
        assert!(topo.total_megabytes > 0);
        let sum: u64 = topo.nodes.iter().map(|n| n.megabytes).sum();
        assert_eq!(sum, topo.total_megabytes);
    }

    #[test]
    fn test_disk_info_existing_and_absent() {
        assert!(disk_free_bytes("/tmp").is_some());
        // absent and forbidden both collapse to "no info"
        assert!(disk_free_bytes("/no/such/directory/here").is_none());
    }
}
