//! Read-only CPU topology queries used by expressions and aggregation
//! constants.

mod sysfs;

use std::collections::BTreeSet;

/// One hardware thread and the domains it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HwThread {
    pub cpu: i64,
    pub smt: i64,
    pub core: i64,
    pub socket: i64,
    pub numa: i64,
    pub die: i64,
}

/// Aggregate counts over the whole node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuInfo {
    pub num_hw_threads: i64,
    pub smt_width: i64,
    pub num_sockets: i64,
    pub num_dies: i64,
    pub num_cores: i64,
    pub num_numa_domains: i64,
}

/// Topology lookups over a fixed hardware thread list.
///
/// Implementors only provide [`Topology::hwthreads`]; every lookup has a
/// default built on top of it. Unknown CPUs resolve to `None` and empty
/// domain lists.
pub trait Topology: Send + Sync {
    fn hwthreads(&self) -> &[HwThread];

    fn find(&self, cpu: i64) -> Option<&HwThread> {
        self.hwthreads().iter().find(|t| t.cpu == cpu)
    }

    fn cpu_socket(&self, cpu: i64) -> Option<i64> {
        self.find(cpu).map(|t| t.socket)
    }

    fn cpu_core(&self, cpu: i64) -> Option<i64> {
        self.find(cpu).map(|t| t.core)
    }

    fn cpu_numa(&self, cpu: i64) -> Option<i64> {
        self.find(cpu).map(|t| t.numa)
    }

    fn cpu_die(&self, cpu: i64) -> Option<i64> {
        self.find(cpu).map(|t| t.die)
    }

    fn cpu_list(&self) -> Vec<i64> {
        collect_cpus(self.hwthreads(), |_| true)
    }

    fn socket_cpus(&self, socket: i64) -> Vec<i64> {
        collect_cpus(self.hwthreads(), |t| t.socket == socket)
    }

    fn numa_cpus(&self, numa: i64) -> Vec<i64> {
        collect_cpus(self.hwthreads(), |t| t.numa == numa)
    }

    fn die_cpus(&self, die: i64) -> Vec<i64> {
        collect_cpus(self.hwthreads(), |t| t.die == die)
    }

    fn core_cpus(&self, core: i64) -> Vec<i64> {
        collect_cpus(self.hwthreads(), |t| t.core == core)
    }

    fn cpu_info(&self) -> CpuInfo {
        let threads = self.hwthreads();
        let distinct = |f: fn(&HwThread) -> i64| {
            threads.iter().map(f).collect::<BTreeSet<_>>().len() as i64
        };

        CpuInfo {
            num_hw_threads: threads.len() as i64,
            smt_width: distinct(|t| t.smt),
            num_sockets: distinct(|t| t.socket),
            num_dies: distinct(|t| t.die),
            num_cores: threads
                .iter()
                .map(|t| (t.socket, t.core))
                .collect::<BTreeSet<_>>()
                .len() as i64,
            num_numa_domains: distinct(|t| t.numa),
        }
    }
}

fn collect_cpus(threads: &[HwThread], pred: impl Fn(&HwThread) -> bool) -> Vec<i64> {
    let mut cpus: Vec<i64> = threads.iter().filter(|t| pred(t)).map(|t| t.cpu).collect();
    cpus.sort_unstable();
    cpus
}

/// In-memory topology.
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    threads: Vec<HwThread>,
}

impl StaticTopology {
    pub fn new(mut threads: Vec<HwThread>) -> Self {
        threads.sort_by_key(|t| t.cpu);
        Self { threads }
    }

    /// Reads the local machine's topology from sysfs.
    pub fn from_sysfs() -> Self {
        Self::new(sysfs::read_hwthreads(sysfs::SYSFS_CPU_ROOT))
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

impl Topology for StaticTopology {
    fn hwthreads(&self) -> &[HwThread] {
        &self.threads
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two sockets, two cores per socket, SMT 2; one NUMA domain and one
    /// die per socket.
    pub(crate) fn two_socket_topology() -> StaticTopology {
        let mut threads = Vec::new();
        for cpu in 0..8 {
            let socket = cpu / 4;
            threads.push(HwThread {
                cpu,
                smt: (cpu % 4) / 2,
                core: socket * 2 + cpu % 2,
                socket,
                numa: socket,
                die: socket,
            });
        }
        StaticTopology::new(threads)
    }

    #[test]
    fn test_lookups() {
        let topo = two_socket_topology();
        assert_eq!(topo.cpu_socket(5), Some(1));
        assert_eq!(topo.cpu_core(5), Some(3));
        assert_eq!(topo.cpu_numa(2), Some(0));
        assert_eq!(topo.cpu_die(7), Some(1));
        assert_eq!(topo.cpu_socket(99), None);
    }

    #[test]
    fn test_domain_lists() {
        let topo = two_socket_topology();
        assert_eq!(topo.cpu_list(), (0..8).collect::<Vec<_>>());
        assert_eq!(topo.socket_cpus(1), vec![4, 5, 6, 7]);
        assert_eq!(topo.numa_cpus(0), vec![0, 1, 2, 3]);
        assert_eq!(topo.core_cpus(1), vec![1, 3]);
        assert!(topo.die_cpus(9).is_empty());
    }

    #[test]
    fn test_cpu_info() {
        let info = two_socket_topology().cpu_info();
        assert_eq!(
            info,
            CpuInfo {
                num_hw_threads: 8,
                smt_width: 2,
                num_sockets: 2,
                num_dies: 2,
                num_cores: 4,
                num_numa_domains: 2,
            }
        );
    }

    #[test]
    fn test_empty_topology() {
        let topo = StaticTopology::default();
        assert!(topo.is_empty());
        assert_eq!(topo.cpu_info(), CpuInfo::default());
    }
}
