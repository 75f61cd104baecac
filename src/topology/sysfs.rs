use std::collections::HashMap;
use std::fs;
use std::path::Path;

use super::HwThread;

pub(super) const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

/// Walks `root/cpuN` entries. Missing topology files default to 0 so a
/// partially populated sysfs still yields one entry per CPU.
pub(super) fn read_hwthreads(root: impl AsRef<Path>) -> Vec<HwThread> {
    let Ok(entries) = fs::read_dir(root.as_ref()) else {
        return Vec::new();
    };

    let mut threads = Vec::new();

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();

        let Some(id_text) = name.strip_prefix("cpu") else {
            continue;
        };
        if id_text.is_empty() || !id_text.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Ok(cpu) = id_text.parse::<i64>() else {
            continue;
        };

        let base = entry.path();
        threads.push(HwThread {
            cpu,
            smt: 0,
            core: read_i64_file(&base.join("topology/core_id")).unwrap_or(0),
            socket: read_i64_file(&base.join("topology/physical_package_id")).unwrap_or(0),
            numa: read_numa_node(&base).unwrap_or(0),
            die: read_i64_file(&base.join("topology/die_id")).unwrap_or(0),
        });
    }

    threads.sort_by_key(|t| t.cpu);
    assign_smt_ids(&mut threads);
    threads
}

/// Numbers threads sharing a (socket, core) pair in CPU order.
fn assign_smt_ids(threads: &mut [HwThread]) {
    let mut seen: HashMap<(i64, i64), i64> = HashMap::new();
    for t in threads.iter_mut() {
        let next = seen.entry((t.socket, t.core)).or_insert(0);
        t.smt = *next;
        *next += 1;
    }
}

/// The NUMA node shows up as a `nodeM` link inside the cpu directory.
fn read_numa_node(cpu_dir: &Path) -> Option<i64> {
    fs::read_dir(cpu_dir).ok()?.flatten().find_map(|e| {
        let name = e.file_name();
        let id = name.to_str()?.strip_prefix("node")?;
        id.parse::<i64>().ok()
    })
}

fn read_i64_file(path: &Path) -> Option<i64> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse::<i64>().ok()
}
