// NUMA topology discovery via sysfs. The allocators bind regions with
// mbind(2); validation and the single-node fast path both need the online
// node set.

use std::fs;

const ONLINE_NODES_PATH: &str = "/sys/devices/system/node/online";

/// The set of online NUMA node ids, or an empty vector when the sysfs
/// hierarchy is unreadable (non-Linux or heavily sandboxed hosts).
pub fn online_nodes() -> Vec<u32> {
    match fs::read_to_string(ONLINE_NODES_PATH) {
        Ok(text) => parse_node_list(text.trim()),
        Err(_) => Vec::new(),
    }
}

/// True when the host has more than one online node; binding is a no-op
/// otherwise.
pub fn is_multi_node() -> bool {
    online_nodes().len() > 1
}

/// Parse the kernel's node-list syntax: comma-separated ids and inclusive
/// ranges, e.g. `0-1,4`.
fn parse_node_list(text: &str) -> Vec<u32> {
    let mut nodes = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                    nodes.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(id) = part.parse::<u32>() {
                    nodes.push(id);
                }
            }
        }
    }
    nodes
}
