//! Processor topology and the steal-victim policy.
//!
//! At startup the scheduler probes the machine for NUMA nodes (Linux sysfs;
//! everything else degrades to a single synthetic node), maps every worker
//! onto one node, and pins worker threads near their node's processors.
//! Thieves then pick victims with a three-tier rule driven by a per-worker
//! xorshift32 generator: mostly steal inside the node, sometimes from the
//! remote node with the best estimated bandwidth, rarely from anywhere
//! else. Topology tables are written once at init and read-only afterwards.

use std::collections::hash_map::DefaultHasher;
#[cfg(target_os = "linux")]
use std::fs;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// [xorshift32] is a fast pseudorandom generator which tolerates weak
/// seeding, as long as the seed is not zero.
///
/// [xorshift32]: https://en.wikipedia.org/wiki/Xorshift
pub(crate) struct XorShift32 {
    state: AtomicU32,
}

impl XorShift32 {
    pub fn new() -> Self {
        // Any non-zero seed will do; hash a global counter.
        let mut seed = 0;
        while seed == 0 {
            let mut hasher = DefaultHasher::new();
            static COUNTER: AtomicUsize = AtomicUsize::new(0);
            hasher.write_usize(COUNTER.fetch_add(1, Ordering::Relaxed));
            seed = hasher.finish() as u32;
        }

        XorShift32 {
            state: AtomicU32::new(seed),
        }
    }

    pub fn next(&self) -> u32 {
        let mut x = self.state.load(Ordering::Relaxed);
        debug_assert_ne!(x, 0);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state.store(x, Ordering::Relaxed);
        x
    }

    /// Returns a value from `0..n`.
    pub fn next_below(&self, n: usize) -> usize {
        debug_assert!(n > 0);
        (self.next() % n as u32) as usize
    }
}

/// One NUMA domain (or the whole machine when detection is unavailable).
pub struct Node {
    /// OS processor ids belonging to this node.
    pub processors: Vec<usize>,
    /// Worker ids mapped onto this node.
    pub workers: Vec<usize>,
    /// Free memory on the node in KiB; zero when unknown.
    pub available_memory: u64,
    /// Relative access cost from every node to this one, in sysfs distance
    /// units (10 = local). Used to estimate cross-node bandwidth.
    pub distances: Vec<u32>,
}

pub struct Topology {
    nodes: Vec<Node>,
    worker_nodes: Vec<usize>,
    worker_cores: Vec<usize>,
    /// Per node, the remote node with the highest estimated bandwidth.
    preferred_remote: Vec<usize>,
}

impl Topology {
    /// Probes the host and maps `worker_count` workers onto its nodes. Any
    /// probe failure falls back to a single synthetic node, which keeps the
    /// victim policy valid on every platform.
    pub fn detect(worker_count: usize, numa_aware: bool) -> Topology {
        let nodes = if numa_aware {
            probe_numa_nodes().unwrap_or_else(synthetic_nodes)
        } else {
            synthetic_nodes()
        };

        Topology::from_nodes(nodes, worker_count)
    }

    /// Builds the worker mapping for a given node set. Exposed for tests
    /// that need a deterministic multi-node shape.
    pub fn from_nodes(mut nodes: Vec<Node>, worker_count: usize) -> Topology {
        debug_assert!(!nodes.is_empty());

        // Workers take processors in node order, wrapping when there are
        // more workers than processors; a worker's node is the node of its
        // processor.
        let mut flat = Vec::new();
        for (n, node) in nodes.iter().enumerate() {
            for &p in &node.processors {
                flat.push((n, p));
            }
        }
        if flat.is_empty() {
            flat.push((0, 0));
        }

        let mut worker_nodes = Vec::with_capacity(worker_count);
        let mut worker_cores = Vec::with_capacity(worker_count);
        for w in 0..worker_count {
            let (n, p) = flat[w % flat.len()];
            worker_nodes.push(n);
            worker_cores.push(p);
            nodes[n].workers.push(w);
        }

        let preferred_remote = (0..nodes.len())
            .map(|n| preferred_remote_of(&nodes, n))
            .collect();

        Topology {
            nodes,
            worker_nodes,
            worker_cores,
            preferred_remote,
        }
    }

    #[inline]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[inline]
    pub fn node_of(&self, worker: usize) -> usize {
        self.worker_nodes[worker]
    }

    /// Picks a steal victim for `thief`, never the thief itself. Tier
    /// probabilities: 70% a worker on the thief's node, 25% a worker on the
    /// preferred remote node, 5% anywhere else; when the local node has no
    /// other worker its share is redistributed across the remote tiers.
    pub(crate) fn select_victim(&self, thief: usize, rng: &XorShift32) -> Option<usize> {
        let worker_count = self.worker_nodes.len();
        if worker_count <= 1 {
            return None;
        }

        let node = self.worker_nodes[thief];
        if self.nodes.len() == 1 {
            return self.random_excluding(rng, |w| w != thief);
        }

        let locals = self.nodes[node].workers.iter().any(|&w| w != thief);
        let (local_share, preferred_share) = if locals { (70, 25) } else { (0, 83) };

        let roll = rng.next_below(100);
        if roll < local_share {
            let pick = self.random_on_node(rng, node, thief);
            if pick.is_some() {
                return pick;
            }
        } else if roll < local_share + preferred_share {
            let remote = self.preferred_remote[node];
            let pick = self.random_on_node(rng, remote, thief);
            if pick.is_some() {
                return pick;
            }
        } else {
            let pick = self.random_excluding(rng, |w| {
                w != thief && self.worker_nodes[w] != node
            });
            if pick.is_some() {
                return pick;
            }
        }

        // The rolled tier was empty; fall back to any other worker.
        self.random_excluding(rng, |w| w != thief)
    }

    fn random_on_node(&self, rng: &XorShift32, node: usize, thief: usize) -> Option<usize> {
        let workers = &self.nodes[node].workers;
        let eligible = workers.iter().filter(|&&w| w != thief).count();
        if eligible == 0 {
            return None;
        }

        let pick = rng.next_below(eligible);
        workers.iter().filter(|&&w| w != thief).nth(pick).cloned()
    }

    fn random_excluding<F>(&self, rng: &XorShift32, keep: F) -> Option<usize>
    where
        F: Fn(usize) -> bool,
    {
        let worker_count = self.worker_nodes.len();
        let eligible = (0..worker_count).filter(|&w| keep(w)).count();
        if eligible == 0 {
            return None;
        }

        let pick = rng.next_below(eligible);
        (0..worker_count).filter(|&w| keep(w)).nth(pick)
    }

    /// Pins the calling thread near its worker's node and raises its
    /// priority. Both are best-effort; failures degrade to an unpinned
    /// thread and are logged once per worker.
    pub fn bind_current(&self, worker: usize) {
        let core = self.worker_cores[worker];
        let pinned = core_affinity::get_core_ids()
            .and_then(|ids| ids.into_iter().find(|c| c.id == core))
            .map(core_affinity::set_for_current)
            .is_some();
        if !pinned {
            warn!("worker {} could not be pinned to processor {}", worker, core);
        }

        raise_thread_priority(worker);
    }
}

fn preferred_remote_of(nodes: &[Node], from: usize) -> usize {
    // Sysfs distance is inversely proportional to link bandwidth, so the
    // closest remote node is the preferred one.
    let mut best = if from == 0 && nodes.len() > 1 { 1 } else { 0 };
    let mut best_distance = ::std::u32::MAX;
    for (n, node) in nodes.iter().enumerate() {
        if n == from {
            continue;
        }
        let distance = node.distances.get(from).cloned().unwrap_or(20);
        if distance < best_distance {
            best = n;
            best_distance = distance;
        }
    }
    best
}

fn synthetic_nodes() -> Vec<Node> {
    let cpus = num_cpus::get().max(1);
    vec![Node {
        processors: (0..cpus).collect(),
        workers: Vec::new(),
        available_memory: 0,
        distances: vec![10],
    }]
}

/// Reads the NUMA layout from `/sys/devices/system/node`. Returns `None`
/// on any parse problem so the caller can fall back to a synthetic node.
#[cfg(target_os = "linux")]
fn probe_numa_nodes() -> Option<Vec<Node>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir("/sys/devices/system/node").ok()? {
        let name = entry.ok()?.file_name();
        let name = name.to_str()?;
        if name.starts_with("node") {
            if let Ok(id) = name[4..].parse::<usize>() {
                ids.push(id);
            }
        }
    }

    if ids.len() < 2 {
        return None;
    }
    ids.sort();

    let mut nodes = Vec::with_capacity(ids.len());
    for &id in &ids {
        let base = format!("/sys/devices/system/node/node{}", id);

        let processors = parse_cpu_list(&fs::read_to_string(format!("{}/cpulist", base)).ok()?)?;
        let distances = fs::read_to_string(format!("{}/distance", base))
            .ok()?
            .split_whitespace()
            .map(|v| v.parse::<u32>().ok())
            .collect::<Option<Vec<_>>>()?;
        let available_memory = fs::read_to_string(format!("{}/meminfo", base))
            .ok()
            .and_then(|text| parse_node_mem_free(&text))
            .unwrap_or(0);

        nodes.push(Node {
            processors,
            workers: Vec::new(),
            available_memory,
            distances,
        });
    }

    info!("detected {} NUMA nodes", nodes.len());
    Some(nodes)
}

#[cfg(not(target_os = "linux"))]
fn probe_numa_nodes() -> Option<Vec<Node>> {
    None
}

/// Parses sysfs cpu list syntax, e.g. `0-3,8-11,15`.
fn parse_cpu_list(text: &str) -> Option<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in text.trim().split(',').filter(|p| !p.is_empty()) {
        let mut bounds = part.splitn(2, '-');
        let lo = bounds.next()?.trim().parse::<usize>().ok()?;
        let hi = match bounds.next() {
            Some(hi) => hi.trim().parse::<usize>().ok()?,
            None => lo,
        };
        cpus.extend(lo..=hi);
    }

    if cpus.is_empty() {
        None
    } else {
        Some(cpus)
    }
}

/// Picks `MemFree` out of a node meminfo blob, in KiB.
fn parse_node_mem_free(text: &str) -> Option<u64> {
    for line in text.lines() {
        if line.contains("MemFree:") {
            return line
                .split_whitespace()
                .rev()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok());
        }
    }
    None
}

#[cfg(unix)]
fn raise_thread_priority(worker: usize) {
    // Game runtimes want scheduling jitter low; a negative nice value is
    // the portable-ish best effort and commonly requires privileges. The
    // cast papers over per-libc differences in the `which` parameter type.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, -10) };
    if rc != 0 {
        debug!("worker {} keeps default thread priority", worker);
    }
}

#[cfg(not(unix))]
fn raise_thread_priority(_worker: usize) {}

#[cfg(test)]
mod test {
    use super::*;

    fn two_node_topology(workers: usize) -> Topology {
        let nodes = vec![
            Node {
                processors: (0..4).collect(),
                workers: Vec::new(),
                available_memory: 1024,
                distances: vec![10, 21],
            },
            Node {
                processors: (4..8).collect(),
                workers: Vec::new(),
                available_memory: 1024,
                distances: vec![21, 10],
            },
        ];
        Topology::from_nodes(nodes, workers)
    }

    #[test]
    fn worker_mapping_follows_processors() {
        let topo = two_node_topology(8);
        for w in 0..4 {
            assert_eq!(topo.node_of(w), 0);
        }
        for w in 4..8 {
            assert_eq!(topo.node_of(w), 1);
        }

        assert_eq!(topo.nodes()[0].workers, vec![0, 1, 2, 3]);
        assert_eq!(topo.nodes()[1].workers, vec![4, 5, 6, 7]);
    }

    #[test]
    fn victims_prefer_local_node() {
        let topo = two_node_topology(8);
        let rng = XorShift32::new();

        let mut local = 0usize;
        let total = 1_000_000;
        for _ in 0..total {
            let victim = topo.select_victim(2, &rng).unwrap();
            assert_ne!(victim, 2);
            if topo.node_of(victim) == topo.node_of(2) {
                local += 1;
            }
        }

        // The local tier alone is 70%; demand a comfortable margin above
        // the 60% locality target.
        assert!(local * 100 / total >= 60, "local steals: {}", local);
    }

    #[test]
    fn lone_worker_on_node_redistributes() {
        // Node 0 holds only the thief; every victim must be remote.
        let nodes = vec![
            Node {
                processors: vec![0],
                workers: Vec::new(),
                available_memory: 0,
                distances: vec![10, 21],
            },
            Node {
                processors: vec![1, 2, 3],
                workers: Vec::new(),
                available_memory: 0,
                distances: vec![21, 10],
            },
        ];
        let topo = Topology::from_nodes(nodes, 4);
        let rng = XorShift32::new();

        for _ in 0..10_000 {
            let victim = topo.select_victim(0, &rng).unwrap();
            assert_ne!(victim, 0);
            assert_eq!(topo.node_of(victim), 1);
        }
    }

    #[test]
    fn single_worker_has_no_victims() {
        let topo = Topology::from_nodes(synthetic_nodes(), 1);
        let rng = XorShift32::new();
        assert!(topo.select_victim(0, &rng).is_none());
    }

    #[test]
    fn cpu_list_syntax() {
        assert_eq!(parse_cpu_list("0-3\n"), Some(vec![0, 1, 2, 3]));
        assert_eq!(parse_cpu_list("0-1,4,6-7"), Some(vec![0, 1, 4, 6, 7]));
        assert_eq!(parse_cpu_list(""), None);
    }

    #[test]
    fn meminfo_mem_free() {
        let blob = "Node 0 MemTotal:  8000000 kB\nNode 0 MemFree:   123456 kB\n";
        assert_eq!(parse_node_mem_free(blob), Some(123_456));
    }
}
