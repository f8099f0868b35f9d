//! Token-coherent COMA memory hierarchy.
//!
//! The memory system is a two-level ring structure:
//! 1. **Lower rings:** each directory closes a ring of L2 caches; every
//!    cache serves a group of cores over its internal bus.
//! 2. **Top ring:** the directories' top halves and the root directories,
//!    which interleave line ownership and talk to DDR.
//! 3. **Tokens:** one per cache, issued by roots when lines enter the
//!    system and retired when the last eviction returns home. A cache
//!    writes locally only with all tokens; otherwise updates circulate.
//!
//! `Coma` owns every node and dispatches their processes; cores reach it
//! through the [`traits::Memory`] interface and receive completions through
//! [`traits::MemoryClient`].

/// L2 cache node logic.
pub mod cache;
/// DDR channel timing model.
pub mod ddr;
/// Intermediate directory logic.
pub mod directory;
/// Ring message types.
pub mod message;
/// Ring node buffers and insertion rules.
pub mod node;
/// Root directory logic.
pub mod root;
/// Sparse backing storage.
pub mod storage;
/// Memory and client interfaces.
pub mod traits;

use crate::common::{MemAddr, MemSize, Pid, Tid};
use crate::config::Config;
use crate::kernel::{ProcCtx, ProcResult, ProcessId, Scheduler};

use self::cache::{BusRequest, L2Cache};
use self::directory::Directory;
use self::node::RingNode;
use self::root::RootDirectory;
use self::storage::VirtualMemory;
use self::traits::{Memory, MemoryClient};

/// One process of the memory system, for dispatch.
#[derive(Clone, Copy, Debug)]
pub enum MemProcess {
    /// Bus requests of cache `i`.
    CacheRequests(usize),
    /// Ring messages of cache `i`.
    CacheIncoming(usize),
    /// Bottom-half messages of directory `i`.
    DirBottom(usize),
    /// Top-half messages of directory `i`.
    DirTop(usize),
    /// Ring messages of root `i`.
    RootIncoming(usize),
    /// Memory-queue requests of root `i`.
    RootRequests(usize),
    /// Response re-insertion of root `i`.
    RootResponses(usize),
    /// DDR completions of root `i`.
    RootDdr(usize),
    /// Ring forwarding of node `n`.
    Forward(usize),
}

/// The complete COMA memory system.
#[derive(Debug)]
pub struct Coma {
    line_size: usize,
    num_caches: usize,
    cores_per_cache: usize,
    /// All ring nodes: caches, directory halves, roots.
    pub nodes: Vec<RingNode>,
    next: Vec<usize>,
    forward_procs: Vec<ProcessId>,
    /// The L2 caches, by cache id.
    pub caches: Vec<L2Cache>,
    /// The intermediate directories.
    pub directories: Vec<Directory>,
    /// The root directories.
    pub roots: Vec<RootDirectory>,
    /// Backing storage behind the roots.
    pub storage: VirtualMemory,
    client_cache: Vec<usize>,
}

fn two_mut<T>(slice: &mut [T], a: usize, b: usize) -> (&mut T, &mut T) {
    debug_assert!(a != b);
    if a < b {
        let (lo, hi) = slice.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = slice.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}

impl Coma {
    /// Builds the hierarchy described by `config`. The configuration
    /// validator has already checked the divisibility constraints.
    pub fn new(config: &Config) -> Self {
        let m = &config.memory;
        let num_caches = m.num_caches;
        let num_dirs = m.num_directories;
        let num_roots = m.num_root_directories;
        let caches_per_dir = num_caches / num_dirs;
        let cores_per_cache = config.num_processors / num_caches;
        let buffer = m.memory_buffer_size;

        // Node layout: caches, then per-directory (bottom, top), then roots.
        let num_nodes = num_caches + 2 * num_dirs + num_roots;
        let mut nodes = Vec::with_capacity(num_nodes);
        for _ in 0..num_nodes {
            nodes.push(RingNode::new(buffer));
        }
        let cache_node = |c: usize| c;
        let bottom_node = |d: usize| num_caches + 2 * d;
        let top_node = |d: usize| num_caches + 2 * d + 1;
        let root_node = |r: usize| num_caches + 2 * num_dirs + r;

        // Lower rings: c0 -> c1 -> .. -> dir.bottom -> c0.
        let mut next = vec![0usize; num_nodes];
        for d in 0..num_dirs {
            let first = d * caches_per_dir;
            for c in first..first + caches_per_dir {
                next[cache_node(c)] = if c + 1 < first + caches_per_dir {
                    cache_node(c + 1)
                } else {
                    bottom_node(d)
                };
            }
            next[bottom_node(d)] = cache_node(first);
        }
        // Top ring: dir0.top -> .. -> dirN.top -> root0 -> .. -> dir0.top.
        for d in 0..num_dirs {
            next[top_node(d)] = if d + 1 < num_dirs {
                top_node(d + 1)
            } else {
                root_node(0)
            };
        }
        for r in 0..num_roots {
            next[root_node(r)] = if r + 1 < num_roots {
                root_node(r + 1)
            } else {
                top_node(0)
            };
        }

        let caches = (0..num_caches)
            .map(|c| {
                L2Cache::new(
                    c,
                    cache_node(c),
                    m.l2_cache_num_sets,
                    m.l2_cache_associativity,
                    m.cache_line_size,
                    num_caches,
                    m.bus_buffer_size,
                )
            })
            .collect();
        let directories = (0..num_dirs)
            .map(|d| {
                Directory::new(
                    d,
                    bottom_node(d),
                    top_node(d),
                    d * caches_per_dir..(d + 1) * caches_per_dir,
                    m.cache_line_size,
                )
            })
            .collect();
        let roots = (0..num_roots)
            .map(|r| {
                RootDirectory::new(
                    r,
                    root_node(r),
                    num_roots,
                    num_caches,
                    m.cache_line_size,
                    buffer,
                    m.ddr,
                )
            })
            .collect();

        Self {
            line_size: m.cache_line_size,
            num_caches,
            cores_per_cache,
            nodes,
            next,
            forward_procs: vec![0; num_nodes],
            caches,
            directories,
            roots,
            storage: VirtualMemory::new(),
            client_cache: vec![0; config.num_processors],
        }
    }

    /// Cache line size in bytes.
    pub fn line_size(&self) -> usize {
        self.line_size
    }

    /// Total coherence tokens in the system (one per cache).
    pub fn total_tokens(&self) -> usize {
        self.num_caches
    }

    /// Registers every memory process with the scheduler and wires storage
    /// sensitivities. Returns the dispatch table entries.
    pub fn register(&mut self, sched: &mut Scheduler) -> Vec<(ProcessId, MemProcess)> {
        let mut table = Vec::new();
        for i in 0..self.caches.len() {
            let p_req = sched.register(format!("l2cache{i}.requests"));
            let p_in = sched.register(format!("l2cache{i}.incoming"));
            self.caches[i].proc_requests = p_req;
            self.caches[i].proc_incoming = p_in;
            self.caches[i].p_lines.add_process(p_in);
            self.caches[i].p_lines.add_process(p_req);
            self.caches[i].p_bus.add_process(p_in);
            self.caches[i].p_bus.add_process(p_req);
            self.caches[i].requests.set_sensitive(p_req);
            let node = self.caches[i].node;
            self.nodes[node].incoming.set_sensitive(p_in);
            table.push((p_req, MemProcess::CacheRequests(i)));
            table.push((p_in, MemProcess::CacheIncoming(i)));
        }
        for i in 0..self.directories.len() {
            let p_bot = sched.register(format!("dir{i}.bottom"));
            let p_top = sched.register(format!("dir{i}.top"));
            self.directories[i].proc_bottom = p_bot;
            self.directories[i].proc_top = p_top;
            let (b, t) = (self.directories[i].bottom_node, self.directories[i].top_node);
            self.nodes[b].incoming.set_sensitive(p_bot);
            self.nodes[t].incoming.set_sensitive(p_top);
            table.push((p_bot, MemProcess::DirBottom(i)));
            table.push((p_top, MemProcess::DirTop(i)));
        }
        for i in 0..self.roots.len() {
            let p_in = sched.register(format!("root{i}.incoming"));
            let p_req = sched.register(format!("root{i}.requests"));
            let p_rsp = sched.register(format!("root{i}.responses"));
            let p_ddr = sched.register(format!("root{i}.ddr"));
            let root = &mut self.roots[i];
            root.proc_incoming = p_in;
            root.proc_requests = p_req;
            root.proc_responses = p_rsp;
            root.proc_ddr = p_ddr;
            root.p_lines.add_process(p_in);
            root.p_lines.add_process(p_req);
            root.requests.set_sensitive(p_req);
            root.responses.set_sensitive(p_rsp);
            let node = root.node;
            self.nodes[node].incoming.set_sensitive(p_in);
            table.push((p_in, MemProcess::RootIncoming(i)));
            table.push((p_req, MemProcess::RootRequests(i)));
            table.push((p_rsp, MemProcess::RootResponses(i)));
            table.push((p_ddr, MemProcess::RootDdr(i)));
        }
        for n in 0..self.nodes.len() {
            let p_fwd = sched.register(format!("ringnode{n}.forward"));
            self.forward_procs[n] = p_fwd;
            self.nodes[n].outgoing.set_sensitive(p_fwd);
            table.push((p_fwd, MemProcess::Forward(n)));
        }
        table
    }

    /// Attaches a core to its serving cache's bus. The issuing processes
    /// are added to the bus arbitrator separately during wiring.
    pub fn attach_core(&mut self, pid: Pid) {
        let cache = pid / self.cores_per_cache;
        self.client_cache[pid] = cache;
        self.caches[cache].clients.push(pid);
    }

    /// The cache id serving a core.
    pub fn cache_of(&self, pid: Pid) -> usize {
        self.client_cache[pid]
    }

    /// Runs one memory process for one phase.
    pub fn cycle(
        &mut self,
        proc: MemProcess,
        clients: &mut [&mut dyn MemoryClient],
        ctx: ProcCtx,
    ) -> ProcResult {
        match proc {
            MemProcess::CacheRequests(i) => {
                let node = self.caches[i].node;
                self.caches[i].do_requests(&mut self.nodes[node], clients, ctx)
            }
            MemProcess::CacheIncoming(i) => {
                let node = self.caches[i].node;
                self.caches[i].do_receive(&mut self.nodes[node], clients, ctx)
            }
            MemProcess::DirBottom(i) => {
                let (b, t) = (self.directories[i].bottom_node, self.directories[i].top_node);
                let (bottom, top) = two_mut(&mut self.nodes, b, t);
                self.directories[i].do_bottom(bottom, top, ctx)
            }
            MemProcess::DirTop(i) => {
                let (b, t) = (self.directories[i].bottom_node, self.directories[i].top_node);
                let (bottom, top) = two_mut(&mut self.nodes, b, t);
                self.directories[i].do_top(top, bottom, ctx)
            }
            MemProcess::RootIncoming(i) => {
                let node = self.roots[i].node;
                self.roots[i].do_incoming(&mut self.nodes[node], ctx)
            }
            MemProcess::RootRequests(i) => self.roots[i].do_requests(ctx),
            MemProcess::RootResponses(i) => {
                let node = self.roots[i].node;
                self.roots[i].do_responses(&mut self.nodes[node], ctx)
            }
            MemProcess::RootDdr(i) => self.roots[i].do_ddr(&mut self.storage, ctx),
            MemProcess::Forward(n) => self.forward(n, ctx),
        }
    }

    /// Moves the front outgoing message of node `n` to its successor.
    fn forward(&mut self, n: usize, ctx: ProcCtx) -> ProcResult {
        let succ = self.next[n];
        let (from, to) = two_mut(&mut self.nodes, n, succ);
        let Some(msg) = from.outgoing.front().cloned() else {
            return ProcResult::Delayed;
        };
        if to.incoming.push(msg, ctx) {
            from.outgoing.pop(ctx);
            ProcResult::Success
        } else {
            ProcResult::Failed
        }
    }

    /// End-of-cycle storage publication and process wakeup.
    pub fn update(&mut self, wake: &mut dyn FnMut(ProcessId)) {
        for node in &mut self.nodes {
            node.incoming.update(wake);
            node.outgoing.update(wake);
        }
        for cache in &mut self.caches {
            cache.requests.update(wake);
        }
        for root in &mut self.roots {
            root.requests.update(wake);
            root.responses.update(wake);
            root.memready.update(wake);
            if root.ddr_busy() {
                wake(root.proc_ddr);
            }
        }
    }

    /// Counts every token attributable to the line holding `address`:
    /// cache lines, in-flight ring messages, root spares, and the pending
    /// memory queues. Used by the conservation invariant tests.
    pub fn token_census(&self, address: MemAddr) -> usize {
        let line = address - address % self.line_size as u64;
        let in_caches: usize = self
            .caches
            .iter()
            .filter_map(|c| c.find_line(line).map(|l| l.tokens))
            .sum();
        let in_flight: usize = self
            .nodes
            .iter()
            .flat_map(|n| n.incoming.iter().chain(n.outgoing.iter()))
            .filter(|m| m.address - m.address % self.line_size as u64 == line)
            .map(|m| m.tokens)
            .sum();
        let at_roots: usize = self.roots.iter().map(|r| r.held_tokens(line)).sum();
        let queued: usize = self
            .roots
            .iter()
            .flat_map(|r| r.requests.iter().chain(r.responses.iter()))
            .filter(|m| m.address - m.address % self.line_size as u64 == line)
            .map(|m| m.tokens)
            .sum();
        in_caches + in_flight + at_roots + queued
    }
}

impl Memory for Coma {
    fn read(&mut self, client: Pid, addr: MemAddr, size: MemSize, ctx: ProcCtx) -> bool {
        debug_assert!(addr % self.line_size as u64 == 0);
        debug_assert!(size == self.line_size);
        let cache = &mut self.caches[self.client_cache[client]];
        if !cache.p_bus.invoke(ctx) {
            return false;
        }
        cache.requests.push(
            BusRequest {
                write: false,
                address: addr,
                data: Vec::new(),
                client,
                tid: 0,
            },
            ctx,
        )
    }

    fn write(&mut self, client: Pid, addr: MemAddr, data: &[u8], tid: Tid, ctx: ProcCtx) -> bool {
        debug_assert!(
            (addr % self.line_size as u64) as usize + data.len() <= self.line_size,
            "writes may not straddle a line"
        );
        let cache = &mut self.caches[self.client_cache[client]];
        if !cache.p_bus.invoke(ctx) {
            return false;
        }
        cache.requests.push(
            BusRequest {
                write: true,
                address: addr,
                data: data.to_vec(),
                client,
                tid,
            },
            ctx,
        )
    }

    fn check_permissions(&self, addr: MemAddr, size: MemSize, _write: bool) -> bool {
        self.storage.check_permissions(addr, size)
    }
}
