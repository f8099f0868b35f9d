//! Interfaces between the memory hierarchy and its clients.
//!
//! Cores talk to the memory system through [`Memory`]; the memory system
//! answers through [`MemoryClient`], a trait implemented by every registered
//! client. Callbacks return `false` to exert backpressure: the memory-side
//! process stalls and retries the delivery next cycle, so callbacks are
//! observed in program order per line.

use crate::common::{MemAddr, MemSize, Pid, Tid};
use crate::kernel::ProcCtx;

/// The request interface cores use to reach the memory system.
pub trait Memory {
    /// Issues a line read on behalf of client `client`.
    ///
    /// Returns `false` when the bus or request buffer is unavailable this
    /// cycle. Completion arrives through
    /// [`MemoryClient::on_memory_read_completed`].
    fn read(&mut self, client: Pid, addr: MemAddr, size: MemSize, ctx: ProcCtx) -> bool;

    /// Issues a write on behalf of client `client`, tagged with the
    /// issuing thread for completion tracking.
    fn write(&mut self, client: Pid, addr: MemAddr, data: &[u8], tid: Tid, ctx: ProcCtx) -> bool;

    /// Checks that an access to `[addr, addr + size)` is permitted.
    fn check_permissions(&self, addr: MemAddr, size: MemSize, write: bool) -> bool;
}

/// Callbacks delivered by the memory system to its registered clients.
pub trait MemoryClient {
    /// A line read completed; `data` is the full line.
    ///
    /// Broadcast to every client on the serving cache's bus, so clients
    /// with a matching pending line snoop the fill.
    fn on_memory_read_completed(&mut self, addr: MemAddr, data: &[u8], ctx: ProcCtx) -> bool;

    /// A write issued by thread `tid` is globally visible.
    fn on_memory_write_completed(&mut self, tid: Tid, ctx: ProcCtx) -> bool;

    /// Another client wrote `data` at `addr`; update any local copy.
    fn on_memory_snooped(&mut self, addr: MemAddr, data: &[u8], ctx: ProcCtx) -> bool;

    /// The line holding `addr` was evicted from the serving cache.
    fn on_memory_invalidated(&mut self, addr: MemAddr, ctx: ProcCtx) -> bool;
}
