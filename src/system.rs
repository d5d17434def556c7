//! Process-wide guest state shared by every Machine of one guest.

use crate::error::Error;
use crate::fd::FdTable;
use crate::jit::Jit;
use crate::mmu::{AddressSpace, MapKind, Prot};
use crate::stats;
use crate::tunables::{ARENA_SIZE, PAGE_SIZE, STACK_SIZE, STACK_TOP};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One guest `sigaction` slot, stored in guest encoding.
#[derive(Clone, Copy, Default)]
pub struct SigHandler {
    /// Handler address, or 0 (SIG_DFL) or 1 (SIG_IGN).
    pub handler: u64,
    pub flags: u64,
    pub restorer: u64,
    pub mask: u64,
}

/// The fields of a Machine that other threads and the host signal
/// handler may touch. Machines own one apiece; the System's registry
/// maps tids onto them for tkill and exit_group.
#[derive(Default)]
pub struct MachineShared {
    /// Out-of-band attention flag, checked at every boundary.
    pub attention: AtomicBool,
    /// Pending guest signal bitset (bit N-1 = signal N).
    pub pending: AtomicU64,
    /// Dirty code pages queued by the host fault handler.
    pub smc: crate::smc::SmcQueue,
}

impl MachineShared {
    /// Queues guest signal `sig` and raises attention. Async-signal-safe.
    pub fn post_signal(&self, sig: i32) {
        self.pending.fetch_or(1 << (sig - 1), Ordering::AcqRel);
        self.attention.store(true, Ordering::Release);
    }
}

/// Program image facts recorded by the loader.
#[derive(Clone, Default)]
pub struct ImageInfo {
    pub path: String,
    pub entry: u64,
    pub phdr: u64,
    pub phent: u64,
    pub phnum: u64,
    pub brk_start: u64,
}

/// Stack placement and lazy-growth bookkeeping.
pub struct StackRegion {
    /// One past the highest stack byte.
    pub top: u64,
    /// Lowest currently mapped stack address.
    pub low: u64,
    /// Growth stops here.
    pub limit: u64,
}

pub struct System {
    pub mem: AddressSpace,
    pub brk: Mutex<u64>,
    pub fds: Mutex<FdTable>,
    /// Guest signal-handler table, indexed by signal number - 1.
    pub handlers: Mutex<[SigHandler; 64]>,
    pub jit: Jit,
    pub image: Mutex<ImageInfo>,
    pub stack: Mutex<StackRegion>,
    /// tid -> shared machine state, for cross-thread signaling.
    pub machines: Mutex<HashMap<i32, Arc<MachineShared>>>,
    /// Set by exit_group; every Machine unwinds with this status.
    pub exiting: AtomicBool,
    pub exit_status: AtomicI32,
    /// Survives fork so the child can tell it is a copy.
    pub isfork: AtomicBool,
    /// Cleared by the driver's -C flag.
    pub allow_connect: AtomicBool,
    /// Debugger surface: fetch pauses when IP lands in this set. The
    /// atomic keeps the empty case off the hot path.
    pub has_breakpoints: AtomicBool,
    pub breakpoints: Mutex<HashSet<u64>>,
    pub has_watchpoints: AtomicBool,
    pub watchpoints: Mutex<HashSet<u64>>,
}

impl System {
    pub fn new(linear: bool, jit: bool) -> Result<Arc<Self>, Error> {
        // The JIT requires host protections to mirror guest code pages,
        // and a 64-bit host.
        let jit = jit && linear && cfg!(target_pointer_width = "64");
        Ok(Arc::new(Self {
            mem: AddressSpace::new(ARENA_SIZE, linear)?,
            brk: Mutex::new(0),
            fds: Mutex::new(FdTable::with_stdio()),
            handlers: Mutex::new([SigHandler::default(); 64]),
            jit: Jit::new(jit),
            image: Mutex::new(ImageInfo::default()),
            stack: Mutex::new(StackRegion {
                top: STACK_TOP,
                low: STACK_TOP,
                limit: STACK_TOP - STACK_SIZE,
            }),
            machines: Mutex::new(HashMap::new()),
            exiting: AtomicBool::new(false),
            exit_status: AtomicI32::new(0),
            isfork: AtomicBool::new(false),
            allow_connect: AtomicBool::new(true),
            has_breakpoints: AtomicBool::new(false),
            breakpoints: Mutex::new(HashSet::new()),
            has_watchpoints: AtomicBool::new(false),
            watchpoints: Mutex::new(HashSet::new()),
        }))
    }

    /// Maps the initial stack below `top` and returns the starting
    /// stack pointer.
    pub fn map_initial_stack(&self, initial: u64) -> Result<u64, Error> {
        let mut stack = self.stack.lock().unwrap();
        let low = stack.top - initial;
        self.mem.reserve(
            low,
            stack.top - low,
            Prot::READ | Prot::WRITE,
            false,
            MapKind::Stack,
        )?;
        stack.low = low;
        Ok(stack.top)
    }

    /// Demand growth: a fault at `addr` just under the mapped stack maps
    /// pages down to it, up to the limit. Returns true when the fault
    /// has been repaired.
    pub fn grow_stack(&self, addr: u64) -> bool {
        let mut stack = self.stack.lock().unwrap();
        let page = addr & !(PAGE_SIZE - 1);
        if page >= stack.low || page < stack.limit {
            return false;
        }
        if self
            .mem
            .reserve(
                page,
                stack.low - page,
                Prot::READ | Prot::WRITE,
                false,
                MapKind::Stack,
            )
            .is_err()
        {
            return false;
        }
        debug!("stack grown down to {:#x}", page);
        stats::bump(&stats::STACK_GROWS);
        stack.low = page;
        true
    }

    /// Registers a Machine's shared state under its tid.
    pub fn attach(&self, tid: i32, shared: Arc<MachineShared>) {
        self.machines.lock().unwrap().insert(tid, shared);
    }

    pub fn detach(&self, tid: i32) {
        self.machines.lock().unwrap().remove(&tid);
    }

    /// Shared state of the Machine running as guest `tid`.
    pub fn machine(&self, tid: i32) -> Option<Arc<MachineShared>> {
        self.machines.lock().unwrap().get(&tid).cloned()
    }

    /// Begins process exit: every Machine observes attention and unwinds.
    pub fn begin_exit(&self, status: i32) {
        self.exit_status.store(status, Ordering::Release);
        self.exiting.store(true, Ordering::Release);
        for shared in self.machines.lock().unwrap().values() {
            shared.attention.store(true, Ordering::Release);
        }
    }

    pub fn add_breakpoint(&self, addr: u64) {
        self.breakpoints.lock().unwrap().insert(addr);
        self.has_breakpoints.store(true, Ordering::Release);
    }

    pub fn add_watchpoint(&self, addr: u64) {
        self.watchpoints.lock().unwrap().insert(addr);
        self.has_watchpoints.store(true, Ordering::Release);
    }

    /// Moves the program break, returning the new value (the old one on
    /// failure, as the syscall contract requires).
    pub fn do_brk(&self, newbrk: u64) -> u64 {
        let mut brk = self.brk.lock().unwrap();
        if newbrk == 0 {
            return *brk;
        }
        let old_end = crate::mmu::page_up(*brk);
        let new_end = crate::mmu::page_up(newbrk);
        let start = self.image.lock().unwrap().brk_start;
        if newbrk < start {
            return *brk;
        }
        if new_end > old_end {
            if self
                .mem
                .reserve(
                    old_end,
                    new_end - old_end,
                    Prot::READ | Prot::WRITE,
                    false,
                    MapKind::Heap,
                )
                .is_err()
            {
                return *brk;
            }
        } else if new_end < old_end {
            self.mem.free(new_end, old_end - new_end);
        }
        *brk = newbrk;
        newbrk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::Access;

    #[test]
    fn brk_grows_and_shrinks() {
        let sys = System::new(false, false).unwrap();
        {
            let mut image = sys.image.lock().unwrap();
            image.brk_start = 0x60_0000;
        }
        *sys.brk.lock().unwrap() = 0x60_0000;
        let b = sys.do_brk(0x60_3000);
        assert_eq!(b, 0x60_3000);
        assert!(sys.mem.lookup(0x60_2fff, Access::Write).is_some());
        // Shrink back.
        assert_eq!(sys.do_brk(0x60_1000), 0x60_1000);
        assert!(sys.mem.lookup(0x60_2000, Access::Read).is_none());
        // Below the start: refused, old break returned.
        assert_eq!(sys.do_brk(0x10_0000), 0x60_1000);
    }

    #[test]
    fn stack_growth_respects_limit() {
        let sys = System::new(false, false).unwrap();
        sys.map_initial_stack(0x4000).unwrap();
        let low = sys.stack.lock().unwrap().low;
        assert!(sys.grow_stack(low - 0x1000));
        assert!(sys.mem.lookup(low - 0x1000, Access::Write).is_some());
        let limit = sys.stack.lock().unwrap().limit;
        assert!(!sys.grow_stack(limit - 0x1000));
    }

    #[test]
    fn exit_raises_attention_everywhere() {
        let sys = System::new(false, false).unwrap();
        let a = Arc::new(MachineShared::default());
        let b = Arc::new(MachineShared::default());
        sys.attach(1, a.clone());
        sys.attach(2, b.clone());
        sys.begin_exit(7);
        assert!(a.attention.load(Ordering::Acquire));
        assert!(b.attention.load(Ordering::Acquire));
        assert_eq!(sys.exit_status.load(Ordering::Acquire), 7);
    }
}
