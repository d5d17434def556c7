//! The guest virtual address space: a sparse 48-bit space of 4 KiB pages
//! described by a four-level page table that lives inside the arena.
//!
//! PTE stores use release ordering with the present bit written last, so
//! other guest threads either see a fully formed entry or none. Mapping
//! mutations serialize on one lock; the walk itself is lock-free.

use crate::arena::Arena;
use crate::error::Error;
use crate::tunables::{PAGE_SIZE, VIRT_BITS};
use bitflags::bitflags;
use rangemap::RangeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

bitflags! {
    /// Page-table entry bits.
    pub struct Pte: u64 {
        /// Present.
        const V  = 1 << 0;
        /// Writable.
        const RW = 1 << 1;
        /// User-accessible.
        const U  = 1 << 2;
        /// Reserved for the emulator (software-available bit).
        const RSRV = 1 << 9;
        /// Execute disable.
        const XD = 1 << 63;
    }
}

bitflags! {
    /// Guest-visible mapping protection, mmap-style.
    pub struct Prot: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

/// 40-bit frame number field.
const PTE_PFN: u64 = 0x000f_ffff_ffff_f000;

/// What a reserved guest range is for. Carried in the range bookkeeping
/// so the fault dump and munmap can name regions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapKind {
    Image,
    Heap,
    Stack,
    Anon,
}

/// How an access intends to touch memory, for permission checks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
    Exec,
}

pub struct AddressSpace {
    arena: Arena,
    root: u64,
    /// Whether host page protections mirror guest executable pages. This
    /// is the mode that permits the JIT; see `smc`.
    linear: bool,
    map_lock: Mutex<()>,
    ranges: Mutex<RangeMap<u64, MapKind>>,
}

#[inline]
pub fn page_of(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

#[inline]
pub fn page_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

impl AddressSpace {
    pub fn new(arena_size: usize, linear: bool) -> Result<Self, Error> {
        let arena = Arena::new(arena_size)?;
        let root = arena.alloc_frame()?;
        Ok(Self {
            arena,
            root,
            linear,
            map_lock: Mutex::new(()),
            ranges: Mutex::new(RangeMap::new()),
        })
    }

    #[inline]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    #[inline]
    pub fn linear(&self) -> bool {
        self.linear
    }

    #[inline]
    fn pte_slot(&self, table: u64, index: u64) -> &AtomicU64 {
        debug_assert!(index < 512);
        unsafe {
            &*(self.arena.frame_ptr(table) as *const AtomicU64).add(index as usize)
        }
    }

    /// Walks to the PTE slot for `virt`, creating missing levels from the
    /// arena when `create` is set. Lock-free when not creating.
    fn walk(&self, virt: u64, create: bool) -> Result<Option<&AtomicU64>, Error> {
        let mut table = self.root;
        for shift in [39u32, 30, 21] {
            let slot = self.pte_slot(table, (virt >> shift) & 0x1ff);
            let pte = slot.load(Ordering::Acquire);
            if pte & Pte::V.bits() != 0 {
                table = (pte & PTE_PFN) >> 12;
            } else if create {
                let frame = self
                    .arena
                    .alloc_frame()
                    .map_err(|_| Error::PageTableExhausted)?;
                let entry = (frame << 12) | (Pte::V | Pte::RW | Pte::U).bits();
                slot.store(entry, Ordering::Release);
                table = frame;
            } else {
                return Ok(None);
            }
        }
        Ok(Some(self.pte_slot(table, (virt >> 12) & 0x1ff)))
    }

    /// Raw PTE for `virt`, absent levels included. Async-signal-safe.
    pub fn pte_of(&self, virt: u64) -> u64 {
        match self.walk(virt, false) {
            Ok(Some(slot)) => slot.load(Ordering::Acquire),
            _ => 0,
        }
    }

    fn perm_bits(prot: Prot) -> Pte {
        let mut bits = Pte::V | Pte::U;
        if prot.contains(Prot::WRITE) {
            bits |= Pte::RW;
        }
        if !prot.contains(Prot::EXEC) {
            bits |= Pte::XD;
        }
        bits
    }

    /// Ensures `[virt, virt+size)` is mapped with `prot`. Partial first
    /// and last pages are extended to the enclosing page. Already-mapped
    /// pages are an error unless `fixed`, in which case they are replaced
    /// with fresh zeroed frames.
    pub fn reserve(
        &self,
        virt: u64,
        size: u64,
        prot: Prot,
        fixed: bool,
        kind: MapKind,
    ) -> Result<(), Error> {
        if size == 0 {
            return Ok(());
        }
        let start = page_of(virt);
        let end = page_up(virt + size);
        if end > (1u64 << VIRT_BITS) {
            return Err(Error::InvalidGuestAddress(virt));
        }
        let _guard = self.map_lock.lock().unwrap();
        let bits = Self::perm_bits(prot);
        let mut page = start;
        while page < end {
            let slot = self.walk(page, true)?.unwrap();
            let old = slot.load(Ordering::Acquire);
            if old & Pte::V.bits() != 0 {
                if !fixed {
                    return Err(Error::MappingClash(page));
                }
                self.arena.free_frame((old & PTE_PFN) >> 12);
                slot.store(0, Ordering::Release);
            }
            let frame = self.arena.alloc_frame()?;
            self.arena.set_guest_page(frame, Some(page));
            slot.store((frame << 12) | bits.bits(), Ordering::Release);
            if self.linear && prot.contains(Prot::WRITE | Prot::EXEC) {
                // Writable code pages start write-protected on the host
                // so the first store raises the coherence fault.
                self.arena.protect_frame(frame, false);
            }
            page += PAGE_SIZE;
        }
        self.ranges.lock().unwrap().insert(start..end, kind);
        Ok(())
    }

    /// Unmaps `[virt, virt+size)`. Page-table pages themselves are never
    /// reclaimed.
    pub fn free(&self, virt: u64, size: u64) {
        if size == 0 {
            return;
        }
        let start = page_of(virt);
        let end = page_up(virt + size);
        let _guard = self.map_lock.lock().unwrap();
        let mut page = start;
        while page < end {
            if let Ok(Some(slot)) = self.walk(page, false) {
                let old = slot.load(Ordering::Acquire);
                if old & Pte::V.bits() != 0 {
                    slot.store(0, Ordering::Release);
                    let frame = (old & PTE_PFN) >> 12;
                    self.arena.protect_frame(frame, true);
                    self.arena.free_frame(frame);
                }
            }
            page += PAGE_SIZE;
        }
        self.ranges.lock().unwrap().remove(start..end);
    }

    /// Changes the writable/execute bits on an existing range.
    pub fn protect(&self, virt: u64, size: u64, prot: Prot) -> Result<(), Error> {
        let start = page_of(virt);
        let end = page_up(virt + size);
        let _guard = self.map_lock.lock().unwrap();
        let bits = Self::perm_bits(prot);
        let mut page = start;
        while page < end {
            match self.walk(page, false)? {
                Some(slot) => {
                    let old = slot.load(Ordering::Acquire);
                    if old & Pte::V.bits() == 0 {
                        return Err(Error::InvalidGuestAddress(page));
                    }
                    let frame_bits = old & PTE_PFN;
                    slot.store(frame_bits | bits.bits(), Ordering::Release);
                    if self.linear && prot.contains(Prot::WRITE | Prot::EXEC) {
                        self.arena.protect_frame(frame_bits >> 12, false);
                    }
                }
                None => return Err(Error::InvalidGuestAddress(page)),
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// First-fit scan upward from `hint` for `size` bytes of unmapped
    /// guest space.
    pub fn find_unmapped(&self, hint: u64, size: u64) -> Option<u64> {
        let need = page_up(size);
        let start = page_of(hint.max(PAGE_SIZE));
        let limit = 1u64 << VIRT_BITS;
        let ranges = self.ranges.lock().unwrap();
        for gap in ranges.gaps(&(start..limit)) {
            if gap.end - gap.start >= need {
                return Some(gap.start);
            }
        }
        None
    }

    /// Unmaps every reserved range (execve tears the old image down).
    pub fn clear(&self) {
        let ranges: Vec<std::ops::Range<u64>> = self
            .ranges
            .lock()
            .unwrap()
            .iter()
            .map(|(r, _)| r.clone())
            .collect();
        for r in ranges {
            self.free(r.start, r.end - r.start);
        }
    }

    /// The kind of the reserved range containing `virt`, if any.
    pub fn kind_of(&self, virt: u64) -> Option<MapKind> {
        self.ranges.lock().unwrap().get(&virt).copied()
    }

    /// Walks the tables and returns a host pointer for `virt`, or `None`
    /// when the page is absent or the access is not permitted.
    pub fn lookup(&self, virt: u64, access: Access) -> Option<*mut u8> {
        let pte = self.pte_of(virt);
        if pte & Pte::V.bits() == 0 {
            return None;
        }
        match access {
            Access::Read => {}
            Access::Write => {
                if pte & Pte::RW.bits() == 0 {
                    return None;
                }
            }
            Access::Exec => {
                if pte & Pte::XD.bits() != 0 {
                    return None;
                }
            }
        }
        let frame = (pte & PTE_PFN) >> 12;
        Some(unsafe { self.arena.frame_ptr(frame).add((virt & (PAGE_SIZE - 1)) as usize) })
    }

    /// Copies bytes into guest memory, crossing any number of pages.
    /// Returns the count actually transferred; a short count means the
    /// copy hit an unmapped or unwritable page.
    pub fn copy_to_guest(&self, virt: u64, src: &[u8]) -> usize {
        let mut done = 0;
        while done < src.len() {
            let addr = virt + done as u64;
            let ptr = match self.lookup(addr, Access::Write) {
                Some(p) => p,
                None => return done,
            };
            let room = (PAGE_SIZE - (addr & (PAGE_SIZE - 1))) as usize;
            let n = room.min(src.len() - done);
            unsafe {
                std::ptr::copy_nonoverlapping(src[done..].as_ptr(), ptr, n);
            }
            done += n;
        }
        done
    }

    /// Copies bytes out of guest memory; same short-count contract.
    pub fn copy_from_guest(&self, dst: &mut [u8], virt: u64) -> usize {
        let mut done = 0;
        while done < dst.len() {
            let addr = virt + done as u64;
            let ptr = match self.lookup(addr, Access::Read) {
                Some(p) => p,
                None => return done,
            };
            let room = (PAGE_SIZE - (addr & (PAGE_SIZE - 1))) as usize;
            let n = room.min(dst.len() - done);
            unsafe {
                std::ptr::copy_nonoverlapping(ptr, dst[done..].as_mut_ptr(), n);
            }
            done += n;
        }
        done
    }

    /// Reads instruction bytes at `virt` with execute permission,
    /// stopping at the first unfetchable byte.
    pub fn fetch(&self, virt: u64, buf: &mut [u8]) -> usize {
        let mut done = 0;
        while done < buf.len() {
            let addr = virt + done as u64;
            let ptr = match self.lookup(addr, Access::Exec) {
                Some(p) => p,
                None => return done,
            };
            let room = (PAGE_SIZE - (addr & (PAGE_SIZE - 1))) as usize;
            let n = room.min(buf.len() - done);
            unsafe {
                std::ptr::copy_nonoverlapping(ptr, buf[done..].as_mut_ptr(), n);
            }
            done += n;
        }
        done
    }

    /// Classifies a host fault address. Returns the guest page it backs
    /// when the guest page is user-writable (the self-modifying-code
    /// case). Async-signal-safe: atomic loads only.
    pub fn classify_host_fault(&self, host_addr: usize) -> Option<u64> {
        let frame = self.arena.host_to_frame(host_addr)?;
        let page = self.arena.guest_page_of(frame)?;
        let pte = self.pte_of(page);
        let want = (Pte::V | Pte::U | Pte::RW).bits();
        let mask = (Pte::V | Pte::U | Pte::RW | Pte::XD).bits();
        if pte & mask == want {
            Some(page)
        } else {
            None
        }
    }

    /// Host write protection for one guest page; the self-modifying-code
    /// arm/disarm primitive. Async-signal-safe.
    pub fn protect_guest_page_host(&self, page: u64, writable: bool) -> bool {
        let pte = self.pte_of(page);
        if pte & Pte::V.bits() == 0 {
            return false;
        }
        self.arena.protect_frame((pte & PTE_PFN) >> 12, writable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> AddressSpace {
        AddressSpace::new(8 << 20, false).unwrap()
    }

    #[test]
    fn reserve_then_copy_roundtrip() {
        let m = space();
        m.reserve(0x40_0000, 0x3000, Prot::READ | Prot::WRITE, false, MapKind::Anon)
            .unwrap();
        let data: Vec<u8> = (0..0x3000u32).map(|i| i as u8).collect();
        assert_eq!(m.copy_to_guest(0x40_0000, &data), data.len());
        let mut back = vec![0u8; data.len()];
        assert_eq!(m.copy_from_guest(&mut back, 0x40_0000), data.len());
        assert_eq!(back, data);
    }

    #[test]
    fn unmapped_lookup_is_none() {
        let m = space();
        assert_eq!(m.lookup(0xdead_0000, Access::Read), None);
    }

    #[test]
    fn partial_pages_extend_to_enclosing() {
        let m = space();
        m.reserve(0x1234, 1, Prot::READ | Prot::WRITE, false, MapKind::Anon)
            .unwrap();
        assert!(m.lookup(0x1000, Access::Read).is_some());
        assert!(m.lookup(0x1fff, Access::Read).is_some());
        assert!(m.lookup(0x2000, Access::Read).is_none());
    }

    #[test]
    fn clash_unless_fixed() {
        let m = space();
        m.reserve(0x1000, 0x1000, Prot::READ, false, MapKind::Anon).unwrap();
        assert!(matches!(
            m.reserve(0x1000, 0x1000, Prot::READ, false, MapKind::Anon),
            Err(Error::MappingClash(_))
        ));
        m.reserve(0x1000, 0x1000, Prot::READ, true, MapKind::Anon).unwrap();
    }

    #[test]
    fn write_denied_on_readonly() {
        let m = space();
        m.reserve(0x1000, 0x1000, Prot::READ, false, MapKind::Anon).unwrap();
        assert!(m.lookup(0x1500, Access::Read).is_some());
        assert!(m.lookup(0x1500, Access::Write).is_none());
        assert_eq!(m.copy_to_guest(0x1500, &[1, 2, 3]), 0);
    }

    #[test]
    fn exec_denied_on_nx() {
        let m = space();
        m.reserve(0x1000, 0x1000, Prot::READ | Prot::WRITE, false, MapKind::Anon)
            .unwrap();
        assert!(m.lookup(0x1000, Access::Exec).is_none());
        m.protect(0x1000, 0x1000, Prot::READ | Prot::EXEC).unwrap();
        assert!(m.lookup(0x1000, Access::Exec).is_some());
        assert!(m.lookup(0x1000, Access::Write).is_none());
    }

    #[test]
    fn copy_reports_partial_transfer() {
        let m = space();
        m.reserve(0x1000, 0x1000, Prot::READ | Prot::WRITE, false, MapKind::Anon)
            .unwrap();
        // 0x2000 is unmapped; a copy straddling the boundary stops there.
        let data = vec![0xabu8; 0x800];
        assert_eq!(m.copy_to_guest(0x1c00, &data), 0x400);
    }

    #[test]
    fn find_unmapped_first_fit() {
        let m = space();
        m.reserve(0x10_0000, 0x2000, Prot::READ, false, MapKind::Anon).unwrap();
        let at = m.find_unmapped(0x10_0000, 0x1000).unwrap();
        assert_eq!(at, 0x10_2000);
        let below = m.find_unmapped(0x1000, 0x1000).unwrap();
        assert_eq!(below, 0x1000);
    }

    #[test]
    fn free_unmaps() {
        let m = space();
        m.reserve(0x1000, 0x2000, Prot::READ | Prot::WRITE, false, MapKind::Anon)
            .unwrap();
        m.free(0x1000, 0x2000);
        assert!(m.lookup(0x1000, Access::Read).is_none());
        // The range can be reserved again without `fixed`.
        m.reserve(0x1000, 0x2000, Prot::READ, false, MapKind::Anon).unwrap();
    }
}
