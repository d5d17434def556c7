//! The optional path cache.
//!
//! A *path* is a maximal straight-line run of decoded instructions inside
//! one guest page. Once an address has been fetched often enough, the
//! interpreter records the decoded form and handler address of each
//! instruction as it executes; replaying the path later skips fetch and
//! decode entirely. The handlers double as the compilation templates, so
//! a path is exactly the sequence of (handler, operands) pairs.
//!
//! Coherence is the SMC tracker's job: a guest store into a page that
//! backs any path discards every path starting on that page before the
//! store is observable.

use crate::decode::DecodedInsn;
use crate::error::Trap;
use crate::machine::Machine;
use crate::stats;
use crate::tunables::{JIT_HOT_THRESHOLD, JIT_MAX_PATH};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A micro-op handler. The same function pointers the interpreter
/// dispatches through serve as the path templates.
pub type OpFn = fn(&mut Machine, &DecodedInsn) -> Result<(), Trap>;

/// One recorded micro-op.
pub struct PathOp {
    pub op: OpFn,
    pub insn: DecodedInsn,
}

/// A compiled straight-line path.
pub struct Path {
    /// Guest address of the first instruction.
    pub start: u64,
    /// Encoded byte length of the whole path.
    pub len: u64,
    pub ops: Vec<PathOp>,
}

/// Path recording in progress on one Machine.
pub struct PathBuilder {
    pub start: u64,
    pub next: u64,
    pub ops: Vec<PathOp>,
}

impl PathBuilder {
    pub fn new(start: u64) -> Self {
        Self {
            start,
            next: start,
            ops: Vec::new(),
        }
    }
}

pub struct Jit {
    enabled: AtomicBool,
    paths: Mutex<HashMap<u64, Arc<Path>>>,
    /// Guest page -> path start addresses on that page.
    by_page: Mutex<HashMap<u64, Vec<u64>>>,
    /// The code-hit histogram driving promotion.
    hot: Mutex<HashMap<u64, u32>>,
}

impl Jit {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            paths: Mutex::new(HashMap::new()),
            by_page: Mutex::new(HashMap::new()),
            hot: Mutex::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// The compiled path starting at `ip`, if any.
    pub fn lookup(&self, ip: u64) -> Option<Arc<Path>> {
        if !self.enabled() {
            return None;
        }
        let hit = self.paths.lock().unwrap().get(&ip).cloned();
        if hit.is_some() {
            stats::bump(&stats::JIT_HITS);
        }
        hit
    }

    /// Bumps the hit counter for `ip`; true once it crosses the
    /// promotion threshold and no path exists yet.
    pub fn should_record(&self, ip: u64) -> bool {
        if !self.enabled() {
            return false;
        }
        if self.paths.lock().unwrap().contains_key(&ip) {
            return false;
        }
        let mut hot = self.hot.lock().unwrap();
        let n = hot.entry(ip).or_insert(0);
        *n += 1;
        *n == JIT_HOT_THRESHOLD
    }

    /// Installs a finished path, indexing it by its page.
    pub fn install(&self, path: Path) {
        if path.ops.is_empty() {
            return;
        }
        let page = path.start & !4095;
        stats::bump(&stats::JIT_PATHS);
        self.by_page
            .lock()
            .unwrap()
            .entry(page)
            .or_default()
            .push(path.start);
        self.paths.lock().unwrap().insert(path.start, Arc::new(path));
    }

    /// Discards every path starting on `page`.
    pub fn invalidate_page(&self, page: u64) {
        let page = page & !4095;
        let starts = self.by_page.lock().unwrap().remove(&page);
        if let Some(starts) = starts {
            let mut paths = self.paths.lock().unwrap();
            for start in starts {
                if paths.remove(&start).is_some() {
                    stats::bump(&stats::JIT_INVALIDATED);
                }
            }
        }
        self.hot.lock().unwrap().retain(|ip, _| ip & !4095 != page);
    }

    /// Whether any path is indexed under `page`.
    pub fn page_has_code(&self, page: u64) -> bool {
        self.by_page.lock().unwrap().contains_key(&(page & !4095))
    }
}

/// Whether a recording may continue through this instruction: it must be
/// straight-line and stay on the path's starting page.
pub fn extends_path(builder: &PathBuilder, insn: &DecodedInsn, at: u64) -> bool {
    builder.ops.len() < JIT_MAX_PATH
        && at == builder.next
        && at & !4095 == builder.start & !4095
        && !ends_path(insn)
}

/// Instructions that terminate a path: control flow, syscalls, anything
/// privileged or self-referential.
pub fn ends_path(insn: &DecodedInsn) -> bool {
    use crate::decode::OpMap;
    match insn.map {
        OpMap::One => matches!(
            insn.opcode,
            0x70..=0x7f    // Jcc
                | 0x9c | 0x9d  // pushf/popf (TF handling)
                | 0xc2 | 0xc3  // ret
                | 0xc8 | 0xc9  // enter/leave are fine, but keep frames simple
                | 0xca | 0xcb
                | 0xcc | 0xcd | 0xce | 0xcf // int
                | 0xe0..=0xe3  // loop/jcxz
                | 0xe8 | 0xe9 | 0xea | 0xeb // call/jmp
                | 0xf1 | 0xf4
        ) || (insn.opcode == 0xff && matches!(insn.reg & 7, 2..=5)),
        OpMap::Two => matches!(insn.opcode, 0x05 | 0x07 | 0x80..=0x8f | 0x30..=0x35),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{decode, CpuMode};

    fn nopish(m: &mut Machine, _i: &DecodedInsn) -> Result<(), Trap> {
        let _ = m;
        Ok(())
    }

    fn fake_path(start: u64, n: usize) -> Path {
        let insn = decode(&[0x90], CpuMode::Long).unwrap();
        Path {
            start,
            len: n as u64,
            ops: (0..n)
                .map(|_| PathOp {
                    op: nopish,
                    insn: insn.clone(),
                })
                .collect(),
        }
    }

    #[test]
    fn promotion_threshold() {
        let jit = Jit::new(true);
        for _ in 0..JIT_HOT_THRESHOLD - 1 {
            assert!(!jit.should_record(0x1000));
        }
        assert!(jit.should_record(0x1000));
        // Only fires once.
        assert!(!jit.should_record(0x1000));
    }

    #[test]
    fn install_lookup_invalidate() {
        let jit = Jit::new(true);
        jit.install(fake_path(0x2010, 3));
        assert!(jit.lookup(0x2010).is_some());
        assert!(jit.page_has_code(0x2000));
        // A write to an unrelated page invalidates nothing.
        jit.invalidate_page(0x5000);
        assert!(jit.lookup(0x2010).is_some());
        jit.invalidate_page(0x2000);
        assert!(jit.lookup(0x2010).is_none());
        assert!(!jit.page_has_code(0x2000));
    }

    #[test]
    fn disabled_jit_never_records() {
        let jit = Jit::new(false);
        for _ in 0..2 * JIT_HOT_THRESHOLD {
            assert!(!jit.should_record(0x1000));
        }
        assert!(jit.lookup(0x1000).is_none());
    }

    #[test]
    fn branches_end_paths() {
        let jmp = decode(&[0xeb, 0x02], CpuMode::Long).unwrap();
        assert!(ends_path(&jmp));
        let syscall = decode(&[0x0f, 0x05], CpuMode::Long).unwrap();
        assert!(ends_path(&syscall));
        let mov = decode(&[0x48, 0x89, 0xf8], CpuMode::Long).unwrap();
        assert!(!ends_path(&mov));
    }
}
