//! Process-wide counters. Cheap relaxed atomics bumped from hot paths and
//! printed once at exit when the driver asks for them.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        $($(#[$doc])* pub static $name: AtomicU64 = AtomicU64::new(0);)*

        /// Renders every nonzero counter, one per line.
        pub fn report() -> String {
            let mut out = String::new();
            $(
                let v = $name.load(Ordering::Relaxed);
                if v != 0 {
                    out.push_str(&format!(
                        "{:<24} {}\n",
                        stringify!($name).to_lowercase(),
                        v
                    ));
                }
            )*
            out
        }
    };
}

counters! {
    /// Instructions retired by the interpreter.
    INSTRUCTIONS,
    /// Syscalls dispatched.
    SYSCALLS,
    /// Guest signals delivered to guest handlers.
    SIGNALS_DELIVERED,
    /// Host SIGSEGVs classified as self-modifying-code writes.
    SMC_SEGFAULTS,
    /// Pages pushed onto a self-modifying-code queue.
    SMC_ENQUEUED,
    /// Safe-point drains of a self-modifying-code queue.
    SMC_FLUSHES,
    /// Fetches served from a compiled path.
    JIT_HITS,
    /// Paths compiled.
    JIT_PATHS,
    /// Paths discarded by page invalidation.
    JIT_INVALIDATED,
    /// In-flight path recordings abandoned.
    JIT_ABANDONED,
    /// Pages faulted in lazily for stack growth.
    STACK_GROWS,
}

/// Bumps a counter by one.
#[inline]
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
