//! This module provides the crate's `Error` type using the [`thiserror`]
//! crate, plus the [`Trap`] value that inner execution routines return to
//! escape to the fetch loop.

use thiserror::Error;

/// The `Error` type. These are host-side failures the guest never
/// observes; anything guest-visible travels as a [`Trap`] instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The guest address space has no room for the request.
    #[error("out of guest memory")]
    OutOfMemory,
    /// The page-table pool inside the arena is exhausted.
    #[error("page-table pool exhausted")]
    PageTableExhausted,
    /// A mapping request collided with an existing reservation.
    #[error("guest mapping clash at {0:#x}")]
    MappingClash(u64),
    /// The guest address is invalid.
    #[error("invalid guest address {0:#x}")]
    InvalidGuestAddress(u64),
    /// The self-modifying-code queue overflowed, which means coherence
    /// with compiled code can no longer be guaranteed.
    #[error("self-modifying-code queue exhausted")]
    SmcQueueFull,
    /// The program image could not be loaded.
    #[error("loader: {0}")]
    Loader(String),
    /// Wraps [`std::io::Error`].
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Wraps an error that originates from any calls to the [`nix`] crate.
    #[error(transparent)]
    Nix(#[from] nix::Error),
    /// Wraps [`mmap_rs::Error`].
    #[error(transparent)]
    Mmap(#[from] mmap_rs::Error),
}

/// Why an instruction could not retire. Each variant maps onto the guest
/// signal that delivery will raise; the fetch loop is the single place
/// that catches these.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Trap {
    /// Invalid or unsupported encoding; delivers SIGILL.
    InvalidOpcode,
    /// A required guest access touched an unmapped or protected page;
    /// delivers SIGSEGV with the faulting address in `si_addr`.
    PageFault { addr: u64, write: bool },
    /// Integer divide by zero or quotient overflow; delivers SIGFPE.
    DivideError,
    /// Unmasked x87 exception; delivers SIGFPE.
    FpuFault,
    /// INT3 or a TF single-step boundary; delivers SIGTRAP.
    Debug,
    /// The guest called exit_group (or the last thread called exit).
    Exit { status: i32 },
    /// A signal became deliverable mid-instruction (REP iteration or a
    /// blocking syscall returning EINTR); retire at the boundary.
    Interrupted,
}

impl Trap {
    /// The Linux signal number this trap delivers as, or `None` for the
    /// control-flow variants.
    pub fn signal(self) -> Option<i32> {
        match self {
            Trap::InvalidOpcode => Some(crate::signals::SIGILL),
            Trap::PageFault { .. } => Some(crate::signals::SIGSEGV),
            Trap::DivideError | Trap::FpuFault => Some(crate::signals::SIGFPE),
            Trap::Debug => Some(crate::signals::SIGTRAP),
            Trap::Exit { .. } | Trap::Interrupted => None,
        }
    }
}
