//! Signal-management syscalls. These manipulate the guest's handler
//! table and masks; actual delivery happens at instruction boundaries.

use super::structs::*;
use super::xlat::errno::*;
use super::{gread, gwrite, SysResult};
use crate::error::Trap;
use crate::machine::Machine;
use crate::signals;
use crate::system::SigHandler;
use std::sync::atomic::Ordering;

const SIG_BLOCK: u64 = 0;
const SIG_UNBLOCK: u64 = 1;
const SIG_SETMASK: u64 = 2;

pub fn rt_sigaction(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let sig = a[0] as i32;
    if !(1..=64).contains(&sig) || a[3] != 8 {
        return Err(-EINVAL);
    }
    if sig == signals::SIGKILL || sig == signals::SIGSTOP {
        return Err(-EINVAL);
    }
    let mut handlers = m.sys.handlers.lock().unwrap();
    let slot = &mut handlers[sig as usize - 1];
    if a[2] != 0 {
        let old = GuestSigaction {
            handler: slot.handler,
            flags: slot.flags,
            restorer: slot.restorer,
            mask: slot.mask,
        };
        let mut b = [0u8; SIGACTION_SIZE];
        write_sigaction(&mut b, &old);
        gwrite(m, a[2], &b)?;
    }
    if a[1] != 0 {
        let mut b = [0u8; SIGACTION_SIZE];
        gread(m, a[1], &mut b)?;
        let new = read_sigaction(&b);
        *slot = SigHandler {
            handler: new.handler,
            flags: new.flags,
            restorer: new.restorer,
            mask: new.mask,
        };
    }
    Ok(0)
}

pub fn rt_sigprocmask(m: &mut Machine, a: [u64; 6]) -> SysResult {
    if a[3] != 8 {
        return Err(-EINVAL);
    }
    let old = m.sigmask;
    if a[1] != 0 {
        let mut b = [0u8; 8];
        gread(m, a[1], &mut b)?;
        let set = crate::endian::read_u64(&b);
        // SIGKILL and SIGSTOP can never be blocked.
        let set = set & !((1 << (signals::SIGKILL - 1)) | (1 << (signals::SIGSTOP - 1)));
        m.sigmask = match a[0] {
            SIG_BLOCK => old | set,
            SIG_UNBLOCK => old & !set,
            SIG_SETMASK => set,
            _ => return Err(-EINVAL),
        };
    }
    if a[2] != 0 {
        let mut b = [0u8; 8];
        crate::endian::write_u64(&mut b, old);
        gwrite(m, a[2], &b)?;
    }
    Ok(0)
}

/// Waits with a temporary mask until any signal is delivered. A fault
/// while building the delivery frame propagates as a `Trap` so it
/// reaches the fetch loop's catcher like every other guest fault.
pub fn rt_sigsuspend(m: &mut Machine, a: [u64; 6]) -> Result<i64, Trap> {
    let mut b = [0u8; 8];
    if gread(m, a[0], &mut b).is_err() {
        return Ok(-EFAULT);
    }
    let temp = crate::endian::read_u64(&b);
    let saved = m.sigmask;
    loop {
        let deliverable = m.shared.pending.load(Ordering::Acquire) & !temp;
        if deliverable != 0 {
            let sig = 64 - deliverable.leading_zeros() as i32;
            let handler = m.sys.handlers.lock().unwrap()[sig as usize - 1].handler;
            if handler > 1 {
                // Deliver under the caller's mask; the frame records it
                // so sigreturn lands back on it after the handler.
                m.shared
                    .pending
                    .fetch_and(!(1u64 << (sig - 1)), Ordering::AcqRel);
                m.sigmask = saved;
                // The frame must capture the syscall's own return value
                // so sigreturn comes back with -EINTR in RAX.
                m.set_gpr(crate::machine::RAX, (-EINTR) as u64);
                signals::deliver_signal(m, sig)?;
            } else {
                // Default or ignore: leave it for the boundary.
                m.sigmask = saved;
            }
            return Ok(-EINTR);
        }
        std::thread::sleep(std::time::Duration::from_millis(2));
        if m.sys.exiting.load(Ordering::Acquire) {
            m.sigmask = saved;
            return Ok(-EINTR);
        }
    }
}

pub fn pause(m: &mut Machine) -> SysResult {
    loop {
        if m.shared.pending.load(Ordering::Acquire) & !m.sigmask != 0 {
            return Err(-EINTR);
        }
        if m.sys.exiting.load(Ordering::Acquire) {
            return Err(-EINTR);
        }
        std::thread::sleep(std::time::Duration::from_millis(2));
    }
}

pub fn sigaltstack(m: &mut Machine, a: [u64; 6]) -> SysResult {
    const SS_DISABLE: u32 = 2;
    if a[1] != 0 {
        let mut b = [0u8; 24];
        let (sp, flags, size) = match m.altstack {
            Some((base, size)) => (base, 0u32, size),
            None => (0, SS_DISABLE, 0),
        };
        crate::endian::write_u64(&mut b[0..], sp);
        crate::endian::write_u32(&mut b[8..], flags);
        crate::endian::write_u64(&mut b[16..], size);
        gwrite(m, a[1], &b)?;
    }
    if a[0] != 0 {
        let mut b = [0u8; 24];
        gread(m, a[0], &mut b)?;
        let sp = crate::endian::read_u64(&b[0..]);
        let flags = crate::endian::read_u32(&b[8..]);
        let size = crate::endian::read_u64(&b[16..]);
        if flags & SS_DISABLE != 0 {
            m.altstack = None;
        } else {
            if size < 2048 {
                return Err(-ENOMEM);
            }
            m.altstack = Some((sp, size));
        }
    }
    Ok(0)
}
