//! Clocks, sleeps and interval timers.

use super::structs::*;
use super::xlat::{self, errno::*};
use super::{gread, gwrite, SysResult};
use crate::machine::Machine;

pub fn gettimeofday(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    if unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) } < 0 {
        return Err(xlat::last_errno());
    }
    if a[0] != 0 {
        let mut b = [0u8; TIMESPEC_SIZE];
        write_timeval(&mut b, tv.tv_sec, tv.tv_usec);
        gwrite(m, a[0], &b)?;
    }
    Ok(0)
}

pub fn clock_gettime(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let clock = xlat::clock_to_host(a[0])?;
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(clock, &mut ts) } < 0 {
        return Err(xlat::last_errno());
    }
    let mut b = [0u8; TIMESPEC_SIZE];
    write_timespec(&mut b, ts.tv_sec, ts.tv_nsec);
    gwrite(m, a[1], &b)?;
    Ok(0)
}

pub fn clock_getres(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let clock = xlat::clock_to_host(a[0])?;
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_getres(clock, &mut ts) } < 0 {
        return Err(xlat::last_errno());
    }
    if a[1] != 0 {
        let mut b = [0u8; TIMESPEC_SIZE];
        write_timespec(&mut b, ts.tv_sec, ts.tv_nsec);
        gwrite(m, a[1], &b)?;
    }
    Ok(0)
}

fn read_guest_timespec(m: &Machine, addr: u64) -> Result<libc::timespec, i64> {
    let mut b = [0u8; TIMESPEC_SIZE];
    gread(m, addr, &mut b)?;
    let (sec, nsec) = read_timespec(&b);
    if !(0..1_000_000_000).contains(&nsec) || sec < 0 {
        return Err(-EINVAL);
    }
    Ok(libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    })
}

fn write_guest_timespec(m: &Machine, addr: u64, ts: &libc::timespec) -> Result<(), i64> {
    let mut b = [0u8; TIMESPEC_SIZE];
    write_timespec(&mut b, ts.tv_sec, ts.tv_nsec);
    gwrite(m, addr, &b)
}

pub fn nanosleep(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let req = read_guest_timespec(m, a[0])?;
    let mut rem = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::nanosleep(&req, &mut rem) };
    if rc < 0 {
        // EINTR hands the remainder back and lets the signal deliver at
        // the next boundary.
        let e = xlat::last_errno();
        if e == -EINTR && a[1] != 0 {
            write_guest_timespec(m, a[1], &rem)?;
        }
        return Err(e);
    }
    Ok(0)
}

pub fn clock_nanosleep(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let clock = xlat::clock_to_host(a[0])?;
    let flags = a[1] as libc::c_int;
    let req = read_guest_timespec(m, a[2])?;
    let mut rem = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_nanosleep(clock, flags, &req, &mut rem) };
    if rc != 0 {
        if rc == libc::EINTR && a[3] != 0 && flags & libc::TIMER_ABSTIME == 0 {
            write_guest_timespec(m, a[3], &rem)?;
        }
        return Err(-xlat::errno_to_guest(nix::errno::Errno::from_i32(rc)));
    }
    Ok(0)
}

pub fn alarm(_m: &mut Machine, a: [u64; 6]) -> SysResult {
    Ok(unsafe { libc::alarm(a[0] as libc::c_uint) } as i64)
}

pub fn setitimer(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let which = a[0] as libc::c_int;
    let mut new: libc::itimerval = unsafe { std::mem::zeroed() };
    if a[1] != 0 {
        let mut b = [0u8; 32];
        gread(m, a[1], &mut b)?;
        let (isec, iusec) = read_timeval(&b[0..]);
        let (vsec, vusec) = read_timeval(&b[16..]);
        new.it_interval.tv_sec = isec;
        new.it_interval.tv_usec = iusec;
        new.it_value.tv_sec = vsec;
        new.it_value.tv_usec = vusec;
    }
    let mut old: libc::itimerval = unsafe { std::mem::zeroed() };
    if unsafe { libc::setitimer(which, &new, &mut old) } < 0 {
        return Err(xlat::last_errno());
    }
    if a[2] != 0 {
        let mut b = [0u8; 32];
        write_timeval(&mut b[0..], old.it_interval.tv_sec, old.it_interval.tv_usec);
        write_timeval(&mut b[16..], old.it_value.tv_sec, old.it_value.tv_usec);
        gwrite(m, a[2], &b)?;
    }
    Ok(0)
}

pub fn getitimer(m: &mut Machine, a: [u64; 6]) -> SysResult {
    let which = a[0] as libc::c_int;
    let mut cur: libc::itimerval = unsafe { std::mem::zeroed() };
    if unsafe { libc::getitimer(which, &mut cur) } < 0 {
        return Err(xlat::last_errno());
    }
    let mut b = [0u8; 32];
    write_timeval(&mut b[0..], cur.it_interval.tv_sec, cur.it_interval.tv_usec);
    write_timeval(&mut b[16..], cur.it_value.tv_sec, cur.it_value.tv_usec);
    gwrite(m, a[1], &b)?;
    Ok(0)
}
