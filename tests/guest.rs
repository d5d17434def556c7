//! End-to-end guest scenarios: tiny hand-assembled programs run through
//! the full load/fetch/dispatch/syscall stack.

use std::ffi::CString;
use std::sync::atomic::Ordering;
use ux64::fd::FdEntry;
use ux64::flags::Rflags;
use ux64::machine::{Exit, Machine, RAX, RCX};
use ux64::mmu::{MapKind, Prot};
use ux64::{loader, signals, System};

/// Builds a minimal static ELF whose single R+X PT_LOAD maps the file,
/// with the entry point right after the headers.
fn tiny_elf(code: &[u8]) -> Vec<u8> {
    let mut f = Vec::new();
    let entry: u64 = 0x40_0078;
    f.extend_from_slice(b"\x7fELF\x02\x01\x01\x00");
    f.extend_from_slice(&[0; 8]);
    f.extend_from_slice(&2u16.to_le_bytes());
    f.extend_from_slice(&62u16.to_le_bytes());
    f.extend_from_slice(&1u32.to_le_bytes());
    f.extend_from_slice(&entry.to_le_bytes());
    f.extend_from_slice(&64u64.to_le_bytes());
    f.extend_from_slice(&0u64.to_le_bytes());
    f.extend_from_slice(&0u32.to_le_bytes());
    f.extend_from_slice(&64u16.to_le_bytes());
    f.extend_from_slice(&56u16.to_le_bytes());
    f.extend_from_slice(&1u16.to_le_bytes());
    f.extend_from_slice(&[0u8; 6]);
    let filesz = 0x78 + code.len() as u64;
    f.extend_from_slice(&1u32.to_le_bytes());
    f.extend_from_slice(&5u32.to_le_bytes());
    f.extend_from_slice(&0u64.to_le_bytes());
    f.extend_from_slice(&0x40_0000u64.to_le_bytes());
    f.extend_from_slice(&0x40_0000u64.to_le_bytes());
    f.extend_from_slice(&filesz.to_le_bytes());
    f.extend_from_slice(&filesz.to_le_bytes());
    f.extend_from_slice(&0x1000u64.to_le_bytes());
    f.extend_from_slice(code);
    f
}

fn load(code: &[u8]) -> Machine {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guest");
    std::fs::write(&path, tiny_elf(code)).unwrap();
    let sys = System::new(false, false).unwrap();
    let mut m = Machine::new(sys, 1);
    let argv = vec![CString::new("guest").unwrap()];
    loader::load_program(&mut m, &path, &argv, &[]).unwrap();
    m
}

/// A machine with raw code mapped R+X at 0x400000 and a stack, skipping
/// the ELF path, for instruction-level scenarios.
fn machine_with_code(code: &[u8], linear: bool, jit: bool) -> Machine {
    let sys = System::new(linear, jit).unwrap();
    sys.mem
        .reserve(0x40_0000, 0x1000, Prot::READ | Prot::WRITE, false, MapKind::Image)
        .unwrap();
    sys.mem.copy_to_guest(0x40_0000, code);
    sys.mem
        .protect(0x40_0000, 0x1000, Prot::READ | Prot::WRITE | Prot::EXEC)
        .unwrap();
    sys.mem
        .reserve(0x7f_0000, 0x10000, Prot::READ | Prot::WRITE, false, MapKind::Stack)
        .unwrap();
    let mut m = Machine::new(sys, 1);
    m.ip = 0x40_0000;
    m.set_gpr(ux64::machine::RSP, 0x7f_0000 + 0x10000 - 64);
    m
}

#[test]
fn static_exit_42() {
    // _start: mov eax, 231; mov edi, 42; syscall
    let mut m = load(&[0xb8, 0xe7, 0, 0, 0, 0xbf, 0x2a, 0, 0, 0, 0x0f, 0x05]);
    match m.run() {
        Exit::Status(42) => {}
        other => panic!("expected exit 42, got {:?}", other),
    }
}

#[test]
fn hello_world_via_write() {
    // write(1, msg, 12); exit(0)
    let code: &[u8] = &[
        0xb8, 0x01, 0, 0, 0, // mov eax, 1
        0xbf, 0x01, 0, 0, 0, // mov edi, 1
        0x48, 0x8d, 0x35, 0x10, 0, 0, 0, // lea rsi, [rip+16]
        0xba, 0x0c, 0, 0, 0, // mov edx, 12
        0x0f, 0x05, // syscall
        0xb8, 0xe7, 0, 0, 0, // mov eax, 231
        0x31, 0xff, // xor edi, edi
        0x0f, 0x05, // syscall
        b'h', b'e', b'l', b'l', b'o', b' ', b'w', b'o', b'r', b'l', b'd', b'\n',
    ];
    let mut m = load(code);

    // Capture guest stdout through a pipe.
    let (r, w) = nix::unistd::pipe().unwrap();
    m.sys
        .fds
        .lock()
        .unwrap()
        .put(1, FdEntry::host(w, 0, None));

    match m.run() {
        Exit::Status(0) => {}
        other => panic!("expected exit 0, got {:?}", other),
    }
    nix::unistd::close(w).ok();
    let mut buf = [0u8; 64];
    let n = nix::unistd::read(r, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello world\n");
    nix::unistd::close(r).ok();
}

#[test]
fn null_load_is_a_segfault() {
    // mov rax, [0]
    let mut m = load(&[0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0]);
    match m.run() {
        Exit::Signal(sig) => assert_eq!(sig, signals::SIGSEGV),
        other => panic!("expected SIGSEGV, got {:?}", other),
    }
    let report = m.fault_report(signals::SIGSEGV);
    assert!(report.contains("SEGMENTATION FAULT"), "{}", report);
    assert!(report.contains("addr=0x0"), "{}", report);
}

#[test]
fn trap_flag_single_steps() {
    // pushfq; pop rax; or ax, 0x100; push rax; popfq; nop; nop
    let code: &[u8] = &[
        0x9c, // pushfq
        0x58, // pop rax
        0x66, 0x0d, 0x00, 0x01, // or ax, 0x100
        0x50, // push rax
        0x9d, // popfq
        0x90, // nop        <- traps after this one
        0x90, // nop
    ];
    let mut m = machine_with_code(code, false, false);
    let trap_bit = 1u64 << (signals::SIGTRAP - 1);

    for _ in 0..5 {
        m.step().unwrap(); // through popfq
    }
    assert!(m.flag(Rflags::TF));
    // The instruction right after the POPF that set TF runs untrapped.
    assert_eq!(m.shared.pending.load(Ordering::Acquire) & trap_bit, 0);

    m.step().unwrap(); // first nop
    assert_ne!(
        m.shared.pending.load(Ordering::Acquire) & trap_bit,
        0,
        "single-step trap after the first instruction under TF"
    );
}

#[test]
fn syscall_does_not_single_step_trap() {
    // With TF set, a syscall (getuid) must not queue the trap.
    let code: &[u8] = &[
        0x9c, 0x58, 0x66, 0x0d, 0x00, 0x01, 0x50, 0x9d, // set TF
        0x6a, 0x66, // push 102
        0x58, // pop rax    <- traps (TF active)
        0x0f, 0x05, // syscall  <- must not trap
    ];
    let mut m = machine_with_code(code, false, false);
    let trap_bit = 1u64 << (signals::SIGTRAP - 1);
    for _ in 0..5 {
        m.step().unwrap();
    }
    for _ in 0..2 {
        // push/pop both trap; consume the pending bit each time.
        m.step().unwrap();
        assert_ne!(m.shared.pending.load(Ordering::Acquire) & trap_bit, 0);
        m.shared.pending.fetch_and(!trap_bit, Ordering::AcqRel);
        m.shared.attention.store(false, Ordering::Release);
    }
    assert_eq!(m.gpr(RAX), 102);
    m.step().unwrap(); // the syscall itself
    assert_eq!(
        m.shared.pending.load(Ordering::Acquire) & trap_bit,
        0,
        "no trap right after SYSCALL"
    );
    assert_eq!(m.gpr(RAX), unsafe { libc::getuid() } as u64);
}

#[test]
fn self_modifying_code_is_observed() {
    // The guest patches the immediate of a later mov, then executes it.
    //   mov al, 42
    //   mov [rip+1], al     ; patches the imm byte of the next mov
    //   mov eax, 0          ; imm becomes 42
    let code: &[u8] = &[
        0xb0, 0x2a, // mov al, 42
        0x88, 0x05, 0x01, 0x00, 0x00, 0x00, // mov [rip+1], al
        0xb8, 0x00, 0x00, 0x00, 0x00, // mov eax, imm32
    ];
    let mut m = machine_with_code(code, false, false);
    m.step().unwrap();
    m.step().unwrap();
    m.step().unwrap();
    assert_eq!(m.gpr(RAX), 42, "store to code must be visible on refetch");
}

#[test]
fn jit_paths_execute_and_invalidate() {
    // dec ecx / jnz loop, run enough times to promote the body.
    let code: &[u8] = &[
        0xb9, 0x40, 0x00, 0x00, 0x00, // mov ecx, 64
        0xff, 0xc8, // dec eax (filler straight-line body)
        0xff, 0xc9, // dec ecx
        0x75, 0xfa, // jnz body
        0xf4, // hlt (stop marker; decodes to invalid-op trap)
    ];
    let mut m = machine_with_code(code, true, true);
    assert!(m.sys.jit.enabled());
    loop {
        match m.step() {
            Ok(()) => {}
            Err(ux64::Trap::InvalidOpcode) => break,
            Err(t) => panic!("unexpected trap {:?}", t),
        }
    }
    assert_eq!(m.gpr(RCX), 0);
    // The loop body at 0x400005 ran 64 times; a path must exist.
    assert!(
        m.sys.jit.lookup(0x40_0005).is_some(),
        "hot straight-line run was not promoted"
    );
    // A write to the page discards it.
    m.sys.jit.invalidate_page(0x40_0000);
    assert!(m.sys.jit.lookup(0x40_0005).is_none());
}

#[test]
fn guest_handler_receives_signal_frame() {
    // Install a guest SIGUSR1 handler whose body is just a marker; the
    // delivery path must transfer control there with the documented
    // argument registers.
    let code: &[u8] = &[0x90, 0x90, 0x90, 0x90]; // nops
    let mut m = machine_with_code(code, false, false);
    {
        let mut handlers = m.sys.handlers.lock().unwrap();
        handlers[signals::SIGUSR1 as usize - 1] = ux64::system::SigHandler {
            handler: 0x40_0002,
            flags: 0,
            restorer: 0x40_0003,
            mask: 0,
        };
    }
    m.shared.post_signal(signals::SIGUSR1);
    m.step().unwrap(); // boundary delivers, then executes at the handler
    assert_eq!(m.ip, 0x40_0003, "executing inside the handler");
    assert_eq!(m.gpr(ux64::machine::RDI), signals::SIGUSR1 as u64);
    assert_ne!(m.gpr(ux64::machine::RSI), 0, "siginfo pointer");
    assert_ne!(m.gpr(ux64::machine::RDX), 0, "ucontext pointer");
    // The return address on the stack is the restorer.
    let mut b = [0u8; 8];
    m.read_bytes(m.gpr(ux64::machine::RSP), &mut b).unwrap();
    assert_eq!(u64::from_le_bytes(b), 0x40_0003);
}

#[test]
fn sigreturn_restores_interrupted_context() {
    let code: &[u8] = &[0x90, 0x90, 0x90, 0x90];
    let mut m = machine_with_code(code, false, false);
    {
        let mut handlers = m.sys.handlers.lock().unwrap();
        handlers[signals::SIGUSR1 as usize - 1] = ux64::system::SigHandler {
            handler: 0x40_0002,
            flags: 0,
            restorer: 0,
            mask: 0,
        };
    }
    m.set_gpr(RAX, 0x1234_5678);
    m.shared.post_signal(signals::SIGUSR1);
    m.step().unwrap();
    // Inside the handler RAX was repurposed; sigreturn brings it back.
    signals::sigreturn(&mut m).unwrap();
    assert_eq!(m.gpr(RAX), 0x1234_5678);
    assert_eq!(m.ip, 0x40_0000, "resumes at the interrupted instruction");
    assert_eq!(m.sig, 0);
}

#[test]
fn highest_pending_signal_delivers_first() {
    let code: &[u8] = &[0x90, 0x90];
    let mut m = machine_with_code(code, false, false);
    {
        let mut handlers = m.sys.handlers.lock().unwrap();
        for sig in [signals::SIGUSR1, signals::SIGUSR2] {
            handlers[sig as usize - 1] = ux64::system::SigHandler {
                handler: 0x40_0001,
                flags: 0,
                restorer: 0,
                mask: 0,
            };
        }
    }
    m.shared.post_signal(signals::SIGUSR1); // 10
    m.shared.post_signal(signals::SIGUSR2); // 12
    m.step().unwrap();
    assert_eq!(
        m.gpr(ux64::machine::RDI),
        signals::SIGUSR2 as u64,
        "signal 12 outranks signal 10"
    );
    // The lower one stays pending.
    assert_ne!(
        m.shared.pending.load(Ordering::Acquire) & (1 << (signals::SIGUSR1 - 1)),
        0
    );
}

#[test]
fn brk_heap_roundtrip_through_syscalls() {
    // brk(0) then brk(+0x1000), then a store/load into the new heap.
    let code: &[u8] = &[
        0xb8, 0x0c, 0, 0, 0, // mov eax, 12 (brk)
        0x31, 0xff, // xor edi, edi
        0x0f, 0x05, // syscall -> current brk in rax
        0x48, 0x89, 0xc7, // mov rdi, rax
        0x48, 0x81, 0xc7, 0x00, 0x10, 0x00, 0x00, // add rdi, 0x1000
        0xb8, 0x0c, 0, 0, 0, // mov eax, 12
        0x0f, 0x05, // syscall
        0xc6, 0x40, 0xff, 0x5a, // mov byte [rax-1], 0x5a
        0x8a, 0x58, 0xff, // mov bl, [rax-1]
        0xb8, 0xe7, 0, 0, 0, // mov eax, 231
        0xbf, 0x00, 0, 0, 0, // mov edi, 0
        0x0f, 0x05, // syscall
    ];
    let mut m = load(code);
    match m.run() {
        Exit::Status(0) => {}
        other => panic!("expected clean exit, got {:?}", other),
    }
    assert_eq!(m.gpr(ux64::machine::RBX) & 0xff, 0x5a);
}
