//! The thin driver: parse flags, load the program, run it, map the
//! outcome onto the conventional exit codes.

use clap::Parser;
use log::error;
use std::ffi::CString;
use std::path::PathBuf;
use ux64::machine::Exit;
use ux64::{loader, signals, stats, Machine, System};

#[derive(Parser)]
#[command(name = "ux64", about = "user-mode x86-64 Linux emulator", version)]
struct Args {
    /// Program to run.
    program: PathBuf,

    /// Arguments passed to the guest.
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    /// Log verbosity (repeat for more).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print statistics on exit.
    #[arg(short = 's')]
    stats: bool,

    /// Enable the JIT path cache (implies -m).
    #[arg(short = 'j')]
    jit: bool,

    /// Permit host protections to mirror guest code pages.
    #[arg(short = 'm')]
    linear: bool,

    /// Append the log to this file instead of stderr.
    #[arg(short = 'L')]
    log_file: Option<PathBuf>,

    /// Pause when execution reaches this address (hex).
    #[arg(short = 'b')]
    breakpoint: Option<String>,

    /// Record a watchpoint address (hex).
    #[arg(short = 'w')]
    watchpoint: Option<String>,

    /// Refuse network connect().
    #[arg(short = 'C')]
    no_connect: bool,
}

fn parse_addr(s: &str) -> Option<u64> {
    let s = s.trim_start_matches("0x");
    u64::from_str_radix(s, 16).ok()
}

fn main() {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }),
    );
    if let Some(path) = &args.log_file {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => {
                logger.target(env_logger::Target::Pipe(Box::new(f)));
            }
            Err(e) => eprintln!("ux64: cannot open log file: {}", e),
        }
    }
    logger.init();

    let linear = args.linear || args.jit;
    let sys = match System::new(linear, args.jit) {
        Ok(sys) => sys,
        Err(e) => {
            error!("vm bootstrap failed: {}", e);
            std::process::exit(1);
        }
    };

    if args.no_connect {
        sys.allow_connect
            .store(false, std::sync::atomic::Ordering::Relaxed);
    }
    if let Some(b) = args.breakpoint.as_deref().and_then(parse_addr) {
        sys.add_breakpoint(b);
    }
    if let Some(w) = args.watchpoint.as_deref().and_then(parse_addr) {
        sys.add_watchpoint(w);
    }

    if let Err(e) = signals::install_host_handlers() {
        error!("cannot install host signal handlers: {}", e);
        std::process::exit(1);
    }

    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
    let mut machine = Machine::new(sys, tid);

    let mut argv = vec![CString::new(args.program.display().to_string()).unwrap()];
    argv.extend(
        args.args
            .iter()
            .filter_map(|a| CString::new(a.as_str()).ok()),
    );
    let envp: Vec<CString> = std::env::vars()
        .filter_map(|(k, v)| CString::new(format!("{}={}", k, v)).ok())
        .collect();

    if let Err(e) = loader::load_program(&mut machine, &args.program, &argv, &envp) {
        eprintln!("ux64: {}: {}", args.program.display(), e);
        std::process::exit(127);
    }

    let exit = machine.run();

    if args.stats {
        eprint!("{}", stats::report());
    }

    match exit {
        Exit::Status(code) => std::process::exit(code & 0xff),
        Exit::Signal(sig) => std::process::exit(128 + sig),
        Exit::Breakpoint(addr) => {
            eprintln!("ux64: breakpoint at {:#x}", addr);
            std::process::exit(0);
        }
    }
}
