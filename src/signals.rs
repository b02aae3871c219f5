//! Dedicated signal-listening thread with stall detection.
//!
//! The interesting signals are blocked in the main thread before any
//! worker starts (the mask is inherited), and a single listener thread
//! consumes them with `sigtimedwait`. No async signal handler ever
//! touches shared state: SIGINT sets the stop flags and broadcasts the
//! condition variable, then re-raises itself under the original mask.
//!
//! The timeout doubles as the stall detector: if the global pack-id
//! has not advanced across two consecutive waits, a stall is declared,
//! the timeout stretches from the initial-check-time to the
//! check-repetition-time, and the sg driver's debug state is captured.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::errno::Errno;

use crate::state::{Shared, DEF_SDT_ICT_MS};
use crate::stats;
use crate::CopyConfig;

const SG_PROC_DEBUG: &str = "/proc/scsi/sg/debug";

/// The signals the listener owns.
const LISTEN_SIGNALS: [libc::c_int; 5] = [
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGPIPE,
    libc::SIGUSR1,
    libc::SIGUSR2,
];

pub struct SignalListener {
    handle: JoinHandle<()>,
}

impl SignalListener {
    pub fn join(self) {
        let _ = self.handle.join();
    }
}

fn build_sigset() -> libc::sigset_t {
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut set);
        for sig in LISTEN_SIGNALS {
            libc::sigaddset(&mut set, sig);
        }
    }
    set
}

/// Block the listener's signal set in the calling (main) thread and
/// return (set, previous mask). Must run before any worker thread is
/// spawned so they all inherit the blocked mask.
pub fn block_signals() -> (libc::sigset_t, libc::sigset_t) {
    let set = build_sigset();
    let mut orig: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut orig);
    }
    (set, orig)
}

fn dump_sg_debug() {
    match std::fs::read_to_string(SG_PROC_DEBUG) {
        Ok(s) => eprint!("{}", s),
        Err(e) => log::warn!("cannot read {}: {}", SG_PROC_DEBUG, e),
    }
}

fn reraise_with_default(sig: libc::c_int, orig_mask: &libc::sigset_t) {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(sig, &sa, std::ptr::null_mut());
        libc::pthread_sigmask(libc::SIG_SETMASK, orig_mask, std::ptr::null_mut());
        libc::raise(sig);
    }
}

/// Spawn the listener. `set`/`orig_mask` come from `block_signals`.
pub fn start(
    cfg: Arc<CopyConfig>,
    shared: Arc<Shared>,
    set: libc::sigset_t,
    orig_mask: libc::sigset_t,
) -> SignalListener {
    let handle = std::thread::Builder::new()
        .name("sgcopy-sig".to_string())
        .spawn(move || listen_loop(&cfg, &shared, set, orig_mask))
        .expect("failed to spawn signal thread");
    SignalListener { handle }
}

fn listen_loop(
    cfg: &CopyConfig,
    shared: &Shared,
    set: libc::sigset_t,
    orig_mask: libc::sigset_t,
) {
    let ict_ms = if cfg.sdt_ict_ms > 0 {
        cfg.sdt_ict_ms
    } else {
        DEF_SDT_ICT_MS
    };
    let mut ts = libc::timespec {
        tv_sec: i64::from(ict_ms / 1000),
        tv_nsec: i64::from(ict_ms % 1000) * 1_000_000,
    };
    let mut prev_pack_id = 0;
    let mut stall_reported = false;

    loop {
        let sig = unsafe { libc::sigtimedwait(&set, std::ptr::null_mut(), &ts) };
        if sig < 0 {
            let err = Errno::last();
            if err == Errno::EAGAIN && cfg.sdt_crt_sec > 0 {
                // timeout: has any command completed since last check?
                let pack_id = shared.current_pack_id();
                if pack_id > 1 && pack_id == prev_pack_id {
                    if !stall_reported {
                        stall_reported = true;
                        ts.tv_sec = i64::from(cfg.sdt_crt_sec);
                        ts.tv_nsec = 0;
                        log::warn!("first stall at pack_id={} detected", pack_id);
                    } else {
                        log::warn!("subsequent stall at pack_id={}", pack_id);
                    }
                    dump_sg_debug();
                } else {
                    prev_pack_id = pack_id;
                }
            } else if err != Errno::EAGAIN {
                log::warn!("sigtimedwait() failed: {}", err);
            }
        }
        match sig {
            libc::SIGINT | libc::SIGQUIT | libc::SIGPIPE => {
                log::warn!("interrupted by signal {}", sig);
                if shared.do_time > 0 {
                    stats::calc_duration_throughput(false, shared);
                }
                stats::print_stats("", shared);
                shared.stop_both();
                shared.out_sync_cv.notify_all();
                reraise_with_default(sig, &orig_mask);
                break;
            }
            libc::SIGUSR1 => {
                eprintln!("Progress report, continuing ...");
                if shared.do_time > 0 {
                    stats::calc_duration_throughput(true, shared);
                }
                stats::print_stats("  ", shared);
            }
            libc::SIGUSR2 => {
                if cfg.verbose > 2 {
                    log::debug!("signal thread interrupted by SIGUSR2");
                }
                shared.out_sync_cv.notify_all();
                break;
            }
            _ => {}
        }
        if shared.shutting_down.load(Ordering::SeqCst) {
            break;
        }
    }
    if cfg.verbose > 3 {
        log::debug!("signal thread exiting");
    }
}
