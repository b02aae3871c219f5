//! Run statistics: event counters, `dd`-style records reporting,
//! throughput calculation and the optional JSON dump.

use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use serde::Serialize;

use crate::state::Shared;

/// Process-wide event counters, bumped from the submission/completion
/// paths and printed (selectively) at exit.
#[derive(Debug, Default)]
pub struct EventCounts {
    /// EAGAIN on submission, retried.
    pub num_start_eagain: AtomicI32,
    /// EAGAIN on completion fetch, retried.
    pub num_fin_eagain: AtomicI32,
    /// EBUSY on either, retried.
    pub num_ebusy: AtomicI32,
    /// SG_IOABORT requests issued (per command).
    pub num_abort_req: AtomicI32,
    pub num_abort_req_success: AtomicI32,
    /// SG_IOABORT requests issued (per MRQ group).
    pub num_mrq_abort_req: AtomicI32,
    pub num_mrq_abort_req_success: AtomicI32,
    /// VERIFY miscompares seen.
    pub num_miscompare: AtomicI32,
    /// SG_GET_NUM_WAITING polls.
    pub num_waiting_calls: AtomicI64,
}

impl EventCounts {
    pub fn bump(counter: &AtomicI32) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Serializable snapshot of a finished run, for `--json`.
#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub records_in_full: i64,
    pub records_in_partial: i32,
    pub records_out_full: i64,
    pub records_out_partial: i32,
    pub remaining_blocks: i64,
    pub elapsed_secs: f64,
    pub mb_per_sec: Option<f64>,
    pub dio_incomplete: i32,
    pub sum_of_resids: i32,
    pub start_eagains: i32,
    pub finish_eagains: i32,
    pub ebusies: i32,
    pub aborts_requested: i32,
    pub aborts_succeeded: i32,
    pub mrq_aborts_requested: i32,
    pub mrq_aborts_succeeded: i32,
    pub miscompares: i32,
    pub num_waiting_calls: i64,
    pub exit_status: i32,
}

impl StatsReport {
    pub fn gather(shared: &Shared) -> Self {
        let infull = shared.dd_count - shared.in_rem_count.load(Ordering::SeqCst);
        let outfull = shared.dd_count - shared.out_rem_count.load(Ordering::SeqCst);
        let in_partial = shared.in_partial.load(Ordering::SeqCst);
        let out_partial = shared.out_partial.load(Ordering::SeqCst);
        let elapsed = shared.start.elapsed().as_secs_f64();
        let bytes = shared.bs as f64 * outfull as f64;
        let mbps = if elapsed > 0.00001 && bytes > 511.0 {
            Some(bytes / (elapsed * 1_000_000.0))
        } else {
            None
        };
        StatsReport {
            records_in_full: infull - i64::from(in_partial),
            records_in_partial: in_partial,
            records_out_full: if shared.out_is_null {
                0
            } else {
                outfull - i64::from(out_partial)
            },
            records_out_partial: if shared.out_is_null { 0 } else { out_partial },
            remaining_blocks: shared.out_rem_count.load(Ordering::SeqCst),
            elapsed_secs: elapsed,
            mb_per_sec: mbps,
            dio_incomplete: shared.dio_incomplete_count.load(Ordering::SeqCst),
            sum_of_resids: shared.sum_of_resids.load(Ordering::SeqCst),
            start_eagains: shared.ev.num_start_eagain.load(Ordering::SeqCst),
            finish_eagains: shared.ev.num_fin_eagain.load(Ordering::SeqCst),
            ebusies: shared.ev.num_ebusy.load(Ordering::SeqCst),
            aborts_requested: shared.ev.num_abort_req.load(Ordering::SeqCst),
            aborts_succeeded: shared.ev.num_abort_req_success.load(Ordering::SeqCst),
            mrq_aborts_requested: shared.ev.num_mrq_abort_req.load(Ordering::SeqCst),
            mrq_aborts_succeeded: shared.ev.num_mrq_abort_req_success.load(Ordering::SeqCst),
            miscompares: shared.ev.num_miscompare.load(Ordering::SeqCst),
            num_waiting_calls: shared.ev.num_waiting_calls.load(Ordering::SeqCst),
            exit_status: shared.exit_status(),
        }
    }
}

/// Print the `dd` convention `N+P records in/out` lines. `prefix` is
/// indentation for interim (progress) reports.
pub fn print_stats(prefix: &str, shared: &Shared) {
    let out_rem = shared.out_rem_count.load(Ordering::SeqCst);
    if out_rem != 0 {
        eprintln!("  remaining block count={}", out_rem);
    }
    let infull = shared.dd_count - shared.in_rem_count.load(Ordering::SeqCst);
    let in_partial = shared.in_partial.load(Ordering::SeqCst);
    eprintln!(
        "{}{}+{} records in",
        prefix,
        infull - i64::from(in_partial),
        in_partial
    );
    if shared.out_is_null {
        eprintln!("{}0+0 records out", prefix);
    } else {
        let outfull = shared.dd_count - out_rem;
        let out_partial = shared.out_partial.load(Ordering::SeqCst);
        eprintln!(
            "{}{}+{} records {}",
            prefix,
            outfull - i64::from(out_partial),
            out_partial,
            if shared.verify { "verified" } else { "out" }
        );
    }
}

/// Print elapsed time and MB/sec. `contin` marks an interim report.
pub fn calc_duration_throughput(contin: bool, shared: &Shared) {
    let elapsed = shared.start.elapsed();
    let secs = elapsed.as_secs_f64();
    let done = shared.dd_count - shared.out_rem_count.load(Ordering::SeqCst);
    let bytes = shared.bs as f64 * done as f64;
    let mut line = format!(
        "time to {} data {} {}.{:06} secs",
        if shared.verify { "verify" } else { "copy" },
        if contin { "so far" } else { "was" },
        elapsed.as_secs(),
        elapsed.subsec_micros()
    );
    if secs > 0.00001 && bytes > 511.0 {
        line.push_str(&format!(", {:.2} MB/sec", bytes / (secs * 1_000_000.0)));
    }
    eprintln!("{}", line);
}

/// Verbose-tier counter report at exit, mirroring what the event
/// counters accumulated; always-on lines (resid sums, DIO demotions)
/// are handled by the caller which knows about the allow_dio hint.
pub fn print_event_counts(shared: &Shared, verbose: u8, aen_given: bool, m_aen_given: bool) {
    let ev = &shared.ev;
    if verbose > 0 {
        let v = ev.num_start_eagain.load(Ordering::SeqCst);
        if v > 0 {
            eprintln!("Number of start EAGAINs: {}", v);
        }
        let v = ev.num_fin_eagain.load(Ordering::SeqCst);
        if v > 0 {
            eprintln!("Number of finish EAGAINs: {}", v);
        }
        let v = ev.num_ebusy.load(Ordering::SeqCst);
        if v > 0 {
            eprintln!("Number of EBUSYs: {}", v);
        }
        if aen_given && ev.num_abort_req.load(Ordering::SeqCst) > 0 {
            eprintln!(
                "Number of Aborts: {}",
                ev.num_abort_req.load(Ordering::SeqCst)
            );
            eprintln!(
                "Number of successful Aborts: {}",
                ev.num_abort_req_success.load(Ordering::SeqCst)
            );
        }
        if m_aen_given && ev.num_mrq_abort_req.load(Ordering::SeqCst) > 0 {
            eprintln!(
                "Number of MRQ Aborts: {}",
                ev.num_mrq_abort_req.load(Ordering::SeqCst)
            );
            eprintln!(
                "Number of successful MRQ Aborts: {}",
                ev.num_mrq_abort_req_success.load(Ordering::SeqCst)
            );
        }
        let v = ev.num_miscompare.load(Ordering::SeqCst);
        if v > 0 {
            eprintln!(
                "Number of miscompare{}: {}",
                if v > 1 { "s" } else { "" },
                v
            );
        }
    }
    if verbose > 1 {
        eprintln!(
            "Number of SG_GET_NUM_WAITING calls={}",
            ev.num_waiting_calls.load(Ordering::SeqCst)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Shared;

    #[test]
    fn report_accounts_null_sink() {
        let shared = Shared::new(8, 0, 512, false, true, 1);
        shared.in_rem_count.store(0, Ordering::SeqCst);
        shared.out_rem_count.store(0, Ordering::SeqCst);
        let rep = StatsReport::gather(&shared);
        assert_eq!(rep.records_in_full, 8);
        assert_eq!(rep.records_in_partial, 0);
        // null sink reports 0+0 records out
        assert_eq!(rep.records_out_full, 0);
        assert_eq!(rep.records_out_partial, 0);
    }

    #[test]
    fn report_counts_partials() {
        let shared = Shared::new(10, 0, 512, false, false, 1);
        shared.in_rem_count.store(0, Ordering::SeqCst);
        shared.out_rem_count.store(0, Ordering::SeqCst);
        shared.in_partial.store(1, Ordering::SeqCst);
        shared.out_partial.store(1, Ordering::SeqCst);
        let rep = StatsReport::gather(&shared);
        assert_eq!(rep.records_in_full, 9);
        assert_eq!(rep.records_in_partial, 1);
        assert_eq!(rep.records_out_full, 9);
        assert_eq!(rep.records_out_partial, 1);
    }

    #[test]
    fn report_serialises() {
        let shared = Shared::new(4, 0, 512, true, false, 1);
        let rep = StatsReport::gather(&shared);
        let js = serde_json::to_string(&rep).unwrap();
        assert!(js.contains("records_in_full"));
        assert!(js.contains("exit_status"));
    }
}
