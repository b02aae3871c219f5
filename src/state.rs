//! Shared scheduler state: the atomics, locks and condition variable
//! that coordinate the worker pool.
//!
//! One `Shared` instance is created before the workers start and torn
//! down after they join; workers hold it behind an `Arc`. The counters
//! use sequentially consistent ordering throughout, the ranged state is
//! guarded by the named mutexes, and `out_sync_cv` is the only
//! cross-thread waiting primitive.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use crate::error::Category;
use crate::stats::EventCounts;

pub const DEF_BLOCK_SIZE: u32 = 512;
pub const DEF_BLOCKS_PER_TRANSFER: u32 = 128;
/// Large-block (>= 2048) default, kept low for CD/DVD class devices.
pub const DEF_BLOCKS_PER_2048_TRANSFER: u32 = 32;
pub const DEF_NUM_THREADS: usize = 4;
pub const MAX_NUM_THREADS: usize = 1024;
pub const DEF_SDT_ICT_MS: u32 = 300;
pub const DEF_SDT_CRT_SEC: u32 = 3;
pub const DEF_SCSI_CDBSZ: usize = 10;
pub const MAX_BPT_VALUE: u64 = 1 << 24;
pub const MAX_COUNT_SKIP_SEEK: u64 = 1 << 48;
/// MRQ group ids start well clear of the per-command pack-id space.
pub const MONO_MRQ_ID_INIT: i32 = 0x10000;

pub struct Shared {
    /// Total blocks to copy, fixed after capacity derivation.
    pub dd_count: i64,

    /// Segment index allocator; fetch-add'ed by `bpt` per acquisition.
    pub pos_index: AtomicI64,

    /// Blocks not yet read.
    pub in_rem_count: AtomicI64,
    /// Partial (short) input blocks.
    pub in_partial: AtomicI32,
    pub in_stop: AtomicBool,

    /// Next expected output LBA; the write-ordering token.
    pub out_blk: AtomicI64,
    /// Blocks not yet claimed by a writer.
    pub out_count: AtomicI64,
    /// Blocks not yet confirmed written.
    pub out_rem_count: AtomicI64,
    pub out_partial: AtomicI32,
    pub out_stop: AtomicBool,

    pub in_mutex: Mutex<()>,
    pub out_mutex: Mutex<()>,
    pub out2_mutex: Mutex<()>,
    /// Broadcast on every write completion, on stop and on signal
    /// reception; always paired with `out_mutex`.
    pub out_sync_cv: Condvar,

    /// Direct-IO requests the driver demoted to indirect.
    pub dio_incomplete_count: AtomicI32,
    pub sum_of_resids: AtomicI32,

    /// First non-zero SCSI category observed; written once.
    pub exit_status: AtomicI32,

    /// Process-wide pack-id allocator (reads take `2k`, paired writes
    /// `2k+1` when both sides are sg).
    pub mono_pack_id: AtomicI32,
    /// MRQ group id allocator.
    pub mono_mrq_id: AtomicI32,

    /// Set by the main thread once workers have joined, releases the
    /// signal-listening thread.
    pub shutting_down: AtomicBool,

    pub ev: EventCounts,
    pub start: Instant,

    // copies of the few config facts the statistics printer and the
    // signal thread need without holding the whole config
    pub bs: u32,
    pub verify: bool,
    pub out_is_null: bool,
    pub do_time: u8,
}

impl Shared {
    pub fn new(dd_count: i64, seek: i64, bs: u32, verify: bool, out_is_null: bool, do_time: u8) -> Self {
        Shared {
            dd_count,
            pos_index: AtomicI64::new(0),
            in_rem_count: AtomicI64::new(dd_count),
            in_partial: AtomicI32::new(0),
            in_stop: AtomicBool::new(false),
            out_blk: AtomicI64::new(seek),
            out_count: AtomicI64::new(dd_count),
            out_rem_count: AtomicI64::new(dd_count),
            out_partial: AtomicI32::new(0),
            out_stop: AtomicBool::new(false),
            in_mutex: Mutex::new(()),
            out_mutex: Mutex::new(()),
            out2_mutex: Mutex::new(()),
            out_sync_cv: Condvar::new(),
            dio_incomplete_count: AtomicI32::new(0),
            sum_of_resids: AtomicI32::new(0),
            exit_status: AtomicI32::new(0),
            mono_pack_id: AtomicI32::new(1),
            mono_mrq_id: AtomicI32::new(MONO_MRQ_ID_INIT),
            shutting_down: AtomicBool::new(false),
            ev: EventCounts::default(),
            start: Instant::now(),
            bs,
            verify,
            out_is_null,
            do_time,
        }
    }

    /// Flag every worker to drain and exit at its next stop check.
    pub fn stop_both(&self) {
        self.in_stop.store(true, Ordering::SeqCst);
        self.out_stop.store(true, Ordering::SeqCst);
    }

    /// Record the first non-zero exit category; later ones lose.
    pub fn note_exit_status(&self, cat: Category) {
        if cat == Category::Clean {
            return;
        }
        let _ = self.exit_status.compare_exchange(
            0,
            cat.exit_code(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::SeqCst)
    }

    /// Allocate the next pack-id base. When both sides are sg the
    /// caller doubles this for the READ and adds one for the WRITE.
    pub fn next_pack_id_base(&self) -> i32 {
        self.mono_pack_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_mrq_id(&self) -> i32 {
        self.mono_mrq_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Most recently allocated pack-id; watched by the stall detector.
    pub fn current_pack_id(&self) -> i32 {
        self.mono_pack_id.load(Ordering::SeqCst)
    }

    pub fn stopping(&self) -> bool {
        self.in_stop.load(Ordering::SeqCst) || self.out_stop.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(count: i64) -> Shared {
        Shared::new(count, 0, 512, false, false, 1)
    }

    #[test]
    fn exit_status_is_write_once() {
        let s = shared(8);
        s.note_exit_status(Category::MediumHard);
        s.note_exit_status(Category::Miscompare);
        assert_eq!(s.exit_status(), Category::MediumHard.exit_code());
        // Clean never overwrites
        s.note_exit_status(Category::Clean);
        assert_eq!(s.exit_status(), Category::MediumHard.exit_code());
    }

    #[test]
    fn pack_ids_are_unique_and_ascending() {
        let s = shared(8);
        let a = s.next_pack_id_base();
        let b = s.next_pack_id_base();
        assert!(b > a);
        assert_eq!(s.next_mrq_id(), MONO_MRQ_ID_INIT);
        assert_eq!(s.next_mrq_id(), MONO_MRQ_ID_INIT + 1);
    }

    #[test]
    fn stop_both_sets_both_flags() {
        let s = shared(8);
        assert!(!s.stopping());
        s.stop_both();
        assert!(s.in_stop.load(Ordering::SeqCst));
        assert!(s.out_stop.load(Ordering::SeqCst));
        assert!(s.stopping());
    }

    #[test]
    fn segment_allocation_by_bpt() {
        let s = shared(300);
        let bpt = 128i64;
        assert_eq!(s.pos_index.fetch_add(bpt, Ordering::SeqCst), 0);
        assert_eq!(s.pos_index.fetch_add(bpt, Ordering::SeqCst), 128);
        assert_eq!(s.pos_index.fetch_add(bpt, Ordering::SeqCst), 256);
        // third segment is the 44-block tail, fourth is past the end
        assert!(s.pos_index.load(Ordering::SeqCst) >= s.dd_count);
    }
}
