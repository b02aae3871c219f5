//! The per-thread copy loop.
//!
//! Each worker repeatedly claims a segment (a fetch-and-add on the
//! shared position index), performs the read half (sg pass-through,
//! synthetic fill, or plain `read(2)`), optionally checks the address
//! pattern, waits its turn at the write-ordering gate, and performs the
//! write half (tee file first, then sg / null sink / plain `write(2)`,
//! then the optional secondary sg target under a swapped share).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};

use nix::errno::Errno;

use crate::endpoint::{self, FileType};
use crate::error::Category;
use crate::mrq::{self, DeferredArray};
use crate::pattern::{SyntheticKind, SyntheticSource};
use crate::pt::{self, Rq, StartErr, Xtra};
use crate::sgio;
use crate::share;
use crate::state::Shared;
use crate::CopyConfig;

/// Fds opened by the main thread; workers clone their own sg fds from
/// the paths unless `same_fds` keeps everyone on these.
#[derive(Debug, Clone, Copy)]
pub struct GlobalFds {
    pub infd: RawFd,
    pub outfd: RawFd,
    pub out2fd: RawFd,
    pub outregfd: RawFd,
}

/// Page-aligned data buffer (sg DIO and O_DIRECT endpoints need the
/// alignment; everything else just tolerates it).
struct AlignedBuf {
    ptr: *mut u8,
    layout: Layout,
}

impl AlignedBuf {
    fn alloc(len: usize) -> Option<Self> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page = if page > 0 { page as usize } else { 4096 };
        let layout = Layout::from_size_align(len, page).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            None
        } else {
            Some(AlignedBuf { ptr, layout })
        }
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

fn fatal(shared: &Shared, cat: Category) {
    shared.note_exit_status(cat);
    shared.stop_both();
}

/// Read half for synthetic, regular-file, block and pipe inputs.
/// Enters holding `in_mutex` (the caller drops it afterwards). A true
/// return means end-of-input: stop after the matching write.
fn normal_in_rd(
    cfg: &CopyConfig,
    shared: &Shared,
    rep: &mut Rq,
    blocks: u32,
    synth: &mut Option<SyntheticSource>,
) -> bool {
    if cfg.verbose > 4 {
        log::debug!(
            "tid={}: normal_in_rd: iblk={}, blocks={}",
            rep.id,
            rep.iblk,
            blocks
        );
    }
    if let Some(src) = synth {
        let buf =
            unsafe { std::slice::from_raw_parts_mut(rep.buffp(cfg), (blocks * cfg.bs) as usize) };
        src.fill(buf, rep.iblk as u64, cfg.bs as usize, blocks as usize);
        shared
            .in_rem_count
            .fetch_sub(i64::from(blocks), Ordering::SeqCst);
        return false;
    }
    let same_fds = cfg.in_flags.same_fds || cfg.out_flags.same_fds;
    if !same_fds {
        // each worker has its own file pointer, move it first
        let pos = rep.iblk * i64::from(cfg.bs);
        if unsafe { libc::lseek(rep.infd, pos, libc::SEEK_SET) } < 0 {
            log::error!(
                "tid={}: >> lseek({}) failed: {}",
                rep.id,
                pos,
                Errno::last()
            );
            fatal(shared, Category::FileError);
            return true;
        }
    }
    let want = (blocks * cfg.bs) as usize;
    let mut res;
    loop {
        match pt::raw_read(rep.infd, rep.buffp(cfg), want) {
            Ok(n) => {
                res = n;
                break;
            }
            Err(Errno::EINTR | Errno::EAGAIN) => std::thread::yield_now(),
            Err(e) => {
                if cfg.in_flags.coe {
                    let buf = unsafe {
                        std::slice::from_raw_parts_mut(
                            rep.buffp(cfg),
                            (rep.num_blks * cfg.bs) as usize,
                        )
                    };
                    buf.fill(0);
                    log::warn!(
                        "tid={}: >> substituted zeros for in blk={} for {} bytes, {}",
                        rep.id,
                        rep.iblk,
                        rep.num_blks * cfg.bs,
                        e
                    );
                    res = (rep.num_blks * cfg.bs) as usize;
                    break;
                }
                log::error!("tid={}: error in normal read, {}", rep.id, e);
                fatal(shared, Category::FileError);
                return true;
            }
        }
    }
    let mut stop_after_write = false;
    let mut blocks = blocks;
    if res < want {
        stop_after_write = true;
        blocks = (res / cfg.bs as usize) as u32;
        if res % cfg.bs as usize > 0 {
            blocks += 1;
            shared.in_partial.fetch_add(1, Ordering::SeqCst);
        }
        rep.num_blks = blocks;
    }
    shared
        .in_rem_count
        .fetch_sub(i64::from(blocks), Ordering::SeqCst);
    stop_after_write
}

/// Write half for regular-file, block and pipe outputs. Enters (and
/// leaves) holding `out_mutex`.
fn normal_out_wr(cfg: &CopyConfig, shared: &Shared, rep: &mut Rq, blocks: u32) {
    if cfg.verbose > 4 {
        log::debug!(
            "tid={}: normal_out_wr: oblk={}, blocks={}",
            rep.id,
            rep.oblk,
            blocks
        );
    }
    let want = (blocks * cfg.bs) as usize;
    let mut res;
    loop {
        match pt::raw_write(rep.outfd, rep.buffp(cfg), want) {
            Ok(n) => {
                res = n;
                break;
            }
            Err(Errno::EINTR | Errno::EAGAIN) => std::thread::yield_now(),
            Err(e) => {
                if cfg.out_flags.coe {
                    log::warn!(
                        "tid={}: >> ignored error for out blk={} for {} bytes, {}",
                        rep.id,
                        rep.oblk,
                        rep.num_blks * cfg.bs,
                        e
                    );
                    res = (rep.num_blks * cfg.bs) as usize;
                    break;
                }
                log::error!("tid={}: error normal write, {}", rep.id, e);
                fatal(shared, Category::FileError);
                return;
            }
        }
    }
    let mut blocks = blocks;
    if res < want {
        blocks = (res / cfg.bs as usize) as u32;
        if res % cfg.bs as usize > 0 {
            blocks += 1;
            shared.out_partial.fetch_add(1, Ordering::SeqCst);
        }
        rep.num_blks = blocks;
    }
    shared
        .out_rem_count
        .fetch_sub(i64::from(blocks), Ordering::SeqCst);
}

/// sg read half. Enters holding `in_mutex` and consumes it: the lock is
/// released between submission and completion so other workers can get
/// their reads in flight, and re-taken only for the retry/bookkeeping
/// windows.
fn sg_in_rd_cmd<'a>(
    cfg: &CopyConfig,
    shared: &'a Shared,
    rep: &mut Rq,
    def_arr: &mut DeferredArray,
    guard: MutexGuard<'a, ()>,
) {
    let mut guard = Some(guard);
    loop {
        let pack_id = match pt::start_io(cfg, shared, rep, def_arr, None) {
            Ok(p) => p,
            Err(StartErr::NoMem) => {
                log::error!("tid={}: out of memory starting sg in command", rep.id);
                drop(guard.take());
                fatal(shared, Category::Other);
                return;
            }
            Err(StartErr::Fail) => {
                log::error!("tid={}: inputting to sg failed, blk={}", rep.id, rep.iblk);
                drop(guard.take());
                shared.stop_both();
                return;
            }
        };
        // release so other readers can proceed in parallel
        drop(guard.take());

        let res = pt::finish_io(cfg, shared, rep, false, pack_id, None);
        match res {
            Category::AbortedCommand | Category::UnitAttention => {
                // same segment again; this re-read may now complete out
                // of read sequence
                guard = Some(shared.in_mutex.lock().unwrap());
            }
            Category::MediumHard if cfg.in_flags.coe => {
                let buf = unsafe {
                    std::slice::from_raw_parts_mut(
                        rep.buffp(cfg),
                        (rep.num_blks * cfg.bs) as usize,
                    )
                };
                buf.fill(0);
                log::warn!(
                    "tid={}: >> substituted zeros for in blk={} for {} bytes",
                    rep.id,
                    rep.iblk,
                    rep.num_blks * cfg.bs
                );
                let g = shared.in_mutex.lock().unwrap();
                if rep.dio_incomplete_count != 0 || rep.resid != 0 {
                    shared
                        .dio_incomplete_count
                        .fetch_add(rep.dio_incomplete_count, Ordering::SeqCst);
                    shared.sum_of_resids.fetch_add(rep.resid, Ordering::SeqCst);
                }
                shared
                    .in_rem_count
                    .fetch_sub(i64::from(rep.num_blks), Ordering::SeqCst);
                drop(g);
                return;
            }
            Category::Clean => {
                let g = shared.in_mutex.lock().unwrap();
                if rep.dio_incomplete_count != 0 || rep.resid != 0 {
                    shared
                        .dio_incomplete_count
                        .fetch_add(rep.dio_incomplete_count, Ordering::SeqCst);
                    shared.sum_of_resids.fetch_add(rep.resid, Ordering::SeqCst);
                }
                shared
                    .in_rem_count
                    .fetch_sub(i64::from(rep.num_blks), Ordering::SeqCst);
                drop(g);
                return;
            }
            other => {
                log::error!(
                    "tid={}: error finishing sg in command ({:?})",
                    rep.id,
                    other
                );
                fatal(shared, other);
                return;
            }
        }
    }
}

/// sg write half, also used for `--verify` and the secondary target.
/// Enters holding the relevant output mutex and consumes it. Performs
/// the optional PRE-FETCH leg, then the write/verify, split in two
/// commands when `ofsplit` applies; swaps the share around secondary
/// writes.
fn sg_out_wr_cmd<'a>(
    cfg: &CopyConfig,
    shared: &'a Shared,
    rep: &mut Rq,
    def_arr: &mut DeferredArray,
    is_wr2: bool,
    prefetch: bool,
    guard: MutexGuard<'a, ()>,
) {
    let mutexp = if is_wr2 {
        &shared.out2_mutex
    } else {
        &shared.out_mutex
    };
    let wr_or_ver = if cfg.verify { "verify" } else { "out" };
    let ofsplit = cfg.ofsplit;
    let mut guard = Some(guard);
    let mut xtra = Xtra {
        is_wr2,
        prefetch,
        ..Default::default()
    };
    let mut nblks = rep.num_blks;

    if rep.has_share && is_wr2 {
        share::swap_share(rep.infd, rep.out2fd, rep.id, true, cfg.verbose > 2);
    }

    if prefetch {
        'prefetch: loop {
            let pack_id = match pt::start_io(cfg, shared, rep, def_arr, Some(&xtra)) {
                Ok(p) => p,
                Err(StartErr::NoMem) => {
                    log::error!("tid={}: out of memory starting prefetch", rep.id);
                    drop(guard.take());
                    fatal(shared, Category::Other);
                    if rep.has_share && is_wr2 {
                        share::swap_share(rep.infd, rep.outfd, rep.id, false, cfg.verbose > 2);
                    }
                    return;
                }
                Err(StartErr::Fail) => {
                    log::error!("tid={}: sg {} failed, blk={}", rep.id, wr_or_ver, rep.oblk);
                    drop(guard.take());
                    shared.stop_both();
                    if rep.has_share && is_wr2 {
                        share::swap_share(rep.infd, rep.outfd, rep.id, false, cfg.verbose > 2);
                    }
                    return;
                }
            };
            drop(guard.take());
            let res = pt::finish_io(cfg, shared, rep, true, pack_id, Some(&xtra));
            match res {
                Category::AbortedCommand | Category::UnitAttention => {
                    guard = Some(mutexp.lock().unwrap());
                }
                Category::Clean => {
                    guard = Some(mutexp.lock().unwrap());
                    break 'prefetch;
                }
                other => {
                    log::error!("error finishing sg prefetch command ({:?})", other);
                    fatal(shared, other);
                    if rep.has_share && is_wr2 {
                        share::swap_share(rep.infd, rep.outfd, rep.id, false, cfg.verbose > 2);
                    }
                    return;
                }
            }
        }
    }

    // write (or verify) the current segment, possibly split in two
    xtra.prefetch = false;
    if ofsplit > 0 && rep.num_blks > ofsplit {
        xtra.dout_is_split = true;
        xtra.blk_offset = 0;
        xtra.blks = ofsplit;
        xtra.hpv4_ind = 0;
        nblks = ofsplit;
    }
    'split: loop {
        loop {
            let pack_id = match pt::start_io(cfg, shared, rep, def_arr, Some(&xtra)) {
                Ok(p) => p,
                Err(StartErr::NoMem) => {
                    log::error!("tid={}: out of memory starting sg out command", rep.id);
                    drop(guard.take());
                    fatal(shared, Category::Other);
                    break 'split;
                }
                Err(StartErr::Fail) => {
                    log::error!("tid={}: sg {} failed, blk={}", rep.id, wr_or_ver, rep.oblk);
                    drop(guard.take());
                    shared.stop_both();
                    break 'split;
                }
            };
            drop(guard.take());
            let res = pt::finish_io(cfg, shared, rep, true, pack_id, Some(&xtra));
            match res {
                Category::AbortedCommand | Category::UnitAttention => {
                    // re-issue; this re-write may now be out of sequence
                    guard = Some(mutexp.lock().unwrap());
                }
                Category::MediumHard if !cfg.out_flags.coe => {
                    log::error!("error finishing sg {} command (medium)", wr_or_ver);
                    fatal(shared, res);
                    break 'split;
                }
                Category::MediumHard | Category::Clean => {
                    if res == Category::MediumHard {
                        log::warn!(
                            ">> ignored error for {} blk={} for {} bytes",
                            wr_or_ver,
                            rep.oblk,
                            nblks * cfg.bs
                        );
                    }
                    if !is_wr2 {
                        let g = mutexp.lock().unwrap();
                        if rep.dio_incomplete_count != 0 || rep.resid != 0 {
                            shared
                                .dio_incomplete_count
                                .fetch_add(rep.dio_incomplete_count, Ordering::SeqCst);
                            shared.sum_of_resids.fetch_add(rep.resid, Ordering::SeqCst);
                        }
                        shared
                            .out_rem_count
                            .fetch_sub(i64::from(nblks), Ordering::SeqCst);
                        drop(g);
                    }
                    break;
                }
                other => {
                    log::error!(
                        "error finishing sg {} command ({:?})",
                        wr_or_ver,
                        other
                    );
                    fatal(shared, other);
                    break 'split;
                }
            }
        }
        // set up the upper half of a split write
        if xtra.dout_is_split && xtra.hpv4_ind == 0 && rep.num_blks > ofsplit {
            xtra.hpv4_ind = 1;
            xtra.blk_offset = ofsplit;
            xtra.blks = rep.num_blks - ofsplit;
            nblks = xtra.blks;
            guard = Some(mutexp.lock().unwrap());
            continue 'split;
        }
        break;
    }
    drop(guard.take());
    if rep.has_share && is_wr2 {
        share::swap_share(rep.infd, rep.outfd, rep.id, false, cfg.verbose > 2);
    }
}

/// Scan the segment just read for the address pattern: each block's
/// 32-bit words must hold that block's input LBA, big-endian. One word
/// per block in single-check mode, the whole block otherwise (the last
/// 3 bytes of a block are never inspected).
fn check_addresses(cfg: &CopyConfig, shared: &Shared, rep: &Rq, blocks: u32) {
    let bs = cfg.bs as usize;
    let num = if cfg.chkaddr == 1 { 4 } else { bs - 3 };
    let buf = unsafe { std::slice::from_raw_parts(rep.buffp(cfg), bs * blocks as usize) };
    let mut addr = rep.iblk as u32;
    for k in 0..blocks as usize {
        let off = k * bs;
        let mut j = 0;
        while j < num {
            if addr != sgio::get_unaligned_be32(&buf[off + j..]) {
                log::error!("chkaddr failure at addr=0x{:x}", addr);
                shared.ev.num_miscompare.fetch_add(1, Ordering::SeqCst);
                fatal(shared, Category::Miscompare);
                return;
            }
            j += 4;
        }
        addr = addr.wrapping_add(1);
    }
}

/// Worker thread body.
pub fn run_worker(id: usize, cfg: Arc<CopyConfig>, shared: Arc<Shared>, fds: GlobalFds) {
    let cfg = &*cfg;
    let vb = cfg.verbose;
    let in_is_sg = cfg.in_type.is_sg();
    let in_mmap = in_is_sg && cfg.in_flags.mmap > 0;
    let out_is_sg = cfg.out_type.is_sg();
    let out_mmap = out_is_sg && cfg.out_flags.mmap > 0;
    let sz = (cfg.bpt * cfg.bs) as usize;

    let mut rep = Rq::new(id);
    rep.infd = fds.infd;
    rep.outfd = fds.outfd;
    rep.out2fd = fds.out2fd;
    rep.outregfd = fds.outregfd;
    if vb > 2 {
        log::debug!("{} <-- starting worker thread", id);
    }

    let mut heap_buf: Option<AlignedBuf> = None;
    let mut mmap_active: u8 = 0;
    let mut mmap_len: usize = 0;
    let mut own_infd = false;
    let mut own_outfd = false;
    let mut own_out2fd = false;
    let mut stop_after_write = false;

    if !(in_mmap || out_mmap) {
        let mut n = sz;
        if cfg.unbalanced_mrq {
            n *= cfg.nmrqs as usize;
        }
        match AlignedBuf::alloc(n) {
            Some(b) => {
                rep.buf_ptr = b.as_mut_ptr();
                rep.buf_len = n;
                heap_buf = Some(b);
            }
            None => {
                log::error!("tid={}: out of memory creating user buffers", id);
                fatal(&shared, Category::Other);
                drop(shared.out_mutex.lock().unwrap());
                shared.out_sync_cv.notify_all();
                return;
            }
        }
    }

    if rep.infd == rep.outfd {
        if in_is_sg {
            rep.same_sg = true;
        }
    } else if in_is_sg && out_is_sg {
        rep.both_sg = true;
    } else if in_is_sg {
        rep.only_in_sg = true;
    } else if out_is_sg {
        rep.only_out_sg = true;
    }

    let mut synth =
        SyntheticKind::from_flags(&cfg.in_flags).map(|k| SyntheticSource::new(k, id));

    'fini: {
        // private fds so each worker has its own queue and file pointer
        if !(cfg.in_flags.same_fds || cfg.out_flags.same_fds) {
            if in_is_sg {
                if let Some(path) = cfg.ifname.as_deref() {
                    match endpoint::open_sg(path, &cfg.in_flags, cfg, in_mmap) {
                        Ok(h) => {
                            rep.infd = h.fd;
                            own_infd = true;
                            if in_mmap && !h.mmap_ptr.is_null() {
                                rep.buf_ptr = h.mmap_ptr;
                                rep.buf_len = h.mmap_len;
                                mmap_len = h.mmap_len;
                                mmap_active = cfg.in_flags.mmap;
                            }
                            if vb > 2 {
                                log::debug!("tid={}: opened local sg IFILE", id);
                            }
                        }
                        Err(e) => {
                            log::error!("tid={}: {}", id, e);
                            break 'fini;
                        }
                    }
                }
            }
            if out_is_sg {
                if let Some(path) = cfg.ofname.as_deref() {
                    match endpoint::open_sg(path, &cfg.out_flags, cfg, out_mmap) {
                        Ok(h) => {
                            rep.outfd = h.fd;
                            own_outfd = true;
                            if out_mmap && !h.mmap_ptr.is_null() && mmap_active == 0 {
                                rep.buf_ptr = h.mmap_ptr;
                                rep.buf_len = h.mmap_len;
                                mmap_len = h.mmap_len;
                                mmap_active = cfg.out_flags.mmap;
                            }
                            if vb > 2 {
                                log::debug!("tid={}: opened local sg OFILE", id);
                            }
                        }
                        Err(e) => {
                            log::error!("tid={}: {}", id, e);
                            break 'fini;
                        }
                    }
                }
            }
            if cfg.out2_type.is_sg() {
                if let Some(path) = cfg.of2name.as_deref() {
                    match endpoint::open_sg(path, &cfg.out_flags, cfg, false) {
                        Ok(h) => {
                            rep.out2fd = h.fd;
                            own_out2fd = true;
                            if vb > 2 {
                                log::debug!("tid={}: opened local sg OFILE2", id);
                            }
                        }
                        Err(e) => {
                            log::error!("tid={}: {}", id, e);
                            break 'fini;
                        }
                    }
                }
            }
        }
        if mmap_active == 0 && rep.buf_ptr.is_null() {
            // mmap wanted but driver kept its default reserved buffer
            match AlignedBuf::alloc(sz) {
                Some(b) => {
                    rep.buf_ptr = b.as_mut_ptr();
                    rep.buf_len = sz;
                    heap_buf = Some(b);
                }
                None => {
                    log::error!("tid={}: out of memory creating user buffers", id);
                    fatal(&shared, Category::Other);
                    break 'fini;
                }
            }
        }

        if !cfg.sg_version_ge_40045 {
            if vb > 4 {
                log::debug!("tid={}: skipping share because driver too old", id);
            }
        } else if cfg.noshare {
            if vb > 4 {
                log::debug!("tid={}: skipping IFILE share with OFILE due to noshare=1", id);
            }
        } else if in_is_sg && out_is_sg {
            rep.has_share = share::share_prepare(rep.outfd, rep.infd, id, vb > 9);
        }
        if vb > 9 {
            log::debug!("tid={}: has_share={}", id, rep.has_share);
        }
        let share_and_ofreg = rep.has_share && rep.outregfd >= 0;

        let mut def_arr = DeferredArray::new();

        loop {
            rep.wr = false;
            let my_index = shared
                .pos_index
                .fetch_add(i64::from(cfg.bpt), Ordering::SeqCst);
            rep.buffp_onto_next(cfg);

            let in_guard = shared.in_mutex.lock().unwrap();
            let blocks = if my_index >= shared.dd_count {
                drop(in_guard);
                if cfg.nmrqs > 0 && !def_arr.is_empty() {
                    if vb > 2 {
                        log::debug!(
                            "tid={}: tail-end my_index>=count, to_do={}",
                            id,
                            def_arr.len()
                        );
                    }
                    if mrq::do_deferred_mrq(cfg, &shared, &mut rep, &mut def_arr).is_err() {
                        log::warn!("tid={}: tail-end deferred mrq failed", id);
                    }
                }
                break; // at or beyond the end
            } else if my_index + i64::from(cfg.bpt) > shared.dd_count {
                (shared.dd_count - my_index) as u32
            } else {
                cfg.bpt
            };

            rep.iblk = cfg.skip + my_index;
            rep.oblk = cfg.seek + my_index;
            rep.num_blks = blocks;

            if in_is_sg {
                sg_in_rd_cmd(cfg, &shared, &mut rep, &mut def_arr, in_guard);
            } else {
                stop_after_write = normal_in_rd(cfg, &shared, &mut rep, blocks, &mut synth);
                drop(in_guard);
            }

            if cfg.chkaddr > 0 && cfg.bs > 3 {
                check_addresses(cfg, &shared, &rep, blocks);
            }
            rep.rep_count += 1;

            rep.wr = true;
            let mut out_guard = shared.out_mutex.lock().unwrap();

            // keep OFILE (and OFREG) writes in input sequence; elided
            // for random input and for plain sg->sg copies where the
            // shared buffer plus the device queue already order them
            let elide_gate =
                cfg.in_flags.random || (rep.outregfd < 0 && in_is_sg && out_is_sg);
            if !elide_gate && (share_and_ofreg || cfg.out_type != FileType::DevNull) {
                while !shared.out_stop.load(Ordering::SeqCst)
                    && rep.oblk != shared.out_blk.load(Ordering::SeqCst)
                {
                    out_guard = shared.out_sync_cv.wait(out_guard).unwrap();
                }
            }

            if shared.out_stop.load(Ordering::SeqCst)
                || shared.out_count.load(Ordering::SeqCst) <= 0
            {
                shared.out_stop.store(true, Ordering::SeqCst);
                drop(out_guard);
                break; // stop requested
            }
            if stop_after_write {
                shared.out_stop.store(true, Ordering::SeqCst);
            }
            shared
                .out_count
                .fetch_sub(i64::from(blocks), Ordering::SeqCst);
            shared.out_blk.fetch_add(i64::from(blocks), Ordering::SeqCst);

            // tee file gets the buffer first
            if rep.outregfd >= 0 {
                let n = (cfg.bs * rep.num_blks) as usize;
                match pt::raw_write(rep.outregfd, rep.buffp(cfg), n) {
                    Ok(_) => {
                        if vb > 9 {
                            log::debug!(
                                "tid={}: write(outregfd), fd={}, num_blks={}",
                                id,
                                rep.outregfd,
                                rep.num_blks
                            );
                        }
                    }
                    Err(e) => {
                        log::error!("tid={}: write(outregfd) failed: {}", id, e)
                    }
                }
            }

            let mut wr_blks = rep.num_blks;
            if out_is_sg {
                sg_out_wr_cmd(cfg, &shared, &mut rep, &mut def_arr, false, cfg.prefetch, out_guard);
                rep.rep_count += 1;
            } else if cfg.out_type == FileType::DevNull {
                // skip the actual write
                wr_blks = 0;
                shared
                    .out_rem_count
                    .fetch_sub(i64::from(blocks), Ordering::SeqCst);
                drop(out_guard);
            } else {
                normal_out_wr(cfg, &shared, &mut rep, blocks);
                drop(out_guard);
                rep.rep_count += 1;
            }

            // secondary sg target under a swapped share
            if rep.out2fd >= 0 && cfg.out2_type.is_sg() {
                let out2_guard = shared.out2_mutex.lock().unwrap();
                sg_out_wr_cmd(cfg, &shared, &mut rep, &mut def_arr, true, false, out2_guard);
            }

            if rep.num_blks == 0 {
                if cfg.nmrqs > 0 && !def_arr.is_empty() {
                    if wr_blks > 0 {
                        rep.out_mrq_q_blks += wr_blks;
                    }
                    if vb > 2 {
                        log::debug!("tid={}: tail-end, to_do={}", id, def_arr.len());
                    }
                    if mrq::do_deferred_mrq(cfg, &shared, &mut rep, &mut def_arr).is_err() {
                        log::warn!("tid={}: tail-end deferred mrq failed", id);
                    }
                }
                shared.out_stop.store(true, Ordering::SeqCst);
                stop_after_write = true;
                break; // read nothing
            }
            shared.out_sync_cv.notify_all();
            if stop_after_write {
                break;
            }
        } // end of main segment loop

        {
            let _g = shared.in_mutex.lock().unwrap();
            shared.in_stop.store(true, Ordering::SeqCst); // flag other workers
        }
    } // 'fini

    if mmap_active == 1 && mmap_len > 0 {
        let res = unsafe { libc::munmap(rep.buf_ptr as *mut libc::c_void, mmap_len) };
        if res < 0 {
            log::warn!("tid={}: munmap() failed: {}", id, Errno::last());
        } else if vb > 4 {
            log::debug!("tid={}: munmap({:p}, {})", id, rep.buf_ptr, mmap_len);
        }
    }
    drop(heap_buf);

    if cfg.sg_version_ge_40045 {
        if cfg.noshare {
            if cfg.nmrqs > 0 && cfg.unshare {
                share::unshare(rep.infd, id, vb > 9);
            }
        } else if in_is_sg && out_is_sg && cfg.unshare {
            share::unshare(rep.infd, id, vb > 9);
        }
    }
    let report_waiting = |fd: RawFd, tag: &str| {
        let mut n: libc::c_int = 0;
        shared.ev.num_waiting_calls.fetch_add(1, Ordering::SeqCst);
        match unsafe { sgio::sg_get_num_waiting(fd, &mut n) } {
            Ok(_) => {
                if n > 0 {
                    log::debug!("tid={}: num_waiting={} prior close({})", id, n, tag);
                }
            }
            Err(e) => log::warn!("tid={}: ioctl(SG_GET_NUM_WAITING) failed: {}", id, e),
        }
    };
    if own_infd && rep.infd >= 0 {
        if vb > 0 && in_is_sg {
            report_waiting(rep.infd, "in");
        }
        unsafe { libc::close(rep.infd) };
    }
    if own_outfd && rep.outfd >= 0 {
        if vb > 0 && out_is_sg {
            report_waiting(rep.outfd, "out");
        }
        unsafe { libc::close(rep.outfd) };
    }
    if own_out2fd && rep.out2fd >= 0 {
        unsafe { libc::close(rep.out2fd) };
    }
    // take and release out_mutex so a main thread parked in the
    // warm-up wait cannot miss this wake-up
    drop(shared.out_mutex.lock().unwrap());
    shared.out_sync_cv.notify_all();
    if vb > 2 {
        log::debug!(
            "{} <-- worker thread terminated, stop_after_write={}",
            id,
            stop_after_write
        );
    }
}
