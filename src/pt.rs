//! Pass-through driver: build and submit SCSI commands on sg file
//! descriptors, then fetch and classify their completions.
//!
//! Two interface versions are supported per side. The v3 path writes an
//! `SgIoHdr` to the fd and reads the completion back (the fd is in
//! FORCE_PACK_ID mode so the read targets one pack-id). The v4 path
//! uses `SG_IOSUBMIT`/`SG_IORECEIVE`, and is the only one that can
//! defer into a multi-request batch or carry the share/split flags.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;

use crate::cdb;
use crate::error::Category;
use crate::mrq::{self, DeferredArray};
use crate::sgio::{self, SgIoHdr, SgIoV4};
use crate::share;
use crate::state::Shared;
use crate::CopyConfig;

static FIRST_IO_LOGGED: AtomicBool = AtomicBool::new(false);

/// Why a submission could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartErr {
    /// Kernel said ENOMEM; treated as fatal by the caller.
    NoMem,
    /// Anything else; already logged.
    Fail,
}

/// Additional parameters for `start_io`/`finish_io`: secondary-target
/// writes, the PRE-FETCH leg of `--prefetch`, and split writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Xtra {
    pub is_wr2: bool,
    pub prefetch: bool,
    pub dout_is_split: bool,
    /// Which of the two v4 header slots to use (1 = upper split half).
    pub hpv4_ind: usize,
    pub blk_offset: u32,
    pub blks: u32,
}

/// Per-worker request element: the worker's fds, its buffer view, CDB
/// and sense scratch, both header variants and the MRQ bookkeeping.
/// One per worker thread, living for the thread's lifetime.
pub struct Rq {
    pub id: usize,
    pub wr: bool,
    pub has_share: bool,
    pub both_sg: bool,
    pub same_sg: bool,
    pub only_in_sg: bool,
    pub only_out_sg: bool,
    pub infd: RawFd,
    pub outfd: RawFd,
    pub out2fd: RawFd,
    pub outregfd: RawFd,
    pub iblk: i64,
    pub oblk: i64,
    pub num_blks: u32,
    pub buf_ptr: *mut u8,
    pub buf_len: usize,
    pub cmd: [u8; sgio::MAX_SCSI_CDBSZ],
    pub sb: [u8; sgio::SENSE_BUFF_LEN],
    pub io_hdr: SgIoHdr,
    pub io_hdr4: [SgIoV4; 2],
    pub dio_incomplete_count: i32,
    pub resid: i32,
    /// Pack-id of the most recent READ, for write pairing.
    pub rd_p_id: i32,
    pub rep_count: i32,
    pub rq_id: i32,
    pub mrq_id: i32,
    /// Buffer stripe index for unbalanced MRQ batching.
    pub mrq_index: u32,
    pub in_mrq_q_blks: u32,
    pub out_mrq_q_blks: u32,
}

impl Rq {
    pub fn new(id: usize) -> Self {
        Rq {
            id,
            wr: false,
            has_share: false,
            both_sg: false,
            same_sg: false,
            only_in_sg: false,
            only_out_sg: false,
            infd: -1,
            outfd: -1,
            out2fd: -1,
            outregfd: -1,
            iblk: 0,
            oblk: 0,
            num_blks: 0,
            buf_ptr: std::ptr::null_mut(),
            buf_len: 0,
            cmd: [0; sgio::MAX_SCSI_CDBSZ],
            sb: [0; sgio::SENSE_BUFF_LEN],
            io_hdr: SgIoHdr::default(),
            io_hdr4: [SgIoV4::default(); 2],
            dio_incomplete_count: 0,
            resid: 0,
            rd_p_id: 0,
            rep_count: 0,
            rq_id: 0,
            mrq_id: 0,
            mrq_index: 0,
            in_mrq_q_blks: 0,
            out_mrq_q_blks: 0,
        }
    }

    /// Current buffer view; unbalanced MRQ stripes the per-worker
    /// allocation into `nmrqs` segments.
    pub fn buffp(&self, cfg: &CopyConfig) -> *mut u8 {
        if cfg.nmrqs > 0 && cfg.unbalanced_mrq && self.mrq_index > 0 {
            unsafe {
                self.buf_ptr
                    .add((self.mrq_index * cfg.bs * cfg.bpt) as usize)
            }
        } else {
            self.buf_ptr
        }
    }

    /// Advance the unbalanced-MRQ buffer stripe.
    pub fn buffp_onto_next(&mut self, cfg: &CopyConfig) {
        if cfg.nmrqs > 0 && cfg.unbalanced_mrq {
            self.mrq_index += 1;
            if self.mrq_index >= cfg.nmrqs {
                self.mrq_index = 0;
            }
        }
    }
}

pub(crate) fn raw_write(fd: RawFd, buf: *const u8, len: usize) -> Result<usize, Errno> {
    let res = unsafe { libc::write(fd, buf as *const libc::c_void, len) };
    if res < 0 {
        Err(Errno::last())
    } else {
        Ok(res as usize)
    }
}

pub(crate) fn raw_read(fd: RawFd, buf: *mut u8, len: usize) -> Result<usize, Errno> {
    let res = unsafe { libc::read(fd, buf as *mut libc::c_void, len) };
    if res < 0 {
        Err(Errno::last())
    } else {
        Ok(res as usize)
    }
}

/// Count a transient submit/receive errno and take the periodic
/// sg-debug snapshot the way a wedged queue is diagnosed in the field.
fn count_transient(shared: &Shared, fd: RawFd, id: usize, vb: u8, err: Errno, starting: bool) {
    match err {
        Errno::EAGAIN => {
            let c = if starting {
                &shared.ev.num_start_eagain
            } else {
                &shared.ev.num_fin_eagain
            };
            c.fetch_add(1, Ordering::SeqCst);
            if shared.ev.num_ebusy.load(Ordering::SeqCst) % 1000 == 0 {
                share::take_snap(fd, id, vb > 2);
            }
        }
        Errno::EBUSY => {
            let n = shared.ev.num_ebusy.fetch_add(1, Ordering::SeqCst);
            if n % 1000 == 0 {
                share::take_snap(fd, id, vb > 2);
            }
        }
        _ => {}
    }
}

/// Build the CDB for the current segment half and submit it.
///
/// Returns the pack-id the command was (or will be, for a deferred MRQ
/// element) submitted under. With MRQ active the v4 header is pushed
/// into `def_arr` instead of being sent, and the array is flushed once
/// it holds `nmrqs` entries.
pub fn start_io(
    cfg: &CopyConfig,
    shared: &Shared,
    rep: &mut Rq,
    def_arr: &mut DeferredArray,
    xtrp: Option<&Xtra>,
) -> Result<i32, StartErr> {
    let wr = rep.wr;
    let fp = if wr { &cfg.out_flags } else { &cfg.in_flags };
    let fua = fp.fua;
    let dpo = fp.dpo;
    let dio = fp.dio;
    let mmap = fp.mmap > 0;
    let noxfer = fp.noxfer;
    let v4 = fp.v4;
    let qhead = fp.qhead;
    let qtail = fp.qtail && !qhead; // qhead takes precedence
    let polled = fp.polled;
    let mout_if = fp.mout_if;
    let prefetch = xtrp.map(|x| x.prefetch).unwrap_or(false);
    let is_wr2 = xtrp.map(|x| x.is_wr2).unwrap_or(false);
    let cdbsz = if wr { cfg.cdbsz_out } else { cfg.cdbsz_in };
    let blk = if wr { rep.oblk } else { rep.iblk };
    let fd = if wr {
        if is_wr2 {
            rep.out2fd
        } else {
            rep.outfd
        }
    } else {
        rep.infd
    };
    let crwp = if wr {
        if prefetch {
            if is_wr2 {
                "prefetch2"
            } else {
                "prefetch"
            }
        } else if cfg.verify {
            if is_wr2 {
                "verifying2"
            } else {
                "verifying"
            }
        } else if is_wr2 {
            "writing2"
        } else {
            "writing"
        }
    } else {
        "reading"
    };

    let split = xtrp.map(|x| x.dout_is_split).unwrap_or(false);
    let build = if v4 && split {
        let x = xtrp.unwrap();
        cdb::build_rw(
            &mut rep.cmd,
            cdbsz,
            x.blks,
            blk as u64 + u64::from(x.blk_offset),
            cfg.verify,
            true,
            fua,
            dpo,
        )
    } else {
        cdb::build_rw(
            &mut rep.cmd,
            cdbsz,
            rep.num_blks,
            blk as u64,
            wr && cfg.verify,
            wr,
            fua,
            dpo,
        )
    };
    if let Err(e) = build {
        log::error!(
            "bad cdb build, start_blk={}, blocks={}: {}",
            blk,
            rep.num_blks,
            e
        );
        return Err(StartErr::Fail);
    }
    if prefetch {
        if cdb::to_prefetch(&mut rep.cmd, cdbsz).is_err() {
            log::error!("bad PRE-FETCH build, start_blk={}, blocks={}", blk, rep.num_blks);
            return Err(StartErr::Fail);
        }
    }

    let mut flags: u32 = 0;
    if mmap && (cfg.noshare || rep.outregfd >= 0) {
        flags |= sgio::SG_FLAG_MMAP_IO;
    }
    if noxfer {
        flags |= sgio::SG_FLAG_NO_DXFER;
    }
    if dio {
        flags |= sgio::SG_FLAG_DIRECT_IO;
    }
    if polled {
        flags |= sgio::SGV4_FLAG_POLLED;
    }
    if qhead {
        flags |= sgio::SG_FLAG_Q_AT_HEAD;
    }
    if qtail {
        flags |= sgio::SG_FLAG_Q_AT_TAIL;
    }
    if mout_if {
        flags |= sgio::SGV4_FLAG_META_OUT_IF;
    }
    let share_desc = if rep.has_share {
        flags |= sgio::SGV4_FLAG_SHARE;
        if wr {
            flags |= sgio::SGV4_FLAG_NO_DXFER;
        } else if rep.outregfd < 0 {
            flags |= sgio::SGV4_FLAG_NO_DXFER;
        }
        if wr {
            " write_side active"
        } else {
            " read_side active"
        }
    } else if wr {
        " write-side not sharing"
    } else {
        " read_side not sharing"
    };

    // pack-id pairing: with both sides sg, READ takes 2k and its WRITE 2k+1
    let pack_id = if rep.both_sg {
        if wr {
            rep.rd_p_id + 1
        } else {
            let p = 2 * shared.next_pack_id_base();
            rep.rd_p_id = p;
            p
        }
    } else {
        shared.next_pack_id_base()
    };
    rep.rq_id = pack_id;

    let mut nblks = rep.num_blks;
    let mut blk_off: u32 = 0;

    if cfg.verbose > 0 && cfg.nmrqs == 0 && !FIRST_IO_LOGGED.swap(true, Ordering::SeqCst) {
        log::info!(
            "First normal IO:{}, flags: {}",
            share_desc,
            sgio::flags_str(flags)
        );
    }

    if !v4 {
        let mut hp = SgIoHdr {
            interface_id: 'S' as i32,
            cmd_len: cdbsz as u8,
            cmdp: rep.cmd.as_mut_ptr(),
            dxferp: rep.buffp(cfg) as *mut libc::c_void,
            dxfer_len: cfg.bs * rep.num_blks,
            mx_sb_len: rep.sb.len() as u8,
            sbp: rep.sb.as_mut_ptr(),
            timeout: cfg.cmd_timeout_ms,
            pack_id,
            flags,
            ..Default::default()
        };
        hp.dxfer_direction = if !wr {
            sgio::SG_DXFER_FROM_DEV
        } else if prefetch {
            hp.dxfer_len = 0;
            hp.dxferp = std::ptr::null_mut();
            sgio::SG_DXFER_NONE
        } else {
            sgio::SG_DXFER_TO_DEV
        };
        hp.usr_ptr = rep as *mut Rq as *mut libc::c_void;
        rep.io_hdr = hp;

        loop {
            let res = raw_write(
                fd,
                &rep.io_hdr as *const SgIoHdr as *const u8,
                std::mem::size_of::<SgIoHdr>(),
            );
            match res {
                Ok(_) => return Ok(pack_id),
                Err(e @ (Errno::EINTR | Errno::EAGAIN | Errno::EBUSY)) => {
                    count_transient(shared, fd, rep.id, cfg.verbose, e, true);
                    std::thread::yield_now();
                }
                Err(Errno::ENOMEM) => return Err(StartErr::NoMem),
                Err(e) => {
                    log::error!(
                        "tid={}: {}{} write(2) failed: {}",
                        rep.id,
                        crwp,
                        share_desc,
                        e
                    );
                    return Err(StartErr::Fail);
                }
            }
        }
    }

    // v4 path
    let hp_ind = xtrp.map(|x| x.hpv4_ind).unwrap_or(0);
    let mut h4 = SgIoV4 {
        guard: 'Q' as i32,
        request_len: cdbsz as u32,
        request: rep.cmd.as_ptr() as u64,
        max_response_len: rep.sb.len() as u32,
        response: rep.sb.as_ptr() as u64,
        timeout: cfg.cmd_timeout_ms,
        usr_ptr: rep as *mut Rq as u64,
        request_extra: pack_id as u32,
        ..Default::default()
    };
    if cfg.nmrqs > 0 && rep.both_sg && rep.outfd == fd {
        flags |= sgio::SGV4_FLAG_DO_ON_OTHER;
    }
    if let Some(x) = xtrp {
        if x.dout_is_split && nblks > 0 {
            if x.hpv4_ind == 1 {
                flags |= sgio::SGV4_FLAG_DOUT_OFFSET;
                blk_off = x.blk_offset;
                h4.spare_in = cfg.bs * blk_off;
            }
            nblks = x.blks;
            if x.hpv4_ind == 0 && nblks < rep.num_blks {
                flags |= sgio::SGV4_FLAG_KEEP_SHARE;
            }
        }
    }
    if cfg.ofile2_given && wr && rep.has_share && !is_wr2 {
        flags |= sgio::SGV4_FLAG_KEEP_SHARE; // hold share for the second write
    } else if cfg.fail_mask & 1 != 0 {
        flags |= sgio::SGV4_FLAG_KEEP_SHARE; // troublemaking
    }
    if wr {
        if !prefetch {
            h4.dout_xfer_len = cfg.bs * nblks;
            h4.dout_xferp = rep.buffp(cfg) as u64;
        }
    } else if nblks > 0 {
        h4.din_xfer_len = cfg.bs * nblks;
        h4.din_xferp = rep.buffp(cfg) as u64;
    }
    h4.flags = flags;
    if cfg.verbose > 3 {
        log::debug!(
            "tid,rq_id={},{}: SCSI {}{} {}, blk={} num_blks={}",
            rep.id,
            pack_id,
            crwp,
            share_desc,
            sgio::flags_str(flags),
            blk + i64::from(blk_off),
            nblks
        );
    }
    rep.io_hdr4[hp_ind] = h4;

    if cfg.nmrqs > 0 {
        let mut cdb_slot = [0u8; sgio::MRQ_CDB_SLOT];
        cdb_slot[..cdbsz].copy_from_slice(&rep.cmd[..cdbsz]);
        if wr {
            rep.out_mrq_q_blks += nblks;
        } else {
            rep.in_mrq_q_blks += nblks;
        }
        def_arr.push(rep.io_hdr4[hp_ind], cdb_slot);
        if def_arr.len() >= cfg.nmrqs as usize {
            if mrq::do_deferred_mrq(cfg, shared, rep, def_arr).is_err() {
                log::warn!("tid={}: deferred mrq flush failed", rep.id);
                return Err(StartErr::Fail);
            }
        }
        return Ok(pack_id);
    }

    loop {
        let res = unsafe { sgio::sg_iosubmit(fd, &mut rep.io_hdr4[hp_ind]) };
        match res {
            Ok(_) => break,
            Err(e @ (Errno::EINTR | Errno::EAGAIN | Errno::EBUSY)) => {
                count_transient(shared, fd, rep.id, cfg.verbose, e, true);
                std::thread::yield_now();
            }
            Err(Errno::ENOMEM) => return Err(StartErr::NoMem),
            Err(e) => {
                if e == Errno::E2BIG {
                    share::take_snap(fd, rep.id, true);
                }
                log::error!(
                    "tid={}: {}{} ioctl(SG_IOSUBMIT) failed: {}",
                    rep.id,
                    crwp,
                    share_desc,
                    e
                );
                return Err(StartErr::Fail);
            }
        }
    }

    // test hook: periodically abort our own in-flight command
    if cfg.aen > 0 && rep.rep_count > 0 && rep.rq_id % cfg.aen as i32 == 0 {
        std::thread::sleep(std::time::Duration::from_micros(4));
        shared.ev.num_abort_req.fetch_add(1, Ordering::SeqCst);
        let res = unsafe { sgio::sg_ioabort(fd, &rep.io_hdr4[hp_ind]) };
        match res {
            Ok(_) => {
                shared
                    .ev
                    .num_abort_req_success
                    .fetch_add(1, Ordering::SeqCst);
                if cfg.verbose > 2 {
                    log::debug!("sent ioctl(SG_IOABORT) on rq_id={}, success", pack_id);
                }
            }
            Err(Errno::ENODATA) => {
                if cfg.verbose > 2 {
                    log::debug!("ioctl(SG_IOABORT) no match on pack_id={}", pack_id);
                }
            }
            Err(e) => log::warn!("ioctl(SG_IOABORT) failed: {}", e),
        }
    }
    Ok(pack_id)
}

/// Fetch and classify the completion for `pack_id`.
///
/// `Clean`/`ConditionMet` are success; `Recovered` is logged and
/// treated as success; `AbortedCommand`/`UnitAttention` tell the caller
/// to re-issue the same segment; everything else is fatal to the copy.
pub fn finish_io(
    cfg: &CopyConfig,
    shared: &Shared,
    rep: &mut Rq,
    wr: bool,
    pack_id: i32,
    xtrp: Option<&Xtra>,
) -> Category {
    let fp = if wr { &cfg.out_flags } else { &cfg.in_flags };
    let v4 = fp.v4;
    let mout_if = fp.mout_if;
    let is_wr2 = xtrp.map(|x| x.is_wr2).unwrap_or(false);
    let prefetch = xtrp.map(|x| x.prefetch).unwrap_or(false);
    let blk = if wr { rep.oblk } else { rep.iblk };
    let fd = if wr {
        if is_wr2 {
            rep.out2fd
        } else {
            rep.outfd
        }
    } else {
        rep.infd
    };
    let cp = if wr {
        if prefetch {
            if is_wr2 {
                "prefetch2"
            } else {
                "prefetch"
            }
        } else if cfg.verify {
            if is_wr2 {
                "verifying2"
            } else {
                "verifying"
            }
        } else if is_wr2 {
            "writing2"
        } else {
            "writing"
        }
    } else {
        "reading"
    };

    if !v4 {
        let mut io_hdr = SgIoHdr {
            interface_id: 'S' as i32,
            dxfer_direction: if wr {
                sgio::SG_DXFER_TO_DEV
            } else {
                sgio::SG_DXFER_FROM_DEV
            },
            pack_id,
            ..Default::default()
        };
        loop {
            let res = raw_read(
                fd,
                &mut io_hdr as *mut SgIoHdr as *mut u8,
                std::mem::size_of::<SgIoHdr>(),
            );
            match res {
                Ok(_) => break,
                Err(e @ (Errno::EINTR | Errno::EAGAIN | Errno::EBUSY)) => {
                    count_transient(shared, fd, rep.id, cfg.verbose, e, false);
                    std::thread::yield_now();
                }
                Err(e) => {
                    log::error!("tid={}: finishing io [read(2)] on sg device: {}", rep.id, e);
                    return Category::Other;
                }
            }
        }
        if io_hdr.usr_ptr != rep as *mut Rq as *mut libc::c_void {
            log::error!(
                "tid={}: bad usr_ptr, request-response mismatch",
                rep.id
            );
            shared.stop_both();
            return Category::Other;
        }
        rep.io_hdr = io_hdr;
        let res = sgio::classify_result(
            io_hdr.status,
            u32::from(io_hdr.host_status),
            u32::from(io_hdr.driver_status),
            &rep.sb[..io_hdr.sb_len_wr as usize],
        );
        match res {
            Category::Clean | Category::ConditionMet => {}
            Category::Recovered => {
                log::warn!("tid={}: {} blk={}: recovered error, continuing", rep.id, cp, blk);
            }
            Category::AbortedCommand | Category::UnitAttention => {
                if cfg.verbose > 3 {
                    log::debug!("tid={}: {} blk={}: {:?}, will retry", rep.id, cp, blk, res);
                }
                return res;
            }
            other => {
                if other == Category::Miscompare {
                    shared.ev.num_miscompare.fetch_add(1, Ordering::SeqCst);
                }
                log::error!("tid={}: {} blk={}: {:?}", rep.id, cp, blk, other);
                return other;
            }
        }
        rep.dio_incomplete_count =
            if fp.dio && (io_hdr.info & sgio::SG_INFO_DIRECT_IO_MASK) == 0 {
                1 // direct IO was demoted to indirect
            } else {
                0
            };
        rep.resid = io_hdr.resid;
        if cfg.verbose > 3 {
            log::debug!("tid={}: completed {}", rep.id, cp);
        }
        return Category::Clean;
    }

    // v4
    if cfg.nmrqs > 0 {
        // completion arrives with the MRQ flush instead
        rep.resid = 0;
        return Category::Clean;
    }
    let hp_ind = xtrp.map(|x| x.hpv4_ind).unwrap_or(0);
    {
        let h4 = &mut rep.io_hdr4[hp_ind];
        h4.request_extra = pack_id as u32;
        if mout_if {
            h4.info = 0;
            h4.din_resid = 0;
        }
    }
    loop {
        let res = unsafe { sgio::sg_ioreceive(fd, &mut rep.io_hdr4[hp_ind]) };
        match res {
            Ok(_) => break,
            Err(e @ (Errno::EINTR | Errno::EAGAIN | Errno::EBUSY)) => {
                count_transient(shared, fd, rep.id, cfg.verbose, e, false);
                std::thread::yield_now();
            }
            Err(e) => {
                log::error!(
                    "tid={}: finishing io [SG_IORECEIVE] on sg device: {}",
                    rep.id,
                    e
                );
                return Category::Other;
            }
        }
    }
    let h4 = rep.io_hdr4[hp_ind];
    if mout_if && h4.info == 0 && h4.din_resid == 0 {
        rep.dio_incomplete_count = 0;
        rep.resid = 0;
        return Category::Clean;
    }
    if h4.usr_ptr != rep as *mut Rq as u64 {
        log::error!("tid={}: bad usr_ptr, request-response mismatch", rep.id);
        shared.stop_both();
        return Category::Other;
    }
    let slen = (h4.response_len as usize).min(rep.sb.len());
    let res = sgio::classify_result(
        h4.device_status as u8,
        h4.transport_status,
        h4.driver_status,
        &rep.sb[..slen],
    );
    match res {
        Category::Clean | Category::ConditionMet => {}
        Category::Recovered => {
            log::warn!(
                "tid={}: {} rq_id={}, blk={}: recovered error, continuing",
                rep.id,
                cp,
                pack_id,
                blk
            );
        }
        Category::AbortedCommand | Category::UnitAttention => {
            if cfg.verbose > 3 {
                log::debug!(
                    "tid={}: {} rq_id={}, blk={}: {:?}, will retry",
                    rep.id,
                    cp,
                    pack_id,
                    blk,
                    res
                );
            }
            return res;
        }
        other => {
            if other == Category::Miscompare {
                shared.ev.num_miscompare.fetch_add(1, Ordering::SeqCst);
            }
            log::error!(
                "tid={}: {} rq_id={}, blk={}: {:?} info=0x{:x}",
                rep.id,
                cp,
                pack_id,
                blk,
                other,
                h4.info
            );
            if cfg.verbose > 4 && h4.info != 0 {
                log::debug!(
                    " info=0x{:x} check={} direct={} detaching={} aborted={}",
                    h4.info,
                    (h4.info & sgio::SG_INFO_CHECK) != 0,
                    (h4.info & sgio::SG_INFO_DIRECT_IO) != 0,
                    (h4.info & sgio::SG_INFO_DEVICE_DETACHING) != 0,
                    (h4.info & sgio::SG_INFO_ABORTED) != 0
                );
            }
            return other;
        }
    }
    rep.dio_incomplete_count = if fp.dio && (h4.info & sgio::SG_INFO_DIRECT_IO) == 0 {
        1
    } else {
        0
    };
    rep.resid = h4.din_resid;
    if cfg.verbose > 4 {
        log::debug!("tid,rq_id={},{}: completed {}", rep.id, pack_id, cp);
    }
    Category::Clean
}
