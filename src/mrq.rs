//! Multi-request (MRQ) engine.
//!
//! With `mrq=NRQS` active, prepared v4 headers are not submitted one at
//! a time: each worker accumulates them (with copies of their CDBs) in
//! a deferred array and hands the whole batch to the driver in a single
//! ioctl once `NRQS` entries are queued or the copy loop ends. The
//! per-element responses come back through the same array.

use std::sync::atomic::Ordering;

use nix::errno::Errno;
use rand::Rng;

use crate::pt::Rq;
use crate::sgio::{self, SgIoV4};
use crate::share;
use crate::state::{Shared, MONO_MRQ_ID_INIT};
use crate::CopyConfig;

/// Pending v4 requests plus their CDBs. The CDB slots are addressed by
/// the headers right before submission, so the vectors must not grow
/// between pointer fix-up and the ioctl; `fixup_cdb_pointers` is only
/// called from the flush paths once the array is final.
#[derive(Default)]
pub struct DeferredArray {
    pub hdrs: Vec<SgIoV4>,
    pub cdbs: Vec<[u8; sgio::MRQ_CDB_SLOT]>,
}

impl DeferredArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hdr: SgIoV4, cdb: [u8; sgio::MRQ_CDB_SLOT]) {
        self.hdrs.push(hdr);
        self.cdbs.push(cdb);
    }

    pub fn len(&self) -> usize {
        self.hdrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hdrs.is_empty()
    }

    pub fn clear(&mut self) {
        self.hdrs.clear();
        self.cdbs.clear();
    }
}

/// Point each header's `request` at its CDB. With `mrq=...,C` the CDBs
/// are instead gathered into one contiguous allocation referenced by
/// the control object (returned so it outlives the ioctl).
fn fixup_cdb_pointers(
    def_arr: &mut DeferredArray,
    mrq_cmds: bool,
    ctl: &mut SgIoV4,
) -> Option<Vec<u8>> {
    let nrq = def_arr.len();
    if mrq_cmds {
        let mut cmd_ap = vec![0u8; nrq * sgio::MAX_SCSI_CDBSZ];
        for (k, h4p) in def_arr.hdrs.iter_mut().enumerate() {
            let len = (h4p.request_len as usize).min(sgio::MAX_SCSI_CDBSZ);
            let dst = k * sgio::MAX_SCSI_CDBSZ;
            cmd_ap[dst..dst + len].copy_from_slice(&def_arr.cdbs[k][..len]);
            h4p.request = 0;
        }
        ctl.request_len = (nrq * sgio::MAX_SCSI_CDBSZ) as u32;
        ctl.request = cmd_ap.as_ptr() as u64;
        Some(cmd_ap)
    } else {
        for (k, h4p) in def_arr.hdrs.iter_mut().enumerate() {
            h4p.request = def_arr.cdbs[k].as_ptr() as u64;
        }
        None
    }
}

/// Scan the per-element responses of a completed (or partially
/// completed) MRQ. Returns the number of good elements and the block
/// counts they moved in each direction. A missing `MRQ_FINI` bit is an
/// ordering hole and tolerated; `INFO_CHECK`, bad statuses and sense
/// data (other than deferred errors) make an element bad.
pub fn process_mrq_response(
    cfg: &CopyConfig,
    rep: &Rq,
    ctl: &SgIoV4,
    arr: &[SgIoV4],
    num_mrq: usize,
) -> (i32, u32, u32) {
    let id = rep.id;
    let resid = ctl.din_resid;
    let sres = ctl.spare_out;
    let n_subm = num_mrq as i64 - i64::from(ctl.dout_resid);
    let n_cmpl = ctl.info as i64;
    let mut n_good: i32 = 0;
    let mut hole_count = 0;
    let mut good_inblks: u32 = 0;
    let mut good_outblks: u32 = 0;

    if cfg.verbose > 2 {
        log::debug!(
            "tid={}: mrq response: num_mrq={}, n_subm={}, n_cmpl={}",
            id,
            num_mrq,
            n_subm,
            n_cmpl
        );
    }
    if n_subm < 0 {
        log::warn!(
            "tid={}: co.dout_resid({}) > num_mrq({})",
            id,
            ctl.dout_resid,
            num_mrq
        );
        return (-1, 0, 0);
    }
    if n_cmpl != num_mrq as i64 - i64::from(resid) {
        log::warn!(
            "tid={}: co.info({}) != num_mrq({}) - co.din_resid({}), using co.info",
            id,
            n_cmpl,
            num_mrq,
            resid
        );
    }
    if n_cmpl > n_subm {
        log::warn!(
            "tid={}: n_cmpl({}) > n_subm({}), use n_subm for both",
            id,
            n_cmpl,
            n_subm
        );
    }
    if sres != 0 {
        log::warn!(
            "tid={}: secondary error: {} [{}], info=0x{:x}",
            id,
            Errno::from_raw(sres as i32),
            sres,
            ctl.info
        );
        if sres as i32 == libc::E2BIG {
            share::take_snap(rep.infd, id, true);
            share::take_snap(rep.outfd, id, true);
        }
    }

    // Holes (info == 0) appear when completions arrive out of order
    // after an error; they do not consume a submission slot.
    let mut j: i64 = 0;
    for (k, a) in arr.iter().enumerate() {
        if k >= num_mrq || j >= n_subm {
            break;
        }
        let f1 = i64::from(a.info != 0);
        j += f1;
        if a.info & sgio::SG_INFO_MRQ_FINI == 0 {
            hole_count += 1;
        }
        let mut ok = true;
        if a.info & sgio::SG_INFO_CHECK != 0 {
            ok = false;
            log::warn!("tid={}: a_v4[{}]: SG_INFO_CHECK set, info=0x{:x}", id, k, a.info);
        }
        if sgio::scsi_status_is_bad(a.device_status as u8)
            || a.transport_status != 0
            || a.driver_status != 0
        {
            ok = false;
            if a.device_status as u8 != sgio::SAM_STAT_CHECK_CONDITION {
                log::warn!(
                    "tid={}: a_v4[{}]: dev/transport/driver status 0x{:x}/0x{:x}/0x{:x}",
                    id,
                    k,
                    a.device_status,
                    a.transport_status,
                    a.driver_status
                );
            }
        }
        let slen = a.response_len as usize;
        if slen > 0 {
            let sb_ptr = if ctl.response != 0 {
                ctl.response
            } else {
                a.response
            };
            if sb_ptr != 0 {
                let sb = unsafe {
                    std::slice::from_raw_parts(
                        sb_ptr as *const u8,
                        slen.min(sgio::SENSE_BUFF_LEN),
                    )
                };
                if let Some(ssh) = sgio::normalize_sense(sb) {
                    if ssh.deferred() {
                        ok = true;
                    }
                    if cfg.verbose > 0 {
                        log::debug!(
                            "tid={}: a_v4[{}]: sense key=0x{:x} asc/ascq=0x{:x}/0x{:x}",
                            id,
                            k,
                            ssh.sense_key,
                            ssh.asc,
                            ssh.ascq
                        );
                    }
                }
            }
        }
        if ok && f1 != 0 {
            n_good += 1;
            if a.dout_xfer_len >= cfg.bs {
                good_outblks += (a.dout_xfer_len - a.dout_resid as u32) / cfg.bs;
            }
            if a.din_xfer_len >= cfg.bs {
                good_inblks += (a.din_xfer_len - a.din_resid as u32) / cfg.bs;
            }
        }
    }
    if hole_count > 0 && cfg.verbose > 1 {
        log::debug!("tid={}: mrq response has {} hole(s)", id, hole_count);
    }
    (n_good, good_inblks, good_outblks)
}

/// Give blocks that never completed back to the remaining counters so
/// exit accounting stays correct.
fn return_unfinished(shared: &Shared, rep: &Rq, good_in: u32, good_out: u32) {
    let resid = rep.in_mrq_q_blks as i64 - i64::from(good_in);
    if resid > 0 {
        shared.in_rem_count.fetch_add(resid, Ordering::SeqCst);
    }
    let resid = rep.out_mrq_q_blks as i64 - i64::from(good_out);
    if resid > 0 {
        shared.out_rem_count.fetch_add(resid, Ordering::SeqCst);
    }
}

/// Split a deferred array by the `DO_ON_OTHER` flag: entries carrying
/// it belong to the other (write) fd and have the flag masked out.
fn split_def_arr(def_arr: &DeferredArray) -> (DeferredArray, DeferredArray) {
    let mut this_fd = DeferredArray::new();
    let mut other_fd = DeferredArray::new();
    for (h4p, cdb) in def_arr.hdrs.iter().zip(def_arr.cdbs.iter()) {
        if h4p.flags & sgio::SGV4_FLAG_DO_ON_OTHER != 0 {
            let mut h = *h4p;
            h.flags &= !sgio::SGV4_FLAG_DO_ON_OTHER;
            other_fd.push(h, *cdb);
        } else {
            this_fd.push(*h4p, *cdb);
        }
    }
    (this_fd, other_fd)
}

/// Full non-blocking MRQ on a single fd: submit with `IMMED`, poll
/// `SG_GET_NUM_WAITING` (10 microsecond naps) until half the batch has
/// landed, receive, then repeat for the remainder.
fn do_async_mrq(
    cfg: &CopyConfig,
    shared: &Shared,
    rep: &Rq,
    def_arr: &DeferredArray,
    fd: i32,
    ctl: &mut SgIoV4,
    nrq: usize,
) -> Result<(), ()> {
    let half = nrq / 2;
    let wait_us = std::time::Duration::from_micros(10);
    let hold_ctlo = *ctl;

    ctl.flags = sgio::SGV4_FLAG_MULTIPLE_REQS | sgio::SGV4_FLAG_IMMED;
    if cfg.in_flags.polled || cfg.out_flags.polled {
        ctl.flags |= sgio::SGV4_FLAG_POLLED;
    }
    if let Err(e) = unsafe { sgio::sg_iosubmit(fd, ctl) } {
        if e == Errno::E2BIG {
            share::take_snap(fd, rep.id, true);
        }
        log::error!(
            "tid={}: ioctl(SG_IOSUBMIT, {}) failed: {}",
            rep.id,
            sgio::flags_str(ctl.flags),
            e
        );
        return Err(());
    }

    let receive_chunk = |ctl: &mut SgIoV4, want: usize| -> Result<usize, ()> {
        for _ in 0..100_000 {
            shared.ev.num_waiting_calls.fetch_add(1, Ordering::SeqCst);
            let mut nwait: libc::c_int = 0;
            if let Err(e) = unsafe { sgio::sg_get_num_waiting(fd, &mut nwait) } {
                log::error!("tid={}: ioctl(SG_GET_NUM_WAITING) failed: {}", rep.id, e);
                return Err(());
            }
            if nwait as usize >= want {
                break;
            }
            std::thread::sleep(wait_us);
        }
        ctl.flags = sgio::SGV4_FLAG_MULTIPLE_REQS | sgio::SGV4_FLAG_IMMED;
        match unsafe { sgio::sg_ioreceive(fd, ctl) } {
            Ok(_) => Ok(ctl.info as usize),
            Err(Errno::ENODATA) => Ok(0),
            Err(e) => {
                log::error!("tid={}: ioctl(SG_IORECEIVE) failed: {}", rep.id, e);
                Err(())
            }
        }
    };

    // first half
    let half_num = receive_chunk(ctl, half)?;
    let (num_good, in_fin, out_fin) =
        process_mrq_response(cfg, rep, ctl, &def_arr.hdrs, half_num);
    if cfg.verbose > 2 {
        log::debug!(
            "tid={}: async mrq 1st: num_good={}, in_q/fin={}/{}, out_q/fin={}/{}",
            rep.id,
            num_good,
            rep.in_mrq_q_blks,
            in_fin,
            rep.out_mrq_q_blks,
            out_fin
        );
    }
    if num_good < 0 || (num_good as usize) < half_num {
        return_unfinished(shared, rep, in_fin, out_fin);
        return Err(());
    }

    let rest = nrq - half_num;
    if rest < 1 {
        return Ok(());
    }
    // remainder lands in the tail of the response array
    let mut ctl2 = hold_ctlo;
    let consumed = (half_num * std::mem::size_of::<SgIoV4>()) as u64;
    ctl2.din_xferp += consumed;
    ctl2.din_xfer_len -= consumed as u32;
    ctl2.dout_xferp = ctl2.din_xferp;
    ctl2.dout_xfer_len = ctl2.din_xfer_len;
    let half_num = receive_chunk(&mut ctl2, rest)?;
    let (num_good, in_fin, out_fin) =
        process_mrq_response(cfg, rep, &ctl2, &def_arr.hdrs, half_num);
    if cfg.verbose > 2 {
        log::debug!(
            "tid={}: async mrq 2nd: num_good={}, in_q/fin={}/{}, out_q/fin={}/{}",
            rep.id,
            num_good,
            rep.in_mrq_q_blks,
            in_fin,
            rep.out_mrq_q_blks,
            out_fin
        );
    }
    if num_good < 0 || (num_good as usize) < half_num {
        return_unfinished(shared, rep, in_fin, out_fin);
        return Err(());
    }
    Ok(())
}

/// Short-lived helper that aborts an in-flight MRQ group after a small
/// random delay. The flusher joins it before returning.
fn mrq_abort(shared: &Shared, fd: i32, mrq_id: i32, from_tid: usize, vb: u8) {
    if vb > 0 {
        log::debug!("tid={}: to abort mrq_pack_id={}", from_tid, mrq_id);
    }
    let mut n: libc::c_int = 0;
    shared.ev.num_waiting_calls.fetch_add(1, Ordering::SeqCst);
    match unsafe { sgio::sg_get_num_waiting(fd, &mut n) } {
        Ok(_) => {
            if vb > 0 {
                log::debug!("tid={}: num_waiting={}", from_tid, n);
            }
        }
        Err(e) => log::warn!("tid={}: ioctl(SG_GET_NUM_WAITING) failed: {}", from_tid, e),
    }
    let delay_us: u32 = rand::rng().random_range(5..=500);
    if vb > 1 {
        log::debug!("tid={}: abort delay={} microsecs", from_tid, delay_us);
    }
    if delay_us >= 20 {
        std::thread::sleep(std::time::Duration::from_micros(u64::from(delay_us)));
    }
    let ctl = SgIoV4 {
        guard: 'Q' as i32,
        flags: sgio::SGV4_FLAG_MULTIPLE_REQS,
        request_extra: mrq_id as u32,
        ..Default::default()
    };
    shared.ev.num_mrq_abort_req.fetch_add(1, Ordering::SeqCst);
    match unsafe { sgio::sg_ioabort(fd, &ctl) } {
        Ok(_) => {
            shared
                .ev
                .num_mrq_abort_req_success
                .fetch_add(1, Ordering::SeqCst);
            if vb > 1 {
                log::debug!(
                    "tid={}: sent ioctl(SG_IOABORT) on MRQ rq_id={}, success",
                    from_tid,
                    mrq_id
                );
            }
        }
        Err(Errno::ENODATA) => {
            log::debug!(
                "tid={}: ioctl(SG_IOABORT) no match on MRQ pack_id={}",
                from_tid,
                mrq_id
            );
        }
        Err(e) => log::warn!("tid={}: MRQ ioctl(SG_IOABORT) failed: {}", from_tid, e),
    }
}

/// Flush the deferred array: set up the controlling object, pick the
/// submit mode, send, and process the responses. Clears the array.
pub fn do_deferred_mrq(
    cfg: &CopyConfig,
    shared: &Shared,
    rep: &mut Rq,
    def_arr: &mut DeferredArray,
) -> Result<(), ()> {
    let nrq = def_arr.len();
    if nrq < 1 {
        log::warn!("tid={}: strange nrq=0, nothing to do", rep.id);
        return Ok(());
    }
    let id = rep.id;
    let mut ctl = SgIoV4 {
        guard: 'Q' as i32,
        ..Default::default()
    };
    // _cmd_ap keeps the packed-CDB allocation alive across the ioctl
    let _cmd_ap = fixup_cdb_pointers(def_arr, cfg.mrq_cmds, &mut ctl);

    let fd = if rep.both_sg || rep.same_sg {
        rep.infd // assume share to rep.outfd
    } else if rep.only_in_sg {
        rep.infd
    } else if rep.only_out_sg {
        rep.outfd
    } else {
        log::warn!("tid={}: deferred mrq with no sg devices", id);
        def_arr.clear();
        return Err(());
    };

    ctl.flags = sgio::SGV4_FLAG_MULTIPLE_REQS;
    if !cfg.mrq_async {
        ctl.flags |= sgio::SGV4_FLAG_STOP_IF;
        if cfg.in_flags.mrq_svb || cfg.out_flags.mrq_svb {
            ctl.flags |= sgio::SGV4_FLAG_SHARE;
        }
    }
    ctl.dout_xferp = def_arr.hdrs.as_ptr() as u64; // request array
    ctl.dout_xfer_len = (nrq * std::mem::size_of::<SgIoV4>()) as u32;
    ctl.din_xferp = ctl.dout_xferp; // response array
    ctl.din_xfer_len = ctl.dout_xfer_len;

    let mrq_pack_id = shared.next_mrq_id();
    let launch_abort = cfg.m_aen > 0
        && mrq_pack_id != MONO_MRQ_ID_INIT
        && (mrq_pack_id - MONO_MRQ_ID_INIT) % cfg.m_aen as i32 == 0;
    ctl.request_extra = if launch_abort { mrq_pack_id as u32 } else { 0 };
    rep.mrq_id = mrq_pack_id;
    if launch_abort && cfg.verbose > 2 {
        log::debug!("tid={}: launching MRQ abort thread, mrq_id={}", id, mrq_pack_id);
    }

    let res = std::thread::scope(|s| {
        if launch_abort {
            let vb = cfg.verbose;
            s.spawn(move || mrq_abort(shared, fd, mrq_pack_id, id, vb));
        }

        if cfg.mrq_async && !rep.both_sg {
            // one or both portions go out fully non-blocking, each to
            // its own fd
            let (mut fd_arr, mut o_fd_arr) = split_def_arr(def_arr);
            let mut res = Ok(());
            if !fd_arr.is_empty() {
                let mut fd_ctl = ctl;
                let _keep = fixup_cdb_pointers(&mut fd_arr, cfg.mrq_cmds, &mut fd_ctl);
                let num = fd_arr.len();
                fd_ctl.dout_xferp = fd_arr.hdrs.as_ptr() as u64;
                fd_ctl.dout_xfer_len = (num * std::mem::size_of::<SgIoV4>()) as u32;
                fd_ctl.din_xferp = fd_ctl.dout_xferp;
                fd_ctl.din_xfer_len = fd_ctl.dout_xfer_len;
                fd_ctl.request_extra = if launch_abort { mrq_pack_id as u32 } else { 0 };
                res = do_async_mrq(cfg, shared, rep, &fd_arr, fd, &mut fd_ctl, num);
                rep.in_mrq_q_blks = 0;
            }
            if res.is_ok() && !o_fd_arr.is_empty() {
                let mut o_fd_ctl = ctl;
                let _keep = fixup_cdb_pointers(&mut o_fd_arr, cfg.mrq_cmds, &mut o_fd_ctl);
                let num = o_fd_arr.len();
                o_fd_ctl.dout_xferp = o_fd_arr.hdrs.as_ptr() as u64;
                o_fd_ctl.dout_xfer_len = (num * std::mem::size_of::<SgIoV4>()) as u32;
                o_fd_ctl.din_xferp = o_fd_ctl.dout_xferp;
                o_fd_ctl.din_xfer_len = o_fd_ctl.dout_xfer_len;
                o_fd_ctl.request_extra = if launch_abort { mrq_pack_id as u32 } else { 0 };
                res = do_async_mrq(cfg, shared, rep, &o_fd_arr, rep.outfd, &mut o_fd_ctl, num);
                rep.out_mrq_q_blks = 0;
            }
            return res;
        }

        // blocking variants, retried while the kernel is at capacity
        let (ordered, iosub_str) = if cfg.unbalanced_mrq || cfg.mrq_async {
            (false, "SG_IOSUBMIT(variable_blocking)")
        } else if cfg.in_flags.mrq_svb || cfg.out_flags.mrq_svb {
            (false, "SG_IOSUBMIT(shared_variable_blocking)")
        } else {
            (true, "SG_IO(ordered_blocking)")
        };
        loop {
            let res = if ordered {
                unsafe { sgio::sg_io_v4_ordered(fd, &mut ctl) }
            } else {
                unsafe { sgio::sg_iosubmit(fd, &mut ctl) }
            };
            match res {
                Ok(_) => break,
                Err(Errno::EBUSY) => {
                    shared.ev.num_ebusy.fetch_add(1, Ordering::SeqCst);
                    std::thread::yield_now();
                }
                Err(e) => {
                    if e == Errno::E2BIG {
                        share::take_snap(fd, id, true);
                    }
                    log::error!(
                        "tid={}: ioctl({}, {}) failed: {}",
                        id,
                        iosub_str,
                        sgio::flags_str(ctl.flags),
                        e
                    );
                    return Err(());
                }
            }
        }
        if cfg.verbose > 4 {
            log::debug!(
                "tid={}: controlling object after ioctl({}): info={} dout_resid={}",
                id,
                iosub_str,
                ctl.info,
                ctl.dout_resid
            );
        }
        let (num_good, in_fin, out_fin) =
            process_mrq_response(cfg, rep, &ctl, &def_arr.hdrs, nrq);
        if cfg.verbose > 2 {
            log::debug!(
                "tid={}: mrq flush: num_good={}, in_q/fin={}/{}, out_q/fin={}/{}",
                id,
                num_good,
                rep.in_mrq_q_blks,
                in_fin,
                rep.out_mrq_q_blks,
                out_fin
            );
        }
        let res = if num_good < 0 || (num_good as usize) < nrq {
            return_unfinished(shared, rep, in_fin, out_fin);
            Err(())
        } else {
            Ok(())
        };
        rep.in_mrq_q_blks = 0;
        rep.out_mrq_q_blks = 0;
        res
    });

    def_arr.clear();
    if launch_abort && cfg.verbose > 1 {
        log::debug!("tid={}: MRQ abort thread joined, mrq_id={}", id, mrq_pack_id);
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr(flags: u32) -> SgIoV4 {
        SgIoV4 {
            guard: 'Q' as i32,
            flags,
            ..Default::default()
        }
    }

    #[test]
    fn deferred_array_push_and_clear() {
        let mut d = DeferredArray::new();
        assert!(d.is_empty());
        d.push(hdr(0), [0u8; sgio::MRQ_CDB_SLOT]);
        d.push(hdr(0), [0u8; sgio::MRQ_CDB_SLOT]);
        assert_eq!(d.len(), 2);
        d.clear();
        assert!(d.is_empty());
    }

    #[test]
    fn split_by_do_on_other() {
        let mut d = DeferredArray::new();
        d.push(hdr(0), [1u8; sgio::MRQ_CDB_SLOT]);
        d.push(hdr(sgio::SGV4_FLAG_DO_ON_OTHER), [2u8; sgio::MRQ_CDB_SLOT]);
        d.push(hdr(0), [3u8; sgio::MRQ_CDB_SLOT]);
        let (this_fd, other_fd) = split_def_arr(&d);
        assert_eq!(this_fd.len(), 2);
        assert_eq!(other_fd.len(), 1);
        // flag masked out on the moved entry
        assert_eq!(other_fd.hdrs[0].flags & sgio::SGV4_FLAG_DO_ON_OTHER, 0);
        assert_eq!(other_fd.cdbs[0][0], 2);
    }

    #[test]
    fn cdb_pointer_fixup_individual() {
        let mut d = DeferredArray::new();
        let mut cdb = [0u8; sgio::MRQ_CDB_SLOT];
        cdb[0] = 0x28;
        let mut h = hdr(0);
        h.request_len = 10;
        d.push(h, cdb);
        let mut ctl = SgIoV4::default();
        let keep = fixup_cdb_pointers(&mut d, false, &mut ctl);
        assert!(keep.is_none());
        assert_eq!(d.hdrs[0].request, d.cdbs[0].as_ptr() as u64);
    }

    #[test]
    fn cdb_pointer_fixup_packed() {
        let mut d = DeferredArray::new();
        let mut cdb = [0u8; sgio::MRQ_CDB_SLOT];
        cdb[0] = 0x2a;
        let mut h = hdr(0);
        h.request_len = 10;
        d.push(h, cdb);
        let mut ctl = SgIoV4::default();
        let keep = fixup_cdb_pointers(&mut d, true, &mut ctl).unwrap();
        assert_eq!(d.hdrs[0].request, 0);
        assert_eq!(ctl.request_len as usize, sgio::MAX_SCSI_CDBSZ);
        assert_eq!(ctl.request, keep.as_ptr() as u64);
        assert_eq!(keep[0], 0x2a);
    }
}
