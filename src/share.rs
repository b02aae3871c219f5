//! Request sharing between paired sg file descriptors.
//!
//! When both endpoints are sg devices the write side is told (via the
//! extended-info ioctl) that its data payload is the read side's
//! reserved buffer, so the copy never round-trips through user space.
//! A configured secondary write target is serviced by swapping the read
//! side's partner fd mid-segment and swapping back afterwards.

use std::os::unix::io::RawFd;

use crate::sgio::{self, SgExtendedInfo};

/// Establish sharing: the write fd's payload becomes the read fd's
/// reserved buffer. Returns false (and the caller falls back to a
/// plain buffered copy) when the driver refuses.
pub fn share_prepare(write_side_fd: RawFd, read_side_fd: RawFd, id: usize, vb: bool) -> bool {
    let mut sei = SgExtendedInfo::default();
    sei.sei_wr_mask |= sgio::SG_SEIM_SHARE_FD;
    sei.sei_rd_mask |= sgio::SG_SEIM_SHARE_FD;
    sei.share_fd = read_side_fd as u32;
    if let Err(e) = unsafe { sgio::sg_set_get_extended(write_side_fd, &mut sei) } {
        log::warn!(
            "tid={}: ioctl(EXTENDED(shared_fd={})) failed: {}",
            id,
            read_side_fd,
            e
        );
        return false;
    }
    if vb {
        log::debug!(
            "tid={}: ioctl(EXTENDED(shared_fd)) ok, read_side_fd={}, write_side_fd={}",
            id,
            read_side_fd,
            write_side_fd
        );
    }
    true
}

/// Tear sharing down on the read side (worker exit, unless
/// `no_unshare` left it for the driver's release path).
pub fn unshare(sg_fd: RawFd, id: usize, vb: bool) {
    let mut sei = SgExtendedInfo::default();
    sei.sei_wr_mask |= sgio::SG_SEIM_CTL_FLAGS;
    sei.sei_rd_mask |= sgio::SG_SEIM_CTL_FLAGS;
    sei.ctl_flags_wr_mask |= sgio::SG_CTL_FLAGM_UNSHARE;
    sei.ctl_flags |= sgio::SG_CTL_FLAGM_UNSHARE;
    if let Err(e) = unsafe { sgio::sg_set_get_extended(sg_fd, &mut sei) } {
        log::warn!("tid={}: ioctl(EXTENDED(UNSHARE)) failed: {}", id, e);
        return;
    }
    if vb {
        log::debug!("tid={}: ioctl(UNSHARE) ok", id);
    }
}

/// Retarget the read side's share partner to `to_fd`. With `before`
/// set the READ_SIDE_FINI bit is cleared, putting the read side into
/// the swap state so the buffer can be written out a second time.
/// The driver returns EBUSY transiently while the previous write is
/// still draining; retried with yields, bounded at 10000 attempts.
pub fn swap_share(read_side_fd: RawFd, to_fd: RawFd, id: usize, before: bool, vb: bool) -> bool {
    let mut sei = SgExtendedInfo::default();
    sei.sei_wr_mask |= sgio::SG_SEIM_CHG_SHARE_FD;
    sei.sei_rd_mask |= sgio::SG_SEIM_CHG_SHARE_FD;
    sei.share_fd = to_fd as u32;
    if before {
        sei.sei_wr_mask |= sgio::SG_SEIM_CTL_FLAGS;
        sei.sei_rd_mask |= sgio::SG_SEIM_CTL_FLAGS;
        sei.ctl_flags_wr_mask |= sgio::SG_CTL_FLAGM_READ_SIDE_FINI;
        sei.ctl_flags &= !sgio::SG_CTL_FLAGM_READ_SIDE_FINI;
    }
    let mut reported = false;
    for k in 0.. {
        match unsafe { sgio::sg_set_get_extended(read_side_fd, &mut sei) } {
            Ok(_) => {
                if vb {
                    log::trace!(
                        "tid={}: ioctl(EXTENDED(change_shared_fd)) ok, read_side_fd={}, to_write_side_fd={}",
                        id,
                        read_side_fd,
                        to_fd
                    );
                }
                return true;
            }
            Err(nix::Error::EBUSY) if k <= 10000 => {
                if !reported {
                    log::debug!(
                        "tid={}: ioctl(EXTENDED(change_shared_fd={})) busy, retrying",
                        id,
                        to_fd
                    );
                    reported = true;
                }
                std::thread::yield_now();
            }
            Err(e) => {
                log::warn!(
                    "tid={}: ioctl(EXTENDED(change_shared_fd={})) failed: {}",
                    id,
                    to_fd,
                    e
                );
                return false;
            }
        }
    }
    false
}

/// Ask the driver to append a state snapshot to the kernel log
/// (`SG_CTL_FLAGM_SNAP_DEV` with the flag value zero means append).
pub fn take_snap(sg_fd: RawFd, id: usize, vb: bool) {
    let mut sei = SgExtendedInfo::default();
    sei.sei_wr_mask |= sgio::SG_SEIM_CTL_FLAGS;
    sei.sei_rd_mask |= sgio::SG_SEIM_CTL_FLAGS;
    sei.ctl_flags_wr_mask |= sgio::SG_CTL_FLAGM_SNAP_DEV;
    sei.ctl_flags &= !sgio::SG_CTL_FLAGM_SNAP_DEV;
    if let Err(e) = unsafe { sgio::sg_set_get_extended(sg_fd, &mut sei) } {
        log::warn!("tid={}: ioctl(EXTENDED(SNAP_DEV)) failed: {}", id, e);
        return;
    }
    if vb {
        log::debug!("tid={}: ioctl(SNAP_DEV) ok", id);
    }
}
