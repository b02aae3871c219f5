//! Endpoint classification, opening and capacity probing.
//!
//! Each side of the copy is sniffed once via `stat(2)` and held
//! immutable afterwards. sg devices get their reserved buffer sized
//! (or mmap'd), pack-id filtering enabled and per-fd control flags
//! applied; regular files and block devices are opened with the
//! `O_*` bits the side flags ask for and positioned at `skip`/`seek`.

use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::{stat, Mode, SFlag};

use crate::error::{Category, Error, Result};
use crate::flags::SideFlags;
use crate::sgio::{self, SgExtendedInfo, SgIoHdr};
use crate::CopyConfig;

const SCSI_GENERIC_MAJOR: u64 = 21;
const SCSI_TAPE_MAJOR: u64 = 9;
const MEM_MAJOR: u64 = 1;
const DEV_NULL_MINOR: u64 = 3;
const DEV_ZERO_MINOR: u64 = 5;

const PROC_SCSI_SG_VERSION: &str = "/proc/scsi/sg/version";
const SYS_SCSI_SG_VERSION: &str = "/sys/module/sg/version";

/// What an endpoint path points at. Tape is recognised only to be
/// rejected; `Synthetic` never comes from `classify` (it is selected by
/// `iflag=` patterns before any path is consulted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Sg,
    Block,
    CharOther,
    Tape,
    Regular,
    Fifo,
    DevNull,
    Synthetic,
    Error,
}

impl FileType {
    pub fn is_sg(self) -> bool {
        self == FileType::Sg
    }
}

/// Classify `path` the way dd would: `.` and the null/zero character
/// devices are the null sink, char majors pick sg/tape, and anything
/// `stat` rejects is `Error`. Returns the regular-file size alongside
/// (zero for special files).
pub fn classify(path: &str) -> (FileType, i64) {
    if path == "." {
        return (FileType::DevNull, 0);
    }
    let st = match stat(path) {
        Ok(st) => st,
        Err(_) => return (FileType::Error, 0),
    };
    // the file-type field is a code, not a bitmask
    let fmt = SFlag::from_bits_truncate(st.st_mode & SFlag::S_IFMT.bits());
    if fmt == SFlag::S_IFCHR {
        let maj = libc::major(st.st_rdev);
        let min = libc::minor(st.st_rdev);
        if u64::from(maj) == MEM_MAJOR
            && (u64::from(min) == DEV_NULL_MINOR || u64::from(min) == DEV_ZERO_MINOR)
        {
            // /dev/null and /dev/zero treated the same
            return (FileType::DevNull, 0);
        }
        if u64::from(maj) == SCSI_GENERIC_MAJOR {
            return (FileType::Sg, 0);
        }
        if u64::from(maj) == SCSI_TAPE_MAJOR {
            return (FileType::Tape, 0);
        }
        return (FileType::CharOther, 0);
    }
    if fmt == SFlag::S_IFBLK {
        return (FileType::Block, 0);
    }
    if fmt == SFlag::S_IFIFO {
        return (FileType::Fifo, 0);
    }
    (FileType::Regular, st.st_size)
}

/// sg driver version as `SG_GET_VERSION_NUM` style (major*10000 +
/// minor*100 + rev), read from procfs/sysfs before any fd exists.
/// Returns 0 when the module is absent.
pub fn fetch_sg_version() -> i32 {
    if let Ok(s) = std::fs::read_to_string(PROC_SCSI_SG_VERSION) {
        if let Some(tok) = s.split_whitespace().next() {
            if let Ok(v) = tok.parse::<i32>() {
                return v;
            }
        }
    }
    if let Ok(s) = std::fs::read_to_string(SYS_SCSI_SG_VERSION) {
        let parts: Vec<i32> = s
            .trim()
            .split('.')
            .filter_map(|p| p.parse::<i32>().ok())
            .collect();
        if parts.len() == 3 {
            return parts[0] * 10000 + parts[1] * 100 + parts[2];
        }
    }
    0
}

/// A prepared sg file descriptor.
pub struct SgHandle {
    pub fd: RawFd,
    /// Reserved buffer (or mmap) size granted by the driver.
    pub res_sz: usize,
    /// Non-null when the reserved buffer was mapped into user space.
    pub mmap_ptr: *mut u8,
    pub mmap_len: usize,
}

fn oflags_for(fp: &SideFlags, base: OFlag) -> OFlag {
    let mut flags = base;
    if fp.direct {
        flags |= OFlag::O_DIRECT;
    }
    if fp.excl {
        flags |= OFlag::O_EXCL;
    }
    if fp.dsync {
        flags |= OFlag::O_SYNC;
    }
    flags
}

/// Open an sg device read-write and prepare its per-fd state: version
/// gate, scatter-gather element size, control flags, reserved buffer
/// size (with the truncation check), optional mmap, FORCE_PACK_ID and
/// sg-debug.
pub fn open_sg(path: &str, fp: &SideFlags, cfg: &CopyConfig, want_mmap: bool) -> Result<SgHandle> {
    let flags = oflags_for(fp, OFlag::O_RDWR);
    let fd = open(path, flags, Mode::empty())
        .map_err(|e| Error::file(path, format!("could not open for sg use: {}", e)))?;
    match prepare_resbuf(fd, path, fp, cfg, want_mmap) {
        Ok(h) => {
            if cfg.noshare {
                noshare_enlarge(fd, cfg.verbose > 3);
            }
            Ok(h)
        }
        Err(e) => {
            unsafe { libc::close(fd) };
            Err(e)
        }
    }
}

fn prepare_resbuf(
    fd: RawFd,
    path: &str,
    fp: &SideFlags,
    cfg: &CopyConfig,
    want_mmap: bool,
) -> Result<SgHandle> {
    let mut t: libc::c_int = 0;
    let version_ok = unsafe { sgio::sg_get_version_num(fd, &mut t) }.is_ok() && t >= 40000;
    if !version_ok {
        log::warn!("sg driver prior to 4.0.00 on {}, reduced functionality", path);
    }
    let ge_40045 = version_ok && cfg.sg_version_ge_40045;

    let mut sei = SgExtendedInfo::default();
    if ge_40045 && cfg.elem_sz >= 4096 {
        sei.sei_rd_mask |= sgio::SG_SEIM_SGAT_ELEM_SZ;
        let res = unsafe { sgio::sg_set_get_extended(fd, &mut sei) };
        if let Err(e) = res {
            log::warn!("{}: SG_SET_GET_EXTENDED(SGAT_ELEM_SZ) rd error: {}", path, e);
        }
        if sei.sgat_elem_sz != cfg.elem_sz {
            sei = SgExtendedInfo::default();
            sei.sei_wr_mask |= sgio::SG_SEIM_SGAT_ELEM_SZ;
            sei.sgat_elem_sz = cfg.elem_sz;
            if let Err(e) = unsafe { sgio::sg_set_get_extended(fd, &mut sei) } {
                log::warn!("{}: SG_SET_GET_EXTENDED(SGAT_ELEM_SZ) wr error: {}", path, e);
            }
        }
    }
    if ge_40045 && (fp.no_dur || fp.masync || fp.wq_excl || fp.no_thresh) {
        sei = SgExtendedInfo::default();
        sei.sei_wr_mask |= sgio::SG_SEIM_CTL_FLAGS;
        if fp.no_dur {
            sei.ctl_flags_wr_mask |= sgio::SG_CTL_FLAGM_NO_DURATION;
            sei.ctl_flags |= sgio::SG_CTL_FLAGM_NO_DURATION;
        }
        if fp.masync {
            sei.ctl_flags_wr_mask |= sgio::SG_CTL_FLAGM_MORE_ASYNC;
            sei.ctl_flags |= sgio::SG_CTL_FLAGM_MORE_ASYNC;
        }
        if fp.wq_excl {
            sei.ctl_flags_wr_mask |= sgio::SG_CTL_FLAGM_EXCL_WAITQ;
            sei.ctl_flags |= sgio::SG_CTL_FLAGM_EXCL_WAITQ;
        }
        if fp.no_thresh {
            sei.tot_fd_thresh = 0;
            sei.sei_wr_mask |= sgio::SG_SEIM_TOT_FD_THRESH;
        }
        if let Err(e) = unsafe { sgio::sg_set_get_extended(fd, &mut sei) } {
            log::warn!("{}: SG_SET_GET_EXTENDED(ctl flags) error: {}", path, e);
        }
    }

    let mut num: libc::c_int = 0;
    let mut mmap_ptr: *mut u8 = std::ptr::null_mut();
    let mut mmap_len = 0usize;
    if fp.defres {
        unsafe { sgio::sg_get_reserved_size(fd, &mut num) }
            .map_err(|e| Error::os(format!("{}: SG_GET_RESERVED_SIZE", path), e))?;
    } else {
        num = (cfg.bs * cfg.bpt) as libc::c_int;
        unsafe { sgio::sg_set_reserved_size(fd, &num) }
            .map_err(|e| Error::os(format!("{}: SG_SET_RESERVED_SIZE", path), e))?;
        let mut granted: libc::c_int = 0;
        unsafe { sgio::sg_get_reserved_size(fd, &mut granted) }
            .map_err(|e| Error::os(format!("{}: SG_GET_RESERVED_SIZE", path), e))?;
        if granted < num {
            return Err(Error::file(
                path,
                format!(
                    "SG_GET_RESERVED_SIZE shows size truncated, wanted {} got {}",
                    num, granted
                ),
            ));
        }
        if want_mmap {
            let p = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    num as usize,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                )
            };
            if p == libc::MAP_FAILED {
                return Err(Error::file(
                    path,
                    format!("mmap({} bytes) of reserved buffer failed", num),
                ));
            }
            mmap_ptr = p as *mut u8;
            mmap_len = num as usize;
        }
    }

    let one: libc::c_int = 1;
    if let Err(e) = unsafe { sgio::sg_set_force_pack_id(fd, &one) } {
        log::warn!("{}: SG_SET_FORCE_PACK_ID error: {}", path, e);
    }
    if cfg.unit_nanosec && ge_40045 {
        sei = SgExtendedInfo::default();
        sei.sei_wr_mask |= sgio::SG_SEIM_CTL_FLAGS;
        sei.ctl_flags_wr_mask |= sgio::SG_CTL_FLAGM_TIME_IN_NS;
        sei.ctl_flags |= sgio::SG_CTL_FLAGM_TIME_IN_NS;
        if let Err(e) = unsafe { sgio::sg_set_get_extended(fd, &mut sei) } {
            log::warn!("{}: SG_SET_GET_EXTENDED(TIME_IN_NS) error: {}", path, e);
        }
    }
    if let Err(e) = unsafe { sgio::sg_set_debug(fd, &one) } {
        log::warn!("{}: SG_SET_DEBUG error: {}", path, e);
    }

    Ok(SgHandle {
        fd,
        res_sz: num as usize,
        mmap_ptr,
        mmap_len,
    })
}

/// With sharing disabled every worker carries an independent buffer, so
/// raise the per-fd total-data threshold to let the larger aggregate
/// through.
pub fn noshare_enlarge(fd: RawFd, vb: bool) {
    let mut sei = SgExtendedInfo::default();
    sei.sei_wr_mask |= sgio::SG_SEIM_TOT_FD_THRESH;
    sei.tot_fd_thresh = 96 * 1024 * 1024;
    if let Err(e) = unsafe { sgio::sg_set_get_extended(fd, &mut sei) } {
        log::warn!("SG_SET_GET_EXTENDED(TOT_FD_THRESH) error: {}", e);
        return;
    }
    if vb {
        log::debug!("ioctl(TOT_FD_THRESH) ok");
    }
}

/// Open a non-sg input (regular file or block device) read-only and
/// seek to `skip * bs`.
pub fn open_plain_input(path: &str, cfg: &CopyConfig) -> Result<RawFd> {
    let flags = oflags_for(&cfg.in_flags, OFlag::O_RDONLY);
    let fd = open(path, flags, Mode::empty())
        .map_err(|e| Error::file(path, format!("could not open for reading: {}", e)))?;
    if cfg.skip > 0 {
        let offset = cfg.skip * i64::from(cfg.bs);
        if unsafe { libc::lseek(fd, offset, libc::SEEK_SET) } < 0 {
            let e = Errno::last();
            unsafe { libc::close(fd) };
            return Err(Error::file(
                path,
                format!("couldn't skip to required position: {}", e),
            ));
        }
    }
    Ok(fd)
}

/// Open a non-sg output (regular file or block device) write-only,
/// creating it unless `nocreat`, honouring `append`, and seek to
/// `seek * bs`.
pub fn open_plain_output(path: &str, fp: &SideFlags, cfg: &CopyConfig) -> Result<RawFd> {
    let mut flags = oflags_for(fp, OFlag::O_WRONLY);
    if !fp.nocreat {
        flags |= OFlag::O_CREAT;
    }
    if fp.append {
        flags |= OFlag::O_APPEND;
    }
    let fd = open(path, flags, Mode::from_bits_truncate(0o666))
        .map_err(|e| Error::file(path, format!("could not open for writing: {}", e)))?;
    if cfg.seek > 0 {
        let offset = cfg.seek * i64::from(cfg.bs);
        if unsafe { libc::lseek(fd, offset, libc::SEEK_SET) } < 0 {
            let e = Errno::last();
            unsafe { libc::close(fd) };
            return Err(Error::file(
                path,
                format!("couldn't seek to required position: {}", e),
            ));
        }
    }
    Ok(fd)
}

/// Issue one synchronous v3 pass-through command, classifying the
/// result. Used for the startup capacity probe and the final cache
/// synchronisation, not for the copy data path.
fn simple_pt(fd: RawFd, cdb: &[u8], din: Option<&mut [u8]>) -> Category {
    let mut sb = [0u8; sgio::SENSE_BUFF_LEN];
    let mut hdr = SgIoHdr {
        interface_id: 'S' as i32,
        cmd_len: cdb.len() as u8,
        cmdp: cdb.as_ptr() as *mut u8,
        mx_sb_len: sb.len() as u8,
        sbp: sb.as_mut_ptr(),
        timeout: sgio::DEF_TIMEOUT_MS,
        pack_id: 0,
        ..Default::default()
    };
    match din {
        Some(buf) => {
            hdr.dxfer_direction = sgio::SG_DXFER_FROM_DEV;
            hdr.dxfer_len = buf.len() as u32;
            hdr.dxferp = buf.as_mut_ptr() as *mut libc::c_void;
        }
        None => hdr.dxfer_direction = sgio::SG_DXFER_NONE,
    }
    match unsafe { sgio::sg_io_v3(fd, &mut hdr) } {
        Ok(_) => sgio::classify_result(
            hdr.status,
            u32::from(hdr.host_status),
            u32::from(hdr.driver_status),
            &sb,
        ),
        Err(e) => {
            log::warn!("SG_IO failed: {}", e);
            Category::Other
        }
    }
}

/// READ CAPACITY(10), escalating to (16) when the 32-bit LBA space
/// overflows. Returns (number of blocks, block size).
pub fn scsi_read_capacity(fd: RawFd) -> std::result::Result<(i64, u32), Category> {
    let mut resp = [0u8; 32];
    let cdb10 = {
        let mut c = [0u8; 10];
        c[0] = 0x25;
        c
    };
    let cat = simple_pt(fd, &cdb10, Some(&mut resp[..8]));
    if cat != Category::Clean {
        return Err(cat);
    }
    if resp[..4] == [0xff, 0xff, 0xff, 0xff] {
        let mut cdb16 = [0u8; 16];
        cdb16[0] = 0x9e;
        cdb16[1] = 0x10; // READ CAPACITY(16) service action
        sgio::put_unaligned_be32(32, &mut cdb16[10..]);
        let cat = simple_pt(fd, &cdb16, Some(&mut resp));
        if cat != Category::Clean {
            return Err(cat);
        }
        let num = sgio::get_unaligned_be64(&resp) as i64 + 1;
        let sz = sgio::get_unaligned_be32(&resp[8..]);
        Ok((num, sz))
    } else {
        let num = i64::from(sgio::get_unaligned_be32(&resp)) + 1;
        let sz = sgio::get_unaligned_be32(&resp[4..]);
        Ok((num, sz))
    }
}

/// Block-device capacity via BLKSSZGET/BLKGETSIZE64.
pub fn read_blkdev_capacity(fd: RawFd) -> Result<(i64, u32)> {
    let mut ssz: libc::c_int = 0;
    unsafe { sgio::blk_ssz_get(fd, &mut ssz) }
        .map_err(|e| Error::os("BLKSSZGET", e))?;
    let mut bytes: u64 = 0;
    unsafe { sgio::blk_getsize64(fd, &mut bytes) }
        .map_err(|e| Error::os("BLKGETSIZE64", e))?;
    if ssz <= 0 {
        return Err(Error::Other("block device reports zero sector size".to_string()));
    }
    Ok(((bytes / ssz as u64) as i64, ssz as u32))
}

/// SYNCHRONIZE CACHE(10), retried once on Unit Attention.
pub fn sync_cache(fd: RawFd, label: &str) {
    let cdb = crate::cdb::synchronize_cache_10();
    let mut cat = simple_pt(fd, &cdb, None);
    if cat == Category::UnitAttention {
        log::warn!("Unit attention({}), continuing", label);
        cat = simple_pt(fd, &cdb, None);
    }
    if cat != Category::Clean && cat != Category::ConditionMet {
        log::warn!("Unable to synchronize cache ({})", label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_null_aliases() {
        assert_eq!(classify(".").0, FileType::DevNull);
        assert_eq!(classify("/dev/null").0, FileType::DevNull);
        assert_eq!(classify("/dev/zero").0, FileType::DevNull);
    }

    #[test]
    fn classify_regular_reports_size() {
        let path = format!("/tmp/sgcopy_classify_{}", std::process::id());
        std::fs::write(&path, vec![0u8; 2048]).unwrap();
        let (t, sz) = classify(&path);
        assert_eq!(t, FileType::Regular);
        assert_eq!(sz, 2048);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn classify_missing_is_error() {
        assert_eq!(classify("/no/such/path/sgcopy").0, FileType::Error);
    }
}
