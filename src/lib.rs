//! A multithreaded block copy (and verify) engine for Linux SCSI
//! generic ("sg") devices.
//!
//! `sgcopy` copies a range of fixed-size logical blocks between two
//! endpoints. Either endpoint may be an sg character device, a block
//! device, a regular file, a pipe, the null sink, or (input only) a
//! synthetic pattern source. When both endpoints are sg devices the
//! engine uses the driver's request-sharing facility, so the write
//! side transmits straight from the kernel buffer the read side
//! filled, and can batch commands into multi-request (MRQ) groups.
//!
//! # Features
//!
//! - **Worker pool**: the copy is sliced into `bpt`-block segments
//!   handed to up to 1024 threads, with writes to the primary target
//!   forced into ascending LBA order
//! - **sg v3 and v4 pass-through**: per side selection, automatic CDB
//!   size escalation, FUA/DPO, VERIFY with BYTCHK, PRE-FETCH
//! - **Request sharing**: no user-space copy on sg->sg transfers,
//!   including a mid-segment swap to a secondary output device
//! - **MRQ batching**: ordered blocking, variable blocking and fully
//!   non-blocking submission of command batches
//! - **Stall detection**: a signal-listening thread watches pack-id
//!   progress and captures the driver's debug state on a stall
//!
//! # Quick start
//!
//! ```no_run
//! use sgcopy::operands;
//!
//! let ops: Vec<String> = ["if=/dev/sg1", "of=/dev/sg2", "bs=512", "thr=4"]
//!     .iter()
//!     .map(|s| s.to_string())
//!     .collect();
//! let mut cfg = operands::parse_operands(&ops).expect("bad operands");
//! operands::validate(&mut cfg).expect("bad combination");
//! let status = sgcopy::run(cfg).expect("copy failed");
//! std::process::exit(status);
//! ```
//!
//! The binary front end exposes the usual `dd`-style surface:
//!
//! ```text
//! sgcopy if=/dev/sg1 of=/dev/sg2 bs=512 bpt=128 thr=4 mrq=16
//! ```
//!
//! # Requirements
//!
//! - Linux with the sg driver; sharing, MRQ and swap-share need
//!   sg driver 4.0.45 or later (older drivers fall back to plain
//!   buffered copying)

use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub mod cdb;
pub mod endpoint;
pub mod error;
pub mod flags;
pub mod mrq;
pub mod operands;
pub mod pattern;
pub mod pt;
pub mod sgio;
pub mod share;
pub mod signals;
pub mod state;
pub mod stats;
pub mod worker;

pub use error::{Category, Error, Result};
pub use flags::SideFlags;

use endpoint::FileType;
use state::{Shared, DEF_NUM_THREADS, DEF_SCSI_CDBSZ, DEF_SDT_CRT_SEC, DEF_SDT_ICT_MS};
use worker::GlobalFds;

const SG_ALLOW_DIO: &str = "/sys/module/sg/parameters/allow_dio";

/// Everything the engine needs to run one copy, assembled from the
/// operand list and the CLI options. Immutable once `run` starts the
/// worker pool.
#[derive(Debug, Clone)]
pub struct CopyConfig {
    pub bs: u32,
    pub bpt: u32,
    pub bpt_given: bool,
    /// `None` derives the count from the endpoint capacities.
    pub count: Option<i64>,
    pub skip: i64,
    pub seek: i64,
    pub ifname: Option<String>,
    pub ofname: Option<String>,
    pub of2name: Option<String>,
    pub ofregname: Option<String>,
    pub in_flags: SideFlags,
    pub out_flags: SideFlags,
    pub in_type: FileType,
    pub out_type: FileType,
    pub out2_type: FileType,
    pub outreg_type: FileType,
    pub in_st_size: i64,
    pub out_st_size: i64,
    pub cdbsz_in: usize,
    pub cdbsz_out: usize,
    pub cdbsz_given: bool,
    pub nmrqs: u32,
    pub mrq_cmds: bool,
    pub is_mrq_i: bool,
    pub is_mrq_o: bool,
    pub mrq_async: bool,
    pub unbalanced_mrq: bool,
    pub aen: u32,
    pub m_aen: u32,
    pub aen_given: bool,
    pub m_aen_given: bool,
    pub ofsplit: u32,
    pub sdt_ict_ms: u32,
    pub sdt_crt_sec: u32,
    pub cmd_timeout_ms: u32,
    pub elem_sz: u32,
    pub fail_mask: u32,
    pub num_threads: usize,
    pub do_time: u8,
    pub do_sync: bool,
    pub verbose: u8,
    pub dry_run: u8,
    pub chkaddr: u8,
    pub verify: bool,
    pub prefetch: bool,
    pub noshare: bool,
    pub unshare: bool,
    pub unit_nanosec: bool,
    pub json_stats: bool,
    pub ofile_given: bool,
    pub ofile2_given: bool,
    pub sg_version: i32,
    pub sg_version_ge_40045: bool,
}

impl Default for CopyConfig {
    fn default() -> Self {
        CopyConfig {
            bs: 0,
            bpt: state::DEF_BLOCKS_PER_TRANSFER,
            bpt_given: false,
            count: None,
            skip: 0,
            seek: 0,
            ifname: None,
            ofname: None,
            of2name: None,
            ofregname: None,
            in_flags: SideFlags::default(),
            out_flags: SideFlags::default(),
            in_type: FileType::Regular,
            // dd's default differs: with no of=OFILE assume the null sink
            out_type: FileType::DevNull,
            out2_type: FileType::DevNull,
            outreg_type: FileType::DevNull,
            in_st_size: 0,
            out_st_size: 0,
            cdbsz_in: DEF_SCSI_CDBSZ,
            cdbsz_out: DEF_SCSI_CDBSZ,
            cdbsz_given: false,
            nmrqs: 0,
            mrq_cmds: false,
            is_mrq_i: false,
            is_mrq_o: false,
            mrq_async: false,
            unbalanced_mrq: false,
            aen: 0,
            m_aen: 0,
            aen_given: false,
            m_aen_given: false,
            ofsplit: 0,
            sdt_ict_ms: DEF_SDT_ICT_MS,
            sdt_crt_sec: DEF_SDT_CRT_SEC,
            cmd_timeout_ms: sgio::DEF_TIMEOUT_MS,
            elem_sz: 0,
            fail_mask: 0,
            num_threads: DEF_NUM_THREADS,
            do_time: 1,
            do_sync: false,
            verbose: 0,
            dry_run: 0,
            chkaddr: 0,
            verify: false,
            prefetch: false,
            noshare: false,
            unshare: true,
            unit_nanosec: false,
            json_stats: false,
            ofile_given: false,
            ofile2_given: false,
            sg_version: 0,
            sg_version_ge_40045: false,
        }
    }
}

struct OpenEndpoints {
    infd: RawFd,
    outfd: RawFd,
    out2fd: RawFd,
    outregfd: RawFd,
}

fn open_input(cfg: &mut CopyConfig) -> Result<RawFd> {
    if let Some(kind) = pattern::SyntheticKind::from_flags(&cfg.in_flags) {
        cfg.in_type = FileType::Synthetic;
        cfg.ifname = Some(kind.label().to_string());
        return Ok(-1);
    }
    let path = match cfg.ifname.as_deref() {
        None | Some("-") => {
            cfg.in_type = FileType::Regular;
            return Ok(libc::STDIN_FILENO);
        }
        Some(p) => p.to_string(),
    };
    let (ftype, st_size) = endpoint::classify(&path);
    cfg.in_type = ftype;
    cfg.in_st_size = st_size;
    match ftype {
        FileType::Error => Err(Error::file(path.as_str(), "unable to access")),
        FileType::Tape => Err(Error::file(path.as_str(), "unable to use scsi tape device")),
        FileType::CharOther => Err(Error::file(path.as_str(), "unable to use unknown char device")),
        FileType::Sg => {
            let h = endpoint::open_sg(&path, &cfg.in_flags, cfg, false)?;
            if cfg.verbose > 2 {
                log::debug!(
                    "using sg v{} interface on {}",
                    if cfg.in_flags.v4 { '4' } else { '3' },
                    path
                );
            }
            Ok(h.fd)
        }
        _ => endpoint::open_plain_input(&path, cfg),
    }
}

fn open_output(cfg: &mut CopyConfig) -> Result<RawFd> {
    let path = match cfg.ofname.as_deref() {
        None => return Ok(-1), // null sink
        Some("-") => {
            cfg.out_type = FileType::Regular;
            return Ok(libc::STDOUT_FILENO);
        }
        Some(p) => p.to_string(),
    };
    let (ftype, st_size) = endpoint::classify(&path);
    cfg.out_type = ftype;
    cfg.out_st_size = st_size;
    if cfg.verify && ftype != FileType::Sg {
        return Err(Error::file(path.as_str(), "--verify only supported by sg OFILEs"));
    }
    match ftype {
        FileType::Tape => Err(Error::file(path.as_str(), "unable to use scsi tape device")),
        FileType::CharOther => Err(Error::file(path.as_str(), "unable to use unknown char device")),
        FileType::Sg => {
            let h = endpoint::open_sg(&path, &cfg.out_flags, cfg, false)?;
            if cfg.verbose > 2 {
                log::debug!(
                    "using sg v{} interface on {}",
                    if cfg.out_flags.v4 { '4' } else { '3' },
                    path
                );
            }
            Ok(h.fd)
        }
        FileType::DevNull => Ok(-1), // don't bother opening
        _ => {
            // a missing file is created by O_CREAT
            if ftype == FileType::Error {
                cfg.out_type = FileType::Regular;
            }
            endpoint::open_plain_output(&path, &cfg.out_flags, cfg)
        }
    }
}

fn open_output2(cfg: &mut CopyConfig) -> Result<RawFd> {
    let path = match cfg.of2name.as_deref() {
        None => return Ok(-1),
        Some(p) => p.to_string(),
    };
    let (ftype, _) = endpoint::classify(&path);
    cfg.out2_type = ftype;
    match ftype {
        FileType::Tape => Err(Error::file(path.as_str(), "unable to use scsi tape device")),
        FileType::Sg => {
            let h = endpoint::open_sg(&path, &cfg.out_flags, cfg, false)?;
            Ok(h.fd)
        }
        FileType::DevNull => Ok(-1),
        _ => {
            if ftype == FileType::Error {
                cfg.out2_type = FileType::Regular;
            }
            endpoint::open_plain_output(&path, &cfg.out_flags, cfg)
        }
    }
}

fn open_outreg(cfg: &mut CopyConfig) -> Result<RawFd> {
    let path = match cfg.ofregname.as_deref() {
        None => return Ok(-1),
        Some(p) => p.to_string(),
    };
    let (ftype, _) = endpoint::classify(&path);
    cfg.outreg_type = ftype;
    if !matches!(
        ftype,
        FileType::Regular | FileType::Fifo | FileType::Error | FileType::DevNull
    ) {
        return Err(Error::file(
            path.as_str(),
            "can only be regular file or pipe (or /dev/null)",
        ));
    }
    let fd = nix::fcntl::open(
        path.as_str(),
        nix::fcntl::OFlag::O_WRONLY | nix::fcntl::OFlag::O_CREAT,
        nix::sys::stat::Mode::from_bits_truncate(0o666),
    )
    .map_err(|e| Error::file(path.as_str(), format!("could not open for writing: {}", e)))?;
    if cfg.verbose > 1 {
        log::debug!("ofreg={} opened okay, fd={}", path, fd);
    }
    if cfg.outreg_type == FileType::Error {
        cfg.outreg_type = FileType::Regular; // regular file created
    }
    Ok(fd)
}

fn probe_side_capacity(
    cfg: &CopyConfig,
    fd: RawFd,
    ftype: FileType,
    st_size: i64,
    name: &str,
) -> Result<i64> {
    let mut num_sect: i64 = -1;
    match ftype {
        FileType::Sg => {
            let mut res = endpoint::scsi_read_capacity(fd);
            if res == Err(Category::UnitAttention) {
                log::warn!("Unit attention, media changed({}), continuing", name);
                res = endpoint::scsi_read_capacity(fd);
            }
            match res {
                Ok((num, sect_sz)) => {
                    if cfg.bs != sect_sz {
                        return Err(Error::file(
                            name,
                            format!(
                                "logical block size confusion: bs={}, device claims={}",
                                cfg.bs, sect_sz
                            ),
                        ));
                    }
                    num_sect = num;
                }
                Err(Category::InvalidOp) => {
                    return Err(Error::file(name, "read capacity not supported"));
                }
                Err(Category::NotReady) => {
                    return Err(Error::file(name, "read capacity failed, not ready"));
                }
                Err(_) => {
                    return Err(Error::file(name, "unable to read capacity"));
                }
            }
        }
        FileType::Block => match endpoint::read_blkdev_capacity(fd) {
            Ok((num, sect_sz)) => {
                if cfg.bs != sect_sz {
                    log::warn!(
                        "logical block size on {} confusion: bs={}, from device={}",
                        name,
                        cfg.bs,
                        sect_sz
                    );
                } else {
                    num_sect = num;
                }
            }
            Err(e) => {
                log::warn!("unable to read block capacity on {}: {}", name, e);
            }
        },
        FileType::Regular => {
            num_sect = st_size / i64::from(cfg.bs);
            if st_size % i64::from(cfg.bs) != 0 {
                num_sect += 1;
                log::warn!(
                    "the file size of {} is not a multiple of BS [{}]",
                    name,
                    cfg.bs
                );
            }
        }
        _ => {}
    }
    Ok(num_sect)
}

fn derive_count(cfg: &CopyConfig, eps: &OpenEndpoints) -> Result<i64> {
    if let Some(n) = cfg.count {
        return Ok(n);
    }
    let mut in_num_sect = probe_side_capacity(
        cfg,
        eps.infd,
        cfg.in_type,
        cfg.in_st_size,
        cfg.ifname.as_deref().unwrap_or("(stdin)"),
    )?;
    if in_num_sect > cfg.skip {
        in_num_sect -= cfg.skip;
    }
    let mut out_num_sect = probe_side_capacity(
        cfg,
        eps.outfd,
        cfg.out_type,
        cfg.out_st_size,
        cfg.ofname.as_deref().unwrap_or("(none)"),
    )?;
    if out_num_sect > cfg.seek {
        out_num_sect -= cfg.seek;
    }
    let dd_count = if in_num_sect > 0 {
        if out_num_sect > 0 {
            in_num_sect.min(out_num_sect)
        } else {
            in_num_sect
        }
    } else {
        out_num_sect
    };
    if cfg.verbose > 2 {
        log::debug!(
            "Start of loop, count={}, in_num_sect={}, out_num_sect={}",
            dd_count,
            in_num_sect,
            out_num_sect
        );
    }
    if dd_count < 0 {
        return Err(Error::Other(
            "couldn't calculate count, please give one".to_string(),
        ));
    }
    Ok(dd_count)
}

/// Larger command or LBA spaces need the 16 byte CDB variants; upgrade
/// silently configured sides (an explicit `cdbsz=` is respected).
fn upgrade_cdb_sizes(cfg: &mut CopyConfig, dd_count: i64) {
    if cfg.cdbsz_given {
        return;
    }
    let max16 = sgio::MAX_SCSI_CDBSZ;
    if cfg.in_type == FileType::Sg
        && cfg.cdbsz_in != max16
        && ((dd_count + cfg.skip) as u64 > u64::from(u32::MAX) || cfg.bpt > u32::from(u16::MAX))
    {
        log::info!("Note: SCSI command size increased to 16 bytes (for 'if')");
        cfg.cdbsz_in = max16;
    }
    if cfg.out_type == FileType::Sg
        && cfg.cdbsz_out != max16
        && ((dd_count + cfg.seek) as u64 > u64::from(u32::MAX) || cfg.bpt > u32::from(u16::MAX))
    {
        log::info!("Note: SCSI command size increased to 16 bytes (for 'of')");
        cfg.cdbsz_out = max16;
    }
}

/// Execute the copy described by `cfg`. Returns the process exit code
/// (0 on a clean copy, otherwise the first SCSI category recorded).
pub fn run(mut cfg: CopyConfig) -> Result<i32> {
    cfg.sg_version = endpoint::fetch_sg_version();
    cfg.sg_version_ge_40045 = cfg.sg_version >= sgio::MIN_SHARE_VERSION;
    if cfg.sg_version > sgio::MIN_V4_VERSION {
        if !cfg.in_flags.v3 {
            cfg.in_flags.v4 = true;
        }
        if !cfg.out_flags.v3 {
            cfg.out_flags.v4 = true;
        }
    }

    let infd = open_input(&mut cfg)?;
    if cfg.ofname.is_some() {
        cfg.ofile_given = true;
    }
    if cfg.of2name.is_some() {
        cfg.ofile2_given = true;
    }
    let outfd = open_output(&mut cfg)?;
    let out2fd = open_output2(&mut cfg)?;
    let outregfd = open_outreg(&mut cfg)?;
    let eps = OpenEndpoints {
        infd,
        outfd,
        out2fd,
        outregfd,
    };

    if infd == libc::STDIN_FILENO && !cfg.ofile_given {
        return Err(Error::Syntax(
            "won't default both IFILE to stdin _and_ OFILE to /dev/null".to_string(),
        ));
    }

    operands::reconcile_types(&mut cfg)?;

    let dd_count = derive_count(&cfg, &eps)?;
    upgrade_cdb_sizes(&mut cfg, dd_count);

    let out_is_null = cfg.out_type == FileType::DevNull;
    let shared = Arc::new(Shared::new(
        dd_count,
        cfg.seek,
        cfg.bs,
        cfg.verify,
        out_is_null,
        cfg.do_time,
    ));

    if cfg.dry_run > 0 {
        log::warn!("Due to --dry-run option, bypass copy/read");
        return finish(&cfg, &shared, &eps);
    }
    if !cfg.ofile_given {
        log::warn!("of=OFILE not given so only read from IFILE, to output to stdout use 'of=-'");
    }

    let (set, orig_mask) = signals::block_signals();
    let cfg = Arc::new(cfg);
    let listener = signals::start(Arc::clone(&cfg), Arc::clone(&shared), set, orig_mask);

    let fds = GlobalFds {
        infd,
        outfd,
        out2fd,
        outregfd,
    };
    if shared.out_rem_count.load(Ordering::SeqCst) > 0 && cfg.num_threads > 0 {
        let mut handles = Vec::with_capacity(cfg.num_threads);
        // run one worker first to shake down infant retryable stuff
        {
            let guard = shared.out_mutex.lock().unwrap();
            let c = Arc::clone(&cfg);
            let s = Arc::clone(&shared);
            let h = std::thread::Builder::new()
                .name("sgcopy-w0".to_string())
                .spawn(move || worker::run_worker(0, c, s, fds))
                .map_err(|e| Error::Other(format!("failed to spawn worker thread: {}", e)))?;
            handles.push(h);
            // wait for any broadcast before unleashing the rest
            let _guard = shared.out_sync_cv.wait(guard).unwrap();
        }
        for id in 1..cfg.num_threads {
            let c = Arc::clone(&cfg);
            let s = Arc::clone(&shared);
            let h = std::thread::Builder::new()
                .name(format!("sgcopy-w{}", id))
                .spawn(move || worker::run_worker(id, c, s, fds))
                .map_err(|e| Error::Other(format!("failed to spawn worker thread: {}", e)))?;
            handles.push(h);
        }
        for (k, h) in handles.into_iter().enumerate() {
            if h.join().is_err() {
                log::error!("worker thread {} panicked", k);
                shared.note_exit_status(Category::Other);
            } else if cfg.verbose > 2 {
                log::debug!("{} <-- worker thread joined", k);
            }
        }
    }

    if cfg.do_time > 0 {
        stats::calc_duration_throughput(false, &shared);
    }

    shared.shutting_down.store(true, Ordering::SeqCst);
    listener.join();

    if cfg.do_sync {
        if cfg.out_type == FileType::Sg {
            log::info!(
                ">> Synchronizing cache on {}",
                cfg.ofname.as_deref().unwrap_or("")
            );
            endpoint::sync_cache(eps.outfd, "out");
        }
        if cfg.out2_type == FileType::Sg {
            log::info!(
                ">> Synchronizing cache on {}",
                cfg.of2name.as_deref().unwrap_or("")
            );
            endpoint::sync_cache(eps.out2fd, "out2");
        }
    }

    finish(&cfg, &shared, &eps)
}

fn finish(cfg: &CopyConfig, shared: &Shared, eps: &OpenEndpoints) -> Result<i32> {
    if eps.infd != libc::STDIN_FILENO && eps.infd >= 0 {
        unsafe { libc::close(eps.infd) };
    }
    if eps.outfd != libc::STDOUT_FILENO && cfg.out_type != FileType::DevNull && eps.outfd >= 0 {
        unsafe { libc::close(eps.outfd) };
    }
    if eps.out2fd >= 0 && cfg.out2_type != FileType::DevNull {
        unsafe { libc::close(eps.out2fd) };
    }
    if eps.outregfd >= 0 {
        unsafe { libc::close(eps.outregfd) };
    }

    let mut res = shared.exit_status();
    let out_count = shared.out_count.load(Ordering::SeqCst);
    if out_count != 0 && cfg.dry_run == 0 {
        log::error!(">>>> Some error occurred, remaining blocks={}", out_count);
        if res == 0 {
            res = Category::Other.exit_code();
        }
    }
    stats::print_stats("", shared);

    let dio_incomplete = shared.dio_incomplete_count.load(Ordering::SeqCst);
    if dio_incomplete > 0 {
        log::warn!(
            ">> Direct IO requested but incomplete {} times",
            dio_incomplete
        );
        if let Ok(s) = std::fs::read_to_string(SG_ALLOW_DIO) {
            if s.trim_start().starts_with('0') {
                log::warn!(
                    ">>> {} set to '0' but should be set to '1' for direct IO",
                    SG_ALLOW_DIO
                );
            }
        }
    }
    let resids = shared.sum_of_resids.load(Ordering::SeqCst);
    if resids != 0 {
        log::warn!(">> Non-zero sum of residual counts={}", resids);
    }
    stats::print_event_counts(shared, cfg.verbose, cfg.aen_given, cfg.m_aen_given);
    if cfg.verbose > 3 {
        log::debug!(
            "Final pack_id={}, mrq_id={}",
            shared.mono_pack_id.load(Ordering::SeqCst),
            shared.mono_mrq_id.load(Ordering::SeqCst)
        );
    }
    if cfg.json_stats {
        let rep = stats::StatsReport::gather(shared);
        println!(
            "{}",
            serde_json::to_string_pretty(&rep)
                .map_err(|e| Error::Other(format!("failed to serialize stats: {}", e)))?
        );
    }
    if cfg.verify && res == Category::Miscompare.exit_code() {
        log::error!("Verify/compare failed due to miscompare");
    }
    Ok(res)
}
