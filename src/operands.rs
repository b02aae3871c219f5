//! dd-style `key=value` operand parsing and cross-operand validation.

use parse_size::Config as SizeConfig;

use crate::endpoint::FileType;
use crate::error::{Error, Result};
use crate::flags;
use crate::state::{
    DEF_BLOCKS_PER_2048_TRANSFER, DEF_BLOCK_SIZE, MAX_BPT_VALUE, MAX_COUNT_SKIP_SEEK,
    MAX_NUM_THREADS,
};
use crate::sgio::DEF_TIMEOUT_MS;
use crate::CopyConfig;

/// Parse an unsigned numeric operand: hex with a `0x` prefix or `h`
/// suffix, otherwise decimal with binary unit suffixes (`k` = 1024).
pub fn get_num(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Syntax("empty numeric operand".to_string()));
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16)
            .map_err(|_| Error::Syntax(format!("bad hex number: {}", s)));
    }
    if let Some(hex) = s.strip_suffix(['h', 'H']) {
        if hex.chars().all(|c| c.is_ascii_hexdigit()) && !hex.is_empty() {
            return u64::from_str_radix(hex, 16)
                .map_err(|_| Error::Syntax(format!("bad hex number: {}", s)));
        }
    }
    SizeConfig::new()
        .with_binary()
        .parse_size(s)
        .map_err(|e| Error::Syntax(format!("bad number '{}': {}", s, e)))
}

fn get_signed(s: &str) -> Result<i64> {
    if let Some(rest) = s.trim().strip_prefix('-') {
        let v = get_num(rest)?;
        Ok(-(v as i64))
    } else {
        let v = get_num(s)?;
        if v > i64::MAX as u64 {
            return Err(Error::Syntax(format!("number too large: {}", s)));
        }
        Ok(v as i64)
    }
}

fn set_once(slot: &mut Option<String>, key: &str, value: &str) -> Result<()> {
    if slot.is_some() {
        return Err(Error::Syntax(format!("second '{}=' argument", key)));
    }
    *slot = Some(value.to_string());
    Ok(())
}

/// Parse the free-form operand list into a `CopyConfig`. Option-style
/// settings (`--verify`, `-v`, ...) arrive separately from the CLI
/// layer; `validate` runs afterwards on the merged result.
pub fn parse_operands(operands: &[String]) -> Result<CopyConfig> {
    let mut cfg = CopyConfig::default();
    let mut ibs: u32 = 0;
    let mut obs: u32 = 0;

    for op in operands {
        let (key, value) = match op.split_once('=') {
            Some((k, v)) => (k, v),
            None => {
                return Err(Error::Syntax(format!(
                    "unrecognized operand '{}', expected key=value (try '--help')",
                    op
                )));
            }
        };
        match key {
            "ae" => {
                let (a, m) = match value.split_once(',') {
                    Some((a, m)) => (a, Some(m)),
                    None => (value, None),
                };
                cfg.aen = get_num(a)? as u32;
                cfg.aen_given = true;
                if let Some(m) = m {
                    cfg.m_aen = get_num(m)? as u32;
                    cfg.m_aen_given = true;
                }
            }
            "bpt" => {
                let n = get_num(value)?;
                if n == 0 || n > MAX_BPT_VALUE {
                    return Err(Error::Syntax("bad argument to 'bpt='".to_string()));
                }
                cfg.bpt = n as u32;
                cfg.bpt_given = true;
            }
            "bs" => {
                let n = get_num(value)?;
                if n > MAX_BPT_VALUE {
                    return Err(Error::Syntax("bad argument to 'bs='".to_string()));
                }
                cfg.bs = n as u32;
            }
            "cdbsz" => {
                let n = get_num(value)? as usize;
                if !matches!(n, 6 | 10 | 12 | 16) {
                    return Err(Error::Syntax(
                        "'cdbsz' expects 6, 10, 12 or 16".to_string(),
                    ));
                }
                cfg.cdbsz_in = n;
                cfg.cdbsz_out = n;
                cfg.cdbsz_given = true;
            }
            "coe" => {
                let on = get_num(value)? != 0;
                cfg.in_flags.coe = on;
                cfg.out_flags.coe = on;
            }
            "conv" => flags::parse_conv(value, &mut cfg.in_flags, &mut cfg.out_flags)?,
            "count" => {
                if value != "-1" {
                    let n = get_signed(value)?;
                    if n < 0 || n as u64 > MAX_COUNT_SKIP_SEEK {
                        return Err(Error::Syntax("bad argument to 'count='".to_string()));
                    }
                    cfg.count = Some(n);
                } // count=-1 means derive from capacity, same as absent
            }
            "dio" => {
                let on = get_num(value)? != 0;
                cfg.in_flags.dio = on;
                cfg.out_flags.dio = on;
            }
            "elemsz_kb" => {
                let n = get_num(value)?;
                if n < 1 {
                    return Err(Error::Syntax(
                        "elemsz_kb=EKB wants an integer > 0".to_string(),
                    ));
                }
                if n & (n - 1) != 0 {
                    return Err(Error::Syntax(
                        "elemsz_kb=EKB wants EKB to be power of 2".to_string(),
                    ));
                }
                cfg.elem_sz = (n * 1024) as u32;
            }
            "fail_mask" | "fail-mask" => {
                cfg.fail_mask = get_num(value)? as u32;
            }
            "fua" => {
                let n = get_num(value)?;
                if n & 1 != 0 {
                    cfg.out_flags.fua = true;
                }
                if n & 2 != 0 {
                    cfg.in_flags.fua = true;
                }
            }
            "ibs" => {
                let n = get_num(value)?;
                if n > MAX_BPT_VALUE {
                    return Err(Error::Syntax("bad argument to 'ibs='".to_string()));
                }
                ibs = n as u32;
            }
            "if" => set_once(&mut cfg.ifname, "if", value)?,
            "iflag" => flags::parse_flag_list(value, &mut cfg.in_flags)?,
            "mrq" => {
                let mut rest = value;
                match rest.chars().next() {
                    Some(c) if c.is_ascii_digit() => {}
                    Some('I') | Some('i') => {
                        cfg.is_mrq_i = true;
                        rest = rest
                            .split_once(',')
                            .ok_or_else(|| {
                                Error::Syntax("only mrq=I,NRQS or mrq=O,NRQS allowed".to_string())
                            })?
                            .1;
                    }
                    Some('O') | Some('o') => {
                        cfg.is_mrq_o = true;
                        rest = rest
                            .split_once(',')
                            .ok_or_else(|| {
                                Error::Syntax("only mrq=I,NRQS or mrq=O,NRQS allowed".to_string())
                            })?
                            .1;
                    }
                    _ => {
                        return Err(Error::Syntax("bad argument to 'mrq='".to_string()));
                    }
                }
                let (nrqs, tail) = match rest.split_once(',') {
                    Some((n, t)) => (n, Some(t)),
                    None => (rest, None),
                };
                cfg.nmrqs = get_num(nrqs)? as u32;
                if let Some(t) = tail {
                    if t.eq_ignore_ascii_case("c") {
                        cfg.mrq_cmds = true;
                    } else {
                        return Err(Error::Syntax("bad argument to 'mrq='".to_string()));
                    }
                }
            }
            "noshare" => cfg.noshare = get_num(value)? != 0,
            "obs" => {
                let n = get_num(value)?;
                if n > MAX_BPT_VALUE {
                    return Err(Error::Syntax("bad argument to 'obs='".to_string()));
                }
                obs = n as u32;
            }
            "of" => {
                set_once(&mut cfg.ofname, "of", value)?;
            }
            "of2" => {
                if cfg.of2name.is_some() {
                    return Err(Error::Contradict("second OFILE2 argument".to_string()));
                }
                cfg.of2name = Some(value.to_string());
            }
            "ofreg" => {
                if cfg.ofregname.is_some() {
                    return Err(Error::Contradict("second OFREG argument".to_string()));
                }
                cfg.ofregname = Some(value.to_string());
            }
            "ofsplit" => cfg.ofsplit = get_num(value)? as u32,
            "oflag" => flags::parse_flag_list(value, &mut cfg.out_flags)?,
            "sdt" => {
                let (crt, ict) = match value.split_once(',') {
                    Some((c, i)) => (c, Some(i)),
                    None => (value, None),
                };
                cfg.sdt_crt_sec = get_num(crt)? as u32;
                if let Some(i) = ict {
                    cfg.sdt_ict_ms = get_num(i)? as u32;
                }
            }
            "seek" => {
                let n = get_signed(value)?;
                if n < 0 || n as u64 > MAX_COUNT_SKIP_SEEK {
                    return Err(Error::Syntax("bad argument to 'seek='".to_string()));
                }
                cfg.seek = n;
            }
            "skip" => {
                let n = get_signed(value)?;
                if n < 0 || n as u64 > MAX_COUNT_SKIP_SEEK {
                    return Err(Error::Syntax("bad argument to 'skip='".to_string()));
                }
                cfg.skip = n;
            }
            "sync" => cfg.do_sync = get_num(value)? != 0,
            "thr" => cfg.num_threads = get_num(value)? as usize,
            "time" => {
                let (t, to) = match value.split_once(',') {
                    Some((t, to)) => (t, Some(to)),
                    None => (value, None),
                };
                cfg.do_time = get_num(t)? as u8;
                if let Some(to) = to {
                    let n = get_num(to)? as u32;
                    cfg.cmd_timeout_ms = if n != 0 { n * 1000 } else { DEF_TIMEOUT_MS };
                }
            }
            "unshare" => cfg.unshare = get_num(value)? != 0,
            k if k.starts_with("verb") => cfg.verbose = get_num(value)? as u8,
            _ => {
                return Err(Error::Syntax(format!(
                    "unrecognized operand '{}' (try '--help')",
                    key
                )));
            }
        }
    }

    if (ibs != 0 && ibs != effective_bs(&cfg)) || (obs != 0 && obs != effective_bs(&cfg)) {
        return Err(Error::Syntax(
            "if 'ibs' or 'obs' given must be same as 'bs'".to_string(),
        ));
    }
    Ok(cfg)
}

fn effective_bs(cfg: &CopyConfig) -> u32 {
    if cfg.bs > 0 {
        cfg.bs
    } else {
        DEF_BLOCK_SIZE
    }
}

/// Cross-operand checks and defaulting, run after the CLI options have
/// been merged in.
pub fn validate(cfg: &mut CopyConfig) -> Result<()> {
    if cfg.bs == 0 {
        cfg.bs = DEF_BLOCK_SIZE;
        log::info!(
            "Assume default 'bs' ((logical) block size) of {} bytes",
            cfg.bs
        );
    }
    if cfg.verify {
        log::info!("Doing verify/cmp rather than copy");
    }
    if cfg.out_flags.append {
        if cfg.seek > 0 {
            return Err(Error::Contradict(
                "can't use both append and seek switches".to_string(),
            ));
        }
        if cfg.verify {
            return Err(Error::Contradict(
                "can't use both append and verify switches".to_string(),
            ));
        }
    }
    if cfg.bpt < 1 {
        return Err(Error::Syntax("bpt must be greater than 0".to_string()));
    }
    if cfg.in_flags.mmap > 0 && cfg.out_flags.mmap > 0 {
        return Err(Error::Syntax(
            "mmap flag on both IFILE and OFILE doesn't work".to_string(),
        ));
    }
    if !cfg.noshare && (cfg.in_flags.noshare || cfg.out_flags.noshare) {
        cfg.noshare = true;
    }
    if cfg.unshare && (cfg.in_flags.no_unshare || cfg.out_flags.no_unshare) {
        cfg.unshare = false;
    }
    if cfg.out_flags.mmap > 0 && !cfg.noshare {
        return Err(Error::Syntax("oflag=mmap needs noshare=1".to_string()));
    }
    if (cfg.in_flags.mmap > 0 || cfg.out_flags.mmap > 0)
        && (cfg.in_flags.same_fds || cfg.out_flags.same_fds)
    {
        return Err(Error::Syntax(
            "can't have both 'mmap' and 'same_fds' flags".to_string(),
        ));
    }
    if !cfg.noshare && (cfg.in_flags.dio || cfg.out_flags.dio) {
        return Err(Error::Syntax(
            "dio flag can only be used with noshare=1".to_string(),
        ));
    }
    if cfg.nmrqs > 0 && (cfg.in_flags.mrq_immed || cfg.out_flags.mrq_immed) {
        cfg.mrq_async = true;
    }
    // 128 * 2048 byte transfers overrun the block layer for CD/DVD
    // class devices, so trim the default there
    if cfg.bs >= 2048 && !cfg.bpt_given {
        cfg.bpt = DEF_BLOCKS_PER_2048_TRANSFER;
    }
    if cfg.ofsplit > 0 && cfg.ofsplit >= cfg.bpt {
        return Err(Error::Syntax(
            "ofsplit when given must be less than BPT".to_string(),
        ));
    }
    if cfg.num_threads < 1 || cfg.num_threads > MAX_NUM_THREADS {
        return Err(Error::Syntax(
            "too few or too many threads requested".to_string(),
        ));
    }
    if cfg.in_flags.swait || cfg.out_flags.swait {
        if cfg.verbose > 0 {
            log::info!("the 'swait' flag is now ignored");
        }
    }
    if cfg.in_flags.is_synthetic() && cfg.ifname.is_some() {
        return Err(Error::Contradict(format!(
            "iflag synthetic pattern and if={} contradict",
            cfg.ifname.as_deref().unwrap_or("")
        )));
    }
    cfg.unit_nanosec = cfg.do_time > 1 || std::env::var_os("SG3_UTILS_LINUX_NANO").is_some();
    Ok(())
}

/// Checks that need both endpoint types resolved (run after
/// classification): mrq balance massaging, v3/v4 reconciliation and
/// the async-with-sharing rejection.
pub fn reconcile_types(cfg: &mut CopyConfig) -> Result<()> {
    let in_sg = cfg.in_type == FileType::Sg;
    let out_sg = cfg.out_type == FileType::Sg;

    if (cfg.in_flags.v3 || cfg.in_flags.v4_given) && !in_sg {
        cfg.in_flags.v3 = false;
        cfg.in_flags.v4 = false;
        log::info!("iflag= v3 and v4 both ignored when IFILE is not sg device");
    }
    if (cfg.out_flags.v3 || cfg.out_flags.v4_given) && !out_sg {
        cfg.out_flags.v3 = false;
        cfg.out_flags.v4 = false;
        log::info!("oflag= v3 and v4 both ignored when OFILE is not sg device");
    }

    if in_sg && out_sg {
        if cfg.nmrqs > 0 {
            if cfg.is_mrq_i == cfg.is_mrq_o {
                if cfg.ofsplit > 0 {
                    if cfg.nmrqs % 3 != 0 {
                        log::warn!(
                            "when both IFILE+OFILE sg devices and OSP>0, mrq=NRQS must be divisible by 3; tripling NRQS"
                        );
                        cfg.nmrqs *= 3;
                    }
                } else if cfg.nmrqs % 2 != 0 {
                    log::warn!(
                        "when both IFILE+OFILE sg devices (and OSP=0), mrq=NRQS must be even; doubling NRQS"
                    );
                    cfg.nmrqs *= 2;
                }
            } else {
                cfg.unbalanced_mrq = true;
            }
        }
        if cfg.in_flags.v4_given && !cfg.out_flags.v3 && !cfg.out_flags.v4_given {
            cfg.out_flags.v4 = true;
            if cfg.verbose > 0 {
                log::info!("changing OFILE from v3 to v4, use oflag=v3 to force v3");
            }
        }
        if cfg.out_flags.v4_given && !cfg.in_flags.v3 && !cfg.in_flags.v4_given {
            cfg.in_flags.v4 = true;
            if cfg.verbose > 0 {
                log::info!("changing IFILE from v3 to v4, use iflag=v3 to force v3");
            }
        }
        if cfg.mrq_async && !cfg.noshare {
            return Err(Error::Contradict(
                "mrq_immed on an sg->sg copy also needs noshare=1".to_string(),
            ));
        }
    } else if (in_sg || out_sg) && cfg.nmrqs > 0 {
        cfg.unbalanced_mrq = true;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(ops: &[&str]) -> Result<CopyConfig> {
        let v: Vec<String> = ops.iter().map(|s| s.to_string()).collect();
        parse_operands(&v)
    }

    #[test]
    fn numbers_with_suffixes() {
        assert_eq!(get_num("512").unwrap(), 512);
        assert_eq!(get_num("4k").unwrap(), 4096);
        assert_eq!(get_num("0x200").unwrap(), 0x200);
        assert_eq!(get_num("200h").unwrap(), 0x200);
        assert!(get_num("twelve").is_err());
    }

    #[test]
    fn basic_operands() {
        let cfg = parse(&[
            "bs=512",
            "bpt=64",
            "count=1000",
            "if=/tmp/a",
            "of=/tmp/b",
            "skip=8",
            "seek=16",
            "thr=7",
        ])
        .unwrap();
        assert_eq!(cfg.bs, 512);
        assert_eq!(cfg.bpt, 64);
        assert_eq!(cfg.count, Some(1000));
        assert_eq!(cfg.skip, 8);
        assert_eq!(cfg.seek, 16);
        assert_eq!(cfg.num_threads, 7);
        assert_eq!(cfg.ifname.as_deref(), Some("/tmp/a"));
        assert_eq!(cfg.ofname.as_deref(), Some("/tmp/b"));
    }

    #[test]
    fn count_minus_one_means_derive() {
        let cfg = parse(&["count=-1"]).unwrap();
        assert_eq!(cfg.count, None);
    }

    #[test]
    fn duplicate_if_rejected() {
        assert!(parse(&["if=/tmp/a", "if=/tmp/b"]).is_err());
    }

    #[test]
    fn mrq_forms() {
        let cfg = parse(&["mrq=16"]).unwrap();
        assert_eq!(cfg.nmrqs, 16);
        assert!(!cfg.mrq_cmds);

        let cfg = parse(&["mrq=20,C"]).unwrap();
        assert_eq!(cfg.nmrqs, 20);
        assert!(cfg.mrq_cmds);

        let cfg = parse(&["mrq=I,12"]).unwrap();
        assert!(cfg.is_mrq_i);
        assert_eq!(cfg.nmrqs, 12);

        let cfg = parse(&["mrq=O,12,C"]).unwrap();
        assert!(cfg.is_mrq_o);
        assert!(cfg.mrq_cmds);

        assert!(parse(&["mrq=X,12"]).is_err());
    }

    #[test]
    fn fua_bits_split_per_side() {
        let cfg = parse(&["fua=3"]).unwrap();
        assert!(cfg.in_flags.fua && cfg.out_flags.fua);
        let cfg = parse(&["fua=1"]).unwrap();
        assert!(!cfg.in_flags.fua && cfg.out_flags.fua);
        let cfg = parse(&["fua=2"]).unwrap();
        assert!(cfg.in_flags.fua && !cfg.out_flags.fua);
    }

    #[test]
    fn ibs_obs_must_match_bs() {
        assert!(parse(&["bs=512", "ibs=1024"]).is_err());
        assert!(parse(&["bs=512", "obs=512"]).is_ok());
    }

    #[test]
    fn sdt_and_ae_and_time() {
        let cfg = parse(&["sdt=5,200", "ae=10,4", "time=2,30"]).unwrap();
        assert_eq!(cfg.sdt_crt_sec, 5);
        assert_eq!(cfg.sdt_ict_ms, 200);
        assert_eq!(cfg.aen, 10);
        assert_eq!(cfg.m_aen, 4);
        assert!(cfg.aen_given && cfg.m_aen_given);
        assert_eq!(cfg.do_time, 2);
        assert_eq!(cfg.cmd_timeout_ms, 30_000);
    }

    #[test]
    fn validate_defaults_bs_and_large_bs_bpt() {
        let mut cfg = parse(&[]).unwrap();
        validate(&mut cfg).unwrap();
        assert_eq!(cfg.bs, DEF_BLOCK_SIZE);
        assert_eq!(cfg.bpt, 128);

        let mut cfg = parse(&["bs=2048"]).unwrap();
        validate(&mut cfg).unwrap();
        assert_eq!(cfg.bpt, DEF_BLOCKS_PER_2048_TRANSFER);

        // explicit bpt wins over the large-bs default
        let mut cfg = parse(&["bs=2048", "bpt=100"]).unwrap();
        validate(&mut cfg).unwrap();
        assert_eq!(cfg.bpt, 100);
    }

    #[test]
    fn validate_contradictions() {
        let mut cfg = parse(&["oflag=append", "seek=4"]).unwrap();
        assert!(validate(&mut cfg).is_err());

        let mut cfg = parse(&["iflag=00", "if=/tmp/x"]).unwrap();
        assert!(validate(&mut cfg).is_err());

        let mut cfg = parse(&["iflag=dio"]).unwrap();
        assert!(validate(&mut cfg).is_err()); // dio without noshare=1

        let mut cfg = parse(&["iflag=dio", "noshare=1"]).unwrap();
        assert!(validate(&mut cfg).is_ok());

        let mut cfg = parse(&["ofsplit=200", "bpt=128"]).unwrap();
        assert!(validate(&mut cfg).is_err());

        let mut cfg = parse(&["thr=0"]).unwrap();
        assert!(validate(&mut cfg).is_err());
    }

    #[test]
    fn side_flag_noshare_promotes_global() {
        let mut cfg = parse(&["iflag=noshare"]).unwrap();
        validate(&mut cfg).unwrap();
        assert!(cfg.noshare);
    }

    #[test]
    fn mrq_async_with_share_rejected_on_sg_to_sg() {
        let mut cfg = parse(&["mrq=8", "iflag=mrq_immed"]).unwrap();
        validate(&mut cfg).unwrap();
        assert!(cfg.mrq_async);
        cfg.in_type = FileType::Sg;
        cfg.out_type = FileType::Sg;
        assert!(reconcile_types(&mut cfg).is_err());

        let mut cfg = parse(&["mrq=8", "iflag=mrq_immed", "noshare=1"]).unwrap();
        validate(&mut cfg).unwrap();
        cfg.in_type = FileType::Sg;
        cfg.out_type = FileType::Sg;
        assert!(reconcile_types(&mut cfg).is_ok());
    }

    #[test]
    fn mrq_count_massaging() {
        let mut cfg = parse(&["mrq=5"]).unwrap();
        cfg.in_type = FileType::Sg;
        cfg.out_type = FileType::Sg;
        reconcile_types(&mut cfg).unwrap();
        assert_eq!(cfg.nmrqs, 10); // doubled to even

        let mut cfg = parse(&["mrq=4", "ofsplit=2", "bpt=8"]).unwrap();
        cfg.in_type = FileType::Sg;
        cfg.out_type = FileType::Sg;
        reconcile_types(&mut cfg).unwrap();
        assert_eq!(cfg.nmrqs, 12); // tripled for the split

        let mut cfg = parse(&["mrq=I,6"]).unwrap();
        cfg.in_type = FileType::Sg;
        cfg.out_type = FileType::Sg;
        reconcile_types(&mut cfg).unwrap();
        assert!(cfg.unbalanced_mrq);
    }
}
