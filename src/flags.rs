//! Per-side request modifier flags and their operand-list parsers.

use crate::error::{Error, Result};

/// Request modifiers attached to one side (input or output) of the
/// copy, populated from `iflag=`/`oflag=` comma-separated lists and a
/// handful of standalone operands.
///
/// All members are booleans except `mmap`, which counts occurrences:
/// 0 off, 1 on, 2 or more means the mapping is left in place on exit.
#[derive(Debug, Default, Clone)]
pub struct SideFlags {
    pub append: bool,
    pub coe: bool,
    pub defres: bool,
    pub dio: bool,
    pub direct: bool,
    pub dpo: bool,
    pub dsync: bool,
    pub excl: bool,
    pub ff: bool,
    pub fua: bool,
    pub polled: bool,
    pub masync: bool,
    pub mmap: u8,
    pub mrq_immed: bool,
    pub mrq_svb: bool,
    pub no_dur: bool,
    pub nocreat: bool,
    pub noshare: bool,
    pub no_thresh: bool,
    pub no_unshare: bool,
    pub noxfer: bool,
    pub qhead: bool,
    pub qtail: bool,
    pub random: bool,
    pub mout_if: bool,
    pub same_fds: bool,
    pub swait: bool,
    pub v3: bool,
    pub v4: bool,
    pub v4_given: bool,
    pub wq_excl: bool,
    pub zero: bool,
}

impl SideFlags {
    /// True when this side names a synthetic data source rather than a
    /// real file (`iflag=00`, `iflag=ff`, `iflag=00,ff`, `iflag=random`).
    pub fn is_synthetic(&self) -> bool {
        self.zero || self.ff || self.random
    }
}

/// Parse a comma-separated flag list (the argument of `iflag=` or
/// `oflag=`) into `fp`. Unknown names are a syntax error. Several
/// historical spellings are accepted for the underscore flags.
pub fn parse_flag_list(arg: &str, fp: &mut SideFlags) -> Result<()> {
    if arg.is_empty() {
        return Err(Error::Syntax("no flag found".to_string()));
    }
    for name in arg.split(',') {
        match name {
            "00" => fp.zero = true,
            "append" => fp.append = true,
            "coe" => fp.coe = true,
            "defres" => fp.defres = true,
            "dio" => fp.dio = true,
            "direct" => fp.direct = true,
            "dpo" => fp.dpo = true,
            "dsync" => fp.dsync = true,
            "excl" => fp.excl = true,
            "ff" => fp.ff = true,
            "fua" => fp.fua = true,
            "hipri" | "polled" => fp.polled = true,
            "masync" => fp.masync = true,
            "mmap" => fp.mmap += 1, // mmap > 1 stops the unmap on exit
            "mrq_imm" | "mrq_immed" => fp.mrq_immed = true,
            "mrq_svb" => fp.mrq_svb = true,
            "nodur" | "no_dur" => fp.no_dur = true,
            "nocreat" => fp.nocreat = true,
            "noshare" | "no_share" => fp.noshare = true,
            "no_thresh" | "no-thresh" | "nothresh" => fp.no_thresh = true,
            "no_unshare" | "no-unshare" => fp.no_unshare = true,
            "noxfer" | "no_xfer" => fp.noxfer = true,
            "null" => {}
            "qhead" => fp.qhead = true,
            "qtail" => fp.qtail = true,
            "random" => fp.random = true,
            "mout_if" | "mout-if" => fp.mout_if = true,
            "same_fds" => fp.same_fds = true,
            "swait" => fp.swait = true,
            "v3" => fp.v3 = true,
            "v4" => {
                fp.v4 = true;
                fp.v4_given = true;
            }
            "wq_excl" => fp.wq_excl = true,
            other => {
                return Err(Error::Syntax(format!("unrecognised flag: {}", other)));
            }
        }
    }
    Ok(())
}

/// Parse the `conv=` operand. Only the dd conversions that make sense
/// for a block copy are accepted; `notrunc` and `sync` are already the
/// default behaviour so they are recognised and ignored.
pub fn parse_conv(arg: &str, ifp: &mut SideFlags, ofp: &mut SideFlags) -> Result<()> {
    if arg.is_empty() {
        return Err(Error::Syntax("no conversions found".to_string()));
    }
    for name in arg.split(',') {
        match name {
            "nocreat" => ofp.nocreat = true,
            "noerror" => ifp.coe = true, // will still fail on write error
            "notrunc" | "null" | "sync" => {}
            other => {
                return Err(Error::Syntax(format!("unrecognised conversion: {}", other)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_list_basics() {
        let mut f = SideFlags::default();
        parse_flag_list("coe,dio,fua,v4", &mut f).unwrap();
        assert!(f.coe && f.dio && f.fua && f.v4 && f.v4_given);
        assert!(!f.v3);
    }

    #[test]
    fn mmap_counts() {
        let mut f = SideFlags::default();
        parse_flag_list("mmap", &mut f).unwrap();
        assert_eq!(f.mmap, 1);
        parse_flag_list("mmap", &mut f).unwrap();
        assert_eq!(f.mmap, 2);
    }

    #[test]
    fn synthetic_detection() {
        let mut f = SideFlags::default();
        parse_flag_list("00,ff", &mut f).unwrap();
        assert!(f.zero && f.ff && f.is_synthetic());

        let mut g = SideFlags::default();
        parse_flag_list("random", &mut g).unwrap();
        assert!(g.is_synthetic());
        assert!(!SideFlags::default().is_synthetic());
    }

    #[test]
    fn alternate_spellings() {
        let mut f = SideFlags::default();
        parse_flag_list("hipri,no-thresh,mrq_imm,no_share", &mut f).unwrap();
        assert!(f.polled && f.no_thresh && f.mrq_immed && f.noshare);
    }

    #[test]
    fn unknown_flag_rejected() {
        let mut f = SideFlags::default();
        assert!(parse_flag_list("bogus", &mut f).is_err());
        assert!(parse_flag_list("", &mut f).is_err());
    }

    #[test]
    fn conv_parsing() {
        let mut i = SideFlags::default();
        let mut o = SideFlags::default();
        parse_conv("noerror,sync,nocreat", &mut i, &mut o).unwrap();
        assert!(i.coe);
        assert!(o.nocreat);
        assert!(parse_conv("swab", &mut i, &mut o).is_err());
    }
}
