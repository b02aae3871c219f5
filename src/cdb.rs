//! SCSI command descriptor block construction.
//!
//! READ/WRITE at the 6, 10, 12 and 16 byte sizes, VERIFY(10) with
//! BYTCHK, and PRE-FETCH(10/16) with IMMED. Callers pick the CDB size
//! per side at startup; the 16 byte variants are forced when the LBA or
//! transfer length outgrows the smaller encodings.

use crate::error::{Error, Result};
use crate::sgio::{put_unaligned_be16, put_unaligned_be24, put_unaligned_be32, put_unaligned_be64};

pub const READ_6: u8 = 0x08;
pub const READ_10: u8 = 0x28;
pub const READ_12: u8 = 0xa8;
pub const READ_16: u8 = 0x88;
pub const WRITE_6: u8 = 0x0a;
pub const WRITE_10: u8 = 0x2a;
pub const WRITE_12: u8 = 0xaa;
pub const WRITE_16: u8 = 0x8a;
pub const VERIFY_10: u8 = 0x2f;
pub const PRE_FETCH_10: u8 = 0x34;
pub const PRE_FETCH_16: u8 = 0x90;
pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;

const RD_OPCODE: [u8; 4] = [READ_6, READ_10, READ_12, READ_16];
const WR_OPCODE: [u8; 4] = [WRITE_6, WRITE_10, WRITE_12, WRITE_16];

/// Maximum LBA addressable by a 6 byte CDB (21 bits).
pub const MAX_LBA_6: u64 = 0x1f_ffff;

fn bad(msg: String) -> Error {
    Error::Syntax(msg)
}

/// Build a READ, WRITE or VERIFY CDB into `cdbp`.
///
/// `verify` selects VERIFY(10) with BYTCHK set, so the drive compares
/// the attached data-out buffer against the medium instead of writing
/// it; only the 10 byte size is supported there and FUA is forced off.
/// Returns the actual CDB length used.
pub fn build_rw(
    cdbp: &mut [u8; 16],
    mut cdb_sz: usize,
    blocks: u32,
    start_block: u64,
    verify: bool,
    write: bool,
    mut fua: bool,
    dpo: bool,
) -> Result<usize> {
    cdbp.fill(0);
    if verify {
        // only VERIFY(10) is supported
        if cdb_sz < 10 {
            return Err(bad("only VERIFY(10) supported".to_string()));
        }
        cdb_sz = 10;
        fua = false;
        cdbp[0] = VERIFY_10;
        cdbp[1] |= 0x2; // BYTCHK=1: data-out is compared, not written
    }
    if dpo {
        cdbp[1] |= 0x10;
    }
    if fua {
        cdbp[1] |= 0x8;
    }
    match cdb_sz {
        6 => {
            cdbp[0] = if write { WR_OPCODE[0] } else { RD_OPCODE[0] };
            put_unaligned_be24((start_block & 0x1f_ffff) as u32, &mut cdbp[1..]);
            cdbp[4] = if blocks == 256 { 0 } else { blocks as u8 };
            if blocks > 256 {
                return Err(bad(
                    "for 6 byte commands, maximum number of blocks is 256".to_string(),
                ));
            }
            if (start_block + u64::from(blocks).saturating_sub(1)) & !MAX_LBA_6 != 0 {
                return Err(bad(format!(
                    "for 6 byte commands, can't address blocks beyond {}",
                    MAX_LBA_6
                )));
            }
            if dpo || fua {
                return Err(bad(
                    "for 6 byte commands, neither dpo nor fua bits supported".to_string(),
                ));
            }
        }
        10 => {
            if !verify {
                cdbp[0] = if write { WR_OPCODE[1] } else { RD_OPCODE[1] };
            }
            put_unaligned_be32(start_block as u32, &mut cdbp[2..]);
            put_unaligned_be16(blocks as u16, &mut cdbp[7..]);
            if blocks & !0xffff != 0 {
                return Err(bad(format!(
                    "for 10 byte commands, maximum number of blocks is {}",
                    0xffff
                )));
            }
        }
        12 => {
            cdbp[0] = if write { WR_OPCODE[2] } else { RD_OPCODE[2] };
            put_unaligned_be32(start_block as u32, &mut cdbp[2..]);
            put_unaligned_be32(blocks, &mut cdbp[6..]);
        }
        16 => {
            cdbp[0] = if write { WR_OPCODE[3] } else { RD_OPCODE[3] };
            put_unaligned_be64(start_block, &mut cdbp[2..]);
            put_unaligned_be32(blocks, &mut cdbp[10..]);
        }
        other => {
            return Err(bad(format!(
                "expected cdb size of 6, 10, 12, or 16 but got {}",
                other
            )));
        }
    }
    Ok(cdb_sz)
}

/// Convert a freshly built WRITE CDB into the matching PRE-FETCH with
/// the IMMED bit set. PRE-FETCH has no data transfer; the data-out
/// pointers are cleared by the submitter.
pub fn to_prefetch(cdbp: &mut [u8; 16], cdb_sz: usize) -> Result<()> {
    match cdb_sz {
        10 => cdbp[0] = PRE_FETCH_10,
        16 => cdbp[0] = PRE_FETCH_16,
        _ => {
            return Err(bad(format!(
                "PRE-FETCH only supported at 10 or 16 bytes, not {}",
                cdb_sz
            )))
        }
    }
    cdbp[1] = 0x2; // IMMED, and clears any fua/dpo bits
    Ok(())
}

/// SYNCHRONIZE CACHE(10) over the whole device.
pub fn synchronize_cache_10() -> [u8; 10] {
    let mut cdb = [0u8; 10];
    cdb[0] = SYNCHRONIZE_CACHE_10;
    cdb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read10_layout() {
        let mut cdb = [0u8; 16];
        let n = build_rw(&mut cdb, 10, 128, 0x01020304, false, false, false, false).unwrap();
        assert_eq!(n, 10);
        assert_eq!(cdb[0], READ_10);
        assert_eq!(&cdb[2..6], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&cdb[7..9], &[0x00, 0x80]);
        assert_eq!(cdb[1], 0);
    }

    #[test]
    fn write16_with_fua() {
        let mut cdb = [0u8; 16];
        let n = build_rw(
            &mut cdb,
            16,
            1,
            0x0001_0000_0000,
            false,
            true,
            true,
            false,
        )
        .unwrap();
        assert_eq!(n, 16);
        assert_eq!(cdb[0], WRITE_16);
        assert_eq!(cdb[1] & 0x8, 0x8);
        assert_eq!(
            &cdb[2..10],
            &[0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(&cdb[10..14], &[0, 0, 0, 1]);
    }

    #[test]
    fn six_byte_limits() {
        let mut cdb = [0u8; 16];
        // 256 blocks encodes as 0
        build_rw(&mut cdb, 6, 256, 0, false, false, false, false).unwrap();
        assert_eq!(cdb[4], 0);
        // block count cap
        assert!(build_rw(&mut cdb, 6, 257, 0, false, false, false, false).is_err());
        // LBA cap
        assert!(build_rw(&mut cdb, 6, 1, MAX_LBA_6 + 1, false, false, false, false).is_err());
        // dpo/fua unavailable
        assert!(build_rw(&mut cdb, 6, 1, 0, false, true, true, false).is_err());
        assert!(build_rw(&mut cdb, 6, 1, 0, false, true, false, true).is_err());
    }

    #[test]
    fn verify_forces_ten_bytes_and_bytchk() {
        let mut cdb = [0u8; 16];
        let n = build_rw(&mut cdb, 16, 8, 42, true, true, true, false).unwrap();
        assert_eq!(n, 10);
        assert_eq!(cdb[0], VERIFY_10);
        assert_eq!(cdb[1] & 0x2, 0x2);
        // FUA forced off for VERIFY
        assert_eq!(cdb[1] & 0x8, 0);
        // VERIFY(6) does not exist
        assert!(build_rw(&mut cdb, 6, 8, 42, true, true, false, false).is_err());
    }

    #[test]
    fn prefetch_conversion() {
        let mut cdb = [0u8; 16];
        build_rw(&mut cdb, 10, 8, 42, false, true, true, false).unwrap();
        to_prefetch(&mut cdb, 10).unwrap();
        assert_eq!(cdb[0], PRE_FETCH_10);
        assert_eq!(cdb[1], 0x2);

        build_rw(&mut cdb, 16, 8, 42, false, true, false, false).unwrap();
        to_prefetch(&mut cdb, 16).unwrap();
        assert_eq!(cdb[0], PRE_FETCH_16);

        assert!(to_prefetch(&mut cdb, 12).is_err());
    }
}
