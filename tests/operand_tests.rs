// Operand surface behaviour through the public API.

mod common;
use common::test_utils::init_logging;

use sgcopy::operands::{parse_operands, validate};

fn parse(ops: &[&str]) -> sgcopy::Result<sgcopy::CopyConfig> {
    let v: Vec<String> = ops.iter().map(|s| s.to_string()).collect();
    parse_operands(&v)
}

#[test]
fn defaults_match_documentation() {
    init_logging();
    let mut cfg = parse(&[]).unwrap();
    validate(&mut cfg).unwrap();
    assert_eq!(cfg.bs, 512);
    assert_eq!(cfg.bpt, 128);
    assert_eq!(cfg.num_threads, 4);
    assert_eq!(cfg.cdbsz_in, 10);
    assert_eq!(cfg.cdbsz_out, 10);
    assert_eq!(cfg.cmd_timeout_ms, 60_000);
    assert_eq!(cfg.sdt_ict_ms, 300);
    assert_eq!(cfg.sdt_crt_sec, 3);
    assert!(cfg.unshare);
    assert!(!cfg.noshare);
    assert_eq!(cfg.do_time, 1);
}

#[test]
fn hex_and_suffix_numbers_in_positions() {
    init_logging();
    let cfg = parse(&["skip=0x10", "seek=2k", "count=1M"]).unwrap();
    assert_eq!(cfg.skip, 16);
    assert_eq!(cfg.seek, 2048);
    assert_eq!(cfg.count, Some(1024 * 1024));
}

#[test]
fn cdbsz_accepts_only_real_sizes() {
    init_logging();
    for good in [6u64, 10, 12, 16] {
        let cfg = parse(&[&format!("cdbsz={}", good)]).unwrap();
        assert_eq!(cfg.cdbsz_in as u64, good);
        assert!(cfg.cdbsz_given);
    }
    assert!(parse(&["cdbsz=8"]).is_err());
    assert!(parse(&["cdbsz=32"]).is_err());
}

#[test]
fn elemsz_kb_must_be_power_of_two() {
    init_logging();
    let cfg = parse(&["elemsz_kb=8"]).unwrap();
    assert_eq!(cfg.elem_sz, 8 * 1024);
    assert!(parse(&["elemsz_kb=6"]).is_err());
    assert!(parse(&["elemsz_kb=0"]).is_err());
}

#[test]
fn no_unshare_flag_demotes_global_unshare() {
    init_logging();
    let mut cfg = parse(&["iflag=no_unshare"]).unwrap();
    validate(&mut cfg).unwrap();
    assert!(!cfg.unshare);
}

#[test]
fn swait_is_accepted_and_ignored() {
    init_logging();
    let mut cfg = parse(&["iflag=swait"]).unwrap();
    validate(&mut cfg).unwrap();
    assert!(cfg.in_flags.swait);
    // no propagation to the output side
    assert!(!cfg.out_flags.swait);
}

#[test]
fn unknown_operand_is_syntax_error() {
    init_logging();
    let err = parse(&["bogus=1"]).unwrap_err();
    assert_eq!(err.exit_code(), 1);
    let err = parse(&["notanoperand"]).unwrap_err();
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn contradictions_use_contradict_exit_code() {
    init_logging();
    let mut cfg = parse(&["iflag=00", "if=/tmp/whatever"]).unwrap();
    let err = validate(&mut cfg).unwrap_err();
    assert_eq!(err.exit_code(), sgcopy::Category::Contradict.exit_code());
}

#[test]
fn verbose_operand_merges_with_flag_count() {
    init_logging();
    let cfg = parse(&["verbose=3"]).unwrap();
    assert_eq!(cfg.verbose, 3);
    let cfg = parse(&["verb=2"]).unwrap();
    assert_eq!(cfg.verbose, 2);
}
