// Synthetic source and address-check behaviour through the full engine.

mod common;
use common::test_utils::{cleanup, config_from, init_logging, tmp_path};

use std::fs;

#[test]
fn ff_source_fills_output() {
    init_logging();
    let dst = tmp_path("ff_dst");
    cleanup(&[&dst]);
    let cfg = config_from(&[
        "bs=512",
        "count=6",
        "iflag=ff",
        &format!("of={}", dst.to_str().unwrap()),
    ]);
    assert_eq!(sgcopy::run(cfg).expect("run failed"), 0);
    let data = fs::read(&dst).unwrap();
    assert_eq!(data.len(), 6 * 512);
    assert!(data.iter().all(|&b| b == 0xff));
    cleanup(&[&dst]);
}

#[test]
fn zero_source_fills_output() {
    init_logging();
    let dst = tmp_path("zero_dst");
    cleanup(&[&dst]);
    let cfg = config_from(&[
        "bs=512",
        "count=6",
        "iflag=00",
        &format!("of={}", dst.to_str().unwrap()),
    ]);
    assert_eq!(sgcopy::run(cfg).expect("run failed"), 0);
    let data = fs::read(&dst).unwrap();
    assert_eq!(data.len(), 6 * 512);
    assert!(data.iter().all(|&b| b == 0));
    cleanup(&[&dst]);
}

#[test]
fn random_source_produces_full_length() {
    init_logging();
    let dst = tmp_path("rand_dst");
    cleanup(&[&dst]);
    let cfg = config_from(&[
        "bs=512",
        "count=16",
        "thr=2",
        "iflag=random",
        &format!("of={}", dst.to_str().unwrap()),
    ]);
    assert_eq!(sgcopy::run(cfg).expect("run failed"), 0);
    let data = fs::read(&dst).unwrap();
    assert_eq!(data.len(), 16 * 512);
    // all-zero output would mean the generator never ran
    assert!(data.iter().any(|&b| b != 0));
    cleanup(&[&dst]);
}

#[test]
fn chkaddr_passes_on_address_pattern() {
    init_logging();
    let f = tmp_path("chk_ok");
    cleanup(&[&f]);
    let cfg = config_from(&[
        "bs=512",
        "count=16",
        "iflag=00,ff",
        &format!("of={}", f.to_str().unwrap()),
    ]);
    assert_eq!(sgcopy::run(cfg).expect("run failed"), 0);

    let mut cfg = config_from(&[
        "bs=512",
        "count=16",
        "of=/dev/null",
        &format!("if={}", f.to_str().unwrap()),
    ]);
    cfg.chkaddr = 1;
    assert_eq!(sgcopy::run(cfg).expect("run failed"), 0);

    // whole-block mode too
    let mut cfg = config_from(&[
        "bs=512",
        "count=16",
        "of=/dev/null",
        &format!("if={}", f.to_str().unwrap()),
    ]);
    cfg.chkaddr = 2;
    assert_eq!(sgcopy::run(cfg).expect("run failed"), 0);
    cleanup(&[&f]);
}

#[test]
fn chkaddr_detects_corruption() {
    init_logging();
    let f = tmp_path("chk_bad");
    cleanup(&[&f]);
    let cfg = config_from(&[
        "bs=512",
        "count=16",
        "iflag=00,ff",
        &format!("of={}", f.to_str().unwrap()),
    ]);
    assert_eq!(sgcopy::run(cfg).expect("run failed"), 0);

    // flip one word in block 10
    let mut data = fs::read(&f).unwrap();
    let off = 10 * 512 + 8;
    data[off] ^= 0xa5;
    fs::write(&f, &data).unwrap();

    let mut cfg = config_from(&[
        "bs=512",
        "count=16",
        "thr=1",
        "of=/dev/null",
        &format!("if={}", f.to_str().unwrap()),
    ]);
    cfg.chkaddr = 2;
    let status = sgcopy::run(cfg).expect("run itself should not error");
    assert_eq!(status, sgcopy::Category::Miscompare.exit_code());
    cleanup(&[&f]);
}

#[test]
fn chkaddr_single_mode_ignores_later_words() {
    // single-check mode inspects only the first word of each block, so
    // corruption further in goes unnoticed
    init_logging();
    let f = tmp_path("chk_single");
    cleanup(&[&f]);
    let cfg = config_from(&[
        "bs=512",
        "count=8",
        "iflag=00,ff",
        &format!("of={}", f.to_str().unwrap()),
    ]);
    assert_eq!(sgcopy::run(cfg).expect("run failed"), 0);

    let mut data = fs::read(&f).unwrap();
    data[3 * 512 + 100] ^= 0xff;
    fs::write(&f, &data).unwrap();

    let mut cfg = config_from(&[
        "bs=512",
        "count=8",
        "thr=1",
        "of=/dev/null",
        &format!("if={}", f.to_str().unwrap()),
    ]);
    cfg.chkaddr = 1;
    assert_eq!(sgcopy::run(cfg).expect("run failed"), 0);
    cleanup(&[&f]);
}
