use clap::Parser;
use env_logger::Env;

use sgcopy::operands;

#[derive(Parser)]
#[command(
    version,
    about,
    long_about = "Copy (or verify) logical blocks between two endpoints, \
using the Linux sg driver's request sharing and multi-request facilities \
when both endpoints are sg devices.\n\n\
Operands use dd syntax: bs=, bpt=, count=, if=, of=, of2=, ofreg=, \
ofsplit=, iflag=, oflag=, conv=, seek=, skip=, thr=, mrq=, sync=, time=, \
ae=, cdbsz=, coe=, dio=, fua=, noshare=, unshare=, elemsz_kb=, fail_mask=, \
sdt=, verbose="
)]
struct Cli {
    /// Check that read data carries the block-address pattern; repeat
    /// to check every 32-bit word of each block
    #[arg(short = 'c', long, action = clap::ArgAction::Count)]
    chkaddr: u8,

    /// Parse operands and open files, then bypass the copy
    #[arg(short = 'd', long, action = clap::ArgAction::Count)]
    dry_run: u8,

    /// Issue a PRE-FETCH before each verify so the comparison runs
    /// against cached blocks
    #[arg(short = 'p', long)]
    prefetch: bool,

    /// Compare OFILE against the data read from IFILE (SCSI VERIFY
    /// with BYTCHK) instead of writing
    #[arg(short = 'x', long)]
    verify: bool,

    /// Increase diagnostic output (repeatable)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit run statistics as JSON on stdout
    #[arg(short = 'J', long)]
    json: bool,

    /// dd-style operands (key=value)
    #[arg(value_name = "OPERAND")]
    operands: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 | 1 => "info",
        2 | 3 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(filter))
        .format_target(false)
        .format_timestamp(None)
        .init();

    let mut cfg = match operands::parse_operands(&cli.operands) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("sgcopy: {}", e);
            eprintln!("For more information use '--help'");
            std::process::exit(e.exit_code());
        }
    };
    cfg.verify |= cli.verify;
    cfg.prefetch |= cli.prefetch;
    cfg.dry_run += cli.dry_run;
    cfg.chkaddr += cli.chkaddr;
    cfg.verbose += cli.verbose;
    cfg.json_stats |= cli.json;

    if let Err(e) = operands::validate(&mut cfg) {
        eprintln!("sgcopy: {}", e);
        std::process::exit(e.exit_code());
    }

    match sgcopy::run(cfg) {
        Ok(status) => std::process::exit(status),
        Err(e) => {
            eprintln!("sgcopy: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}
