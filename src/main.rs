use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{ArgAction, CommandFactory, Parser};
use env_logger::Env;
use log::LevelFilter;

use gatos::macho::TEXT_SEGMENT;
use gatos::target::Target;
use gatos::types::{parse_address, VirtAddr};

const AFTER_HELP: &str = "\
EXAMPLE:
    Thread 0 Crashed:
    0   AppName                  0x000043cc 0x1000 + 13260
                                 ^          ^
                                 runtime    load address

    $ gatos --raddr=0x000043cc --laddr=0x1000 --macho=AppName --dsym=AppName.dSYM
    -[CPrefsViewController pickImage:] (CPrefsViewController.mm:332)

NOTES:
    The binary and dSYM are found inside the app and .dSYM bundles.
    Fat binaries are not supported; lipo -thin the app and dSYM first.
    Line numbers are those of the function declaration, not of the address.

Set GATOS_LOG=debug (or use -v) to trace the lookup.";

#[derive(Parser, Debug)]
#[command(
    name = "gatos",
    about = "Resolve a crash address to a function and source line using a dSYM",
    after_help = AFTER_HELP
)]
struct Args {
    /// Runtime address from the crash report (0x hex, 0 octal, or decimal)
    #[arg(long, value_name = "ADDR", value_parser = parse_address)]
    raddr: Option<u64>,

    /// Load address of the binary image in the crash report
    #[arg(long, value_name = "ADDR", value_parser = parse_address)]
    laddr: Option<u64>,

    /// Path to the Mach-O executable
    #[arg(long, value_name = "PATH")]
    macho: Option<PathBuf>,

    /// Path to the .dSYM bundle, or the DWARF file inside it
    #[arg(long, value_name = "PATH")]
    dsym: Option<PathBuf>,

    /// Segment the load address refers to
    #[arg(long, value_name = "NAME", default_value = TEXT_SEGMENT)]
    segment: String,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

struct Request {
    runtime: VirtAddr,
    load: VirtAddr,
    target: Target,
}

impl Args {
    /// Returns `None` when a required input is missing, zero, or empty.
    fn request(&self) -> Option<Request> {
        let runtime = self.raddr.filter(|&addr| addr != 0)?;
        let load = self.laddr.filter(|&addr| addr != 0)?;
        let macho = self.macho.clone().filter(|p| !p.as_os_str().is_empty())?;
        let dsym = self.dsym.clone().filter(|p| !p.as_os_str().is_empty())?;
        Some(Request {
            runtime: VirtAddr(runtime),
            load: VirtAddr(load),
            target: Target::new(macho, dsym).with_segment(self.segment.clone()),
        })
    }
}

fn init_logging(verbose: u8) {
    let mut builder = env_logger::Builder::from_env(Env::default().filter_or("GATOS_LOG", "warn"));
    match verbose {
        0 => {}
        1 => {
            builder.filter_level(LevelFilter::Info);
        }
        2 => {
            builder.filter_level(LevelFilter::Debug);
        }
        _ => {
            builder.filter_level(LevelFilter::Trace);
        }
    }
    builder.format_timestamp(None).init();
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.verbose);

    let Some(request) = args.request() else {
        Args::command().print_help()?;
        return Ok(ExitCode::from(2));
    };

    let symbols = request.target.symbolicate(request.runtime, request.load)?;
    for symbol in &symbols {
        println!("{symbol}");
    }

    Ok(ExitCode::SUCCESS)
}
