//! Hybris interpreter CLI.
//!
//! Reads a script from the positional path (or standard input when no
//! path is given), parses it and hands the program to the runtime.
//! Remaining positional arguments become the script's argv.

use clap::Parser as ClapParser;
use hybris_parser::Parser;
use hybris_runtime::frame::StateKind;
use hybris_runtime::{Vm, VmArgs, engine};
use std::io::Read;
use std::path::PathBuf;
use std::process;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(ClapParser)]
#[command(name = "hybris")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Hybris scripting language interpreter", long_about = None)]
struct Cli {
    /// Print execution time on exit
    #[arg(short = 't', long = "timing")]
    timing: bool,

    /// Print a stack trace when an error occurs
    #[arg(short = 's', long = "stacktrace")]
    stacktrace: bool,

    /// Override the collection threshold, in bytes
    #[arg(short = 'g', long = "gc-threshold", value_name = "BYTES")]
    gc_threshold: Option<usize>,

    /// Override the memory cap, in bytes
    #[arg(short = 'm', long = "mm-threshold", value_name = "BYTES")]
    mm_threshold: Option<usize>,

    /// Script to run; standard input when omitted
    script: Option<PathBuf>,

    /// Arguments handed to the script
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("HYBRIS_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let source = match read_source(cli.script.as_deref()) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("hybris: {}", e);
            process::exit(1);
        }
    };

    // scripts resolve relative paths against their own directory
    if let Some(dir) = cli.script.as_deref().and_then(|p| p.parent()) {
        if !dir.as_os_str().is_empty() {
            let _ = std::env::set_current_dir(dir);
        }
    }

    let program = {
        let mut parser = match Parser::new(&source) {
            Ok(parser) => parser,
            Err(e) => {
                eprintln!("hybris: syntax error: {}", e);
                process::exit(1);
            }
        };
        match parser.parse() {
            Ok(program) => program,
            Err(e) => {
                eprintln!("hybris: syntax error: {}", e);
                process::exit(1);
            }
        }
    };

    let vm = Vm::new(VmArgs {
        source: cli.script.clone(),
        script_args: cli.args.clone(),
        timing: cli.timing,
        stacktrace: cli.stacktrace,
        gc_threshold: cli.gc_threshold,
        mm_threshold: cli.mm_threshold,
    });

    let started = Instant::now();
    engine::run_program(&vm, &program);
    let failed = vm.main_frame().is_state(StateKind::Exception);

    if cli.timing {
        println!("\x1b[01;33m[TIME] Elapsed {:?} .\x1b[00m", started.elapsed());
    }

    // release() reports an unhandled exception left on the main frame
    vm.release();
    process::exit(if failed { 1 } else { 0 });
}

fn read_source(path: Option<&std::path::Path>) -> std::io::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path),
        None => {
            let mut source = String::new();
            std::io::stdin().read_to_string(&mut source)?;
            Ok(source)
        }
    }
}
