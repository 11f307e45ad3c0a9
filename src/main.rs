//! `create-diff-object`: diff a base and a patched relocatable object
//! into an xSplice live-patch payload.
//!
//! Usage:
//!   create-diff-object [--debug] [--resolve] original.o patched.o running-image output.o
//!
//! Exit codes: 0 success, 1 internal error, 2 unsupported change,
//! 3 no changes detected.

use std::env;
use std::path::Path;
use std::process;

use xsplice_build::{Error, Options};

fn print_usage() {
    eprintln!("Usage: create-diff-object [options] <original.o> <patched.o> <running-image> <output.o>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --debug      Enable verbose logging");
    eprintln!("  --resolve    Prefill old addresses from the running image");
}

fn main() {
    let args: Vec<String> = env::args().collect();

    let mut opts = Options::default();
    let mut verbose = false;
    let mut positional: Vec<String> = Vec::new();

    for arg in &args[1..] {
        match arg.as_str() {
            "--debug" => verbose = true,
            "--resolve" => opts.resolve = true,
            arg if arg.starts_with("--") => {
                eprintln!("Error: Unknown option: {arg}");
                print_usage();
                process::exit(1);
            }
            arg => positional.push(arg.to_string()),
        }
    }

    if positional.len() != 4 {
        print_usage();
        process::exit(1);
    }

    if let Err(e) = stderrlog::new()
        .verbosity(if verbose { 4 } else { 2 })
        .init()
    {
        eprintln!("Error: failed to initialize logging: {e}");
        process::exit(1);
    }

    let result = xsplice_build::run(
        Path::new(&positional[0]),
        Path::new(&positional[1]),
        Path::new(&positional[2]),
        Path::new(&positional[3]),
        &opts,
    );

    match result {
        Ok(()) => {}
        Err(Error::NoChanges) => {
            eprintln!("{}", Error::NoChanges);
            process::exit(Error::NoChanges.exit_code());
        }
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(e.exit_code());
        }
    }
}
