//! Command-line front end.
//!
//! ```text
//! ntfs_recover <image> <output_dir> [--recover-deleted] [--file-types=txt,jpg] [--verbose]
//! ```
//!
//! Human-readable progress goes to stderr; the final outcome is printed to
//! stdout as JSON.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use ntfs_recovery_backend::{ProgressSink, RecoveryOptions, RecoverySession};

struct CliArgs {
    image: PathBuf,
    output: PathBuf,
    options: RecoveryOptions,
}

fn usage() -> ! {
    eprintln!(
        "usage: ntfs_recover <image> <output_dir> [--recover-deleted] \
         [--file-types=ext1,ext2] [--verbose]"
    );
    std::process::exit(2);
}

fn parse_args() -> CliArgs {
    let mut positional = Vec::new();
    let mut options = RecoveryOptions::default();

    for arg in std::env::args().skip(1) {
        if let Some(list) = arg.strip_prefix("--file-types=") {
            let set: BTreeSet<String> = list
                .split(',')
                .map(|s| s.trim().trim_start_matches('.').to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if set.is_empty() {
                usage();
            }
            options.extensions = Some(set);
        } else if arg == "--recover-deleted" {
            options.deleted_only = true;
        } else if arg == "--verbose" {
            options.verbose = true;
        } else if arg.starts_with("--") {
            usage();
        } else {
            positional.push(PathBuf::from(arg));
        }
    }

    if positional.len() != 2 {
        usage();
    }
    let output = positional.pop().unwrap();
    let image = positional.pop().unwrap();
    CliArgs {
        image,
        output,
        options,
    }
}

struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn begin(&self, total_entries: u64) {
        eprintln!("scanning {} directory entries", total_entries);
    }

    fn entry_visited(&self, visited: u64) {
        if visited % 1000 == 0 {
            eprintln!("  ... {} entries processed", visited);
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = parse_args();

    let mut session = match RecoverySession::open(&args.image) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    session.set_progress(Arc::new(StderrProgress));

    let outcome = session.recover(&args.output, &args.options);

    eprintln!(
        "done: {} recovered, {} partial, {} skipped, {} errored",
        outcome.recovered, outcome.partial, outcome.skipped, outcome.errored
    );
    match serde_json::to_string_pretty(&outcome) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("error: cannot serialize outcome: {}", e);
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}
