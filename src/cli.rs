//! Command line handling.
//!
//! Two very different consumers live here. The `muscle-manager` binary
//! owns its whole command line and parses it with clap. The instance
//! library does not: it is embedded in someone else's program, so it
//! picks its few `--muscle-*` flags out of the argument list by hand and
//! leaves everything else for the embedding program to interpret.

use std::path::PathBuf;

use clap::Parser;

use crate::error::{Error, Result};

/// Prefix of the flag naming the manager endpoint.
const MANAGER_PREFIX: &str = "--muscle-manager=";
/// Prefix of the flag giving this instance's multiplicity index.
const INDEX_PREFIX: &str = "--muscle-index=";
/// Prefix of the flag giving the instance log file location.
const LOG_FILE_PREFIX: &str = "--muscle-log-file=";

/// Manager endpoint used when no flag is given.
pub const DEFAULT_MANAGER_LOCATION: &str = "localhost:9000";

/// Command line of the `muscle-manager` binary.
#[derive(Parser, Debug)]
#[command(
    name = "muscle-manager",
    about = "Coordinates a coupled multiscale simulation",
    version
)]
pub struct Args {
    /// Path to the simulation plan (JSON)
    pub plan: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9000")]
    pub bind: String,

    /// Path of the manager's log sink
    #[arg(long, default_value = "muscle3_manager.log")]
    pub log_file: PathBuf,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress console output
    #[arg(short, long)]
    pub quiet: bool,
}

/// Extracts the manager location from an argument list, if present.
pub fn extract_manager_location(args: &[String]) -> Option<String> {
    args.iter()
        .find_map(|arg| arg.strip_prefix(MANAGER_PREFIX))
        .map(|value| value.to_string())
}

/// Extracts the multiplicity index from an argument list. No flag means
/// an empty index.
pub fn extract_index(args: &[String]) -> Result<Vec<i64>> {
    let Some(value) = args.iter().find_map(|arg| arg.strip_prefix(INDEX_PREFIX)) else {
        return Ok(Vec::new());
    };
    value
        .split(',')
        .map(|part| {
            part.trim().parse::<i64>().map_err(|_| {
                Error::Config(format!(
                    "invalid --muscle-index value '{}': expected comma separated integers",
                    value
                ))
            })
        })
        .collect()
}

/// Extracts the log file location from an argument list, if present.
pub fn extract_log_file(args: &[String]) -> Option<PathBuf> {
    args.iter()
        .find_map(|arg| arg.strip_prefix(LOG_FILE_PREFIX))
        .map(PathBuf::from)
}

/// The current process's arguments, without the program name.
pub fn process_args() -> Vec<String> {
    std::env::args().skip(1).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn flags_are_extracted_positionally() {
        let argv = args(&[
            "--some-model-flag=3",
            "--muscle-manager=node004:9001",
            "input.dat",
            "--muscle-index=3,7",
            "--muscle-log-file=/var/log/sim",
        ]);

        assert_eq!(
            extract_manager_location(&argv),
            Some("node004:9001".to_string())
        );
        assert_eq!(extract_index(&argv).unwrap(), vec![3, 7]);
        assert_eq!(
            extract_log_file(&argv),
            Some(PathBuf::from("/var/log/sim"))
        );
    }

    #[test]
    fn absent_flags_give_defaults() {
        let argv = args(&["positional", "--other=1"]);
        assert_eq!(extract_manager_location(&argv), None);
        assert_eq!(extract_index(&argv).unwrap(), Vec::<i64>::new());
        assert_eq!(extract_log_file(&argv), None);
    }

    #[test]
    fn bad_index_is_a_configuration_error() {
        let argv = args(&["--muscle-index=3,x"]);
        assert!(matches!(extract_index(&argv), Err(Error::Config(_))));
    }

    #[test]
    fn manager_args_parse() {
        let parsed = Args::parse_from([
            "muscle-manager",
            "--bind",
            "0.0.0.0:9000",
            "-v",
            "plan.json",
        ]);
        assert_eq!(parsed.plan, PathBuf::from("plan.json"));
        assert_eq!(parsed.bind, "0.0.0.0:9000");
        assert_eq!(parsed.verbose, 1);
        assert!(!parsed.quiet);
    }
}
