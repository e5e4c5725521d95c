//! Command-line surface, matching the original `argparse` options one-to-one.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use clap::Parser;

/// Kirk - All-in-one Linux Testing Framework.
#[derive(Debug, Parser)]
#[command(name = "kirk", version, about = "Kirk - All-in-one Linux Testing Framework")]
pub struct Cli {
    /// Verbose mode.
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// If defined, no colors are shown.
    #[arg(long = "no-colors", short = 'n')]
    pub no_colors: bool,

    /// Temporary directory. An empty string disables disk persistence entirely.
    #[arg(long = "tmp-dir", short = 'd', default_value = "/tmp")]
    pub tmp_dir: String,

    /// Restore a specific session.
    #[arg(long, short = 'R')]
    pub restore: Option<Utf8PathBuf>,

    /// List of key=value environment values separated by ':'.
    #[arg(long, short = 'e', value_parser = parse_env)]
    pub env: Option<BTreeMap<String, String>>,

    /// Skip specific tests (regular expression).
    #[arg(long = "skip-tests", short = 'i')]
    pub skip_tests: Option<String>,

    /// Skip specific tests using a skip file (newline separated item).
    #[arg(long = "skip-file", short = 'I')]
    pub skip_file: Option<Utf8PathBuf>,

    /// Timeout before stopping the suite.
    #[arg(long = "suite-timeout", short = 'T', default_value_t = 3600)]
    pub suite_timeout: u64,

    /// Timeout before stopping a single execution.
    #[arg(long = "exec-timeout", short = 't', default_value_t = 3600)]
    pub exec_timeout: u64,

    /// List of suites to run.
    #[arg(long = "run-suite", short = 'r', num_args = 0..)]
    pub run_suite: Vec<String>,

    /// Command to run.
    #[arg(long = "run-command", short = 'c')]
    pub run_command: Option<String>,

    /// Number of workers to execute tests in parallel.
    #[arg(long, short = 'w', default_value_t = 1)]
    pub workers: usize,

    /// Force parallelization execution of all tests.
    #[arg(long = "force-parallel", short = 'p')]
    pub force_parallel: bool,

    /// System Under Test parameters. For help please use '-s help'.
    #[arg(long, short = 's', default_value = "host")]
    pub sut: String,

    /// Framework parameters. For help please use '-f help'.
    #[arg(long, short = 'f', default_value = "ltp")]
    pub framework: String,

    /// JSON output report.
    #[arg(long = "json-report", short = 'j')]
    pub json_report: Option<Utf8PathBuf>,

    /// Append a JSON-lines event stream to this file as the run progresses.
    #[arg(long = "json-monitor")]
    pub json_monitor: Option<Utf8PathBuf>,
}

/// Parses `"key=value:key=value"` into a map, mirroring `_env_config` in the original driver.
fn parse_env(value: &str) -> Result<BTreeMap<String, String>, String> {
    parse_kv_list(value)
}

/// Shared by `--env` and the per-plugin parameter lists: `"k=v:k=v:..."`.
pub fn parse_kv_list(value: &str) -> Result<BTreeMap<String, String>, String> {
    let mut config = BTreeMap::new();
    if value.is_empty() {
        return Ok(config);
    }

    for param in value.split(':') {
        let (key, val) = param
            .split_once('=')
            .ok_or_else(|| format!("missing '=' assignment in '{param}' parameter"))?;
        if key.is_empty() {
            return Err(format!("empty key for '{param}' parameter"));
        }
        config.insert(key.to_string(), val.to_string());
    }

    Ok(config)
}

/// Splits a `"name:k=v:k=v"` plugin argument into its name and parameter map. `"help"` is
/// passed through untouched for the caller to special-case.
pub fn parse_plugin_arg(value: &str) -> Result<(String, BTreeMap<String, String>), String> {
    if value.is_empty() {
        return Err("parameters list can't be empty".to_string());
    }

    let mut parts = value.splitn(2, ':');
    let name = parts.next().unwrap().to_string();
    let config = match parts.next() {
        Some(rest) => parse_kv_list(rest)?,
        None => BTreeMap::new(),
    };

    Ok((name, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kv_list_accepts_the_empty_string() {
        assert_eq!(parse_kv_list("").unwrap(), BTreeMap::new());
    }

    #[test]
    fn parse_kv_list_splits_on_colon_then_first_equals() {
        let parsed = parse_kv_list("host=example.com:port=22:path=/a=b").unwrap();
        assert_eq!(parsed.get("host").map(String::as_str), Some("example.com"));
        assert_eq!(parsed.get("port").map(String::as_str), Some("22"));
        assert_eq!(parsed.get("path").map(String::as_str), Some("/a=b"));
    }

    #[test]
    fn parse_kv_list_rejects_a_pair_missing_equals() {
        let err = parse_kv_list("host=example.com:noequals").unwrap_err();
        assert!(err.contains("noequals"));
    }

    #[test]
    fn parse_kv_list_rejects_an_empty_key() {
        let err = parse_kv_list("=value").unwrap_err();
        assert!(err.contains("empty key"));
    }

    #[test]
    fn parse_plugin_arg_rejects_the_empty_string() {
        let err = parse_plugin_arg("").unwrap_err();
        assert!(err.contains("can't be empty"));
    }

    #[test]
    fn parse_plugin_arg_splits_name_from_config() {
        let (name, config) = parse_plugin_arg("ssh:host=example.com:port=22").unwrap();
        assert_eq!(name, "ssh");
        assert_eq!(config.get("host").map(String::as_str), Some("example.com"));
        assert_eq!(config.get("port").map(String::as_str), Some("22"));
    }

    #[test]
    fn parse_plugin_arg_with_no_config_returns_an_empty_map() {
        let (name, config) = parse_plugin_arg("host").unwrap();
        assert_eq!(name, "host");
        assert!(config.is_empty());
    }

    #[test]
    fn parse_plugin_arg_passes_help_through_as_a_bare_name() {
        let (name, config) = parse_plugin_arg("help").unwrap();
        assert_eq!(name, "help");
        assert!(config.is_empty());
    }
}
