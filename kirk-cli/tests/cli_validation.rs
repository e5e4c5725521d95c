//! Black-box checks of the `kirk` binary's argument validation and exit-code contract.

use std::process::{Command, Output};

fn kirk(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_kirk"))
        .args(args)
        .output()
        .expect("spawned kirk binary")
}

#[test]
fn missing_run_suite_and_run_command_is_a_usage_error() {
    let out = kirk(&[]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn nonexistent_skip_file_is_a_usage_error() {
    let out = kirk(&["--run-suite", "environ", "--skip-file", "/no/such/skip/file"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn preexisting_json_report_path_is_a_usage_error() {
    let dir = std::env::temp_dir().join(format!("kirk-cli-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let report = dir.join("report.json");
    std::fs::write(&report, "{}").unwrap();

    let out = kirk(&[
        "--run-suite",
        "environ",
        "--json-report",
        report.to_str().unwrap(),
    ]);
    assert_eq!(out.status.code(), Some(2));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn unknown_sut_name_is_a_usage_error() {
    let out = kirk(&["--run-suite", "environ", "--sut", "not-a-real-sut"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn unknown_framework_name_is_a_usage_error() {
    let out = kirk(&["--run-suite", "environ", "--framework", "not-a-real-framework"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn unknown_sut_config_key_is_a_usage_error() {
    let out = kirk(&["--run-suite", "environ", "--sut", "host:bogus_key=1"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn sut_help_exits_ok_without_requiring_run_suite() {
    let out = kirk(&["--sut", "help"]);
    assert_eq!(out.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&out.stdout).contains("host"));
}

#[test]
fn framework_help_exits_ok_without_requiring_run_suite() {
    let out = kirk(&["--framework", "help"]);
    assert_eq!(out.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&out.stdout).contains("ltp"));
}
