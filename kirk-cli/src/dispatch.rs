//! Turns parsed CLI flags into a running [`Session`] and reports progress to the terminal.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use kirk_core::errors::SessionError;
use kirk_core::event_bus::{EventBus, KirkEvent};
use kirk_core::framework::kselftest::{KselftestConfig, KselftestFramework};
use kirk_core::framework::liburing::{LiburingConfig, LiburingFramework};
use kirk_core::framework::ltp::{LtpConfig, LtpFramework};
use kirk_core::framework::Framework;
use kirk_core::plugin::Plugin;
use kirk_core::session::{RunOptions, Session, SessionConfig};
use kirk_core::signal::{ShutdownEvent, SignalHandlerKind};
use kirk_core::sut::host::HostSut;
use kirk_core::sut::ltx::{LtxConfig, LtxSut};
use kirk_core::sut::qemu::{QemuConfig, QemuSut, SerialKind};
use kirk_core::sut::ssh::{SshConfig, SshSut};
use kirk_core::sut::Sut;
use kirk_core::tempdir::TempDir;
use tokio::time::Duration;

use crate::cli::{parse_plugin_arg, Cli};
use crate::errors::CliError;

const SUT_HELP: &[(&str, &[(&str, &str)])] = &[
    ("host", &[]),
    (
        "ssh",
        &[
            ("host", "IP address of the SUT (default: localhost)"),
            ("port", "TCP port of the service (default: 22)"),
            ("user", "name of the user (default: root)"),
            ("password", "root password"),
            ("key_file", "private key location"),
            ("reset_command", "command to reset the remote SUT"),
            ("sudo", "use sudo to access to root shell (default: 0)"),
        ],
    ),
    (
        "qemu",
        &[
            ("image", "qemu image location"),
            ("kernel", "kernel image location"),
            ("initrd", "initrd image location"),
            ("user", "user name (default: '')"),
            ("password", "user password (default: '')"),
            ("prompt", "prompt string (default: '#')"),
            ("system", "system architecture (default: x86_64)"),
            ("ram", "RAM of the VM (default: 2G)"),
            ("smp", "number of CPUs (default: 2)"),
            ("serial", "type of serial protocol. isa|virtio (default: isa)"),
            ("virtfs", "directory to mount inside VM"),
            ("options", "user defined options"),
        ],
    ),
    (
        "ltx",
        &[
            ("tool", "path to the ltx executable (default: ltx on PATH)"),
            ("args", "extra arguments passed to ltx"),
        ],
    ),
];

const FRAMEWORK_HELP: &[(&str, &[(&str, &str)])] = &[
    (
        "ltp",
        &[
            ("root", "LTP install folder"),
            ("max_runtime", "filter out all tests above this time value"),
        ],
    ),
    ("kselftest", &[("root", "kselftest folder")]),
    ("liburing", &[("root", "liburing test folder")]),
];

/// Drives the whole CLI invocation and returns the process exit code.
pub async fn run(cli: Cli) -> i32 {
    match run_inner(cli).await {
        Ok(()) => 0,
        Err(err) => {
            if !matches!(err, CliError::Interrupted) {
                eprintln!("kirk: {err}");
            }
            err.exit_code()
        }
    }
}

async fn run_inner(cli: Cli) -> Result<(), CliError> {
    init_tracing(cli.verbose);

    if cli.sut == "help" {
        print_plugin_help("SUT", SUT_HELP);
        return Ok(());
    }
    if cli.framework == "help" {
        print_plugin_help("framework", FRAMEWORK_HELP);
        return Ok(());
    }

    if cli.run_suite.is_empty() && cli.run_command.is_none() {
        return Err(CliError::Usage(
            "at least one of --run-suite or --run-command is required".into(),
        ));
    }

    if let Some(skip_file) = &cli.skip_file {
        if !skip_file.is_file() {
            return Err(CliError::Usage(format!("skip file doesn't exist: {skip_file}")));
        }
    }

    if let Some(report) = &cli.json_report {
        if report.exists() {
            return Err(CliError::Usage(format!("report path already exists: {report}")));
        }
    }

    let tmp_root = if cli.tmp_dir.is_empty() {
        None
    } else {
        Some(Utf8PathBuf::from(&cli.tmp_dir))
    };
    let tmpdir = Arc::new(
        TempDir::new(tmp_root.as_deref(), 5).map_err(|err| CliError::Usage(err.to_string()))?,
    );

    let (sut_name, sut_config) = parse_plugin_arg(&cli.sut).map_err(CliError::Usage)?;
    let sut = build_sut(&sut_name, &sut_config, tmpdir.abspath())?;

    let (framework_name, mut framework_config) = parse_plugin_arg(&cli.framework).map_err(CliError::Usage)?;
    if let Some(env) = &cli.env {
        for (key, value) in env {
            framework_config.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    let framework = build_framework(&framework_name, &framework_config)?;

    let skip_tests = merge_skip_tests(cli.skip_tests.as_deref(), cli.skip_file.as_deref()).await?;

    let events = EventBus::new();
    install_reporter(&events, cli.verbose, cli.no_colors, cli.workers);
    if let Some(path) = &cli.json_monitor {
        Arc::new(kirk_core::monitor::JsonMonitor::new(path.clone())).attach(&events);
    }

    let session = Arc::new(Session::new(SessionConfig {
        tmpdir: tmpdir.clone(),
        framework,
        sut,
        events: events.clone(),
        exec_timeout: Duration::from_secs(cli.exec_timeout),
        suite_timeout: Duration::from_secs(cli.suite_timeout),
        workers: cli.workers,
        force_parallel: cli.force_parallel,
    }));
    Session::install_restore_hooks(&session);

    let opts = RunOptions {
        command: cli.run_command.clone(),
        suites: cli.run_suite.clone(),
        pattern: None,
        skip_tests,
        report_path: cli.json_report.clone(),
        restore: cli.restore.clone(),
        suite_iterate: 1,
        randomize: false,
        runtime: None,
    };

    let consumer = tokio::spawn({
        let events = events.clone();
        async move { events.start().await }
    });

    let mut signals = SignalHandlerKind::Standard.build().map_err(|err| CliError::Usage(err.to_string()))?;

    let result = tokio::select! {
        result = session.run(opts) => result.map_err(CliError::from),
        signal = signals.recv() => {
            match signal {
                Some(ShutdownEvent::Interrupt) => {
                    tracing::warn!("interrupted, stopping SUT");
                    session.stop().await;
                    Err(CliError::Interrupted)
                }
                #[cfg(unix)]
                Some(_) => {
                    session.stop().await;
                    Err(CliError::Interrupted)
                }
                None => Ok(()),
            }
        }
    };

    events.stop().await;
    let _ = consumer.await;

    result
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_target(false)
        .try_init();
}

fn print_plugin_help(kind: &str, entries: &[(&str, &[(&str, &str)])]) {
    println!("available {kind} implementations:");
    for (name, keys) in entries {
        println!("  {name}");
        for (key, help) in *keys {
            println!("    {key}: {help}");
        }
    }
}

async fn merge_skip_tests(
    skip_tests: Option<&str>,
    skip_file: Option<&camino::Utf8Path>,
) -> Result<Option<String>, CliError> {
    let mut patterns: Vec<String> = Vec::new();
    if let Some(pattern) = skip_tests {
        patterns.push(pattern.to_string());
    }
    if let Some(path) = skip_file {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| CliError::Usage(format!("can't read skip file {path}: {err}")))?;
        for line in contents.lines() {
            let line = line.trim();
            if !line.is_empty() && !line.starts_with('#') {
                patterns.push(line.to_string());
            }
        }
    }

    if patterns.is_empty() {
        return Ok(None);
    }
    Ok(Some(patterns.join("|")))
}

fn build_sut(name: &str, config: &BTreeMap<String, String>, tmpdir: &str) -> Result<Arc<dyn Sut>, CliError> {
    match name {
        "host" => {
            reject_unknown_keys(name, config, &[])?;
            Ok(Arc::new(HostSut::new()))
        }
        "ssh" => {
            reject_unknown_keys(
                name,
                config,
                &["host", "port", "user", "password", "key_file", "reset_command", "sudo", "known_hosts"],
            )?;
            let mut cfg = SshConfig::default();
            if let Some(v) = config.get("host") {
                cfg.host = v.clone();
            }
            if let Some(v) = config.get("port") {
                cfg.port = parse_field(name, "port", v)?;
            }
            if let Some(v) = config.get("user") {
                cfg.user = v.clone();
            }
            if let Some(v) = config.get("password") {
                cfg.password = Some(v.clone());
            }
            if let Some(v) = config.get("key_file") {
                cfg.key_file = Some(Utf8PathBuf::from(v));
            }
            if let Some(v) = config.get("reset_command") {
                cfg.reset_cmd = Some(v.clone());
            }
            if let Some(v) = config.get("sudo") {
                cfg.sudo = parse_bool(name, "sudo", v)?;
            }
            if let Some(v) = config.get("known_hosts") {
                cfg.known_hosts = Some(Utf8PathBuf::from(v));
            }
            Ok(Arc::new(SshSut::new(cfg)))
        }
        "qemu" => {
            reject_unknown_keys(
                name,
                config,
                &[
                    "image", "kernel", "initrd", "user", "password", "prompt", "system", "ram", "smp", "serial",
                    "virtfs", "options",
                ],
            )?;
            let mut cfg = QemuConfig {
                tmpdir: Utf8PathBuf::from(tmpdir),
                user: None,
                password: None,
                prompt: "#".to_string(),
                image: None,
                initrd: None,
                kernel: None,
                ram: "2G".to_string(),
                smp: "2".to_string(),
                virtfs: None,
                serial: SerialKind::Isa,
                options: None,
                system: "x86_64".to_string(),
            };
            if let Some(v) = config.get("image") {
                cfg.image = Some(Utf8PathBuf::from(v));
            }
            if let Some(v) = config.get("kernel") {
                cfg.kernel = Some(Utf8PathBuf::from(v));
            }
            if let Some(v) = config.get("initrd") {
                cfg.initrd = Some(Utf8PathBuf::from(v));
            }
            if let Some(v) = config.get("user") {
                cfg.user = Some(v.clone());
            }
            if let Some(v) = config.get("password") {
                cfg.password = Some(v.clone());
            }
            if let Some(v) = config.get("prompt") {
                cfg.prompt = v.clone();
            }
            if let Some(v) = config.get("system") {
                cfg.system = v.clone();
            }
            if let Some(v) = config.get("ram") {
                cfg.ram = v.clone();
            }
            if let Some(v) = config.get("smp") {
                cfg.smp = v.clone();
            }
            if let Some(v) = config.get("virtfs") {
                cfg.virtfs = Some(Utf8PathBuf::from(v));
            }
            if let Some(v) = config.get("options") {
                cfg.options = Some(v.clone());
            }
            if let Some(v) = config.get("serial") {
                cfg.serial = match v.as_str() {
                    "isa" => SerialKind::Isa,
                    "virtio" => SerialKind::VirtIo,
                    other => return Err(CliError::Usage(format!("unknown serial kind for qemu: {other}"))),
                };
            }
            Ok(Arc::new(QemuSut::new(cfg)))
        }
        "ltx" => {
            reject_unknown_keys(name, config, &["tool", "args"])?;
            let mut cfg = LtxConfig::default();
            if let Some(v) = config.get("tool") {
                cfg.tool = Utf8PathBuf::from(v);
            }
            if let Some(v) = config.get("args") {
                cfg.args = shell_words::split(v).map_err(|err| CliError::Usage(err.to_string()))?;
            }
            Ok(Arc::new(LtxSut::new(cfg)))
        }
        other => Err(CliError::Usage(format!(
            "unknown SUT '{other}' (known: host, ssh, qemu, ltx)"
        ))),
    }
}

fn build_framework(name: &str, config: &BTreeMap<String, String>) -> Result<Arc<dyn Framework>, CliError> {
    match name {
        "ltp" => {
            reject_unknown_keys(name, config, &["root", "max_runtime", "env"])?;
            let mut cfg = LtpConfig::default();
            if let Some(v) = config.get("root") {
                cfg.root = Utf8PathBuf::from(v);
            }
            if let Some(v) = config.get("max_runtime") {
                cfg.max_runtime = Some(parse_field(name, "max_runtime", v)?);
            }
            for (key, value) in config {
                if key != "root" && key != "max_runtime" {
                    cfg.env.insert(key.clone(), value.clone());
                }
            }
            Ok(Arc::new(LtpFramework::new(cfg)))
        }
        "kselftest" => {
            reject_unknown_keys(name, config, &["root"])?;
            let mut cfg = KselftestConfig::default();
            if let Some(v) = config.get("root") {
                cfg.root = Utf8PathBuf::from(v);
            }
            Ok(Arc::new(KselftestFramework::new(cfg)))
        }
        "liburing" => {
            reject_unknown_keys(name, config, &["root"])?;
            let mut cfg = LiburingConfig::default();
            if let Some(v) = config.get("root") {
                cfg.root = Utf8PathBuf::from(v);
            }
            Ok(Arc::new(LiburingFramework::new(cfg)))
        }
        other => Err(CliError::Usage(format!(
            "unknown framework '{other}' (known: ltp, kselftest, liburing)"
        ))),
    }
}

/// `ltp`'s config absorbs arbitrary extra keys as environment overrides, so only `ssh`/`qemu`/
/// `ltx`/`kselftest`/`liburing` reject unrecognized keys outright.
fn reject_unknown_keys(name: &str, config: &BTreeMap<String, String>, known: &[&str]) -> Result<(), CliError> {
    if name == "ltp" {
        return Ok(());
    }
    for key in config.keys() {
        if !known.contains(&key.as_str()) {
            return Err(CliError::Usage(format!(
                "unknown parameter '{key}' for '{name}' (known: {})",
                known.join(", ")
            )));
        }
    }
    Ok(())
}

fn parse_field<T: std::str::FromStr>(plugin: &str, key: &str, value: &str) -> Result<T, CliError> {
    value
        .parse()
        .map_err(|_| CliError::Usage(format!("invalid value for '{plugin}:{key}': {value}")))
}

fn parse_bool(plugin: &str, key: &str, value: &str) -> Result<bool, CliError> {
    match value {
        "0" | "false" => Ok(false),
        "1" | "true" => Ok(true),
        other => Err(CliError::Usage(format!("invalid boolean for '{plugin}:{key}': {other}"))),
    }
}

/// Subscribes a terminal reporter matching the verbosity the original driver picks between a
/// simple one-line-per-test view, a verbose streaming view, and a worker-id-tagged view.
fn install_reporter(events: &EventBus, verbose: bool, no_colors: bool, workers: usize) {
    let parallel = workers > 1;

    events.register("suite_started", "reporter", true, move |event| async move {
        if let KirkEvent::SuiteStarted { suite } = event {
            println!("{}", style_heading(&format!("Starting suite: {}", suite.name), no_colors));
        }
        Ok(())
    });

    events.register("test_started", "reporter", true, move |event| async move {
        if let KirkEvent::TestStarted { test } = event {
            if parallel {
                println!("{}", test.name());
            } else {
                print!("{:<40}", test.name());
            }
        }
        Ok(())
    });

    events.register("test_stdout", "reporter", true, move |event| async move {
        if verbose {
            if let KirkEvent::TestStdout { data, .. } = event {
                print!("{data}");
            }
        }
        Ok(())
    });

    events.register("test_completed", "reporter", true, move |event| async move {
        if let KirkEvent::TestCompleted { result } = event {
            let status = style_status(result.status().as_str(), no_colors);
            if parallel {
                println!("{}: {status}", result.test().name());
            } else {
                println!("{status}");
            }
        }
        Ok(())
    });

    events.register("suite_completed", "reporter", true, move |event| async move {
        if let KirkEvent::SuiteCompleted { result, exec_time } = event {
            println!(
                "Suite {} completed in {exec_time:.2}s: {} passed, {} failed, {} broken, {} skipped",
                result.suite_name,
                result.passed(),
                result.failed(),
                result.broken(),
                result.skipped(),
            );
        }
        Ok(())
    });

    events.register("kernel_panic", "reporter", true, move |_event| async move {
        eprintln!("{}", style_heading("kernel panic detected, rebooting SUT", no_colors));
        Ok(())
    });

    events.register("kernel_tainted", "reporter", true, move |event| async move {
        if let KirkEvent::KernelTainted { messages } = event {
            eprintln!("kernel tainted: {}", messages.join(", "));
        }
        Ok(())
    });

    events.register("session_warning", "reporter", true, move |event| async move {
        if let KirkEvent::SessionWarning { message } = event {
            eprintln!("warning: {message}");
        }
        Ok(())
    });

    events.register("session_error", "reporter", true, move |event| async move {
        if let KirkEvent::SessionError { message } = event {
            eprintln!("error: {message}");
        }
        Ok(())
    });

    events.register("internal_error", "reporter", true, move |event| async move {
        if let KirkEvent::InternalError { message, callback_name } = event {
            eprintln!("internal error in '{callback_name}': {message}");
        }
        Ok(())
    });
}

fn style_heading(text: &str, no_colors: bool) -> String {
    if no_colors {
        text.to_string()
    } else {
        format!("\x1b[1m{text}\x1b[0m")
    }
}

fn style_status(status: &str, no_colors: bool) -> String {
    if no_colors {
        return status.to_string();
    }
    match status {
        "pass" => format!("\x1b[32m{status}\x1b[0m"),
        "fail" => format!("\x1b[31m{status}\x1b[0m"),
        "brok" => format!("\x1b[33m{status}\x1b[0m"),
        _ => status.to_string(),
    }
}
