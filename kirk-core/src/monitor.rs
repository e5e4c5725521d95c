//! Optional JSON-lines event monitor: appends one line per subscribed event to a file, for
//! external tooling that wants to tail a run rather than wait for the final report.

use camino::Utf8PathBuf;
use serde_json::{json, Value};

use crate::async_file::{AsyncFile, FileMode};
use crate::event_bus::{EventBus, KirkEvent};

const MONITORED_EVENTS: &[&str] = &[
    "session_restore",
    "session_started",
    "session_stopped",
    "session_warning",
    "session_error",
    "sut_stdout",
    "sut_start",
    "sut_stop",
    "sut_restart",
    "sut_not_responding",
    "run_cmd_start",
    "run_cmd_stop",
    "test_started",
    "test_completed",
    "suite_started",
    "suite_completed",
    "suite_timeout",
    "kernel_panic",
    "kernel_tainted",
];

/// Redirects a fixed subset of [`KirkEvent`]s to a file, one JSON object per line.
pub struct JsonMonitor {
    file: AsyncFile,
}

impl JsonMonitor {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            file: AsyncFile::new(path, FileMode::Append),
        }
    }

    /// Subscribes to every event in [`MONITORED_EVENTS`], opening the target file lazily on
    /// the first write. Each subscriber is registered `ordered` so lines land in fire order.
    pub fn attach(self: std::sync::Arc<Self>, events: &EventBus) {
        for name in MONITORED_EVENTS {
            let monitor = self.clone();
            events.register(name, "json_monitor", true, move |event| {
                let monitor = monitor.clone();
                async move { monitor.write_event(event).await }
            });
        }
    }

    async fn write_event(&self, event: KirkEvent) -> Result<(), String> {
        let payload = to_json(&event);
        let line = format!("{payload}\n");

        self.file.open().await.map_err(|err| err.to_string())?;
        self.file.write(&line).await.map_err(|err| err.to_string())
    }
}

fn to_json(event: &KirkEvent) -> Value {
    let kind = event.kind_name();
    let data = match event {
        KirkEvent::SessionRestore { path } => json!({ "path": path }),
        KirkEvent::SessionStarted { tmpdir } => json!({ "tmpdir": tmpdir }),
        KirkEvent::SessionStopped => json!({}),
        KirkEvent::SessionWarning { message } => json!({ "message": message }),
        KirkEvent::SessionError { message } => json!({ "message": message }),
        KirkEvent::SutStdout { name, data } => json!({ "name": name, "data": data }),
        KirkEvent::SutStart { name } => json!({ "name": name }),
        KirkEvent::SutStop { name } => json!({ "name": name }),
        KirkEvent::SutRestart { name } => json!({ "name": name }),
        KirkEvent::SutNotResponding => json!({}),
        KirkEvent::RunCmdStart { command } => json!({ "command": command }),
        KirkEvent::RunCmdStop { command, stdout, return_code } => {
            json!({ "command": command, "stdout": stdout, "return_code": return_code })
        }
        KirkEvent::TestStarted { test } => json!({ "test": test.name() }),
        KirkEvent::TestCompleted { result } => json!({
            "test": result.test().name(),
            "status": result.status().as_str(),
            "return_code": result.return_code(),
            "exec_time": result.exec_time(),
        }),
        KirkEvent::SuiteStarted { suite } => json!({ "suite": suite.name }),
        KirkEvent::SuiteCompleted { result, exec_time } => json!({
            "suite": result.suite_name,
            "exec_time": exec_time,
            "passed": result.passed(),
            "failed": result.failed(),
            "broken": result.broken(),
            "skipped": result.skipped(),
        }),
        KirkEvent::SuiteTimeout { suite_name, timeout_secs } => {
            json!({ "suite": suite_name, "timeout_secs": timeout_secs })
        }
        KirkEvent::KernelPanic => json!({}),
        KirkEvent::KernelTainted { messages } => json!({ "messages": messages }),
        KirkEvent::SessionCompleted { .. } | KirkEvent::TestStdout { .. } | KirkEvent::InternalError { .. } => {
            json!({})
        }
    };

    json!({ "event": kind, "data": data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Suite;

    #[tokio::test]
    async fn writes_one_json_line_per_monitored_event() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from(dir.path().join("monitor.jsonl").as_str());

        let bus = EventBus::new();
        let monitor = std::sync::Arc::new(JsonMonitor::new(path.clone()));
        monitor.attach(&bus);

        let consumer = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start().await }
        });

        bus.fire(KirkEvent::SuiteStarted { suite: Suite::new("s", vec![]) });
        bus.fire(KirkEvent::SessionWarning { message: "careful".to_string() });
        bus.stop().await;
        consumer.await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "suite_started");
        assert_eq!(first["data"]["suite"], "s");
    }

    #[tokio::test]
    async fn unmonitored_events_are_ignored() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from(dir.path().join("monitor.jsonl").as_str());

        let bus = EventBus::new();
        let monitor = std::sync::Arc::new(JsonMonitor::new(path.clone()));
        monitor.attach(&bus);

        let consumer = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start().await }
        });

        bus.fire(KirkEvent::TestStdout { test_name: "t".to_string(), data: "x".to_string() });
        bus.stop().await;
        consumer.await.unwrap();

        assert!(!path.exists());
    }
}
