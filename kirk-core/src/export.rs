//! JSON report export.

use async_trait::async_trait;
use camino::Utf8Path;
use serde::Serialize;

use crate::errors::ExporterError;
use crate::results::SuiteResult;

#[async_trait]
pub trait Exporter: Send + Sync {
    async fn save_file(&self, results: &[SuiteResult], path: &Utf8Path) -> Result<(), ExporterError>;
}

#[derive(Serialize)]
struct TestReport {
    test_fqn: String,
    status: &'static str,
    test: TestDetail,
}

#[derive(Serialize)]
struct TestDetail {
    command: String,
    arguments: Vec<String>,
    log: String,
    retval: Vec<String>,
    duration: f64,
    failed: u32,
    passed: u32,
    broken: u32,
    skipped: u32,
    warnings: u32,
    result: &'static str,
}

#[derive(Serialize)]
struct Stats {
    runtime: f64,
    passed: u32,
    failed: u32,
    broken: u32,
    skipped: u32,
    warnings: u32,
}

#[derive(Serialize)]
struct Environment {
    distribution: String,
    distribution_version: String,
    kernel: String,
    arch: String,
    cpu: String,
    swap: String,
    #[serde(rename = "RAM")]
    ram: String,
}

#[derive(Serialize)]
struct Report {
    results: Vec<TestReport>,
    stats: Stats,
    environment: Environment,
}

/// Writes every test in `results` as one flat JSON array plus aggregate stats and the SUT
/// snapshot taken from the first suite. Refuses to overwrite an existing file.
pub struct JsonExporter;

impl JsonExporter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JsonExporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exporter for JsonExporter {
    async fn save_file(&self, results: &[SuiteResult], path: &Utf8Path) -> Result<(), ExporterError> {
        if results.is_empty() {
            return Err(ExporterError::NoResults);
        }
        if path.exists() {
            return Err(ExporterError::AlreadyExists(path.to_path_buf()));
        }

        tracing::info!(%path, "exporting JSON report");

        let mut test_reports = Vec::new();
        for suite in results {
            for test_result in &suite.tests {
                let status = test_result.status().as_str();
                test_reports.push(TestReport {
                    test_fqn: test_result.test().name().to_string(),
                    status,
                    test: TestDetail {
                        command: test_result.test().command().to_string(),
                        arguments: test_result.test().arguments().to_vec(),
                        log: test_result.stdout().to_string(),
                        retval: vec![test_result.return_code().to_string()],
                        duration: test_result.exec_time(),
                        failed: test_result.failed(),
                        passed: test_result.passed(),
                        broken: test_result.broken(),
                        skipped: test_result.skipped(),
                        warnings: test_result.warnings(),
                        result: status,
                    },
                });
            }
        }

        let stats = Stats {
            runtime: results.iter().map(SuiteResult::exec_time).sum(),
            passed: results.iter().map(SuiteResult::passed).sum(),
            failed: results.iter().map(SuiteResult::failed).sum(),
            broken: results.iter().map(SuiteResult::broken).sum(),
            skipped: results.iter().map(SuiteResult::skipped).sum(),
            warnings: results.iter().map(SuiteResult::warnings).sum(),
        };

        let info = &results[0].info;
        let environment = Environment {
            distribution: info.distro.clone(),
            distribution_version: info.distro_ver.clone(),
            kernel: info.kernel.clone(),
            arch: info.arch.clone(),
            cpu: info.cpu.clone(),
            swap: info.swap.clone(),
            ram: info.ram.clone(),
        };

        let report = Report {
            results: test_reports,
            stats,
            environment,
        };

        let text = serde_json::to_string_pretty(&report)?;
        crate::async_file::AsyncFile::scoped(path, crate::async_file::FileMode::Write, |f| async move {
            f.write(&text).await
        })
        .await?;

        tracing::info!("report exported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Suite, Test};
    use crate::results::{ResultStatus, SutInfo, TestCounts, TestResult};

    #[tokio::test]
    async fn save_file_rejects_empty_results() {
        let exporter = JsonExporter::new();
        let err = exporter.save_file(&[], Utf8Path::new("/tmp/doesnt-matter.json")).await.unwrap_err();
        assert!(matches!(err, ExporterError::NoResults));
    }

    #[tokio::test]
    async fn save_file_rejects_existing_path() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        std::fs::write(&path, "{}").unwrap();

        let suite = Suite::new("s", vec![]);
        let result = crate::results::SuiteResult::new(&suite, vec![], SutInfo::default());

        let exporter = JsonExporter::new();
        let err = exporter.save_file(&[result], &path).await.unwrap_err();
        assert!(matches!(err, ExporterError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn save_file_writes_stats_and_environment() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        let test = Test::new("t1", "true");
        let tr = TestResult::new(
            test,
            TestCounts {
                passed: 1,
                ..Default::default()
            },
            0.5,
            ResultStatus::Pass,
            0,
            "ok\n".to_string(),
        );
        let suite = Suite::new("s", vec![]);
        let mut info = SutInfo::default();
        info.distro = "debian".to_string();
        let suite_result = crate::results::SuiteResult::new(&suite, vec![tr], info);

        let exporter = JsonExporter::new();
        exporter.save_file(&[suite_result], &path).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["stats"]["passed"], 1);
        assert_eq!(value["environment"]["distribution"], "debian");
        assert_eq!(value["results"][0]["test_fqn"], "t1");
    }
}
