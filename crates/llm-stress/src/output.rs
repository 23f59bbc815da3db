// Numan Thabit 2025
use std::{
    fs::{self, OpenOptions},
    io::BufWriter,
    path::Path,
};

use anyhow::{Context, Result};
use serde::Serialize;
use url::Url;
use uuid::Uuid;

use crate::backend::BackendKind;
use crate::config::RunConfig;
use crate::record::TimingRecord;
use crate::report::Report;

/// Everything a finished run persists with `--output-json`.
#[derive(Debug, Serialize)]
pub struct RunOutput<'a> {
    pub run_id: Uuid,
    pub started_at: String,
    pub backend: BackendKind,
    pub endpoint: &'a Url,
    pub concurrency: usize,
    pub rate: f64,
    pub total_requests: usize,
    pub report: &'a Report,
    pub records: &'a [TimingRecord],
}

impl<'a> RunOutput<'a> {
    pub fn new(
        run_id: Uuid,
        started_at: String,
        config: &'a RunConfig,
        report: &'a Report,
        records: &'a [TimingRecord],
    ) -> Self {
        Self {
            run_id,
            started_at,
            backend: config.backend.kind,
            endpoint: &config.backend.endpoint,
            concurrency: config.concurrency,
            rate: config.rate,
            total_requests: config.total_requests,
            report,
            records,
        }
    }
}

pub fn write_json(path: &Path, output: &RunOutput<'_>) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).with_context(|| {
                format!("failed to create output directory {}", dir.display())
            })?;
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("failed to open output path {}", path.display()))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, output)
        .with_context(|| format!("failed to write run output to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::Value;

    use crate::record::Outcome;
    use crate::schedule::Query;

    #[test]
    fn writes_report_and_records_into_nested_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("runs").join("out.json");

        let records = vec![TimingRecord {
            index: 0,
            query: Query::from("hello"),
            scheduled_start: Duration::ZERO,
            send_time: Duration::from_millis(1),
            first_token_time: Some(Duration::from_millis(4)),
            end_time: Duration::from_millis(9),
            outcome: Outcome::Completed,
            events: 2,
            skipped_events: 0,
            response: None,
        }];
        let report = Report::from_records(&records);
        let endpoint = Url::parse("http://127.0.0.1:9001/generate_stream").expect("url");
        let output = RunOutput {
            run_id: Uuid::nil(),
            started_at: "2025-01-01T00:00:00Z".to_string(),
            backend: BackendKind::Generate,
            endpoint: &endpoint,
            concurrency: 1,
            rate: 1.0,
            total_requests: 1,
            report: &report,
            records: &records,
        };

        write_json(&path, &output).expect("write");

        let written: Value =
            serde_json::from_slice(&fs::read(&path).expect("read back")).expect("json");
        assert_eq!(written["backend"], "generate");
        assert_eq!(written["endpoint"], "http://127.0.0.1:9001/generate_stream");
        assert_eq!(written["report"]["requests"], 1);
        assert_eq!(written["records"][0]["query"], "hello");
        assert_eq!(written["records"][0]["first_token_time"], 4.0);
    }
}
