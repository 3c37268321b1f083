//! Meta report: plain-text `key: value` records written by the supervisor
//! and consumed by checker scripts and the orchestrator.

use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;

pub struct MetaFile {
    file: Option<File>,
}

impl MetaFile {
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open meta file: {}", path.display()))?;
                Some(file)
            }
            None => None,
        };
        Ok(Self { file })
    }

    pub fn append(&mut self, key: &str, value: impl Display) {
        if let Some(ref mut file) = self.file {
            if let Err(err) = writeln!(file, "{}: {}", key, value) {
                warn!("failed to append meta record: {}", err);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeResult {
    None,
    Soft,
    Hard,
}

impl TimeResult {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeResult::None => "",
            TimeResult::Soft => "soft-timelimit",
            TimeResult::Hard => "hard-timelimit",
        }
    }

    pub fn is_exceeded(self) -> bool {
        self != TimeResult::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryResult {
    None,
    Oom,
}

impl MemoryResult {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryResult::None => "",
            MemoryResult::Oom => "oom",
        }
    }
}

/// Everything the supervisor reports about one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub wall_time: f64,
    pub user_time: f64,
    pub sys_time: f64,
    pub cpu_time: f64,
    pub memory_bytes: u64,
    pub memory_result: MemoryResult,
    pub time_result: TimeResult,
    pub internal_error: Option<String>,
}

impl Default for ExecutionReport {
    fn default() -> Self {
        Self {
            exit_code: 0,
            signal: None,
            wall_time: 0.0,
            user_time: 0.0,
            sys_time: 0.0,
            cpu_time: 0.0,
            memory_bytes: 0,
            memory_result: MemoryResult::None,
            time_result: TimeResult::None,
            internal_error: None,
        }
    }
}

impl ExecutionReport {
    pub fn write_to(&self, meta: &mut MetaFile) {
        meta.append("memory-bytes", self.memory_bytes);
        meta.append("memory-result", self.memory_result.as_str());
        meta.append("exitcode", self.exit_code);
        if let Some(signal) = self.signal {
            meta.append("signal", signal);
        }
        meta.append("wall-time", format_args!("{:.3}", self.wall_time));
        meta.append("user-time", format_args!("{:.3}", self.user_time));
        meta.append("sys-time", format_args!("{:.3}", self.sys_time));
        meta.append("cpu-time", format_args!("{:.3}", self.cpu_time));
        meta.append("time-result", self.time_result.as_str());
        if let Some(ref err) = self.internal_error {
            meta.append("internal-error", err);
        }
    }
}

/// Parses meta-file content. Unknown keys are ignored; missing numeric
/// keys default to 0; missing string keys default to empty.
pub fn parse_report(content: &str) -> ExecutionReport {
    let mut report = ExecutionReport::default();

    for line in content.lines() {
        let (key, value) = match line.find(':') {
            Some(i) => (&line[..i], line[i + 1..].trim()),
            None => continue,
        };

        match key {
            "exitcode" => report.exit_code = value.parse().unwrap_or(0),
            "signal" => report.signal = value.parse().ok(),
            "wall-time" => report.wall_time = value.parse().unwrap_or(0.0),
            "user-time" => report.user_time = value.parse().unwrap_or(0.0),
            "sys-time" => report.sys_time = value.parse().unwrap_or(0.0),
            "cpu-time" => report.cpu_time = value.parse().unwrap_or(0.0),
            "memory-bytes" => report.memory_bytes = value.parse().unwrap_or(0),
            "memory-result" => {
                report.memory_result = match value {
                    "oom" => MemoryResult::Oom,
                    _ => MemoryResult::None,
                }
            }
            "time-result" => {
                report.time_result = match value {
                    "soft-timelimit" => TimeResult::Soft,
                    "hard-timelimit" => TimeResult::Hard,
                    _ => TimeResult::None,
                }
            }
            "internal-error" => report.internal_error = Some(value.to_owned()),
            _ => {}
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    fn meta_to_string(report: &ExecutionReport) -> String {
        let path = std::env::temp_dir().join(format!(
            "arbiter-meta-{}-{:p}",
            std::process::id(),
            report
        ));
        let _ = fs::remove_file(&path);
        let mut meta = MetaFile::open(Some(path.as_path())).unwrap();
        report.write_to(&mut meta);
        drop(meta);
        let content = fs::read_to_string(&path).unwrap();
        let _ = fs::remove_file(&path);
        content
    }

    #[test]
    fn roundtrip_is_identity() {
        let report = ExecutionReport {
            exit_code: 139,
            signal: Some(11),
            wall_time: 1.25,
            user_time: 0.5,
            sys_time: 0.125,
            cpu_time: 0.625,
            memory_bytes: 1_048_576,
            memory_result: MemoryResult::None,
            time_result: TimeResult::Soft,
            internal_error: None,
        };

        let content = meta_to_string(&report);
        assert_eq!(parse_report(&content), report);
    }

    #[test]
    fn roundtrip_oom() {
        let report = ExecutionReport {
            exit_code: 137,
            signal: Some(9),
            memory_bytes: 33_554_432,
            memory_result: MemoryResult::Oom,
            ..ExecutionReport::default()
        };

        let content = meta_to_string(&report);
        assert_eq!(parse_report(&content), report);
    }

    #[test]
    fn missing_keys_default_to_zero() {
        let report = parse_report("exitcode: 2\n");
        assert_eq!(report.exit_code, 2);
        assert_eq!(report.memory_bytes, 0);
        assert_eq!(report.signal, None);
        assert_eq!(report.memory_result, MemoryResult::None);
        assert_eq!(report.time_result, TimeResult::None);
        assert!((report.wall_time - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let report = parse_report("exitcode: 0\nfuture-key: 42\ntime-result: hard-timelimit\n");
        assert_eq!(report.time_result, TimeResult::Hard);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let report = parse_report("not a record\nexitcode: 3\n");
        assert_eq!(report.exit_code, 3);
    }
}
