//! Per-task execution: materializes the sandbox working directory,
//! drives the checker scripts, and maps the runguard meta report onto
//! the status taxonomy.

use crate::checker::{self, CompareVerdict, ScriptEnv, ScriptKind};
use crate::orchestrator::Judger;
use crate::Config;

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arbiter_protocol::{Asset, JudgeResult, Status, Submission};
use arbiter_runguard::meta::{self, ExecutionReport, MemoryResult};
use tracing::{debug, error, warn};

const EXCERPT_LIMIT: usize = 4096;

pub struct ProgrammingJudger {
    config: Arc<Config>,
}

impl ProgrammingJudger {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl Judger for ProgrammingJudger {
    fn judge(&self, submission: &Submission, index: usize) -> JudgeResult {
        match self.judge_task(submission, index) {
            Ok(result) => result,
            Err(err) => {
                // fatal for this task only; the worker moves on
                error!(sub_id = %submission.sub_id, index, "task failed: {:#}", err);
                let mut result = JudgeResult::from_status(Status::SystemError);
                result.report = Some(format!("{:#}", err));
                result
            }
        }
    }
}

impl ProgrammingJudger {
    fn judge_task(&self, submission: &Submission, index: usize) -> Result<JudgeResult> {
        let task = &submission.tasks[index];
        let config = &self.config;

        let workdir = config
            .judger
            .workspace_root
            .join(&submission.sub_id)
            .join(index.to_string());
        if workdir.exists() {
            fs::remove_dir_all(&workdir).context("failed to clear stale workdir")?;
        }
        fs::create_dir_all(&workdir).context("failed to create workdir")?;

        for asset in &submission.source.files {
            materialize(asset, &workdir)?;
        }

        let data_dir = workdir.join("data");
        fs::create_dir(&data_dir).context("failed to create data dir")?;

        let mut stdin_path = PathBuf::from("/dev/null");
        let mut expected_path = PathBuf::from("/dev/null");
        if let Some(testcase_id) = task.testcase_id {
            let data = submission
                .test_data
                .get(testcase_id)
                .context("testcase_id out of range")?;
            for asset in data.inputs.iter().chain(data.outputs.iter()) {
                materialize(asset, &data_dir)?;
            }
            if let Some(input) = data.inputs.first() {
                stdin_path = data_dir.join(input.name());
            }
            if let Some(output) = data.outputs.first() {
                expected_path = data_dir.join(output.name());
            }
        }

        let chroot_dir = config
            .runguard
            .chroot_dir
            .as_deref()
            .unwrap_or_else(|| Path::new("/"));
        let env = ScriptEnv {
            cache_dir: &config.judger.cache_dir,
            workdir: &workdir,
            chroot_dir,
            data_dir: &data_dir,
            time_limit: task.time_limit,
            memory_limit: task.memory_limit,
            file_limit: task.file_limit,
            runguard: &config.runguard.bin,
            seccomp_policy: config.runguard.seccomp_policy.as_deref(),
            netns: config.runguard.netns.as_deref(),
            user: config.runguard.user,
            group: config.runguard.group,
        };

        // check stage: pre-run validation, typically the compiler
        let check = checker::resolve(&config.judger.script_dir, ScriptKind::Check, &task.check_script);
        let check_out = workdir.join("check.out");
        let check_err = workdir.join("check.err");
        let code = checker::invoke(&check, &env, &[], Some(&check_out), Some(&check_err))?;
        if code != 0 {
            let status = if task.run_script.is_none() {
                Status::CompilationError
            } else {
                Status::SystemError
            };
            debug!(index, code, "check script failed");
            let mut result = JudgeResult::from_status(status);
            result.exit_code = code;
            result.stdout = read_excerpt(&check_out);
            result.stderr = read_excerpt(&check_err);
            return Ok(result);
        }

        let run_script = match task.run_script {
            Some(ref name) => name,
            None => {
                let mut result = JudgeResult::from_status(Status::Accepted);
                result.stdout = read_excerpt(&check_out);
                result.stderr = read_excerpt(&check_err);
                return Ok(result);
            }
        };

        // run stage: the script wraps the runguard CLI and leaves the
        // meta report behind
        let meta_path = workdir.join("runguard.meta");
        let user_out = workdir.join("user.out");
        let user_err = workdir.join("user.err");
        let run = checker::resolve(&config.judger.script_dir, ScriptKind::Run, run_script);
        let code = checker::invoke(
            &run,
            &env,
            &[
                stdin_path.as_os_str(),
                user_out.as_os_str(),
                user_err.as_os_str(),
                meta_path.as_os_str(),
            ],
            None,
            None,
        )?;
        if code != 0 {
            warn!(index, code, "run script failed");
            let mut result = JudgeResult::from_status(Status::SystemError);
            result.exit_code = code;
            return Ok(result);
        }

        let meta_content = fs::read_to_string(&meta_path)
            .with_context(|| format!("failed to read meta file: {}", meta_path.display()))?;
        let report = meta::parse_report(&meta_content);

        let mut result = result_from_report(&report);
        result.stdout = read_excerpt(&user_out);
        result.stderr = read_excerpt(&user_err);

        if let Some(status) = classify_report(&report) {
            result.status = status;
            return Ok(result);
        }

        // compare stage, only after a clean exit
        let compare_script = match task.compare_script {
            Some(ref name) => name,
            None => {
                result.status = Status::Accepted;
                return Ok(result);
            }
        };

        let compare = checker::resolve(&config.judger.script_dir, ScriptKind::Compare, compare_script);
        let verdict_path = workdir.join("compare.out");
        let message_path = workdir.join("compare.msg");
        let code = checker::invoke(
            &compare,
            &env,
            &[
                user_out.as_os_str(),
                expected_path.as_os_str(),
                message_path.as_os_str(),
            ],
            Some(&verdict_path),
            None,
        )?;
        if code != 0 {
            warn!(index, code, "compare script failed");
            result.status = Status::SystemError;
            return Ok(result);
        }

        let verdict_content = fs::read_to_string(&verdict_path)
            .context("failed to read compare verdict")?;
        let compare_report = checker::parse_compare_report(&verdict_content)?;

        result.status = match compare_report.verdict {
            CompareVerdict::Ac => Status::Accepted,
            CompareVerdict::Wa => Status::WrongAnswer,
            CompareVerdict::Pe => Status::PresentationError,
            CompareVerdict::Pc => Status::PartiallyAccepted,
        };
        result.score = compare_report.score;
        result.report = compare_report
            .message
            .or_else(|| match read_excerpt(&message_path) {
                excerpt if excerpt.is_empty() => None,
                excerpt => Some(excerpt),
            });

        Ok(result)
    }
}

fn result_from_report(report: &ExecutionReport) -> JudgeResult {
    let mut result = JudgeResult::from_status(Status::Running);
    result.wall_time = report.wall_time;
    result.cpu_time = report.cpu_time;
    result.memory = report.memory_bytes / 1024;
    result.exit_code = report.exit_code;
    result.signal = report.signal;
    result
}

/// Applies the mapping rules to a meta report. `None` means a clean
/// exit whose verdict is up to the compare stage.
pub fn classify_report(report: &ExecutionReport) -> Option<Status> {
    if report.internal_error.is_some() {
        return Some(Status::SystemError);
    }
    // the OOM flag wins over any signal classification
    if report.memory_result == MemoryResult::Oom {
        return Some(Status::MemoryLimitExceeded);
    }
    if report.time_result.is_exceeded() {
        return Some(Status::TimeLimitExceeded);
    }
    if let Some(signal) = report.signal {
        return Some(match signal {
            libc::SIGSEGV | libc::SIGBUS => Status::SegmentationFault,
            libc::SIGFPE => Status::FloatingPointError,
            libc::SIGSYS => Status::RestrictFunction,
            libc::SIGXFSZ => Status::OutputLimitExceeded,
            _ => Status::RuntimeError,
        });
    }
    if report.exit_code != 0 {
        return Some(Status::RuntimeError);
    }
    None
}

fn materialize(asset: &Asset, dir: &Path) -> Result<PathBuf> {
    let dest = dir.join(asset.name());
    match asset {
        Asset::Text { content, .. } => {
            fs::write(&dest, content)
                .with_context(|| format!("failed to write asset {}", asset.name()))?;
        }
        Asset::File { path, .. } => {
            fs::copy(path, &dest)
                .with_context(|| format!("failed to copy asset {}", asset.name()))?;
        }
        Asset::Remote { .. } => {
            // the asset cache resolves remote blobs before judging
            anyhow::bail!("remote asset {} has not been materialized", asset.name());
        }
    }
    Ok(dest)
}

fn read_excerpt(path: &Path) -> String {
    let mut buf = Vec::new();
    let n = match fs::File::open(path) {
        Ok(file) => file
            .take(EXCERPT_LIMIT as u64 + 1)
            .read_to_end(&mut buf)
            .unwrap_or(0),
        Err(_) => 0,
    };
    buf.truncate(n);
    if buf.len() > EXCERPT_LIMIT {
        buf.truncate(EXCERPT_LIMIT);
        let mut excerpt = String::from_utf8_lossy(&buf).into_owned();
        excerpt.push_str("\n[truncated]");
        excerpt
    } else {
        String::from_utf8_lossy(&buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_runguard::meta::TimeResult;

    #[test]
    fn clean_exit_classifies_as_none() {
        let report = ExecutionReport::default();
        assert_eq!(classify_report(&report), None);
    }

    #[test]
    fn oom_overrides_signal() {
        let report = ExecutionReport {
            signal: Some(libc::SIGKILL),
            memory_result: MemoryResult::Oom,
            ..ExecutionReport::default()
        };
        assert_eq!(classify_report(&report), Some(Status::MemoryLimitExceeded));
    }

    #[test]
    fn time_result_maps_to_tle() {
        for time_result in &[TimeResult::Soft, TimeResult::Hard] {
            let report = ExecutionReport {
                time_result: *time_result,
                signal: Some(libc::SIGKILL),
                ..ExecutionReport::default()
            };
            assert_eq!(classify_report(&report), Some(Status::TimeLimitExceeded));
        }
    }

    #[test]
    fn signals_map_to_statuses() {
        let cases = &[
            (libc::SIGSEGV, Status::SegmentationFault),
            (libc::SIGBUS, Status::SegmentationFault),
            (libc::SIGFPE, Status::FloatingPointError),
            (libc::SIGSYS, Status::RestrictFunction),
            (libc::SIGXFSZ, Status::OutputLimitExceeded),
            (libc::SIGABRT, Status::RuntimeError),
        ];
        for &(signal, status) in cases {
            let report = ExecutionReport {
                signal: Some(signal),
                exit_code: 128 + signal,
                ..ExecutionReport::default()
            };
            assert_eq!(classify_report(&report), Some(status));
        }
    }

    #[test]
    fn nonzero_exit_is_runtime_error() {
        let report = ExecutionReport {
            exit_code: 3,
            ..ExecutionReport::default()
        };
        assert_eq!(classify_report(&report), Some(Status::RuntimeError));
    }

    #[test]
    fn internal_error_is_system_error() {
        let report = ExecutionReport {
            internal_error: Some("fork failed".to_owned()),
            ..ExecutionReport::default()
        };
        assert_eq!(classify_report(&report), Some(Status::SystemError));
    }

    #[test]
    fn excerpt_marks_truncation() {
        let dir = std::env::temp_dir().join(format!("arbiter-excerpt-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let short = dir.join("short");
        fs::write(&short, "all of it").unwrap();
        assert_eq!(read_excerpt(&short), "all of it");

        let long = dir.join("long");
        fs::write(&long, "x".repeat(EXCERPT_LIMIT + 100)).unwrap();
        let excerpt = read_excerpt(&long);
        assert!(excerpt.ends_with("\n[truncated]"));
        assert_eq!(excerpt.len(), EXCERPT_LIMIT + "\n[truncated]".len());

        assert_eq!(read_excerpt(&dir.join("missing")), "");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn materialize_text_asset() {
        let dir = std::env::temp_dir().join(format!("arbiter-exec-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let asset = Asset::Text {
            name: "main.cpp".to_owned(),
            content: "int main() {}".to_owned(),
        };
        let dest = materialize(&asset, &dir).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "int main() {}");

        let remote = Asset::Remote {
            name: "big.in".to_owned(),
            url: "https://example.com/big.in".to_owned(),
            hashsum: None,
        };
        assert!(materialize(&remote, &dir).is_err());

        let _ = fs::remove_dir_all(&dir);
    }
}
