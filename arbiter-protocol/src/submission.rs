use crate::status::Status;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named blob consumed read-only by the judge core.
///
/// The `name` is the destination filename inside a sandbox working
/// directory. Remote assets must be materialized by the caller's cache
/// before judging starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Asset {
    Text {
        name: String,
        content: String,
    },
    File {
        name: String,
        path: PathBuf,
    },
    Remote {
        name: String,
        url: String,
        hashsum: Option<String>,
    },
}

impl Asset {
    pub fn name(&self) -> &str {
        match self {
            Asset::Text { name, .. } => name,
            Asset::File { name, .. } => name,
            Asset::Remote { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCode {
    pub language: String,
    pub files: Vec<Asset>,
    /// Index into `files` of the entry file, if one is designated.
    pub entry: Option<usize>,
}

/// Inputs and expected outputs of one test case, identified by its
/// position in the submission's test-case list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestCaseData {
    pub inputs: Vec<Asset>,
    pub outputs: Vec<Asset>,
}

/// Gate deciding whether a successor task runs once its predecessor is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCondition {
    Accepted,
    PartialCorrect,
    NonTimeLimit,
}

impl DependencyCondition {
    pub fn is_satisfied_by(self, status: Status) -> bool {
        match self {
            DependencyCondition::Accepted => status == Status::Accepted,
            DependencyCondition::PartialCorrect => {
                matches!(status, Status::Accepted | Status::PartiallyAccepted)
            }
            DependencyCondition::NonTimeLimit => status != Status::TimeLimitExceeded,
        }
    }
}

fn default_proc_limit() -> i64 {
    -1
}

/// One node of a submission's task DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeTask {
    pub check_script: String,

    #[serde(default)]
    pub run_script: Option<String>,

    #[serde(default)]
    pub compare_script: Option<String>,

    /// Index into the submission's test-case list; absent for tasks that
    /// are not bound to one test case (e.g. the compile task).
    #[serde(default)]
    pub testcase_id: Option<usize>,

    /// Index of the predecessor task. Must refer to an earlier index.
    #[serde(default)]
    pub depends_on: Option<usize>,

    #[serde(default = "JudgeTask::default_depends_cond")]
    pub depends_cond: DependencyCondition,

    /// CPU time limit in seconds, possibly fractional.
    pub time_limit: f64,

    /// Memory limit in KiB.
    pub memory_limit: u64,

    /// Per-file output cap in KiB.
    pub file_limit: u64,

    /// Process-count limit; -1 means unbounded.
    #[serde(default = "default_proc_limit")]
    pub proc_limit: i64,

    /// Marks tasks whose output is non-deterministic.
    #[serde(default)]
    pub is_random: bool,
}

impl JudgeTask {
    fn default_depends_cond() -> DependencyCondition {
        DependencyCondition::Accepted
    }
}

/// The unit of work handed to the orchestrator.
///
/// The core borrows the submission for the duration of judging and
/// reports results through a result sink; it never mutates the
/// submission itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub category: String,
    pub prob_id: String,
    pub sub_id: String,
    pub updated_at: DateTime<Utc>,
    pub source: SourceCode,
    pub test_data: Vec<TestCaseData>,
    pub tasks: Vec<JudgeTask>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_conditions() {
        use DependencyCondition::*;

        assert!(Accepted.is_satisfied_by(Status::Accepted));
        assert!(!Accepted.is_satisfied_by(Status::PartiallyAccepted));
        assert!(!Accepted.is_satisfied_by(Status::WrongAnswer));

        assert!(PartialCorrect.is_satisfied_by(Status::Accepted));
        assert!(PartialCorrect.is_satisfied_by(Status::PartiallyAccepted));
        assert!(!PartialCorrect.is_satisfied_by(Status::WrongAnswer));

        assert!(NonTimeLimit.is_satisfied_by(Status::WrongAnswer));
        assert!(NonTimeLimit.is_satisfied_by(Status::MemoryLimitExceeded));
        assert!(NonTimeLimit.is_satisfied_by(Status::RuntimeError));
        assert!(!NonTimeLimit.is_satisfied_by(Status::TimeLimitExceeded));
    }

    #[test]
    fn task_defaults() {
        let task: JudgeTask = serde_json::from_str(
            r#"{
                "check_script": "compile",
                "time_limit": 10.0,
                "memory_limit": 262144,
                "file_limit": 32768
            }"#,
        )
        .unwrap();

        assert!(task.run_script.is_none());
        assert!(task.testcase_id.is_none());
        assert!(task.depends_on.is_none());
        assert_eq!(task.depends_cond, DependencyCondition::Accepted);
        assert_eq!(task.proc_limit, -1);
        assert!(!task.is_random);
    }
}
