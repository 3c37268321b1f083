use serde::{Deserialize, Serialize};

/// Closed set of per-task verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Running,
    Accepted,
    PartiallyAccepted,
    WrongAnswer,
    PresentationError,
    CompilationError,
    RuntimeError,
    SegmentationFault,
    FloatingPointError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    /// The program issued a syscall denied by the seccomp policy.
    RestrictFunction,
    DependencyNotSatisfied,
    SystemError,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Pending | Status::Running)
    }
}

/// Outcome of one judge task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeResult {
    pub status: Status,

    /// Wall-clock time in seconds.
    pub wall_time: f64,

    /// CPU time in seconds.
    pub cpu_time: f64,

    /// Peak memory in KiB.
    pub memory: u64,

    pub exit_code: i32,

    /// Terminating signal, if the program was signaled.
    pub signal: Option<i32>,

    pub stdout: String,
    pub stderr: String,

    /// Free-form report from the compare script.
    pub report: Option<String>,

    /// Free-form score emitted by a partial-correct verdict.
    pub score: Option<String>,
}

impl JudgeResult {
    pub fn from_status(status: Status) -> Self {
        Self {
            status,
            wall_time: 0.0,
            cpu_time: 0.0,
            memory: 0,
            exit_code: 0,
            signal: None,
            stdout: String::new(),
            stderr: String::new(),
            report: None,
            score: None,
        }
    }
}
