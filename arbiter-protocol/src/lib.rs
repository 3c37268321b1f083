#![deny(clippy::all)]

mod status;
mod submission;

pub use self::status::{JudgeResult, Status};
pub use self::submission::{
    Asset, DependencyCondition, JudgeTask, SourceCode, Submission, TestCaseData,
};
