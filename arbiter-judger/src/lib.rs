#![deny(clippy::all)]

pub mod checker;
pub mod config;
pub mod exec;
pub mod graph;
pub mod orchestrator;
pub mod queue;

pub use self::config::Config;
pub use self::exec::ProgrammingJudger;
pub use self::orchestrator::{
    push_submission, worker_loop, ClientTask, Judger, Orchestrator, ResultSink, SubmissionJob,
};
