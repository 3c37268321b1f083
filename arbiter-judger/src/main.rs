use arbiter_judger::{Config, Orchestrator, ProgrammingJudger, ResultSink};
use arbiter_protocol::{JudgeResult, Submission};
use arbiter_utils::tracing::setup_tracing;

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use dotenv::dotenv;
use structopt::StructOpt;
use tracing::info;

/// Judges one submission described by a JSON file and prints the result
/// list. The long-running intake transport lives outside this binary.
#[derive(Debug, StructOpt)]
struct Opt {
    #[structopt(long, default_value = "arbiter-judger.toml")]
    config: PathBuf,

    submission: PathBuf,
}

struct ChannelSink {
    tx: Sender<Vec<JudgeResult>>,
}

impl ResultSink for ChannelSink {
    fn task_finished(&self, submission: &Submission, index: usize, result: &JudgeResult) {
        info!(sub_id = %submission.sub_id, index, status = ?result.status, "task finished");
    }

    fn submission_finished(&self, _submission: &Submission, results: &[JudgeResult]) {
        let _ = self.tx.send(results.to_vec());
    }
}

fn main() -> Result<()> {
    dotenv().ok();
    setup_tracing();

    let opt = Opt::from_args();

    info!("loading config from {}", opt.config.display());
    let config = Arc::new(Config::from_file(&opt.config)?);

    let submission: Submission = serde_json::from_reader(
        File::open(&opt.submission)
            .with_context(|| format!("failed to open {}", opt.submission.display()))?,
    )
    .context("malformed submission")?;

    let judger = Arc::new(ProgrammingJudger::new(config.clone()));
    let orchestrator = Orchestrator::new(judger, config.worker_count(), config.judger.queue_capacity);

    let (tx, rx) = crossbeam_channel::bounded(1);
    orchestrator.submit(submission, Box::new(ChannelSink { tx }))?;

    let results = rx.recv().context("judging aborted")?;
    orchestrator.shutdown();

    serde_json::to_writer_pretty(io::stdout().lock(), &results)?;
    println!();
    Ok(())
}
