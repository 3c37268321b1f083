//! DAG-driven scheduling: ready tasks flow through the shared queue to a
//! pool of symmetric worker threads; completions propagate readiness or
//! dependency failure to the successors.

use crate::graph::{self, TaskGraph};
use crate::queue::Queue;

use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use arbiter_protocol::{JudgeResult, Status, Submission};
use tracing::{debug, info, warn};

const POP_TIMEOUT: Duration = Duration::from_millis(100);

/// Executes one task of a submission. Production uses
/// [`crate::ProgrammingJudger`]; tests substitute scripted outcomes.
pub trait Judger: Send + Sync + 'static {
    fn judge(&self, submission: &Submission, index: usize) -> JudgeResult;
}

/// Receives results as they land and the terminal callback once the
/// result list is fully populated.
pub trait ResultSink: Send + Sync {
    fn task_finished(&self, _submission: &Submission, _index: usize, _result: &JudgeResult) {}

    fn submission_finished(&self, submission: &Submission, results: &[JudgeResult]);
}

/// A (submission handle, task index) pair; the unit the queue carries.
pub struct ClientTask {
    pub submission: Arc<SubmissionJob>,
    pub index: usize,
}

struct JobState {
    statuses: Vec<Status>,
    results: Vec<Option<JudgeResult>>,
    remaining: usize,
}

/// A submission in flight: the immutable task list plus the mutable
/// per-task state behind one mutex.
pub struct SubmissionJob {
    submission: Submission,
    graph: TaskGraph,
    sink: Box<dyn ResultSink>,
    state: Mutex<JobState>,
}

impl SubmissionJob {
    /// Validates the task graph; a malformed graph rejects the whole
    /// submission before any task runs.
    pub fn new(submission: Submission, sink: Box<dyn ResultSink>) -> Result<Arc<Self>> {
        let graph = graph::build(&submission.tasks)?;

        for (index, task) in submission.tasks.iter().enumerate() {
            if let Some(testcase_id) = task.testcase_id {
                anyhow::ensure!(
                    testcase_id < submission.test_data.len(),
                    "task {}: testcase_id {} is out of range",
                    index,
                    testcase_id
                );
            }
        }

        let count = submission.tasks.len();
        Ok(Arc::new(Self {
            submission,
            graph,
            sink,
            state: Mutex::new(JobState {
                statuses: vec![Status::Pending; count],
                results: vec![None; count],
                remaining: count,
            }),
        }))
    }

    pub fn submission(&self) -> &Submission {
        &self.submission
    }

    pub fn status_of(&self, index: usize) -> Status {
        self.lock_state().statuses[index]
    }

    pub fn is_done(&self) -> bool {
        self.lock_state().remaining == 0
    }

    /// Snapshot of the result list; terminal entries only.
    pub fn results(&self) -> Vec<Option<JudgeResult>> {
        self.lock_state().results.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, JobState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Enqueues every initially-ready task (those without a predecessor).
pub fn push_submission(queue: &Queue<ClientTask>, job: Arc<SubmissionJob>) {
    info!(sub_id = %job.submission.sub_id, tasks = job.graph.len(), "submission pushed");

    if job.submission.tasks.is_empty() {
        job.sink.submission_finished(&job.submission, &[]);
        return;
    }

    for &index in job.graph.roots() {
        queue.push(ClientTask {
            submission: job.clone(),
            index,
        });
    }
}

/// Drains the queue on the calling thread. Tasks made ready by a
/// completion are picked up in the same loop, so a single call judges a
/// whole submission.
pub fn worker_loop(judger: &dyn Judger, queue: &Queue<ClientTask>) {
    while let Some(task) = queue.try_pop() {
        execute(judger, queue, task);
    }
}

fn execute(judger: &dyn Judger, queue: &Queue<ClientTask>, task: ClientTask) {
    let job = task.submission;
    let index = task.index;

    job.lock_state().statuses[index] = Status::Running;
    debug!(sub_id = %job.submission.sub_id, index, "judging task");

    let result = judger.judge(&job.submission, index);

    let mut ready = Vec::new();
    let finished = {
        let mut state = job.lock_state();
        record_result(&mut state, &job, index, result, &mut ready);
        state.remaining == 0
    };

    // enqueue outside the lock: a full queue must not block completions
    for index in ready {
        queue.push(ClientTask {
            submission: job.clone(),
            index,
        });
    }

    if finished {
        let results: Vec<JudgeResult> = {
            let state = job.lock_state();
            state.results.iter().flatten().cloned().collect()
        };
        info!(sub_id = %job.submission.sub_id, "submission finished");
        job.sink.submission_finished(&job.submission, &results);
    }
}

fn record_result(
    state: &mut JobState,
    job: &SubmissionJob,
    index: usize,
    result: JudgeResult,
    ready: &mut Vec<usize>,
) {
    let status = result.status;
    state.statuses[index] = status;
    job.sink.task_finished(&job.submission, index, &result);
    state.results[index] = Some(result);
    state.remaining -= 1;

    for &child in job.graph.children(index) {
        let cond = job.submission.tasks[child].depends_cond;
        if cond.is_satisfied_by(status) {
            ready.push(child);
        } else {
            fail_subtree(state, job, child);
        }
    }
}

/// Resolves a task and its whole successor subtree without any sandbox
/// work.
fn fail_subtree(state: &mut JobState, job: &SubmissionJob, root: usize) {
    let mut stack = vec![root];
    while let Some(index) = stack.pop() {
        warn!(sub_id = %job.submission.sub_id, index, "dependency not satisfied");
        state.statuses[index] = Status::DependencyNotSatisfied;
        let result = JudgeResult::from_status(Status::DependencyNotSatisfied);
        job.sink.task_finished(&job.submission, index, &result);
        state.results[index] = Some(result);
        state.remaining -= 1;
        stack.extend_from_slice(job.graph.children(index));
    }
}

/// The worker pool: N symmetric OS threads sharing the bounded FIFO.
pub struct Orchestrator {
    queue: Arc<Queue<ClientTask>>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    pub fn new(judger: Arc<dyn Judger>, workers: usize, queue_capacity: usize) -> Self {
        let queue = Arc::new(Queue::bounded(queue_capacity));
        let running = Arc::new(AtomicBool::new(true));

        let handles = (0..workers)
            .map(|id| {
                let judger = judger.clone();
                let queue = queue.clone();
                let running = running.clone();
                thread::Builder::new()
                    .name(format!("judge-worker-{}", id))
                    .spawn(move || {
                        while running.load(SeqCst) {
                            if let Some(task) = queue.pop_timeout(POP_TIMEOUT) {
                                execute(&*judger, &queue, task);
                            }
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        info!(workers, "worker pool started");
        Self {
            queue,
            running,
            workers: handles,
        }
    }

    pub fn submit(
        &self,
        submission: Submission,
        sink: Box<dyn ResultSink>,
    ) -> Result<Arc<SubmissionJob>> {
        let job = SubmissionJob::new(submission, sink).context("submission rejected")?;
        push_submission(&self.queue, job.clone());
        Ok(job)
    }

    /// Stops the pool once the in-flight tasks are done. Queued work is
    /// abandoned; judging does not survive a shutdown.
    pub fn shutdown(mut self) {
        self.running.store(false, SeqCst);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
