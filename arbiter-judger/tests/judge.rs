//! End-to-end orchestrator semantics driven by a scripted judger: the
//! per-task outcomes are fixed, the scheduling and dependency handling
//! under test are real.

mod common;

use arbiter_judger::queue::Queue;
use arbiter_judger::{push_submission, worker_loop, ClientTask, Judger, Orchestrator, ResultSink, SubmissionJob};
use arbiter_protocol::{
    Asset, DependencyCondition, JudgeResult, JudgeTask, SourceCode, Status, Submission,
    TestCaseData,
};

use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;

fn text_asset(name: &str, content: &str) -> Asset {
    Asset::Text {
        name: name.to_owned(),
        content: content.to_owned(),
    }
}

fn run_task(depends_on: usize, cond: DependencyCondition, testcase_id: usize) -> JudgeTask {
    JudgeTask {
        check_script: "standard-trusted".to_owned(),
        run_script: Some("standard".to_owned()),
        compare_script: Some("diff-all".to_owned()),
        testcase_id: Some(testcase_id),
        depends_on: Some(depends_on),
        depends_cond: cond,
        time_limit: 1.0,
        memory_limit: 32768,
        file_limit: 32768,
        proc_limit: -1,
        is_random: false,
    }
}

fn compile_task() -> JudgeTask {
    JudgeTask {
        check_script: "compile".to_owned(),
        run_script: None,
        compare_script: None,
        testcase_id: None,
        depends_on: None,
        depends_cond: DependencyCondition::Accepted,
        time_limit: 10.0,
        memory_limit: 262144,
        file_limit: 32768,
        proc_limit: -1,
        is_random: false,
    }
}

/// One compile task plus one standard task per test case, the way the
/// intake lowers a typical problem.
fn standard_submission(source: &str) -> Submission {
    let mut tasks = vec![compile_task()];
    for i in 0..2 {
        tasks.push(run_task(0, DependencyCondition::Accepted, i));
    }

    Submission {
        category: "mock".to_owned(),
        prob_id: "1234".to_owned(),
        sub_id: "12340".to_owned(),
        updated_at: Utc::now(),
        source: SourceCode {
            language: "cpp".to_owned(),
            files: vec![text_asset("main.cpp", source)],
            entry: None,
        },
        test_data: vec![
            TestCaseData {
                inputs: vec![text_asset("testdata.in", "1")],
                outputs: vec![text_asset("testdata.out", "1")],
            },
            TestCaseData {
                inputs: vec![text_asset("testdata.in", "2")],
                outputs: vec![text_asset("testdata.out", "2")],
            },
        ],
        tasks,
    }
}

struct ScriptedJudger {
    outcomes: Vec<Status>,
    delay: Duration,
    judged: Mutex<Vec<usize>>,
}

impl ScriptedJudger {
    fn new(outcomes: Vec<Status>) -> Self {
        Self {
            outcomes,
            delay: Duration::from_millis(0),
            judged: Mutex::new(Vec::new()),
        }
    }

    fn with_delay(outcomes: Vec<Status>, delay: Duration) -> Self {
        Self {
            outcomes,
            delay,
            judged: Mutex::new(Vec::new()),
        }
    }

    fn judged(&self) -> Vec<usize> {
        self.judged.lock().unwrap().clone()
    }
}

impl Judger for ScriptedJudger {
    fn judge(&self, _submission: &Submission, index: usize) -> JudgeResult {
        self.judged.lock().unwrap().push(index);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        JudgeResult::from_status(self.outcomes[index])
    }
}

#[derive(Clone, Default)]
struct RecordingSink {
    inner: Arc<SinkState>,
}

#[derive(Default)]
struct SinkState {
    finished: Mutex<Option<Vec<JudgeResult>>>,
    finish_count: AtomicUsize,
}

impl RecordingSink {
    fn finished(&self) -> Option<Vec<JudgeResult>> {
        self.inner.finished.lock().unwrap().clone()
    }

    fn finish_count(&self) -> usize {
        self.inner.finish_count.load(SeqCst)
    }
}

impl ResultSink for RecordingSink {
    fn submission_finished(&self, _submission: &Submission, results: &[JudgeResult]) {
        self.inner.finish_count.fetch_add(1, SeqCst);
        *self.inner.finished.lock().unwrap() = Some(results.to_vec());
    }
}

fn statuses_of(job: &SubmissionJob) -> Vec<Status> {
    job.results()
        .into_iter()
        .map(|r| r.expect("result missing").status)
        .collect()
}

/// Single-threaded drive: push the submission, drain the queue.
fn drive(submission: Submission, outcomes: Vec<Status>) -> (Vec<Status>, Vec<usize>, RecordingSink) {
    common::init();

    let judger = ScriptedJudger::new(outcomes);
    let sink = RecordingSink::default();
    let queue: Queue<ClientTask> = Queue::bounded(64);

    let job = SubmissionJob::new(submission, Box::new(sink.clone())).unwrap();
    push_submission(&queue, job.clone());
    worker_loop(&judger, &queue);

    assert!(job.is_done());
    (statuses_of(&job), judger.judged(), sink)
}

use Status::*;

#[test]
fn accepted_submission() {
    let (statuses, judged, sink) = drive(
        standard_submission("int main() {}"),
        vec![Accepted, Accepted, Accepted],
    );
    assert_eq!(statuses, vec![Accepted, Accepted, Accepted]);
    assert_eq!(judged.len(), 3);
    assert_eq!(sink.finish_count(), 1);
}

#[test]
fn compilation_error_short_circuits_test_cases() {
    let (statuses, judged, _) = drive(
        standard_submission("#include </dev/random>"),
        vec![CompilationError, Accepted, Accepted],
    );
    assert_eq!(
        statuses,
        vec![
            CompilationError,
            DependencyNotSatisfied,
            DependencyNotSatisfied
        ]
    );
    // no sandbox work for the short-circuited tasks
    assert_eq!(judged, vec![0]);
}

#[test]
fn failing_outcomes_reach_every_case() {
    for status in &[
        WrongAnswer,
        PresentationError,
        TimeLimitExceeded,
        MemoryLimitExceeded,
        SegmentationFault,
        FloatingPointError,
        RuntimeError,
        RestrictFunction,
    ] {
        let (statuses, judged, _) = drive(
            standard_submission("int main() { return 1; }"),
            vec![Accepted, *status, *status],
        );
        assert_eq!(statuses, vec![Accepted, *status, *status]);
        assert_eq!(judged.len(), 3);
    }
}

#[test]
fn results_list_parallels_tasks() {
    let submission = standard_submission("int main() {}");
    let task_count = submission.tasks.len();
    let (statuses, _, sink) = drive(submission, vec![Accepted, WrongAnswer, Accepted]);
    assert_eq!(statuses.len(), task_count);
    assert_eq!(sink.finished().unwrap().len(), task_count);
}

#[test]
fn non_time_limit_condition_gates_only_tle() {
    let mut submission = standard_submission("int main() {}");
    // case 1 runs after case 0 unless case 0 timed out
    submission.tasks[2].depends_on = Some(1);
    submission.tasks[2].depends_cond = DependencyCondition::NonTimeLimit;

    let (statuses, judged, _) = drive(
        submission,
        vec![Accepted, TimeLimitExceeded, Accepted],
    );
    assert_eq!(
        statuses,
        vec![Accepted, TimeLimitExceeded, DependencyNotSatisfied]
    );
    assert_eq!(judged, vec![0, 1]);

    // a wrong answer is not a time-limit status and does not gate
    let mut submission = standard_submission("int main() {}");
    submission.tasks[2].depends_on = Some(1);
    submission.tasks[2].depends_cond = DependencyCondition::NonTimeLimit;

    let (statuses, judged, _) = drive(submission, vec![Accepted, WrongAnswer, Accepted]);
    assert_eq!(statuses, vec![Accepted, WrongAnswer, Accepted]);
    assert_eq!(judged, vec![0, 1, 2]);
}

#[test]
fn partial_correct_condition() {
    let mut submission = standard_submission("int main() {}");
    submission.tasks[2].depends_on = Some(1);
    submission.tasks[2].depends_cond = DependencyCondition::PartialCorrect;

    let (statuses, _, _) = drive(
        submission,
        vec![Accepted, PartiallyAccepted, Accepted],
    );
    assert_eq!(statuses, vec![Accepted, PartiallyAccepted, Accepted]);

    let mut submission = standard_submission("int main() {}");
    submission.tasks[2].depends_on = Some(1);
    submission.tasks[2].depends_cond = DependencyCondition::PartialCorrect;

    let (statuses, judged, _) = drive(submission, vec![Accepted, WrongAnswer, Accepted]);
    assert_eq!(
        statuses,
        vec![Accepted, WrongAnswer, DependencyNotSatisfied]
    );
    assert_eq!(judged, vec![0, 1]);
}

#[test]
fn failure_propagates_through_chains() {
    let mut submission = standard_submission("int main() {}");
    // 0 <- 1 <- 2: a mid-chain failure fails the whole tail
    submission.tasks[2].depends_on = Some(1);

    let (statuses, judged, _) = drive(
        submission,
        vec![Accepted, RuntimeError, Accepted],
    );
    assert_eq!(
        statuses,
        vec![Accepted, RuntimeError, DependencyNotSatisfied]
    );
    assert_eq!(judged, vec![0, 1]);
}

#[test]
fn empty_submission_finishes_immediately() {
    common::init();

    let mut submission = standard_submission("int main() {}");
    submission.tasks.clear();

    let sink = RecordingSink::default();
    let queue: Queue<ClientTask> = Queue::bounded(4);
    let job = SubmissionJob::new(submission, Box::new(sink.clone())).unwrap();
    push_submission(&queue, job);

    assert_eq!(sink.finish_count(), 1);
    assert_eq!(sink.finished().unwrap().len(), 0);
}

#[test]
fn rejects_malformed_graphs_before_judging() {
    common::init();

    let mut submission = standard_submission("int main() {}");
    submission.tasks[1].depends_on = Some(5);
    assert!(SubmissionJob::new(submission, Box::new(RecordingSink::default())).is_err());

    let mut submission = standard_submission("int main() {}");
    submission.tasks[1].testcase_id = Some(9);
    assert!(SubmissionJob::new(submission, Box::new(RecordingSink::default())).is_err());
}

#[test]
fn worker_pool_respects_dependency_order() {
    common::init();

    // one compile task fanning out into eight cases
    let mut submission = standard_submission("int main() {}");
    submission.tasks.truncate(1);
    submission.test_data = (0..8)
        .map(|i| TestCaseData {
            inputs: vec![text_asset("testdata.in", &i.to_string())],
            outputs: vec![text_asset("testdata.out", &i.to_string())],
        })
        .collect();
    for i in 0..8 {
        submission
            .tasks
            .push(run_task(0, DependencyCondition::Accepted, i));
    }

    let outcomes = vec![Accepted; 9];
    let judger = Arc::new(ScriptedJudger::with_delay(
        outcomes,
        Duration::from_millis(5),
    ));
    let sink = RecordingSink::default();

    let orchestrator = Orchestrator::new(judger.clone(), 4, 16);
    let job = orchestrator
        .submit(
            submission,
            Box::new(sink.clone()),
        )
        .unwrap();

    // the terminal callback fires exactly once when all results landed
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while sink.finish_count() == 0 {
        assert!(std::time::Instant::now() < deadline, "judging timed out");
        thread::sleep(Duration::from_millis(10));
    }
    orchestrator.shutdown();

    assert_eq!(sink.finish_count(), 1);
    assert!(job.is_done());
    assert_eq!(statuses_of(&job), vec![Accepted; 9]);

    // the compile task was judged strictly before every successor
    let judged = judger.judged();
    assert_eq!(judged.len(), 9);
    assert_eq!(judged[0], 0);
}
