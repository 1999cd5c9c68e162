//! End-to-end judging with the direct backend and a shell "language"

mod common;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use judgehost::config::{Config, SpecialJudgeConfig};
use judgehost::core::{JudgeReport, Problem, Submission, SubmissionState};
use judgehost::data::DataCache;
use judgehost::differs::DifferRegistry;
use judgehost::judger::{Judger, NoopSink, StateSink};
use judgehost::languages::{LanguageAdapter, LanguageRegistry, RunOutcome, SetupOutcome};
use judgehost::sandbox::{DirectBackend, Sandbox};
use judgehost::storage::FsStore;

const LANGUAGES: &str = r#"
[sh]
display_name = "POSIX shell"
source_file = "main.sh"
run_command = "sh main.sh"

[shc]
display_name = "POSIX shell, syntax checked"
source_file = "main.sh"
compile_command = "sh -n main.sh"
run_command = "sh main.sh"
"#;

const INCREMENT: &str = "read n\necho $((n + 1))\n";

struct Fixture {
    _dirs: Vec<tempfile::TempDir>,
    work_root: std::path::PathBuf,
    store_root: std::path::PathBuf,
    config: Arc<Config>,
}

impl Fixture {
    fn new() -> Self {
        let work = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.sandbox = common::sandbox_config(work.path());
        config.data.cache_dir = cache.path().to_path_buf();
        config.special_judge = SpecialJudgeConfig {
            trusted_problems: vec![100],
            timeout_secs: 5,
        };

        Self {
            work_root: work.path().to_path_buf(),
            store_root: store.path().to_path_buf(),
            config: Arc::new(config),
            _dirs: vec![work, store, cache],
        }
    }

    /// Put files into the remote store, returning their keys
    fn upload(&self, problem_id: i64, files: &[(&str, &str)]) -> Vec<String> {
        let dir = self.store_root.join(problem_id.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        files
            .iter()
            .map(|(name, content)| {
                std::fs::write(dir.join(name), content).unwrap();
                format!("{}/{}", problem_id, name)
            })
            .collect()
    }

    fn increment_problem(&self, id: i64) -> Problem {
        Problem {
            id,
            time_limit: 2000,
            memory_limit: 64 * 1024,
            differ: "strict".into(),
            data_files: self.upload(
                id,
                &[
                    ("1.in", "1\n"),
                    ("1.out", "2\n"),
                    ("2.in", "41\n"),
                    ("2.out", "42\n"),
                    ("10.in", "-5\n"),
                    ("10.out", "-4\n"),
                ],
            ),
        }
    }

    fn judger_with(&self, languages: LanguageRegistry) -> Judger {
        Judger::new(
            self.config.clone(),
            Arc::new(languages),
            Arc::new(DifferRegistry::new(&self.config.special_judge)),
            Arc::new(DataCache::new(
                &self.config.data.cache_dir,
                Arc::new(FsStore::new(&self.store_root)),
            )),
            Arc::new(DirectBackend::new()),
        )
    }

    fn judger(&self) -> Judger {
        self.judger_with(LanguageRegistry::from_toml(LANGUAGES, 10).unwrap())
    }

    fn assert_clean(&self) {
        assert_eq!(std::fs::read_dir(&self.work_root).unwrap().count(), 0);
    }
}

fn submission(language: &str, source: &str, problem_id: i64) -> Submission {
    Submission {
        id: 1,
        problem_id,
        language: language.into(),
        source: source.into(),
        is_public: false,
        state: SubmissionState::Received,
        message: None,
        time: None,
        memory: None,
    }
}

#[derive(Default)]
struct RecordingSink {
    states: Mutex<Vec<SubmissionState>>,
}

impl RecordingSink {
    fn states(&self) -> Vec<SubmissionState> {
        self.states.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateSink for RecordingSink {
    async fn state_changed(&self, _submission_id: i64, state: SubmissionState) {
        self.states.lock().unwrap().push(state);
    }
}

#[tokio::test]
async fn test_increment_is_accepted() {
    let fixture = Fixture::new();
    let problem = fixture.increment_problem(1);
    let sink = RecordingSink::default();

    let report = fixture
        .judger()
        .judge(&submission("sh", INCREMENT, 1), &problem, &sink)
        .await;

    assert_eq!(report.state, SubmissionState::Accepted, "{:?}", report);
    assert!(report.time_ms.is_some());
    assert!(report.memory_kb.is_some());
    assert_eq!(
        sink.states(),
        vec![
            SubmissionState::Received,
            SubmissionState::Compiling,
            SubmissionState::Running
        ]
    );
    fixture.assert_clean();
}

#[tokio::test]
async fn test_off_by_one_is_wrong_answer() {
    let fixture = Fixture::new();
    let problem = fixture.increment_problem(2);

    let report = fixture
        .judger()
        .judge(&submission("sh", "read n\necho $((n + 2))\n", 2), &problem, &NoopSink)
        .await;

    assert_eq!(report.state, SubmissionState::WrongAnswer);
    assert!(report.time_ms.is_some());
    fixture.assert_clean();
}

#[tokio::test]
async fn test_compile_error_carries_diagnostics() {
    let fixture = Fixture::new();
    let problem = fixture.increment_problem(3);

    let report = fixture
        .judger()
        .judge(&submission("shc", "if then fi (\n", 3), &problem, &NoopSink)
        .await;

    assert_eq!(report.state, SubmissionState::CompileError);
    assert!(!report.message.unwrap_or_default().trim().is_empty());
    fixture.assert_clean();

    let report = fixture
        .judger()
        .judge(&submission("shc", INCREMENT, 3), &problem, &NoopSink)
        .await;
    assert_eq!(report.state, SubmissionState::Accepted, "{:?}", report);
}

#[tokio::test]
async fn test_runtime_error() {
    let fixture = Fixture::new();
    let problem = fixture.increment_problem(4);

    let report = fixture
        .judger()
        .judge(&submission("sh", "echo oops >&2\nexit 3\n", 4), &problem, &NoopSink)
        .await;

    assert_eq!(report.state, SubmissionState::RuntimeError);
    let message = report.message.unwrap();
    assert!(message.contains("nonzero return code"), "{}", message);
    assert!(message.contains("oops"), "{}", message);
}

#[tokio::test]
async fn test_output_replaced_by_fifo_is_runtime_error() {
    let fixture = Fixture::new();
    let problem = fixture.increment_problem(50);

    let source = "rm -f output\nmkfifo output\n";
    let report = tokio::time::timeout(
        Duration::from_secs(30),
        fixture
            .judger()
            .judge(&submission("sh", source, 50), &problem, &NoopSink),
    )
    .await
    .expect("judging must not hang on a FIFO");

    assert_eq!(report.state, SubmissionState::RuntimeError, "{:?}", report);
    assert_eq!(report.message.as_deref(), Some("output is not a regular file"));
    fixture.assert_clean();
}

#[tokio::test]
async fn test_infinite_loop_is_time_limit_exceeded() {
    let fixture = Fixture::new();
    let mut problem = fixture.increment_problem(5);
    problem.time_limit = 300;

    let report = fixture
        .judger()
        .judge(&submission("sh", "while :; do :; done\n", 5), &problem, &NoopSink)
        .await;

    assert_eq!(report.state, SubmissionState::TimeLimitExceeded);
    fixture.assert_clean();
}

#[tokio::test]
async fn test_infrastructure_failures_cant_be_judged() {
    let fixture = Fixture::new();
    let judger = fixture.judger();
    let problem = fixture.increment_problem(6);

    let report = judger
        .judge(&submission("cobol", INCREMENT, 6), &problem, &NoopSink)
        .await;
    assert_eq!(report.state, SubmissionState::CantBeJudged);
    assert!(report.message.unwrap().contains("cobol"));

    let mut fuzzy = problem.clone();
    fuzzy.differ = "fuzzy".into();
    let report = judger
        .judge(&submission("sh", INCREMENT, 6), &fuzzy, &NoopSink)
        .await;
    assert_eq!(report.state, SubmissionState::CantBeJudged);

    // special judge is only allowed for problem 100
    let mut special = problem.clone();
    special.differ = "special_judge".into();
    let report = judger
        .judge(&submission("sh", INCREMENT, 6), &special, &NoopSink)
        .await;
    assert_eq!(report.state, SubmissionState::CantBeJudged);

    let mut missing = problem.clone();
    missing.id = 7;
    missing.data_files = vec!["7/absent.in".into()];
    let report = judger
        .judge(&submission("sh", INCREMENT, 7), &missing, &NoopSink)
        .await;
    assert_eq!(report.state, SubmissionState::CantBeJudged);

    let mut unmatched = problem.clone();
    unmatched.id = 8;
    unmatched.data_files = fixture.upload(8, &[("1.in", "1\n"), ("1.out", "2\n"), ("2.in", "3\n")]);
    let report = judger
        .judge(&submission("sh", INCREMENT, 8), &unmatched, &NoopSink)
        .await;
    assert_eq!(report.state, SubmissionState::CantBeJudged);

    fixture.assert_clean();
}

#[tokio::test]
async fn test_special_judge() {
    let fixture = Fixture::new();
    let problem = Problem {
        id: 100,
        time_limit: 2000,
        memory_limit: 64 * 1024,
        differ: "special_judge".into(),
        data_files: fixture.upload(
            100,
            &[
                ("1.in", "4\n"),
                ("1.out", "any divisor\n"),
                // accept any proper divisor of the input
                (
                    "spj",
                    "#!/bin/sh\nn=$(cat \"$1\")\nd=$(cat \"$2\")\n[ \"$d\" -gt 1 ] && [ \"$d\" -lt \"$n\" ] && [ $((n % d)) -eq 0 ] || exit 1\n",
                ),
            ],
        ),
    };
    let judger = fixture.judger();

    let report = judger
        .judge(&submission("sh", "echo 2\n", 100), &problem, &NoopSink)
        .await;
    assert_eq!(report.state, SubmissionState::Accepted, "{:?}", report);

    let report = judger
        .judge(&submission("sh", "echo 3\n", 100), &problem, &NoopSink)
        .await;
    assert_eq!(report.state, SubmissionState::WrongAnswer);
}

#[tokio::test]
async fn test_rejudge_is_repeatable() {
    let fixture = Fixture::new();
    let problem = fixture.increment_problem(9);
    let judger = fixture.judger();

    let mut sub = submission("sh", "read n\necho $((n + 2))\n", 9);
    let first = judger.judge(&sub, &problem, &NoopSink).await;
    sub.apply(&first);
    assert_eq!(sub.state, SubmissionState::WrongAnswer);

    let sink = RecordingSink::default();
    let second = judger.rejudge(&mut sub, &problem, &sink).await;
    assert_eq!(second.state, first.state);
    assert_eq!(sub.state, SubmissionState::WrongAnswer);
    assert_eq!(sink.states()[0], SubmissionState::RejudgeRequested);
}

/// Adapter replaying scripted run outcomes
struct ScriptedAdapter {
    outcomes: Mutex<VecDeque<RunOutcome>>,
}

impl ScriptedAdapter {
    fn new(outcomes: Vec<RunOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
        }
    }
}

#[async_trait]
impl LanguageAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn ext(&self) -> &str {
        "txt"
    }

    fn version(&self) -> &str {
        "1"
    }

    async fn setup(&self, _sandbox: &mut Sandbox, _source: &str) -> Result<SetupOutcome> {
        Ok(SetupOutcome::Ok)
    }

    async fn run(
        &self,
        _sandbox: &mut Sandbox,
        _input_file: &str,
        _time_limit: Duration,
        _memory_limit_kb: u64,
    ) -> Result<RunOutcome> {
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no more scripted outcomes"))
    }
}

fn ok(time_ms: u64, memory_kb: u64, output: &str) -> RunOutcome {
    RunOutcome::Ok {
        time_ms,
        memory_kb,
        output: output.as_bytes().to_vec(),
    }
}

async fn judge_scripted(fixture: &Fixture, problem: &Problem, outcomes: Vec<RunOutcome>) -> JudgeReport {
    let mut languages = LanguageRegistry::new();
    languages.register("scripted", &[], Arc::new(ScriptedAdapter::new(outcomes)));
    fixture
        .judger_with(languages)
        .judge(&submission("scripted", "", problem.id), problem, &NoopSink)
        .await
}

fn three_case_problem(fixture: &Fixture, id: i64, time_limit: u64) -> Problem {
    Problem {
        id,
        time_limit,
        memory_limit: 64 * 1024,
        differ: "strict".into(),
        data_files: fixture.upload(
            id,
            &[
                ("1.in", ""),
                ("1.out", "ok\n"),
                ("2.in", ""),
                ("2.out", "ok\n"),
                ("3.in", ""),
                ("3.out", "ok\n"),
            ],
        ),
    }
}

#[tokio::test]
async fn test_time_limit_bounds_the_sum_of_all_cases() {
    let fixture = Fixture::new();

    // every case is well below the limit, their sum is not
    let problem = three_case_problem(&fixture, 20, 1000);
    let report = judge_scripted(
        &fixture,
        &problem,
        vec![ok(400, 100, "ok\n"), ok(400, 300, "ok\n"), ok(400, 200, "ok\n")],
    )
    .await;
    assert_eq!(report.state, SubmissionState::TimeLimitExceeded);

    let problem = three_case_problem(&fixture, 21, 1200);
    let report = judge_scripted(
        &fixture,
        &problem,
        vec![ok(400, 100, "ok\n"), ok(400, 300, "ok\n"), ok(400, 200, "ok\n")],
    )
    .await;
    assert_eq!(report, JudgeReport::new(SubmissionState::Accepted).with_stats(1200, 300));
}

#[tokio::test]
async fn test_wrong_answer_reports_failing_case() {
    let fixture = Fixture::new();
    let problem = three_case_problem(&fixture, 22, 5000);
    let report = judge_scripted(
        &fixture,
        &problem,
        vec![ok(10, 900, "ok\n"), ok(25, 500, "nope\n"), ok(10, 100, "ok\n")],
    )
    .await;
    assert_eq!(report, JudgeReport::new(SubmissionState::WrongAnswer).with_stats(25, 500));
    fixture.assert_clean();
}

#[test]
fn test_data_files_cached_between_judgements() {
    tokio_test::block_on(async {
        let fixture = Fixture::new();
        let problem = fixture.increment_problem(30);
        let judger = fixture.judger();

        let report = judger
            .judge(&submission("sh", INCREMENT, 30), &problem, &NoopSink)
            .await;
        assert_eq!(report.state, SubmissionState::Accepted);

        // the cache no longer needs the store
        std::fs::remove_dir_all(fixture.store_root.join("30")).unwrap();
        let report = judger
            .judge(&submission("sh", INCREMENT, 30), &problem, &NoopSink)
            .await;
        assert_eq!(report.state, SubmissionState::Accepted);
    });
}
