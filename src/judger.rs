//! Judging orchestrator
//!
//! Drives one submission through the pipeline:
//! resolve adapter/differ -> fetch data -> sandbox -> compile -> freeze ->
//! run every test case -> verdict.
//!
//! Failures of the submission (compile errors, crashes, timeouts, wrong
//! output) are verdicts. Failures of the judge itself are errors, caught in
//! exactly one place and turned into `cant_be_judged`. The sandbox is torn
//! down on every path.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::core::utils::truncate_message;
use crate::core::{JudgeReport, Problem, Submission, SubmissionState};
use crate::data::{self, DataCache};
use crate::differs::DifferRegistry;
use crate::languages::{FailVerdict, LanguageRegistry, RunOutcome, SetupOutcome};
use crate::sandbox::{IsolationBackend, Sandbox};

/// Name of the test input inside the sandbox home
const INPUT_FILE: &str = "input";

const CANT_BE_JUDGED_MESSAGE: &str =
    "The submission could not be judged because of an internal error. Please request a rejudge.";

/// Receives intermediate states of a judgement
#[async_trait]
pub trait StateSink: Send + Sync {
    async fn state_changed(&self, submission_id: i64, state: SubmissionState);
}

/// Sink discarding every update
pub struct NoopSink;

#[async_trait]
impl StateSink for NoopSink {
    async fn state_changed(&self, _submission_id: i64, _state: SubmissionState) {}
}

pub struct Judger {
    config: Arc<Config>,
    languages: Arc<LanguageRegistry>,
    differs: Arc<DifferRegistry>,
    data: Arc<DataCache>,
    backend: Arc<dyn IsolationBackend>,
}

impl Judger {
    pub fn new(
        config: Arc<Config>,
        languages: Arc<LanguageRegistry>,
        differs: Arc<DifferRegistry>,
        data: Arc<DataCache>,
        backend: Arc<dyn IsolationBackend>,
    ) -> Self {
        Self {
            config,
            languages,
            differs,
            data,
            backend,
        }
    }

    /// Judge a submission; never fails
    pub async fn judge(
        &self,
        submission: &Submission,
        problem: &Problem,
        sink: &dyn StateSink,
    ) -> JudgeReport {
        info!(
            "Judging submission {} (problem {}, language {})",
            submission.id, problem.id, submission.language
        );
        sink.state_changed(submission.id, submission.state).await;

        let mut sandbox = None;
        let result = self.pipeline(submission, problem, sink, &mut sandbox).await;

        let teardown = match sandbox.as_mut() {
            Some(sandbox) => sandbox.teardown().context("Failed to tear down sandbox"),
            None => Ok(()),
        };

        let report = match result.and_then(|report| teardown.map(|_| report)) {
            Ok(report) => report,
            Err(e) => {
                error!("Submission {} could not be judged: {:#}", submission.id, e);
                JudgeReport::new(SubmissionState::CantBeJudged).with_message(truncate_message(
                    &format!("{}\n{:#}", CANT_BE_JUDGED_MESSAGE, e),
                ))
            }
        };

        info!(
            "Submission {} finished: {} (time: {:?} ms, memory: {:?} KB)",
            submission.id, report.state, report.time_ms, report.memory_kb
        );
        report
    }

    /// Reset a submission's results and judge it again
    pub async fn rejudge(
        &self,
        submission: &mut Submission,
        problem: &Problem,
        sink: &dyn StateSink,
    ) -> JudgeReport {
        submission.reset_for_rejudge();
        let report = self.judge(submission, problem, sink).await;
        submission.apply(&report);
        report
    }

    async fn pipeline(
        &self,
        submission: &Submission,
        problem: &Problem,
        sink: &dyn StateSink,
        slot: &mut Option<Sandbox>,
    ) -> Result<JudgeReport> {
        let adapter = self.languages.resolve(&submission.language)?;
        let differ = self.differs.resolve(&problem.differ, problem.id)?;

        // held until the judgement ends so the files stay in place
        let data_set = self.data.ensure(problem.id, &problem.data_files).await?;
        let data_dir = data_set.path();
        let testcases = data::discover(data_dir)?;
        debug!(
            "Problem {}: {} test case(s), differ: {}",
            problem.id,
            testcases.len(),
            differ.desc()
        );

        let memory_kb = self.config.sandbox.min_memory_kb.max(problem.memory_limit);
        let sandbox = slot.insert(Sandbox::new(
            &self.config.sandbox,
            self.backend.clone(),
            memory_kb,
        )?);

        sink.state_changed(submission.id, SubmissionState::Compiling)
            .await;
        if let SetupOutcome::Error { message } = adapter.setup(sandbox, &submission.source).await? {
            return Ok(JudgeReport::new(SubmissionState::CompileError)
                .with_message(truncate_message(&message)));
        }

        sandbox.freeze()?;
        sink.state_changed(submission.id, SubmissionState::Running)
            .await;

        let scratch = tempfile::tempdir().context("Failed to create scratch directory")?;
        let time_limit = Duration::from_millis(problem.time_limit);
        let mut total_time_ms = 0;
        let mut max_memory_kb = 0;

        for testcase in &testcases {
            sandbox.put_file(&testcase.input, INPUT_FILE, None)?;

            let outcome = adapter
                .run(sandbox, INPUT_FILE, time_limit, problem.memory_limit)
                .await?;
            let (time_ms, memory_kb, output) = match outcome {
                RunOutcome::Ok {
                    time_ms,
                    memory_kb,
                    output,
                } => (time_ms, memory_kb, output),
                RunOutcome::Fail { verdict, message } => {
                    debug!("Test case {} failed: {:?}", testcase.name, verdict);
                    return Ok(fail_report(verdict, message));
                }
            };

            total_time_ms += time_ms;
            max_memory_kb = max_memory_kb.max(memory_kb);
            // the limit bounds the sum over all test cases
            if total_time_ms > problem.time_limit {
                debug!(
                    "Aggregate time {} ms exceeds {} ms at test case {}",
                    total_time_ms, problem.time_limit, testcase.name
                );
                return Ok(JudgeReport::new(SubmissionState::TimeLimitExceeded));
            }

            let output_path = scratch.path().join(format!("{}.out", testcase.name));
            tokio::fs::write(&output_path, &output)
                .await
                .with_context(|| format!("Failed to store output of {}", testcase.name))?;

            let accepted = differ
                .judge(data_dir, &testcase.input, &output_path, &testcase.expected)
                .await
                .with_context(|| format!("Failed to check test case {}", testcase.name))?;
            if !accepted {
                debug!("Wrong answer on test case {}", testcase.name);
                return Ok(
                    JudgeReport::new(SubmissionState::WrongAnswer).with_stats(time_ms, memory_kb)
                );
            }
        }

        Ok(JudgeReport::new(SubmissionState::Accepted).with_stats(total_time_ms, max_memory_kb))
    }
}

fn fail_report(verdict: FailVerdict, message: Option<String>) -> JudgeReport {
    let report = match verdict {
        FailVerdict::TimeLimitExceeded => JudgeReport::new(SubmissionState::TimeLimitExceeded),
        FailVerdict::RuntimeError | FailVerdict::MemoryLimitExceeded => {
            JudgeReport::new(SubmissionState::RuntimeError)
        }
    };
    match message {
        Some(message) => report.with_message(truncate_message(&message)),
        None => report,
    }
}
