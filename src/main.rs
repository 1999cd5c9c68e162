use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use judgehost::config::Config;
use judgehost::core::{JudgeReport, SubmissionState};
use judgehost::data::DataCache;
use judgehost::differs::DifferRegistry;
use judgehost::judger::Judger;
use judgehost::languages::LanguageRegistry;
use judgehost::redis_manager::{JudgeJob, RedisManager, RedisPublisher};
use judgehost::sandbox;
use judgehost::storage::{FsStore, RemoteStore, StorageClient};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("judgehost=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = Arc::new(Config::from_env()?);
    info!("Starting judgehost worker...");

    let compile_secs = config.sandbox.compile_time_limit_secs;
    let languages = match &config.worker.languages {
        Some(path) => {
            info!("Loading language table from {}", path.display());
            LanguageRegistry::from_file(path, compile_secs)?
        }
        None => LanguageRegistry::builtin(compile_secs)?,
    };
    info!("Supported languages: {}", languages.identifiers().join(", "));

    let backend = sandbox::backend_for(&config.sandbox);
    backend.preflight()?;
    info!("Sandbox backend: {}", backend.name());
    if backend.name() == "direct" {
        warn!("The direct backend does not isolate submissions; use it for development only");
    }

    let store: Arc<dyn RemoteStore> = match &config.data.local_store {
        Some(dir) => {
            info!("Serving test data from {}", dir.display());
            Arc::new(FsStore::new(dir))
        }
        None => Arc::new(StorageClient::from_env().await?),
    };
    let data = DataCache::new(&config.data.cache_dir, store);
    let differs = DifferRegistry::new(&config.special_judge);

    let judger = Arc::new(Judger::new(
        config.clone(),
        Arc::new(languages),
        Arc::new(differs),
        Arc::new(data),
        backend,
    ));

    let mut redis = RedisManager::from_env().await?;
    let slots = Arc::new(Semaphore::new(config.worker.concurrency));
    info!(
        "Waiting for jobs (concurrency: {})...",
        config.worker.concurrency
    );

    loop {
        // only take a job off the queue when it can start right away
        let permit = slots.clone().acquire_owned().await?;
        let job = redis.pop_job().await?;
        let judger = judger.clone();
        let publisher = redis.publisher();

        tokio::spawn(async move {
            process_job(judger, publisher, job).await;
            drop(permit);
        });
    }
}

async fn process_job(judger: Arc<Judger>, mut publisher: RedisPublisher, job: JudgeJob) {
    let JudgeJob {
        mut submission,
        problem,
        rejudge,
    } = job;
    let submission_id = submission.id;

    // a panic inside the pipeline must still produce a result
    let sink = publisher.clone();
    let handle = tokio::spawn(async move {
        if rejudge {
            judger.rejudge(&mut submission, &problem, &sink).await
        } else {
            judger.judge(&submission, &problem, &sink).await
        }
    });
    let report = match handle.await {
        Ok(report) => report,
        Err(e) => {
            error!("Judging task for submission {} failed: {}", submission_id, e);
            JudgeReport::new(SubmissionState::CantBeJudged)
                .with_message(format!("Judging task failed: {}", e))
        }
    };

    if let Err(e) = publisher.store_judge_result(submission_id, &report).await {
        error!(
            "Failed to store result for submission {}: {:#}",
            submission_id, e
        );
    }
}
