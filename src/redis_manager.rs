//! Redis Manager - Centralized Redis connection and operations
//!
//! This module handles all Redis-related operations including:
//! - Job queue operations (BLPOP)
//! - Progress publishing for intermediate submission states
//! - Result storage and publishing

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::{JudgeReport, Problem, Submission, SubmissionState};
use crate::judger::StateSink;

/// Redis key constants
pub mod keys {
    /// Judge job queue key
    pub const JUDGE_QUEUE: &str = "judge:queue";

    /// Judge result key prefix (for polling)
    pub const JUDGE_RESULT_PREFIX: &str = "judge:result:";

    /// Judge result channel (for pub/sub)
    pub const JUDGE_RESULT_CHANNEL: &str = "judge:results";

    /// Judge progress channel (for pub/sub)
    pub const JUDGE_PROGRESS_CHANNEL: &str = "judge:progress";
}

const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour

/// Job received from the Redis queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeJob {
    pub submission: Submission,
    pub problem: Problem,
    /// Reset previous results and start from `rejudge_requested`
    #[serde(default)]
    pub rejudge: bool,
}

/// Final result as stored and published
#[derive(Debug, Serialize, Deserialize)]
pub struct JudgeResult {
    pub submission_id: i64,
    #[serde(flatten)]
    pub report: JudgeReport,
}

#[derive(Debug, Serialize)]
struct ProgressUpdate {
    submission_id: i64,
    state: SubmissionState,
}

/// Centralized Redis manager for all Redis operations
pub struct RedisManager {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisManager {
    /// Create a new RedisManager with the given Redis URL.
    pub async fn with_url(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);

        Ok(Self { client, conn })
    }

    /// Create a new RedisManager using the REDIS_URL environment variable.
    /// Defaults to "redis://localhost:6379" if not set.
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        Self::with_url(&url).await
    }

    /// Handle for publishing from a judging task
    pub fn publisher(&self) -> RedisPublisher {
        RedisPublisher {
            client: self.client.clone(),
            conn: self.conn.clone(),
        }
    }

    /// Block and wait for the next job from the queue.
    ///
    /// This uses BLPOP to efficiently wait for jobs without polling.
    /// Automatically reconnects on connection failure.
    pub async fn pop_job(&mut self) -> Result<JudgeJob> {
        loop {
            let result: Option<(String, String)> =
                match self.conn.blpop(keys::JUDGE_QUEUE, 0.0).await {
                    Ok(res) => res,
                    Err(e) => {
                        warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                        self.conn = get_connection_with_retry(&self.client).await?;
                        continue;
                    }
                };

            if let Some((_, job_data)) = result {
                match serde_json::from_str::<JudgeJob>(&job_data) {
                    Ok(job) => return Ok(job),
                    Err(e) => {
                        warn!("Failed to parse job data: {}. Data: {}", e, job_data);
                        continue;
                    }
                }
            }
        }
    }
}

/// Publishing side of the Redis connection, one per judging task
#[derive(Clone)]
pub struct RedisPublisher {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisPublisher {
    /// Store a judge result in Redis.
    ///
    /// The result is stored with a 1-hour expiration and also published
    /// to a channel for real-time subscribers.
    pub async fn store_judge_result(&mut self, submission_id: i64, report: &JudgeReport) -> Result<()> {
        let result = JudgeResult {
            submission_id,
            report: report.clone(),
        };
        let key = format!("{}{}", keys::JUDGE_RESULT_PREFIX, submission_id);
        let json = serde_json::to_string(&result)?;

        // Try to store, reconnect on failure
        if let Err(e) = self
            .conn
            .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
            .await
        {
            warn!("Failed to store result: {}. Reconnecting...", e);
            self.conn = get_connection_with_retry(&self.client).await?;
            self.conn
                .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
                .await?;
        }

        // Publish to channel (ignore errors as there may be no subscribers)
        let _ = self
            .conn
            .publish::<_, _, ()>(keys::JUDGE_RESULT_CHANNEL, &json)
            .await;

        Ok(())
    }
}

#[async_trait]
impl StateSink for RedisPublisher {
    async fn state_changed(&self, submission_id: i64, state: SubmissionState) {
        let update = ProgressUpdate {
            submission_id,
            state,
        };
        let Ok(json) = serde_json::to_string(&update) else {
            return;
        };
        // progress updates are non-critical
        let mut conn = self.conn.clone();
        let _ = conn
            .publish::<_, _, ()>(keys::JUDGE_PROGRESS_CHANNEL, &json)
            .await;
    }
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_job() {
        let json = r#"{
            "submission": {"id": 5, "problem_id": 9, "language": "python", "source": "print(1)"},
            "problem": {"id": 9, "time_limit": 1000, "memory_limit": 262144,
                        "differ": "strict", "data_files": ["9/1.in", "9/1.out"]}
        }"#;
        let job: JudgeJob = serde_json::from_str(json).unwrap();
        assert_eq!(job.submission.id, 5);
        assert_eq!(job.submission.state, SubmissionState::Received);
        assert_eq!(job.problem.data_files.len(), 2);
        assert!(!job.rejudge);
    }

    #[test]
    fn test_result_json_shape() {
        let result = JudgeResult {
            submission_id: 3,
            report: JudgeReport::new(SubmissionState::Accepted).with_stats(12, 3400),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["submission_id"], 3);
        assert_eq!(value["state"], "accepted");
        assert_eq!(value["time_ms"], 12);
        assert_eq!(value["memory_kb"], 3400);
    }
}
