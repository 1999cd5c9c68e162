//! Differs - decide whether a program's output is correct
//!
//! Each differ is a stateless comparison policy selected per problem by
//! identifier:
//! - `strict`, `ignore_trailing_space`, `ignore_whitespace`,
//!   `relative_float`: textual comparison against the expected file
//! - `special_judge`: the problem's own checker, only for problems listed in
//!   `special_judge.trusted_problems`

pub mod special;
pub mod text;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::SpecialJudgeConfig;
use crate::core::JudgeError;

pub use special::SpecialJudge;
pub use text::{TextDiffer, TextPolicy};

pub const SPECIAL_JUDGE_ID: &str = "special_judge";

#[async_trait]
pub trait Differ: Send + Sync {
    fn desc(&self) -> &str;

    /// `Ok(true)` accepts the output, `Ok(false)` rejects it
    async fn judge(
        &self,
        data_dir: &Path,
        input: &Path,
        output: &Path,
        expected: &Path,
    ) -> Result<bool>;
}

/// Differs by identifier
pub struct DifferRegistry {
    differs: HashMap<String, Arc<dyn Differ>>,
    special: Arc<dyn Differ>,
    trusted_problems: HashSet<i64>,
}

impl DifferRegistry {
    /// Registry with every built-in policy
    pub fn new(config: &SpecialJudgeConfig) -> Self {
        let mut registry = Self {
            differs: HashMap::new(),
            special: Arc::new(SpecialJudge::new(config.timeout_secs)),
            trusted_problems: config.trusted_problems.iter().copied().collect(),
        };
        for (id, policy) in [
            ("strict", TextPolicy::Strict),
            ("ignore_trailing_space", TextPolicy::IgnoreTrailingSpace),
            ("ignore_whitespace", TextPolicy::IgnoreWhitespace),
            ("relative_float", TextPolicy::RelativeFloat),
        ] {
            registry.register(id, Arc::new(TextDiffer::new(policy)));
        }
        registry
    }

    pub fn register(&mut self, id: &str, differ: Arc<dyn Differ>) {
        self.differs.insert(id.to_string(), differ);
    }

    /// Look up the differ a problem asks for
    pub fn resolve(&self, id: &str, problem_id: i64) -> Result<Arc<dyn Differ>, JudgeError> {
        if id == SPECIAL_JUDGE_ID {
            return if self.trusted_problems.contains(&problem_id) {
                Ok(self.special.clone())
            } else {
                Err(JudgeError::SpecialJudgeNotAllowed(problem_id))
            };
        }
        self.differs
            .get(id)
            .cloned()
            .ok_or_else(|| JudgeError::UnknownDiffer(id.to_string()))
    }

    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.differs.keys().map(String::as_str).collect();
        ids.push(SPECIAL_JUDGE_ID);
        ids.sort_unstable();
        ids
    }
}
