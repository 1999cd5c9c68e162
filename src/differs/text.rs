//! Textual comparison policies

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::Differ;

/// Relative tolerance of `relative_float`
const FLOAT_EPSILON: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextPolicy {
    /// Lines must match exactly; only line terminators are ignored
    Strict,
    /// Trailing whitespace on each line is ignored
    IgnoreTrailingSpace,
    /// Whitespace-separated tokens must match
    IgnoreWhitespace,
    /// Tokens must match, numbers within a relative tolerance
    RelativeFloat,
}

impl TextPolicy {
    pub fn compare(self, actual: &str, expected: &str) -> bool {
        match self {
            TextPolicy::Strict => actual.lines().eq(expected.lines()),
            TextPolicy::IgnoreTrailingSpace => {
                trimmed_lines(actual) == trimmed_lines(expected)
            }
            TextPolicy::IgnoreWhitespace => {
                actual.split_whitespace().eq(expected.split_whitespace())
            }
            TextPolicy::RelativeFloat => {
                let actual: Vec<&str> = actual.split_whitespace().collect();
                let expected: Vec<&str> = expected.split_whitespace().collect();
                actual.len() == expected.len()
                    && actual
                        .iter()
                        .zip(&expected)
                        .all(|(a, e)| tokens_close(a, e))
            }
        }
    }
}

fn trimmed_lines(s: &str) -> Vec<&str> {
    s.lines().map(str::trim_end).collect()
}

fn tokens_close(actual: &str, expected: &str) -> bool {
    if actual == expected {
        return true;
    }
    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(e)) => (a - e).abs() <= FLOAT_EPSILON * a.abs().max(1.0),
        _ => false,
    }
}

/// Differ comparing the program output to the expected file
pub struct TextDiffer {
    policy: TextPolicy,
    desc: &'static str,
}

impl TextDiffer {
    pub fn new(policy: TextPolicy) -> Self {
        let desc = match policy {
            TextPolicy::Strict => "exact match, line endings ignored",
            TextPolicy::IgnoreTrailingSpace => "ignore trailing whitespace",
            TextPolicy::IgnoreWhitespace => "token match, whitespace ignored",
            TextPolicy::RelativeFloat => "token match, relative error 1e-8 for numbers",
        };
        Self { policy, desc }
    }
}

#[async_trait]
impl Differ for TextDiffer {
    fn desc(&self) -> &str {
        self.desc
    }

    async fn judge(
        &self,
        _data_dir: &Path,
        _input: &Path,
        output: &Path,
        expected: &Path,
    ) -> Result<bool> {
        let actual = tokio::fs::read(output)
            .await
            .with_context(|| format!("Failed to read {}", output.display()))?;
        let expected = tokio::fs::read(expected)
            .await
            .with_context(|| format!("Failed to read {}", expected.display()))?;
        Ok(self.policy.compare(
            &String::from_utf8_lossy(&actual),
            &String::from_utf8_lossy(&expected),
        ))
    }
}
