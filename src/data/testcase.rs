//! Test case discovery

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::core::utils::natural_cmp;
use crate::core::JudgeError;

/// A pair of input and expected output files sharing a base name
#[derive(Debug, Clone, PartialEq)]
pub struct TestCase {
    pub name: String,
    pub input: PathBuf,
    pub expected: PathBuf,
}

/// Find the `<name>.in`/`<name>.out` pairs in a data directory
///
/// Files with other extensions are ignored. Cases come back in natural
/// order of their base names (`2` before `10`).
pub fn discover(dir: &Path) -> Result<Vec<TestCase>> {
    let mut found: BTreeMap<String, (Option<PathBuf>, Option<PathBuf>)> = BTreeMap::new();

    let entries =
        std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let (Some(stem), Some(ext)) = (
            path.file_stem().and_then(|s| s.to_str()),
            path.extension().and_then(|s| s.to_str()),
        ) else {
            continue;
        };
        let slot = found.entry(stem.to_string()).or_default();
        match ext {
            "in" => slot.0 = Some(path.clone()),
            "out" => slot.1 = Some(path.clone()),
            _ => {}
        }
    }

    let mut cases = Vec::with_capacity(found.len());
    for (name, pair) in found {
        match pair {
            (Some(input), Some(expected)) => cases.push(TestCase {
                name,
                input,
                expected,
            }),
            _ => return Err(JudgeError::UnmatchedTestCase { name }.into()),
        }
    }

    if cases.is_empty() {
        return Err(JudgeError::NoTestCases(dir.to_path_buf()).into());
    }
    cases.sort_by(|a, b| natural_cmp(&a.name, &b.name));
    Ok(cases)
}
