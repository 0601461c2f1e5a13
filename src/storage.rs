//! File-backed test and run storage.
//!
//! Test definitions are stored as YAML keyed by slug under
//! `<dir>/tests/`, run records as JSON under `<dir>/runs/<testId>/`.
//! The functions here implement the storage contract the runner and
//! suite depend on; front-end CRUD goes through the same calls.

use crate::definition::TestDefinition;
use crate::results::{TestResult, TestRun};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Errors from loading or persisting tests and runs.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid test definition: {0}")]
    Invalid(String),

    #[error("Test '{0}' not found")]
    TestNotFound(String),
}

/// A stored test definition with its identity and metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedTest {
    /// Slug identity, also the file stem.
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    pub definition: TestDefinition,

    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

/// Partial update applied by [`update_test`].
#[derive(Debug, Clone, Default)]
pub struct TestPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub definition: Option<TestDefinition>,
}

fn tests_dir(dir: &Path) -> PathBuf {
    dir.join("tests")
}

fn test_path(dir: &Path, id: &str) -> PathBuf {
    tests_dir(dir).join(format!("{id}.yaml"))
}

fn runs_dir(dir: &Path, test_id: &str) -> PathBuf {
    dir.join("runs").join(test_id)
}

/// Derive a slug id from a test name: lowercase, alphanumeric runs
/// joined by single dashes.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "test".to_string()
    } else {
        slug
    }
}

/// Load a single test by id; absent tests yield None.
pub async fn get_test(dir: &Path, id: &str) -> Result<Option<SavedTest>, StorageError> {
    match tokio::fs::read_to_string(test_path(dir, id)).await {
        Ok(text) => Ok(Some(serde_yaml::from_str(&text)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// List stored tests, optionally filtered by tag, sorted by id.
/// Unparsable files are logged and skipped.
pub async fn list_tests(dir: &Path, tag: Option<&str>) -> Result<Vec<SavedTest>, StorageError> {
    let mut tests = Vec::new();
    let mut entries = match tokio::fs::read_dir(tests_dir(dir)).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(tests),
        Err(err) => return Err(err.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let text = tokio::fs::read_to_string(&path).await?;
        match serde_yaml::from_str::<SavedTest>(&text) {
            Ok(test) => {
                if tag.map_or(true, |t| test.tags.iter().any(|x| x == t)) {
                    tests.push(test);
                }
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Skipping unparsable test file");
            }
        }
    }

    tests.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(tests)
}

/// Persist a new test; the id is slugged from the name and suffixed
/// with a counter when taken.
pub async fn save_test(
    dir: &Path,
    name: &str,
    description: Option<String>,
    tags: Vec<String>,
    definition: TestDefinition,
) -> Result<SavedTest, StorageError> {
    definition
        .validate()
        .map_err(StorageError::Invalid)?;

    tokio::fs::create_dir_all(tests_dir(dir)).await?;

    let base = slugify(name);
    let mut id = base.clone();
    let mut counter = 2;
    while tokio::fs::try_exists(test_path(dir, &id)).await? {
        id = format!("{base}-{counter}");
        counter += 1;
    }

    let now = Utc::now();
    let test = SavedTest {
        id,
        name: name.to_string(),
        description,
        tags,
        definition,
        created_at: now,
        updated_at: now,
    };
    write_test(dir, &test).await?;
    Ok(test)
}

/// Apply a partial update to a stored test.
pub async fn update_test(
    dir: &Path,
    id: &str,
    patch: TestPatch,
) -> Result<SavedTest, StorageError> {
    let mut test = get_test(dir, id)
        .await?
        .ok_or_else(|| StorageError::TestNotFound(id.to_string()))?;

    if let Some(name) = patch.name {
        test.name = name;
    }
    if let Some(description) = patch.description {
        test.description = description;
    }
    if let Some(tags) = patch.tags {
        test.tags = tags;
    }
    if let Some(definition) = patch.definition {
        definition.validate().map_err(StorageError::Invalid)?;
        test.definition = definition;
    }
    test.updated_at = Utc::now();

    write_test(dir, &test).await?;
    Ok(test)
}

/// Remove a stored test (its run history is kept).
pub async fn delete_test(dir: &Path, id: &str) -> Result<(), StorageError> {
    match tokio::fs::remove_file(test_path(dir, id)).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(StorageError::TestNotFound(id.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

async fn write_test(dir: &Path, test: &SavedTest) -> Result<(), StorageError> {
    let yaml = serde_yaml::to_string(test)?;
    tokio::fs::create_dir_all(tests_dir(dir)).await?;
    tokio::fs::write(test_path(dir, &test.id), yaml).await?;
    Ok(())
}

/// Persist a run record for a completed execution.
pub async fn save_run(
    dir: &Path,
    test_id: &str,
    result: &TestResult,
) -> Result<TestRun, StorageError> {
    let completed = Utc::now();
    let duration = result.duration_ms();
    let run = TestRun {
        id: format!("run-{}", Uuid::new_v4()),
        test_id: test_id.to_string(),
        status: result.status().to_string(),
        result: result.clone(),
        started_at: completed - chrono::Duration::milliseconds(duration as i64),
        completed_at: Some(completed),
        duration_ms: Some(duration),
    };

    let run_dir = runs_dir(dir, test_id);
    tokio::fs::create_dir_all(&run_dir).await?;
    let json = serde_json::to_string_pretty(&run)?;
    tokio::fs::write(run_dir.join(format!("{}.json", run.id)), json).await?;
    Ok(run)
}

/// List runs for a test, newest first, optionally filtered by status
/// and truncated to `limit`.
pub async fn list_runs(
    dir: &Path,
    test_id: &str,
    limit: Option<usize>,
    status: Option<&str>,
) -> Result<Vec<TestRun>, StorageError> {
    let mut runs = Vec::new();
    let mut entries = match tokio::fs::read_dir(runs_dir(dir, test_id)).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
        Err(err) => return Err(err.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let bytes = tokio::fs::read(&path).await?;
        match serde_json::from_slice::<TestRun>(&bytes) {
            Ok(run) => {
                if status.map_or(true, |s| run.status == s) {
                    runs.push(run);
                }
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Skipping unparsable run file");
            }
        }
    }

    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    if let Some(limit) = limit {
        runs.truncate(limit);
    }
    Ok(runs)
}

/// Load a single run record.
pub async fn get_run(
    dir: &Path,
    test_id: &str,
    run_id: &str,
) -> Result<Option<TestRun>, StorageError> {
    let path = runs_dir(dir, test_id).join(format!("{run_id}.json"));
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Load a standalone definition file (YAML or JSON by extension).
pub async fn load_definition(path: &Path) -> Result<TestDefinition, StorageError> {
    let text = tokio::fs::read_to_string(path).await?;
    let definition: TestDefinition =
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&text)?
        } else {
            serde_yaml::from_str(&text)?
        };
    definition.validate().map_err(StorageError::Invalid)?;
    Ok(definition)
}
