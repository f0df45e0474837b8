//! JSON file store
//!
//! Run documents live at `runs/<run_id>.json`, the history book at
//! `history.json`, and the created-file registry at `file-registry.json`
//! under one state directory. Every save is an atomic
//! write-to-temp-then-rename of the whole document; the store never
//! patches a file in place, so readers only ever see a complete,
//! self-consistent snapshot. Single writer per run is assumed (one active
//! tracker instance).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::history::HistoryBook;
use crate::tracker::{RunStatus, TestRun};

/// Registry is capped to this many runs, oldest evicted first.
pub const FILE_REGISTRY_CAP: usize = 50;

/// One file a test created, registered for later cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedFile {
    pub test_id: String,
    #[serde(default)]
    pub vault_path: Option<PathBuf>,
    #[serde(default)]
    pub dropbox_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub run_id: String,
    pub files: Vec<CreatedFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileRegistry {
    #[serde(default)]
    pub runs: Vec<RegistryEntry>,
}

pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    fn history_path(&self) -> PathBuf {
        self.root.join("history.json")
    }

    fn registry_path(&self) -> PathBuf {
        self.root.join("file-registry.json")
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.json"))
    }

    // ------------------------------------------------------------------
    // Run documents
    // ------------------------------------------------------------------

    pub fn save_run(&self, run: &TestRun) -> Result<()> {
        write_json_atomic(&self.run_path(&run.run_id), run)
    }

    pub fn load_run(&self, run_id: &str) -> Result<Option<TestRun>> {
        read_json_opt(&self.run_path(run_id))
    }

    /// All persisted run ids, ascending. Run ids embed the date and a
    /// zero-padded sequence, so lexical order is chronological order.
    pub fn list_run_ids(&self) -> Result<Vec<String>> {
        let dir = self.runs_dir();
        let mut ids = Vec::new();
        if dir.is_dir() {
            for entry in fs::read_dir(&dir)
                .with_context(|| format!("failed to read runs dir {}", dir.display()))?
            {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        ids.push(stem.to_string());
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Newest-first scan for the first in-progress run.
    pub fn latest_in_progress(&self) -> Result<Option<TestRun>> {
        for run_id in self.list_run_ids()?.into_iter().rev() {
            if let Some(run) = self.load_run(&run_id)? {
                if run.status == RunStatus::InProgress {
                    return Ok(Some(run));
                }
            }
        }
        Ok(None)
    }

    /// Next unused `run-YYYY-MM-DD-NNN` id for the given calendar date,
    /// found by scanning the persisted run files.
    pub fn next_run_id(&self, date: NaiveDate) -> Result<String> {
        let prefix = format!("run-{}", date.format("%Y-%m-%d"));
        let max_seq = self
            .list_run_ids()?
            .iter()
            .filter_map(|id| id.strip_prefix(&prefix))
            .filter_map(|rest| rest.strip_prefix('-'))
            .filter_map(|seq| seq.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        Ok(format!("{}-{:03}", prefix, max_seq + 1))
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub fn load_history(&self) -> Result<HistoryBook> {
        Ok(read_json_opt(&self.history_path())?.unwrap_or_default())
    }

    pub fn save_history(&self, book: &HistoryBook) -> Result<()> {
        write_json_atomic(&self.history_path(), book)
    }

    // ------------------------------------------------------------------
    // Created-file registry
    // ------------------------------------------------------------------

    pub fn load_registry(&self) -> Result<FileRegistry> {
        Ok(read_json_opt(&self.registry_path())?.unwrap_or_default())
    }

    /// Register files a run created. Caps the registry at
    /// [`FILE_REGISTRY_CAP`] runs, FIFO.
    pub fn register_files(&self, run_id: &str, files: Vec<CreatedFile>) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let mut registry = self.load_registry()?;
        match registry.runs.iter_mut().find(|e| e.run_id == run_id) {
            Some(entry) => entry.files.extend(files),
            None => registry.runs.push(RegistryEntry {
                run_id: run_id.to_string(),
                files,
            }),
        }
        while registry.runs.len() > FILE_REGISTRY_CAP {
            registry.runs.remove(0);
        }
        write_json_atomic(&self.registry_path(), &registry)
    }

    /// Delete the files registered for one run (or all runs when `run_id`
    /// is `None`). Returns the paths that were (or would be) removed.
    /// Missing files are skipped silently; with `dry_run` nothing is
    /// touched.
    pub fn cleanup_files(&self, run_id: Option<&str>, dry_run: bool) -> Result<Vec<PathBuf>> {
        let mut registry = self.load_registry()?;
        let mut removed = Vec::new();

        let selected: Vec<usize> = registry
            .runs
            .iter()
            .enumerate()
            .filter(|(_, e)| run_id.map(|id| e.run_id == id).unwrap_or(true))
            .map(|(i, _)| i)
            .collect();

        for idx in &selected {
            for file in &registry.runs[*idx].files {
                for path in [&file.vault_path, &file.dropbox_path].into_iter().flatten() {
                    if path.exists() {
                        if !dry_run {
                            fs::remove_file(path).with_context(|| {
                                format!("failed to remove {}", path.display())
                            })?;
                        }
                        removed.push(path.clone());
                    }
                }
            }
        }

        if !dry_run {
            for idx in selected.into_iter().rev() {
                registry.runs.remove(idx);
            }
            write_json_atomic(&self.registry_path(), &registry)?;
        }

        Ok(removed)
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .context("store path has no parent directory")?;
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create store dir {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(value).context("failed to serialize document")?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(&json).context("failed to write temp file")?;
    tmp.as_file().sync_all().ok();
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;

    debug!(path = %path.display(), bytes = json.len(), "wrote document");
    Ok(())
}

fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{compute_summary, RunMode, TestResult};
    use std::collections::BTreeMap;

    fn store() -> (tempfile::TempDir, RunStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        (dir, store)
    }

    fn run_with_id(run_id: &str) -> TestRun {
        let mut results = BTreeMap::new();
        results.insert("t1".to_string(), TestResult::pending());
        let now = Utc::now();
        TestRun {
            run_id: run_id.to_string(),
            status: RunStatus::InProgress,
            created_at: now,
            updated_at: now,
            completed_at: None,
            mode: RunMode::Full,
            filters: None,
            summary: compute_summary(&results),
            results,
        }
    }

    #[test]
    fn run_ids_are_date_sequenced_and_unique() {
        let (_dir, store) = store();
        let date = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();

        let id1 = store.next_run_id(date).unwrap();
        assert_eq!(id1, "run-2025-03-14-001");
        store.save_run(&run_with_id(&id1)).unwrap();

        let id2 = store.next_run_id(date).unwrap();
        assert_eq!(id2, "run-2025-03-14-002");
        store.save_run(&run_with_id(&id2)).unwrap();

        let id3 = store.next_run_id(date).unwrap();
        assert_eq!(id3, "run-2025-03-14-003");

        // A different date starts its own sequence.
        let other = NaiveDate::from_ymd_opt(2025, 3, 15).unwrap();
        assert_eq!(store.next_run_id(other).unwrap(), "run-2025-03-15-001");
    }

    #[test]
    fn run_round_trips_through_json() {
        let (_dir, store) = store();
        let mut run = run_with_id("run-2025-03-14-001");
        run.results.insert(
            "t2".to_string(),
            TestResult {
                status: crate::tracker::TestStatus::Passed,
                duration_ms: 42,
                ..TestResult::pending()
            },
        );
        run.summary = compute_summary(&run.results);
        store.save_run(&run).unwrap();

        let loaded = store.load_run(&run.run_id).unwrap().unwrap();
        assert_eq!(loaded.summary, run.summary);
        assert_eq!(loaded.results.len(), run.results.len());
        assert_eq!(
            loaded.results["t2"].status,
            crate::tracker::TestStatus::Passed
        );
    }

    #[test]
    fn latest_in_progress_scans_newest_first() {
        let (_dir, store) = store();
        let mut old = run_with_id("run-2025-03-14-001");
        old.status = RunStatus::Completed;
        store.save_run(&old).unwrap();
        store.save_run(&run_with_id("run-2025-03-14-002")).unwrap();
        let mut newer_done = run_with_id("run-2025-03-14-003");
        newer_done.status = RunStatus::Abandoned;
        store.save_run(&newer_done).unwrap();

        let resumed = store.latest_in_progress().unwrap().unwrap();
        assert_eq!(resumed.run_id, "run-2025-03-14-002");
    }

    #[test]
    fn registry_caps_at_fifty_runs() {
        let (_dir, store) = store();
        for i in 0..(FILE_REGISTRY_CAP + 5) {
            store
                .register_files(
                    &format!("run-{i:03}"),
                    vec![CreatedFile {
                        test_id: "t".into(),
                        vault_path: Some(PathBuf::from("/nonexistent")),
                        dropbox_path: None,
                        created_at: Utc::now(),
                    }],
                )
                .unwrap();
        }
        let registry = store.load_registry().unwrap();
        assert_eq!(registry.runs.len(), FILE_REGISTRY_CAP);
        assert_eq!(registry.runs[0].run_id, "run-005");
    }

    #[test]
    fn cleanup_dry_run_deletes_nothing() {
        let (dir, store) = store();
        let victim = dir.path().join("note.md");
        fs::write(&victim, "content").unwrap();
        store
            .register_files(
                "run-x",
                vec![CreatedFile {
                    test_id: "t".into(),
                    vault_path: Some(victim.clone()),
                    dropbox_path: None,
                    created_at: Utc::now(),
                }],
            )
            .unwrap();

        let would_remove = store.cleanup_files(Some("run-x"), true).unwrap();
        assert_eq!(would_remove, vec![victim.clone()]);
        assert!(victim.exists());

        let removed = store.cleanup_files(Some("run-x"), false).unwrap();
        assert_eq!(removed, vec![victim.clone()]);
        assert!(!victim.exists());
        assert!(store.load_registry().unwrap().runs.is_empty());
    }
}
