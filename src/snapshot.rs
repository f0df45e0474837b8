//! Observed output snapshot
//!
//! What a test actually produced: the artifact files with their parsed
//! frontmatter and bodies, the archive/dropbox paths, and the captured
//! processing trace. The validation engine scores a snapshot against a
//! spec's expectation contract.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One produced output file with parsed structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    /// Parsed frontmatter key/value map (empty when the file had none).
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Document body with frontmatter stripped.
    #[serde(default)]
    pub body: String,
}

impl Artifact {
    /// Read a Markdown file and split `---`-delimited YAML frontmatter
    /// from the body. A file without frontmatter is all body.
    pub fn from_markdown_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let (metadata, body) = split_frontmatter(&raw);
        Ok(Self {
            path: path.to_path_buf(),
            metadata,
            body,
        })
    }

    pub fn basename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn split_frontmatter(raw: &str) -> (BTreeMap<String, serde_json::Value>, String) {
    let trimmed = raw.trim_start_matches('\u{feff}');
    if let Some(rest) = trimmed.strip_prefix("---\n") {
        if let Some(end) = rest.find("\n---") {
            let yaml = &rest[..end];
            let body = rest[end + 4..].trim_start_matches('\n').to_string();
            if let Ok(map) = serde_yaml::from_str::<BTreeMap<String, serde_json::Value>>(yaml) {
                return (map, body);
            }
        }
    }
    (BTreeMap::new(), trimmed.to_string())
}

/// Everything observed from one test execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSnapshot {
    /// Produced artifacts, primary first.
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub archive_path: Option<PathBuf>,
    #[serde(default)]
    pub dropbox_path: Option<PathBuf>,
    /// Captured console/log trace text.
    #[serde(default)]
    pub trace: String,
}

impl OutputSnapshot {
    /// Build from explicit artifact file paths. Unreadable paths are
    /// skipped; a missing artifact is a validation finding, not an error.
    pub fn from_files<P: AsRef<Path>>(paths: &[P], trace: String) -> Self {
        let artifacts = paths
            .iter()
            .filter_map(|p| Artifact::from_markdown_file(p.as_ref()).ok())
            .collect();
        Self {
            artifacts,
            archive_path: None,
            dropbox_path: None,
            trace,
        }
    }

    /// Build by scanning a vault directory for Markdown files.
    pub fn from_vault_dir(dir: &Path, trace: String) -> Result<Self> {
        Ok(Self::from_files(&markdown_files(dir)?, trace))
    }

    /// The primary artifact, when anything was produced at all.
    pub fn primary(&self) -> Option<&Artifact> {
        self.artifacts.first()
    }

    /// Concatenation of every artifact body. Secondary artifacts (derived
    /// summaries) may carry content the primary does not, so content checks
    /// search all of them.
    pub fn combined_body(&self) -> String {
        self.artifacts
            .iter()
            .map(|a| a.body.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Tags from the primary artifact's string-array `tags` field.
    pub fn tags(&self) -> Vec<String> {
        self.primary()
            .and_then(|a| a.metadata.get("tags"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| t.as_str())
                    .map(|t| t.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Vault contents observed before a test ran. Tests that share a live
/// vault (acceptance, daemon) validate against the difference, so a
/// leftover artifact from an earlier test never reaches their checks.
#[derive(Debug, Clone, Default)]
pub struct VaultBaseline {
    seen: BTreeSet<PathBuf>,
}

impl VaultBaseline {
    pub fn capture(dir: &Path) -> Result<Self> {
        Ok(Self {
            seen: markdown_files(dir)?.into_iter().collect(),
        })
    }

    /// Snapshot only the Markdown files that appeared after the baseline
    /// was captured.
    pub fn snapshot_new(&self, dir: &Path, trace: String) -> Result<OutputSnapshot> {
        let paths: Vec<PathBuf> = markdown_files(dir)?
            .into_iter()
            .filter(|p| !self.seen.contains(p))
            .collect();
        Ok(OutputSnapshot::from_files(&paths, trace))
    }
}

fn markdown_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = Vec::new();
    if dir.is_dir() {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("md") {
                paths.push(path);
            }
        }
    }
    paths.sort();
    Ok(paths)
}

/// Compact capture stored on a `TestResult` for later auditing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActualSnapshot {
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub frontmatter: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub vault_path: Option<PathBuf>,
    #[serde(default)]
    pub content_excerpt: Option<String>,
}

const EXCERPT_LEN: usize = 400;

impl ActualSnapshot {
    pub fn capture(snapshot: &OutputSnapshot) -> Self {
        let primary = snapshot.primary();
        let excerpt = primary.map(|a| {
            let mut body: String = a.body.chars().take(EXCERPT_LEN).collect();
            if a.body.chars().count() > EXCERPT_LEN {
                body.push('…');
            }
            body
        });
        Self {
            pipeline: primary
                .and_then(|a| a.metadata.get("pipeline"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            tags: snapshot.tags(),
            frontmatter: primary.map(|a| a.metadata.clone()).unwrap_or_default(),
            vault_path: primary.map(|a| a.path.clone()),
            content_excerpt: excerpt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_frontmatter_and_body() {
        let raw = "---\ntitle: Note\ntags:\n  - inbox\n  - trading\n---\n\nBody text here.\n";
        let (meta, body) = split_frontmatter(raw);
        assert_eq!(meta["title"], serde_json::json!("Note"));
        assert_eq!(body.trim(), "Body text here.");

        let plain = "No frontmatter at all.";
        let (meta, body) = split_frontmatter(plain);
        assert!(meta.is_empty());
        assert_eq!(body, plain);
    }

    #[test]
    fn tags_read_from_primary_artifact() {
        let snapshot = OutputSnapshot {
            artifacts: vec![Artifact {
                path: PathBuf::from("note.md"),
                metadata: BTreeMap::from([(
                    "tags".to_string(),
                    serde_json::json!(["alpha", "beta"]),
                )]),
                body: String::new(),
            }],
            ..Default::default()
        };
        assert_eq!(snapshot.tags(), vec!["alpha", "beta"]);
        assert!(OutputSnapshot::default().tags().is_empty());
    }

    #[test]
    fn combined_body_spans_all_artifacts() {
        let snapshot = OutputSnapshot {
            artifacts: vec![
                Artifact {
                    path: PathBuf::from("a.md"),
                    metadata: BTreeMap::new(),
                    body: "primary".into(),
                },
                Artifact {
                    path: PathBuf::from("b.md"),
                    metadata: BTreeMap::new(),
                    body: "derived summary".into(),
                },
            ],
            ..Default::default()
        };
        let body = snapshot.combined_body();
        assert!(body.contains("primary"));
        assert!(body.contains("derived summary"));
    }

    #[test]
    fn baseline_snapshot_sees_only_files_added_after_capture() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("earlier.md"), "---\ntags:\n  - old\n---\nstale\n").unwrap();

        let baseline = VaultBaseline::capture(dir.path()).unwrap();
        fs::write(dir.path().join("fresh.md"), "---\ntags:\n  - new\n---\nfresh\n").unwrap();

        let snapshot = baseline.snapshot_new(dir.path(), String::new()).unwrap();
        assert_eq!(snapshot.artifacts.len(), 1);
        assert_eq!(snapshot.primary().unwrap().basename(), "fresh.md");
        assert_eq!(snapshot.tags(), vec!["new"]);
    }

    #[test]
    fn capture_truncates_excerpt() {
        let long_body = "x".repeat(EXCERPT_LEN + 50);
        let snapshot = OutputSnapshot {
            artifacts: vec![Artifact {
                path: PathBuf::from("n.md"),
                metadata: BTreeMap::new(),
                body: long_body,
            }],
            ..Default::default()
        };
        let actual = ActualSnapshot::capture(&snapshot);
        let excerpt = actual.content_excerpt.unwrap();
        assert_eq!(excerpt.chars().count(), EXCERPT_LEN + 1);
        assert!(excerpt.ends_with('…'));
    }
}
