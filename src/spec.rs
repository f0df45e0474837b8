//! Test spec model and registry
//!
//! A [`TestSpec`] is the immutable, author-defined contract for one test:
//! what input drives the pipeline and what the output must look like.
//! Specs are built in code or loaded from YAML files in a spec directory;
//! the registry answers lookups by id, category, or group.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{HarnessError, Result};

/// One expectation for a frontmatter field.
///
/// YAML-authored specs may still use the legacy sentinel: a bare value of
/// `"string"` means "field must exist and be a string", not a literal
/// comparison. A field whose real value is literally `"string"` therefore
/// cannot be asserted with the bare form; use the tagged
/// `{kind: equals, value: "string"}` form for that.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldExpectation {
    /// Field must equal this exact value.
    Equals { value: serde_json::Value },
    /// Field must exist and have the named JSON type.
    Exists { type_name: String },
}

impl<'de> Deserialize<'de> for FieldExpectation {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;

        if let Some(map) = value.as_object() {
            if let Some(kind) = map.get("kind").and_then(|k| k.as_str()) {
                return match kind {
                    "equals" => {
                        let inner = map
                            .get("value")
                            .cloned()
                            .ok_or_else(|| D::Error::missing_field("value"))?;
                        Ok(FieldExpectation::Equals { value: inner })
                    }
                    "exists" => {
                        let type_name = map
                            .get("type_name")
                            .and_then(|t| t.as_str())
                            .ok_or_else(|| D::Error::missing_field("type_name"))?;
                        Ok(FieldExpectation::Exists {
                            type_name: type_name.to_string(),
                        })
                    }
                    other => Err(D::Error::unknown_variant(other, &["equals", "exists"])),
                };
            }
        }

        // Legacy sentinel: bare "string" is a type assertion, anything else
        // is a literal match.
        if value.as_str() == Some("string") {
            return Ok(FieldExpectation::Exists {
                type_name: "string".to_string(),
            });
        }

        Ok(FieldExpectation::Equals { value })
    }
}

/// Semantic-judge expectations for a spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticSpec {
    /// What the judge should evaluate, in prose.
    pub description: String,
    /// Discrete checkpoints the judge must answer individually.
    #[serde(default)]
    pub checkpoints: Vec<String>,
}

/// Deterministic expectation contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Expected {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub excluded_tags: Vec<String>,
    #[serde(default)]
    pub frontmatter: BTreeMap<String, FieldExpectation>,
    #[serde(default)]
    pub content_includes: Vec<String>,
    #[serde(default)]
    pub content_excludes: Vec<String>,
    #[serde(default)]
    pub pipeline: Option<String>,
    /// Case-insensitive regex matched against the archive file basename.
    #[serde(default)]
    pub archive_pattern: Option<String>,
    #[serde(default)]
    pub dropbox_sync: Option<bool>,
    /// Output filename must literally start with this `YYYY-MM-DD` string.
    #[serde(default)]
    pub date_prefix: Option<String>,
    #[serde(default)]
    pub trace_includes: Vec<String>,
    #[serde(default)]
    pub semantic: Option<SemanticSpec>,
}

impl Expected {
    /// True when no deterministic expectation is present at all.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
            && self.excluded_tags.is_empty()
            && self.frontmatter.is_empty()
            && self.content_includes.is_empty()
            && self.content_excludes.is_empty()
            && self.pipeline.is_none()
            && self.archive_pattern.is_none()
            && self.dropbox_sync.is_none()
            && self.date_prefix.is_none()
            && self.trace_includes.is_empty()
    }
}

/// What drives the test: inline text or a captured fixture file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputDescriptor {
    /// Input kind as the pipeline understands it ("text", "voice", "youtube", ...).
    #[serde(default = "default_input_kind")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub fixture: Option<PathBuf>,
    /// Pipeline profile to process under.
    #[serde(default)]
    pub profile: Option<String>,
}

fn default_input_kind() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecMeta {
    /// When set, the test is seeded as skipped with this reason.
    #[serde(default)]
    pub skip: Option<String>,
    /// Ids of tests whose setup must run first.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Immutable, author-defined test specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    pub id: String,
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub input: InputDescriptor,
    #[serde(default)]
    pub expected: Expected,
    #[serde(default)]
    pub meta: SpecMeta,
}

/// Registry of all known specs with id/category/group lookups.
pub struct SpecRegistry {
    specs: Vec<TestSpec>,
}

impl SpecRegistry {
    pub fn new(specs: Vec<TestSpec>) -> Self {
        Self { specs }
    }

    /// Load every `*.yaml`/`*.yml` file under `dir`. A file may hold a
    /// single spec or a list of specs.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut specs = Vec::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }

            let raw = fs::read_to_string(&path)?;
            let mut loaded = parse_spec_file(&raw)
                .map_err(|e| HarnessError::Spec(format!("{}: {}", path.display(), e)))?;
            specs.append(&mut loaded);
        }

        for spec in &specs {
            let dupes = specs.iter().filter(|s| s.id == spec.id).count();
            if dupes > 1 {
                return Err(HarnessError::Spec(format!(
                    "duplicate test id '{}'",
                    spec.id
                )));
            }
        }

        Ok(Self { specs })
    }

    pub fn get(&self, id: &str) -> Option<&TestSpec> {
        self.specs.iter().find(|s| s.id == id)
    }

    pub fn all(&self) -> &[TestSpec] {
        &self.specs
    }

    pub fn by_category(&self, category: &str) -> Vec<&TestSpec> {
        self.specs
            .iter()
            .filter(|s| s.category == category)
            .collect()
    }

    pub fn by_group(&self, group: &str) -> Vec<&TestSpec> {
        self.specs
            .iter()
            .filter(|s| s.group.as_deref() == Some(group))
            .collect()
    }

    pub fn list_ids(&self) -> Vec<&str> {
        self.specs.iter().map(|s| s.id.as_str()).collect()
    }
}

fn parse_spec_file(raw: &str) -> std::result::Result<Vec<TestSpec>, serde_yaml::Error> {
    match serde_yaml::from_str::<Vec<TestSpec>>(raw) {
        Ok(list) => Ok(list),
        Err(_) => serde_yaml::from_str::<TestSpec>(raw).map(|s| vec![s]),
    }
}
