//! Validation engine
//!
//! Pure scoring of an [`OutputSnapshot`] against a spec's [`Expected`]
//! contract. Every check carries a `reasoning` string naming the concrete
//! field or text examined and the value found; checks are the audit trail
//! when a run fails long after the code that produced it has changed, so
//! "passed"/"failed" alone is never enough.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;
use crate::snapshot::OutputSnapshot;
use crate::spec::{Expected, FieldExpectation, TestSpec};

/// Closed set of check kinds, so new expectation categories force an
/// explicit decision here rather than an ad hoc record shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    ArtifactPresence,
    TagPresent,
    TagAbsent,
    FieldMatch,
    ContentIncludes,
    ContentExcludes,
    Pipeline,
    ArchivePattern,
    DropboxSync,
    DatePrefix,
    TraceIncludes,
}

/// One atomic pass/fail assertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub kind: CheckKind,
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub reasoning: String,
}

impl ValidationCheck {
    fn new(kind: CheckKind, name: impl Into<String>, passed: bool, reasoning: String) -> Self {
        Self {
            kind,
            name: name.into(),
            passed,
            expected: None,
            actual: None,
            error: None,
            reasoning,
        }
    }

    fn with_values(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub passed: bool,
    pub checks: Vec<ValidationCheck>,
}

/// Normalize a tag for comparison: case-insensitive, `-` and `_`
/// interchangeable.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase().replace('_', "-")
}

fn normalize_trace(text: &str) -> String {
    let stripped: String = text.chars().filter(|c| *c != '"' && *c != '\'').collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Score `snapshot` against `spec.expected`.
///
/// The presence check is a prerequisite but not a gate: when no artifact was
/// produced every other check still runs against empty/default data, so one
/// missing output does not swallow the rest of the diagnostics. An empty
/// contract yields no checks and a vacuous pass; authoring at least one
/// expectation is the spec author's job.
pub fn validate(spec: &TestSpec, snapshot: &OutputSnapshot) -> ValidationOutcome {
    let expected = &spec.expected;
    let mut checks = Vec::new();

    if expected.is_empty() {
        return ValidationOutcome {
            passed: true,
            checks,
        };
    }

    checks.push(presence_check(snapshot));
    check_tags(expected, snapshot, &mut checks);
    check_frontmatter(expected, snapshot, &mut checks);
    check_content(expected, snapshot, &mut checks);
    check_pipeline(expected, snapshot, &mut checks);
    check_archive(expected, snapshot, &mut checks);
    check_dropbox(expected, snapshot, &mut checks);
    check_date_prefix(expected, snapshot, &mut checks);
    check_trace(expected, snapshot, &mut checks);

    ValidationOutcome {
        passed: checks.iter().all(|c| c.passed),
        checks,
    }
}

fn presence_check(snapshot: &OutputSnapshot) -> ValidationCheck {
    let count = snapshot.artifacts.len();
    let passed = count > 0;
    let reasoning = if passed {
        format!(
            "examined produced artifacts: found {} file(s), primary '{}'",
            count,
            snapshot.primary().map(|a| a.basename()).unwrap_or_default()
        )
    } else {
        "examined produced artifacts: no output file was produced; remaining checks run \
         against empty data"
            .to_string()
    };
    ValidationCheck::new(CheckKind::ArtifactPresence, "artifact-presence", passed, reasoning)
}

fn check_tags(expected: &Expected, snapshot: &OutputSnapshot, checks: &mut Vec<ValidationCheck>) {
    let observed = snapshot.tags();
    let normalized: Vec<String> = observed.iter().map(|t| normalize_tag(t)).collect();

    for tag in &expected.tags {
        let wanted = normalize_tag(tag);
        let passed = normalized.contains(&wanted);
        let reasoning = format!(
            "examined frontmatter 'tags' {:?} for '{}' (normalized '{}'): {}",
            observed,
            tag,
            wanted,
            if passed { "present" } else { "not present" }
        );
        checks.push(
            ValidationCheck::new(CheckKind::TagPresent, format!("tag:{tag}"), passed, reasoning)
                .with_values(tag.clone(), format!("{observed:?}")),
        );
    }

    for tag in &expected.excluded_tags {
        let unwanted = normalize_tag(tag);
        let passed = !normalized.contains(&unwanted);
        let reasoning = format!(
            "examined frontmatter 'tags' {:?} for excluded '{}' (normalized '{}'): {}",
            observed,
            tag,
            unwanted,
            if passed { "correctly absent" } else { "present but must not be" }
        );
        checks.push(
            ValidationCheck::new(CheckKind::TagAbsent, format!("no-tag:{tag}"), passed, reasoning)
                .with_values(format!("not {tag}"), format!("{observed:?}")),
        );
    }
}

fn check_frontmatter(
    expected: &Expected,
    snapshot: &OutputSnapshot,
    checks: &mut Vec<ValidationCheck>,
) {
    let metadata = snapshot
        .primary()
        .map(|a| a.metadata.clone())
        .unwrap_or_default();

    for (field, expectation) in &expected.frontmatter {
        let observed = metadata.get(field);
        let check = match expectation {
            FieldExpectation::Equals { value } => {
                let passed = observed == Some(value);
                let reasoning = match observed {
                    Some(found) => format!(
                        "examined frontmatter field '{}': found {}, expected {}",
                        field, found, value
                    ),
                    None => format!(
                        "examined frontmatter field '{}': field is missing, expected {}",
                        field, value
                    ),
                };
                ValidationCheck::new(
                    CheckKind::FieldMatch,
                    format!("frontmatter:{field}"),
                    passed,
                    reasoning,
                )
                .with_values(
                    value.to_string(),
                    observed.map(|v| v.to_string()).unwrap_or_else(|| "<missing>".into()),
                )
            }
            FieldExpectation::Exists { type_name } => {
                let (passed, reasoning) = match observed {
                    Some(found) => {
                        let actual_type = json_type_name(found);
                        let ok = actual_type == type_name;
                        let reasoning = if ok {
                            format!(
                                "examined frontmatter field '{}': present with {} value {}",
                                field, actual_type, found
                            )
                        } else {
                            format!(
                                "examined frontmatter field '{}': found {} value {}, which is \
                                 not a {}",
                                field, actual_type, found, type_name
                            )
                        };
                        (ok, reasoning)
                    }
                    None => (
                        false,
                        format!(
                            "examined frontmatter field '{}': field is missing, expected a {}",
                            field, type_name
                        ),
                    ),
                };
                ValidationCheck::new(
                    CheckKind::FieldMatch,
                    format!("frontmatter:{field}"),
                    passed,
                    reasoning,
                )
                .with_values(
                    format!("<{type_name}>"),
                    observed.map(|v| v.to_string()).unwrap_or_else(|| "<missing>".into()),
                )
            }
        };
        checks.push(check);
    }
}

fn check_content(expected: &Expected, snapshot: &OutputSnapshot, checks: &mut Vec<ValidationCheck>) {
    let body = snapshot.combined_body().to_lowercase();

    for needle in &expected.content_includes {
        let passed = body.contains(&needle.to_lowercase());
        let reasoning = format!(
            "searched combined body of {} artifact(s) ({} chars) for '{}': {}",
            snapshot.artifacts.len(),
            body.len(),
            needle,
            if passed { "found" } else { "not found" }
        );
        checks.push(ValidationCheck::new(
            CheckKind::ContentIncludes,
            format!("content:{needle}"),
            passed,
            reasoning,
        ));
    }

    for needle in &expected.content_excludes {
        let passed = !body.contains(&needle.to_lowercase());
        let reasoning = format!(
            "searched combined body of {} artifact(s) for excluded '{}': {}",
            snapshot.artifacts.len(),
            needle,
            if passed { "correctly absent" } else { "present but must not be" }
        );
        checks.push(ValidationCheck::new(
            CheckKind::ContentExcludes,
            format!("no-content:{needle}"),
            passed,
            reasoning,
        ));
    }
}

fn check_pipeline(expected: &Expected, snapshot: &OutputSnapshot, checks: &mut Vec<ValidationCheck>) {
    let Some(wanted) = &expected.pipeline else {
        return;
    };
    let observed = snapshot
        .primary()
        .and_then(|a| a.metadata.get("pipeline"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let passed = observed
        .as_deref()
        .map(|p| p.eq_ignore_ascii_case(wanted))
        .unwrap_or(false);
    let reasoning = match &observed {
        Some(found) => format!(
            "examined frontmatter 'pipeline': found '{}', expected '{}' (case-insensitive)",
            found, wanted
        ),
        None => format!(
            "examined frontmatter 'pipeline': field is missing, expected '{}'",
            wanted
        ),
    };
    checks.push(
        ValidationCheck::new(CheckKind::Pipeline, "pipeline", passed, reasoning).with_values(
            wanted.clone(),
            observed.unwrap_or_else(|| "<missing>".into()),
        ),
    );
}

fn check_archive(expected: &Expected, snapshot: &OutputSnapshot, checks: &mut Vec<ValidationCheck>) {
    let Some(pattern) = &expected.archive_pattern else {
        return;
    };
    let basename = snapshot
        .archive_path
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned());

    let check = match Regex::new(&format!("(?i){pattern}")) {
        Ok(re) => {
            let passed = basename.as_deref().map(|b| re.is_match(b)).unwrap_or(false);
            let reasoning = match &basename {
                Some(name) => format!(
                    "matched archive basename '{}' against pattern '{}': {}",
                    name,
                    pattern,
                    if passed { "match" } else { "no match" }
                ),
                None => format!(
                    "no archive path was recorded, expected basename matching '{}'",
                    pattern
                ),
            };
            ValidationCheck::new(CheckKind::ArchivePattern, "archive-pattern", passed, reasoning)
                .with_values(pattern.clone(), basename.unwrap_or_else(|| "<none>".into()))
        }
        Err(e) => {
            let error = HarnessError::Pattern {
                pattern: pattern.clone(),
                source: e,
            };
            let mut check = ValidationCheck::new(
                CheckKind::ArchivePattern,
                "archive-pattern",
                false,
                error.to_string(),
            );
            check.error = Some(error.to_string());
            check
        }
    };
    checks.push(check);
}

fn check_dropbox(expected: &Expected, snapshot: &OutputSnapshot, checks: &mut Vec<ValidationCheck>) {
    let Some(wanted) = expected.dropbox_sync else {
        return;
    };
    let synced = snapshot.dropbox_path.is_some();
    let passed = synced == wanted;
    let reasoning = format!(
        "examined dropbox path: {}, expected sync={}",
        match &snapshot.dropbox_path {
            Some(p) => format!("present ('{}')", p.display()),
            None => "absent".to_string(),
        },
        wanted
    );
    checks.push(
        ValidationCheck::new(CheckKind::DropboxSync, "dropbox-sync", passed, reasoning)
            .with_values(wanted.to_string(), synced.to_string()),
    );
}

fn check_date_prefix(
    expected: &Expected,
    snapshot: &OutputSnapshot,
    checks: &mut Vec<ValidationCheck>,
) {
    let Some(prefix) = &expected.date_prefix else {
        return;
    };
    let basename = snapshot.primary().map(|a| a.basename()).unwrap_or_default();
    let passed = basename.starts_with(prefix.as_str());
    let reasoning = format!(
        "examined output filename '{}': expected literal date prefix '{}', since the document's \
         intrinsic date must drive naming, not the processing date",
        basename, prefix
    );
    checks.push(
        ValidationCheck::new(CheckKind::DatePrefix, "date-prefix", passed, reasoning)
            .with_values(prefix.clone(), basename),
    );
}

fn check_trace(expected: &Expected, snapshot: &OutputSnapshot, checks: &mut Vec<ValidationCheck>) {
    if expected.trace_includes.is_empty() {
        return;
    }
    let haystack = normalize_trace(&snapshot.trace).to_lowercase();

    for needle in &expected.trace_includes {
        let wanted = normalize_trace(needle).to_lowercase();
        let passed = haystack.contains(&wanted);
        let reasoning = format!(
            "searched normalized trace ({} chars, quotes stripped, whitespace collapsed) for \
             '{}': {}",
            haystack.len(),
            needle,
            if passed { "found" } else { "not found" }
        );
        checks.push(ValidationCheck::new(
            CheckKind::TraceIncludes,
            format!("trace:{needle}"),
            passed,
            reasoning,
        ));
    }
}
