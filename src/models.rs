//! Core data models used throughout the ingestion pipeline.
//!
//! Row types mirror the SQLite schema in [`crate::migrate`]; the summary types
//! are what a finished job reports alongside `SUCCESS`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Immutable view of a project's configuration, read once at job start and
/// handed to every stage.
#[derive(Debug, Clone, Default)]
pub struct ProjectConfig {
    pub id: i64,
    pub title: String,
    pub collection_id: String,
    pub archive_path: Option<PathBuf>,
    /// Dictionary ids selected by the project, in selection order.
    pub selected_dictionaries: Vec<i64>,
    /// Raw tag type -> dictionary type.
    pub tag_type_translator: BTreeMap<String, String>,
    pub ignored_tag_types: BTreeSet<String>,
    pub date_tag_types: BTreeSet<String>,
}

impl ProjectConfig {
    /// Dictionary type a raw tag type resolves against (identity when untranslated).
    pub fn translate<'a>(&'a self, tag_type: &'a str) -> &'a str {
        self.tag_type_translator
            .get(tag_type)
            .map(String::as_str)
            .unwrap_or(tag_type)
    }

    pub fn is_ignored_type(&self, tag_type: &str) -> bool {
        self.ignored_tag_types.contains(tag_type)
    }

    pub fn is_date_type(&self, tag_type: &str) -> bool {
        self.date_tag_types.contains(tag_type)
    }
}

/// A document row.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: i64,
    pub project_id: i64,
    pub source_doc_id: String,
    pub title: String,
    pub metadata: serde_json::Value,
    pub is_parked: bool,
    pub workflow_remarks: String,
}

/// A page row without its (potentially large) parsed content.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub id: i64,
    pub document_id: i64,
    pub source_page_id: String,
    pub page_number: i64,
    pub xml_path: String,
    pub last_parsed_at: Option<i64>,
    pub is_ignored: bool,
    pub num_tags: i64,
}

/// A page tag row.
#[derive(Debug, Clone, Serialize)]
pub struct PageTag {
    pub id: i64,
    pub page_id: i64,
    pub variation: String,
    pub variation_type: String,
    pub additional_information: serde_json::Value,
    pub dictionary_entry_id: Option<i64>,
    pub date_variation_id: Option<i64>,
}

impl PageTag {
    pub fn is_resolved(&self) -> bool {
        self.dictionary_entry_id.is_some() || self.date_variation_id.is_some()
    }
}

/// Lifecycle states of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Progress,
    Success,
    Failure,
    Revoked,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Progress => "PROGRESS",
            JobState::Success => "SUCCESS",
            JobState::Failure => "FAILURE",
            JobState::Revoked => "REVOKED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobState::Pending),
            "PROGRESS" => Some(JobState::Progress),
            "SUCCESS" => Some(JobState::Success),
            "FAILURE" => Some(JobState::Failure),
            "REVOKED" => Some(JobState::Revoked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failure | JobState::Revoked
        )
    }
}

/// Which pipeline a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Archive extraction through tag extraction.
    Extract,
    /// Tag extraction only, over already parsed pages.
    Tags,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Extract => "extract",
            JobKind::Tags => "tags",
        }
    }
}

/// Polled status record of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub project_id: i64,
    pub user: String,
    pub kind: String,
    pub state: JobState,
    pub percent: f64,
    pub status_text: String,
    pub error: Option<String>,
    pub summary: Option<serde_json::Value>,
    pub cancel_requested: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractSummary {
    pub page_files: u64,
    pub metadata_files: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub documents_created: u64,
    pub documents_revisited: u64,
    pub documents_deleted: u64,
    pub pages_created: u64,
    pub pages_updated: u64,
    pub pages_unchanged: u64,
    pub pages_deleted: u64,
    /// Files without the three required identifiers, or unreadable as XML.
    pub files_skipped: u64,
    /// Export entries that mapped onto a page already seen in this run.
    pub duplicate_pages: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParseSummary {
    pub pages_parsed: u64,
    pub pages_ignored: u64,
    /// Pages whose source file is gone; their previous parse is kept.
    pub files_missing: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagSummary {
    pub pages: u64,
    pub tags_created: u64,
    pub entries_resolved: u64,
    pub dates_resolved: u64,
    pub unresolved: u64,
    /// Tags of ignored types, stored without a resolution attempt.
    pub ignored_type: u64,
    /// Tag entries without text or type.
    pub tags_skipped: u64,
    pub ambiguous_matches: u64,
}

/// Structured outcome attached to a successful job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extract: Option<ExtractSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile: Option<ReconcileSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse: Option<ParseSummary>,
    pub tags: TagSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_falls_back_to_identity() {
        let mut project = ProjectConfig::default();
        project
            .tag_type_translator
            .insert("place".to_string(), "city".to_string());
        assert_eq!(project.translate("place"), "city");
        assert_eq!(project.translate("person"), "person");
    }

    #[test]
    fn only_finished_states_are_terminal() {
        assert_eq!(JobState::parse("REVOKED"), Some(JobState::Revoked));
        assert_eq!(JobState::parse("running"), None);
        assert!(JobState::Failure.is_terminal());
        assert!(!JobState::Progress.is_terminal());
    }
}
