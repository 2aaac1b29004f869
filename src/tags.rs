//! Tag extraction.
//!
//! Walks the parsed content of every page and regenerates that page's
//! `page_tags` rows from scratch, resolving each tag on the way. Tags are
//! never merged with a previous run: the page's old rows are deleted and the
//! new ones inserted in the same transaction.

use serde_json::{json, Map, Value};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::error::PipelineResult;
use crate::models::{ProjectConfig, TagSummary};
use crate::progress::{Stage, StageProgress};
use crate::resolve::{Resolution, Vocabulary};

/// Custom-structure entries that describe layout rather than annotations.
const LAYOUT_TYPES: &[&str] = &["readingOrder", "structure"];

/// One annotation found in a page's parsed content.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedTag {
    pub variation: String,
    pub tag_type: String,
    pub additional: Map<String, Value>,
}

/// Result of walking one page: the usable tags plus a description of every
/// entry that had to be skipped.
#[derive(Debug, Default)]
pub struct PageWalk {
    pub tags: Vec<ExtractedTag>,
    pub anomalies: Vec<String>,
}

/// Collect the tags of a parsed page, in element order.
pub fn walk_tags(parsed: &Value) -> PageWalk {
    let mut walk = PageWalk::default();
    let Some(elements) = parsed.get("elements").and_then(Value::as_array) else {
        return walk;
    };

    let mut global_line = 0u64;
    for (region_index, element) in elements.iter().enumerate() {
        let element_id = element
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("synthetic_region_{}", region_index));
        let data = element.get("element_data").unwrap_or(&Value::Null);
        let text_lines: Vec<&str> = data
            .get("text_lines")
            .and_then(Value::as_array)
            .map(|lines| lines.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let entries = data
            .get("custom_list_structure")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        for (entry_index, entry) in entries.iter().enumerate() {
            let Some(entry) = entry.as_object() else {
                walk.anomalies
                    .push(format!("element {} entry {} is not an object", element_id, entry_index));
                continue;
            };
            let tag_type = entry.get("type").and_then(Value::as_str).unwrap_or("").trim();
            if LAYOUT_TYPES.contains(&tag_type) {
                continue;
            }
            if tag_type.is_empty() {
                walk.anomalies
                    .push(format!("element {} entry {} has no type", element_id, entry_index));
                continue;
            }
            let text = entry.get("text").and_then(Value::as_str).unwrap_or("").trim();
            if text.is_empty() {
                walk.anomalies.push(format!(
                    "element {} entry {} ({}) has no text",
                    element_id, entry_index, tag_type
                ));
                continue;
            }

            let line_index = entry.get("line_index").and_then(Value::as_u64).unwrap_or(0);
            let line_text = match entry.get("line_text").and_then(Value::as_str) {
                Some(t) if !t.is_empty() => t.to_string(),
                _ => text_lines.join(" "),
            };

            let mut additional = Map::new();
            for (key, value) in entry {
                if key != "type" && key != "text" {
                    additional.insert(key.clone(), value.clone());
                }
            }
            additional.entry("offset").or_insert_with(|| json!(0));
            additional
                .entry("length")
                .or_insert_with(|| json!(text.chars().count()));
            additional.entry("continued").or_insert_with(|| json!(false));
            additional.entry("line_id").or_insert_with(|| json!(element_id));
            additional.insert("line_text".to_string(), json!(line_text));
            additional.insert("line_index".to_string(), json!(line_index));
            additional.insert("region_index".to_string(), json!(region_index));
            additional.insert("line_index_global".to_string(), json!(global_line + line_index));

            walk.tags.push(ExtractedTag {
                variation: text.to_string(),
                tag_type: tag_type.to_string(),
                additional,
            });
        }

        global_line += text_lines.len() as u64;
    }

    walk
}

/// Regenerate the tags of every page of the project.
pub async fn extract_tags(
    pool: &SqlitePool,
    project: &ProjectConfig,
    user: &str,
    vocabulary: &Vocabulary,
    progress: &dyn StageProgress,
) -> PipelineResult<TagSummary> {
    let pages = sqlx::query(
        r#"
        SELECT p.id, p.parsed_json
        FROM pages p
        JOIN documents d ON d.id = p.document_id
        WHERE d.project_id = ?
        ORDER BY d.source_doc_id, p.page_number, p.id
        "#,
    )
    .bind(project.id)
    .fetch_all(pool)
    .await?;

    let total = pages.len() as u64;
    let mut summary = TagSummary::default();

    for (i, row) in pages.iter().enumerate() {
        let page_id: i64 = row.get("id");
        let parsed_json: Option<String> = row.get("parsed_json");

        let walk = match parsed_json.as_deref().map(serde_json::from_str::<Value>) {
            Some(Ok(parsed)) => walk_tags(&parsed),
            Some(Err(e)) => {
                warn!(page_id, error = %e, "stored page content is not valid JSON");
                PageWalk::default()
            }
            None => {
                warn!(page_id, "page has not been parsed yet");
                PageWalk::default()
            }
        };
        for anomaly in &walk.anomalies {
            warn!(page_id, "skipping tag: {}", anomaly);
        }
        summary.tags_skipped += walk.anomalies.len() as u64;

        let created = replace_page_tags(
            pool,
            project,
            user,
            vocabulary,
            page_id,
            &walk.tags,
            &mut summary,
        )
        .await?;
        summary.pages += 1;

        progress
            .advance(
                Stage::Tags,
                i as u64 + 1,
                total,
                &format!("page {}: {} tags", page_id, created),
            )
            .await?;
    }

    info!(
        project_id = project.id,
        pages = summary.pages,
        tags = summary.tags_created,
        resolved = summary.entries_resolved + summary.dates_resolved,
        unresolved = summary.unresolved,
        ambiguous = summary.ambiguous_matches,
        "tags extracted"
    );
    Ok(summary)
}

async fn replace_page_tags(
    pool: &SqlitePool,
    project: &ProjectConfig,
    user: &str,
    vocabulary: &Vocabulary,
    page_id: i64,
    tags: &[ExtractedTag],
    summary: &mut TagSummary,
) -> PipelineResult<u64> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM page_tags WHERE page_id = ?")
        .bind(page_id)
        .execute(&mut *tx)
        .await?;

    let mut created = 0u64;
    for tag in tags {
        let (entry_id, date_id) = match vocabulary.resolve(project, &tag.variation, &tag.tag_type) {
            Resolution::Entry {
                entry_id,
                ambiguous,
            } => {
                if ambiguous {
                    warn!(
                        page_id,
                        variation = %tag.variation,
                        tag_type = %tag.tag_type,
                        entry_id,
                        "several dictionary entries match, using the lowest id"
                    );
                    summary.ambiguous_matches += 1;
                }
                summary.entries_resolved += 1;
                (Some(entry_id), None)
            }
            Resolution::Date(id) => {
                summary.dates_resolved += 1;
                (None, Some(id))
            }
            Resolution::Unresolved => {
                summary.unresolved += 1;
                (None, None)
            }
            Resolution::IgnoredType => {
                summary.ignored_type += 1;
                (None, None)
            }
        };

        sqlx::query(
            r#"
            INSERT INTO page_tags (page_id, variation, variation_type, additional_json,
                                   dictionary_entry_id, date_variation_id,
                                   created_by, modified_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(page_id)
        .bind(&tag.variation)
        .bind(&tag.tag_type)
        .bind(Value::Object(tag.additional.clone()).to_string())
        .bind(entry_id)
        .bind(date_id)
        .bind(user)
        .bind(user)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        created += 1;
    }

    sqlx::query("UPDATE pages SET num_tags = ?, modified_by = ?, updated_at = ? WHERE id = ?")
        .bind(created as i64)
        .bind(user)
        .bind(now)
        .bind(page_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    summary.tags_created += created;
    Ok(created)
}
