//! Document/page reconciliation.
//!
//! Makes the project's `documents` and `pages` rows match the freshly
//! extracted export: documents and pages are upserted by their external
//! identifiers, page files are renamed to their final deterministic names,
//! and documents missing from the export are deleted together with their
//! pages and files.

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::archive::{ExtractedFile, ExtractedFiles};
use crate::config::Config;
use crate::error::PipelineResult;
use crate::models::{ProjectConfig, ReconcileSummary};
use crate::page_meta::{self, PageMetadata};
use crate::progress::{Stage, StageProgress};

/// Final on-disk name of a page file.
pub fn final_page_name(collection_id: &str, doc_id: &str, page_id: &str, page_nr: i64) -> String {
    format!(
        "{}_{}_{}_{}.xml",
        collection_id,
        path_safe(doc_id),
        path_safe(page_id),
        page_nr
    )
}

fn path_safe(id: &str) -> String {
    id.chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect()
}

fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Merge `fields` into the `transkribus` object of a stored metadata JSON
/// document. Keys already present are overwritten; other keys are kept.
pub fn merge_transkribus(existing: &str, fields: &BTreeMap<String, String>) -> String {
    let mut root = match serde_json::from_str::<serde_json::Value>(existing) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    let section = root
        .entry("transkribus")
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    if !section.is_object() {
        *section = serde_json::Value::Object(serde_json::Map::new());
    }
    if let serde_json::Value::Object(map) = section {
        for (key, value) in fields {
            map.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
    }
    serde_json::Value::Object(root).to_string()
}

/// Parsed document-level metadata file.
struct DocumentFields {
    folder: String,
    fields: BTreeMap<String, String>,
}

impl DocumentFields {
    fn applies_to(&self, doc_id: &str, folder: &str) -> bool {
        match self.fields.get("docId") {
            Some(id) => id == doc_id,
            None => self.folder == folder,
        }
    }
}

fn load_document_fields(files: &[ExtractedFile]) -> Vec<DocumentFields> {
    let mut parsed = Vec::with_capacity(files.len());
    for file in files {
        match page_meta::read_document_metadata(&file.path) {
            Ok(fields) => parsed.push(DocumentFields {
                folder: file.document_folder().to_string(),
                fields,
            }),
            Err(e) => warn!(entry = %file.entry, error = %e, "skipping unreadable metadata file"),
        }
    }
    parsed
}

/// Leaf fields of all metadata files describing one document. The first
/// file listing a field wins.
fn fields_for(documents: &[DocumentFields], doc_id: &str, folder: &str) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for doc in documents.iter().filter(|d| d.applies_to(doc_id, folder)) {
        for (key, value) in &doc.fields {
            merged.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    merged
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove file");
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PageChange {
    Created,
    Updated,
    Unchanged,
}

/// Reconcile the extracted files of one run against the stored rows.
pub async fn reconcile(
    config: &Config,
    pool: &SqlitePool,
    project: &ProjectConfig,
    user: &str,
    files: &ExtractedFiles,
    progress: &dyn StageProgress,
) -> PipelineResult<ReconcileSummary> {
    let existing: Vec<String> =
        sqlx::query_scalar("SELECT source_doc_id FROM documents WHERE project_id = ?")
            .bind(project.id)
            .fetch_all(pool)
            .await?;
    let existing: HashSet<String> = existing.into_iter().collect();

    let document_fields = load_document_fields(&files.metadata);
    let target_dir = config.storage.collection_dir(&project.collection_id);

    let mut summary = ReconcileSummary::default();
    let mut touched: HashSet<String> = HashSet::new();
    let mut seen_pages: HashSet<(String, String, i64)> = HashSet::new();
    let total = files.pages.len() as u64;

    for (i, file) in files.pages.iter().enumerate() {
        let done = i as u64 + 1;

        let bytes = tokio::fs::read(&file.path).await?;
        let meta = match page_meta::parse_page_metadata(&bytes) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(entry = %file.entry, error = %e, "skipping page file");
                summary.files_skipped += 1;
                remove_quietly(&file.path);
                progress
                    .advance(Stage::Reconcile, done, total, &format!("skipped {}", file.entry))
                    .await?;
                continue;
            }
        };

        let first_visit = touched.insert(meta.doc_id.clone());
        if first_visit {
            if existing.contains(&meta.doc_id) {
                summary.documents_revisited += 1;
            } else {
                summary.documents_created += 1;
            }
        }

        let doc_fields = if first_visit {
            fields_for(&document_fields, &meta.doc_id, file.document_folder())
        } else {
            BTreeMap::new()
        };

        let key = (meta.doc_id.clone(), meta.page_id.clone(), meta.page_nr);
        if !seen_pages.insert(key) {
            warn!(
                doc_id = %meta.doc_id,
                page_id = %meta.page_id,
                page_nr = meta.page_nr,
                entry = %file.entry,
                "page appears more than once in the export, keeping the last copy"
            );
            summary.duplicate_pages += 1;
        }

        let final_name =
            final_page_name(&project.collection_id, &meta.doc_id, &meta.page_id, meta.page_nr);
        let relative = format!("{}/{}", project.collection_id, final_name);
        let hash = content_hash(&bytes);

        match store_page(pool, project.id, user, &meta, &doc_fields, &relative, &hash).await? {
            PageChange::Created => summary.pages_created += 1,
            PageChange::Updated => summary.pages_updated += 1,
            PageChange::Unchanged => summary.pages_unchanged += 1,
        }

        tokio::fs::rename(&file.path, target_dir.join(&final_name)).await?;

        progress
            .advance(
                Stage::Reconcile,
                done,
                total,
                &format!(
                    "page {} (#{}) of document {}",
                    meta.page_id, meta.page_nr, meta.doc_id
                ),
            )
            .await?;
    }

    for file in &files.metadata {
        remove_quietly(&file.path);
    }

    let orphans: Vec<&String> = existing.iter().filter(|id| !touched.contains(*id)).collect();
    if config.pipeline.delete_removed_documents {
        for doc_id in orphans {
            let pages = delete_document(config, pool, project.id, doc_id).await?;
            summary.documents_deleted += 1;
            summary.pages_deleted += pages;
        }
    } else if !orphans.is_empty() {
        info!(
            project_id = project.id,
            orphans = orphans.len(),
            "documents missing from the export were kept"
        );
    }

    info!(
        project_id = project.id,
        documents_created = summary.documents_created,
        documents_deleted = summary.documents_deleted,
        pages_created = summary.pages_created,
        pages_updated = summary.pages_updated,
        files_skipped = summary.files_skipped,
        "reconciliation finished"
    );
    Ok(summary)
}

/// Upsert the document and page rows for one page file in one transaction.
async fn store_page(
    pool: &SqlitePool,
    project_id: i64,
    user: &str,
    meta: &PageMetadata,
    doc_fields: &BTreeMap<String, String>,
    relative_path: &str,
    hash: &str,
) -> PipelineResult<PageChange> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    let doc_row = sqlx::query(
        r#"
        INSERT INTO documents (project_id, source_doc_id, created_by, modified_by, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(project_id, source_doc_id) DO UPDATE SET
            modified_by = excluded.modified_by,
            updated_at = excluded.updated_at
        RETURNING id, title, metadata_json
        "#,
    )
    .bind(project_id)
    .bind(&meta.doc_id)
    .bind(user)
    .bind(user)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?;
    let document_id: i64 = doc_row.get("id");

    if !doc_fields.is_empty() {
        let title: String = doc_row.get("title");
        let metadata_json: String = doc_row.get("metadata_json");
        let title = match doc_fields.get("title") {
            Some(t) if title.is_empty() => t.clone(),
            _ => title,
        };
        sqlx::query("UPDATE documents SET title = ?, metadata_json = ? WHERE id = ?")
            .bind(&title)
            .bind(merge_transkribus(&metadata_json, doc_fields))
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
    }

    let existing = sqlx::query(
        r#"
        SELECT id, content_hash, metadata_json FROM pages
        WHERE document_id = ? AND source_page_id = ? AND page_number = ?
        "#,
    )
    .bind(document_id)
    .bind(&meta.page_id)
    .bind(meta.page_nr)
    .fetch_optional(&mut *tx)
    .await?;

    let change = match existing {
        None => {
            sqlx::query(
                r#"
                INSERT INTO pages (document_id, source_page_id, page_number, xml_path, content_hash,
                                   metadata_json, created_by, modified_by, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(document_id)
            .bind(&meta.page_id)
            .bind(meta.page_nr)
            .bind(relative_path)
            .bind(hash)
            .bind(merge_transkribus("{}", &meta.fields))
            .bind(user)
            .bind(user)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            PageChange::Created
        }
        Some(row) => {
            let page_id: i64 = row.get("id");
            let old_hash: String = row.get("content_hash");
            let metadata_json: String = row.get("metadata_json");
            let merged = merge_transkribus(&metadata_json, &meta.fields);
            if old_hash == hash {
                sqlx::query("UPDATE pages SET xml_path = ?, metadata_json = ? WHERE id = ?")
                    .bind(relative_path)
                    .bind(&merged)
                    .bind(page_id)
                    .execute(&mut *tx)
                    .await?;
                PageChange::Unchanged
            } else {
                sqlx::query(
                    r#"
                    UPDATE pages SET xml_path = ?, content_hash = ?, metadata_json = ?,
                                     modified_by = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(relative_path)
                .bind(hash)
                .bind(&merged)
                .bind(user)
                .bind(now)
                .bind(page_id)
                .execute(&mut *tx)
                .await?;
                PageChange::Updated
            }
        }
    };

    tx.commit().await?;
    debug!(doc_id = %meta.doc_id, page_id = %meta.page_id, ?change, "page stored");
    Ok(change)
}

/// Delete one document with its pages (cascade) and their files.
/// Returns the number of pages removed.
async fn delete_document(
    config: &Config,
    pool: &SqlitePool,
    project_id: i64,
    doc_id: &str,
) -> PipelineResult<u64> {
    let paths: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT p.xml_path FROM pages p
        JOIN documents d ON d.id = p.document_id
        WHERE d.project_id = ? AND d.source_doc_id = ?
        "#,
    )
    .bind(project_id)
    .bind(doc_id)
    .fetch_all(pool)
    .await?;

    for path in &paths {
        remove_quietly(&config.storage.resolve(path));
    }

    sqlx::query("DELETE FROM documents WHERE project_id = ? AND source_doc_id = ?")
        .bind(project_id)
        .bind(doc_id)
        .execute(pool)
        .await?;

    info!(project_id, doc_id, pages = paths.len(), "removed document missing from export");
    Ok(paths.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_name_is_deterministic() {
        assert_eq!(
            final_page_name("4711", "1234", "5678", 3),
            "4711_1234_5678_3.xml"
        );
        assert_eq!(final_page_name("4711", "a/b", "5678", 1), "4711_a_b_5678_1.xml");
    }

    #[test]
    fn merge_keeps_foreign_keys_and_updates_section() {
        let mut fields = BTreeMap::new();
        fields.insert("status".to_string(), "GT".to_string());
        let merged = merge_transkribus(
            r#"{"notes":"x","transkribus":{"status":"IN_PROGRESS","tsid":"9"}}"#,
            &fields,
        );
        let value: serde_json::Value = serde_json::from_str(&merged).unwrap();
        assert_eq!(value["notes"], "x");
        assert_eq!(value["transkribus"]["status"], "GT");
        assert_eq!(value["transkribus"]["tsid"], "9");
    }

    #[test]
    fn merge_recovers_from_invalid_json() {
        let merged = merge_transkribus("not json", &BTreeMap::new());
        assert_eq!(merged, r#"{"transkribus":{}}"#);
    }

    #[test]
    fn metadata_file_matches_by_doc_id_before_folder() {
        let mut with_id = BTreeMap::new();
        with_id.insert("docId".to_string(), "1".to_string());
        let docs = vec![
            DocumentFields {
                folder: "c/B".to_string(),
                fields: with_id,
            },
            DocumentFields {
                folder: "c/A".to_string(),
                fields: BTreeMap::new(),
            },
        ];
        assert!(docs[0].applies_to("1", "c/A"));
        assert!(!docs[0].applies_to("2", "c/B"));
        assert!(docs[1].applies_to("2", "c/A"));
    }
}
