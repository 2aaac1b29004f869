//! Document retrieval for review.
//!
//! Fetches one document of a project with its pages and their tags. Ignored
//! pages are returned but flagged. Used by the `harvest show` command.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::{Document, Page, PageTag};
use crate::stats::format_ts_iso;

#[derive(Debug, Clone, Serialize)]
pub struct PageView {
    #[serde(flatten)]
    pub page: Page,
    pub tags: Vec<PageTag>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentView {
    #[serde(flatten)]
    pub document: Document,
    pub pages: Vec<PageView>,
}

/// Load a document by its external identifier within a project.
pub async fn get_document(
    pool: &SqlitePool,
    project_id: i64,
    source_doc_id: &str,
) -> Result<DocumentView> {
    let doc_row = sqlx::query(
        r#"
        SELECT id, project_id, source_doc_id, title, metadata_json, is_parked, workflow_remarks
        FROM documents WHERE project_id = ? AND source_doc_id = ?
        "#,
    )
    .bind(project_id)
    .bind(source_doc_id)
    .fetch_optional(pool)
    .await?;

    let Some(doc_row) = doc_row else {
        bail!("document not found: {} in project {}", source_doc_id, project_id);
    };

    let metadata_json: String = doc_row.get("metadata_json");
    let document = Document {
        id: doc_row.get("id"),
        project_id: doc_row.get("project_id"),
        source_doc_id: doc_row.get("source_doc_id"),
        title: doc_row.get("title"),
        metadata: serde_json::from_str(&metadata_json).unwrap_or(serde_json::json!({})),
        is_parked: doc_row.get::<i64, _>("is_parked") != 0,
        workflow_remarks: doc_row.get("workflow_remarks"),
    };

    let page_rows = sqlx::query(
        r#"
        SELECT id, document_id, source_page_id, page_number, xml_path, last_parsed_at,
               is_ignored, num_tags
        FROM pages WHERE document_id = ?
        ORDER BY page_number, id
        "#,
    )
    .bind(document.id)
    .fetch_all(pool)
    .await?;

    let mut pages = Vec::with_capacity(page_rows.len());
    for row in &page_rows {
        let page = Page {
            id: row.get("id"),
            document_id: row.get("document_id"),
            source_page_id: row.get("source_page_id"),
            page_number: row.get("page_number"),
            xml_path: row.get("xml_path"),
            last_parsed_at: row.get("last_parsed_at"),
            is_ignored: row.get::<i64, _>("is_ignored") != 0,
            num_tags: row.get("num_tags"),
        };

        let tag_rows = sqlx::query(
            r#"
            SELECT id, page_id, variation, variation_type, additional_json,
                   dictionary_entry_id, date_variation_id
            FROM page_tags WHERE page_id = ? ORDER BY id
            "#,
        )
        .bind(page.id)
        .fetch_all(pool)
        .await?;

        let tags = tag_rows
            .iter()
            .map(|t| {
                let additional: String = t.get("additional_json");
                PageTag {
                    id: t.get("id"),
                    page_id: t.get("page_id"),
                    variation: t.get("variation"),
                    variation_type: t.get("variation_type"),
                    additional_information: serde_json::from_str(&additional)
                        .unwrap_or(serde_json::json!({})),
                    dictionary_entry_id: t.get("dictionary_entry_id"),
                    date_variation_id: t.get("date_variation_id"),
                }
            })
            .collect();

        pages.push(PageView { page, tags });
    }

    Ok(DocumentView { document, pages })
}

/// CLI entry point: print a document with its pages and tags.
pub async fn run_show(config: &Config, project_id: i64, source_doc_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let view = get_document(&pool, project_id, source_doc_id).await;
    pool.close().await;
    let view = view?;

    let doc = &view.document;
    println!("--- Document ---");
    println!("document:     {}", doc.source_doc_id);
    println!(
        "title:        {}",
        if doc.title.is_empty() {
            "(untitled)"
        } else {
            &doc.title
        }
    );
    println!("parked:       {}", doc.is_parked);
    if !doc.workflow_remarks.is_empty() {
        println!("remarks:      {}", doc.workflow_remarks);
    }
    println!("metadata:     {}", doc.metadata);
    println!();

    println!("--- Pages ({}) ---", view.pages.len());
    for p in &view.pages {
        let parsed = p
            .page
            .last_parsed_at
            .map(format_ts_iso)
            .unwrap_or_else(|| "never".to_string());
        println!(
            "[page {} #{}] {} tags, parsed {}{}",
            p.page.source_page_id,
            p.page.page_number,
            p.page.num_tags,
            parsed,
            if p.page.is_ignored { " (ignored)" } else { "" }
        );
        for t in &p.tags {
            let link = match (t.dictionary_entry_id, t.date_variation_id) {
                (Some(entry), _) => format!("entry {}", entry),
                (None, Some(date)) => format!("date {}", date),
                (None, None) => "unresolved".to_string(),
            };
            println!("  #{:<6} {:<12} {:<30} {}", t.id, t.variation_type, t.variation, link);
        }
    }

    Ok(())
}
