//! Project statistics.
//!
//! Summarises what the pipeline produced for one project: documents, pages,
//! how many pages are marked not relevant, and how far tag resolution got,
//! broken down per tag type. Ignored pages are counted but their tags are
//! left out of the tag figures. Used by `harvest stats` and
//! `GET /projects/{id}/stats`.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::projects;

#[derive(Debug, Clone, Serialize)]
pub struct TypeStats {
    pub variation_type: String,
    pub total: i64,
    pub resolved: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectStats {
    pub project_id: i64,
    pub documents: i64,
    pub pages: i64,
    pub ignored_pages: i64,
    pub ignored_percent: f64,
    pub avg_pages_per_document: f64,
    pub tags: i64,
    pub resolved_tags: i64,
    pub unresolved_tags: i64,
    pub by_type: Vec<TypeStats>,
    pub last_parsed_at: Option<i64>,
}

pub async fn project_stats(pool: &SqlitePool, project_id: i64) -> Result<ProjectStats> {
    if !projects::project_exists(pool, project_id).await? {
        bail!("project not found: {}", project_id);
    }

    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE project_id = ?")
        .bind(project_id)
        .fetch_one(pool)
        .await?;

    let page_row = sqlx::query(
        r#"
        SELECT COUNT(*) AS pages,
               COALESCE(SUM(p.is_ignored), 0) AS ignored,
               MAX(p.last_parsed_at) AS last_parsed_at
        FROM pages p JOIN documents d ON d.id = p.document_id
        WHERE d.project_id = ?
        "#,
    )
    .bind(project_id)
    .fetch_one(pool)
    .await?;
    let pages: i64 = page_row.get("pages");
    let ignored_pages: i64 = page_row.get("ignored");

    let type_rows = sqlx::query(
        r#"
        SELECT t.variation_type,
               COUNT(*) AS total,
               SUM(CASE WHEN t.dictionary_entry_id IS NOT NULL
                          OR t.date_variation_id IS NOT NULL THEN 1 ELSE 0 END) AS resolved
        FROM page_tags t
        JOIN pages p ON p.id = t.page_id
        JOIN documents d ON d.id = p.document_id
        WHERE d.project_id = ? AND p.is_ignored = 0
        GROUP BY t.variation_type
        ORDER BY total DESC, t.variation_type
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    let by_type: Vec<TypeStats> = type_rows
        .iter()
        .map(|row| TypeStats {
            variation_type: row.get("variation_type"),
            total: row.get("total"),
            resolved: row.get("resolved"),
        })
        .collect();
    let tags: i64 = by_type.iter().map(|t| t.total).sum();
    let resolved_tags: i64 = by_type.iter().map(|t| t.resolved).sum();

    let relevant_pages = pages - ignored_pages;
    Ok(ProjectStats {
        project_id,
        documents,
        pages,
        ignored_pages,
        ignored_percent: percent(ignored_pages, pages),
        avg_pages_per_document: if documents > 0 {
            relevant_pages as f64 / documents as f64
        } else {
            0.0
        },
        tags,
        resolved_tags,
        unresolved_tags: tags - resolved_tags,
        by_type,
        last_parsed_at: page_row.get("last_parsed_at"),
    })
}

fn percent(part: i64, whole: i64) -> f64 {
    if whole > 0 {
        (part as f64 * 1000.0 / whole as f64).round() / 10.0
    } else {
        0.0
    }
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config, project_id: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = project_stats(&pool, project_id).await;
    pool.close().await;
    let stats = stats?;

    println!("Project {} statistics", stats.project_id);
    println!("========================");
    println!();
    println!("  Documents:      {}", stats.documents);
    println!("  Pages:          {}", stats.pages);
    println!(
        "  Ignored pages:  {} ({}%)",
        stats.ignored_pages, stats.ignored_percent
    );
    println!("  Pages/document: {:.1}", stats.avg_pages_per_document);
    println!(
        "  Tags:           {} ({} resolved, {} open)",
        stats.tags, stats.resolved_tags, stats.unresolved_tags
    );
    if let Some(ts) = stats.last_parsed_at {
        println!("  Last parsed:    {}", format_ts_relative(ts));
    }

    if !stats.by_type.is_empty() {
        println!();
        println!("  By type:");
        println!("  {:<24} {:>8} {:>9} {:>6}", "TYPE", "TAGS", "RESOLVED", "%");
        println!("  {}", "-".repeat(50));
        for t in &stats.by_type {
            println!(
                "  {:<24} {:>8} {:>9} {:>6}",
                t.variation_type,
                t.total,
                t.resolved,
                percent(t.resolved, t.total)
            );
        }
    }

    println!();
    Ok(())
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

pub(crate) fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
