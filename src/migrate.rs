use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Projects are maintained elsewhere; this core only reads them.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            collection_id TEXT NOT NULL,
            archive_path TEXT,
            tag_type_translator TEXT NOT NULL DEFAULT '{}',
            ignored_tag_types TEXT NOT NULL DEFAULT '[]',
            date_tag_types TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dictionaries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            label TEXT NOT NULL UNIQUE,
            type TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS project_dictionaries (
            project_id INTEGER NOT NULL,
            dictionary_id INTEGER NOT NULL,
            position INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (project_id, dictionary_id),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            FOREIGN KEY (dictionary_id) REFERENCES dictionaries(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dictionary_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dictionary_id INTEGER NOT NULL,
            label TEXT NOT NULL,
            authorization_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            UNIQUE(dictionary_id, label),
            FOREIGN KEY (dictionary_id) REFERENCES dictionaries(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS variations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id INTEGER NOT NULL,
            variation TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(entry_id, variation),
            FOREIGN KEY (entry_id) REFERENCES dictionary_entries(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS date_variations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            variation TEXT NOT NULL,
            normalized_json TEXT NOT NULL DEFAULT '{}',
            edtf TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per external document identifier within a project.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id INTEGER NOT NULL,
            source_doc_id TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            is_parked INTEGER NOT NULL DEFAULT 0,
            workflow_remarks TEXT NOT NULL DEFAULT '',
            created_by TEXT NOT NULL,
            modified_by TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(project_id, source_doc_id),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL,
            source_page_id TEXT NOT NULL,
            page_number INTEGER NOT NULL,
            xml_path TEXT NOT NULL,
            content_hash TEXT NOT NULL DEFAULT '',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            parsed_json TEXT,
            last_parsed_at INTEGER,
            is_ignored INTEGER NOT NULL DEFAULT 0,
            num_tags INTEGER NOT NULL DEFAULT 0,
            created_by TEXT NOT NULL,
            modified_by TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(document_id, source_page_id, page_number),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS page_tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            page_id INTEGER NOT NULL,
            variation TEXT NOT NULL,
            variation_type TEXT NOT NULL,
            additional_json TEXT NOT NULL DEFAULT '{}',
            dictionary_entry_id INTEGER,
            date_variation_id INTEGER,
            created_by TEXT NOT NULL,
            modified_by TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (page_id) REFERENCES pages(id) ON DELETE CASCADE,
            FOREIGN KEY (dictionary_entry_id) REFERENCES dictionary_entries(id) ON DELETE SET NULL,
            FOREIGN KEY (date_variation_id) REFERENCES date_variations(id) ON DELETE SET NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            project_id INTEGER NOT NULL,
            user_name TEXT NOT NULL,
            kind TEXT NOT NULL,
            state TEXT NOT NULL,
            percent REAL NOT NULL DEFAULT 0,
            status_text TEXT NOT NULL DEFAULT '',
            error TEXT,
            summary_json TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS project_locks (
            project_id INTEGER PRIMARY KEY,
            job_id TEXT NOT NULL,
            acquired_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One working directory per collection, so one project per collection.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_collection ON projects(collection_id)",
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_pages_document_id ON pages(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_page_tags_page_id ON page_tags(page_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_page_tags_entry ON page_tags(dictionary_entry_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_variations_text ON variations(variation)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_date_variations_text ON date_variations(variation)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_project ON jobs(project_id, created_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
