//! Project and vocabulary inputs.
//!
//! Projects and dictionaries are owned by the surrounding application. This
//! module loads project definitions (TOML) and dictionaries (JSON) into the
//! database and reads the immutable [`ProjectConfig`] snapshot a job works
//! from.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use tracing::info;

use crate::config::Config;
use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::models::ProjectConfig;

/// Project definition file, e.g.
///
/// ```toml
/// id = 1
/// title = "Letters"
/// collection_id = "4711"
/// archive_path = "/data/exports/4711.zip"
/// selected_dictionaries = ["Places", "Persons"]
/// ignored_tag_types = ["abbrev"]
/// date_tag_types = ["date"]
///
/// [tag_type_translator]
/// place = "city"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectDefinition {
    pub id: i64,
    pub title: String,
    pub collection_id: String,
    #[serde(default)]
    pub archive_path: Option<PathBuf>,
    /// Dictionary labels, in selection order.
    #[serde(default)]
    pub selected_dictionaries: Vec<String>,
    #[serde(default)]
    pub tag_type_translator: BTreeMap<String, String>,
    #[serde(default)]
    pub ignored_tag_types: Vec<String>,
    #[serde(default)]
    pub date_tag_types: Vec<String>,
}

pub fn load_definition(path: &Path) -> Result<ProjectDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read project file: {}", path.display()))?;
    let def: ProjectDefinition =
        toml::from_str(&content).with_context(|| "Failed to parse project file")?;
    check_collection_id(&def.collection_id).map_err(anyhow::Error::msg)?;
    Ok(def)
}

/// A collection id names exactly one directory below the exports namespace.
pub fn check_collection_id(collection_id: &str) -> std::result::Result<(), String> {
    let mut components = Path::new(collection_id).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name == collection_id
    );
    if single && !collection_id.trim().is_empty() && !collection_id.contains(['/', '\\']) {
        Ok(())
    } else {
        Err(format!(
            "invalid collection_id '{}': must be a single directory name",
            collection_id
        ))
    }
}

/// Insert or update a project and replace its dictionary selection.
pub async fn upsert_project(pool: &SqlitePool, def: &ProjectDefinition) -> Result<()> {
    check_collection_id(&def.collection_id).map_err(anyhow::Error::msg)?;
    let holder: Option<i64> =
        sqlx::query_scalar("SELECT id FROM projects WHERE collection_id = ? AND id != ?")
            .bind(&def.collection_id)
            .bind(def.id)
            .fetch_optional(pool)
            .await?;
    if let Some(other) = holder {
        bail!(
            "collection {} is already used by project {}",
            def.collection_id,
            other
        );
    }

    let mut dictionary_ids = Vec::with_capacity(def.selected_dictionaries.len());
    for label in &def.selected_dictionaries {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM dictionaries WHERE label = ?")
            .bind(label)
            .fetch_optional(pool)
            .await?;
        match id {
            Some(id) => dictionary_ids.push(id),
            None => bail!("unknown dictionary '{}' in project {}", label, def.id),
        }
    }

    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO projects (id, title, collection_id, archive_path, tag_type_translator,
                              ignored_tag_types, date_tag_types, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            collection_id = excluded.collection_id,
            archive_path = excluded.archive_path,
            tag_type_translator = excluded.tag_type_translator,
            ignored_tag_types = excluded.ignored_tag_types,
            date_tag_types = excluded.date_tag_types,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(def.id)
    .bind(&def.title)
    .bind(&def.collection_id)
    .bind(def.archive_path.as_ref().map(|p| p.display().to_string()))
    .bind(serde_json::to_string(&def.tag_type_translator)?)
    .bind(serde_json::to_string(&def.ignored_tag_types)?)
    .bind(serde_json::to_string(&def.date_tag_types)?)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM project_dictionaries WHERE project_id = ?")
        .bind(def.id)
        .execute(&mut *tx)
        .await?;
    for (position, dictionary_id) in dictionary_ids.iter().enumerate() {
        sqlx::query(
            "INSERT INTO project_dictionaries (project_id, dictionary_id, position) VALUES (?, ?, ?)",
        )
        .bind(def.id)
        .bind(dictionary_id)
        .bind(position as i64)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    info!(
        project_id = def.id,
        dictionaries = dictionary_ids.len(),
        "project definition stored"
    );
    Ok(())
}

pub async fn project_exists(pool: &SqlitePool, project_id: i64) -> Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects WHERE id = ?")
        .bind(project_id)
        .fetch_one(pool)
        .await?;
    Ok(count > 0)
}

/// Read the configuration snapshot a job runs with.
pub async fn load_project_config(pool: &SqlitePool, project_id: i64) -> PipelineResult<ProjectConfig> {
    let row = sqlx::query(
        r#"
        SELECT id, title, collection_id, archive_path, tag_type_translator,
               ignored_tag_types, date_tag_types
        FROM projects WHERE id = ?
        "#,
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| PipelineError::NotFound(format!("project {}", project_id)))?;

    let selected_dictionaries: Vec<i64> = sqlx::query_scalar(
        "SELECT dictionary_id FROM project_dictionaries WHERE project_id = ? ORDER BY position, dictionary_id",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    let translator: String = row.get("tag_type_translator");
    let ignored: String = row.get("ignored_tag_types");
    let dates: String = row.get("date_tag_types");
    let archive_path: Option<String> = row.get("archive_path");
    let collection_id: String = row.get("collection_id");
    check_collection_id(&collection_id).map_err(PipelineError::Configuration)?;

    Ok(ProjectConfig {
        id: row.get("id"),
        title: row.get("title"),
        collection_id,
        archive_path: archive_path.filter(|p| !p.is_empty()).map(PathBuf::from),
        selected_dictionaries,
        tag_type_translator: parse_json_column(&translator, "tag_type_translator")?,
        ignored_tag_types: parse_json_column::<BTreeSet<String>>(&ignored, "ignored_tag_types")?,
        date_tag_types: parse_json_column::<BTreeSet<String>>(&dates, "date_tag_types")?,
    })
}

/// Dictionary import file:
///
/// ```json
/// {"label": "Places", "type": "city",
///  "entries": [{"label": "Vienna", "variations": ["Wien", "Vienna"]}]}
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DictionaryImport {
    pub label: String,
    #[serde(rename = "type")]
    pub dictionary_type: String,
    #[serde(default)]
    pub entries: Vec<EntryImport>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntryImport {
    pub label: String,
    #[serde(default)]
    pub authorization: serde_json::Value,
    #[serde(default)]
    pub variations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportCounts {
    pub dictionary_id: i64,
    pub entries_added: u64,
    pub variations_added: u64,
}

pub fn load_dictionary_file(path: &Path) -> Result<DictionaryImport> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dictionary file: {}", path.display()))?;
    let import: DictionaryImport =
        serde_json::from_str(&content).with_context(|| "Failed to parse dictionary file")?;
    if import.label.trim().is_empty() || import.dictionary_type.trim().is_empty() {
        bail!("dictionary label and type must not be empty");
    }
    Ok(import)
}

/// Add a dictionary with its entries and variations. Existing rows are kept,
/// so importing the same file twice adds nothing.
pub async fn import_dictionary(pool: &SqlitePool, import: &DictionaryImport) -> Result<ImportCounts> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO dictionaries (label, type, created_at) VALUES (?, ?, ?)
        ON CONFLICT(label) DO UPDATE SET type = excluded.type
        "#,
    )
    .bind(&import.label)
    .bind(&import.dictionary_type)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    let dictionary_id: i64 = sqlx::query_scalar("SELECT id FROM dictionaries WHERE label = ?")
        .bind(&import.label)
        .fetch_one(&mut *tx)
        .await?;

    let mut counts = ImportCounts {
        dictionary_id,
        ..Default::default()
    };

    for entry in &import.entries {
        let authorization = if entry.authorization.is_null() {
            "{}".to_string()
        } else {
            serde_json::to_string(&entry.authorization)?
        };
        let added = sqlx::query(
            r#"
            INSERT INTO dictionary_entries (dictionary_id, label, authorization_json, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(dictionary_id, label) DO NOTHING
            "#,
        )
        .bind(dictionary_id)
        .bind(&entry.label)
        .bind(&authorization)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        counts.entries_added += added.rows_affected();

        let entry_id: i64 = sqlx::query_scalar(
            "SELECT id FROM dictionary_entries WHERE dictionary_id = ? AND label = ?",
        )
        .bind(dictionary_id)
        .bind(&entry.label)
        .fetch_one(&mut *tx)
        .await?;

        for variation in &entry.variations {
            let added = sqlx::query(
                r#"
                INSERT INTO variations (entry_id, variation, created_at) VALUES (?, ?, ?)
                ON CONFLICT(entry_id, variation) DO NOTHING
                "#,
            )
            .bind(entry_id)
            .bind(variation)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            counts.variations_added += added.rows_affected();
        }
    }

    tx.commit().await?;
    info!(
        dictionary = %import.label,
        entries = counts.entries_added,
        variations = counts.variations_added,
        "dictionary imported"
    );
    Ok(counts)
}

/// Register a normalized date form for a raw date text. Returns its id.
pub async fn add_date_variation(
    pool: &SqlitePool,
    variation: &str,
    edtf: &str,
    normalized: &serde_json::Value,
) -> Result<i64> {
    if variation.trim().is_empty() || edtf.trim().is_empty() {
        bail!("date variation text and EDTF must not be empty");
    }
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO date_variations (variation, normalized_json, edtf, created_at)
        VALUES (?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(variation)
    .bind(serde_json::to_string(normalized)?)
    .bind(edtf)
    .bind(chrono::Utc::now().timestamp())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// CLI entry point for `project load`.
pub async fn run_load_project(config: &Config, path: &Path) -> Result<()> {
    let def = load_definition(path)?;
    let pool = db::connect(config).await?;
    let result = upsert_project(&pool, &def).await;
    pool.close().await;
    result?;
    println!(
        "Project {} ({}) loaded: collection {}, {} dictionaries",
        def.id,
        def.title,
        def.collection_id,
        def.selected_dictionaries.len()
    );
    Ok(())
}

/// CLI entry point for `dict import`.
pub async fn run_import_dictionary(config: &Config, path: &Path) -> Result<()> {
    let import = load_dictionary_file(path)?;
    let pool = db::connect(config).await?;
    let counts = import_dictionary(&pool, &import).await;
    pool.close().await;
    let counts = counts?;
    println!(
        "Dictionary {} (id {}, type {}): {} entries, {} variations added",
        import.label,
        counts.dictionary_id,
        import.dictionary_type,
        counts.entries_added,
        counts.variations_added
    );
    Ok(())
}

/// CLI entry point for `date add`.
pub async fn run_add_date(config: &Config, variation: &str, edtf: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let normalized = serde_json::json!({ "edtf": edtf });
    let id = add_date_variation(&pool, variation, edtf, &normalized).await;
    pool.close().await;
    println!("Date variation {} added: {} -> {}", id?, variation, edtf);
    Ok(())
}

fn parse_json_column<T: serde::de::DeserializeOwned>(raw: &str, column: &str) -> PipelineResult<T> {
    serde_json::from_str(raw).map_err(|e| {
        PipelineError::Configuration(format!("project column {} is not valid JSON: {}", column, e))
    })
}
