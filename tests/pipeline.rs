//! End-to-end pipeline tests against a temporary database and storage root.
//!
//! Export archives are synthesised with `zip::ZipWriter` in the layout the
//! transcription platform produces: `{collection}/{document}/page/*.xml`
//! plus an optional `metadata.xml` per document.

use serde_json::{json, Value};
use sqlx::{Row, SqlitePool};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use tag_harvest::config::Config;
use tag_harvest::error::PipelineError;
use tag_harvest::models::{JobKind, JobState, PipelineSummary};
use tag_harvest::progress::NoProgress;
use tag_harvest::projects::{self, DictionaryImport, ProjectDefinition};
use tag_harvest::{db, jobs, migrate, pipeline, resolve, stats};

const COLLECTION: &str = "4711";
const USER: &str = "alice";

// ─── Fixtures ───────────────────────────────────────────────────────

struct Line<'a> {
    text: &'a str,
    custom: &'a str,
}

fn page_xml(doc_id: &str, page_id: &str, page_nr: u32, lines: &[Line], relevant: bool) -> String {
    let property = if relevant {
        String::new()
    } else {
        r#"<Property key="page_relevance" value="no"/>"#.to_string()
    };
    let mut body = String::new();
    for (i, line) in lines.iter().enumerate() {
        body.push_str(&format!(
            r#"<TextLine id="r1l{}" custom="readingOrder {{index:{};}} {}">
        <Coords points="0,0 100,0 100,10 0,10"/>
        <TextEquiv><Unicode>{}</Unicode></TextEquiv>
      </TextLine>
      "#,
            i + 1,
            i,
            line.custom,
            line.text
        ));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<PcGts xmlns="http://schema.primaresearch.org/PAGE/gts/pagecontent/2013-07-15">
  <Metadata>
    <Creator>test</Creator>
    <TranskribusMetadata docId="{doc_id}" pageId="{page_id}" pageNr="{page_nr}" status="IN_PROGRESS">{property}</TranskribusMetadata>
  </Metadata>
  <Page imageFilename="{page_nr:04}.jpg" imageWidth="100" imageHeight="200">
    <TextRegion id="r1" custom="readingOrder {{index:0;}}">
      <Coords points="0,0 100,0 100,50 0,50"/>
      {body}
    </TextRegion>
  </Page>
</PcGts>"#
    )
}

fn doc_metadata_xml(doc_id: &str, title: &str) -> String {
    format!(
        "<trpDocMetadata><docId>{}</docId><title>{}</title><author>archive</author></trpDocMetadata>",
        doc_id, title
    )
}

fn write_archive(path: &Path, entries: &[(String, String)]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in entries {
        zip.start_file(name.as_str(), options).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

fn page_entry(folder: &str, file: &str, xml: String) -> (String, String) {
    (format!("{}/{}/page/{}", COLLECTION, folder, file), xml)
}

/// Two letters: document 100 with two pages, document 200 with one page.
fn standard_export() -> Vec<(String, String)> {
    vec![
        page_entry(
            "Letter_A",
            "0001_a1.xml",
            page_xml(
                "100",
                "1001",
                1,
                &[
                    Line {
                        text: "Wien, den 3. März",
                        custom: "place {offset:0; length:4;}",
                    },
                    Line {
                        text: "lieber Hans Maier",
                        custom: "person {offset:7; length:10;}",
                    },
                ],
                true,
            ),
        ),
        page_entry(
            "Letter_A",
            "0002_a2.xml",
            page_xml(
                "100",
                "1002",
                2,
                &[Line {
                    text: "aus Wienn zurück",
                    custom: "place {offset:4; length:5;}",
                }],
                true,
            ),
        ),
        (
            format!("{}/Letter_A/metadata.xml", COLLECTION),
            doc_metadata_xml("100", "Brief an Hans"),
        ),
        page_entry(
            "Letter_B",
            "0001_b1.xml",
            page_xml(
                "200",
                "2001",
                1,
                &[Line {
                    text: "Graz im Mai",
                    custom: "place {offset:0; length:4;} abbrev {offset:8; length:3;}",
                }],
                false,
            ),
        ),
    ]
}

struct Env {
    _tmp: TempDir,
    config: Config,
    pool: SqlitePool,
    archive: PathBuf,
    project_id: i64,
}

fn test_config(root: &Path) -> Config {
    let content = format!(
        r#"
[db]
path = "{root}/data/harvest.sqlite"

[storage]
root = "{root}/storage"

[server]
bind = "127.0.0.1:0"
"#,
        root = root.display()
    );
    toml::from_str(&content).unwrap()
}

async fn setup() -> Env {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();

    let places: DictionaryImport = serde_json::from_value(json!({
        "label": "Places",
        "type": "city",
        "entries": [
            {"label": "Vienna", "variations": ["Wien", "Vienna", "Vindobona"]},
            {"label": "Graz", "variations": ["Graz"]}
        ]
    }))
    .unwrap();
    projects::import_dictionary(&pool, &places).await.unwrap();

    let persons: DictionaryImport = serde_json::from_value(json!({
        "label": "Persons",
        "type": "person",
        "entries": [
            {"label": "Maier, Johann", "variations": ["Hans Maier", "Johann Maier"]}
        ]
    }))
    .unwrap();
    projects::import_dictionary(&pool, &persons).await.unwrap();

    // Not selected by the project below.
    let foreign: DictionaryImport = serde_json::from_value(json!({
        "label": "Foreign places",
        "type": "city",
        "entries": [{"label": "Vienna (foreign)", "variations": ["Wien", "Wienn"]}]
    }))
    .unwrap();
    projects::import_dictionary(&pool, &foreign).await.unwrap();

    let archive = tmp.path().join("export.zip");
    write_archive(&archive, &standard_export());

    let def = ProjectDefinition {
        id: 1,
        title: "Letters".to_string(),
        collection_id: COLLECTION.to_string(),
        archive_path: Some(archive.clone()),
        selected_dictionaries: vec!["Places".to_string(), "Persons".to_string()],
        tag_type_translator: [("place".to_string(), "city".to_string())]
            .into_iter()
            .collect(),
        ignored_tag_types: vec!["abbrev".to_string()],
        date_tag_types: vec!["date".to_string()],
    };
    projects::upsert_project(&pool, &def).await.unwrap();

    Env {
        _tmp: tmp,
        config,
        pool,
        archive,
        project_id: 1,
    }
}

async fn run(env: &Env, kind: JobKind) -> (String, Result<PipelineSummary, PipelineError>) {
    let job_id = jobs::start_job(&env.pool, env.project_id, USER, kind, 3600)
        .await
        .unwrap();
    let result = pipeline::run_job(
        &env.config,
        &env.pool,
        &job_id,
        env.project_id,
        USER,
        kind,
        Box::new(NoProgress),
    )
    .await;
    (job_id, result)
}

async fn entry_id(pool: &SqlitePool, label: &str) -> i64 {
    sqlx::query_scalar("SELECT id FROM dictionary_entries WHERE label = ?")
        .bind(label)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn tag_by_variation(pool: &SqlitePool, variation: &str) -> (i64, Option<i64>, Value) {
    let row = sqlx::query(
        "SELECT id, dictionary_entry_id, additional_json FROM page_tags WHERE variation = ?",
    )
    .bind(variation)
    .fetch_one(pool)
    .await
    .unwrap();
    let additional: String = row.get("additional_json");
    (
        row.get("id"),
        row.get("dictionary_entry_id"),
        serde_json::from_str(&additional).unwrap(),
    )
}

async fn count(pool: &SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn extract_job_ingests_export_and_resolves_tags() {
    let env = setup().await;
    let (job_id, result) = run(&env, JobKind::Extract).await;
    let summary = result.unwrap();

    let extract = summary.extract.as_ref().unwrap();
    assert_eq!(extract.page_files, 3);
    assert_eq!(extract.metadata_files, 1);

    let reconcile = summary.reconcile.as_ref().unwrap();
    assert_eq!(reconcile.documents_created, 2);
    assert_eq!(reconcile.pages_created, 3);
    assert_eq!(reconcile.files_skipped, 0);

    let parse = summary.parse.as_ref().unwrap();
    assert_eq!(parse.pages_parsed, 3);
    assert_eq!(parse.pages_ignored, 1);

    // Wien, Hans Maier, Wienn, Graz, abbrev "Mai".
    assert_eq!(summary.tags.tags_created, 5);
    assert_eq!(summary.tags.entries_resolved, 3);
    assert_eq!(summary.tags.unresolved, 1);
    assert_eq!(summary.tags.ignored_type, 1);

    let status = jobs::get_job(&env.pool, &job_id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Success);
    assert_eq!(status.percent, 100.0);
    assert_eq!(status.summary.unwrap()["tags"]["tags_created"], 5);
}

#[tokio::test]
async fn translated_type_resolves_within_selected_dictionaries() {
    let env = setup().await;
    run(&env, JobKind::Extract).await.1.unwrap();

    let vienna = entry_id(&env.pool, "Vienna").await;
    let (_, linked, additional) = tag_by_variation(&env.pool, "Wien").await;
    assert_eq!(linked, Some(vienna));
    assert_eq!(additional["offset"], 0);
    assert_eq!(additional["length"], 4);
    assert_eq!(additional["line_text"], "Wien, den 3. März");
    assert_eq!(additional["line_id"], "r1l1");

    let maier = entry_id(&env.pool, "Maier, Johann").await;
    let (_, linked, additional) = tag_by_variation(&env.pool, "Hans Maier").await;
    assert_eq!(linked, Some(maier));
    assert_eq!(additional["line_index"], 1);

    // Only the unselected dictionary knows this spelling.
    let (_, linked, _) = tag_by_variation(&env.pool, "Wienn").await;
    assert_eq!(linked, None);

    let (_, linked, _) = tag_by_variation(&env.pool, "Mai").await;
    assert_eq!(linked, None);
}

#[tokio::test]
async fn document_metadata_sets_title_and_page_metadata_is_kept() {
    let env = setup().await;
    run(&env, JobKind::Extract).await.1.unwrap();

    let row = sqlx::query("SELECT title, metadata_json FROM documents WHERE source_doc_id = '100'")
        .fetch_one(&env.pool)
        .await
        .unwrap();
    let title: String = row.get("title");
    assert_eq!(title, "Brief an Hans");
    let metadata: Value = serde_json::from_str(row.get::<String, _>("metadata_json").as_str()).unwrap();
    assert_eq!(metadata["transkribus"]["author"], "archive");

    let page_meta: String = sqlx::query_scalar(
        "SELECT metadata_json FROM pages WHERE source_page_id = '2001'",
    )
    .fetch_one(&env.pool)
    .await
    .unwrap();
    let page_meta: Value = serde_json::from_str(&page_meta).unwrap();
    assert_eq!(page_meta["transkribus"]["status"], "IN_PROGRESS");
    assert_eq!(page_meta["transkribus"]["page_relevance"], "no");

    let ignored: i64 = sqlx::query_scalar("SELECT is_ignored FROM pages WHERE source_page_id = '2001'")
        .fetch_one(&env.pool)
        .await
        .unwrap();
    assert_eq!(ignored, 1);
}

#[tokio::test]
async fn page_files_get_deterministic_names() {
    let env = setup().await;
    run(&env, JobKind::Extract).await.1.unwrap();

    let dir = env.config.storage.collection_dir(COLLECTION);
    let mut names: Vec<String> = std::fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            "4711_100_1001_1.xml".to_string(),
            "4711_100_1002_2.xml".to_string(),
            "4711_200_2001_1.xml".to_string(),
        ]
    );
}

#[tokio::test]
async fn rerun_is_idempotent() {
    let env = setup().await;
    run(&env, JobKind::Extract).await.1.unwrap();
    let tags_before = count(&env.pool, "SELECT COUNT(*) FROM page_tags").await;

    let summary = run(&env, JobKind::Extract).await.1.unwrap();
    let reconcile = summary.reconcile.unwrap();
    assert_eq!(reconcile.documents_created, 0);
    assert_eq!(reconcile.documents_revisited, 2);
    assert_eq!(reconcile.pages_created, 0);
    assert_eq!(reconcile.pages_unchanged, 3);

    assert_eq!(count(&env.pool, "SELECT COUNT(*) FROM documents").await, 2);
    assert_eq!(count(&env.pool, "SELECT COUNT(*) FROM pages").await, 3);
    assert_eq!(count(&env.pool, "SELECT COUNT(*) FROM page_tags").await, tags_before);

    let num_tags: i64 = sqlx::query_scalar("SELECT num_tags FROM pages WHERE source_page_id = '1001'")
        .fetch_one(&env.pool)
        .await
        .unwrap();
    assert_eq!(num_tags, 2);
}

#[tokio::test]
async fn changed_page_is_reported_as_updated() {
    let env = setup().await;
    run(&env, JobKind::Extract).await.1.unwrap();

    let mut export = standard_export();
    export[1] = page_entry(
        "Letter_A",
        "0002_a2.xml",
        page_xml(
            "100",
            "1002",
            2,
            &[Line {
                text: "aus Wien zurück",
                custom: "place {offset:4; length:4;}",
            }],
            true,
        ),
    );
    write_archive(&env.archive, &export);

    let summary = run(&env, JobKind::Extract).await.1.unwrap();
    let reconcile = summary.reconcile.unwrap();
    assert_eq!(reconcile.pages_updated, 1);
    assert_eq!(reconcile.pages_unchanged, 2);
    assert_eq!(summary.tags.unresolved, 0);
}

#[tokio::test]
async fn dropped_tag_leaves_only_remaining_rows() {
    let env = setup().await;
    run(&env, JobKind::Extract).await.1.unwrap();

    let mut export = standard_export();
    export[0] = page_entry(
        "Letter_A",
        "0001_a1.xml",
        page_xml(
            "100",
            "1001",
            1,
            &[Line {
                text: "Wien, den 3. März",
                custom: "place {offset:0; length:4;}",
            }],
            true,
        ),
    );
    write_archive(&env.archive, &export);
    run(&env, JobKind::Extract).await.1.unwrap();

    let page_id: i64 = sqlx::query_scalar("SELECT id FROM pages WHERE source_page_id = '1001'")
        .fetch_one(&env.pool)
        .await
        .unwrap();
    let num_tags: i64 = sqlx::query_scalar("SELECT num_tags FROM pages WHERE id = ?")
        .bind(page_id)
        .fetch_one(&env.pool)
        .await
        .unwrap();
    assert_eq!(num_tags, 1);

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM page_tags WHERE page_id = ?")
        .bind(page_id)
        .fetch_one(&env.pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(
        count(&env.pool, "SELECT COUNT(*) FROM page_tags WHERE variation = 'Hans Maier'").await,
        0
    );
}

#[tokio::test]
async fn collection_must_name_its_own_directory() {
    let env = setup().await;

    let mut def = ProjectDefinition {
        id: 2,
        title: "Escape".to_string(),
        collection_id: "..".to_string(),
        archive_path: Some(env.archive.clone()),
        selected_dictionaries: Vec::new(),
        tag_type_translator: Default::default(),
        ignored_tag_types: Vec::new(),
        date_tag_types: Vec::new(),
    };
    assert!(projects::upsert_project(&env.pool, &def).await.is_err());
    def.collection_id = ".".to_string();
    assert!(projects::upsert_project(&env.pool, &def).await.is_err());

    // Another collection's page file next to ours.
    let other = env.config.storage.collection_dir("9999");
    std::fs::create_dir_all(&other).unwrap();
    let kept = other.join("9999_1_2_3.xml");
    std::fs::write(&kept, "<PcGts/>").unwrap();

    // A row written behind the loader's back is still refused at job start.
    sqlx::query("UPDATE projects SET collection_id = '..' WHERE id = ?")
        .bind(env.project_id)
        .execute(&env.pool)
        .await
        .unwrap();
    let (_, result) = run(&env, JobKind::Extract).await;
    assert_eq!(result.unwrap_err().code(), "configuration");
    assert!(kept.exists());
}

#[tokio::test]
async fn collection_is_owned_by_one_project() {
    let env = setup().await;
    run(&env, JobKind::Extract).await.1.unwrap();

    let def = ProjectDefinition {
        id: 2,
        title: "Same letters".to_string(),
        collection_id: COLLECTION.to_string(),
        archive_path: Some(env.archive.clone()),
        selected_dictionaries: vec!["Places".to_string()],
        tag_type_translator: Default::default(),
        ignored_tag_types: Vec::new(),
        date_tag_types: Vec::new(),
    };
    let err = projects::upsert_project(&env.pool, &def).await.unwrap_err();
    assert!(err.to_string().contains("already used by project 1"), "{}", err);

    let inserted = sqlx::query(
        "INSERT INTO projects (id, title, collection_id, created_at, updated_at) VALUES (3, 'x', ?, 0, 0)",
    )
    .bind(COLLECTION)
    .execute(&env.pool)
    .await;
    assert!(inserted.is_err());

    // Re-loading the owner keeps working.
    let owner = ProjectDefinition {
        id: 1,
        ..def
    };
    projects::upsert_project(&env.pool, &owner).await.unwrap();
    let dir = env.config.storage.collection_dir(COLLECTION);
    assert!(dir.join("4711_100_1001_1.xml").exists());
}

#[tokio::test]
async fn documents_missing_from_export_are_removed() {
    let env = setup().await;
    run(&env, JobKind::Extract).await.1.unwrap();

    let export: Vec<(String, String)> = standard_export()
        .into_iter()
        .filter(|(name, _)| !name.contains("Letter_B"))
        .collect();
    write_archive(&env.archive, &export);

    let summary = run(&env, JobKind::Extract).await.1.unwrap();
    let reconcile = summary.reconcile.unwrap();
    assert_eq!(reconcile.documents_deleted, 1);
    assert_eq!(reconcile.pages_deleted, 1);

    assert_eq!(count(&env.pool, "SELECT COUNT(*) FROM documents").await, 1);
    assert_eq!(
        count(&env.pool, "SELECT COUNT(*) FROM page_tags WHERE variation = 'Graz'").await,
        0
    );
    let dir = env.config.storage.collection_dir(COLLECTION);
    assert!(!dir.join("4711_200_2001_1.xml").exists());
}

#[tokio::test]
async fn page_without_identifiers_is_skipped() {
    let env = setup().await;
    let mut export = standard_export();
    export.push(page_entry(
        "Letter_C",
        "0001_c1.xml",
        page_xml("300", "3001", 1, &[], true).replace(r#" pageId="3001""#, ""),
    ));
    write_archive(&env.archive, &export);

    let summary = run(&env, JobKind::Extract).await.1.unwrap();
    let reconcile = summary.reconcile.unwrap();
    assert_eq!(reconcile.files_skipped, 1);
    assert_eq!(reconcile.documents_created, 2);
}

#[tokio::test]
async fn ambiguous_match_picks_lowest_entry_consistently() {
    let env = setup().await;
    let extra: DictionaryImport = serde_json::from_value(json!({
        "label": "Places",
        "type": "city",
        "entries": [{"label": "Wien (Bezirk)", "variations": ["Wien"]}]
    }))
    .unwrap();
    projects::import_dictionary(&env.pool, &extra).await.unwrap();

    let vienna = entry_id(&env.pool, "Vienna").await;
    for _ in 0..2 {
        let summary = run(&env, JobKind::Extract).await.1.unwrap();
        assert_eq!(summary.tags.ambiguous_matches, 1);
        let (_, linked, _) = tag_by_variation(&env.pool, "Wien").await;
        assert_eq!(linked, Some(vienna));
    }
}

#[tokio::test]
async fn tags_job_rebuilds_tags_from_parsed_pages() {
    let env = setup().await;
    run(&env, JobKind::Extract).await.1.unwrap();

    // New vocabulary after the first run.
    let extra: DictionaryImport = serde_json::from_value(json!({
        "label": "Places",
        "type": "city",
        "entries": [{"label": "Vienna", "variations": ["Wienn"]}]
    }))
    .unwrap();
    projects::import_dictionary(&env.pool, &extra).await.unwrap();

    let summary = run(&env, JobKind::Tags).await.1.unwrap();
    assert!(summary.extract.is_none());
    assert!(summary.reconcile.is_none());
    assert_eq!(summary.tags.tags_created, 5);
    assert_eq!(summary.tags.unresolved, 0);
    assert_eq!(count(&env.pool, "SELECT COUNT(*) FROM page_tags").await, 5);
}

#[tokio::test]
async fn suggestions_rank_scoped_entries() {
    let env = setup().await;
    run(&env, JobKind::Extract).await.1.unwrap();

    let (tag_id, _, _) = tag_by_variation(&env.pool, "Wienn").await;
    let found = resolve::suggest_for_tag(&env.pool, &env.config.resolution, tag_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.dictionary_type, "city");
    assert!(found.suggestions.len() <= 5);

    let top = &found.suggestions[0];
    assert_eq!(top.entry_label, "Vienna");
    assert_eq!(top.variation, "Wien");
    assert_eq!(top.score, 80);
    assert_eq!(top.strong_matches, 1);
    assert!(found
        .suggestions
        .iter()
        .all(|s| s.entry_label != "Vienna (foreign)"));
    assert!(found
        .suggestions
        .windows(2)
        .all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn manual_assignment_checks_dictionary_scope() {
    let env = setup().await;
    run(&env, JobKind::Extract).await.1.unwrap();

    let (tag_id, _, _) = tag_by_variation(&env.pool, "Wienn").await;
    let foreign = entry_id(&env.pool, "Vienna (foreign)").await;
    let person = entry_id(&env.pool, "Maier, Johann").await;
    let vienna = entry_id(&env.pool, "Vienna").await;

    let err = resolve::assign_tag_to_entry(&env.pool, tag_id, foreign, USER)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "configuration");
    let err = resolve::assign_tag_to_entry(&env.pool, tag_id, person, USER)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "configuration");

    resolve::assign_tag_to_entry(&env.pool, tag_id, vienna, USER)
        .await
        .unwrap();
    let (_, linked, _) = tag_by_variation(&env.pool, "Wienn").await;
    assert_eq!(linked, Some(vienna));
}

#[tokio::test]
async fn date_tags_resolve_against_date_variations() {
    let env = setup().await;
    let date_id = projects::add_date_variation(&env.pool, "3. März", "1848-03-03", &json!({}))
        .await
        .unwrap();
    write_archive(
        &env.archive,
        &[page_entry(
            "Letter_A",
            "0001_a1.xml",
            page_xml(
                "100",
                "1001",
                1,
                &[Line {
                    text: "Wien, den 3. März",
                    custom: "date {offset:10; length:7;}",
                }],
                true,
            ),
        )],
    );

    let summary = run(&env, JobKind::Extract).await.1.unwrap();
    assert_eq!(summary.tags.dates_resolved, 1);
    let linked: Option<i64> =
        sqlx::query_scalar("SELECT date_variation_id FROM page_tags WHERE variation = '3. März'")
            .fetch_one(&env.pool)
            .await
            .unwrap();
    assert_eq!(linked, Some(date_id));
}

#[tokio::test]
async fn second_job_for_same_project_conflicts() {
    let env = setup().await;
    let first = jobs::start_job(&env.pool, env.project_id, USER, JobKind::Extract, 3600)
        .await
        .unwrap();
    let err = jobs::start_job(&env.pool, env.project_id, USER, JobKind::Tags, 3600)
        .await
        .unwrap_err();
    match err {
        PipelineError::Conflict { project_id, job_id } => {
            assert_eq!(project_id, env.project_id);
            assert_eq!(job_id, first);
        }
        other => panic!("expected conflict, got {:?}", other),
    }

    pipeline::run_job(
        &env.config,
        &env.pool,
        &first,
        env.project_id,
        USER,
        JobKind::Extract,
        Box::new(NoProgress),
    )
    .await
    .unwrap();

    // Lease released with the terminal state.
    jobs::start_job(&env.pool, env.project_id, USER, JobKind::Tags, 3600)
        .await
        .unwrap();
}

#[tokio::test]
async fn requests_without_user_or_project_are_rejected() {
    let env = setup().await;
    let err = jobs::start_job(&env.pool, env.project_id, "  ", JobKind::Extract, 3600)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "configuration");

    let err = jobs::start_job(&env.pool, 99, USER, JobKind::Extract, 3600)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn cancelled_job_ends_revoked_and_frees_project() {
    let env = setup().await;
    let job_id = jobs::start_job(&env.pool, env.project_id, USER, JobKind::Extract, 3600)
        .await
        .unwrap();
    assert!(jobs::request_cancel(&env.pool, &job_id).await.unwrap());

    let err = pipeline::run_job(
        &env.config,
        &env.pool,
        &job_id,
        env.project_id,
        USER,
        JobKind::Extract,
        Box::new(NoProgress),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled(_)));

    let status = jobs::get_job(&env.pool, &job_id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Revoked);
    assert!(!jobs::request_cancel(&env.pool, &job_id).await.unwrap());

    jobs::start_job(&env.pool, env.project_id, USER, JobKind::Extract, 3600)
        .await
        .unwrap();
}

#[tokio::test]
async fn archive_without_pages_fails_the_job() {
    let env = setup().await;
    write_archive(
        &env.archive,
        &[(
            format!("{}/Letter_A/metadata.xml", COLLECTION),
            doc_metadata_xml("100", "x"),
        )],
    );

    let (job_id, result) = run(&env, JobKind::Extract).await;
    assert!(matches!(result, Err(PipelineError::EmptyArchive(_))));

    let status = jobs::get_job(&env.pool, &job_id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Failure);
    assert_eq!(status.status_text, "archive");
    assert!(status.error.unwrap().contains("no page files"));
    assert_eq!(count(&env.pool, "SELECT COUNT(*) FROM documents").await, 0);
}

#[tokio::test]
async fn unreadable_archive_fails_the_job() {
    let env = setup().await;
    std::fs::write(&env.archive, b"not a zip file").unwrap();

    let (job_id, result) = run(&env, JobKind::Extract).await;
    assert!(matches!(result, Err(PipelineError::Archive(_))));
    let status = jobs::get_job(&env.pool, &job_id).await.unwrap().unwrap();
    assert_eq!(status.state, JobState::Failure);
}

#[tokio::test]
async fn stats_leave_out_ignored_pages() {
    let env = setup().await;
    run(&env, JobKind::Extract).await.1.unwrap();

    let stats = stats::project_stats(&env.pool, env.project_id).await.unwrap();
    assert_eq!(stats.documents, 2);
    assert_eq!(stats.pages, 3);
    assert_eq!(stats.ignored_pages, 1);
    assert_eq!(stats.ignored_percent, 33.3);
    assert_eq!(stats.avg_pages_per_document, 1.0);
    // Tags of the ignored Graz page are not counted.
    assert_eq!(stats.tags, 3);
    assert_eq!(stats.resolved_tags, 2);
    assert_eq!(stats.unresolved_tags, 1);
}
