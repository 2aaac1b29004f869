//! Job driver.
//!
//! Runs the stages of one job in order and records the outcome:
//!
//! ```text
//! extract job:  archive → reconcile → parse → tags
//! tags job:                                    tags
//! ```
//!
//! The project configuration is read once here and passed by reference into
//! every stage. Whatever happens, the project lease taken by
//! [`jobs::start_job`] is released before returning.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{error, info};

use crate::archive;
use crate::config::Config;
use crate::db;
use crate::error::PipelineResult;
use crate::jobs::{self, JobTracker};
use crate::models::{JobKind, JobState, PipelineSummary, ProjectConfig, TagSummary};
use crate::page_parser::{self, PageXmlParser};
use crate::progress::{ProgressMode, ProgressReporter};
use crate::projects;
use crate::reconcile;
use crate::resolve::Vocabulary;
use crate::tags;

/// Run an already created job to its terminal state.
///
/// Stage failures end in `FAILURE` (or `REVOKED` on cancellation) and are
/// returned to the caller after being recorded.
pub async fn run_job(
    config: &Config,
    pool: &SqlitePool,
    job_id: &str,
    project_id: i64,
    user: &str,
    kind: JobKind,
    reporter: Box<dyn ProgressReporter>,
) -> PipelineResult<PipelineSummary> {
    let tracker = JobTracker::new(pool.clone(), job_id.to_string(), kind, reporter);
    let outcome = run_stages(config, pool, project_id, user, &tracker).await;

    let recorded = match &outcome {
        Ok(summary) => tracker.succeed(summary).await,
        Err(err) => {
            error!(job_id, project_id, code = err.code(), error = %err, "job failed");
            tracker.fail(err).await
        }
    };
    let released = jobs::release_lease(pool, project_id, job_id).await;

    let summary = outcome?;
    recorded?;
    released?;
    info!(job_id, project_id, kind = kind.as_str(), "job finished");
    Ok(summary)
}

async fn run_stages(
    config: &Config,
    pool: &SqlitePool,
    project_id: i64,
    user: &str,
    tracker: &JobTracker,
) -> PipelineResult<PipelineSummary> {
    let project = projects::load_project_config(pool, project_id).await?;
    let mut summary = PipelineSummary::default();

    if tracker.kind() == JobKind::Extract {
        tracker.note("extracting archive").await?;
        let files = archive::extract_archive(config, &project, tracker).await?;
        summary.extract = Some(files.summary());

        tracker.note("reconciling documents").await?;
        summary.reconcile =
            Some(reconcile::reconcile(config, pool, &project, user, &files, tracker).await?);

        tracker.note("parsing pages").await?;
        let parser = Arc::new(PageXmlParser::new(&config.parser.line_type));
        summary.parse =
            Some(page_parser::parse_pages(config, pool, &project, user, parser, tracker).await?);
    }

    summary.tags = run_tag_stage(pool, &project, user, tracker).await?;
    Ok(summary)
}

async fn run_tag_stage(
    pool: &SqlitePool,
    project: &ProjectConfig,
    user: &str,
    tracker: &JobTracker,
) -> PipelineResult<TagSummary> {
    tracker.note("extracting tags").await?;
    let vocabulary = Vocabulary::load(pool, project).await?;
    tags::extract_tags(pool, project, user, &vocabulary, tracker).await
}

/// CLI entry point: start a job and run it in the foreground.
pub async fn run_cli_job(
    config: &Config,
    project_id: i64,
    user: &str,
    kind: JobKind,
    mode: ProgressMode,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = start_and_run(config, &pool, project_id, user, kind, mode).await;
    pool.close().await;

    match result {
        Ok((job_id, summary)) => {
            println!("Job {} {}", job_id, JobState::Success.as_str());
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn start_and_run(
    config: &Config,
    pool: &SqlitePool,
    project_id: i64,
    user: &str,
    kind: JobKind,
    mode: ProgressMode,
) -> PipelineResult<(String, PipelineSummary)> {
    let job_id = jobs::start_job(
        pool,
        project_id,
        user,
        kind,
        config.pipeline.lock_ttl_secs,
    )
    .await?;
    eprintln!("Started {} job {}", kind.as_str(), job_id);
    let summary = run_job(config, pool, &job_id, project_id, user, kind, mode.reporter()).await?;
    Ok((job_id, summary))
}
