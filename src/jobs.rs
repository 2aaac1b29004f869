//! Job records, per-project leases and cancellation.
//!
//! A job row moves `PENDING → PROGRESS* → SUCCESS | FAILURE | REVOKED`.
//! Callers poll [`get_job`]; the running pipeline writes through a
//! [`JobTracker`]. Before a job row is created the project lease in
//! `project_locks` is taken, so at most one job per project runs at a time
//! across every process sharing the database.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{JobKind, JobState, JobStatus, PipelineSummary};
use crate::progress::{stage_percent, ProgressEvent, ProgressReporter, Stage, StageProgress};
use crate::projects;

/// Validate the request, take the project lease and create a `PENDING` job.
///
/// Fails with `Configuration` for an empty user, `NotFound` for an unknown
/// project and `Conflict` while another job holds the project.
pub async fn start_job(
    pool: &SqlitePool,
    project_id: i64,
    user: &str,
    kind: JobKind,
    lock_ttl_secs: i64,
) -> PipelineResult<String> {
    if user.trim().is_empty() {
        return Err(PipelineError::Configuration(
            "an acting user is required".to_string(),
        ));
    }
    if !projects::project_exists(pool, project_id).await? {
        return Err(PipelineError::NotFound(format!("project {}", project_id)));
    }

    let job_id = Uuid::new_v4().to_string();
    acquire_lease(pool, project_id, &job_id, lock_ttl_secs).await?;

    let now = chrono::Utc::now().timestamp();
    let inserted = sqlx::query(
        r#"
        INSERT INTO jobs (id, project_id, user_name, kind, state, percent, status_text, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 0, 'queued', ?, ?)
        "#,
    )
    .bind(&job_id)
    .bind(project_id)
    .bind(user)
    .bind(kind.as_str())
    .bind(JobState::Pending.as_str())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await;

    if let Err(e) = inserted {
        release_lease(pool, project_id, &job_id).await?;
        return Err(e.into());
    }

    info!(job_id = %job_id, project_id, kind = kind.as_str(), "job created");
    Ok(job_id)
}

/// Insert the lease row for `project_id`, replacing a stale one.
///
/// A lease is stale once older than `ttl_secs` or when its job already
/// reached a terminal state (e.g. the worker died after finishing).
pub async fn acquire_lease(
    pool: &SqlitePool,
    project_id: i64,
    job_id: &str,
    ttl_secs: i64,
) -> PipelineResult<()> {
    let now = chrono::Utc::now().timestamp();

    let stale = sqlx::query(
        r#"
        DELETE FROM project_locks
        WHERE project_id = ?
          AND (acquired_at < ?
               OR job_id IN (SELECT id FROM jobs WHERE state IN ('SUCCESS', 'FAILURE', 'REVOKED')))
        "#,
    )
    .bind(project_id)
    .bind(now - ttl_secs)
    .execute(pool)
    .await?;
    if stale.rows_affected() > 0 {
        warn!(project_id, "replaced stale project lease");
    }

    let result = sqlx::query(
        r#"
        INSERT INTO project_locks (project_id, job_id, acquired_at) VALUES (?, ?, ?)
        ON CONFLICT(project_id) DO NOTHING
        "#,
    )
    .bind(project_id)
    .bind(job_id)
    .bind(now)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        let holder: Option<String> =
            sqlx::query_scalar("SELECT job_id FROM project_locks WHERE project_id = ?")
                .bind(project_id)
                .fetch_optional(pool)
                .await?;
        return Err(PipelineError::Conflict {
            project_id,
            job_id: holder.unwrap_or_default(),
        });
    }

    Ok(())
}

pub async fn release_lease(pool: &SqlitePool, project_id: i64, job_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM project_locks WHERE project_id = ? AND job_id = ?")
        .bind(project_id)
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_job(pool: &SqlitePool, job_id: &str) -> Result<Option<JobStatus>> {
    let row = sqlx::query(
        r#"
        SELECT id, project_id, user_name, kind, state, percent, status_text, error,
               summary_json, cancel_requested, created_at, updated_at
        FROM jobs WHERE id = ?
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    let row = match row {
        Some(row) => row,
        None => return Ok(None),
    };

    let state: String = row.get("state");
    let state = JobState::parse(&state)
        .ok_or_else(|| anyhow::anyhow!("job {} has unknown state '{}'", job_id, state))?;
    let summary: Option<String> = row.get("summary_json");
    let cancel_requested: i64 = row.get("cancel_requested");

    Ok(Some(JobStatus {
        id: row.get("id"),
        project_id: row.get("project_id"),
        user: row.get("user_name"),
        kind: row.get("kind"),
        state,
        percent: row.get("percent"),
        status_text: row.get("status_text"),
        error: row.get("error"),
        summary: summary.and_then(|s| serde_json::from_str(&s).ok()),
        cancel_requested: cancel_requested != 0,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }))
}

/// Flag a job for cancellation. Returns `false` when the job is unknown or
/// already finished.
pub async fn request_cancel(pool: &SqlitePool, job_id: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs SET cancel_requested = 1, updated_at = ?
        WHERE id = ? AND state IN ('PENDING', 'PROGRESS')
        "#,
    )
    .bind(chrono::Utc::now().timestamp())
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// CLI entry point for `status`.
pub async fn run_status(config: &Config, job_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let status = get_job(&pool, job_id).await;
    pool.close().await;
    let Some(status) = status? else {
        anyhow::bail!("job not found: {}", job_id);
    };

    println!("job:      {}", status.id);
    println!("project:  {}", status.project_id);
    println!("kind:     {}", status.kind);
    println!("user:     {}", status.user);
    println!("state:    {}", status.state.as_str());
    println!("progress: {:.0}%  {}", status.percent, status.status_text);
    if status.cancel_requested && !status.state.is_terminal() {
        println!("cancellation requested");
    }
    if let Some(error) = &status.error {
        println!("error:    {}", error);
    }
    if let Some(summary) = &status.summary {
        println!("summary:  {}", serde_json::to_string_pretty(summary)?);
    }
    Ok(())
}

/// CLI entry point for `cancel`.
pub async fn run_cancel(config: &Config, job_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let flagged = request_cancel(&pool, job_id).await;
    pool.close().await;
    if flagged? {
        println!("Cancellation requested for job {}.", job_id);
    } else {
        println!("Job {} is unknown or already finished.", job_id);
    }
    Ok(())
}

/// Mutable bookkeeping behind the tracker's `&self` API.
struct Watermark {
    percent: f64,
    written: i64,
}

/// Writes one job's progress and outcome to its job row.
pub struct JobTracker {
    pool: SqlitePool,
    job_id: String,
    kind: JobKind,
    reporter: Box<dyn ProgressReporter>,
    mark: Mutex<Watermark>,
}

impl JobTracker {
    pub fn new(
        pool: SqlitePool,
        job_id: String,
        kind: JobKind,
        reporter: Box<dyn ProgressReporter>,
    ) -> Self {
        Self {
            pool,
            job_id,
            kind,
            reporter,
            mark: Mutex::new(Watermark {
                percent: 0.0,
                written: -1,
            }),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Update the status text without moving the percentage.
    pub async fn note(&self, text: &str) -> PipelineResult<()> {
        let percent = self.current_percent();
        self.write_progress(percent, text).await
    }

    pub async fn succeed(&self, summary: &PipelineSummary) -> Result<()> {
        let summary_json = serde_json::to_string(summary)?;
        sqlx::query(
            r#"
            UPDATE jobs SET state = ?, percent = 100, status_text = 'finished',
                            summary_json = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(JobState::Success.as_str())
        .bind(&summary_json)
        .bind(chrono::Utc::now().timestamp())
        .bind(&self.job_id)
        .execute(&self.pool)
        .await?;

        self.reporter.report(&ProgressEvent::Finished {
            job_id: self.job_id.clone(),
            state: JobState::Success.as_str().to_string(),
            message: summary_json,
        });
        Ok(())
    }

    /// Record the terminal outcome for a failed run. Cancellation ends as
    /// `REVOKED`, everything else as `FAILURE` carrying the error message.
    pub async fn fail(&self, err: &PipelineError) -> Result<()> {
        let state = match err {
            PipelineError::Cancelled(_) => JobState::Revoked,
            _ => JobState::Failure,
        };
        let message = err.to_string();
        sqlx::query(
            "UPDATE jobs SET state = ?, status_text = ?, error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(err.code())
        .bind(&message)
        .bind(chrono::Utc::now().timestamp())
        .bind(&self.job_id)
        .execute(&self.pool)
        .await?;

        self.reporter.report(&ProgressEvent::Finished {
            job_id: self.job_id.clone(),
            state: state.as_str().to_string(),
            message,
        });
        Ok(())
    }

    fn current_percent(&self) -> f64 {
        self.mark.lock().map(|m| m.percent).unwrap_or(0.0)
    }

    /// Persist `percent` and `text`, then check the cancellation flag.
    async fn write_progress(&self, percent: f64, text: &str) -> PipelineResult<()> {
        let cancel: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE jobs SET state = ?, percent = ?, status_text = ?, updated_at = ?
            WHERE id = ?
            RETURNING cancel_requested
            "#,
        )
        .bind(JobState::Progress.as_str())
        .bind(percent)
        .bind(text)
        .bind(chrono::Utc::now().timestamp())
        .bind(&self.job_id)
        .fetch_optional(&self.pool)
        .await?;

        if cancel.unwrap_or(0) != 0 {
            debug!(job_id = %self.job_id, "cancellation requested");
            return Err(PipelineError::Cancelled(self.job_id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl StageProgress for JobTracker {
    async fn advance(&self, stage: Stage, n: u64, total: u64, text: &str) -> PipelineResult<()> {
        let computed = stage_percent(self.kind, stage, n, total);

        // Only whole-percent changes and stage ends reach the database.
        let (percent, should_write) = {
            let mut mark = self
                .mark
                .lock()
                .map_err(|_| anyhow::anyhow!("job tracker state poisoned"))?;
            mark.percent = mark.percent.max(computed);
            let whole = mark.percent.floor() as i64;
            let write = whole != mark.written || n >= total;
            if write {
                mark.written = whole;
            }
            (mark.percent, write)
        };

        if !should_write {
            return Ok(());
        }

        self.reporter.report(&ProgressEvent::Stage {
            job_id: self.job_id.clone(),
            stage,
            n,
            total,
            percent,
            text: text.to_string(),
        });
        self.write_progress(percent, text).await
    }
}
