use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::job::Job;

/// Insert a new job record. Returns false if the id already exists.
pub async fn insert_job(pool: &PgPool, job: &Job) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO detection_jobs (id, stage, record, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(job.id)
    .bind(job.stage.to_string())
    .bind(Json(job))
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT record
        FROM detection_jobs
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| r.try_get::<Json<Job>, _>("record").map(|j| j.0))
        .transpose()
}

/// Replace the job record only if its stored stage is still `expected_stage`.
pub async fn compare_and_set_job(
    pool: &PgPool,
    job_id: Uuid,
    expected_stage: &str,
    job: &Job,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE detection_jobs
        SET stage = $3,
            record = $4,
            updated_at = NOW(),
            finished_at = CASE WHEN $5 THEN NOW() ELSE finished_at END
        WHERE id = $1 AND stage = $2
        "#,
    )
    .bind(job_id)
    .bind(expected_stage)
    .bind(job.stage.to_string())
    .bind(Json(job))
    .bind(job.stage.is_terminal())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Delete terminal jobs that finished more than `ttl_secs` ago.
pub async fn delete_finished_before(pool: &PgPool, ttl_secs: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        DELETE FROM detection_jobs
        WHERE finished_at IS NOT NULL
          AND finished_at < NOW() - make_interval(secs => $1)
        "#,
    )
    .bind(ttl_secs as f64)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
