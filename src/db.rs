use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::ingest;
use crate::models::{
    AcademicRecord, PredictionMap, PredictionResult, RawValue, RiskTier, StudentPrediction,
    StudentWithHistory,
};
use crate::repository::{HistoryRepository, PredictionSink};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let students = vec![
        ("2019-0001", "Valeria Ruiz", "4"),
        ("2020-0117", "Tomas Vera", "3"),
        ("2021-0342", "Nadia Paz", "2"),
    ];

    for (id, name, level) in students {
        upsert_student(pool, id, name, Some(level)).await?;
    }

    let history = vec![
        ("seed-001", "2019-0001", "MAT101", "2019-1", "16.5", "1", "APROBADO"),
        ("seed-002", "2019-0001", "FIS102", "2019-2", "15.0", "1", "APROBADO"),
        ("seed-003", "2019-0001", "PRG201", "2020-1", "14.2", "2", "APROBADO"),
        ("seed-004", "2020-0117", "MAT101", "2020-1", "11.0", "1", "REPROBADO"),
        ("seed-005", "2020-0117", "MAT101", "2020-2", "12.5", "1", "REPROBADO"),
        ("seed-006", "2020-0117", "FIS102", "2020-2", "9.8", "1", "REPROBADO"),
        ("seed-007", "2020-0117", "PRG201", "2021-1", "14.6", "2", "APROBADO"),
        ("seed-008", "2021-0342", "MAT101", "2021-1", "13.0", "1", "REPROBADO"),
        ("seed-009", "2021-0342", "FIS102", "2021-1", "15.4", "1", "APROBADO"),
    ];

    for (source_key, student_id, course, term, grade, level, state) in history {
        insert_history(
            pool,
            student_id,
            Some(course),
            Some(term),
            Some(grade),
            Some(level),
            Some(state),
            source_key,
        )
        .await?;
    }

    Ok(())
}

pub async fn import_csv(pool: &PgPool, csv_path: &Path) -> anyhow::Result<usize> {
    let rows = ingest::read_rows(csv_path)?;
    let mut inserted = 0usize;

    for row in rows {
        upsert_student(pool, &row.student_id, &row.full_name, row.student_level.as_deref()).await?;
        if row.is_student_only() {
            continue;
        }

        let source_key = match (&row.course_code, &row.term) {
            (Some(course), Some(term)) => format!("{}:{course}:{term}", row.student_id),
            _ => format!("import-{}", Uuid::new_v4()),
        };

        let affected = insert_history(
            pool,
            &row.student_id,
            row.course_code.as_deref(),
            row.term.as_deref(),
            row.grade.as_deref(),
            row.level.as_deref(),
            row.state.as_deref(),
            &source_key,
        )
        .await?;

        if affected > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

async fn upsert_student(
    pool: &PgPool,
    id: &str,
    full_name: &str,
    level: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO dropout_early_warning.students (id, full_name, level)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO UPDATE
        SET full_name = EXCLUDED.full_name, level = EXCLUDED.level
        "#,
    )
    .bind(id)
    .bind(full_name)
    .bind(level)
    .execute(pool)
    .await
    .with_context(|| format!("failed to upsert student {id}"))?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn insert_history(
    pool: &PgPool,
    student_id: &str,
    course_code: Option<&str>,
    term: Option<&str>,
    grade: Option<&str>,
    level: Option<&str>,
    state: Option<&str>,
    source_key: &str,
) -> anyhow::Result<u64> {
    let result = sqlx::query(
        r#"
        INSERT INTO dropout_early_warning.academic_history
        (id, student_id, course_code, term, grade, level, state, source_key)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (source_key) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(student_id)
    .bind(course_code)
    .bind(term)
    .bind(grade)
    .bind(level)
    .bind(state)
    .bind(source_key)
    .execute(pool)
    .await
    .with_context(|| format!("failed to insert history row {source_key}"))?;

    Ok(result.rows_affected())
}

/// Students with their full history, optionally restricted to one level.
pub async fn fetch_students(
    pool: &PgPool,
    level: Option<&str>,
) -> anyhow::Result<Vec<StudentWithHistory>> {
    let mut query = String::from(
        "SELECT st.id, st.full_name, st.level AS student_level, \
         h.grade, h.level, h.state \
         FROM dropout_early_warning.students st \
         LEFT JOIN dropout_early_warning.academic_history h ON h.student_id = st.id",
    );
    if level.is_some() {
        query.push_str(" WHERE st.level = $1");
    }
    query.push_str(" ORDER BY st.id, h.term NULLS LAST, h.course_code");

    let mut rows = sqlx::query(&query);
    if let Some(value) = level {
        rows = rows.bind(value);
    }

    let records = rows.fetch_all(pool).await.context("failed to fetch students")?;
    let mut students: Vec<StudentWithHistory> = Vec::new();

    for row in records {
        let id: String = row.get("id");
        if students.last().map(|s| s.id != id).unwrap_or(true) {
            students.push(StudentWithHistory {
                id,
                full_name: row.get("full_name"),
                level: row.get("student_level"),
                history: Vec::new(),
            });
        }

        let grade: Option<String> = row.get("grade");
        let course_level: Option<String> = row.get("level");
        let state: Option<String> = row.get("state");
        if grade.is_none() && course_level.is_none() && state.is_none() {
            continue;
        }
        if let Some(student) = students.last_mut() {
            student.history.push(AcademicRecord {
                grade: grade.map(RawValue::Text),
                level: course_level.map(RawValue::Text),
                state,
            });
        }
    }

    Ok(students)
}

/// Stored predictions, used as the starting point of the next batch.
pub async fn fetch_predictions(pool: &PgPool) -> anyhow::Result<PredictionMap> {
    let records = sqlx::query(
        r#"
        SELECT p.student_id, st.full_name, st.level, p.risk_tier, p.probability, p.predicted_at
        FROM dropout_early_warning.predictions p
        JOIN dropout_early_warning.students st ON st.id = p.student_id
        "#,
    )
    .fetch_all(pool)
    .await
    .context("failed to fetch predictions")?;

    let mut predictions = PredictionMap::new();
    for row in records {
        let student_id: String = row.get("student_id");
        let tier: String = row.get("risk_tier");
        let predicted_at: DateTime<Utc> = row.get("predicted_at");
        let prediction = PredictionResult {
            probability: row.get("probability"),
            risk_tier: tier.parse::<RiskTier>()?,
        };
        predictions.insert(
            student_id.clone(),
            StudentPrediction {
                student_id,
                full_name: row.get("full_name"),
                level: row.get("level"),
                prediction,
                predicted_at,
            },
        );
    }

    Ok(predictions)
}

/// Postgres-backed history source and prediction sink.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryRepository for PgStore {
    async fn get_history(&self, student_id: &str) -> Result<Vec<AcademicRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT grade, level, state
            FROM dropout_early_warning.academic_history
            WHERE student_id = $1
            ORDER BY term NULLS LAST, course_code
            "#,
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(PipelineError::repository)?;

        Ok(rows
            .into_iter()
            .map(|row| AcademicRecord {
                grade: row.get::<Option<String>, _>("grade").map(RawValue::Text),
                level: row.get::<Option<String>, _>("level").map(RawValue::Text),
                state: row.get("state"),
            })
            .collect())
    }
}

#[async_trait]
impl PredictionSink for PgStore {
    async fn save_prediction(&self, student_id: &str, prediction: &PredictionResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dropout_early_warning.predictions
            (student_id, risk_tier, probability, predicted_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (student_id) DO UPDATE
            SET risk_tier = EXCLUDED.risk_tier,
                probability = EXCLUDED.probability,
                predicted_at = EXCLUDED.predicted_at
            "#,
        )
        .bind(student_id)
        .bind(prediction.risk_tier.as_str())
        .bind(prediction.probability)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::repository)?;
        Ok(())
    }
}
