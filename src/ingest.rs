use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

use crate::models::{AcademicRecord, RawValue, StudentWithHistory};

/// One spreadsheet row: a student plus one course result.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryRow {
    pub student_id: String,
    pub full_name: String,
    pub student_level: Option<String>,
    pub course_code: Option<String>,
    pub term: Option<String>,
    pub grade: Option<String>,
    pub level: Option<String>,
    pub state: Option<String>,
}

impl HistoryRow {
    /// Cells are passed through untouched; normalization happens later.
    pub fn record(&self) -> AcademicRecord {
        AcademicRecord {
            grade: self.grade.clone().map(RawValue::Text),
            level: self.level.clone().map(RawValue::Text),
            state: self.state.clone(),
        }
    }

    /// True for rows that only introduce a student, without a course.
    pub fn is_student_only(&self) -> bool {
        self.course_code.is_none() && self.grade.is_none() && self.level.is_none()
    }
}

pub fn read_rows(path: &Path) -> anyhow::Result<Vec<HistoryRow>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    read_rows_from(file).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn read_rows_from<R: Read>(input: R) -> anyhow::Result<Vec<HistoryRow>> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(input);
    let mut rows = Vec::new();

    for (line, result) in reader.deserialize::<HistoryRow>().enumerate() {
        let row = result.with_context(|| format!("invalid row {}", line + 2))?;
        if row.student_id.is_empty() {
            warn!(row = line + 2, "skipping row without a student id");
            continue;
        }
        rows.push(row);
    }

    Ok(rows)
}

/// Group rows by student, keeping the order students first appear in.
pub fn group_students(rows: &[HistoryRow]) -> Vec<StudentWithHistory> {
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut students: Vec<StudentWithHistory> = Vec::new();

    for row in rows {
        let position = *positions.entry(row.student_id.as_str()).or_insert_with(|| {
            students.push(StudentWithHistory {
                id: row.student_id.clone(),
                full_name: row.full_name.clone(),
                level: row.student_level.clone(),
                history: Vec::new(),
            });
            students.len() - 1
        });

        if !row.is_student_only() {
            students[position].history.push(row.record());
        }
    }

    students
}

pub fn load_students(path: &Path) -> anyhow::Result<Vec<StudentWithHistory>> {
    Ok(group_students(&read_rows(path)?))
}
