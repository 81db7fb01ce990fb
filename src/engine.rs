//! Batch computation runner.
//!
//! A batch is created with one pending summary per department in scope and
//! then processed department by department. Each department is read,
//! computed and written (in final mode, with its record changes) inside one
//! `BEGIN IMMEDIATE` transaction together with the batch counters, so no
//! upload or approval can land between the read and the commit.

use crate::computation::{
    derive_terminal_status, BatchProgress, CarryoverStats, ComputationMode, ComputationStatus,
    ComputationSummary, DepartmentStatus, FailedStudent, MasterComputation, TransitionError,
};
use crate::db::{self, now_rfc3339};
use crate::grading::{
    aggregate_semester, round_2_decimals, Classification, CourseInput, CourseResult,
    CumulativeTotals, GradeScale, GradingError, Standing,
};
use crate::settings;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("{0}")]
    NotFound(String),
    #[error("no department has an active, unlocked semester in scope")]
    NothingToCompute,
    #[error("computation {0} is still processing")]
    InProgress(String),
    #[error("only failed or completed_with_errors batches can be retried (batch is {})", .0.as_str())]
    NotRetryable(ComputationStatus),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for ComputeError {
    fn from(e: rusqlite::Error) -> Self {
        ComputeError::Storage(e.into())
    }
}

impl From<serde_json::Error> for ComputeError {
    fn from(e: serde_json::Error) -> Self {
        ComputeError::Storage(e.into())
    }
}

impl ComputeError {
    pub fn code(&self) -> &'static str {
        match self {
            ComputeError::NotFound(_) => "not_found",
            ComputeError::NothingToCompute => "nothing_to_compute",
            ComputeError::InProgress(_) => "computation_in_progress",
            ComputeError::NotRetryable(_) | ComputeError::Transition(_) => "invalid_transition",
            ComputeError::Storage(_) => "db_query_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemesterResultStatus {
    Pending,
    Processed,
    Failed,
}

/// One student's line on a department mastersheet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MastersheetRow {
    pub student_id: String,
    pub matric_no: String,
    pub name: String,
    pub status: SemesterResultStatus,
    pub courses: Vec<CourseResult>,
    pub total_units: u32,
    pub total_points: u32,
    pub gpa: Option<f64>,
    pub cgpa: Option<f64>,
    pub cumulative_units: u32,
    pub cumulative_points: u32,
    pub carryover_count: usize,
    pub remark: Option<Standing>,
    pub classification: Option<Classification>,
}

#[derive(Debug, Clone)]
struct SummaryRow {
    id: String,
    department_id: String,
    department_code: String,
    semester_id: String,
}

#[derive(Debug, Clone)]
struct DepartmentReport {
    rows: Vec<MastersheetRow>,
    total_students: u32,
    students_with_results: u32,
    gpa_sum: f64,
    highest_gpa: Option<f64>,
    carryover_stats: CarryoverStats,
    failed_students: Vec<FailedStudent>,
}

impl DepartmentReport {
    fn average_gpa(&self) -> Option<f64> {
        if self.students_with_results == 0 {
            return None;
        }
        Some(round_2_decimals(
            self.gpa_sum / f64::from(self.students_with_results),
        ))
    }
}

#[derive(Debug, Clone)]
struct SemesterInfo {
    sequence: i64,
    locked: bool,
}

pub fn processing_batch_id(conn: &Connection) -> Result<Option<String>, ComputeError> {
    Ok(conn
        .query_row(
            "SELECT id FROM master_computations WHERE status = 'processing' ORDER BY started_at LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()?)
}

/// Creates a `processing` batch with one pending summary per department
/// that has an active, unlocked semester (narrowed by `department_ids`).
pub fn create_batch(
    conn: &Connection,
    mode: ComputationMode,
    computed_by: &str,
    department_ids: Option<&[String]>,
    retry_of: Option<&str>,
) -> Result<String, ComputeError> {
    if let Some(id) = processing_batch_id(conn)? {
        return Err(ComputeError::InProgress(id));
    }

    let mut stmt = conn.prepare(
        "SELECT d.id, s.id
         FROM departments d
         JOIN semesters s ON s.department_id = d.id
         WHERE s.active = 1 AND s.locked = 0
         ORDER BY d.code",
    )?;
    let mut scope = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(ids) = department_ids {
        scope.retain(|(dept_id, _)| ids.iter().any(|id| id == dept_id));
    }

    let total = u32::try_from(scope.len()).unwrap_or(u32::MAX);
    let progress = match BatchProgress::start(total) {
        Ok(p) => p,
        Err(TransitionError::EmptyBatch) => return Err(ComputeError::NothingToCompute),
        Err(e) => return Err(e.into()),
    };

    let computation_id = Uuid::new_v4().to_string();
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    tx.execute(
        "INSERT INTO master_computations(
            id, mode, status, total_departments, departments_processed, failed_departments,
            started_at, computed_by, retry_of)
         VALUES(?, ?, ?, ?, 0, 0, ?, ?, ?)",
        (
            &computation_id,
            mode.as_str(),
            progress.status().as_str(),
            progress.total_departments(),
            now_rfc3339(),
            computed_by,
            retry_of,
        ),
    )?;
    for (i, (dept_id, semester_id)) in scope.iter().enumerate() {
        tx.execute(
            "INSERT INTO computation_summaries(
                id, computation_id, department_id, semester_id, sort_order, status)
             VALUES(?, ?, ?, ?, ?, 'pending')",
            (
                Uuid::new_v4().to_string(),
                &computation_id,
                dept_id,
                semester_id,
                i as i64,
            ),
        )?;
    }
    tx.commit()?;

    info!(
        computation_id = %computation_id,
        mode = mode.as_str(),
        departments = total,
        retry_of = retry_of.unwrap_or(""),
        "computation batch created"
    );
    Ok(computation_id)
}

fn batch_progress(conn: &Connection, computation_id: &str) -> Result<BatchProgress, ComputeError> {
    let row: Option<(String, u32, u32, u32)> = conn
        .query_row(
            "SELECT status, total_departments, departments_processed, failed_departments
             FROM master_computations WHERE id = ?",
            [computation_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((status, total, processed, failed)) = row else {
        return Err(ComputeError::NotFound("computation not found".into()));
    };
    let status = ComputationStatus::parse(&status)
        .ok_or_else(|| anyhow::anyhow!("unknown computation status {status}"))?;
    Ok(BatchProgress::restore(status, total, processed, failed))
}

fn batch_mode(conn: &Connection, computation_id: &str) -> Result<ComputationMode, ComputeError> {
    let mode: Option<String> = conn
        .query_row(
            "SELECT mode FROM master_computations WHERE id = ?",
            [computation_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(mode) = mode else {
        return Err(ComputeError::NotFound("computation not found".into()));
    };
    Ok(ComputationMode::parse(&mode)
        .ok_or_else(|| anyhow::anyhow!("unknown computation mode {mode}"))?)
}

fn pending_summaries(conn: &Connection, computation_id: &str) -> Result<Vec<SummaryRow>, ComputeError> {
    let mut stmt = conn.prepare(
        "SELECT cs.id, cs.department_id, d.code, cs.semester_id
         FROM computation_summaries cs
         JOIN departments d ON d.id = cs.department_id
         WHERE cs.computation_id = ? AND cs.status = 'pending'
         ORDER BY cs.sort_order",
    )?;
    let rows = stmt
        .query_map([computation_id], |r| {
            Ok(SummaryRow {
                id: r.get(0)?,
                department_id: r.get(1)?,
                department_code: r.get(2)?,
                semester_id: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Processes every pending department of a batch. Stops early when the
/// batch stops being `processing` (operator cancel).
pub fn run_batch(conn: &Connection, computation_id: &str) -> Result<MasterComputation, ComputeError> {
    let mode = batch_mode(conn, computation_id)?;
    if batch_progress(conn, computation_id)?.status().is_terminal() {
        return load_computation(conn, computation_id, true);
    }

    let scale = settings::grade_scale(conn)?;
    let notify = settings::platform_flag(conn, "notifyStudentsOnFinal")?;

    for summary in pending_summaries(conn, computation_id)? {
        let started = Instant::now();
        // Results are read under the same write lock that commits them.
        let mut tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
        let mut progress = batch_progress(&tx, computation_id)?;
        if progress.status() != ComputationStatus::Processing {
            info!(computation_id, "computation batch no longer processing; stopping");
            tx.rollback()?;
            break;
        }

        let computed = compute_department(&tx, &scale, mode, &summary);
        let outcome = match computed {
            Ok(report) if mode.commits_records() => {
                let sp = tx.savepoint()?;
                match commit_department_records(&sp, computation_id, &summary, &report, notify) {
                    Ok(()) => {
                        sp.commit()?;
                        Ok(report)
                    }
                    // Dropping the savepoint rolls back the partial writes.
                    Err(e) => Err(format!("failed to commit student records: {e}")),
                }
            }
            other => other,
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        let status = progress.record_department(outcome.is_ok())?;
        match &outcome {
            Ok(report) => {
                record_department_success(&tx, computation_id, &summary, report, duration_ms)?;
                info!(
                    computation_id,
                    department = %summary.department_code,
                    students = report.students_with_results,
                    failed_students = report.failed_students.len(),
                    "department computed"
                );
            }
            Err(message) => {
                record_department_failure(&tx, computation_id, &summary, message, duration_ms)?;
                warn!(
                    computation_id,
                    department = %summary.department_code,
                    error = %message,
                    "department computation failed"
                );
            }
        }
        if status.is_terminal() {
            finalize_batch(&tx, computation_id, status)?;
            info!(
                computation_id,
                mode = mode.as_str(),
                status = status.as_str(),
                failures = progress.failures(),
                "computation batch finished"
            );
        }
        tx.commit()?;
    }

    load_computation(conn, computation_id, true)
}

fn record_department_success(
    conn: &Connection,
    computation_id: &str,
    summary: &SummaryRow,
    report: &DepartmentReport,
    duration_ms: i64,
) -> Result<(), ComputeError> {
    conn.execute(
        "UPDATE computation_summaries SET
            status = 'completed',
            students_with_results = ?,
            total_students = ?,
            average_gpa = ?,
            highest_gpa = ?,
            gpa_sum = ?,
            carryover_stats_json = ?,
            failed_students_json = ?,
            mastersheet_json = ?,
            error = NULL,
            duration_ms = ?
         WHERE id = ?",
        (
            report.students_with_results,
            report.total_students,
            report.average_gpa(),
            report.highest_gpa,
            report.gpa_sum,
            serde_json::to_string(&report.carryover_stats)?,
            serde_json::to_string(&report.failed_students)?,
            serde_json::to_string(&report.rows)?,
            duration_ms,
            &summary.id,
        ),
    )?;
    conn.execute(
        "UPDATE master_computations SET
            departments_processed = departments_processed + 1,
            total_carryovers = total_carryovers + ?,
            total_failed_students = total_failed_students + ?
         WHERE id = ? AND status = 'processing'",
        (
            report.carryover_stats.total_carryovers,
            report.failed_students.len() as i64,
            computation_id,
        ),
    )?;
    Ok(())
}

fn record_department_failure(
    conn: &Connection,
    computation_id: &str,
    summary: &SummaryRow,
    message: &str,
    duration_ms: i64,
) -> Result<(), ComputeError> {
    conn.execute(
        "UPDATE computation_summaries SET status = 'failed', error = ?, duration_ms = ? WHERE id = ?",
        (message, duration_ms, &summary.id),
    )?;
    conn.execute(
        "UPDATE master_computations SET
            departments_processed = departments_processed + 1,
            failed_departments = failed_departments + 1
         WHERE id = ? AND status = 'processing'",
        [computation_id],
    )?;
    Ok(())
}

fn overall_average_gpa(conn: &Connection, computation_id: &str) -> Result<Option<f64>, ComputeError> {
    let (gpa_sum, students): (Option<f64>, Option<i64>) = conn.query_row(
        "SELECT SUM(gpa_sum), SUM(students_with_results)
         FROM computation_summaries
         WHERE computation_id = ? AND status = 'completed'",
        [computation_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    Ok(match (gpa_sum, students) {
        (Some(sum), Some(n)) if n > 0 => Some(round_2_decimals(sum / n as f64)),
        _ => None,
    })
}

fn elapsed_ms_since(started_at: &str) -> Option<i64> {
    let started = chrono::DateTime::parse_from_rfc3339(started_at).ok()?;
    Some((chrono::Utc::now() - started.with_timezone(&chrono::Utc)).num_milliseconds())
}

fn finalize_batch(
    conn: &Connection,
    computation_id: &str,
    status: ComputationStatus,
) -> Result<(), ComputeError> {
    let started_at: String = conn.query_row(
        "SELECT started_at FROM master_computations WHERE id = ?",
        [computation_id],
        |r| r.get(0),
    )?;
    let overall = overall_average_gpa(conn, computation_id)?;
    conn.execute(
        "UPDATE master_computations SET
            status = ?, overall_average_gpa = ?, completed_at = ?, duration_ms = ?
         WHERE id = ? AND status = 'processing'",
        (
            status.as_str(),
            overall,
            now_rfc3339(),
            elapsed_ms_since(&started_at),
            computation_id,
        ),
    )?;
    Ok(())
}

/// Operator cancel. Only a `processing` batch can be cancelled; departments
/// that never ran are marked `skipped`.
pub fn cancel_batch(conn: &Connection, computation_id: &str) -> Result<MasterComputation, ComputeError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let mut progress = batch_progress(&tx, computation_id)?;
    progress.cancel()?;
    finalize_batch(&tx, computation_id, progress.status())?;
    tx.execute(
        "UPDATE computation_summaries SET status = 'skipped'
         WHERE computation_id = ? AND status = 'pending'",
        [computation_id],
    )?;
    tx.commit()?;
    info!(
        computation_id,
        departments_processed = progress.departments_processed(),
        "computation batch cancelled"
    );
    load_computation(conn, computation_id, true)
}

/// Closes a batch the runner could not finish. Departments that never ran
/// are recorded as failed with `reason`, which leaves the batch retryable.
pub fn abort_batch(
    conn: &Connection,
    computation_id: &str,
    reason: &str,
) -> Result<ComputationStatus, ComputeError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let mut progress = batch_progress(&tx, computation_id)?;
    if progress.status() != ComputationStatus::Processing {
        return Ok(progress.status());
    }
    for summary in pending_summaries(&tx, computation_id)? {
        progress.record_department(false)?;
        record_department_failure(&tx, computation_id, &summary, reason, 0)?;
    }
    let status = if progress.status().is_terminal() {
        progress.status()
    } else {
        derive_terminal_status(progress.total_departments(), progress.failures())
    };
    finalize_batch(&tx, computation_id, status)?;
    tx.commit()?;
    warn!(
        computation_id,
        status = status.as_str(),
        failures = progress.failures(),
        reason,
        "computation batch aborted"
    );
    Ok(status)
}

/// Batches left `processing` by a process that exited mid-run can never
/// finish; close them so a new batch may start.
pub fn recover_interrupted_batches(conn: &Connection) -> Result<usize, ComputeError> {
    let mut stmt = conn.prepare("SELECT id FROM master_computations WHERE status = 'processing'")?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for id in &ids {
        abort_batch(conn, id, "interrupted before this department ran")?;
    }
    Ok(ids.len())
}

/// Creates a new batch over the departments that failed in `computation_id`.
/// The original batch is left untouched.
pub fn retry_batch(
    conn: &Connection,
    computation_id: &str,
    computed_by: Option<&str>,
) -> Result<String, ComputeError> {
    let original = load_computation(conn, computation_id, false)?;
    if !original.status.is_retryable() {
        return Err(ComputeError::NotRetryable(original.status));
    }
    let mut stmt = conn.prepare(
        "SELECT department_id FROM computation_summaries
         WHERE computation_id = ? AND status = 'failed'
         ORDER BY sort_order",
    )?;
    let failed = stmt
        .query_map([computation_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    create_batch(
        conn,
        original.mode,
        computed_by.unwrap_or(&original.computed_by),
        Some(&failed),
        Some(computation_id),
    )
}

/// Runs a batch on its own thread and connection. Clients poll for status.
pub fn spawn_batch_worker(workspace: PathBuf, computation_id: String) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let conn = match db::open_db(&workspace) {
            Ok(c) => c,
            Err(e) => {
                error!(computation_id = %computation_id, error = %e, "worker could not open workspace");
                return;
            }
        };
        if let Err(e) = run_batch(&conn, &computation_id) {
            error!(computation_id = %computation_id, error = %e, "computation batch stopped on error");
            let reason = format!("computation stopped: {e}");
            if let Err(e) = abort_batch(&conn, &computation_id, &reason) {
                warn!(computation_id = %computation_id, error = %e, "could not close aborted batch");
            }
        }
    })
}

fn load_semester(conn: &Connection, semester_id: &str) -> anyhow::Result<Option<SemesterInfo>> {
    Ok(conn
        .query_row(
            "SELECT sequence, locked FROM semesters WHERE id = ?",
            [semester_id],
            |r| {
                Ok(SemesterInfo {
                    sequence: r.get(0)?,
                    locked: r.get::<_, i64>(1)? != 0,
                })
            },
        )
        .optional()?)
}

fn compute_department(
    conn: &Connection,
    scale: &GradeScale,
    mode: ComputationMode,
    summary: &SummaryRow,
) -> Result<DepartmentReport, String> {
    let semester = load_semester(conn, &summary.semester_id)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "semester not found".to_string())?;
    // Cumulative totals only ever extend forward in sequence order.
    let later_published: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM semesters
             WHERE department_id = ? AND sequence > ? AND locked = 1",
            (&summary.department_id, semester.sequence),
            |r| r.get(0),
        )
        .map_err(|e| e.to_string())?;
    if later_published > 0 {
        return Err("a later semester of this department is already published".into());
    }
    if mode.commits_records() {
        if semester.locked {
            return Err("semester is locked".into());
        }
        let pending: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM course_results WHERE semester_id = ? AND status = 'pending'",
                [&summary.semester_id],
                |r| r.get(0),
            )
            .map_err(|e| e.to_string())?;
        if pending > 0 {
            return Err(format!("{pending} results are still pending approval"));
        }
    }
    build_department_report(conn, scale, mode, summary, &semester).map_err(|e| e.to_string())
}

struct StudentRow {
    id: String,
    matric_no: String,
    name: String,
}

fn build_department_report(
    conn: &Connection,
    scale: &GradeScale,
    mode: ComputationMode,
    summary: &SummaryRow,
    semester: &SemesterInfo,
) -> anyhow::Result<DepartmentReport> {
    let mut stmt = conn.prepare(
        "SELECT id, matric_no, last_name, first_name
         FROM students WHERE department_id = ?
         ORDER BY matric_no",
    )?;
    let students = stmt
        .query_map([&summary.department_id], |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(StudentRow {
                id: r.get(0)?,
                matric_no: r.get(1)?,
                name: format!("{}, {}", last, first),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT cr.student_id, c.id, c.code, c.title, c.unit, cr.score, c.is_core
         FROM course_results cr
         JOIN courses c ON c.id = cr.course_id
         WHERE cr.semester_id = ? AND cr.status = 'approved'
         ORDER BY c.code",
    )?;
    let mut by_student: HashMap<String, Vec<CourseInput>> = HashMap::new();
    let mut approved = 0usize;
    let rows = stmt.query_map([&summary.semester_id], |r| {
        let unit: i64 = r.get(4)?;
        Ok((
            r.get::<_, String>(0)?,
            CourseInput {
                course_id: r.get(1)?,
                code: r.get(2)?,
                title: r.get(3)?,
                unit: u32::try_from(unit).unwrap_or(0),
                score: r.get(5)?,
                is_core: r.get::<_, i64>(6)? != 0,
            },
        ))
    })?;
    for row in rows {
        let (student_id, input) = row?;
        approved += 1;
        by_student.entry(student_id).or_default().push(input);
    }
    if approved == 0 {
        anyhow::bail!("no approved results for this semester");
    }

    let mut report = DepartmentReport {
        rows: Vec::with_capacity(students.len()),
        total_students: u32::try_from(students.len()).unwrap_or(u32::MAX),
        students_with_results: 0,
        gpa_sum: 0.0,
        highest_gpa: None,
        carryover_stats: CarryoverStats::default(),
        failed_students: Vec::new(),
    };
    let mut by_course: BTreeMap<String, u32> = BTreeMap::new();

    for student in students {
        let inputs = by_student.remove(&student.id).unwrap_or_default();
        let courses = inputs
            .iter()
            .map(|c| scale.grade_course(c))
            .collect::<Result<Vec<_>, GradingError>>()
            .map_err(|e| anyhow::anyhow!("{}: {e}", student.matric_no))?;

        let aggregate = match aggregate_semester(&courses) {
            Ok(a) => a,
            Err(GradingError::NoResults) => {
                report.failed_students.push(FailedStudent {
                    student_id: student.id.clone(),
                    matric_no: student.matric_no.clone(),
                    reason: "no_results".into(),
                });
                report.rows.push(MastersheetRow {
                    student_id: student.id,
                    matric_no: student.matric_no,
                    name: student.name,
                    status: SemesterResultStatus::Failed,
                    courses,
                    total_units: 0,
                    total_points: 0,
                    gpa: None,
                    cgpa: None,
                    cumulative_units: 0,
                    cumulative_points: 0,
                    carryover_count: 0,
                    remark: None,
                    classification: None,
                });
                continue;
            }
            Err(e) => return Err(anyhow::anyhow!("{}: {e}", student.matric_no)),
        };

        let (prior, previous_standing) = prior_history(conn, &student.id, semester.sequence)?;
        let cumulative = prior.with(&aggregate);
        let cgpa = cumulative.cgpa().unwrap_or(aggregate.gpa);
        let remark = Standing::derive(cgpa, aggregate.carryover_count, previous_standing);

        report.students_with_results += 1;
        report.gpa_sum += aggregate.gpa;
        let gpa = round_2_decimals(aggregate.gpa);
        report.highest_gpa = Some(report.highest_gpa.map_or(gpa, |h: f64| h.max(gpa)));
        if aggregate.carryover_count > 0 {
            report.carryover_stats.students_with_carryovers += 1;
        }
        for c in courses.iter().filter(|c| c.is_carryover) {
            report.carryover_stats.total_carryovers += 1;
            *by_course.entry(c.code.clone()).or_insert(0) += 1;
        }

        report.rows.push(MastersheetRow {
            student_id: student.id,
            matric_no: student.matric_no,
            name: student.name,
            status: if mode.commits_records() {
                SemesterResultStatus::Processed
            } else {
                SemesterResultStatus::Pending
            },
            courses,
            total_units: aggregate.total_units,
            total_points: aggregate.total_points,
            gpa: Some(gpa),
            cgpa: Some(round_2_decimals(cgpa)),
            cumulative_units: cumulative.units,
            cumulative_points: cumulative.points,
            carryover_count: aggregate.carryover_count,
            remark: Some(remark),
            classification: Some(Classification::from_cgpa(cgpa)),
        });
    }

    if !by_student.is_empty() {
        warn!(
            department = %summary.department_code,
            orphaned = by_student.len(),
            "results found for students outside the department"
        );
    }
    report.carryover_stats.by_course = by_course;
    Ok(report)
}

/// Committed totals and the latest standing from semesters before `sequence`.
fn prior_history(
    conn: &Connection,
    student_id: &str,
    sequence: i64,
) -> anyhow::Result<(CumulativeTotals, Option<Standing>)> {
    let (units, points): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(sr.total_units), 0), COALESCE(SUM(sr.total_points), 0)
         FROM semester_results sr
         JOIN semesters s ON s.id = sr.semester_id
         WHERE sr.student_id = ? AND sr.status = 'processed' AND s.sequence < ?",
        (student_id, sequence),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let previous: Option<String> = conn
        .query_row(
            "SELECT sr.remark
             FROM semester_results sr
             JOIN semesters s ON s.id = sr.semester_id
             WHERE sr.student_id = ? AND sr.status = 'processed' AND s.sequence < ?
             ORDER BY s.sequence DESC
             LIMIT 1",
            (student_id, sequence),
            |r| r.get(0),
        )
        .optional()?;
    Ok((
        CumulativeTotals {
            units: u32::try_from(units)?,
            points: u32::try_from(points)?,
        },
        previous.as_deref().and_then(Standing::parse),
    ))
}

/// Final-mode side effects for one department: semester results, student
/// records, outstanding carryovers, notifications and the semester lock.
fn commit_department_records(
    conn: &Connection,
    computation_id: &str,
    summary: &SummaryRow,
    report: &DepartmentReport,
    notify: bool,
) -> anyhow::Result<()> {
    let now = now_rfc3339();
    for row in report
        .rows
        .iter()
        .filter(|r| r.status == SemesterResultStatus::Processed)
    {
        let remark = row.remark.map(Standing::as_str).unwrap_or("good");
        conn.execute(
            "INSERT INTO semester_results(
                id, student_id, semester_id, computation_id, courses_json, total_units,
                total_points, gpa, cgpa, carryover_count, remark, status, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'processed', ?)
             ON CONFLICT(student_id, semester_id) DO UPDATE SET
                computation_id = excluded.computation_id,
                courses_json = excluded.courses_json,
                total_units = excluded.total_units,
                total_points = excluded.total_points,
                gpa = excluded.gpa,
                cgpa = excluded.cgpa,
                carryover_count = excluded.carryover_count,
                remark = excluded.remark,
                status = 'processed',
                created_at = excluded.created_at",
            (
                Uuid::new_v4().to_string(),
                &row.student_id,
                &summary.semester_id,
                computation_id,
                serde_json::to_string(&row.courses)?,
                row.total_units,
                row.total_points,
                row.gpa,
                row.cgpa,
                row.carryover_count as i64,
                remark,
                &now,
            ),
        )?;
        conn.execute(
            "UPDATE course_results SET processed = 1
             WHERE semester_id = ? AND student_id = ? AND status = 'approved'",
            (&summary.semester_id, &row.student_id),
        )?;

        for course in &row.courses {
            if course.is_carryover {
                conn.execute(
                    "INSERT INTO carryover_courses(student_id, course_id, semester_id)
                     VALUES(?, ?, ?)
                     ON CONFLICT(student_id, course_id) DO UPDATE SET semester_id = excluded.semester_id",
                    (&row.student_id, &course.course_id, &summary.semester_id),
                )?;
            } else {
                conn.execute(
                    "DELETE FROM carryover_courses WHERE student_id = ? AND course_id = ?",
                    (&row.student_id, &course.course_id),
                )?;
            }
        }
        let outstanding: i64 = conn.query_row(
            "SELECT COUNT(*) FROM carryover_courses WHERE student_id = ?",
            [&row.student_id],
            |r| r.get(0),
        )?;

        conn.execute(
            "UPDATE students SET
                cgpa = ?, total_units = ?, total_points = ?, standing = ?,
                outstanding_carryovers = ?, updated_at = ?
             WHERE id = ?",
            (
                row.cgpa,
                row.cumulative_units,
                row.cumulative_points,
                remark,
                outstanding,
                &now,
                &row.student_id,
            ),
        )?;

        if notify {
            conn.execute(
                "INSERT INTO notifications(id, student_id, computation_id, kind, message, created_at)
                 VALUES(?, ?, ?, 'result_published', ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &row.student_id,
                    computation_id,
                    format!(
                        "Your semester result is available: GPA {:.2}, CGPA {:.2}.",
                        row.gpa.unwrap_or(0.0),
                        row.cgpa.unwrap_or(0.0)
                    ),
                    &now,
                ),
            )?;
        }
    }

    conn.execute(
        "UPDATE semesters SET locked = 1, locked_at = ? WHERE id = ?",
        (&now, &summary.semester_id),
    )?;
    Ok(())
}

pub fn load_computation(
    conn: &Connection,
    computation_id: &str,
    with_summaries: bool,
) -> Result<MasterComputation, ComputeError> {
    let row = conn
        .query_row(
            &format!("{MASTER_SELECT} WHERE id = ?"),
            [computation_id],
            master_from_row,
        )
        .optional()?;
    let Some(mut master) = row else {
        return Err(ComputeError::NotFound("computation not found".into()));
    };
    if with_summaries {
        master.summaries = load_summaries(conn, computation_id)?;
    }
    Ok(master)
}

const MASTER_SELECT: &str = "SELECT id, mode, status, total_departments, departments_processed,
        overall_average_gpa, total_carryovers, total_failed_students, started_at,
        completed_at, duration_ms, computed_by, retry_of
     FROM master_computations";

fn master_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<MasterComputation> {
    let mode: String = r.get(1)?;
    let status: String = r.get(2)?;
    Ok(MasterComputation {
        id: r.get(0)?,
        mode: ComputationMode::parse(&mode).unwrap_or(ComputationMode::Preview),
        status: ComputationStatus::parse(&status).unwrap_or(ComputationStatus::Failed),
        total_departments: r.get(3)?,
        departments_processed: r.get(4)?,
        overall_average_gpa: r.get(5)?,
        total_carryovers: r.get(6)?,
        total_failed_students: r.get(7)?,
        started_at: r.get(8)?,
        completed_at: r.get(9)?,
        duration_ms: r.get(10)?,
        computed_by: r.get(11)?,
        retry_of: r.get(12)?,
        summaries: Vec::new(),
    })
}

fn load_summaries(conn: &Connection, computation_id: &str) -> Result<Vec<ComputationSummary>, ComputeError> {
    let mut stmt = conn.prepare(
        "SELECT cs.id, cs.department_id, d.code, d.name, cs.semester_id, cs.status,
                cs.students_with_results, cs.total_students, cs.average_gpa, cs.highest_gpa,
                cs.carryover_stats_json, cs.failed_students_json, cs.error, cs.duration_ms
         FROM computation_summaries cs
         JOIN departments d ON d.id = cs.department_id
         WHERE cs.computation_id = ?
         ORDER BY cs.sort_order",
    )?;
    let rows = stmt
        .query_map([computation_id], |r| {
            let status: String = r.get(5)?;
            let carryover_json: Option<String> = r.get(10)?;
            let failed_json: Option<String> = r.get(11)?;
            Ok(ComputationSummary {
                id: r.get(0)?,
                department_id: r.get(1)?,
                department_code: r.get(2)?,
                department_name: r.get(3)?,
                semester_id: r.get(4)?,
                status: DepartmentStatus::parse(&status).unwrap_or(DepartmentStatus::Pending),
                students_with_results: r.get(6)?,
                total_students: r.get(7)?,
                average_gpa: r.get(8)?,
                highest_gpa: r.get(9)?,
                carryover_stats: carryover_json
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or_default(),
                failed_students: failed_json
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or_default(),
                error: r.get(12)?,
                duration_ms: r.get(13)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct ListFilter {
    pub status: Option<ComputationStatus>,
    pub mode: Option<ComputationMode>,
    pub from: Option<chrono::NaiveDate>,
    pub to: Option<chrono::NaiveDate>,
    pub search: Option<String>,
    pub page: u32,
    pub page_size: u32,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            status: None,
            mode: None,
            from: None,
            to: None,
            search: None,
            page: 1,
            page_size: 20,
        }
    }
}

/// Newest first. Returns the requested page and the unpaged total.
pub fn list_computations(
    conn: &Connection,
    filter: &ListFilter,
) -> Result<(Vec<MasterComputation>, u32), ComputeError> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut bind: Vec<Value> = Vec::new();
    if let Some(status) = filter.status {
        clauses.push("status = ?");
        bind.push(Value::Text(status.as_str().to_string()));
    }
    if let Some(mode) = filter.mode {
        clauses.push("mode = ?");
        bind.push(Value::Text(mode.as_str().to_string()));
    }
    if let Some(from) = filter.from {
        clauses.push("substr(started_at, 1, 10) >= ?");
        bind.push(Value::Text(from.format("%Y-%m-%d").to_string()));
    }
    if let Some(to) = filter.to {
        clauses.push("substr(started_at, 1, 10) <= ?");
        bind.push(Value::Text(to.format("%Y-%m-%d").to_string()));
    }
    if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        clauses.push("(id LIKE ? OR computed_by LIKE ?)");
        let pattern = format!("%{}%", search);
        bind.push(Value::Text(pattern.clone()));
        bind.push(Value::Text(pattern));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM master_computations{where_sql}"),
        params_from_iter(bind.iter()),
        |r| r.get(0),
    )?;

    let page_size = filter.page_size.clamp(1, 100);
    let offset = i64::from(filter.page.max(1) - 1) * i64::from(page_size);
    let mut page_bind = bind.clone();
    page_bind.push(Value::Integer(i64::from(page_size)));
    page_bind.push(Value::Integer(offset));
    let mut stmt = conn.prepare(&format!(
        "{MASTER_SELECT}{where_sql} ORDER BY started_at DESC, rowid DESC LIMIT ? OFFSET ?"
    ))?;
    let items = stmt
        .query_map(params_from_iter(page_bind.iter()), master_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok((items, u32::try_from(total).unwrap_or(u32::MAX)))
}

pub fn load_mastersheet(
    conn: &Connection,
    computation_id: &str,
    department_id: &str,
) -> Result<Vec<MastersheetRow>, ComputeError> {
    let row: Option<Option<String>> = conn
        .query_row(
            "SELECT mastersheet_json FROM computation_summaries
             WHERE computation_id = ? AND department_id = ?",
            (computation_id, department_id),
            |r| r.get(0),
        )
        .optional()?;
    match row {
        None => Err(ComputeError::NotFound(
            "department is not part of this computation".into(),
        )),
        Some(None) => Ok(Vec::new()),
        Some(Some(text)) => Ok(serde_json::from_str(&text)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_workspace(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    fn department(conn: &Connection, code: &str) -> (String, String) {
        let dept_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO departments(id, code, name) VALUES(?, ?, ?)",
            (&dept_id, code, format!("{code} department")),
        )
        .expect("department");
        let semester_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO semesters(id, department_id, session, name, sequence, active)
             VALUES(?, ?, '2025/2026', 'first', 1, 1)",
            (&semester_id, &dept_id),
        )
        .expect("semester");
        (dept_id, semester_id)
    }

    fn student(conn: &Connection, dept_id: &str, matric: &str) -> String {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO students(id, department_id, matric_no, last_name, first_name, level)
             VALUES(?, ?, ?, 'Okafor', 'Ada', 100)",
            (&id, dept_id, matric),
        )
        .expect("student");
        id
    }

    fn course(conn: &Connection, dept_id: &str, code: &str, unit: i64) -> String {
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO courses(id, department_id, code, title, unit, is_core) VALUES(?, ?, ?, ?, ?, 1)",
            (&id, dept_id, code, format!("{code} title"), unit),
        )
        .expect("course");
        id
    }

    fn approved_result(conn: &Connection, student_id: &str, course_id: &str, semester_id: &str, score: f64) {
        conn.execute(
            "INSERT INTO course_results(id, student_id, course_id, semester_id, score, grade,
                grade_point, is_carryover, status)
             VALUES(?, ?, ?, ?, ?, '?', 0, 0, 'approved')",
            (Uuid::new_v4().to_string(), student_id, course_id, semester_id, score),
        )
        .expect("result");
    }

    #[test]
    fn cancelled_batch_never_processes_departments() {
        let ws = temp_workspace("resultsd-engine-cancel");
        let conn = db::open_db(&ws).expect("open");
        let (dept, sem) = department(&conn, "CSC");
        let s = student(&conn, &dept, "CSC/001");
        let c = course(&conn, &dept, "CSC101", 3);
        approved_result(&conn, &s, &c, &sem, 71.0);

        let id = create_batch(&conn, ComputationMode::Final, "admin", None, None).expect("create");
        let cancelled = cancel_batch(&conn, &id).expect("cancel");
        assert_eq!(cancelled.status, ComputationStatus::Cancelled);
        assert_eq!(cancelled.summaries[0].status, DepartmentStatus::Skipped);

        let after = run_batch(&conn, &id).expect("run");
        assert_eq!(after.status, ComputationStatus::Cancelled);
        assert_eq!(after.departments_processed, 0);
        let locked: i64 = conn
            .query_row("SELECT locked FROM semesters WHERE id = ?", [&sem], |r| r.get(0))
            .expect("locked");
        assert_eq!(locked, 0);

        let err = cancel_batch(&conn, &id).expect_err("second cancel");
        assert_eq!(err.code(), "invalid_transition");
    }

    #[test]
    fn partial_failure_then_retry_scopes_to_failed_departments() {
        let ws = temp_workspace("resultsd-engine-retry");
        let conn = db::open_db(&ws).expect("open");
        let (good_dept, good_sem) = department(&conn, "AAA");
        let (empty_dept, empty_sem) = department(&conn, "BBB");
        let s1 = student(&conn, &good_dept, "AAA/001");
        let c1 = course(&conn, &good_dept, "AAA101", 3);
        approved_result(&conn, &s1, &c1, &good_sem, 55.0);
        let s2 = student(&conn, &empty_dept, "BBB/001");
        let c2 = course(&conn, &empty_dept, "BBB101", 2);

        let id = create_batch(&conn, ComputationMode::Preview, "admin", None, None).expect("create");
        let first = run_batch(&conn, &id).expect("run");
        assert_eq!(first.status, ComputationStatus::CompletedWithErrors);
        assert_eq!(first.departments_processed, 2);
        assert_eq!(first.overall_average_gpa, Some(3.0));

        approved_result(&conn, &s2, &c2, &empty_sem, 35.0);
        let retry_id = retry_batch(&conn, &id, None).expect("retry");
        let retried = run_batch(&conn, &retry_id).expect("run retry");
        assert_eq!(retried.retry_of.as_deref(), Some(id.as_str()));
        assert_eq!(retried.total_departments, 1);
        assert_eq!(retried.summaries[0].department_id, empty_dept);
        assert_eq!(retried.status, ComputationStatus::Completed);
        assert_eq!(retried.total_carryovers, 1);

        let original = load_computation(&conn, &id, false).expect("reload");
        assert_eq!(original.status, ComputationStatus::CompletedWithErrors);

        let err = retry_batch(&conn, &retry_id, None).expect_err("completed is not retryable");
        assert_eq!(err.code(), "invalid_transition");
    }

    #[test]
    fn only_one_batch_may_process_at_a_time() {
        let ws = temp_workspace("resultsd-engine-single");
        let conn = db::open_db(&ws).expect("open");
        let _ = department(&conn, "CSC");
        let id = create_batch(&conn, ComputationMode::Preview, "admin", None, None).expect("create");
        let err = create_batch(&conn, ComputationMode::Preview, "admin", None, None)
            .expect_err("second batch");
        assert_eq!(err.code(), "computation_in_progress");

        assert_eq!(recover_interrupted_batches(&conn).expect("recover"), 1);
        let recovered = load_computation(&conn, &id, true).expect("load");
        assert_eq!(recovered.status, ComputationStatus::Failed);
        assert_eq!(recovered.summaries[0].status, DepartmentStatus::Failed);
        assert!(retry_batch(&conn, &id, None).is_ok());
    }

    #[test]
    fn aborted_batch_fails_unrun_departments_and_stays_retryable() {
        let ws = temp_workspace("resultsd-engine-abort");
        let conn = db::open_db(&ws).expect("open");
        let _ = department(&conn, "AAA");
        let _ = department(&conn, "BBB");
        let id = create_batch(&conn, ComputationMode::Preview, "admin", None, None).expect("create");

        let status = abort_batch(&conn, &id, "computation stopped: disk I/O error").expect("abort");
        assert_eq!(status, ComputationStatus::Failed);
        let aborted = load_computation(&conn, &id, true).expect("load");
        assert_eq!(aborted.status, ComputationStatus::Failed);
        assert_eq!(aborted.departments_processed, 2);
        assert!(aborted.completed_at.is_some());
        for summary in &aborted.summaries {
            assert_eq!(summary.status, DepartmentStatus::Failed);
            assert_eq!(summary.error.as_deref(), Some("computation stopped: disk I/O error"));
        }

        // Closing an already closed batch changes nothing.
        assert_eq!(
            abort_batch(&conn, &id, "again").expect("second abort"),
            ComputationStatus::Failed
        );
        let retry_id = retry_batch(&conn, &id, None).expect("retry");
        let retry = load_computation(&conn, &retry_id, false).expect("load retry");
        assert_eq!(retry.total_departments, 2);
    }

    #[test]
    fn earlier_semester_cannot_publish_after_a_later_one() {
        let ws = temp_workspace("resultsd-engine-sequence");
        let conn = db::open_db(&ws).expect("open");
        let (dept, first) = department(&conn, "MTH");
        let second = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO semesters(id, department_id, session, name, sequence, active)
             VALUES(?, ?, '2025/2026', 'second', 2, 1)",
            (&second, &dept),
        )
        .expect("second semester");
        conn.execute("UPDATE semesters SET active = 0 WHERE id = ?", [&first])
            .expect("park first semester");
        let s = student(&conn, &dept, "MTH/001");
        let c = course(&conn, &dept, "MTH101", 3);
        approved_result(&conn, &s, &c, &second, 75.0);

        let id = create_batch(&conn, ComputationMode::Final, "admin", None, None).expect("create");
        assert_eq!(run_batch(&conn, &id).expect("run").status, ComputationStatus::Completed);

        conn.execute("UPDATE semesters SET active = 1 WHERE id = ?", [&first])
            .expect("reopen first semester");
        approved_result(&conn, &s, &c, &first, 20.0);
        let id = create_batch(&conn, ComputationMode::Final, "admin", None, None).expect("create");
        let late = run_batch(&conn, &id).expect("run");
        assert_eq!(late.status, ComputationStatus::Failed);
        let error = late.summaries[0].error.clone().unwrap_or_default();
        assert!(error.contains("later semester"), "unexpected error: {error}");

        let (units, cgpa): (i64, f64) = conn
            .query_row(
                "SELECT total_units, cgpa FROM students WHERE id = ?",
                [&s],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .expect("student");
        assert_eq!(units, 3);
        assert_eq!(cgpa, 5.0);
        let locked: i64 = conn
            .query_row("SELECT locked FROM semesters WHERE id = ?", [&first], |r| r.get(0))
            .expect("locked");
        assert_eq!(locked, 0);
    }

    #[test]
    fn approval_waiting_on_the_write_lock_is_part_of_the_department() {
        let ws = temp_workspace("resultsd-engine-lock");
        let conn = db::open_db(&ws).expect("open");
        let (dept, sem) = department(&conn, "CSC");
        let s = student(&conn, &dept, "CSC/001");
        let c1 = course(&conn, &dept, "CSC101", 3);
        let c2 = course(&conn, &dept, "CSC102", 2);
        approved_result(&conn, &s, &c1, &sem, 75.0);
        conn.execute(
            "INSERT INTO course_results(id, student_id, course_id, semester_id, score, grade,
                grade_point, is_carryover, status)
             VALUES(?, ?, ?, ?, 65, '?', 0, 0, 'rejected')",
            (Uuid::new_v4().to_string(), &s, &c2, &sem),
        )
        .expect("rejected result");
        let id = create_batch(&conn, ComputationMode::Final, "admin", None, None).expect("create");

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let approver = {
            let ws = ws.clone();
            let sem = sem.clone();
            std::thread::spawn(move || {
                let other = db::open_db(&ws).expect("open second connection");
                other.execute_batch("BEGIN IMMEDIATE").expect("begin");
                other
                    .execute(
                        "UPDATE course_results SET status = 'approved'
                         WHERE semester_id = ? AND status = 'rejected'",
                        [&sem],
                    )
                    .expect("approve");
                ready_tx.send(()).expect("signal");
                std::thread::sleep(std::time::Duration::from_millis(300));
                other.execute_batch("COMMIT").expect("commit");
            })
        };
        ready_rx.recv().expect("approver holds the write lock");
        let done = run_batch(&conn, &id).expect("run");
        approver.join().expect("approver thread");

        assert_eq!(done.status, ComputationStatus::Completed);
        let units: i64 = conn
            .query_row(
                "SELECT total_units FROM semester_results WHERE student_id = ? AND semester_id = ?",
                (&s, &sem),
                |r| r.get(0),
            )
            .expect("semester result");
        assert_eq!(units, 5);
        let unprocessed: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM course_results WHERE semester_id = ? AND processed = 0",
                [&sem],
                |r| r.get(0),
            )
            .expect("count");
        assert_eq!(unprocessed, 0);
    }

    #[test]
    fn empty_scope_is_rejected() {
        let ws = temp_workspace("resultsd-engine-empty");
        let conn = db::open_db(&ws).expect("open");
        let err = create_batch(&conn, ComputationMode::Final, "admin", None, None)
            .expect_err("no departments");
        assert_eq!(err.code(), "nothing_to_compute");
    }
}
