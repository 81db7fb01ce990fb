use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputationStatus {
    Processing,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl ComputationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ComputationStatus::Processing => "processing",
            ComputationStatus::Completed => "completed",
            ComputationStatus::CompletedWithErrors => "completed_with_errors",
            ComputationStatus::Failed => "failed",
            ComputationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(ComputationStatus::Processing),
            "completed" => Some(ComputationStatus::Completed),
            "completed_with_errors" => Some(ComputationStatus::CompletedWithErrors),
            "failed" => Some(ComputationStatus::Failed),
            "cancelled" => Some(ComputationStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ComputationStatus::Processing)
    }

    /// Only batches that left some department unfinished can be retried.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ComputationStatus::Failed | ComputationStatus::CompletedWithErrors
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputationMode {
    Preview,
    Final,
}

impl ComputationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ComputationMode::Preview => "preview",
            ComputationMode::Final => "final",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "preview" => Some(ComputationMode::Preview),
            "final" => Some(ComputationMode::Final),
            _ => None,
        }
    }

    /// Whether a successful department may touch student records,
    /// notifications and semester locks.
    pub fn commits_records(self) -> bool {
        matches!(self, ComputationMode::Final)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepartmentStatus {
    Pending,
    Completed,
    Failed,
    Skipped,
}

impl DepartmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DepartmentStatus::Pending => "pending",
            DepartmentStatus::Completed => "completed",
            DepartmentStatus::Failed => "failed",
            DepartmentStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DepartmentStatus::Pending),
            "completed" => Some(DepartmentStatus::Completed),
            "failed" => Some(DepartmentStatus::Failed),
            "skipped" => Some(DepartmentStatus::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("batch is already {}", .0.as_str())]
    AlreadyTerminal(ComputationStatus),
    #[error("all {0} departments have already reported")]
    AllDepartmentsReported(u32),
    #[error("a batch needs at least one department")]
    EmptyBatch,
}

/// failures = 0 → completed, failures = total → failed, anything between →
/// completed_with_errors.
pub fn derive_terminal_status(total_departments: u32, failures: u32) -> ComputationStatus {
    if failures == 0 {
        ComputationStatus::Completed
    } else if failures >= total_departments {
        ComputationStatus::Failed
    } else {
        ComputationStatus::CompletedWithErrors
    }
}

/// Counter side of a batch. Every transition goes through here so the
/// persisted row can only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    status: ComputationStatus,
    total_departments: u32,
    departments_processed: u32,
    failures: u32,
}

impl BatchProgress {
    pub fn start(total_departments: u32) -> Result<Self, TransitionError> {
        if total_departments == 0 {
            return Err(TransitionError::EmptyBatch);
        }
        Ok(Self {
            status: ComputationStatus::Processing,
            total_departments,
            departments_processed: 0,
            failures: 0,
        })
    }

    pub fn restore(
        status: ComputationStatus,
        total_departments: u32,
        departments_processed: u32,
        failures: u32,
    ) -> Self {
        let processed = departments_processed.min(total_departments);
        Self {
            status,
            total_departments,
            departments_processed: processed,
            failures: failures.min(processed),
        }
    }

    pub fn status(&self) -> ComputationStatus {
        self.status
    }

    pub fn total_departments(&self) -> u32 {
        self.total_departments
    }

    pub fn departments_processed(&self) -> u32 {
        self.departments_processed
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Records one department outcome and returns the resulting status.
    pub fn record_department(&mut self, succeeded: bool) -> Result<ComputationStatus, TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(self.status));
        }
        if self.departments_processed >= self.total_departments {
            return Err(TransitionError::AllDepartmentsReported(self.total_departments));
        }
        self.departments_processed += 1;
        if !succeeded {
            self.failures += 1;
        }
        if self.departments_processed == self.total_departments {
            self.status = derive_terminal_status(self.total_departments, self.failures);
        }
        Ok(self.status)
    }

    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(self.status));
        }
        self.status = ComputationStatus::Cancelled;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarryoverStats {
    pub total_carryovers: u32,
    pub students_with_carryovers: u32,
    pub by_course: std::collections::BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedStudent {
    pub student_id: String,
    pub matric_no: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputationSummary {
    pub id: String,
    pub department_id: String,
    pub department_code: String,
    pub department_name: String,
    pub semester_id: String,
    pub status: DepartmentStatus,
    pub students_with_results: u32,
    pub total_students: u32,
    #[serde(rename = "averageGPA")]
    pub average_gpa: Option<f64>,
    #[serde(rename = "highestGPA")]
    pub highest_gpa: Option<f64>,
    pub carryover_stats: CarryoverStats,
    pub failed_students: Vec<FailedStudent>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterComputation {
    pub id: String,
    pub mode: ComputationMode,
    pub status: ComputationStatus,
    pub total_departments: u32,
    pub departments_processed: u32,
    #[serde(rename = "overallAverageGPA")]
    pub overall_average_gpa: Option<f64>,
    pub total_carryovers: u32,
    pub total_failed_students: u32,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub computed_by: String,
    pub retry_of: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub summaries: Vec<ComputationSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_matches_failure_counts() {
        assert_eq!(derive_terminal_status(5, 0), ComputationStatus::Completed);
        assert_eq!(derive_terminal_status(5, 2), ComputationStatus::CompletedWithErrors);
        assert_eq!(derive_terminal_status(5, 5), ComputationStatus::Failed);
        assert_eq!(derive_terminal_status(1, 1), ComputationStatus::Failed);
    }

    #[test]
    fn batch_stays_processing_until_every_department_reports() {
        let mut p = BatchProgress::start(3).expect("start");
        assert_eq!(p.record_department(true), Ok(ComputationStatus::Processing));
        assert_eq!(p.record_department(false), Ok(ComputationStatus::Processing));
        assert_eq!(p.record_department(true), Ok(ComputationStatus::CompletedWithErrors));
        assert_eq!(p.departments_processed(), 3);
        assert_eq!(p.failures(), 1);
    }

    #[test]
    fn terminal_status_is_monotonic() {
        let mut p = BatchProgress::start(1).expect("start");
        assert_eq!(p.record_department(false), Ok(ComputationStatus::Failed));
        assert_eq!(
            p.record_department(true),
            Err(TransitionError::AlreadyTerminal(ComputationStatus::Failed))
        );
        assert_eq!(
            p.cancel(),
            Err(TransitionError::AlreadyTerminal(ComputationStatus::Failed))
        );
        assert_eq!(p.status(), ComputationStatus::Failed);
    }

    #[test]
    fn cancel_preempts_and_freezes_the_batch() {
        let mut p = BatchProgress::start(4).expect("start");
        p.record_department(true).expect("first");
        p.cancel().expect("cancel");
        assert_eq!(p.status(), ComputationStatus::Cancelled);
        assert!(p.record_department(true).is_err());
        assert_eq!(p.departments_processed(), 1);
    }

    #[test]
    fn empty_batches_cannot_start() {
        assert_eq!(BatchProgress::start(0), Err(TransitionError::EmptyBatch));
    }

    #[test]
    fn restored_counters_never_exceed_total() {
        let p = BatchProgress::restore(ComputationStatus::Processing, 2, 9, 9);
        assert_eq!(p.departments_processed(), 2);
        assert_eq!(p.failures(), 2);

        let p = BatchProgress::restore(ComputationStatus::Processing, 5, 1, 4);
        assert_eq!(p.departments_processed(), 1);
        assert_eq!(p.failures(), 1);
    }

    #[test]
    fn status_strings_round_trip_through_parse() {
        for s in [
            ComputationStatus::Processing,
            ComputationStatus::Completed,
            ComputationStatus::CompletedWithErrors,
            ComputationStatus::Failed,
            ComputationStatus::Cancelled,
        ] {
            assert_eq!(ComputationStatus::parse(s.as_str()), Some(s));
        }
        assert!(ComputationStatus::Failed.is_retryable());
        assert!(!ComputationStatus::Cancelled.is_retryable());
    }
}
