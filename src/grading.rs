use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

pub const DEFAULT_PASS_THRESHOLD: f64 = 40.0;
pub const MAX_GRADE_POINT: u8 = 5;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GradingError {
    #[error("score {0} must be a number in 0..=100")]
    ScoreOutOfRange(f64),
    #[error("course {0} has a credit unit of 0")]
    InvalidUnit(String),
    #[error("no registered units for this semester")]
    NoResults,
    #[error("invalid grade scale: {0}")]
    InvalidScale(String),
}

impl GradingError {
    pub fn code(&self) -> &'static str {
        match self {
            GradingError::ScoreOutOfRange(_) => "invalid_score",
            GradingError::InvalidUnit(_) => "invalid_unit",
            GradingError::NoResults => "no_results",
            GradingError::InvalidScale(_) => "invalid_scale",
        }
    }
}

/// Scores are accepted as-is or rejected; they are never clamped.
pub fn validate_score(score: f64) -> Result<f64, GradingError> {
    if !score.is_finite() || !(0.0..=100.0).contains(&score) {
        return Err(GradingError::ScoreOutOfRange(score));
    }
    Ok(score)
}

/// Two-decimal rounding used for every GPA shown to users.
pub fn round_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub grade: String,
    pub min_score: f64,
    pub point: u8,
}

impl GradeBand {
    fn new(grade: &str, min_score: f64, point: u8) -> Self {
        Self {
            grade: grade.to_string(),
            min_score,
            point,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradeScale {
    bands: Vec<GradeBand>,
    pass_threshold: f64,
}

impl Default for GradeScale {
    fn default() -> Self {
        Self::standard()
    }
}

impl GradeScale {
    /// A≥70=5, B≥60=4, C≥50=3, D≥45=2, E≥40=1, F<40=0.
    pub fn standard() -> Self {
        Self {
            bands: standard_bands(),
            pass_threshold: DEFAULT_PASS_THRESHOLD,
        }
    }

    pub fn new(bands: Vec<GradeBand>, pass_threshold: f64) -> Result<Self, GradingError> {
        validate_bands(&bands)?;
        if !pass_threshold.is_finite() || !(0.0..=100.0).contains(&pass_threshold) {
            return Err(GradingError::InvalidScale(
                "passThreshold must be in 0..=100".into(),
            ));
        }
        Ok(Self {
            bands,
            pass_threshold,
        })
    }

    pub fn bands(&self) -> &[GradeBand] {
        &self.bands
    }

    pub fn pass_threshold(&self) -> f64 {
        self.pass_threshold
    }

    pub fn resolve(&self, score: f64) -> Result<(&str, u8), GradingError> {
        let score = validate_score(score)?;
        self.bands
            .iter()
            .find(|b| score >= b.min_score)
            .map(|b| (b.grade.as_str(), b.point))
            .ok_or_else(|| GradingError::InvalidScale("no band covers the score".into()))
    }

    pub fn is_carryover(&self, score: f64) -> bool {
        score < self.pass_threshold
    }

    pub fn grade_course(&self, input: &CourseInput) -> Result<CourseResult, GradingError> {
        if input.unit == 0 {
            return Err(GradingError::InvalidUnit(input.code.clone()));
        }
        let (grade, grade_point) = self.resolve(input.score)?;
        Ok(CourseResult {
            course_id: input.course_id.clone(),
            code: input.code.clone(),
            title: input.title.clone(),
            unit: input.unit,
            score: input.score,
            grade: grade.to_string(),
            grade_point,
            is_core: input.is_core,
            is_carryover: self.is_carryover(input.score),
        })
    }
}

pub fn standard_bands() -> Vec<GradeBand> {
    vec![
        GradeBand::new("A", 70.0, 5),
        GradeBand::new("B", 60.0, 4),
        GradeBand::new("C", 50.0, 3),
        GradeBand::new("D", 45.0, 2),
        GradeBand::new("E", 40.0, 1),
        GradeBand::new("F", 0.0, 0),
    ]
}

pub fn validate_bands(bands: &[GradeBand]) -> Result<(), GradingError> {
    let bad = |msg: &str| Err(GradingError::InvalidScale(msg.to_string()));
    if bands.is_empty() {
        return bad("at least one band is required");
    }
    let mut seen = HashSet::new();
    for (i, b) in bands.iter().enumerate() {
        let grade = b.grade.trim();
        if grade.is_empty() {
            return bad("grade letters must not be empty");
        }
        if !seen.insert(grade.to_ascii_uppercase()) {
            return bad("grade letters must be unique");
        }
        if !b.min_score.is_finite() || !(0.0..=100.0).contains(&b.min_score) {
            return bad("minScore must be in 0..=100");
        }
        if b.point > MAX_GRADE_POINT {
            return bad("point must be in 0..=5");
        }
        if i > 0 {
            let prev = &bands[i - 1];
            if b.min_score >= prev.min_score {
                return bad("minScore must be strictly descending");
            }
            if b.point > prev.point {
                return bad("point must not increase as minScore falls");
            }
        }
    }
    if bands.last().map(|b| b.min_score) != Some(0.0) {
        return bad("the lowest band must start at 0");
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct CourseInput {
    pub course_id: String,
    pub code: String,
    pub title: String,
    pub unit: u32,
    pub score: f64,
    pub is_core: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseResult {
    pub course_id: String,
    pub code: String,
    pub title: String,
    pub unit: u32,
    pub score: f64,
    pub grade: String,
    pub grade_point: u8,
    pub is_core: bool,
    pub is_carryover: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SemesterAggregate {
    pub total_units: u32,
    pub total_points: u32,
    pub gpa: f64,
    pub carryover_count: usize,
}

pub fn aggregate_semester(courses: &[CourseResult]) -> Result<SemesterAggregate, GradingError> {
    let mut total_units: u32 = 0;
    let mut total_points: u32 = 0;
    let mut carryover_count: usize = 0;
    for c in courses {
        if c.unit == 0 {
            return Err(GradingError::InvalidUnit(c.code.clone()));
        }
        total_units += c.unit;
        total_points += u32::from(c.grade_point) * c.unit;
        if c.is_carryover {
            carryover_count += 1;
        }
    }
    if total_units == 0 {
        return Err(GradingError::NoResults);
    }
    Ok(SemesterAggregate {
        total_units,
        total_points,
        gpa: f64::from(total_points) / f64::from(total_units),
        carryover_count,
    })
}

/// Units and points accumulated over committed semesters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CumulativeTotals {
    pub units: u32,
    pub points: u32,
}

impl CumulativeTotals {
    pub fn with(self, semester: &SemesterAggregate) -> Self {
        Self {
            units: self.units + semester.total_units,
            points: self.points + semester.total_points,
        }
    }

    pub fn cgpa(&self) -> Option<f64> {
        if self.units == 0 {
            return None;
        }
        Some(f64::from(self.points) / f64::from(self.units))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    FirstClass,
    SecondClassUpper,
    SecondClassLower,
    ThirdClass,
    Fail,
}

impl Classification {
    pub fn from_cgpa(cgpa: f64) -> Self {
        if cgpa >= 4.50 {
            Classification::FirstClass
        } else if cgpa >= 3.50 {
            Classification::SecondClassUpper
        } else if cgpa >= 2.40 {
            Classification::SecondClassLower
        } else if cgpa >= 1.50 {
            Classification::ThirdClass
        } else {
            Classification::Fail
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Standing {
    Excellent,
    Good,
    Probation,
    Withdrawn,
    Terminated,
}

impl Standing {
    pub fn as_str(self) -> &'static str {
        match self {
            Standing::Excellent => "excellent",
            Standing::Good => "good",
            Standing::Probation => "probation",
            Standing::Withdrawn => "withdrawn",
            Standing::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "excellent" => Some(Standing::Excellent),
            "good" => Some(Standing::Good),
            "probation" => Some(Standing::Probation),
            "withdrawn" => Some(Standing::Withdrawn),
            "terminated" => Some(Standing::Terminated),
            _ => None,
        }
    }

    /// Display band only; never feeds back into gpa/cgpa.
    pub fn derive(cgpa: f64, carryover_count: usize, previous: Option<Standing>) -> Self {
        if cgpa < 1.50 {
            return match previous {
                Some(Standing::Probation) => Standing::Withdrawn,
                Some(Standing::Withdrawn) | Some(Standing::Terminated) => Standing::Terminated,
                _ => Standing::Probation,
            };
        }
        if cgpa >= 4.50 && carryover_count == 0 {
            Standing::Excellent
        } else {
            Standing::Good
        }
    }
}
