use crate::db;
use crate::grading::{standard_bands, GradeBand, GradeScale, DEFAULT_PASS_THRESHOLD};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsSection {
    Session,
    Grading,
    Platform,
}

impl SettingsSection {
    pub const ALL: [SettingsSection; 3] = [
        SettingsSection::Session,
        SettingsSection::Grading,
        SettingsSection::Platform,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "session" => Some(Self::Session),
            "grading" => Some(Self::Grading),
            "platform" => Some(Self::Platform),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Grading => "grading",
            Self::Platform => "platform",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Session => "settings.session",
            Self::Grading => "settings.grading",
            Self::Platform => "settings.platform",
        }
    }
}

fn default_section(section: SettingsSection) -> Value {
    match section {
        SettingsSection::Session => json!({
            "institutionName": "",
            "sessionName": "",
            "semesterName": "first"
        }),
        SettingsSection::Grading => json!({
            "passThreshold": DEFAULT_PASS_THRESHOLD,
            "boundaries": standard_bands()
        }),
        SettingsSection::Platform => json!({
            "resultUploadOpen": true,
            "transcriptRequestsOpen": true,
            "notifyStudentsOnFinal": true
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v.as_f64().ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_bands(v: &Value) -> Result<Vec<GradeBand>, String> {
    let bands: Vec<GradeBand> = serde_json::from_value(v.clone())
        .map_err(|e| format!("boundaries must be a list of {{grade, minScore, point}}: {e}"))?;
    Ok(bands
        .into_iter()
        .map(|b| GradeBand {
            grade: b.grade.trim().to_ascii_uppercase(),
            ..b
        })
        .collect())
}

pub fn merge_section_patch(
    section: SettingsSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal settings object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SettingsSection::Session => match k.as_str() {
                "institutionName" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "sessionName" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 32)?));
                }
                "semesterName" => {
                    let s = parse_string_max(v, k, 16)?.to_ascii_lowercase();
                    if s != "first" && s != "second" && s != "summer" {
                        return Err("semesterName must be one of: first, second, summer".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                _ => return Err(format!("unknown session field: {}", k)),
            },
            SettingsSection::Grading => match k.as_str() {
                "passThreshold" => {
                    obj.insert(k.clone(), json!(parse_f64_range(v, k, 0.0, 100.0)?));
                }
                "boundaries" => {
                    obj.insert(k.clone(), json!(parse_bands(v)?));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SettingsSection::Platform => match k.as_str() {
                "resultUploadOpen" | "transcriptRequestsOpen" | "notifyStudentsOnFinal" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown platform field: {}", k)),
            },
        }
    }
    if section == SettingsSection::Grading {
        // Fields are validated one by one above; the scale is only
        // meaningful as a whole.
        scale_from_section(current).map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn scale_from_section(section: &Value) -> Result<GradeScale, crate::grading::GradingError> {
    let threshold = section
        .get("passThreshold")
        .and_then(|v| v.as_f64())
        .unwrap_or(DEFAULT_PASS_THRESHOLD);
    let bands = section
        .get("boundaries")
        .and_then(|v| parse_bands(v).ok())
        .unwrap_or_else(standard_bands);
    GradeScale::new(bands, threshold)
}

pub fn load_section(conn: &Connection, section: SettingsSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // A stale or malformed saved value falls back to the defaults.
            let mut candidate = current.clone();
            if merge_section_patch(section, &mut candidate, saved_obj).is_ok() {
                current = candidate;
            }
        }
    }
    Ok(current)
}

pub fn update_section(
    conn: &Connection,
    section: SettingsSection,
    patch: &Map<String, Value>,
) -> anyhow::Result<Result<Value, String>> {
    let mut current = load_section(conn, section)?;
    if let Err(msg) = merge_section_patch(section, &mut current, patch) {
        return Ok(Err(msg));
    }
    db::settings_set_json(conn, section.key(), &current)?;
    Ok(Ok(current))
}

pub fn grade_scale(conn: &Connection) -> anyhow::Result<GradeScale> {
    let section = load_section(conn, SettingsSection::Grading)?;
    Ok(scale_from_section(&section).unwrap_or_default())
}

pub fn platform_flag(conn: &Connection, key: &str) -> anyhow::Result<bool> {
    let section = load_section(conn, SettingsSection::Platform)?;
    Ok(section.get(key).and_then(|v| v.as_bool()).unwrap_or(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(v: Value) -> Map<String, Value> {
        v.as_object().cloned().expect("object")
    }

    #[test]
    fn grading_patch_is_validated_as_a_whole() {
        let mut current = default_section(SettingsSection::Grading);
        let bad = patch(json!({
            "boundaries": [
                { "grade": "A", "minScore": 50, "point": 5 },
                { "grade": "B", "minScore": 60, "point": 4 },
                { "grade": "F", "minScore": 0, "point": 0 }
            ]
        }));
        assert!(merge_section_patch(SettingsSection::Grading, &mut current, &bad).is_err());

        let good = patch(json!({
            "passThreshold": 45,
            "boundaries": [
                { "grade": "a", "minScore": 75, "point": 5 },
                { "grade": "C", "minScore": 45, "point": 3 },
                { "grade": "F", "minScore": 0, "point": 0 }
            ]
        }));
        merge_section_patch(SettingsSection::Grading, &mut current, &good).expect("merge");
        let scale = scale_from_section(&current).expect("scale");
        assert_eq!(scale.pass_threshold(), 45.0);
        assert_eq!(scale.resolve(80.0).expect("resolve"), ("A", 5));
        assert_eq!(scale.resolve(60.0).expect("resolve"), ("C", 3));
    }

    #[test]
    fn unknown_fields_and_wrong_types_are_rejected() {
        let mut current = default_section(SettingsSection::Platform);
        assert!(merge_section_patch(
            SettingsSection::Platform,
            &mut current,
            &patch(json!({ "resultUploadOpen": "yes" }))
        )
        .is_err());
        assert!(merge_section_patch(
            SettingsSection::Platform,
            &mut current,
            &patch(json!({ "darkMode": true }))
        )
        .is_err());

        let mut session = default_section(SettingsSection::Session);
        assert!(merge_section_patch(
            SettingsSection::Session,
            &mut session,
            &patch(json!({ "semesterName": "third" }))
        )
        .is_err());
    }
}
