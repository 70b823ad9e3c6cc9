use garde::Validate;
use serde::{Deserialize, Serialize};

/// Structured result expected from the analysis model.
///
/// Fields the model could not determine are omitted by it, so everything
/// except `topics`, `summary` and `speakers` is optional. Unknown fields are
/// accepted and left alone.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ContentAnalysis {
    #[garde(inner(length(min = 1)))]
    pub topics: Vec<String>,

    #[garde(length(min = 1))]
    pub summary: String,

    #[serde(default)]
    #[garde(skip)]
    pub language: Option<String>,

    #[garde(dive)]
    pub speakers: Vec<Speaker>,

    #[serde(default)]
    #[garde(dive)]
    pub transcript: Vec<TranscriptEntry>,
}

/// Dossier for one identified speaker.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Speaker {
    /// Full name, or a role descriptor ("Interviewer") when no name is given
    #[garde(length(min = 1))]
    pub name: String,

    #[serde(default)]
    #[garde(skip)]
    pub roles_affiliations: Vec<RoleAffiliation>,

    #[serde(default)]
    #[garde(skip)]
    pub facts: Vec<String>,

    #[serde(default)]
    #[garde(skip)]
    pub views_beliefs: Vec<String>,

    #[serde(default)]
    #[garde(skip)]
    pub visual_description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAffiliation {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub affiliation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TranscriptEntry {
    #[garde(length(min = 1))]
    pub speaker: String,

    #[garde(length(min = 1))]
    pub timestamp: String,

    #[garde(skip)]
    pub text: String,
}

impl ContentAnalysis {
    /// Schema gate: the value must deserialize into this shape and pass
    /// field validation. Returns a human-readable reason on failure.
    pub fn check(value: &serde_json::Value) -> Result<(), String> {
        let analysis: ContentAnalysis =
            serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
        analysis.validate().map_err(|report| report.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> serde_json::Value {
        json!({
            "topics": ["Rust adoption"],
            "summary": "A conversation about systems programming.",
            "speakers": [{"name": "Interviewer"}]
        })
    }

    #[test]
    fn test_minimal_document_passes() {
        assert!(ContentAnalysis::check(&minimal()).is_ok());
    }

    #[test]
    fn test_unknown_fields_are_tolerated() {
        let mut value = minimal();
        value["sentiment"] = json!("positive");
        assert!(ContentAnalysis::check(&value).is_ok());
    }

    #[test]
    fn test_missing_required_field_fails() {
        let value = json!({"topics": [], "speakers": []});
        let err = ContentAnalysis::check(&value).unwrap_err();
        assert!(err.contains("summary"));
    }

    #[test]
    fn test_empty_speaker_name_fails_validation() {
        let mut value = minimal();
        value["speakers"] = json!([{"name": ""}]);
        assert!(ContentAnalysis::check(&value).is_err());
    }

    #[test]
    fn test_transcript_entries_need_speaker_and_timestamp() {
        let mut value = minimal();
        value["transcript"] = json!([{"speaker": "Host", "timestamp": "", "text": "hi"}]);
        assert!(ContentAnalysis::check(&value).is_err());
    }

    #[test]
    fn test_array_root_is_rejected() {
        assert!(ContentAnalysis::check(&json!([minimal()])).is_err());
    }
}
