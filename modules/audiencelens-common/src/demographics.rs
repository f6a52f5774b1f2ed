// Demographic payload produced by the research agent, plus the lenient parser
// that turns raw agent output into it.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ParseError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DemographicProfile {
    /// Percent of audience per gender label (female/male/other).
    #[serde(default, deserialize_with = "lenient_shares")]
    #[schemars(with = "BTreeMap<String, f64>")]
    pub gender: BTreeMap<String, f64>,

    /// Percent of audience per age bracket (13-17 … 65+).
    #[serde(default, deserialize_with = "lenient_shares")]
    #[schemars(with = "BTreeMap<String, f64>")]
    pub age_brackets: BTreeMap<String, f64>,

    /// Top countries, largest first.
    #[serde(default, deserialize_with = "lenient_list")]
    #[schemars(with = "Vec<CountryShare>")]
    pub geography: Vec<CountryShare>,

    #[serde(default, deserialize_with = "lenient_list")]
    #[schemars(with = "Vec<LanguageShare>")]
    pub languages: Vec<LanguageShare>,

    #[serde(default, deserialize_with = "lenient_list")]
    #[schemars(with = "Vec<String>")]
    pub interests: Vec<String>,

    #[serde(default)]
    pub data_confidence: Confidence,

    #[serde(default, deserialize_with = "lenient_list")]
    #[schemars(with = "Vec<SourceCitation>")]
    pub sources: Vec<SourceCitation>,

    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CountryShare {
    pub country: String,
    #[serde(default, deserialize_with = "lenient_percent")]
    #[schemars(with = "Option<f64>")]
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LanguageShare {
    pub language: String,
    #[serde(default, deserialize_with = "lenient_percent")]
    #[schemars(with = "Option<f64>")]
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SourceCitation {
    pub source: String,
    #[serde(default)]
    pub data_points: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    #[default]
    Low,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        }
    }

    /// Case-insensitive; anything unrecognized is `Low`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "high" => Confidence::High,
            "medium" => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

impl<'de> Deserialize<'de> for Confidence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(Confidence::parse).unwrap_or_default())
    }
}

/// A percentage as the agent may write it: `45`, `45.5`, `"45"`, `"45%"`.
/// `null` and prose such as "Data Not Available" become `None`.
fn percent_value(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    }
}

fn lenient_percent<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let v = serde_json::Value::deserialize(deserializer)?;
    Ok(percent_value(&v))
}

/// A percentage map. Anything that is not an object, such as
/// "Data Not Available" in place of the whole breakdown, is empty.
fn lenient_shares<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, f64>, D::Error> {
    let serde_json::Value::Object(raw) = serde_json::Value::deserialize(deserializer)? else {
        return Ok(BTreeMap::new());
    };
    Ok(raw
        .into_iter()
        .filter_map(|(k, v)| percent_value(&v).map(|p| (k, p)))
        .collect())
}

/// A list the agent may have replaced with prose. Non-arrays are empty and
/// elements of the wrong shape are dropped.
fn lenient_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let serde_json::Value::Array(items) = serde_json::Value::deserialize(deserializer)? else {
        return Ok(Vec::new());
    };
    Ok(items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect())
}

impl DemographicProfile {
    /// No usable audience breakdown at all.
    pub fn is_empty(&self) -> bool {
        self.gender.is_empty() && self.age_brackets.is_empty() && self.geography.is_empty()
    }

    fn validate(&self) -> Result<(), ParseError> {
        if self.is_empty() {
            return Err(ParseError::Empty);
        }

        let check = |field: String, value: f64| {
            if (0.0..=100.0).contains(&value) {
                Ok(())
            } else {
                Err(ParseError::OutOfRange { field, value })
            }
        };

        for (label, pct) in &self.gender {
            check(format!("gender.{label}"), *pct)?;
        }
        for (bracket, pct) in &self.age_brackets {
            check(format!("age_brackets.{bracket}"), *pct)?;
        }
        for share in &self.geography {
            if let Some(pct) = share.percentage {
                check(format!("geography.{}", share.country), pct)?;
            }
        }
        for share in &self.languages {
            if let Some(pct) = share.percentage {
                check(format!("languages.{}", share.language), pct)?;
            }
        }
        Ok(())
    }
}

/// Pull the outermost JSON object out of agent output. Tolerates code fences
/// and prose before or after the object.
fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let stripped = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    if let Ok(v @ serde_json::Value::Object(_)) = serde_json::from_str(stripped) {
        return Some(v);
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&text[start..=end]) {
        Ok(v @ serde_json::Value::Object(_)) => Some(v),
        _ => None,
    }
}

/// Turn a completed research result into a validated profile.
///
/// `json` is the agent output already parsed by the research client, if it
/// parsed; otherwise the object is dug out of `text`.
pub fn parse_demographics(
    text: &str,
    json: Option<&serde_json::Value>,
) -> Result<DemographicProfile, ParseError> {
    let value = match json {
        Some(v @ serde_json::Value::Object(_)) => v.clone(),
        _ => extract_json_object(text).ok_or(ParseError::NoJson)?,
    };

    let profile: DemographicProfile =
        serde_json::from_value(value).map_err(|e| ParseError::Schema(e.to_string()))?;
    profile.validate()?;
    Ok(profile)
}
