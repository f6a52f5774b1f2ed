// Research queries sent to the agent. The fingerprint is what the raw-result
// cache is keyed on, so any change to the template re-researches everything.

use audiencelens_common::{DemographicProfile, PlatformId};
use schemars::schema_for;
use sha2::{Digest, Sha256};

use crate::profiles::SubjectProfile;

const DEMOGRAPHICS_TEMPLATE: &str = r#"Research the audience demographics of the creator "{name}" on {platform} (profile: {url}).

Report each of the following, citing a source for every data point:

1. Gender split: percent female, male and other.
2. Age split: percent in each bracket 13-17, 18-24, 25-34, 35-44, 45-54, 55-64, 65+.
3. Geography: the top 5 countries by percent of audience, always including the US.
4. Languages the audience speaks, with percentages.
5. Interests: the top 10 topics or interest categories.

Where a metric cannot be found, write "Data Not Available" for it and say why in notes.

Answer with a single JSON object:
{
  "gender": {"female": <number>, "male": <number>, "other": <number>},
  "age_brackets": {"13-17": <number>, "18-24": <number>, "25-34": <number>, "35-44": <number>, "45-54": <number>, "55-64": <number>, "65+": <number>},
  "geography": [{"country": "US", "percentage": <number>}, ...],
  "languages": [{"language": "<language>", "percentage": <number>}, ...],
  "interests": ["<interest>", ...],
  "data_confidence": "high" | "medium" | "low",
  "sources": [{"source": "<name or URL>", "data_points": ["gender", "age_brackets"]}, ...],
  "notes": "<caveats>"
}
"#;

/// A rendered query plus its dedup fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResearchQuery {
    pub text: String,
    pub fingerprint: String,
}

impl ResearchQuery {
    pub fn new(text: String) -> Self {
        let fingerprint = fingerprint(&text);
        Self { text, fingerprint }
    }

    /// Demographics query for one subject on one platform.
    pub fn demographics(profile: &SubjectProfile, platform: &PlatformId) -> Self {
        let text = DEMOGRAPHICS_TEMPLATE
            .replace("{name}", profile.display_name.trim())
            .replace("{platform}", platform.as_str())
            .replace("{url}", profile.profile_url.trim());
        Self::new(text)
    }
}

/// SHA-256 of the query text, lowercase hex.
pub fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// JSON schema the agent is asked to answer in.
pub fn demographics_schema() -> serde_json::Value {
    let mut schema = serde_json::to_value(schema_for!(DemographicProfile)).unwrap_or_default();
    if let serde_json::Value::Object(map) = &mut schema {
        map.remove("$schema");
    }
    schema
}
