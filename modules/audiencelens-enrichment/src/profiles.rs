// Who a subject is on a given platform. Fetching this from the platforms
// themselves is someone else's job; the orchestrator only needs the two strings.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use audiencelens_common::SubjectKey;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectProfile {
    pub display_name: String,
    pub profile_url: String,
}

#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn profile(&self, key: &SubjectKey) -> Result<SubjectProfile>;
}

/// Profiles known up front.
#[derive(Debug, Clone, Default)]
pub struct StaticProfiles {
    profiles: HashMap<SubjectKey, SubjectProfile>,
}

impl StaticProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: SubjectKey, display_name: &str, profile_url: &str) -> Self {
        self.insert(key, display_name, profile_url);
        self
    }

    pub fn insert(&mut self, key: SubjectKey, display_name: &str, profile_url: &str) {
        self.profiles.insert(
            key,
            SubjectProfile {
                display_name: display_name.to_string(),
                profile_url: profile_url.to_string(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[async_trait]
impl ProfileSource for StaticProfiles {
    async fn profile(&self, key: &SubjectKey) -> Result<SubjectProfile> {
        self.profiles
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No profile known for {key}"))
    }
}
