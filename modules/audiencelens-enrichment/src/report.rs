use std::collections::BTreeMap;

use audiencelens_common::{DemographicProfile, EntityId, PlatformId, SubjectKey};
use audiencelens_store::CacheStore;
use tracing::warn;

/// Read side for report rendering. Never triggers research; anything not
/// already cached and fresh is simply left out.
#[derive(Clone)]
pub struct ReportDemographics {
    store: CacheStore,
}

impl ReportDemographics {
    pub fn new(store: CacheStore) -> Self {
        Self { store }
    }

    /// Cached demographics for one subject, or `None` on a miss or any store error.
    pub async fn for_subject(&self, key: &SubjectKey) -> Option<DemographicProfile> {
        let entry = match self.store.get_demographics(key).await {
            Ok(entry) => entry?,
            Err(e) => {
                warn!(subject = %key, error = %e, "Demographics unavailable for report");
                return None;
            }
        };
        match entry.profile() {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!(subject = %key, error = %e, "Cached demographics do not decode");
                None
            }
        }
    }

    /// Every platform of `entity` that has fresh demographics.
    pub async fn for_entity(
        &self,
        entity: EntityId,
        platforms: &[PlatformId],
    ) -> BTreeMap<PlatformId, DemographicProfile> {
        let mut found = BTreeMap::new();
        for platform in platforms {
            let key = SubjectKey::new(entity, platform.clone());
            if let Some(profile) = self.for_subject(&key).await {
                found.insert(key.platform, profile);
            }
        }
        found
    }
}
