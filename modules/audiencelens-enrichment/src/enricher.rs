// Demographics enrichment for one subject entity.
//
// Per platform: fresh cache → done. Otherwise look for a raw result of the
// exact same query, and only if there is none pay for a research job. The raw
// result is written the moment the job completes, before parsing, so an
// interrupted or failed run never pays twice for the same query.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use audiencelens_common::{parse_demographics, EntityId, KeyError, ParseError, PlatformId, SubjectKey};
use audiencelens_store::{CacheError, CacheStore, EntryMeta, QueryCacheEntry};
use chrono::Utc;
use futures::future::join_all;
use research_client::{ClientError, ResearchClient};
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use crate::profiles::ProfileSource;
use crate::query::{demographics_schema, ResearchQuery};

/// Default interval after which an idle store connection is re-verified while polling.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum EnrichError {
    #[error("Cache: {0}")]
    Cache(#[from] CacheError),

    #[error("Profile lookup: {0}")]
    Profile(anyhow::Error),

    #[error("Research: {0}")]
    Research(#[from] ClientError),

    #[error("Parse: {0}")]
    Parse(#[from] ParseError),

    #[error("Another enrichment for this subject is already running")]
    AlreadyRunning,
}

/// How a platform ended up enriched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Fresh demographics were already cached.
    CacheHit,
    /// Re-derived from a cached raw result; nothing paid.
    Rederived,
    /// A research job ran.
    Researched,
}

#[derive(Clone, TypedBuilder)]
pub struct DemographicsEnricher {
    store: CacheStore,
    client: Arc<ResearchClient>,
    profiles: Arc<dyn ProfileSource>,
    #[builder(default = DEFAULT_REFRESH_INTERVAL)]
    refresh_interval: Duration,
    #[builder(default, setter(skip))]
    in_flight: Arc<Mutex<HashSet<SubjectKey>>>,
}

/// Releases a subject key on drop, including when the enrichment future is cancelled.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<SubjectKey>>>,
    key: SubjectKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.key);
    }
}

impl DemographicsEnricher {
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Enrich every platform of `entity` concurrently. One platform failing never
    /// affects the others; each maps to whether it ended up with fresh demographics.
    pub async fn enrich_subject<E>(
        &self,
        entity: E,
        platforms: &[PlatformId],
    ) -> Result<BTreeMap<PlatformId, bool>, KeyError>
    where
        E: TryInto<EntityId>,
        KeyError: From<E::Error>,
    {
        let entity: EntityId = entity.try_into()?;
        let unique: BTreeSet<&PlatformId> = platforms.iter().collect();

        let results = join_all(unique.into_iter().map(|platform| {
            let key = SubjectKey::new(entity, platform.clone());
            async move {
                let ok = self.enrich_platform(&key).await;
                (key.platform, ok)
            }
        }))
        .await;

        let succeeded = results.iter().filter(|(_, ok)| *ok).count();
        info!(
            entity = %entity,
            platforms = results.len(),
            succeeded,
            "Enrichment finished"
        );
        Ok(results.into_iter().collect())
    }

    /// One platform, logged and flattened to success or failure.
    pub async fn enrich_platform(&self, key: &SubjectKey) -> bool {
        match self.run(key).await {
            Ok(outcome) => {
                debug!(subject = %key, ?outcome, "Platform enriched");
                true
            }
            Err(EnrichError::AlreadyRunning) => {
                warn!(subject = %key, "Skipping subject, enrichment already in flight");
                false
            }
            Err(e) => {
                error!(subject = %key, error = %e, "Platform enrichment failed");
                false
            }
        }
    }

    fn claim(&self, key: &SubjectKey) -> Option<InFlightGuard> {
        let mut set = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !set.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            set: self.in_flight.clone(),
            key: key.clone(),
        })
    }

    /// Full pipeline for one subject key.
    pub async fn run(&self, key: &SubjectKey) -> Result<Outcome, EnrichError> {
        let _guard = self.claim(key).ok_or(EnrichError::AlreadyRunning)?;

        if self.store.get_demographics(key).await?.is_some() {
            info!(subject = %key, "Demographics cache hit");
            return Ok(Outcome::CacheHit);
        }

        let profile = self
            .profiles
            .profile(key)
            .await
            .map_err(EnrichError::Profile)?;
        let query = ResearchQuery::demographics(&profile, &key.platform);

        let (raw, outcome) = match self.store.get_query_cache(key, &query.fingerprint).await? {
            Some(cached) => {
                info!(
                    subject = %key,
                    fingerprint = %query.fingerprint,
                    job = %cached.job_handle,
                    "Query cache hit, re-deriving demographics"
                );
                (cached, Outcome::Rederived)
            }
            None => (self.research(key, &query).await?, Outcome::Researched),
        };

        let demographics = parse_demographics(&raw.raw_text, raw.result_json.as_ref())
            .inspect_err(|e| {
                warn!(subject = %key, fingerprint = %query.fingerprint, error = %e, "Research result did not parse");
            })?;
        let payload = serde_json::to_value(&demographics).map_err(CacheError::from)?;

        self.store
            .put_demographics(
                key,
                payload,
                EntryMeta::research(demographics.data_confidence, raw.completed_at),
            )
            .await?;

        info!(
            subject = %key,
            confidence = demographics.data_confidence.as_str(),
            ?outcome,
            "Demographics cached"
        );
        Ok(outcome)
    }

    /// Start and poll a research job, then persist its raw result.
    async fn research(
        &self,
        key: &SubjectKey,
        query: &ResearchQuery,
    ) -> Result<QueryCacheEntry, EnrichError> {
        let schema = demographics_schema();
        let handle = self.client.start_research(&query.text, Some(&schema)).await?;
        info!(subject = %key, job = %handle, fingerprint = %query.fingerprint, "Research started");

        let connection = self.store.connection().clone();
        let interval = self.refresh_interval;
        let result = self
            .client
            .poll_research(&handle, |progress| {
                let connection = connection.clone();
                async move {
                    debug!(
                        subject = %key,
                        polls = progress.polls,
                        elapsed_secs = progress.elapsed.as_secs(),
                        "Keeping store connection warm"
                    );
                    if let Err(e) = connection.refresh_if_stale(interval).await {
                        warn!(subject = %key, error = %e, "Store refresh failed while polling");
                    }
                }
            })
            .await?;

        let entry = QueryCacheEntry {
            key: key.clone(),
            fingerprint: query.fingerprint.clone(),
            query_text: query.text.clone(),
            job_handle: result.handle.to_string(),
            raw_text: result.text,
            result_json: result.json,
            input_tokens: result.usage.input_tokens,
            output_tokens: result.usage.output_tokens,
            total_tokens: result.usage.total_tokens,
            completed_at: Utc::now(),
        };

        // A failed write only costs dedup; the result in hand is still usable.
        if let Err(e) = self.store.put_query_cache(&entry).await {
            error!(
                subject = %key,
                job = %entry.job_handle,
                fingerprint = %entry.fingerprint,
                error = %e,
                "Failed to cache raw research result"
            );
        } else {
            info!(
                subject = %key,
                job = %entry.job_handle,
                total_tokens = entry.total_tokens,
                "Raw research result cached"
            );
        }
        Ok(entry)
    }
}
