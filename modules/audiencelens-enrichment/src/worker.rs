// Background enrichment. Requests queue on a bounded channel and each runs on
// its own task, with a semaphore capping how many research jobs are live at once.

use std::collections::BTreeMap;
use std::sync::Arc;

use audiencelens_common::{EntityId, PlatformId};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::enricher::DemographicsEnricher;

pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentRequest {
    pub run_id: Uuid,
    pub entity: EntityId,
    pub platforms: Vec<PlatformId>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Enrichment queue is full")]
    QueueFull,

    #[error("Enrichment worker has stopped")]
    Stopped,
}

/// Cheap, cloneable entry point into the worker.
#[derive(Clone)]
pub struct EnrichmentHandle {
    tx: mpsc::Sender<EnrichmentRequest>,
}

impl EnrichmentHandle {
    /// Queue an entity for enrichment. Returns immediately with the run id.
    pub fn submit(&self, entity: EntityId, platforms: Vec<PlatformId>) -> Result<Uuid, SubmitError> {
        let run_id = Uuid::new_v4();
        self.tx
            .try_send(EnrichmentRequest {
                run_id,
                entity,
                platforms,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SubmitError::Stopped,
            })?;
        Ok(run_id)
    }

    /// Like `submit`, but waits for queue space instead of failing when full.
    pub async fn enqueue(
        &self,
        entity: EntityId,
        platforms: Vec<PlatformId>,
    ) -> Result<Uuid, SubmitError> {
        let run_id = Uuid::new_v4();
        self.tx
            .send(EnrichmentRequest {
                run_id,
                entity,
                platforms,
            })
            .await
            .map_err(|_| SubmitError::Stopped)?;
        Ok(run_id)
    }
}

pub struct EnrichmentWorker {
    enricher: DemographicsEnricher,
    rx: mpsc::Receiver<EnrichmentRequest>,
    concurrency: usize,
}

impl EnrichmentWorker {
    pub fn new(
        enricher: DemographicsEnricher,
        concurrency: usize,
        queue_capacity: usize,
    ) -> (Self, EnrichmentHandle) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let worker = Self {
            enricher,
            rx,
            concurrency: concurrency.max(1),
        };
        (worker, EnrichmentHandle { tx })
    }

    /// Start the worker on the current runtime.
    pub fn spawn(
        enricher: DemographicsEnricher,
        concurrency: usize,
    ) -> (EnrichmentHandle, JoinHandle<()>) {
        let (worker, handle) = Self::new(enricher, concurrency, DEFAULT_QUEUE_CAPACITY);
        (handle, tokio::spawn(worker.run()))
    }

    /// Drain the queue until every handle is dropped, then wait for in-flight runs.
    pub async fn run(mut self) {
        info!(concurrency = self.concurrency, "Enrichment worker started");
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        while let Some(request) = self.rx.recv().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let enricher = self.enricher.clone();
            tasks.spawn(async move {
                let _permit = permit;
                run_request(&enricher, request).await;
            });

            while let Some(done) = tasks.try_join_next() {
                log_join(done);
            }
        }

        while let Some(done) = tasks.join_next().await {
            log_join(done);
        }
        info!("Enrichment worker stopped");
    }
}

async fn run_request(enricher: &DemographicsEnricher, request: EnrichmentRequest) {
    match enricher
        .enrich_subject(request.entity, &request.platforms)
        .await
    {
        Ok(outcome) => {
            let outcome: BTreeMap<String, bool> = outcome
                .into_iter()
                .map(|(platform, ok)| (platform.to_string(), ok))
                .collect();
            info!(
                run_id = %request.run_id,
                entity = %request.entity,
                outcome = ?outcome,
                "Enrichment run complete"
            );
        }
        Err(e) => warn!(run_id = %request.run_id, error = %e, "Enrichment run rejected"),
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Enrichment task panicked");
    }
}
