pub mod enricher;
pub mod profiles;
pub mod query;
pub mod report;
pub mod worker;

pub use enricher::{DemographicsEnricher, EnrichError, Outcome, DEFAULT_REFRESH_INTERVAL};
pub use profiles::{ProfileSource, StaticProfiles, SubjectProfile};
pub use query::{demographics_schema, fingerprint, ResearchQuery};
pub use report::ReportDemographics;
pub use worker::{EnrichmentHandle, EnrichmentRequest, EnrichmentWorker, SubmitError};
