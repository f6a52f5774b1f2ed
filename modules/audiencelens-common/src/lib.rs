pub mod config;
pub mod demographics;
pub mod error;
pub mod key;

pub use config::{Config, StoreLocation};
pub use demographics::{
    parse_demographics, Confidence, CountryShare, DemographicProfile, LanguageShare,
    SourceCitation,
};
pub use error::{KeyError, ParseError};
pub use key::{EntityId, PlatformId, SubjectKey};
