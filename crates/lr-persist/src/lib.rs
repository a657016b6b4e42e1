pub mod archive;
pub mod drift;
pub mod engine;
pub mod report;
pub mod store;

pub use archive::ImportSummary;
pub use drift::Drift;
pub use engine::PersistEngine;
pub use report::{DomainOutcome, DomainStats, LineFailure, RestoreReport};
