pub mod route;
pub mod rule;
pub mod tables;

pub use route::{ALL_TABLES, ReplayOutcome, RouteManager};
pub use rule::RuleManager;
pub use tables::load_registry;
