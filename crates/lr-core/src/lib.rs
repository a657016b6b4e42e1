pub mod audit;
pub mod config;
pub mod error;
pub mod exec;
pub mod firewall;
pub mod lock;
pub mod route;
pub mod rule;
pub mod selector;
pub mod status;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use audit::*;
pub use config::*;
pub use error::*;
pub use exec::*;
pub use firewall::*;
pub use lock::*;
pub use route::*;
pub use rule::*;
pub use status::*;
