pub mod control;
pub mod status;

pub use control::*;
pub use status::*;
