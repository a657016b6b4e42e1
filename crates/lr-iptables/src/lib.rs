pub mod builder;
pub mod manager;
pub mod parser;

pub use manager::*;
pub use parser::{parse_counter, parse_listing, parse_rule_specs};
