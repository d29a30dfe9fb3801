//! Safe SQL builder: identifiers from config only, values as parameters.

pub mod builder;
pub mod params;
pub mod where_clause;

pub use builder::*;
pub use params::*;
