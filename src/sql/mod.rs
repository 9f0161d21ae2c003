//! Safe SQL generation: identifiers from compiled definitions only, values as parameters.

mod builder;
pub mod compiler;
pub mod filter;
mod ident;
pub mod params;
pub use builder::*;
pub use compiler::*;
pub use filter::*;
pub use ident::{qualified_table, quoted};
pub use params::*;
