//! CrudService: generic CRUD over registered entities using the safe SQL builder.

mod crud;
mod validation;
pub use crud::CrudService;
pub use validation::{RecordValidator, WriteMode};
