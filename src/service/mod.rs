//! Service layer module

pub mod edit_service;
pub mod pipeline;
pub mod types;

pub use edit_service::EditService;
pub use pipeline::{EditPipeline, EditRequest};
pub use types::*;
