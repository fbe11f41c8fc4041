//! Latent space: codes, principal directions and semantic editing

pub mod code;
pub mod components;
pub mod editor;
pub mod mapping;
pub mod mean;

pub use code::LatentCode;
pub use components::{ComponentLibrary, ComponentStore};
pub use editor::SemanticAttributeEditor;
pub use mapping::{Attribute, AttributeVector, Direction, MappingRecord, SemanticMappingTable};
pub use mean::MeanLatentCache;
