//! Semantic attribute editor
//!
//! Moves a W+ latent code along principal directions. Each requested
//! attribute contributes `direction * effective_strength` to the flattened
//! code; contributions are independent and simply summed.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EditingConfig;

use super::code::LatentCode;
use super::components::ComponentStore;
use super::mapping::{AttributeVector, MappingRecord, SemanticMappingTable};

pub struct SemanticAttributeEditor {
    mappings: Arc<SemanticMappingTable>,
    components: Arc<ComponentStore>,
    tuning: EditingConfig,
}

impl SemanticAttributeEditor {
    pub fn new(
        mappings: Arc<SemanticMappingTable>,
        components: Arc<ComponentStore>,
        tuning: EditingConfig,
    ) -> Self {
        Self {
            mappings,
            components,
            tuning,
        }
    }

    /// Scalar applied to the direction vector for a user strength
    pub fn effective_strength(&self, strength: f32, record: &MappingRecord) -> f32 {
        let t = &self.tuning;
        let mut effective = strength * record.direction.sign() * record.strength * t.damping;

        // Earlier components capture coarser variation and weigh more
        effective *= 1.0 / (1.0 + t.importance_decay * record.component as f32);

        let magnitude = strength.abs();
        if magnitude > t.boost_threshold {
            effective *= 1.0 + t.boost_rate * (magnitude - t.boost_threshold);
        }
        effective
    }

    /// Apply `attributes` to `latent`. Returns the input unchanged when no
    /// strength reaches epsilon; the component library is not touched then.
    pub fn edit(&self, latent: LatentCode, attributes: &AttributeVector) -> LatentCode {
        let epsilon = self.tuning.epsilon;
        if attributes.is_identity(epsilon) {
            debug!("No attribute editing applied");
            return latent;
        }

        let library = self.components.get();
        let num_layers = latent.num_layers();
        let mut flat = latent.to_flat();

        if flat.ncols() != library.width() {
            warn!(
                "Latent width {} does not match component width {}, skipping edits",
                flat.ncols(),
                library.width()
            );
            return latent;
        }

        for (attribute, strength) in attributes.iter() {
            if strength.abs() <= epsilon {
                continue;
            }

            let Some(record) = self.mappings.get(attribute) else {
                debug!("No mapping for {}, skipping", attribute);
                continue;
            };

            if !attribute.sign_policy().allows(strength) {
                warn!("Ignoring {} value for {}: {}", sign_word(strength), attribute, strength);
                continue;
            }

            let effective = self.effective_strength(strength, record);

            let Some(direction) = library.direction(record.component) else {
                warn!(
                    "Component index {} out of range for {} ({} components loaded)",
                    record.component,
                    attribute,
                    library.len()
                );
                continue;
            };

            info!(
                "Applying edit for {}: component {}, strength {:.3}",
                attribute, record.component, effective
            );

            for mut row in flat.rows_mut() {
                row.scaled_add(effective, &direction);
            }
        }

        LatentCode::from_flat(&flat, num_layers)
    }
}

fn sign_word(strength: f32) -> &'static str {
    if strength < 0.0 {
        "negative"
    } else {
        "positive"
    }
}
