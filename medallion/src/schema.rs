//! Ingestion contract checked when change events enter the warehouse.

use std::collections::HashMap;

use medallion_config::shared::EntitySchemaConfig;

use crate::types::{ChangeEvent, Operation, RowImage};

/// Registered schemas by entity.
///
/// Entities without a registered schema only get the structural checks.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, EntitySchemaConfig>,
}

impl SchemaRegistry {
    pub fn new(schemas: impl IntoIterator<Item = EntitySchemaConfig>) -> Self {
        Self {
            schemas: schemas
                .into_iter()
                .map(|schema| (schema.entity.clone(), schema))
                .collect(),
        }
    }

    /// Checks `event` against its entity's contract. Returns the violation, if any, as a
    /// description meant for the quarantine record.
    pub fn validate(&self, event: &ChangeEvent) -> Result<(), String> {
        if event.entity.is_empty() {
            return Err("event has no entity".to_string());
        }
        if event.business_key.is_empty() {
            return Err("event has an empty business key".to_string());
        }

        let image = match event.operation {
            Operation::Insert | Operation::Update => match &event.after {
                Some(after) => Some(after),
                None => {
                    return Err(format!(
                        "{} event has no after image",
                        event.operation.as_str()
                    ));
                }
            },
            // The business key alone identifies a deleted row.
            Operation::Delete => event.before.as_ref(),
        };

        let Some(schema) = self.schemas.get(&event.entity) else {
            return Ok(());
        };

        if let Some(image) = image {
            check_image(schema, image)?;
        }

        Ok(())
    }
}

fn check_image(schema: &EntitySchemaConfig, image: &RowImage) -> Result<(), String> {
    if image.schema_version != schema.schema_version {
        return Err(format!(
            "row image has schema version {} but `{}` expects {}",
            image.schema_version, schema.entity, schema.schema_version
        ));
    }

    let missing: Vec<&str> = schema
        .required_fields
        .iter()
        .filter(|field| !image.fields.contains_key(field.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing required fields: {}", missing.join(", ")));
    }

    Ok(())
}
