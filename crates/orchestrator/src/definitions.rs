//! Intake and persistence of job definitions. Saving revalidates the
//! definition and records the outcome on the stored record; an invalid
//! definition is kept (so the admin surface can show what is wrong) but
//! refused at execution intake.

use crate::registry::JobTypeRegistry;
use chrono::Utc;
use ingest::storage::DefinitionStorage;
use shared::{AppError, JobDefinition, ValidationStatus};
use std::sync::Arc;
use tracing::{info, warn};

pub struct DefinitionService {
    storage: Arc<dyn DefinitionStorage>,
    registry: Arc<JobTypeRegistry>,
}

impl DefinitionService {
    pub fn new(storage: Arc<dyn DefinitionStorage>, registry: Arc<JobTypeRegistry>) -> Self {
        Self { storage, registry }
    }

    /// Validate and persist a definition, stamping its validation status.
    /// Returns the stored record.
    pub async fn save(&self, mut def: JobDefinition) -> shared::Result<JobDefinition> {
        if def.id.trim().is_empty() {
            return Err(AppError::Validation(
                "job definition id must not be empty".to_string(),
            ));
        }
        match self.validate(&def) {
            Ok(()) => {
                def.validation_status = ValidationStatus::Valid;
                def.validation_error = None;
            }
            Err(e) => {
                warn!(definition_id = %def.id, error = %e, "definition failed validation");
                def.validation_status = ValidationStatus::Invalid;
                def.validation_error = Some(e.to_string());
            }
        }
        def.updated_at = Utc::now();
        self.storage.save_definition(&def).await?;
        info!(
            definition_id = %def.id,
            status = ?def.validation_status,
            "job definition saved"
        );
        Ok(def)
    }

    /// Structural checks plus a registry lookup for every step action.
    fn validate(&self, def: &JobDefinition) -> shared::Result<()> {
        def.validate()?;
        for (i, step) in def.steps.iter().enumerate() {
            if let Err(e) = self.registry.get_action(def.kind, &step.action) {
                return Err(AppError::Validation(format!(
                    "step {} of '{}': {}",
                    i, def.id, e
                )));
            }
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> shared::Result<JobDefinition> {
        self.storage
            .get_definition(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job definition '{}'", id)))
    }

    /// A definition is runnable when it is enabled and validated.
    pub async fn get_runnable(&self, id: &str) -> shared::Result<JobDefinition> {
        let def = self.get(id).await?;
        if !def.enabled {
            return Err(AppError::Policy(format!(
                "job definition '{}' is disabled",
                id
            )));
        }
        if def.validation_status == ValidationStatus::Invalid {
            return Err(AppError::Validation(format!(
                "job definition '{}' is invalid: {}",
                id,
                def.validation_error.as_deref().unwrap_or("unknown error")
            )));
        }
        Ok(def)
    }

    pub async fn list(&self) -> shared::Result<Vec<JobDefinition>> {
        self.storage.list_definitions().await
    }

    pub async fn list_enabled(&self) -> shared::Result<Vec<JobDefinition>> {
        Ok(self
            .storage
            .list_definitions()
            .await?
            .into_iter()
            .filter(|d| d.enabled)
            .collect())
    }

    pub async fn delete(&self, id: &str) -> shared::Result<()> {
        self.storage.delete_definition(id).await?;
        info!(definition_id = %id, "job definition deleted");
        Ok(())
    }
}
