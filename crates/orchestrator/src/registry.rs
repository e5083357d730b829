use async_trait::async_trait;
use shared::{AppError, JobKind, JobStep, SourceConfig};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-invocation handle passed to step actions. It carries a local copy of
/// the step (actions may write options back, the stored definition is never
/// touched) and the structured slot through which the crawl action deposits
/// child job IDs for the executor.
pub struct StepContext {
    pub cancel: CancellationToken,
    pub definition_id: String,
    pub definition_name: String,
    pub kind: JobKind,
    pub step: JobStep,
    pub sources: Vec<SourceConfig>,
    pub crawl_job_ids: Vec<String>,
}

impl StepContext {
    pub fn new(
        cancel: CancellationToken,
        definition_id: &str,
        definition_name: &str,
        kind: JobKind,
        step: JobStep,
        sources: Vec<SourceConfig>,
    ) -> Self {
        Self {
            cancel,
            definition_id: definition_id.to_string(),
            definition_name: definition_name.to_string(),
            kind,
            step,
            sources,
            crawl_job_ids: Vec::new(),
        }
    }
}

/// One named stage of a job kind.
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn execute(&self, ctx: &mut StepContext) -> shared::Result<()>;
}

/// Process-wide `(kind, action) -> handler` mapping. Registration normally
/// happens once at startup but runtime registration is safe; readers never
/// block each other.
pub struct JobTypeRegistry {
    actions: RwLock<HashMap<JobKind, HashMap<String, Arc<dyn StepAction>>>>,
}

impl JobTypeRegistry {
    pub fn new() -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_action(
        &self,
        kind: JobKind,
        name: &str,
        action: Arc<dyn StepAction>,
    ) -> shared::Result<()> {
        if name.trim().is_empty() {
            return Err(AppError::Validation(
                "action name must not be empty".to_string(),
            ));
        }
        let mut guard = self.actions.write().unwrap();
        let entry = guard.entry(kind).or_default();
        if entry.contains_key(name) {
            return Err(AppError::Validation(format!(
                "action '{}' is already registered for kind '{}'",
                name, kind
            )));
        }
        entry.insert(name.to_string(), action);
        debug!(kind = kind.as_str(), action = name, "registered job action");
        Ok(())
    }

    pub fn get_action(&self, kind: JobKind, name: &str) -> shared::Result<Arc<dyn StepAction>> {
        self.actions
            .read()
            .unwrap()
            .get(&kind)
            .and_then(|actions| actions.get(name))
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!("action '{}' for kind '{}'", name, kind))
            })
    }

    /// Registered action names for a kind, lexicographically sorted.
    pub fn list_actions(&self, kind: JobKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .actions
            .read()
            .unwrap()
            .get(&kind)
            .map(|actions| actions.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Every kind with at least one registered handler.
    pub fn get_all_job_types(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self
            .actions
            .read()
            .unwrap()
            .iter()
            .filter(|(_, actions)| !actions.is_empty())
            .map(|(kind, _)| *kind)
            .collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

impl Default for JobTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopAction;

    #[async_trait]
    impl StepAction for NoopAction {
        async fn execute(&self, _ctx: &mut StepContext) -> shared::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = JobTypeRegistry::new();
        registry
            .register_action(JobKind::Crawler, "crawl", Arc::new(NoopAction))
            .unwrap();
        assert!(registry.get_action(JobKind::Crawler, "crawl").is_ok());
        assert!(registry.get_action(JobKind::Crawler, "missing").is_err());
        assert!(registry.get_action(JobKind::Summarizer, "crawl").is_err());
    }

    #[test]
    fn test_rejects_empty_name_and_duplicates() {
        let registry = JobTypeRegistry::new();
        assert!(registry
            .register_action(JobKind::Crawler, "", Arc::new(NoopAction))
            .is_err());
        registry
            .register_action(JobKind::Crawler, "crawl", Arc::new(NoopAction))
            .unwrap();
        assert!(registry
            .register_action(JobKind::Crawler, "crawl", Arc::new(NoopAction))
            .is_err());
        // The same name under another kind is fine.
        registry
            .register_action(JobKind::Custom, "crawl", Arc::new(NoopAction))
            .unwrap();
    }

    #[test]
    fn test_list_actions_is_sorted() {
        let registry = JobTypeRegistry::new();
        for name in ["transform", "crawl", "embed"] {
            registry
                .register_action(JobKind::Crawler, name, Arc::new(NoopAction))
                .unwrap();
        }
        assert_eq!(
            registry.list_actions(JobKind::Crawler),
            vec!["crawl", "embed", "transform"]
        );
        assert!(registry.list_actions(JobKind::Custom).is_empty());
    }

    #[test]
    fn test_get_all_job_types() {
        let registry = JobTypeRegistry::new();
        registry
            .register_action(JobKind::Summarizer, "scan", Arc::new(NoopAction))
            .unwrap();
        registry
            .register_action(JobKind::Crawler, "crawl", Arc::new(NoopAction))
            .unwrap();
        assert_eq!(
            registry.get_all_job_types(),
            vec![JobKind::Crawler, JobKind::Summarizer]
        );
    }
}
