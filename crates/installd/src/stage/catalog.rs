//! The ordered stage list every session runs.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::command::{CommandStage, TemplateError};
use super::StageExecutor;
use crate::config::StageConfig;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("no stages configured")]
    Empty,

    #[error("stage '{0}' is configured twice")]
    Duplicate(String),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// One pipeline stage: static properties plus its executor.
#[derive(Clone)]
pub struct StageTemplate {
    pub name: String,
    pub skippable: bool,
    pub retryable: bool,
    pub executor: Arc<dyn StageExecutor>,
}

impl StageTemplate {
    pub fn new(name: &str, executor: Arc<dyn StageExecutor>) -> Self {
        Self {
            name: name.to_string(),
            skippable: false,
            retryable: true,
            executor,
        }
    }

    pub fn skippable(mut self, skippable: bool) -> Self {
        self.skippable = skippable;
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

impl fmt::Debug for StageTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageTemplate")
            .field("name", &self.name)
            .field("skippable", &self.skippable)
            .field("retryable", &self.retryable)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct StageCatalog {
    stages: Vec<StageTemplate>,
}

impl StageCatalog {
    pub fn new(stages: Vec<StageTemplate>) -> Result<Self, CatalogError> {
        if stages.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut seen = HashSet::new();
        for stage in &stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(CatalogError::Duplicate(stage.name.clone()));
            }
        }
        Ok(Self { stages })
    }

    /// Build command stages from `[[stages]]`.
    pub fn from_config(stages: &[StageConfig]) -> Result<Self, CatalogError> {
        let templates = stages
            .iter()
            .map(|config| {
                let executor = CommandStage::from_config(config)?;
                Ok(StageTemplate::new(&config.name, Arc::new(executor))
                    .skippable(config.skippable)
                    .retryable(config.retryable))
            })
            .collect::<Result<Vec<_>, CatalogError>>()?;
        Self::new(templates)
    }

    pub fn stages(&self) -> &[StageTemplate] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Problems with a requested skip list.
    pub fn check_selection(&self, skip: &[String]) -> Vec<String> {
        skip.iter()
            .filter_map(|name| match self.stages.iter().find(|s| &s.name == name) {
                None => Some(format!("unknown stage '{}' in skip list", name)),
                Some(stage) if !stage.skippable => {
                    Some(format!("stage '{}' cannot be skipped", name))
                }
                Some(_) => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_stages;
    use crate::stage::scripted::ScriptedStage;

    #[test]
    fn test_default_catalog_builds() {
        let catalog = StageCatalog::from_config(&default_stages()).unwrap();
        assert_eq!(catalog.stages()[0].name, "partition");
        assert!(catalog.stages().iter().any(|s| s.skippable));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let fake = Arc::new(ScriptedStage::succeeding());
        let err = StageCatalog::new(vec![
            StageTemplate::new("format", fake.clone()),
            StageTemplate::new("format", fake),
        ])
        .unwrap_err();
        assert!(matches!(err, CatalogError::Duplicate(_)));
        assert!(matches!(StageCatalog::new(vec![]), Err(CatalogError::Empty)));
    }

    #[test]
    fn test_check_selection() {
        let fake = Arc::new(ScriptedStage::succeeding());
        let catalog = StageCatalog::new(vec![
            StageTemplate::new("partition", fake.clone()),
            StageTemplate::new("configure", fake).skippable(true),
        ])
        .unwrap();

        assert!(catalog.check_selection(&["configure".to_string()]).is_empty());
        let problems =
            catalog.check_selection(&["partition".to_string(), "nonsense".to_string()]);
        assert_eq!(
            problems,
            vec![
                "stage 'partition' cannot be skipped",
                "unknown stage 'nonsense' in skip list"
            ]
        );
    }
}
