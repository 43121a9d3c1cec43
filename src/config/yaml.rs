//! YAML configuration parsing.
//!
//! Parses engine settings and batch task files from YAML.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use super::error::ConfigError;
use super::types::{EngineConfig, TaskFile};

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load engine configuration from a file.
    pub fn load_engine_config(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
        let content = Self::read(path.as_ref())?;
        Self::parse_engine_config(&content).map_err(|e| Self::with_path(e, path.as_ref()))
    }

    /// Parse engine configuration from a YAML string.
    ///
    /// An empty document yields the defaults.
    pub fn parse_engine_config(yaml: &str) -> Result<EngineConfig, ConfigError> {
        let config: EngineConfig = if yaml.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load a task file.
    pub fn load_task_file(path: impl AsRef<Path>) -> Result<TaskFile, ConfigError> {
        let content = Self::read(path.as_ref())?;
        Self::parse_task_file(&content).map_err(|e| Self::with_path(e, path.as_ref()))
    }

    /// Parse a task file from a YAML string.
    pub fn parse_task_file(yaml: &str) -> Result<TaskFile, ConfigError> {
        let file: TaskFile = serde_yaml::from_str(yaml)?;
        Self::validate_task_file(&file)?;
        Ok(file)
    }

    fn read(path: &Path) -> Result<String, ConfigError> {
        std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })
    }

    fn with_path(error: ConfigError, path: &Path) -> ConfigError {
        match error {
            ConfigError::YamlError(source) => ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        }
    }

    /// Validate a task file.
    fn validate_task_file(file: &TaskFile) -> Result<(), ConfigError> {
        if file.tasks.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "task file must have at least one task".into(),
            ));
        }

        // Check for empty or duplicate keys
        let mut keys: HashSet<&str> = HashSet::new();
        for entry in &file.tasks {
            if entry.key.is_empty() {
                return Err(ConfigError::MissingField("key".into()));
            }
            if !keys.insert(&entry.key) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate task key: {}",
                    entry.key
                )));
            }
        }

        for entry in &file.tasks {
            entry.spec.validate().map_err(|e| {
                ConfigError::InvalidConfig(format!("task '{}': {}", entry.key, e))
            })?;

            let mut seen_deps = HashSet::new();
            for dep in &entry.depends_on {
                if dep == &entry.key {
                    return Err(ConfigError::InvalidConfig(format!(
                        "task '{}' cannot depend on itself",
                        entry.key
                    )));
                }
                if !keys.contains(dep.as_str()) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "task '{}' depends on unknown task '{}'",
                        entry.key, dep
                    )));
                }
                if !seen_deps.insert(dep) {
                    return Err(ConfigError::InvalidConfig(format!(
                        "task '{}' has duplicate dependency '{}'",
                        entry.key, dep
                    )));
                }
            }
        }

        Self::dependency_order(file).map(|_| ())
    }

    /// Keys in an order where every task follows its dependencies.
    ///
    /// Uses Kahn's algorithm; ties keep file order. Fails on a cycle.
    pub(crate) fn dependency_order(file: &TaskFile) -> Result<Vec<&str>, ConfigError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut reverse_deps: HashMap<&str, Vec<&str>> = HashMap::new();

        for entry in &file.tasks {
            in_degree.insert(&entry.key, entry.depends_on.len());
            reverse_deps.entry(&entry.key).or_default();
        }
        for entry in &file.tasks {
            for dep in &entry.depends_on {
                reverse_deps.entry(dep.as_str()).or_default().push(&entry.key);
            }
        }

        let mut queue: VecDeque<&str> = file
            .tasks
            .iter()
            .map(|entry| entry.key.as_str())
            .filter(|key| in_degree.get(key) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(file.tasks.len());

        while let Some(key) = queue.pop_front() {
            order.push(key);
            if let Some(downstream) = reverse_deps.get(key) {
                for next in downstream {
                    if let Some(degree) = in_degree.get_mut(next) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(next);
                        }
                    }
                }
            }
        }

        if order.len() != file.tasks.len() {
            let mut cycle_tasks: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(key, _)| *key)
                .collect();
            cycle_tasks.sort_unstable();

            return Err(ConfigError::InvalidConfig(format!(
                "dependency cycle detected involving tasks: {}",
                cycle_tasks.join(", ")
            )));
        }

        Ok(order)
    }
}
