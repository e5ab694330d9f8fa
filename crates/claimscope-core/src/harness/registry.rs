//! `(domain, task)` → harness dispatch.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{CommandHarness, CommandSpec, Harness, HarnessDescriptor};
use crate::domain::ConfigError;

struct Route {
    domain: String,
    task_prefix: String,
    harness: Arc<dyn Harness>,
}

/// Registry of harness variants keyed by domain and task prefix.
///
/// Matching is case-insensitive. Among routes for the claim's domain the
/// longest matching task prefix wins; an empty prefix matches every task.
#[derive(Default)]
pub struct HarnessRegistry {
    routes: Vec<Route>,
}

impl std::fmt::Debug for HarnessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.routes.iter().map(|r| {
                format!("{}/{}* -> {}", r.domain, r.task_prefix, r.harness.descriptor().name)
            }))
            .finish()
    }
}

impl HarnessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route. A later route with the same key replaces the earlier one.
    pub fn register(&mut self, domain: &str, task_prefix: &str, harness: Arc<dyn Harness>) {
        let domain = domain.trim().to_ascii_lowercase();
        let task_prefix = task_prefix.trim().to_ascii_lowercase();
        self.routes
            .retain(|r| !(r.domain == domain && r.task_prefix == task_prefix));
        self.routes.push(Route {
            domain,
            task_prefix,
            harness,
        });
    }

    pub fn resolve(&self, domain: &str, task: &str) -> Option<Arc<dyn Harness>> {
        let domain = domain.trim().to_ascii_lowercase();
        let task = task.trim().to_ascii_lowercase();
        self.routes
            .iter()
            .filter(|r| r.domain == domain && task.starts_with(&r.task_prefix))
            .max_by_key(|r| r.task_prefix.len())
            .map(|r| r.harness.clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Build a registry of command harnesses from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let file: RegistryFile = serde_json::from_str(&raw)?;
        Self::from_entries(file.harnesses)
    }

    pub fn from_entries(entries: Vec<RegistryEntry>) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for entry in entries {
            if entry.domain.trim().is_empty() {
                return Err(ConfigError::invalid("domain", "registry entry needs a domain"));
            }
            if entry.command.program.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "command.program",
                    format!("empty program for {}", entry.descriptor.name),
                ));
            }
            let mut descriptor = entry.descriptor;
            descriptor.resolve_digests()?;
            let harness = CommandHarness::new(descriptor, entry.command);
            registry.register(&entry.domain, &entry.task_prefix, Arc::new(harness));
        }
        Ok(registry)
    }
}

/// On-disk registry layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryFile {
    pub harnesses: Vec<RegistryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub domain: String,
    #[serde(default)]
    pub task_prefix: String,
    pub descriptor: HarnessDescriptor,
    pub command: CommandSpec,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{HarnessContext, HarnessError, HarnessOutput, Invocation};
    use async_trait::async_trait;

    struct Named(HarnessDescriptor);

    #[async_trait]
    impl Harness for Named {
        fn descriptor(&self) -> &HarnessDescriptor {
            &self.0
        }

        async fn run(&self, _: &Invocation, _: &HarnessContext) -> Result<HarnessOutput, HarnessError> {
            Ok(HarnessOutput::default())
        }
    }

    fn named(name: &str) -> Arc<dyn Harness> {
        Arc::new(Named(HarnessDescriptor::new(name, name)))
    }

    #[test]
    fn longest_prefix_wins_case_insensitively() {
        let mut registry = HarnessRegistry::new();
        registry.register("coding", "", named("generic"));
        registry.register("coding", "humaneval", named("humaneval"));
        registry.register("Coding", "HumanEval+", named("humaneval-plus"));

        let hit = |task: &str| registry.resolve("CODING", task).map(|h| h.descriptor().name.clone());
        assert_eq!(hit("HumanEval").as_deref(), Some("humaneval"));
        assert_eq!(hit("humaneval+ pass@1").as_deref(), Some("humaneval-plus"));
        assert_eq!(hit("SWE-bench Verified").as_deref(), Some("generic"));
        assert!(registry.resolve("vision", "MMMU").is_none());
    }

    #[test]
    fn register_replaces_same_key() {
        let mut registry = HarnessRegistry::new();
        registry.register("reasoning-math", "gsm8k", named("old"));
        registry.register("reasoning-math", "GSM8K", named("new"));
        assert_eq!(registry.len(), 1);
        let h = registry.resolve("reasoning-math", "gsm8k").unwrap();
        assert_eq!(h.descriptor().name, "new");
    }

    #[test]
    fn loads_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harnesses.json");
        std::fs::write(
            &path,
            r#"{"harnesses": [{
                "domain": "coding",
                "task_prefix": "humaneval",
                "descriptor": {"name": "humaneval", "cmd": "python -m humaneval", "independent_units": true},
                "command": {"program": "python", "args": ["-m", "humaneval"]}
            }]}"#,
        )
        .unwrap();

        let registry = HarnessRegistry::from_file(&path).unwrap();
        let h = registry.resolve("coding", "HumanEval").unwrap();
        assert!(h.descriptor().independent_units);

        std::fs::write(&path, r#"{"harnesses": [{"domain": "", "descriptor": {"name": "x", "cmd": "x"}, "command": {"program": "x"}}]}"#).unwrap();
        assert!(HarnessRegistry::from_file(&path).is_err());
    }
}
