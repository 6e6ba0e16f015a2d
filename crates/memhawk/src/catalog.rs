use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

const BUILTIN: &str = include_str!("../data/catalog.yaml");

/// One analysis operation the tool can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub category: String,
    pub description: String,
    /// Fixed arguments appended after the operation name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Set when the operation needs an argument only the user can choose.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<String>,
}

/// Immutable, ordered set of operations with lookup by id.
#[derive(Debug, Clone)]
pub struct Catalog {
    operations: Vec<Operation>,
    index: HashMap<String, usize>,
}

impl Catalog {
    pub fn builtin() -> AppResult<Self> {
        Self::from_yaml(BUILTIN, "built-in catalog")
    }

    pub async fn load(path: &Path) -> AppResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AppError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_yaml(&content, &path.display().to_string())
    }

    /// Built-in catalog unless `path` names a replacement.
    pub async fn load_or_builtin(path: Option<&Path>) -> AppResult<Self> {
        match path {
            Some(path) => Self::load(path).await,
            None => Self::builtin(),
        }
    }

    pub fn from_yaml(content: &str, source: &str) -> AppResult<Self> {
        let operations: Vec<Operation> = serde_yaml_ng::from_str(content)
            .map_err(|e| AppError::Config(format!("parse {source}: {e}")))?;
        Self::new(operations).map_err(|e| AppError::Config(format!("{source}: {e}")))
    }

    /// Trims surrounding whitespace from ids, then rejects blank and
    /// duplicate ones.
    pub fn new(mut operations: Vec<Operation>) -> Result<Self, String> {
        let mut index = HashMap::with_capacity(operations.len());
        for (i, op) in operations.iter_mut().enumerate() {
            let id = op.id.trim();
            if id.is_empty() {
                return Err(format!("operation #{} has no id", i + 1));
            }
            if id.len() != op.id.len() {
                op.id = id.to_string();
            }
            if index.insert(op.id.clone(), i).is_some() {
                return Err(format!("duplicate operation {:?}", op.id));
            }
        }
        Ok(Self { operations, index })
    }

    pub fn get(&self, id: &str) -> Option<&Operation> {
        self.index.get(id).and_then(|&i| self.operations.get(i))
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_parses() {
        let catalog = Catalog::builtin().unwrap();
        assert!(catalog.operations().len() > 40);
        let pslist = catalog.get("windows.pslist").unwrap();
        assert_eq!(pslist.category, "Process Analysis");
        assert!(pslist.args.is_empty());
        assert!(pslist.requires.is_none());
    }

    #[test]
    fn builtin_marks_operations_needing_user_input() {
        let catalog = Catalog::builtin().unwrap();
        for id in ["windows.dumpfiles", "windows.strings", "windows.registry.printkey"] {
            assert!(catalog.get(id).unwrap().requires.is_some(), "{id}");
        }
        assert_eq!(
            catalog.get("windows.vadregexscan").unwrap().args,
            vec!["--pattern", "MZ"]
        );
    }

    #[test]
    fn order_is_preserved() {
        let yaml = "
- {id: b, category: x, description: second}
- {id: a, category: x, description: first}
";
        let catalog = Catalog::from_yaml(yaml, "test").unwrap();
        let ids: Vec<&str> = catalog.operations().iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);
    }

    #[test]
    fn duplicate_ids_rejected() {
        let yaml = "
- {id: a, category: x, description: one}
- {id: a, category: x, description: two}
";
        let err = Catalog::from_yaml(yaml, "ops.yaml").unwrap_err();
        assert!(err.to_string().contains("duplicate operation \"a\""), "{err}");
    }

    #[test]
    fn ids_are_trimmed_for_lookup_and_command_line() {
        let yaml = "
- {id: ' windows.info ', category: x, description: padded}
";
        let catalog = Catalog::from_yaml(yaml, "test").unwrap();
        let op = catalog.get("windows.info").unwrap();
        assert_eq!(op.id, "windows.info");
        assert_eq!(catalog.operations()[0].id, "windows.info");
    }

    #[test]
    fn ids_equal_after_trimming_are_duplicates() {
        let yaml = "
- {id: a, category: x, description: one}
- {id: ' a', category: x, description: two}
";
        assert!(Catalog::from_yaml(yaml, "test").is_err());
    }

    #[test]
    fn unknown_operation_is_none() {
        let catalog = Catalog::builtin().unwrap();
        assert!(catalog.get("windows.nope").is_none());
    }

    #[tokio::test]
    async fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.yaml");
        tokio::fs::write(&path, "- {id: linux.pslist, category: Linux, description: processes}\n")
            .await
            .unwrap();

        let catalog = Catalog::load_or_builtin(Some(&path)).await.unwrap();
        assert_eq!(catalog.operations().len(), 1);
        assert!(catalog.get("linux.pslist").is_some());
    }
}
