//! Durable rule storage
//!
//! One JSON file holding an array of rules. Every operation re-reads the
//! file and (for mutations) rewrites it whole; there is no in-memory
//! cache, so concurrent writers are last-write-wins.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::rule::{Rule, RuleInput};

/// Storage errors
///
/// Only surfaced by mutating operations; [`RuleStore::load`] treats every
/// failure as an empty store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// File-backed rule store
#[derive(Debug, Clone)]
pub struct RuleStore {
    path: PathBuf,
}

impl RuleStore {
    /// Create a store rooted at the given rules file
    ///
    /// The file is created lazily on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all rules
    ///
    /// A missing file, unreadable file, or content that is not a JSON
    /// array of rules all yield an empty list. Availability is favored
    /// over durability here: a corrupted store loses its rules silently
    /// rather than blocking startup.
    pub async fn load(&self) -> Vec<Rule> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Rules file not readable, treating as empty");
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<Rule>>(&content) {
            Ok(rules) => rules,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Rules file unparsable, treating as empty");
                Vec::new()
            }
        }
    }

    /// Overwrite the store with the given rules
    ///
    /// Creates containing directories as needed. Writes to a temp file
    /// and renames so readers never observe a partial file.
    pub async fn save(&self, rules: &[Rule]) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut content = serde_json::to_string_pretty(rules)?;
        content.push('\n');

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &self.path).await?;

        debug!(path = %self.path.display(), count = rules.len(), "Saved rules");
        Ok(())
    }

    /// Create a rule, assigning a fresh id and timestamp
    pub async fn add(&self, input: RuleInput) -> StoreResult<Rule> {
        let mut rules = self.load().await;
        let rule = Rule::from_input(input);
        rules.push(rule.clone());
        self.save(&rules).await?;
        Ok(rule)
    }

    /// Remove a rule by id
    ///
    /// Returns whether a rule was removed. An unknown id is a no-op,
    /// not an error, and leaves the file untouched.
    pub async fn remove(&self, id: &str) -> StoreResult<bool> {
        let mut rules = self.load().await;
        let before = rules.len();
        rules.retain(|r| r.id != id);

        if rules.len() == before {
            return Ok(false);
        }

        self.save(&rules).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> RuleStore {
        RuleStore::new(dir.path().join("bridge").join("rules.json"))
    }

    fn input(entity: &str, to: Option<&str>, one_shot: bool) -> RuleInput {
        RuleInput {
            entity_id: entity.to_string(),
            from_state: None,
            to_state: to.map(String::from),
            message: "notify me".to_string(),
            one_shot,
        }
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_garbage_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, "not json at all {{{").unwrap();
        let store = RuleStore::new(&path);
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_non_array_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, r#"{"rules": []}"#).unwrap();
        let store = RuleStore::new(&path);
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_add_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let created = store
            .add(input("light.bedroom", Some("on"), true))
            .await
            .unwrap();
        assert!(!created.id.is_empty());

        let rules = store.load().await;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, created.id);
        assert_eq!(rules[0].entity_id, "light.bedroom");
        assert_eq!(rules[0].message, "notify me");
        assert!(rules[0].one_shot);
    }

    #[tokio::test]
    async fn test_add_preserves_existing_rules_in_order() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let first = store.add(input("light.a", None, false)).await.unwrap();
        let second = store.add(input("light.b", None, false)).await.unwrap();

        let rules = store.load().await;
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, first.id);
        assert_eq!(rules[1].id, second.id);
    }

    #[tokio::test]
    async fn test_remove_present_id() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let keep = store.add(input("light.a", None, false)).await.unwrap();
        let gone = store.add(input("light.b", None, false)).await.unwrap();

        assert!(store.remove(&gone.id).await.unwrap());

        let rules = store.load().await;
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, keep.id);
    }

    #[tokio::test]
    async fn test_remove_unknown_id_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.add(input("light.a", None, false)).await.unwrap();

        assert!(!store.remove("no_such_id").await.unwrap());
        assert_eq!(store.load().await.len(), 1);
    }

    #[tokio::test]
    async fn test_save_writes_pretty_json_with_trailing_newline() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.add(input("light.a", Some("on"), false)).await.unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert!(content.ends_with('\n'));
        assert!(content.contains("\"entityId\": \"light.a\""));
    }

    #[tokio::test]
    async fn test_save_creates_missing_directories() {
        let dir = TempDir::new().unwrap();
        let store = RuleStore::new(dir.path().join("a").join("b").join("rules.json"));
        store.save(&[]).await.unwrap();
        assert!(store.path().exists());
    }
}
