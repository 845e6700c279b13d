//! Named positive/negative prompt pairs kept in a JSON file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ComfyError, Result};

/// Key that always resolves and can't be deleted.
pub const DEFAULT_PROMPT_KEY: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPair {
    #[serde(default)]
    pub positive: String,
    #[serde(default)]
    pub negative: String,
}

impl PromptPair {
    pub fn new(positive: impl Into<String>, negative: impl Into<String>) -> Self {
        Self {
            positive: positive.into(),
            negative: negative.into(),
        }
    }
}

impl Default for PromptPair {
    fn default() -> Self {
        Self::new(
            "high quality, fine details, realistic, high definition photography",
            "low quality, blurry, distorted, error, noise",
        )
    }
}

/// Prompt pairs backed by a file such as `prompts.json`.
///
/// Edits stay in memory until [`save`](Self::save).
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    path: PathBuf,
    prompts: IndexMap<String, PromptPair>,
}

impl PromptLibrary {
    /// Load the library at `path`. A missing file yields a library holding
    /// only the built-in default pair.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let prompts = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No prompt file; using defaults");
                IndexMap::from([(DEFAULT_PROMPT_KEY.to_string(), PromptPair::default())])
            }
            Err(e) => {
                return Err(ComfyError::io(format!("Failed to read {}", path.display()), e))
            }
        };
        Ok(Self { path, prompts })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries in file order.
    pub fn list(&self) -> impl Iterator<Item = (&str, &PromptPair)> {
        self.prompts.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&PromptPair> {
        self.prompts.get(key)
    }

    /// The pair for `key`, falling back to the `default` entry and then to
    /// the built-in pair.
    pub fn resolve(&self, key: Option<&str>) -> PromptPair {
        let key = key.unwrap_or(DEFAULT_PROMPT_KEY);
        if let Some(pair) = self.prompts.get(key) {
            return pair.clone();
        }
        if key != DEFAULT_PROMPT_KEY {
            tracing::warn!(key, "Prompt not found; using default");
        }
        self.prompts
            .get(DEFAULT_PROMPT_KEY)
            .cloned()
            .unwrap_or_default()
    }

    /// Insert or overwrite `key`. Returns the previous pair, if any.
    pub fn add(&mut self, key: impl Into<String>, pair: PromptPair) -> Option<PromptPair> {
        self.prompts.insert(key.into(), pair)
    }

    /// Remove `key`. The default entry is protected.
    pub fn delete(&mut self, key: &str) -> Result<PromptPair> {
        if key == DEFAULT_PROMPT_KEY {
            return Err(ComfyError::InvalidConfig(
                "the default prompt cannot be deleted".into(),
            ));
        }
        self.prompts
            .shift_remove(key)
            .ok_or_else(|| ComfyError::NotFound(format!("prompt '{}'", key)))
    }

    /// Write the library back to its file through a temp file and rename.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| ComfyError::io(format!("Failed to create {}", parent.display()), e))?;
        }

        let text = serde_json::to_string_pretty(&self.prompts)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text)
            .map_err(|e| ComfyError::io(format!("Failed to write {}", tmp.display()), e))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| ComfyError::io(format!("Failed to replace {}", self.path.display()), e))?;

        tracing::debug!(path = %self.path.display(), entries = self.prompts.len(), "Prompts saved");
        Ok(())
    }
}
