//! On-disk workflow templates, namespaced per server.
//!
//! Templates live in `<root>/<host>_<port>/<name>.json`. Loads and deletes
//! fall back to `<root>/<name>.json` so templates shared by every server
//! can sit in the root.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{ComfyError, Result};
use crate::session::normalize_base_url;
use crate::workflow::{basic_template, WorkflowTemplate};

/// Checkpoint written into the generated default template.
pub const DEFAULT_CHECKPOINT: &str = "v1-5-pruned-emaonly.safetensors";

/// Directory name for a server: its host, port and path with `:` and `/`
/// replaced by `_`.
pub fn server_namespace(server_url: &str) -> Result<String> {
    let base = normalize_base_url(server_url)?;
    let url = reqwest::Url::parse(&base)
        .map_err(|e| ComfyError::InvalidConfig(format!("invalid server URL '{}': {}", server_url, e)))?;

    let mut netloc = url.host_str().unwrap_or_default().to_string();
    if let Some(port) = url.port() {
        netloc.push_str(&format!(":{}", port));
    }
    netloc.push_str(url.path().trim_end_matches('/'));
    Ok(netloc.replace([':', '/'], "_"))
}

#[derive(Debug, Clone)]
pub struct TemplateStore {
    root: PathBuf,
    server_dir: PathBuf,
}

impl TemplateStore {
    /// Store rooted at `root` for the server at `server_url`.
    pub fn new(root: impl Into<PathBuf>, server_url: &str) -> Result<Self> {
        let root = root.into();
        let server_dir = root.join(server_namespace(server_url)?);
        Ok(Self { root, server_dir })
    }

    /// Store without a server namespace.
    pub fn shared(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            server_dir: root.clone(),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn server_dir(&self) -> &Path {
        &self.server_dir
    }

    /// Validate and write `template` under `name` in the server directory.
    pub fn save(&self, name: &str, template: &WorkflowTemplate) -> Result<PathBuf> {
        check_name(name)?;
        template.validate()?;

        fs::create_dir_all(&self.server_dir).map_err(|e| {
            ComfyError::io(format!("Failed to create {}", self.server_dir.display()), e)
        })?;
        let path = self.server_dir.join(format!("{}.json", name));
        let text = serde_json::to_string_pretty(&template.to_value())?;
        fs::write(&path, text)
            .map_err(|e| ComfyError::io(format!("Failed to write {}", path.display()), e))?;

        tracing::info!(template = name, path = %path.display(), "Template saved");
        Ok(path)
    }

    /// Load `name`, preferring the server directory over the root.
    pub fn load(&self, name: &str) -> Result<WorkflowTemplate> {
        let path = self.locate(name)?;
        let text = fs::read_to_string(&path)
            .map_err(|e| ComfyError::io(format!("Failed to read {}", path.display()), e))?;
        tracing::debug!(template = name, path = %path.display(), "Loading template");
        WorkflowTemplate::from_json_str(name, &text)
    }

    /// Template names from the server directory and the root, sorted and
    /// without duplicates.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = json_stems(&self.server_dir)?;
        if self.server_dir != self.root {
            names.extend(json_stems(&self.root)?);
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Delete `name` from the server directory, or from the root if it only
    /// exists there.
    pub fn delete(&self, name: &str) -> Result<PathBuf> {
        let path = self.locate(name)?;
        fs::remove_file(&path)
            .map_err(|e| ComfyError::io(format!("Failed to delete {}", path.display()), e))?;
        tracing::info!(template = name, path = %path.display(), "Template deleted");
        Ok(path)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.locate(name).is_ok()
    }

    /// Save the standard text-to-image graph for `checkpoint` as `name`.
    pub fn create_txt2img(&self, name: &str, checkpoint: &str) -> Result<PathBuf> {
        if checkpoint.trim().is_empty() {
            return Err(ComfyError::InvalidConfig("checkpoint name is empty".into()));
        }
        self.save(name, &basic_template(name, checkpoint))
    }

    /// Load `name`, creating the standard text-to-image template under that
    /// name first if it does not exist anywhere.
    pub fn ensure_default(&self, name: &str) -> Result<WorkflowTemplate> {
        if self.exists(name) {
            return self.load(name);
        }
        let template = basic_template(name, DEFAULT_CHECKPOINT);
        self.save(name, &template)?;
        tracing::info!(template = name, "Created default SaveImage template");
        Ok(template)
    }

    fn locate(&self, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        let file = format!("{}.json", name);
        let primary = self.server_dir.join(&file);
        if primary.is_file() {
            return Ok(primary);
        }
        let fallback = self.root.join(&file);
        if fallback.is_file() {
            return Ok(fallback);
        }
        Err(ComfyError::NotFound(format!(
            "template '{}' (checked {} and {})",
            name,
            primary.display(),
            fallback.display()
        )))
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(ComfyError::Template(format!("invalid template name '{}'", name)));
    }
    Ok(())
}

fn json_stems(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ComfyError::io(format!("Failed to list {}", dir.display()), e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_from_server_url() {
        assert_eq!(server_namespace("http://127.0.0.1:8188").unwrap(), "127.0.0.1_8188");
        assert_eq!(server_namespace("http://gpu-box:8188/api/").unwrap(), "gpu-box_8188");
        assert_eq!(server_namespace("https://comfy.example.com/proxy").unwrap(), "comfy.example.com_proxy");
        assert_eq!(server_namespace("localhost:8188").unwrap(), "localhost_8188");
    }

    #[test]
    fn rejects_path_like_names() {
        assert!(check_name("../escape").is_err());
        assert!(check_name("").is_err());
        assert!(check_name("portrait-v2").is_ok());
    }
}
