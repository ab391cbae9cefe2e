//! Model catalog
//!
//! Client-supplied model names are mapped onto provider models: blank names
//! and unknown names fall back to the default, configured aliases are
//! rewritten, and anything in the catalog passes through.

use std::collections::HashMap;
use std::path::Path;

use tracing::{info, warn};

use crate::config::ModelsConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub name: String,
    /// The requested name when it was replaced by the default
    pub substituted: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelCatalog {
    default: String,
    available: Vec<String>,
    aliases: HashMap<String, String>,
}

impl ModelCatalog {
    pub fn new(default: String, available: Vec<String>, aliases: HashMap<String, String>) -> Self {
        let mut catalog: Vec<String> = Vec::new();
        for model in std::iter::once(default.clone()).chain(available) {
            if !catalog.contains(&model) {
                catalog.push(model);
            }
        }
        Self {
            default,
            available: catalog,
            aliases,
        }
    }

    /// Build from config, reading the catalog file when one is configured.
    pub fn from_config(config: &ModelsConfig) -> common::Result<Self> {
        let mut available = match &config.catalog_file {
            Some(path) => read_catalog(path)?,
            None => Vec::new(),
        };
        available.extend(config.available.iter().cloned());
        let catalog = Self::new(config.default.clone(), available, config.aliases.clone());
        info!(
            default = %catalog.default,
            models = catalog.available.len(),
            aliases = catalog.aliases.len(),
            "model catalog loaded"
        );
        Ok(catalog)
    }

    pub fn default_model(&self) -> &str {
        &self.default
    }

    pub fn available(&self) -> &[String] {
        &self.available
    }

    pub fn resolve(&self, requested: Option<&str>) -> ResolvedModel {
        let Some(requested) = requested.map(str::trim).filter(|m| !m.is_empty()) else {
            return ResolvedModel {
                name: self.default.clone(),
                substituted: None,
            };
        };
        if let Some(target) = self.aliases.get(requested) {
            return ResolvedModel {
                name: target.clone(),
                substituted: None,
            };
        }
        if self.available.iter().any(|m| m == requested) {
            return ResolvedModel {
                name: requested.to_string(),
                substituted: None,
            };
        }
        warn!(requested, default = %self.default, "unknown model, using default");
        ResolvedModel {
            name: self.default.clone(),
            substituted: Some(requested.to_string()),
        }
    }
}

/// One model per line; blank lines and `#` comments are skipped. A missing
/// file contributes nothing.
fn read_catalog(path: &Path) -> common::Result<Vec<String>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "model catalog file not found");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(common::Error::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
