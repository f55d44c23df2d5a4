//! Which workspace files take part in synchronization.

use crate::config::RepositoryConfig;
use crate::error::{Result, SyncError};
use crate::relay::naming::SpecialNames;
use crate::relay::TEMP_PREFIX;
use glob::Pattern;

#[derive(Debug, Clone)]
pub struct FileFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
    extensions: Vec<String>,
    names: SpecialNames,
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| Pattern::new(p).map_err(|e| SyncError::Config(format!("bad pattern '{}': {}", p, e))))
        .collect()
}

impl FileFilter {
    pub fn new(
        include: &[String],
        exclude: &[String],
        extensions: &[String],
        names: SpecialNames,
    ) -> Result<Self> {
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_lowercase())
                .collect(),
            names,
        })
    }

    pub fn from_config(config: &RepositoryConfig) -> Result<Self> {
        Self::new(
            &config.include,
            &config.exclude,
            &config.extensions,
            config.names.clone(),
        )
    }

    /// Patterns match either the whole resource path or its file name.
    pub fn accepts(&self, resource: &str) -> bool {
        let name = resource.rsplit('/').next().unwrap_or(resource);
        if name.starts_with(TEMP_PREFIX) || self.names.is_special(resource) {
            return false;
        }
        if !self.extensions.is_empty() {
            let extension = match name.rsplit_once('.') {
                Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
                _ => return false,
            };
            if !self.extensions.contains(&extension) {
                return false;
            }
        }
        let matches = |p: &Pattern| p.matches(resource) || p.matches(name);
        if !self.include.is_empty() && !self.include.iter().any(matches) {
            return false;
        }
        !self.exclude.iter().any(matches)
    }
}
