//! Git generator: parameters from repository directory and file scans
//!
//! The repository itself is an external collaborator reached through the
//! [`RepoService`] trait (the production implementation lives in the
//! operator crate and talks to the repository service over HTTP). This
//! module owns the generator semantics: glob selection with exclude-wins,
//! the `path` parameter sub-map, and JSON/YAML record extraction.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use serde_json::{json, Value};

#[cfg(test)]
use mockall::automock;

use appset_common::crd::{
    ApplicationSet, ApplicationSetTemplate, GeneratorSpec, GitGenerator, ParamMap,
};
use appset_common::utils::sanitize_dns_label;
use appset_common::{Error, Result};

use crate::Generator;

/// Default recheck cadence for repository scans
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(3 * 60);

/// Read access to a Git repository at a fixed revision.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RepoService: Send + Sync {
    /// All directory paths in the repository (relative, no leading slash).
    async fn get_directories(&self, repo_url: &str, revision: &str) -> Result<Vec<String>>;

    /// Contents of every file matching `pattern`, keyed by file path.
    async fn get_files(
        &self,
        repo_url: &str,
        revision: &str,
        pattern: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>>;
}

/// Git directory/file generator
pub struct GitGeneratorImpl {
    repos: Arc<dyn RepoService>,
}

impl GitGeneratorImpl {
    /// Create a generator backed by the given repository service.
    pub fn new(repos: Arc<dyn RepoService>) -> Self {
        Self { repos }
    }

    async fn generate_directory_params(&self, git: &GitGenerator) -> Result<Vec<ParamMap>> {
        let all_dirs = self
            .repos
            .get_directories(&git.repo_url, &git.revision)
            .await?;

        let mut includes = Vec::new();
        let mut excludes = Vec::new();
        for item in &git.directories {
            let pattern = Pattern::new(&item.path).map_err(|e| {
                Error::configuration(format!("invalid directory glob {:?}: {e}", item.path))
            })?;
            if item.exclude {
                excludes.push(pattern);
            } else {
                includes.push(pattern);
            }
        }

        // Globs match per path segment, as in `path.Match`: `*` stops at
        // `/`, `**` crosses directories
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::default()
        };

        let mut params = Vec::new();
        for dir in &all_dirs {
            let included = includes.iter().any(|p| p.matches_with(dir, options));
            // Exclude wins over any include matching the same path
            let excluded = excludes.iter().any(|p| p.matches_with(dir, options));
            if included && !excluded {
                params.push(directory_params(dir));
            }
        }
        Ok(params)
    }

    async fn generate_file_params(&self, git: &GitGenerator) -> Result<Vec<ParamMap>> {
        let mut params = Vec::new();
        for item in &git.files {
            let files = self
                .repos
                .get_files(&git.repo_url, &git.revision, &item.path)
                .await?;
            for (path, content) in files {
                params.extend(file_params(&path, &content)?);
            }
        }
        Ok(params)
    }
}

#[async_trait]
impl Generator for GitGeneratorImpl {
    async fn generate_params(
        &self,
        spec: &GeneratorSpec,
        _app_set: &ApplicationSet,
    ) -> Result<Vec<ParamMap>> {
        let git = spec.git.as_ref().ok_or(Error::EmptyGenerator)?;

        if !git.directories.is_empty() {
            self.generate_directory_params(git).await
        } else if !git.files.is_empty() {
            self.generate_file_params(git).await
        } else {
            Err(Error::configuration(
                "git generator needs either directories or files",
            ))
        }
    }

    fn get_template(&self, spec: &GeneratorSpec) -> Option<ApplicationSetTemplate> {
        spec.git.as_ref().map(|git| git.template.clone())
    }

    fn get_requeue_after(&self, spec: &GeneratorSpec) -> Duration {
        spec.git
            .as_ref()
            .and_then(|git| git.requeue_after_seconds)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEUE)
    }
}

/// The `path` sub-map for a matched directory.
fn directory_params(dir: &str) -> ParamMap {
    let basename = dir.rsplit('/').next().unwrap_or(dir);
    let segments: Vec<Value> = dir.split('/').map(|s| json!(s)).collect();

    let mut params = ParamMap::new();
    params.insert(
        "path".to_string(),
        json!({
            "path": dir,
            "basename": basename,
            "basenameNormalized": sanitize_dns_label(basename),
            "segments": segments,
        }),
    );
    params
}

/// Parse one matched file into parameter maps: an array yields one map per
/// element, an object yields a single map. Every map is augmented with the
/// `path` sub-map of the file's directory.
fn file_params(path: &str, content: &[u8]) -> Result<Vec<ParamMap>> {
    // serde_yaml handles JSON as well, YAML being a superset
    let parsed: Value = serde_yaml::from_slice(content)
        .map_err(|e| Error::remote("git", format!("parsing {path}: {e}")))?;

    let records = match parsed {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        other => {
            return Err(Error::remote(
                "git",
                format!("file {path} must contain an object or an array, got {other}"),
            ))
        }
    };

    let (dir, filename) = match path.rsplit_once('/') {
        Some((dir, file)) => (dir, file),
        None => ("", path),
    };
    let dir_basename = dir.rsplit('/').next().unwrap_or(dir);
    let segments: Vec<Value> = dir.split('/').map(|s| json!(s)).collect();

    let mut params = Vec::with_capacity(records.len());
    for record in records {
        let Value::Object(mut map) = record else {
            return Err(Error::remote(
                "git",
                format!("file {path} contains a non-object record"),
            ));
        };
        map.insert(
            "path".to_string(),
            json!({
                "path": dir,
                "basename": dir_basename,
                "basenameNormalized": sanitize_dns_label(dir_basename),
                "filename": filename,
                "filenameNormalized": sanitize_dns_label(filename),
                "segments": segments,
            }),
        );
        params.push(map);
    }
    Ok(params)
}
