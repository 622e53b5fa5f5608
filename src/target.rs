//! Target resolution: page identifiers, navigable URLs, and the screenshot
//! artifact names derived from them.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

/// Base location page identifiers are resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressBase {
    /// Local directory; identifiers resolve to `file://` URLs.
    LocalDir(PathBuf),
    /// HTTP origin such as `http://localhost:8080`.
    HttpOrigin(String),
}

impl AddressBase {
    /// Resolve a page identifier to a navigable URL. Identifiers that already
    /// carry a scheme are used verbatim.
    pub fn resolve(&self, name: &str) -> Result<String, TargetError> {
        if name.contains("://") {
            return Ok(name.to_string());
        }
        match self {
            AddressBase::LocalDir(root) => {
                let root = if root.is_absolute() {
                    root.clone()
                } else {
                    env::current_dir()
                        .map_err(|source| TargetError::CurrentDir { source })?
                        .join(root)
                };
                Ok(format!("file://{}", root.join(name).display()))
            }
            AddressBase::HttpOrigin(origin) => Ok(format!(
                "{}/{}",
                origin.trim_end_matches('/'),
                name.trim_start_matches('/')
            )),
        }
    }
}

/// A single page to audit, resolved once up front and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Identifier the target was configured with, used to tag diagnostics.
    pub name: String,
    /// Fully resolved URL handed to the browser.
    pub url: String,
    /// Screenshot file name, `<prefix><slug>.png`.
    pub artifact: String,
}

impl Target {
    pub fn resolve(name: &str, base: &AddressBase, prefix: &str) -> Result<Self, TargetError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TargetError::EmptyName);
        }
        let url = base.resolve(name)?;
        let artifact = format!("{prefix}{}.png", artifact_slug(name));
        Ok(Target {
            name: name.to_string(),
            url,
            artifact,
        })
    }

    /// Resolve an ordered list of identifiers, preserving order.
    pub fn resolve_all(
        names: &[String],
        base: &AddressBase,
        prefix: &str,
    ) -> Result<Vec<Self>, TargetError> {
        names
            .iter()
            .map(|name| Target::resolve(name, base, prefix))
            .collect()
    }
}

/// Deterministic artifact stem: the identifier minus its final extension,
/// with every non-alphanumeric character mapped to `_`.
fn artifact_slug(name: &str) -> String {
    let stem = match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    };
    stem.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Errors raised while resolving targets.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("empty target name")]
    EmptyName,
    #[error("could not determine current directory: {source}")]
    CurrentDir {
        #[source]
        source: std::io::Error,
    },
}
