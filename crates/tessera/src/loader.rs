//! Template loaders.
//!
//! A loader resolves a template name to source text for `include`, `extends`,
//! `import`, and the by-name render entry points.

use std::path::{Component, Path, PathBuf};

use ahash::AHashMap;

use crate::error::{Error, ErrorKind};

/// Resolved template source.
#[derive(Debug, Clone)]
pub struct TemplateSource {
    pub source: String,
    /// The on-disk path the source came from, when there is one.
    pub filename: Option<String>,
}

impl TemplateSource {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            filename: None,
        }
    }
}

/// Resolves template names to source text.
///
/// Implementations must be thread-safe: one environment may serve concurrent
/// renders, each of which may hit the loader.
pub trait Loader: Send + Sync {
    /// Returns the source for `name`, or a `TemplateNotFound` error.
    fn get_source(&self, name: &str) -> Result<TemplateSource, Error>;

    /// Whether a previously loaded template is still current.
    ///
    /// Consulted before the compiled-template cache is reused. The default
    /// says yes, which keeps fully static loaders cache-friendly.
    fn up_to_date(&self, _name: &str) -> bool {
        true
    }
}

pub(crate) fn not_found(name: &str) -> Error {
    Error::new(ErrorKind::TemplateNotFound, format!("template {name:?} not found"))
}

/// A loader backed by an in-memory name-to-source mapping; owns both.
#[derive(Debug, Default)]
pub struct DictLoader {
    templates: AHashMap<String, String>,
}

impl DictLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_template(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.templates.insert(name.into(), source.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DictLoader {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut loader = Self::new();
        for (name, source) in iter {
            loader.add_template(name, source);
        }
        loader
    }
}

impl Loader for DictLoader {
    fn get_source(&self, name: &str) -> Result<TemplateSource, Error> {
        self.templates
            .get(name)
            .map(|source| TemplateSource::new(source.clone()))
            .ok_or_else(|| not_found(name))
    }
}

/// A loader rooted at one or more search paths.
///
/// Template names use `/` separators and may not escape the roots: absolute
/// names and `..` components are rejected.
#[derive(Debug)]
pub struct FileSystemLoader {
    roots: Vec<PathBuf>,
}

impl FileSystemLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            roots: vec![root.into()],
        }
    }

    pub fn with_paths<P: Into<PathBuf>>(roots: impl IntoIterator<Item = P>) -> Self {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
        }
    }

    /// Converts a template name into a safe relative path.
    fn safe_relative(name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        let mut out = PathBuf::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                // no absolute names, drive prefixes, or parent traversal
                _ => return None,
            }
        }
        if out.as_os_str().is_empty() { None } else { Some(out) }
    }
}

impl Loader for FileSystemLoader {
    fn get_source(&self, name: &str) -> Result<TemplateSource, Error> {
        let Some(relative) = Self::safe_relative(name) else {
            return Err(Error::new(
                ErrorKind::TemplateNotFound,
                format!("template name {name:?} is not a safe path"),
            ));
        };
        for root in &self.roots {
            let candidate = root.join(&relative);
            match std::fs::read_to_string(&candidate) {
                Ok(source) => {
                    return Ok(TemplateSource {
                        source,
                        filename: Some(candidate.to_string_lossy().into_owned()),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Error::new(
                        ErrorKind::TemplateNotFound,
                        format!("failed to read template {name:?}: {e}"),
                    ));
                }
            }
        }
        Err(not_found(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_loader_round_trip() {
        let loader: DictLoader = [("a.txt", "hello")].into_iter().collect();
        assert_eq!(loader.get_source("a.txt").unwrap().source, "hello");
        assert_eq!(loader.get_source("b.txt").unwrap_err().kind(), ErrorKind::TemplateNotFound);
    }

    #[test]
    fn traversal_is_rejected() {
        assert!(FileSystemLoader::safe_relative("../etc/passwd").is_none());
        assert!(FileSystemLoader::safe_relative("/etc/passwd").is_none());
        assert!(FileSystemLoader::safe_relative("a/../../b").is_none());
        assert!(FileSystemLoader::safe_relative("sub/page.html").is_some());
        assert!(FileSystemLoader::safe_relative("./page.html").is_some());
    }
}
