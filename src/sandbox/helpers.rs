//! Trusted helper resolution.
//!
//! Helpers are developer-authored source fragments living under a fixed
//! root. Model-supplied helper names are validated before touching the
//! filesystem, and the working-directory scoping applied to sandboxed
//! reads never applies here.

use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use super::error::{Result, SandboxError};

/// Attribution marker placed between concatenated fragments.
fn marker(label: &str) -> String {
    format!("\n\n//---- {} ----\n\n", label)
}

/// Loads helpers by name from a trusted root directory.
#[derive(Debug, Clone)]
pub struct HelperLoader {
    root: PathBuf,
}

impl HelperLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read a single helper's source.
    pub fn read(&self, name: &str) -> Result<String> {
        let relative = validate_helper_name(name)?;
        let path = self.root.join(relative);

        match fs::read_to_string(&path) {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SandboxError::HelperNotFound {
                    name: name.to_string(),
                    path,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve `names` in order and append `code`, producing one
    /// compilation unit.
    ///
    /// Every name is validated before any helper is read, so a bad name
    /// anywhere in the list means no file is touched.
    pub fn resolve(&self, names: &[String], code: &str) -> Result<String> {
        for name in names {
            validate_helper_name(name)?;
        }

        let mut unit = String::new();
        for name in names {
            let contents = self.read(name)?;
            debug!(helper = %name, bytes = contents.len(), "Resolved helper");
            unit.push_str(&marker(&format!("helper: {}", name)));
            unit.push_str(&contents);
        }
        unit.push_str(&marker("code"));
        unit.push_str(code);

        Ok(unit)
    }

    /// List helper names (relative to the root, `/`-separated), sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if self.root.is_dir() {
            collect(&self.root, &self.root, &mut names)?;
        }
        names.sort();
        Ok(names)
    }
}

fn collect(root: &Path, dir: &Path, names: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect(root, &path, names)?;
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        // Only surface names that would pass validation.
        if validate_helper_name(&name).is_ok() {
            names.push(name);
        }
    }
    Ok(())
}

/// Check a helper name and return it as a relative path.
///
/// Allowed characters are ASCII alphanumerics, `.`, `_`, `-` and `/`.
/// Empty names, absolute names and any `..` segment are rejected.
pub fn validate_helper_name(name: &str) -> Result<&Path> {
    let violation = || SandboxError::PathViolation {
        name: name.to_string(),
    };

    if name.is_empty() || name.starts_with('/') {
        return Err(violation());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'))
    {
        return Err(violation());
    }

    let path = Path::new(name);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(violation()),
        }
    }
    if name.split('/').any(|segment| segment == "..") {
        return Err(violation());
    }

    Ok(path)
}
