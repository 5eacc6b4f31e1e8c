//! File lookup for the CommonJS `require` the prelude gives scripts.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Cannot find module '{0}'")]
    NotFound(String),
    #[error("failed to read module {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to determine working directory: {0}")]
    WorkingDir(io::Error),
}

/// Absolute, lexically normalized form of `path`, relative to the working directory.
///
/// Does not touch the file: a missing script is reported by `require` itself
/// so it surfaces as a load failure.
pub fn absolute_script_path(path: &Path) -> Result<PathBuf, ResolveError> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(ResolveError::WorkingDir)?
            .join(path)
    };
    Ok(normalize(&joined))
}

/// Resolve `specifier` as required from a module living in `base_dir`.
pub fn resolve_module(base_dir: &Path, specifier: &str) -> Result<PathBuf, ResolveError> {
    let not_found = || ResolveError::NotFound(specifier.to_string());
    if specifier.is_empty() {
        return Err(not_found());
    }

    if is_path_like(specifier) {
        let candidate = normalize(&base_dir.join(specifier));
        return resolve_file_or_dir(&candidate).ok_or_else(not_found);
    }

    for dir in base_dir.ancestors() {
        if dir.file_name().is_some_and(|name| name == "node_modules") {
            continue;
        }
        let candidate = dir.join("node_modules").join(specifier);
        if let Some(found) = resolve_file_or_dir(&candidate) {
            return Ok(found);
        }
    }
    Err(not_found())
}

/// Module source with a leading `#!` line blanked out.
pub fn read_module(path: &Path) -> Result<String, ResolveError> {
    let source = fs::read_to_string(path).map_err(|source| ResolveError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if source.starts_with("#!") {
        let body = source.find('\n').map(|idx| &source[idx..]).unwrap_or("");
        return Ok(body.to_string());
    }
    Ok(source)
}

fn is_path_like(specifier: &str) -> bool {
    specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier == "."
        || specifier == ".."
        || Path::new(specifier).is_absolute()
}

fn resolve_file_or_dir(candidate: &Path) -> Option<PathBuf> {
    resolve_file(candidate).or_else(|| resolve_dir(candidate))
}

fn resolve_file(candidate: &Path) -> Option<PathBuf> {
    if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }
    ["js", "json"].iter().find_map(|ext| {
        let mut with_ext = candidate.as_os_str().to_owned();
        with_ext.push(".");
        with_ext.push(ext);
        let with_ext = PathBuf::from(with_ext);
        with_ext.is_file().then_some(with_ext)
    })
}

fn resolve_dir(candidate: &Path) -> Option<PathBuf> {
    if !candidate.is_dir() {
        return None;
    }
    let main = fs::read_to_string(candidate.join("package.json"))
        .ok()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .and_then(|manifest| manifest.get("main")?.as_str().map(str::to_owned));
    if let Some(main) = main {
        let target = normalize(&candidate.join(main));
        if let Some(found) = resolve_file(&target).or_else(|| index_of(&target)) {
            return Some(found);
        }
    }
    index_of(candidate)
}

fn index_of(dir: &Path) -> Option<PathBuf> {
    let index = dir.join("index.js");
    index.is_file().then_some(index)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
