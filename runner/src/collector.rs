use globset::{GlobBuilder, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Glob {pattern} is invalid: {source}")]
    InvalidGlob {
        pattern: String,
        source: globset::Error,
    },
}

fn is_glob(component: &str) -> bool {
    component.contains(|c: char| matches!(c, '*' | '?' | '[' | '{'))
}

/// split a pattern into the literal directory to walk and whether anything is left to match
fn walk_root(pattern: &str) -> (PathBuf, bool) {
    let mut root = PathBuf::new();

    for component in Path::new(pattern).components() {
        match component {
            Component::Normal(part) if is_glob(&part.to_string_lossy()) => return (root, true),
            component => root.push(component),
        }
    }

    (root, false)
}

fn matcher(pattern: &str) -> Result<GlobMatcher, CollectorError> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|source| CollectorError::InvalidGlob {
            pattern: pattern.to_owned(),
            source,
        })
}

/// Expand a single path pattern into every matching file, sorted.
///
/// A pattern without glob characters yields itself if it exists.
pub fn expand(pattern: &str) -> Result<Vec<PathBuf>, CollectorError> {
    let (root, has_glob) = walk_root(pattern);

    if !has_glob {
        return Ok(if root.exists() { vec![root] } else { Vec::new() });
    }

    let matcher = matcher(pattern)?;
    let relative = root.as_os_str().is_empty();
    let walk_from = if relative { PathBuf::from(".") } else { root };

    debug!("Expanding {pattern} from {}", walk_from.display());

    let mut builder = WalkBuilder::new(&walk_from);
    // job inputs are often hidden or ignored by vcs, never filter them
    builder.standard_filters(false);

    Ok(builder
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Failed to search for files matching {pattern}: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
        .map(DirEntry::into_path)
        .map(|path| {
            if relative {
                path.strip_prefix(".").map(Path::to_path_buf).unwrap_or(path)
            } else {
                path
            }
        })
        .filter(|path| matcher.is_match(path))
        .sorted()
        .collect_vec())
}

/// expand every pattern, keeping first-seen order and dropping duplicates
pub fn expand_all<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<PathBuf>, CollectorError> {
    let mut paths = Vec::new();

    for pattern in patterns {
        paths.extend(expand(pattern.as_ref())?);
    }

    Ok(paths.into_iter().unique().collect_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "jobs: []\n").unwrap();
    }

    #[test]
    fn expands_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "b.yaml");
        touch(dir.path(), "a.yaml");
        touch(dir.path(), "notes.txt");
        touch(dir.path(), "nested/c.yaml");

        let pattern = format!("{}/*.yaml", dir.path().display());
        let paths = expand(&pattern).unwrap();

        assert_eq!(
            paths,
            vec![dir.path().join("a.yaml"), dir.path().join("b.yaml")]
        );
    }

    #[test]
    fn double_star_descends() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.yaml");
        touch(dir.path(), "nested/deeper/c.yaml");

        let pattern = format!("{}/**/*.yaml", dir.path().display());
        let paths = expand(&pattern).unwrap();

        assert_eq!(
            paths,
            vec![
                dir.path().join("a.yaml"),
                dir.path().join("nested/deeper/c.yaml")
            ]
        );
    }

    #[test]
    fn literal_paths_pass_through_when_present() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "jobs.yaml");

        let present = dir.path().join("jobs.yaml");
        let missing = dir.path().join("missing.yaml");

        assert_eq!(expand(&present.to_string_lossy()).unwrap(), vec![present]);
        assert!(expand(&missing.to_string_lossy()).unwrap().is_empty());
    }

    #[test]
    fn duplicates_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.yaml");

        let glob = format!("{}/*.yaml", dir.path().display());
        let literal = dir.path().join("a.yaml").to_string_lossy().into_owned();

        assert_eq!(expand_all(&[glob, literal]).unwrap().len(), 1);
    }

    #[test]
    fn invalid_glob_is_reported() {
        assert!(matches!(
            expand("jobs/[.yaml"),
            Err(CollectorError::InvalidGlob { .. })
        ));
    }
}
