/// Decides whether a changed path is worth a reload.
///
/// A path passes when it ends with a watched extension and none of the ignore
/// patterns match its path relative to the nearest watch root. Relative paths
/// keep patterns such as `.git/` portable between checkouts and platforms.
use std::path::{Path, PathBuf};

use regex::Regex;

#[derive(Debug)]
enum IgnorePattern {
    /// `**pattern**`: the pattern appears anywhere in the relative path.
    Anywhere(String),
    /// Contains `*`: unanchored regex with each `*` standing for any run of characters.
    Wildcard(Regex),
    /// Plain substring containment.
    Contains(String),
}

impl IgnorePattern {
    fn parse(raw: &str) -> Self {
        let pattern = normalize_separators(raw);

        if pattern.len() > 4 && pattern.starts_with("**") && pattern.ends_with("**") {
            return IgnorePattern::Anywhere(pattern[2..pattern.len() - 2].to_string());
        }

        if pattern.contains('*') {
            let source = pattern
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            // Every literal is escaped, so this only fails on pathological sizes.
            return match Regex::new(&source) {
                Ok(re) => IgnorePattern::Wildcard(re),
                Err(_) => IgnorePattern::Contains(pattern),
            };
        }

        IgnorePattern::Contains(pattern)
    }

    fn matches(&self, relative: &str) -> bool {
        match self {
            // Leading slash lets `**/.git/**` match a top-level `.git/...`.
            IgnorePattern::Anywhere(inner) => format!("/{relative}").contains(inner.as_str()),
            IgnorePattern::Wildcard(re) => re.is_match(relative),
            IgnorePattern::Contains(needle) => relative.contains(needle.as_str()),
        }
    }
}

#[derive(Debug)]
pub struct WatchFilter {
    /// Absolute forms of each watch root (as configured, and canonicalized).
    roots: Vec<PathBuf>,
    extensions: Vec<String>,
    patterns: Vec<IgnorePattern>,
    cwd: Option<PathBuf>,
}

impl WatchFilter {
    pub fn new(roots: &[PathBuf], extensions: &[String], ignore_patterns: &[String]) -> Self {
        let cwd = std::env::current_dir().ok();

        let mut absolute_roots = Vec::new();
        for root in roots {
            let absolute = match (&cwd, root.is_relative()) {
                (Some(cwd), true) => cwd.join(root),
                _ => root.clone(),
            };
            // Notification backends may report canonical paths (e.g. /private/var on macOS).
            if let Ok(canonical) = absolute.canonicalize() {
                if canonical != absolute {
                    absolute_roots.push(canonical);
                }
            }
            absolute_roots.push(absolute);
        }

        Self {
            roots: absolute_roots,
            extensions: extensions.to_vec(),
            patterns: ignore_patterns.iter().map(|p| IgnorePattern::parse(p)).collect(),
            cwd,
        }
    }

    pub fn should_process(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        if !self.extensions.iter().any(|ext| text.ends_with(ext.as_str())) {
            return false;
        }

        let relative = self.relative_path(path);
        !self.patterns.iter().any(|p| p.matches(&relative))
    }

    /// Path relative to the nearest (longest) containing watch root, with `/`
    /// separators. Paths outside every root fall back to the working directory,
    /// then to their file name.
    pub fn relative_path(&self, path: &Path) -> String {
        let absolute = match (&self.cwd, path.is_relative()) {
            (Some(cwd), true) => cwd.join(path),
            _ => path.to_path_buf(),
        };

        let nearest = self
            .roots
            .iter()
            .filter_map(|root| {
                absolute
                    .strip_prefix(root)
                    .ok()
                    .map(|rel| (root.as_os_str().len(), rel))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, rel)| rel.to_path_buf());

        let relative = nearest
            .or_else(|| {
                self.cwd
                    .as_ref()
                    .and_then(|cwd| absolute.strip_prefix(cwd).ok())
                    .map(Path::to_path_buf)
            })
            .or_else(|| absolute.file_name().map(PathBuf::from))
            .unwrap_or(absolute);

        normalize_separators(&relative.to_string_lossy())
    }
}

fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}
