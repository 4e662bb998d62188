use std::fs;
use std::path::{Path, PathBuf};

use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use tracing::{debug, warn};

use common::{error::AppError, utils::config::IndexerConfig};

/// Fraction of replacement characters tolerated after lossy UTF-8 repair.
const MAX_REPLACEMENT_RATIO: f64 = 0.1;

// High-noise artifacts that never belong in a code index, on top of whatever
// the corpus's own .gitignore rules exclude.
const BUILTIN_IGNORES: &[&str] = &[
    "**/*.lock",
    "**/package-lock.json",
    "**/pnpm-lock.yaml",
    "**/yarn.lock",
    "**/*.min.js",
    "**/*.map",
    "**/node_modules/**",
    "**/target/**",
    "**/dist/**",
    "**/build/**",
    "**/vendor/**",
    "**/.git/**",
];

/// One file of a corpus, with repaired UTF-8 content and inferred language.
#[derive(Debug, Clone)]
pub struct CorpusFile {
    /// Path relative to the corpus root, with forward slashes.
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub content: String,
    pub language: Option<String>,
}

/// Walk a corpus root and produce its indexable files in sorted path order,
/// so rebuilds observe files deterministically.
pub fn load_corpus(root: &Path, config: &IndexerConfig) -> Result<Vec<CorpusFile>, AppError> {
    let meta = fs::metadata(root)
        .map_err(|err| AppError::Validation(format!("corpus root {}: {err}", root.display())))?;
    if !meta.is_dir() {
        return Err(AppError::Validation(format!(
            "corpus root {} is not a directory",
            root.display()
        )));
    }

    let mut override_builder = OverrideBuilder::new(root);
    for pattern in BUILTIN_IGNORES {
        // A leading '!' marks the glob as an exclusion in override matchers.
        override_builder
            .add(&format!("!{pattern}"))
            .map_err(|err| AppError::Validation(format!("bad builtin ignore glob: {err}")))?;
    }
    for pattern in &config.ignore_globs {
        override_builder
            .add(&format!("!{pattern}"))
            .map_err(|err| AppError::Validation(format!("bad ignore glob '{pattern}': {err}")))?;
    }
    let overrides = override_builder
        .build()
        .map_err(|err| AppError::Validation(format!("ignore overrides: {err}")))?;

    let walker = WalkBuilder::new(root)
        .standard_filters(true)
        .overrides(overrides)
        .build();

    let mut files = Vec::new();
    for item in walker {
        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }

        let abs_path = entry.into_path();
        let Ok(rel) = abs_path.strip_prefix(root) else {
            continue;
        };
        let rel_path = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let size = fs::metadata(&abs_path).map(|m| m.len()).unwrap_or(0);
        if size == 0 || size > config.max_indexable_file_size {
            debug!(path = %rel_path, size, "skipping file outside size bounds");
            continue;
        }

        let bytes = match fs::read(&abs_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %rel_path, error = %err, "skipping unreadable file");
                continue;
            }
        };
        let Some(content) = repair_utf8(&bytes) else {
            warn!(path = %rel_path, "skipping file that is not repairable UTF-8");
            continue;
        };

        let extension = abs_path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let language = infer_language(extension.as_deref(), &content);

        let allowed = match &extension {
            Some(ext) => config.include_extensions.iter().any(|e| e == ext),
            // Extensionless files only index when a shebang identifies them.
            None => language.is_some(),
        };
        if !allowed {
            continue;
        }

        files.push(CorpusFile {
            rel_path,
            abs_path,
            content,
            language,
        });
    }

    files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(files)
}

/// Bounded repair: accept lossy UTF-8 while replacement characters stay rare.
fn repair_utf8(bytes: &[u8]) -> Option<String> {
    match String::from_utf8(bytes.to_vec()) {
        Ok(text) => Some(text),
        Err(_) => {
            let repaired = String::from_utf8_lossy(bytes).into_owned();
            let replacements = repaired.chars().filter(|c| *c == '\u{FFFD}').count();
            let total = repaired.chars().count().max(1);
            if (replacements as f64) / (total as f64) <= MAX_REPLACEMENT_RATIO {
                Some(repaired)
            } else {
                None
            }
        }
    }
}

/// Language inference from extension, with a shebang fallback.
pub fn infer_language(extension: Option<&str>, content: &str) -> Option<String> {
    let by_extension = match extension? {
        "rs" => Some("rust"),
        "py" => Some("python"),
        "ts" | "tsx" => Some("typescript"),
        "js" | "jsx" | "mjs" => Some("javascript"),
        "go" => Some("go"),
        "java" => Some("java"),
        "c" | "h" => Some("c"),
        "cpp" | "hpp" | "cc" => Some("cpp"),
        "rb" => Some("ruby"),
        "md" => Some("markdown"),
        _ => None,
    };
    if by_extension.is_some() {
        return by_extension.map(str::to_owned);
    }
    language_from_shebang(content)
}

fn language_from_shebang(content: &str) -> Option<String> {
    let first = content.lines().next()?;
    if !first.starts_with("#!") {
        return None;
    }
    if first.contains("python") {
        Some("python".to_owned())
    } else if first.contains("node") {
        Some("javascript".to_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::utils::config::IndexerConfig;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, content).expect("write");
    }

    #[test]
    fn yields_files_in_sorted_path_order() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "b.py", "def b(): pass");
        write(dir.path(), "a.py", "def a(): pass");
        write(dir.path(), "src/z.rs", "fn z() {}");

        let files = load_corpus(dir.path(), &IndexerConfig::default()).expect("load");
        let paths: Vec<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["a.py", "b.py", "src/z.rs"]);
    }

    #[test]
    fn filters_by_extension_allow_list() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "keep.rs", "fn keep() {}");
        write(dir.path(), "drop.bin", "not code");

        let files = load_corpus(dir.path(), &IndexerConfig::default()).expect("load");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].rel_path, "keep.rs");
    }

    #[test]
    fn skips_oversized_files() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "big.py", &"x = 1\n".repeat(100));
        write(dir.path(), "small.py", "x = 1\n");

        let config = IndexerConfig {
            max_indexable_file_size: 64,
            ..IndexerConfig::default()
        };
        let files = load_corpus(dir.path(), &config).expect("load");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].rel_path, "small.py");
    }

    #[test]
    fn honors_builtin_and_configured_ignores() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "node_modules/dep/index.js", "module.exports = 1");
        write(dir.path(), "generated/out.py", "x = 1");
        write(dir.path(), "src/main.py", "x = 1");

        let config = IndexerConfig {
            ignore_globs: vec!["generated/**".to_owned()],
            ..IndexerConfig::default()
        };
        let files = load_corpus(dir.path(), &config).expect("load");
        let paths: Vec<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["src/main.py"]);
    }

    #[test]
    fn infers_language_from_extension_and_shebang() {
        assert_eq!(infer_language(Some("rs"), "").as_deref(), Some("rust"));
        assert_eq!(infer_language(Some("py"), "").as_deref(), Some("python"));
        assert_eq!(
            language_from_shebang("#!/usr/bin/env python3\nprint('x')").as_deref(),
            Some("python")
        );
        assert_eq!(language_from_shebang("fn main() {}"), None);
    }

    #[test]
    fn rejects_mostly_binary_content() {
        assert!(repair_utf8(&[0xff; 100]).is_none());
        let mostly_text: Vec<u8> = [b"fine text ".repeat(20).as_slice(), &[0xff, 0xfe]].concat();
        assert!(repair_utf8(&mostly_text).is_some());
    }
}
