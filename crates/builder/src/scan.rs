//! Source tree scan: supported-extension filter, permissive UTF-8 decode,
//! deterministic byte-lexicographic ordering of POSIX-relative paths.

use crate::error::{BuildError, Result};
use ignore::WalkBuilder;
use std::collections::BTreeMap;
use std::path::Path;

pub const CODE_EXTS: &[&str] = &[
    ".py", ".js", ".ts", ".tsx", ".jsx", ".java", ".kt", ".go", ".rs", ".cpp", ".c", ".h", ".cs",
];
pub const TEXT_EXTS: &[&str] = &[".md", ".txt", ".rst"];

#[must_use]
pub fn is_supported_ext(ext: &str) -> bool {
    CODE_EXTS.contains(&ext) || TEXT_EXTS.contains(&ext)
}

#[derive(Debug, Clone)]
pub struct SourceFile {
    /// POSIX-relative path from the scan root.
    pub rel_path: String,
    /// Lowercased extension with leading dot, e.g. `.rs`.
    pub ext: String,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct ScanResult {
    pub files: Vec<SourceFile>,
    pub ext_counts: BTreeMap<String, usize>,
}

/// Walk the source tree (.gitignore aware). Files that are empty after
/// decoding are skipped; invalid UTF-8 gets a lossy fallback decode.
pub fn scan_source_tree(root: &Path) -> Result<ScanResult> {
    if !root.is_dir() {
        return Err(BuildError::SourceMissing(root.display().to_string()));
    }

    let mut result = ScanResult::default();
    for entry in WalkBuilder::new(root).hidden(false).build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("Failed to read entry: {err}");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        let Some(ext) = extension_of(path) else {
            continue;
        };
        if !is_supported_ext(&ext) {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let rel_path = posix_path(relative);

        let bytes = std::fs::read(path)?;
        if bytes.is_empty() {
            continue;
        }
        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        };
        if text.trim().is_empty() {
            continue;
        }

        *result.ext_counts.entry(ext.clone()).or_insert(0) += 1;
        result.files.push(SourceFile {
            rel_path,
            ext,
            text,
        });
    }

    // Chunk order (and therefore every downstream hash) depends on this
    // ordering being byte-lexicographic over POSIX paths.
    result.files.sort_by(|a, b| a.rel_path.as_bytes().cmp(b.rel_path.as_bytes()));

    log::info!(
        "Scanned {}: {} files accepted",
        root.display(),
        result.files.len()
    );
    Ok(result)
}

fn extension_of(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?;
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

#[must_use]
pub fn posix_path(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}

/// Language/doc tags inferred from extension frequencies, mirrored into
/// `cpm.yml` and the manifest.
#[must_use]
pub fn infer_tags(ext_counts: &BTreeMap<String, usize>) -> Vec<String> {
    let has = |ext: &str| ext_counts.get(ext).copied().unwrap_or(0) > 0;
    let mut tags = Vec::new();
    if has(".py") {
        tags.push("python");
    }
    if has(".js") || has(".jsx") {
        tags.push("javascript");
    }
    if has(".ts") || has(".tsx") {
        tags.push("typescript");
    }
    if has(".java") {
        tags.push("java");
    }
    if has(".kt") {
        tags.push("kotlin");
    }
    if has(".go") {
        tags.push("go");
    }
    if has(".rs") {
        tags.push("rust");
    }
    if has(".cpp") || has(".c") || has(".h") {
        tags.push("cpp");
    }
    if has(".cs") {
        tags.push("csharp");
    }
    if has(".md") || has(".rst") || has(".txt") {
        tags.push("docs");
    }
    tags.push("cpm");
    let mut tags: Vec<String> = tags.into_iter().map(ToString::to_string).collect();
    tags.sort();
    tags.dedup();
    tags
}
