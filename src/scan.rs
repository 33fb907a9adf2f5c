//! Path classification shared by the crawler and the decode buffer.

use std::path::Path;

use walkdir::DirEntry;

/// Return `true` if `path` has one of the allowed extensions (lowercase, without dot).
#[must_use]
pub fn has_extension(path: &Path, exts: &[String]) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| {
            let ext = ext.to_ascii_lowercase();
            exts.iter().any(|e| *e == ext)
        })
}

/// Hidden dot-directories below a root are not crawled.
pub(crate) fn is_hidden_dir(entry: &DirEntry) -> bool {
    // Never skip the root; tempfile roots can be dot-dirs.
    if entry.depth() == 0 {
        return false;
    }
    if !entry.file_type().is_dir() {
        return false;
    }
    entry
        .file_name()
        .to_str()
        .is_some_and(|n| n.starts_with('.'))
}
