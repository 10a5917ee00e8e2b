use std::path::{Path, PathBuf};

use url::Url;

/// Last non-empty path segment of `url`, percent-decoded, or a random name
/// when there is none.
pub fn get_filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|name| name.into_owned())
                .unwrap_or_else(|_| segment.to_string())
        })
        .unwrap_or_else(|| format!("download_{}", uuid::Uuid::new_v4()))
}

pub fn sanitize_filename(filename: &str) -> String {
    let cleaned = filename.replace(
        |c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_' && c != ' ',
        "_",
    );
    let trimmed = cleaned.trim_matches(|c: char| c == '.' || c == ' ');
    if trimmed.is_empty() {
        format!("download_{}", uuid::Uuid::new_v4())
    } else {
        trimmed.to_string()
    }
}

/// `dir/filename`, or `dir/stem (N).ext` for the first free `N` when taken.
pub fn get_unique_filepath(dir: &Path, filename: &str) -> PathBuf {
    let path = dir.join(filename);
    if !path.exists() {
        return path;
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    (1u32..)
        .map(|counter| match &extension {
            Some(ext) => dir.join(format!("{stem} ({counter}).{ext}")),
            None => dir.join(format!("{stem} ({counter})")),
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}

/// Where a download of `url` lands.
///
/// A `target` that is not an existing directory is taken as the file path
/// itself, so re-running with the same path resumes into it. A directory
/// receives the server's suggested name (or the URL's last segment) with a
/// collision suffix.
pub fn resolve_target(target: &Path, url: &Url, filename_hint: Option<&str>) -> PathBuf {
    if !target.is_dir() {
        return target.to_path_buf();
    }
    let name = filename_hint
        .map(str::to_string)
        .unwrap_or_else(|| get_filename_from_url(url));
    get_unique_filepath(target, &sanitize_filename(&name))
}
