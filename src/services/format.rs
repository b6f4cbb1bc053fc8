//! Input extension filtering and output path mapping

use crate::config::DEFAULT_EXTENSIONS;
use std::path::{Path, PathBuf};

/// Extension used for every output file
pub const OUTPUT_EXTENSION: &str = "tiff";

/// Case-insensitive extension allow-list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionFilter {
    extensions: Vec<String>,
}

impl Default for ExtensionFilter {
    fn default() -> Self {
        Self::new(DEFAULT_EXTENSIONS.iter().copied())
    }
}

impl ExtensionFilter {
    /// Build a filter; entries may carry a leading dot and any case
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut extensions: Vec<String> = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        extensions.sort();
        extensions.dedup();
        Self { extensions }
    }

    /// Check if a path's extension is in the allow-list
    #[must_use]
    pub fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            })
    }

    #[must_use]
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }
}

/// Output path for a source at `relative` below the input root
///
/// The relative directory structure is mirrored and the extension replaced by `.tiff`.
#[must_use]
pub fn output_path_for(output_root: &Path, relative: &Path) -> PathBuf {
    output_root.join(relative).with_extension(OUTPUT_EXTENSION)
}

/// Output path that keeps the source extension in the file name
///
/// Used when two sources in one directory share a stem (`a.png`, `a.tif`).
#[must_use]
pub fn disambiguated_output_path(output_root: &Path, relative: &Path) -> PathBuf {
    let mut file_name = relative
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    file_name.push(".");
    file_name.push(OUTPUT_EXTENSION);
    output_root.join(relative).with_file_name(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_filter_case_insensitive() {
        let filter = ExtensionFilter::default();
        assert!(filter.matches(Path::new("a/b/photo.JPG")));
        assert!(filter.matches(Path::new("scan.Tif")));
        assert!(filter.matches(Path::new("scan.tiff")));
        assert!(!filter.matches(Path::new("notes.txt")));
        assert!(!filter.matches(Path::new("README")));
        assert!(!filter.matches(Path::new(".png")));
    }

    #[test]
    fn test_extension_filter_normalizes_entries() {
        let filter = ExtensionFilter::new([".PNG", "png", " jpg", ""]);
        assert_eq!(filter.extensions(), &["jpg".to_string(), "png".to_string()]);
        assert!(filter.matches(Path::new("x.png")));
        assert!(!filter.matches(Path::new("x.tif")));
    }

    #[test]
    fn test_output_path_mirrors_structure() {
        let out = output_path_for(Path::new("/out"), Path::new("2024/trip/IMG_001.jpg"));
        assert_eq!(out, PathBuf::from("/out/2024/trip/IMG_001.tiff"));

        let out = output_path_for(Path::new("/out"), Path::new("scan.tif"));
        assert_eq!(out, PathBuf::from("/out/scan.tiff"));
    }

    #[test]
    fn test_disambiguated_output_path() {
        let out = disambiguated_output_path(Path::new("/out"), Path::new("a/photo.png"));
        assert_eq!(out, PathBuf::from("/out/a/photo.png.tiff"));
    }
}
