//! Input discovery
//!
//! [`Enumerator`] walks an input root and yields one [`Discovered`] item per
//! regular file, in component-wise lexicographic path order. Iteration is lazy
//! and every call to [`Enumerator::iter`] starts a fresh walk, so the same tree
//! always produces the same sequence.

use crate::{
    config::BatchConfig,
    error::{BatchError, Result},
    services::format::{disambiguated_output_path, output_path_for, ExtensionFilter},
    types::ImageTask,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// One entry found below the input root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovered {
    /// File with an allow-listed extension, to be processed
    Image(ImageTask),
    /// Any other regular file, reported as skipped
    Unsupported(ImageTask),
    /// Entry that could not be read while walking
    Unreadable { task: ImageTask, message: String },
}

impl Discovered {
    #[must_use]
    pub fn task(&self) -> &ImageTask {
        match self {
            Self::Image(task) | Self::Unsupported(task) | Self::Unreadable { task, .. } => task,
        }
    }

    #[must_use]
    pub fn is_image(&self) -> bool {
        matches!(self, Self::Image(_))
    }
}

/// Deterministic, restartable walk over an input root
#[derive(Debug, Clone)]
pub struct Enumerator {
    input_root: PathBuf,
    output_root: PathBuf,
    recursive: bool,
    filter: ExtensionFilter,
}

impl Enumerator {
    /// Create an enumerator for `input_root`, mirroring into `output_root`
    ///
    /// # Errors
    /// - `Enumeration` if the root does not exist, is not a directory or cannot be listed
    pub fn new<P, Q>(
        input_root: P,
        output_root: Q,
        recursive: bool,
        filter: ExtensionFilter,
    ) -> Result<Self>
    where
        P: AsRef<Path>,
        Q: Into<PathBuf>,
    {
        let input_root = input_root.as_ref();
        let metadata = std::fs::metadata(input_root).map_err(|e| {
            BatchError::enumeration(format!(
                "Cannot access input directory '{}': {e}",
                input_root.display()
            ))
        })?;
        if !metadata.is_dir() {
            return Err(BatchError::enumeration(format!(
                "Input '{}' is not a directory",
                input_root.display()
            )));
        }
        std::fs::read_dir(input_root).map_err(|e| {
            BatchError::enumeration(format!(
                "Cannot list input directory '{}': {e}",
                input_root.display()
            ))
        })?;
        let input_root = std::fs::canonicalize(input_root).map_err(|e| {
            BatchError::enumeration(format!(
                "Cannot resolve input directory '{}': {e}",
                input_root.display()
            ))
        })?;

        Ok(Self {
            input_root,
            output_root: output_root.into(),
            recursive,
            filter,
        })
    }

    /// Create an enumerator from a batch configuration
    ///
    /// # Errors
    /// - `Enumeration` as for [`Enumerator::new`]
    pub fn from_config(config: &BatchConfig) -> Result<Self> {
        Self::new(
            &config.input,
            config.output.clone(),
            config.recursive,
            ExtensionFilter::new(&config.extensions),
        )
    }

    /// Canonical input root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.input_root
    }

    #[must_use]
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Start a new walk
    #[must_use]
    pub fn iter(&self) -> TaskIter<'_> {
        let mut walker = WalkDir::new(&self.input_root)
            .min_depth(1)
            .sort_by_file_name();
        if !self.recursive {
            walker = walker.max_depth(1);
        }
        TaskIter {
            enumerator: self,
            walker: walker.into_iter(),
            claimed_outputs: HashSet::new(),
        }
    }

    /// Number of entries the next walk will yield
    #[must_use]
    pub fn count(&self) -> usize {
        self.iter().count()
    }

    fn task_for(&self, source: PathBuf) -> ImageTask {
        let relative = source
            .strip_prefix(&self.input_root)
            .map_or_else(|_| source.clone(), Path::to_path_buf);
        let output = output_path_for(&self.output_root, &relative);
        ImageTask {
            source,
            relative,
            output,
        }
    }
}

impl<'a> IntoIterator for &'a Enumerator {
    type Item = Discovered;
    type IntoIter = TaskIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy iterator returned by [`Enumerator::iter`]
pub struct TaskIter<'a> {
    enumerator: &'a Enumerator,
    walker: walkdir::IntoIter,
    claimed_outputs: HashSet<PathBuf>,
}

impl std::fmt::Debug for TaskIter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskIter")
            .field("root", &self.enumerator.input_root)
            .field("claimed_outputs", &self.claimed_outputs.len())
            .finish_non_exhaustive()
    }
}

impl TaskIter<'_> {
    fn unreadable(&self, error: &walkdir::Error) -> Discovered {
        let path = error
            .path()
            .map_or_else(|| self.enumerator.input_root.clone(), Path::to_path_buf);
        warn!(path = %path.display(), %error, "Unreadable entry below input root");
        Discovered::Unreadable {
            task: self.enumerator.task_for(path),
            message: error.to_string(),
        }
    }

    fn classify(&mut self, source: PathBuf) -> Discovered {
        let mut task = self.enumerator.task_for(source);
        if !self.enumerator.filter.matches(&task.relative) {
            return Discovered::Unsupported(task);
        }

        if !self.claimed_outputs.insert(task.output.clone()) {
            let renamed = disambiguated_output_path(&self.enumerator.output_root, &task.relative);
            warn!(
                source = %task.relative.display(),
                output = %renamed.display(),
                "Output name already taken by another source; keeping the source extension"
            );
            self.claimed_outputs.insert(renamed.clone());
            task.output = renamed;
        }
        Discovered::Image(task)
    }
}

impl Iterator for TaskIter<'_> {
    type Item = Discovered;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(error) => return Some(self.unreadable(&error)),
            };

            let file_type = entry.file_type();
            let is_file = file_type.is_file() || (file_type.is_symlink() && entry.path().is_file());
            if !is_file {
                if file_type.is_symlink() && !entry.path().is_dir() {
                    debug!(path = %entry.path().display(), "Skipping dangling symlink");
                }
                continue;
            }
            return Some(self.classify(entry.into_path()));
        }
    }
}
