//! Output file collection

use crate::Workspace;
use crate::result::OutputFile;
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Requested output files split into those found and those missing
#[derive(Debug, Default)]
pub struct Collected {
    /// Found files, in request order (repeats kept)
    pub files: Vec<OutputFile>,
    /// Requested paths that could not be returned
    pub missing: BTreeSet<String>,
}

/// Resolve each requested path inside `workspace`.
///
/// A path is returned only if it is a readable regular file that, after
/// following symlinks, still lies inside the workspace. Anything else is
/// recorded as missing; collection itself never fails.
#[must_use]
pub fn collect(workspace: &Workspace, output_files: &[String]) -> Collected {
    let mut collected = Collected::default();

    for relative_path in output_files {
        let path = match workspace.resolve(relative_path) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(path = %relative_path, error = %e, "rejected output path");
                collected.missing.insert(relative_path.clone());
                continue;
            }
        };

        if !path.exists() {
            tracing::debug!(path = %relative_path, "requested output file not found");
            collected.missing.insert(relative_path.clone());
            continue;
        }

        if !workspace.contains(&path) {
            tracing::warn!(path = %relative_path, "output path resolves outside the workspace");
            collected.missing.insert(relative_path.clone());
            continue;
        }

        let size = regular_file_size(&path);

        match size {
            Ok(Some(size)) => collected.files.push(OutputFile {
                relative_path: relative_path.clone(),
                path,
                size,
            }),
            Ok(None) => {
                tracing::debug!(path = %relative_path, "requested output is not a regular file");
                collected.missing.insert(relative_path.clone());
            }
            Err(e) => {
                tracing::warn!(path = %relative_path, error = %e, "failed to open output file");
                collected.missing.insert(relative_path.clone());
            }
        }
    }

    collected
}

/// Size of `path` if it is a readable regular file, `None` for anything else.
///
/// The type is checked before opening so FIFOs and devices are never opened;
/// the open is non-blocking in case the path is swapped in between.
fn regular_file_size(path: &Path) -> std::io::Result<Option<u64>> {
    if !fs::metadata(path)?.is_file() {
        return Ok(None);
    }

    let file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    let meta = file.metadata()?;
    Ok(meta.is_file().then(|| meta.len()))
}
