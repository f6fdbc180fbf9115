//! Zip archiving of a workspace tree.
//!
//! The archive is written next to its destination under a `.partial` name and
//! only renamed into place once complete; a failed archive leaves nothing
//! behind. Symlinks are followed and stored as the content they point to;
//! dangling links and links back into an ancestor directory are skipped.

use glob::Pattern;
use ignore::WalkBuilder;
use shipit_core::{Error, Result};
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::CompressionMethod;
use zip::write::{SimpleFileOptions, ZipWriter};

/// Result of a successful archive.
#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub files: usize,
    pub bytes: u64,
}

/// Creates zip archives, skipping paths that match any exclude pattern.
#[derive(Debug, Clone)]
pub struct Archiver {
    excludes: Vec<Pattern>,
}

impl Archiver {
    pub fn new(excludes: &[String]) -> Result<Self> {
        let excludes = excludes
            .iter()
            .map(|p| {
                Pattern::new(p)
                    .map_err(|e| Error::Archive(format!("invalid exclude pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { excludes })
    }

    /// True if the workspace-relative path (with `/` separators) is excluded.
    pub fn is_excluded(&self, relative: &str) -> bool {
        self.excludes.iter().any(|p| p.matches(relative))
    }

    /// Archive `source` into `dest`. Blocking; run on a blocking thread.
    pub fn create(&self, source: &Path, dest: &Path) -> Result<ArchiveSummary> {
        let source = source.canonicalize().map_err(|e| {
            Error::Archive(format!("cannot read workspace {}: {}", source.display(), e))
        })?;
        let file_name = dest
            .file_name()
            .ok_or_else(|| Error::Archive(format!("{} is not a file path", dest.display())))?;
        let dest_dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dest_dir)
            .map_err(|e| Error::Archive(format!("cannot create {}: {}", dest_dir.display(), e)))?;
        let dest_dir = dest_dir.canonicalize().map_err(|e| Error::Archive(e.to_string()))?;

        let dest = dest_dir.join(file_name);
        let mut partial_name = file_name.to_os_string();
        partial_name.push(".partial");
        let partial = dest_dir.join(partial_name);

        info!(source = %source.display(), dest = %dest.display(), "Creating archive");

        match self.write_zip(&source, &partial, &[dest.as_path(), partial.as_path()]) {
            Ok((files, bytes)) => {
                std::fs::rename(&partial, &dest).map_err(|e| {
                    let _ = std::fs::remove_file(&partial);
                    Error::Archive(format!("cannot move archive into place: {}", e))
                })?;
                info!(files, bytes, "Archive complete");
                Ok(ArchiveSummary {
                    path: dest,
                    files,
                    bytes,
                })
            }
            Err(e) => {
                let _ = std::fs::remove_file(&partial);
                Err(e)
            }
        }
    }

    fn write_zip(&self, source: &Path, out: &Path, skip: &[&Path]) -> Result<(usize, u64)> {
        let file = File::create(out)
            .map_err(|e| Error::Archive(format!("cannot create {}: {}", out.display(), e)))?;
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        let root = source.to_path_buf();
        let this = self.clone();
        let walker = WalkBuilder::new(source)
            .standard_filters(false)
            .hidden(false)
            .follow_links(true)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| match relative_name(&root, entry.path()) {
                Some(rel) => !this.is_excluded(&rel),
                None => true,
            })
            .build();

        let mut files = 0usize;
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if is_loop(&e) => {
                    warn!(error = %e, "Skipping symlink loop");
                    continue;
                }
                Err(e) if e.io_error().is_some_and(|io| io.kind() == ErrorKind::NotFound) => {
                    warn!(error = %e, "Skipping dangling symlink");
                    continue;
                }
                Err(e) => return Err(Error::Archive(format!("walk failed: {}", e))),
            };
            let path = entry.path();
            if skip.contains(&path) {
                continue;
            }
            let Some(name) = relative_name(source, path) else {
                continue;
            };
            let Some(file_type) = entry.file_type() else {
                continue;
            };

            if file_type.is_dir() {
                zip.add_directory(format!("{}/", name), options)
                    .map_err(|e| Error::Archive(e.to_string()))?;
            } else if file_type.is_file() {
                let entry_options = with_permissions(options, path);
                zip.start_file(name.as_str(), entry_options)
                    .map_err(|e| Error::Archive(e.to_string()))?;
                let mut input = File::open(path)
                    .map_err(|e| Error::Archive(format!("cannot read {}: {}", name, e)))?;
                std::io::copy(&mut input, &mut zip)
                    .map_err(|e| Error::Archive(format!("cannot write {}: {}", name, e)))?;
                files += 1;
            } else {
                debug!(path = %name, "Skipping non-regular file");
            }
        }

        let mut writer = zip.finish().map_err(|e| Error::Archive(e.to_string()))?;
        writer.flush().map_err(|e| Error::Archive(e.to_string()))?;
        drop(writer);

        let bytes = std::fs::metadata(out)
            .map(|m| m.len())
            .map_err(|e| Error::Archive(e.to_string()))?;
        Ok((files, bytes))
    }
}

/// True if the walk stopped at a symlink pointing back into an ancestor.
fn is_loop(err: &ignore::Error) -> bool {
    match err {
        ignore::Error::Loop { .. } => true,
        ignore::Error::WithPath { err, .. }
        | ignore::Error::WithDepth { err, .. }
        | ignore::Error::WithLineNumber { err, .. } => is_loop(err),
        _ => false,
    }
}

/// Workspace-relative name with `/` separators; `None` for the root itself.
fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

#[cfg(unix)]
fn with_permissions(options: SimpleFileOptions, path: &Path) -> SimpleFileOptions {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => options.unix_permissions(meta.permissions().mode()),
        Err(_) => options,
    }
}

#[cfg(not(unix))]
fn with_permissions(options: SimpleFileOptions, _path: &Path) -> SimpleFileOptions {
    options
}
