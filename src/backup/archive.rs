// projectbackup/src/backup/archive.rs
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{Datelike, Local, Timelike};
use tempfile::NamedTempFile;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::errors::{EngineError, Result};

/// Root-level entry name of an embedded SQL dump.
pub const DATABASE_DUMP_ENTRY: &str = "__database_dump.sql";

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// How the source tree is walked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkOptions {
    /// Descend into symlinked directories. Loops are detected and skipped.
    pub follow_symlinks: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub bytes_written: u64,
    /// Files taken from the source tree; extra entries are not counted.
    pub file_count: u64,
    pub extra_entries: u64,
}

/// A file added at the archive root under a fixed name.
#[derive(Debug, Clone, Copy)]
pub struct ExtraEntry<'a> {
    pub name: &'a str,
    pub path: &'a Path,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub files_written: u64,
    pub directories_created: u64,
    /// Entries refused because they would land outside the destination.
    pub skipped: Vec<String>,
}

struct TreeFile {
    absolute: PathBuf,
    relative: String,
}

/// Creates a zip archive of every regular file below `source_dir`.
pub fn build(source_dir: &Path, destination: &Path) -> Result<ArchiveStats> {
    build_with(source_dir, destination, WalkOptions::default(), &[])
}

/// Creates a zip archive from a source directory plus optional root-level extras.
///
/// The archive is written to a temporary file next to `destination` and only
/// moved into place once it is complete, so a failed build never leaves a
/// partial archive behind. An existing `destination` is left untouched and
/// reported as `ArchiveOpenFailed` with [`io::ErrorKind::AlreadyExists`].
///
/// # Arguments
/// * `source_dir` - The directory whose files will be archived.
/// * `destination` - The full path of the `.zip` file to create.
/// * `options` - Symlink handling for the walk.
/// * `extras` - Files stored at the archive root under their given name.
pub fn build_with(
    source_dir: &Path,
    destination: &Path,
    options: WalkOptions,
    extras: &[ExtraEntry<'_>],
) -> Result<ArchiveStats> {
    if !source_dir.is_dir() || fs::read_dir(source_dir).is_err() {
        return Err(EngineError::SourceNotFound {
            path: source_dir.to_path_buf(),
        });
    }

    let files = collect_tree(source_dir, destination, options)
        .map_err(|e| EngineError::archive_open(destination, e))?;

    let parent = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|e| EngineError::archive_open(destination, e))?;

    tracing::info!(
        source = %source_dir.display(),
        destination = %destination.display(),
        files = files.len(),
        "creating zip archive"
    );

    let mut temp = NamedTempFile::new_in(&parent).map_err(|e| EngineError::archive_open(destination, e))?;
    let extra_entries = write_archive(temp.as_file_mut(), &files, extras)
        .map_err(|e| EngineError::archive_open(destination, e))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| EngineError::archive_open(destination, e))?;
    // Archives are immutable once recorded; an existing file is never replaced.
    temp.persist_noclobber(destination)
        .map_err(|e| EngineError::archive_open(destination, e.error))?;

    let bytes_written = fs::metadata(destination)
        .map_err(|e| EngineError::archive_open(destination, e))?
        .len();

    tracing::info!(
        destination = %destination.display(),
        bytes = bytes_written,
        "✓ zip archive created"
    );
    Ok(ArchiveStats {
        bytes_written,
        file_count: files.len() as u64,
        extra_entries,
    })
}

fn collect_tree(source_dir: &Path, destination: &Path, options: WalkOptions) -> io::Result<Vec<TreeFile>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(source_dir)
        .follow_links(options.follow_symlinks)
        .sort_by_file_name()
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.loop_ancestor().is_some() => {
                tracing::warn!(error = %e, "skipping symlink loop");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let path = entry.path();
        if path == destination {
            continue;
        }

        let file_type = entry.file_type();
        let is_file = if file_type.is_file() {
            true
        } else if file_type.is_symlink() {
            // Only reached when symlinks are not followed.
            match fs::metadata(path) {
                Ok(meta) if meta.is_file() => true,
                Ok(_) => {
                    tracing::debug!(path = %path.display(), "not following symlinked directory");
                    false
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping broken symlink");
                    false
                }
            }
        } else {
            false
        };
        if !is_file {
            continue;
        }

        let relative = path
            .strip_prefix(source_dir)
            .map_err(|e| io::Error::other(format!("{} is outside {}: {}", path.display(), source_dir.display(), e)))?;
        files.push(TreeFile {
            absolute: path.to_path_buf(),
            relative: entry_name(relative),
        });
    }

    Ok(files)
}

fn write_archive(file: &mut File, files: &[TreeFile], extras: &[ExtraEntry<'_>]) -> io::Result<u64> {
    let mut zip = ZipWriter::new(file);

    for tree_file in files {
        add_file(&mut zip, &tree_file.absolute, &tree_file.relative)?;
    }

    let mut added = 0;
    for extra in extras {
        if files.iter().any(|f| f.relative == extra.name) {
            tracing::warn!(entry = extra.name, "source tree already contains this entry, not embedding it");
            continue;
        }
        add_file(&mut zip, extra.path, extra.name)?;
        added += 1;
    }

    zip.finish().map_err(io::Error::other)?;
    Ok(added)
}

fn add_file(zip: &mut ZipWriter<&mut File>, path: &Path, name: &str) -> io::Result<()> {
    let metadata = fs::metadata(path)?;
    let mut options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(metadata.len() >= u64::from(u32::MAX));
    if let Ok(modified) = metadata.modified() {
        options = options.last_modified_time(zip_timestamp(modified));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        options = options.unix_permissions(metadata.permissions().mode() & 0o777);
    }

    zip.start_file(name, options).map_err(io::Error::other)?;
    let mut source = File::open(path)?;
    io::copy(&mut source, zip)?;
    Ok(())
}

/// Archive entry names always use `/`.
fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn zip_timestamp(modified: SystemTime) -> zip::DateTime {
    let local: chrono::DateTime<Local> = modified.into();
    u16::try_from(local.year())
        .ok()
        .and_then(|year| {
            zip::DateTime::from_date_and_time(
                year,
                local.month() as u8,
                local.day() as u8,
                local.hour() as u8,
                local.minute() as u8,
                local.second() as u8,
            )
            .ok()
        })
        .unwrap_or_default()
}

/// Opens an existing archive for reading.
pub fn open_archive(archive_path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(archive_path).map_err(|e| EngineError::archive_open(archive_path, e))?;
    ZipArchive::new(file).map_err(|e| {
        EngineError::archive_open(archive_path, io::Error::new(io::ErrorKind::InvalidData, e))
    })
}

/// Extracts every entry of `archive` below `extract_to_dir`, overwriting files
/// that already exist at the same relative path.
///
/// # Arguments
/// * `archive` - An archive opened with [`open_archive`].
/// * `archive_path` - Path of the archive, used in errors.
/// * `extract_to_dir` - The directory where the contents will be extracted.
pub fn extract(
    archive: &mut ZipArchive<File>,
    archive_path: &Path,
    extract_to_dir: &Path,
) -> Result<ExtractStats> {
    let failed = |reason: String| EngineError::ExtractFailed {
        path: archive_path.to_path_buf(),
        reason,
    };

    if !extract_to_dir.exists() {
        fs::create_dir_all(extract_to_dir).map_err(|e| {
            failed(format!(
                "Failed to create extraction directory {}: {}",
                extract_to_dir.display(),
                e
            ))
        })?;
    } else if !extract_to_dir.is_dir() {
        return Err(failed(format!(
            "Extraction path exists but is not a directory: {}",
            extract_to_dir.display()
        )));
    }

    tracing::info!(
        archive = %archive_path.display(),
        destination = %extract_to_dir.display(),
        entries = archive.len(),
        "extracting zip archive"
    );

    let mut stats = ExtractStats::default();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| failed(format!("Failed to read entry {}: {}", index, e)))?;
        let name = entry.name().to_string();

        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!(entry = %name, "refusing entry that escapes the destination");
            stats.skipped.push(name);
            continue;
        };
        if entry.unix_mode().map_or(false, |mode| mode & S_IFMT == S_IFLNK) {
            tracing::warn!(entry = %name, "skipping symlink entry");
            stats.skipped.push(name);
            continue;
        }

        let out_path = extract_to_dir.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .map_err(|e| failed(format!("Failed to create {}: {}", out_path.display(), e)))?;
            stats.directories_created += 1;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| failed(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        // Replace files and symlinks rather than writing through them.
        if let Ok(existing) = fs::symlink_metadata(&out_path) {
            if !existing.is_dir() {
                fs::remove_file(&out_path)
                    .map_err(|e| failed(format!("Failed to replace {}: {}", out_path.display(), e)))?;
            }
        }

        let mut out_file = File::create(&out_path)
            .map_err(|e| failed(format!("Failed to create {}: {}", out_path.display(), e)))?;
        io::copy(&mut entry, &mut out_file)
            .map_err(|e| failed(format!("Failed to write {}: {}", out_path.display(), e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                let _ = fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777));
            }
        }
        stats.files_written += 1;
    }

    tracing::info!(
        destination = %extract_to_dir.display(),
        files = stats.files_written,
        "✓ zip archive extracted"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write;

    fn write(root: &Path, relative: &str, contents: &[u8]) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = entry_name(e.path().strip_prefix(root).unwrap());
                (rel, fs::read(e.path()).unwrap())
            })
            .collect()
    }

    fn sample_tree(root: &Path) {
        write(root, "index.php", b"<?php echo 'hi';");
        write(root, ".env", b"APP_ENV=local\n");
        write(root, "app/Models/User.php", b"class User {}");
        write(root, "storage/logs/empty.log", b"");
        write(root, "public/img/logo.bin", &[0u8, 159, 146, 150, 255]);
    }

    #[test]
    fn extracted_tree_matches_source() {
        let source = tempfile::tempdir().unwrap();
        sample_tree(source.path());
        let out = tempfile::tempdir().unwrap();
        let archive_path = out.path().join("nested/dir/site.zip");

        let stats = build(source.path(), &archive_path).unwrap();
        assert_eq!(stats.file_count, 5);
        assert_eq!(stats.bytes_written, fs::metadata(&archive_path).unwrap().len());

        let restored = tempfile::tempdir().unwrap();
        let mut archive = open_archive(&archive_path).unwrap();
        let extracted = extract(&mut archive, &archive_path, restored.path()).unwrap();
        assert_eq!(extracted.files_written, 5);
        assert_eq!(snapshot(source.path()), snapshot(restored.path()));
    }

    #[test]
    fn unchanged_tree_builds_identical_archives() {
        let source = tempfile::tempdir().unwrap();
        sample_tree(source.path());
        let out = tempfile::tempdir().unwrap();
        let first = out.path().join("a.zip");
        let second = out.path().join("b.zip");

        build(source.path(), &first).unwrap();
        build(source.path(), &second).unwrap();
        assert_eq!(fs::read(first).unwrap(), fs::read(second).unwrap());
    }

    #[test]
    fn missing_source_leaves_no_archive() {
        let out = tempfile::tempdir().unwrap();
        let archive_path = out.path().join("site.zip");
        let err = build(&out.path().join("does-not-exist"), &archive_path).unwrap_err();
        assert!(matches!(err, EngineError::SourceNotFound { .. }));
        assert!(!archive_path.exists());
    }

    #[test]
    fn unwritable_destination_fails_to_open() {
        let source = tempfile::tempdir().unwrap();
        sample_tree(source.path());
        let out = tempfile::tempdir().unwrap();
        // A regular file where the parent directory should be.
        fs::write(out.path().join("blocker"), b"x").unwrap();
        let archive_path = out.path().join("blocker/site.zip");

        let err = build(source.path(), &archive_path).unwrap_err();
        assert!(matches!(err, EngineError::ArchiveOpenFailed { .. }));
        assert!(!archive_path.exists());
    }

    #[test]
    fn existing_archive_is_never_replaced() {
        let source = tempfile::tempdir().unwrap();
        write(source.path(), "a.txt", b"first");
        let out = tempfile::tempdir().unwrap();
        let archive_path = out.path().join("site.zip");
        build(source.path(), &archive_path).unwrap();
        let original = fs::read(&archive_path).unwrap();

        write(source.path(), "a.txt", b"second");
        let err = build(source.path(), &archive_path).unwrap_err();
        match err {
            EngineError::ArchiveOpenFailed { source, .. } => {
                assert_eq!(source.kind(), io::ErrorKind::AlreadyExists)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fs::read(&archive_path).unwrap(), original);
        // no stray temp files next to it
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 1);
    }

    #[test]
    fn extra_entries_land_at_root() {
        let source = tempfile::tempdir().unwrap();
        sample_tree(source.path());
        let scratch = tempfile::tempdir().unwrap();
        let dump = scratch.path().join("dump.sql");
        fs::write(&dump, b"CREATE TABLE t (id int);").unwrap();
        let archive_path = scratch.path().join("site.zip");

        let stats = build_with(
            source.path(),
            &archive_path,
            WalkOptions::default(),
            &[ExtraEntry {
                name: DATABASE_DUMP_ENTRY,
                path: &dump,
            }],
        )
        .unwrap();
        assert_eq!(stats.file_count, 5);
        assert_eq!(stats.extra_entries, 1);

        let mut archive = open_archive(&archive_path).unwrap();
        let names: Vec<String> = archive.file_names().map(String::from).collect();
        assert!(names.contains(&DATABASE_DUMP_ENTRY.to_string()));
        let mut entry = archive.by_name(DATABASE_DUMP_ENTRY).unwrap();
        let mut contents = String::new();
        io::Read::read_to_string(&mut entry, &mut contents).unwrap();
        assert_eq!(contents, "CREATE TABLE t (id int);");
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_follow_the_flag() {
        let source = tempfile::tempdir().unwrap();
        write(source.path(), "real/file.txt", b"data");
        std::os::unix::fs::symlink(source.path().join("real"), source.path().join("alias")).unwrap();
        std::os::unix::fs::symlink(source.path().join("real/file.txt"), source.path().join("link.txt")).unwrap();
        // A loop back to the root.
        std::os::unix::fs::symlink(source.path(), source.path().join("real/loop")).unwrap();
        let out = tempfile::tempdir().unwrap();

        let plain = build(source.path(), &out.path().join("plain.zip")).unwrap();
        assert_eq!(plain.file_count, 2); // real/file.txt and link.txt

        let followed = build_with(
            source.path(),
            &out.path().join("followed.zip"),
            WalkOptions { follow_symlinks: true },
            &[],
        )
        .unwrap();
        assert_eq!(followed.file_count, 3); // plus alias/file.txt
    }

    #[test]
    fn extraction_overwrites_and_keeps_unrelated_files() {
        let source = tempfile::tempdir().unwrap();
        write(source.path(), "config/app.php", b"new");
        let out = tempfile::tempdir().unwrap();
        let archive_path = out.path().join("site.zip");
        build(source.path(), &archive_path).unwrap();

        let target = tempfile::tempdir().unwrap();
        write(target.path(), "config/app.php", b"old contents");
        write(target.path(), "local-only.txt", b"keep me");

        let mut archive = open_archive(&archive_path).unwrap();
        extract(&mut archive, &archive_path, target.path()).unwrap();
        assert_eq!(fs::read(target.path().join("config/app.php")).unwrap(), b"new");
        assert_eq!(fs::read(target.path().join("local-only.txt")).unwrap(), b"keep me");
    }

    #[test]
    fn entries_escaping_destination_are_skipped() {
        let out = tempfile::tempdir().unwrap();
        let archive_path = out.path().join("evil.zip");
        {
            let file = File::create(&archive_path).unwrap();
            let mut zip = ZipWriter::new(file);
            zip.start_file("../escape.txt", SimpleFileOptions::default()).unwrap();
            zip.write_all(b"nope").unwrap();
            zip.start_file("ok.txt", SimpleFileOptions::default()).unwrap();
            zip.write_all(b"fine").unwrap();
            zip.finish().unwrap();
        }

        let target = out.path().join("target");
        let mut archive = open_archive(&archive_path).unwrap();
        let stats = extract(&mut archive, &archive_path, &target).unwrap();
        assert_eq!(stats.files_written, 1);
        assert_eq!(stats.skipped, vec!["../escape.txt".to_string()]);
        assert!(!out.path().join("escape.txt").exists());
    }

    #[test]
    fn garbage_file_fails_to_open() {
        let out = tempfile::tempdir().unwrap();
        let path = out.path().join("broken.zip");
        fs::write(&path, b"this is not a zip").unwrap();
        assert!(matches!(
            open_archive(&path),
            Err(EngineError::ArchiveOpenFailed { .. })
        ));
    }
}
