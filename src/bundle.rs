//! Application bundles: where embedded resources are read from
//!
//! A bundle is a directory during development and a tar archive when
//! distributed; an archive may itself live inside an outer archive
//! (`outer.tar!/inner.tar`). Entries are addressed by forward-slash relative
//! paths. Archive access re-scans the (seekable) archive file on demand, so
//! no archive handle outlives a single call.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tar::Archive;

use crate::error::{DeployError, DeployResult};

/// Extension marking a bundle archive.
pub const ARCHIVE_MARKER: &str = ".tar";

/// Separator between an outer archive and a nested inner archive path.
const NESTED_SEPARATOR: &str = "!/";

/// Where a single resource's bytes come from. The payload is the opaque
/// handle matching the origin: a plain file path, a bundle-archive entry
/// path, or an entry path inside the nested inner archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    File(PathBuf),
    Archive(String),
    Nested(String),
}

/// One discoverable bundle entry.
#[derive(Debug, Clone)]
pub struct BundleEntry {
    /// Basename of the entry inside the bundle.
    pub name: String,
    pub origin: Origin,
    /// Source byte length before any decompression.
    pub length: u64,
}

#[derive(Debug, Clone)]
enum BundleRoot {
    Dir(PathBuf),
    Archive(PathBuf),
    Nested { archive: PathBuf, inner: String },
}

/// The application bundle resources are enumerated from and read out of.
#[derive(Debug, Clone)]
pub struct Bundle {
    root: BundleRoot,
    version: Option<String>,
}

impl Bundle {
    /// Development layout: resources are plain files under `path`.
    pub fn directory(path: impl Into<PathBuf>) -> Bundle {
        Bundle {
            root: BundleRoot::Dir(path.into()),
            version: None,
        }
    }

    /// Distributed layout: resources are entries of the tar archive `path`.
    pub fn archive(path: impl Into<PathBuf>) -> Bundle {
        Bundle {
            root: BundleRoot::Archive(path.into()),
            version: None,
        }
    }

    /// An archive embedded in an outer archive: resources are entries of
    /// `inner`, which is itself an entry of `archive`.
    pub fn nested(archive: impl Into<PathBuf>, inner: impl Into<String>) -> Bundle {
        Bundle {
            root: BundleRoot::Nested {
                archive: archive.into(),
                inner: inner.into(),
            },
            version: None,
        }
    }

    /// Detect the bundle kind from a location string. A location carrying
    /// the archive marker twice (`outer.tar!/inner.tar`) selects the nested
    /// form; a `.tar` suffix selects a plain archive; anything else is a
    /// directory.
    pub fn parse(location: &str) -> Bundle {
        if let Some((outer, inner)) = location.split_once(NESTED_SEPARATOR) {
            if outer.ends_with(ARCHIVE_MARKER) && inner.contains(ARCHIVE_MARKER) {
                return Bundle::nested(outer, inner);
            }
        }
        if location.ends_with(ARCHIVE_MARKER) {
            Bundle::archive(location)
        } else {
            Bundle::directory(location)
        }
    }

    /// Default bundle: the directory containing the current executable.
    pub fn for_current_exe() -> Bundle {
        let dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        Bundle::directory(dir)
    }

    /// Attach the version string substituted for `$(VERSION)`.
    pub fn with_version(mut self, version: impl Into<String>) -> Bundle {
        self.version = Some(version.into());
        self
    }

    /// Version substituted for `$(VERSION)`; `"0"` when not set.
    pub fn version(&self) -> &str {
        self.version.as_deref().unwrap_or("0")
    }

    /// List file entries whose path starts with `dir/` (any depth below it).
    pub(crate) fn list(&self, dir: &str) -> DeployResult<Vec<BundleEntry>> {
        match &self.root {
            BundleRoot::Dir(root) => {
                let full = join_relative(root, dir);
                if !full.is_dir() {
                    return Err(DeployError::ResourceNotFound {
                        path: full.display().to_string(),
                    });
                }
                let mut entries = Vec::new();
                for entry in fs::read_dir(&full).map_err(|e| DeployError::io(&full, e))? {
                    let entry = entry.map_err(|e| DeployError::io(&full, e))?;
                    let path = entry.path();
                    if path.is_dir() {
                        continue;
                    }
                    let meta = entry.metadata().map_err(|e| DeployError::io(&path, e))?;
                    entries.push(BundleEntry {
                        name: entry.file_name().to_string_lossy().into_owned(),
                        origin: Origin::File(path),
                        length: meta.len(),
                    });
                }
                // Directory read order is filesystem-dependent; make the
                // discovery order stable.
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(entries)
            }
            BundleRoot::Archive(archive) => {
                let mut tar = open_outer(archive)?;
                list_archive_entries(&mut tar, dir, Origin::Archive)
                    .map_err(|e| DeployError::io(archive, e))
            }
            BundleRoot::Nested { archive, inner } => {
                let mut tar = open_inner(archive, inner)?;
                list_archive_entries(&mut tar, dir, Origin::Nested)
                    .map_err(|e| DeployError::io(archive, e))
            }
        }
    }

    /// Resolve a single entry by its exact relative path.
    pub(crate) fn resolve(&self, path: &str) -> DeployResult<Option<BundleEntry>> {
        match &self.root {
            BundleRoot::Dir(root) => {
                let full = join_relative(root, path);
                match fs::metadata(&full) {
                    Ok(meta) if meta.is_file() => Ok(Some(BundleEntry {
                        name: basename(path).to_string(),
                        origin: Origin::File(full),
                        length: meta.len(),
                    })),
                    _ => Ok(None),
                }
            }
            BundleRoot::Archive(archive) => {
                let mut tar = open_outer(archive)?;
                find_archive_entry(&mut tar, path)
                    .map_err(|e| DeployError::io(archive, e))
                    .map(|found| {
                        found.map(|(_, length)| BundleEntry {
                            name: basename(path).to_string(),
                            origin: Origin::Archive(path.to_string()),
                            length,
                        })
                    })
            }
            BundleRoot::Nested { archive, inner } => {
                let mut tar = open_inner(archive, inner)?;
                find_archive_entry(&mut tar, path)
                    .map_err(|e| DeployError::io(archive, e))
                    .map(|found| {
                        found.map(|(_, length)| BundleEntry {
                            name: basename(path).to_string(),
                            origin: Origin::Nested(path.to_string()),
                            length,
                        })
                    })
            }
        }
    }

    /// Open a source stream for `origin`.
    pub(crate) fn open(&self, origin: &Origin) -> DeployResult<SourceReader> {
        match (origin, &self.root) {
            (Origin::File(path), _) => {
                let file = File::open(path).map_err(|e| DeployError::io(path, e))?;
                Ok(SourceReader::Plain(file))
            }
            (Origin::Archive(name), BundleRoot::Archive(archive)) => {
                let mut tar = open_outer(archive)?;
                let (offset, length) = find_archive_entry(&mut tar, name)
                    .map_err(|e| DeployError::io(archive, e))?
                    .ok_or_else(|| {
                        DeployError::io(archive, io::Error::new(io::ErrorKind::NotFound, name.clone()))
                    })?;
                slice_reader(archive, offset, length)
            }
            (Origin::Nested(name), BundleRoot::Nested { archive, inner }) => {
                let inner_offset = locate_inner(archive, inner)?.0;
                let mut tar = open_inner(archive, inner)?;
                let (offset, length) = find_archive_entry(&mut tar, name)
                    .map_err(|e| DeployError::io(archive, e))?
                    .ok_or_else(|| {
                        DeployError::io(archive, io::Error::new(io::ErrorKind::NotFound, name.clone()))
                    })?;
                slice_reader(archive, inner_offset + offset, length)
            }
            _ => Err(DeployError::io(
                PathBuf::from("<bundle>"),
                io::Error::new(io::ErrorKind::InvalidInput, "origin does not match bundle kind"),
            )),
        }
    }
}

fn open_outer(archive: &Path) -> DeployResult<Archive<File>> {
    let file = File::open(archive).map_err(|e| DeployError::io(archive, e))?;
    Ok(Archive::new(file))
}

/// Position and size of the inner archive entry within the outer file.
fn locate_inner(archive: &Path, inner: &str) -> DeployResult<(u64, u64)> {
    let mut outer = open_outer(archive)?;
    find_archive_entry(&mut outer, inner)
        .map_err(|e| DeployError::io(archive, e))?
        .ok_or_else(|| {
            DeployError::io(
                archive,
                io::Error::new(io::ErrorKind::NotFound, format!("inner archive {inner}")),
            )
        })
}

fn open_inner(archive: &Path, inner: &str) -> DeployResult<Archive<io::Take<File>>> {
    let (offset, length) = locate_inner(archive, inner)?;
    let mut file = File::open(archive).map_err(|e| DeployError::io(archive, e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| DeployError::io(archive, e))?;
    Ok(Archive::new(file.take(length)))
}

fn slice_reader(archive: &Path, offset: u64, length: u64) -> DeployResult<SourceReader> {
    let mut file = File::open(archive).map_err(|e| DeployError::io(archive, e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| DeployError::io(archive, e))?;
    Ok(SourceReader::Slice(file.take(length)))
}

/// An open stream positioned at the start of one resource's bytes.
pub(crate) enum SourceReader {
    Plain(File),
    Slice(io::Take<File>),
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SourceReader::Plain(file) => file.read(buf),
            SourceReader::Slice(slice) => slice.read(buf),
        }
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn join_relative(root: &Path, relative: &str) -> PathBuf {
    let mut full = root.to_path_buf();
    for part in relative.split('/').filter(|p| !p.is_empty()) {
        full.push(part);
    }
    full
}

fn entry_path_string<R: Read>(entry: &tar::Entry<R>) -> String {
    String::from_utf8_lossy(&entry.path_bytes()).into_owned()
}

/// Collect file entries below `dir/` as bundle entries with `make_origin`.
fn list_archive_entries<R: Read>(
    tar: &mut Archive<R>,
    dir: &str,
    make_origin: fn(String) -> Origin,
) -> io::Result<Vec<BundleEntry>> {
    let want = if dir.is_empty() {
        String::new()
    } else {
        format!("{dir}/")
    };

    let mut out = Vec::new();
    for entry in tar.entries()? {
        let entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry_path_string(&entry);
        if path.starts_with(&want) && path.len() > want.len() {
            out.push(BundleEntry {
                name: basename(&path).to_string(),
                origin: make_origin(path.clone()),
                length: entry.size(),
            });
        }
    }
    Ok(out)
}

/// Find an exact entry; returns its raw data offset within the stream and
/// its size.
fn find_archive_entry<R: Read>(tar: &mut Archive<R>, want: &str) -> io::Result<Option<(u64, u64)>> {
    for entry in tar.entries()? {
        let entry = entry?;
        if entry.header().entry_type().is_file() && entry_path_string(&entry) == want {
            return Ok(Some((entry.raw_file_position(), entry.size())));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn parse_detects_bundle_kinds() {
        assert!(matches!(Bundle::parse("/x/app").root, BundleRoot::Dir(_)));
        assert!(matches!(
            Bundle::parse("/x/app.tar").root,
            BundleRoot::Archive(_)
        ));
        assert!(matches!(
            Bundle::parse("/x/app.tar!/native/inner.tar").root,
            BundleRoot::Nested { .. }
        ));
    }

    #[test]
    fn version_defaults_to_zero() {
        assert_eq!(Bundle::directory("/x").version(), "0");
        assert_eq!(Bundle::directory("/x").with_version("3.1").version(), "3.1");
    }

    #[test]
    fn directory_bundle_lists_and_reads() {
        let dir = tempdir().unwrap();
        let res = dir.path().join("res");
        fs::create_dir_all(res.join("sub")).unwrap();
        fs::write(res.join("a.txt"), b"alpha").unwrap();
        fs::write(res.join("b.txt"), b"bravo").unwrap();

        let bundle = Bundle::directory(dir.path());
        let entries = bundle.list("res").unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt"], "subdirectories are skipped");
        assert_eq!(entries[0].length, 5);

        let mut content = Vec::new();
        bundle
            .open(&entries[0].origin)
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"alpha");
    }

    #[test]
    fn directory_bundle_resolves_single_entry() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("res")).unwrap();
        fs::write(dir.path().join("res/only.bin"), b"x").unwrap();

        let bundle = Bundle::directory(dir.path());
        let entry = bundle.resolve("res/only.bin").unwrap().unwrap();
        assert_eq!(entry.name, "only.bin");
        assert!(bundle.resolve("res/nope.bin").unwrap().is_none());
    }

    #[test]
    fn archive_bundle_lists_and_reads() {
        let dir = tempdir().unwrap();
        let tar_path = dir.path().join("app.tar");
        let bytes = tar_with(&[
            ("res/one.txt", b"one"),
            ("res/two.txt", b"twotwo"),
            ("other/miss.txt", b"nope"),
        ]);
        File::create(&tar_path).unwrap().write_all(&bytes).unwrap();

        let bundle = Bundle::archive(&tar_path);
        let entries = bundle.list("res").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "one.txt");
        assert_eq!(entries[1].length, 6);

        let mut content = Vec::new();
        bundle
            .open(&entries[1].origin)
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"twotwo");
    }

    #[test]
    fn nested_bundle_lists_and_reads() {
        let dir = tempdir().unwrap();
        let inner = tar_with(&[("res/deep.txt", b"nested payload")]);
        let outer_path = dir.path().join("app.tar");
        let outer = tar_with(&[("readme", b"hi"), ("native/inner.tar", &inner)]);
        File::create(&outer_path).unwrap().write_all(&outer).unwrap();

        let bundle = Bundle::nested(&outer_path, "native/inner.tar");
        let entries = bundle.list("res").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "deep.txt");

        let mut content = Vec::new();
        bundle
            .open(&entries[0].origin)
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"nested payload");
    }

    #[test]
    fn missing_directory_is_not_found() {
        let dir = tempdir().unwrap();
        let bundle = Bundle::directory(dir.path());
        let err = bundle.list("nothing/here").unwrap_err();
        assert!(matches!(err, DeployError::ResourceNotFound { .. }));
    }
}
