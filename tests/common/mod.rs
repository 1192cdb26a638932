//! Common test utilities: bundle fixtures for deployment tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use unbundle::platform;

/// Relative resource directory used by the fixtures,
/// `resources/<OS>/<ARCH>`.
pub fn resource_dir() -> String {
    format!(
        "resources/{}/{}",
        platform::os_name(),
        platform::arch_bits()
    )
}

/// Source template matching everything in the fixture directory.
pub fn star_template() -> String {
    "resources/$(OS)/$(ARCH)/*".to_string()
}

pub fn compress(data: &[u8]) -> Vec<u8> {
    zstd::bulk::compress(data, 3).expect("zstd compression failed")
}

/// Lay out a development (directory) bundle under `root`. Entries are
/// `(name, bytes)` pairs placed in the platform resource directory.
pub fn dir_bundle(root: &Path, entries: &[(&str, Vec<u8>)]) -> PathBuf {
    let res = root.join(resource_dir());
    fs::create_dir_all(&res).expect("create bundle dirs");
    for (name, data) in entries {
        fs::write(res.join(name), data).expect("write bundle entry");
    }
    root.to_path_buf()
}

/// The four standard compressed fixtures `dummy1..4.txt.zst`.
pub fn standard_entries() -> Vec<(String, Vec<u8>)> {
    (1..=4)
        .map(|i| {
            (
                format!("dummy{i}.txt.zst"),
                compress(dummy_content(i).as_bytes()),
            )
        })
        .collect()
}

pub fn dummy_content(i: usize) -> String {
    format!("dummy file #{i}: some deployable payload\n")
}

/// Serialize `(path, bytes)` entries into an in-memory tar archive.
pub fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *data)
            .expect("append tar entry");
    }
    builder.into_inner().expect("finish tar")
}

/// Write a tar bundle holding the standard fixtures in the platform
/// resource directory; returns the archive path.
pub fn tar_bundle(dir: &Path) -> PathBuf {
    let res = resource_dir();
    let entries = standard_entries();
    let with_paths: Vec<(String, &[u8])> = entries
        .iter()
        .map(|(name, data)| (format!("{res}/{name}"), data.as_slice()))
        .collect();
    let borrowed: Vec<(&str, &[u8])> = with_paths
        .iter()
        .map(|(name, data)| (name.as_str(), *data))
        .collect();

    let path = dir.join("bundle.tar");
    fs::write(&path, tar_bytes(&borrowed)).expect("write tar bundle");
    path
}
