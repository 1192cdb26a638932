//! Platform probes: OS name, pointer width, dynamic-library extension, and
//! the per-OS deployment roots tried for relative deployment paths.

use std::env;
use std::path::PathBuf;

/// OS name as used by the `$(OS)` template placeholder.
pub fn os_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "Windows"
    } else if cfg!(target_os = "macos") {
        "OSX"
    } else {
        "Linux"
    }
}

/// Pointer width as used by the `$(ARCH)` template placeholder.
pub fn arch_bits() -> &'static str {
    if cfg!(target_pointer_width = "64") {
        "64"
    } else {
        "32"
    }
}

/// Dynamic-library extension with the leading dot (`.dll`, `.so`, `.dylib`).
pub fn library_extension() -> &'static str {
    if cfg!(target_os = "windows") {
        ".dll"
    } else if cfg!(target_os = "macos") {
        ".dylib"
    } else {
        ".so"
    }
}

/// True iff `ext` (with leading dot) is this platform's library extension.
pub fn is_library_extension(ext: &str) -> bool {
    ext == library_extension()
}

pub fn is_windows() -> bool {
    cfg!(target_os = "windows")
}

/// Ordered per-OS roots that a relative deployment path is joined onto.
///
/// Only absolute roots that exist are returned; the system temp directory is
/// appended by the engine separately, so it is not part of this list.
pub fn data_roots() -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = Vec::new();

    if cfg!(target_os = "windows") {
        for var in ["ProgramData", "AppData"] {
            if let Ok(value) = env::var(var) {
                if !value.is_empty() {
                    roots.push(PathBuf::from(value));
                }
            }
        }
    } else if cfg!(target_os = "macos") {
        if let Some(home) = dirs::home_dir() {
            roots.push(home.join("Library/Application Support"));
        }
    } else if let Some(home) = dirs::home_dir() {
        roots.push(home.join(".local/share"));
    }

    roots.retain(|r| r.is_absolute() && r.exists());
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_is_32_or_64() {
        assert!(matches!(arch_bits(), "32" | "64"));
    }

    #[test]
    fn os_name_matches_library_extension() {
        match os_name() {
            "Windows" => assert_eq!(library_extension(), ".dll"),
            "OSX" => assert_eq!(library_extension(), ".dylib"),
            "Linux" => assert_eq!(library_extension(), ".so"),
            other => panic!("unexpected OS name: {other}"),
        }
    }

    #[test]
    fn library_extension_check() {
        assert!(is_library_extension(library_extension()));
        assert!(!is_library_extension(".txt"));
    }

    #[test]
    fn data_roots_are_absolute() {
        for root in data_roots() {
            assert!(root.is_absolute(), "root not absolute: {}", root.display());
        }
    }
}
