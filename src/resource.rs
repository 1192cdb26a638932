//! Deployable resources: name tags, output naming, load order, enumeration
//!
//! A resource's bundle name may carry `[key@value]` tags; the only
//! recognised key is `order`, which ranks dynamic libraries for loading.
//! Output names are derived by replacing underscores with dots (so archive
//! entries can avoid dots entirely), stripping a trailing `.zst`, and
//! optionally inserting a library-name suffix before the extension.

use crate::bundle::{Bundle, BundleEntry, Origin};
use crate::error::{DeployError, DeployResult};
use crate::fs::LockedFile;
use crate::platform;
use crate::template;

/// Largest source (and decompressed) size the engine will handle.
pub(crate) const MAX_RESOURCE_LENGTH: u64 = i32::MAX as u64;

const COMPRESSED_SUFFIX: &str = ".zst";

/// One file to be deployed.
#[derive(Debug)]
pub struct Resource {
    pub(crate) origin: Origin,
    /// Original basename inside the bundle, tags removed.
    pub display_name: String,
    /// Name written to the deployment root.
    pub output_name: String,
    pub is_compressed: bool,
    pub is_dynamic_library: bool,
    /// Source byte length before decompression.
    pub length: u32,
    /// Load rank: explicit `[order@N]` tags sort below (before) implicit
    /// enumeration indexes.
    pub order: i32,
    /// Position in discovery order; breaks load-order ties.
    pub(crate) index: usize,
    pub(crate) read_lock: Option<LockedFile>,
    pub(crate) is_loaded: bool,
}

impl Resource {
    fn from_entry(
        entry: BundleEntry,
        index: usize,
        library_suffix: Option<&str>,
    ) -> DeployResult<Resource> {
        let (display_name, tags) = strip_tags(&entry.name);

        let dotted = display_name.replace('_', ".");
        let is_compressed = dotted.ends_with(COMPRESSED_SUFFIX);
        let bare = if is_compressed {
            &dotted[..dotted.len() - COMPRESSED_SUFFIX.len()]
        } else {
            dotted.as_str()
        };
        let output_name = rename_library(bare, library_suffix);
        let is_dynamic_library = output_name.ends_with(platform::library_extension());

        let mut order = index as i32;
        for (key, value) in &tags {
            if key == "order" {
                let rank: i32 = value.parse().map_err(|_| {
                    DeployError::template(format!(
                        "order tag invalid, non-negative integer expected: [order@{value}]"
                    ))
                })?;
                if rank < 0 {
                    return Err(DeployError::template(format!(
                        "order tag invalid, non-negative integer expected: [order@{value}]"
                    )));
                }
                // Shift explicit ranks below every implicit index so tagged
                // entries always load first.
                order = rank + i32::MIN;
            } else {
                return Err(DeployError::template(format!(
                    "invalid tag: [{key}@{value}]"
                )));
            }
        }

        if entry.length > MAX_RESOURCE_LENGTH {
            return Err(DeployError::ResourceInvalid {
                name: entry.name,
                message: format!("source length {} is too big", entry.length),
            });
        }

        Ok(Resource {
            origin: entry.origin,
            display_name,
            output_name,
            is_compressed,
            is_dynamic_library,
            length: entry.length as u32,
            order,
            index,
            read_lock: None,
            is_loaded: false,
        })
    }
}

/// Insert the configured suffix before a platform library extension.
fn rename_library(name: &str, library_suffix: Option<&str>) -> String {
    if let (Some(suffix), Some(dot)) = (library_suffix, name.rfind('.')) {
        if platform::is_library_extension(&name[dot..]) {
            return format!("{}{}{}", &name[..dot], suffix, &name[dot..]);
        }
    }
    name.to_string()
}

/// Remove every `[key@value]` tag from `name`, returning the cleaned name
/// and the tags in order of appearance. Neither key nor value may contain
/// `@` or `]`; anything that does not match stays in the name verbatim.
pub fn strip_tags(name: &str) -> (String, Vec<(String, String)>) {
    let bytes = name.as_bytes();
    let mut out = String::with_capacity(name.len());
    let mut tags = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'[' {
            if let Some((key, value, end)) = match_tag(name, i) {
                tags.push((key, value));
                i = end;
                continue;
            }
        }
        // Names are plain ASCII in practice, but stay UTF-8 correct.
        let c = name[i..].chars().next().unwrap();
        out.push(c);
        i += c.len_utf8();
    }

    (out, tags)
}

/// Try to match `[key@value]` starting at byte `start` (which is `[`).
/// Returns the parts and the byte index just past the closing `]`.
fn match_tag(name: &str, start: usize) -> Option<(String, String, usize)> {
    let bytes = name.as_bytes();
    let mut i = start + 1;

    let key_start = i;
    while i < bytes.len() && bytes[i] != b'@' && bytes[i] != b']' {
        i += 1;
    }
    if i >= bytes.len() || bytes[i] != b'@' {
        return None;
    }
    let key = &name[key_start..i];

    i += 1;
    let value_start = i;
    while i < bytes.len() && bytes[i] != b'@' && bytes[i] != b']' {
        i += 1;
    }
    if i >= bytes.len() || bytes[i] != b']' {
        return None;
    }
    let value = &name[value_start..i];

    Some((key.to_string(), value.to_string(), i + 1))
}

/// The expanded source path split around its single optional `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePattern {
    /// Directory part, no leading or trailing slash; empty for bundle root.
    pub dir: String,
    /// Basename part before the `*`.
    pub prefix: String,
    /// Basename part after the `*`; `None` when the pattern names a single
    /// resource (note that `Some("")` is a star match, `None` is not).
    pub suffix: Option<String>,
}

impl SourcePattern {
    pub fn parse(expanded: &str) -> DeployResult<SourcePattern> {
        let normalized = template::normalize(expanded);

        let (dir, file) = match normalized.rfind('/') {
            Some(pos) => (&normalized[..pos], &normalized[pos + 1..]),
            None => {
                if normalized.contains('*') {
                    return Err(DeployError::template(format!(
                        "'*' not supported without a path component in: {normalized}"
                    )));
                }
                ("", normalized.as_str())
            }
        };

        let parts: Vec<&str> = file.split('*').collect();
        if parts.len() > 2 {
            return Err(DeployError::template(format!(
                "resource path must contain at most one '*' character: {normalized}"
            )));
        }

        Ok(SourcePattern {
            dir: dir.to_string(),
            prefix: parts[0].to_string(),
            suffix: parts.get(1).map(|s| s.to_string()),
        })
    }

    /// Does the pattern name exactly one resource?
    pub fn is_single(&self) -> bool {
        self.suffix.is_none()
    }

    /// Relative bundle path of the single resource.
    pub(crate) fn single_path(&self) -> String {
        if self.dir.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.dir, self.prefix)
        }
    }

    /// Human-readable form of the pattern, `dir/prefix*suffix`.
    pub fn display(&self) -> String {
        match &self.suffix {
            Some(suffix) => format!("{}/{}*{}", self.dir, self.prefix, suffix),
            None => self.single_path(),
        }
    }

    fn matches(&self, basename: &str) -> bool {
        let suffix = self.suffix.as_deref().unwrap_or("");
        basename.len() >= self.prefix.len() + suffix.len()
            && basename.starts_with(&self.prefix)
            && basename.ends_with(suffix)
    }
}

/// Discover every resource matching `pattern` inside `bundle`.
pub fn enumerate(
    bundle: &Bundle,
    pattern: &SourcePattern,
    library_suffix: Option<&str>,
) -> DeployResult<Vec<Resource>> {
    let resources = if pattern.is_single() {
        let path = pattern.single_path();
        let entry = match bundle.resolve(&path)? {
            Some(entry) => Some(entry),
            None => find_library_variant(bundle, &path)?,
        };
        let entry = entry.ok_or_else(|| DeployError::ResourceNotFound { path: path.clone() })?;
        // The output name always derives from the requested name, even when
        // a fallback variant supplied the bytes.
        let named = BundleEntry {
            name: basename(&path).to_string(),
            ..entry
        };
        vec![Resource::from_entry(named, 0, library_suffix)?]
    } else {
        let entries = bundle.list(&pattern.dir)?;
        let mut resources = Vec::new();
        for entry in entries.into_iter().filter(|e| pattern.matches(&e.name)) {
            let index = resources.len();
            resources.push(Resource::from_entry(entry, index, library_suffix)?);
        }
        resources
    };

    if resources.is_empty() {
        return Err(DeployError::ResourceNotFound {
            path: pattern.display(),
        });
    }

    for (i, a) in resources.iter().enumerate() {
        if resources[..i].iter().any(|b| b.output_name == a.output_name) {
            return Err(DeployError::ResourceInvalid {
                name: a.display_name.clone(),
                message: format!("duplicate output name '{}'", a.output_name),
            });
        }
    }

    Ok(resources)
}

/// Fallback lookup for a single resource that looks like a dynamic library:
/// try `{with/without "lib" prefix} x {"." / "_" before the extension}`.
fn find_library_variant(bundle: &Bundle, path: &str) -> DeployResult<Option<BundleEntry>> {
    let name_start = path.rfind('/').map(|p| p + 1).unwrap_or(0);
    let (dir_part, file_part) = path.split_at(name_start);

    let underscored = file_part.replace('.', "_");
    let (mut stem, _) = strip_tags(&underscored);
    if stem.ends_with("_zst") {
        stem.truncate(stem.len() - 4);
    }

    let ext = platform::library_extension(); // ".so"
    let underscored_ext = format!("_{}", &ext[1..]); // "_so"
    if !stem.ends_with(&underscored_ext) {
        return Ok(None);
    }
    stem.truncate(stem.len() - underscored_ext.len());
    if stem.is_empty() {
        return Ok(None);
    }

    // Locate the base name within the original (dotted) request to keep
    // whatever trailed it (extension, compression suffix) intact.
    let base_pos = match file_part.find(stem.as_str()) {
        Some(pos) => name_start + pos,
        None => return Ok(None),
    };
    let tail_dotted = &path[base_pos + stem.len()..];
    let tail_underscored = tail_dotted.replace(ext, &underscored_ext);

    for with_lib in [true, false] {
        for tail in [tail_underscored.as_str(), tail_dotted] {
            let candidate = format!(
                "{}{}{}{}",
                dir_part,
                if with_lib { "lib" } else { "" },
                stem,
                tail
            );
            if let Some(entry) = bundle.resolve(&candidate)? {
                return Ok(Some(entry));
            }
        }
    }

    Ok(None)
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn entry(name: &str, length: u64) -> BundleEntry {
        BundleEntry {
            name: name.to_string(),
            origin: Origin::Archive(format!("res/{name}")),
            length,
        }
    }

    #[test]
    fn strip_tags_recovers_name_and_tags() {
        let (name, tags) = strip_tags("kerne[i@141]l32_d[foo@b[*~ar]ll_zst");
        assert_eq!(name, "kernel32_dll_zst");
        assert_eq!(
            tags,
            vec![
                ("i".to_string(), "141".to_string()),
                ("foo".to_string(), "b[*~ar".to_string()),
            ]
        );
    }

    #[test]
    fn strip_tags_leaves_untagged_names_alone() {
        let (name, tags) = strip_tags("plain_name.so");
        assert_eq!(name, "plain_name.so");
        assert!(tags.is_empty());

        let (name, tags) = strip_tags("broken[tag");
        assert_eq!(name, "broken[tag");
        assert!(tags.is_empty());
    }

    #[test]
    fn output_name_derivation() {
        let r = Resource::from_entry(entry("dummy1_txt_zst", 10), 0, None).unwrap();
        assert_eq!(r.display_name, "dummy1_txt_zst");
        assert_eq!(r.output_name, "dummy1.txt");
        assert!(r.is_compressed);
        assert!(!r.is_dynamic_library);

        let r = Resource::from_entry(entry("data.txt.zst", 10), 0, None).unwrap();
        assert_eq!(r.output_name, "data.txt");
        assert!(r.is_compressed);
    }

    #[test]
    fn library_detection_and_suffix() {
        let ext = platform::library_extension();
        let name = format!("libsample{ext}");

        let r = Resource::from_entry(entry(&name, 10), 0, None).unwrap();
        assert!(r.is_dynamic_library);
        assert_eq!(r.output_name, name);

        let r = Resource::from_entry(entry(&name, 10), 0, Some("-v2")).unwrap();
        assert_eq!(r.output_name, format!("libsample-v2{ext}"));
        assert!(r.is_dynamic_library);
    }

    #[test]
    fn explicit_order_sorts_before_implicit() {
        let tagged = Resource::from_entry(entry("a[order@5]_txt", 10), 3, None).unwrap();
        let untagged = Resource::from_entry(entry("b_txt", 10), 0, None).unwrap();
        assert_eq!(tagged.order, 5 + i32::MIN);
        assert_eq!(untagged.order, 0);
        assert!(tagged.order < untagged.order);
        assert_eq!(tagged.output_name, "a.txt");
    }

    #[test]
    fn bad_order_tag_is_rejected() {
        for name in ["x[order@-1]_txt", "x[order@abc]_txt", "x[order@]_txt"] {
            let err = Resource::from_entry(entry(name, 10), 0, None).unwrap_err();
            assert!(
                matches!(err, DeployError::TemplateSyntax { .. }),
                "{name}: {err}"
            );
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = Resource::from_entry(entry("x[weight@3]_txt", 10), 0, None).unwrap_err();
        assert!(err.to_string().contains("invalid tag: [weight@3]"));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let err =
            Resource::from_entry(entry("big.bin", MAX_RESOURCE_LENGTH + 1), 0, None).unwrap_err();
        assert!(matches!(err, DeployError::ResourceInvalid { .. }));
    }

    #[test]
    fn pattern_parse_splits_on_star() {
        let p = SourcePattern::parse("resources/Linux/64/*").unwrap();
        assert_eq!(p.dir, "resources/Linux/64");
        assert_eq!(p.prefix, "");
        assert_eq!(p.suffix.as_deref(), Some(""));
        assert!(!p.is_single());

        let p = SourcePattern::parse("resources/dummy*.txt").unwrap();
        assert_eq!(p.prefix, "dummy");
        assert_eq!(p.suffix.as_deref(), Some(".txt"));
        assert_eq!(p.display(), "resources/dummy*.txt");
    }

    #[test]
    fn pattern_parse_single_file() {
        let p = SourcePattern::parse("//resources//Linux/dummy1.txt.zst").unwrap();
        assert!(p.is_single());
        assert_eq!(p.single_path(), "resources/Linux/dummy1.txt.zst");
    }

    #[test]
    fn pattern_rejects_multiple_stars() {
        let err = SourcePattern::parse("res/a*b*c").unwrap_err();
        assert!(matches!(err, DeployError::TemplateSyntax { .. }));
    }

    #[test]
    fn pattern_rejects_rootless_star() {
        let err = SourcePattern::parse("abc*").unwrap_err();
        assert!(err.to_string().contains("'*' not supported"));
    }

    #[test]
    fn enumerate_filters_by_prefix_and_suffix() {
        let dir = tempdir().unwrap();
        let res = dir.path().join("res");
        fs::create_dir_all(&res).unwrap();
        for name in ["dummy1.txt", "dummy2.txt", "other.txt", "dummy3.bin"] {
            fs::write(res.join(name), b"x").unwrap();
        }

        let bundle = Bundle::directory(dir.path());
        let pattern = SourcePattern::parse("res/dummy*.txt").unwrap();
        let resources = enumerate(&bundle, &pattern, None).unwrap();
        let names: Vec<&str> = resources.iter().map(|r| r.output_name.as_str()).collect();
        assert_eq!(names, vec!["dummy1.txt", "dummy2.txt"]);
        assert_eq!(resources[1].index, 1);
    }

    #[test]
    fn enumerate_empty_match_is_not_found() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("res")).unwrap();
        let bundle = Bundle::directory(dir.path());
        let pattern = SourcePattern::parse("res/*").unwrap();
        let err = enumerate(&bundle, &pattern, None).unwrap_err();
        assert!(matches!(err, DeployError::ResourceNotFound { .. }));
    }

    #[test]
    fn enumerate_single_missing_is_not_found() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("res")).unwrap();
        let bundle = Bundle::directory(dir.path());
        let pattern = SourcePattern::parse("res/gone.txt").unwrap();
        assert!(enumerate(&bundle, &pattern, None).is_err());
    }

    #[test]
    fn enumerate_rejects_duplicate_output_names() {
        let dir = tempdir().unwrap();
        let res = dir.path().join("res");
        fs::create_dir_all(&res).unwrap();
        // Both normalise to "a.txt".
        fs::write(res.join("a_txt"), b"x").unwrap();
        fs::write(res.join("a.txt"), b"y").unwrap();

        let bundle = Bundle::directory(dir.path());
        let pattern = SourcePattern::parse("res/a*").unwrap();
        let err = enumerate(&bundle, &pattern, None).unwrap_err();
        assert!(matches!(err, DeployError::ResourceInvalid { .. }));
    }

    #[test]
    fn library_fallback_finds_lib_prefixed_underscore_variant() {
        let dir = tempdir().unwrap();
        let res = dir.path().join("res");
        fs::create_dir_all(&res).unwrap();
        let ext = &platform::library_extension()[1..];
        // Stored with "lib" prefix and underscore extension separator.
        fs::write(res.join(format!("libsample_{ext}")), b"fake library").unwrap();

        let bundle = Bundle::directory(dir.path());
        let requested = format!("res/sample.{ext}");
        let pattern = SourcePattern::parse(&requested).unwrap();
        let resources = enumerate(&bundle, &pattern, None).unwrap();
        assert_eq!(resources.len(), 1);
        // Named after the request, not the stored variant.
        assert_eq!(resources[0].output_name, format!("sample.{ext}"));
        assert!(resources[0].is_dynamic_library);
    }

    #[test]
    fn library_fallback_ignores_non_libraries() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("res")).unwrap();
        let bundle = Bundle::directory(dir.path());
        let pattern = SourcePattern::parse("res/readme.txt").unwrap();
        let err = enumerate(&bundle, &pattern, None).unwrap_err();
        assert!(matches!(err, DeployError::ResourceNotFound { .. }));
    }
}
