//! `$(NAME)` path-template expansion
//!
//! Source templates know `OS`, `ARCH`, `DLLEXT` and `VERSION`; deployment
//! templates additionally know `TEMP` and `RANDOM`. Substitution is a single
//! pass in that order; any residual `$(` afterwards is a syntax error, which
//! keeps typos from silently becoming literal directory names.

use std::env;

use crate::error::{DeployError, DeployResult};
use crate::platform;

/// Fresh random token for `$(RANDOM)` and fallback subdirectories:
/// 4 to 8 lowercase hex digits.
pub fn random_token() -> String {
    format!("{:04x}", rand::random::<u32>())
}

/// True iff `name` could have been produced by [`random_token`].
pub fn is_random_token(name: &str) -> bool {
    (4..=8).contains(&name.len()) && name.bytes().all(|b| b.is_ascii_hexdigit())
}

fn substitute(template: &str, pairs: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in pairs {
        out = out.replace(&format!("$({key})"), value);
    }
    out
}

/// Scan for a residual `$(` after substitution and reject it.
fn verify(expanded: String) -> DeployResult<String> {
    if let Some(start) = expanded.find("$(") {
        let kind = if expanded[start..].contains(')') {
            "unknown key"
        } else {
            "key not terminated"
        };
        return Err(DeployError::template(format!(
            "{kind} at position {start}: {}",
            &expanded[start..]
        )));
    }
    Ok(expanded)
}

/// Expand a resource (source) path template.
///
/// The expanded string must not contain whitespace, backslashes or `?`;
/// templates always use forward slashes.
pub fn expand_source(template: &str, version: &str) -> DeployResult<String> {
    let expanded = verify(substitute(
        template,
        &[
            ("OS", platform::os_name()),
            ("ARCH", platform::arch_bits()),
            ("DLLEXT", &platform::library_extension()[1..]),
            ("VERSION", version),
        ],
    ))?;

    if expanded
        .chars()
        .any(|c| c.is_whitespace() || c == '\\' || c == '?')
    {
        return Err(DeployError::template(format!(
            "invalid characters in expanded resource path: {expanded}"
        )));
    }

    Ok(expanded)
}

/// Expand a deployment (destination) path template.
pub fn expand_destination(template: &str, version: &str) -> DeployResult<String> {
    let temp = env::temp_dir();
    let random = format!("/{}", random_token());
    verify(substitute(
        template,
        &[
            ("OS", platform::os_name()),
            ("ARCH", platform::arch_bits()),
            ("DLLEXT", &platform::library_extension()[1..]),
            ("VERSION", version),
            ("TEMP", &temp.to_string_lossy()),
            ("RANDOM", &random),
        ],
    ))
}

/// Collapse repeated `/` and strip a leading one: bundle lookups are always
/// relative, forward-slash paths.
pub fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = true; // swallows a leading slash
    for c in path.chars() {
        if c == '/' {
            if !prev_slash {
                out.push('/');
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    if out.ends_with('/') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_platform_placeholders() {
        let s = expand_source("resources/$(OS)/$(ARCH)/lib.$(DLLEXT)", "0").unwrap();
        assert!(s.contains(platform::os_name()));
        assert!(s.contains(platform::arch_bits()));
        assert!(s.ends_with(&platform::library_extension()[1..]));
        assert!(!s.contains("$("));
    }

    #[test]
    fn expands_version() {
        let s = expand_source("v$(VERSION)/data", "1.2.3").unwrap();
        assert_eq!(s, "v1.2.3/data");
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = expand_source("resources/$(NOPE)/x", "0").unwrap_err();
        assert!(err.to_string().contains("unknown key"), "{err}");
    }

    #[test]
    fn unterminated_key_is_rejected() {
        let err = expand_source("resources/$(OS", "0").unwrap_err();
        assert!(err.to_string().contains("key not terminated"), "{err}");
    }

    #[test]
    fn temp_is_destination_only() {
        // In a source template TEMP stays unsubstituted and trips the check.
        let err = expand_source("$(TEMP)/x", "0").unwrap_err();
        assert!(matches!(err, DeployError::TemplateSyntax { .. }));

        let dst = expand_destination("$(TEMP)/x", "0").unwrap();
        assert!(dst.ends_with("/x") || dst.ends_with("\\x") || dst.contains("x"));
        assert!(!dst.contains("$("));
    }

    #[test]
    fn random_is_slash_prefixed_hex() {
        let dst = expand_destination("/tmp/base$(RANDOM)", "0").unwrap();
        let token = dst.rsplit('/').next().unwrap();
        assert!(is_random_token(token), "bad token in {dst}");
    }

    #[test]
    fn forbidden_characters_rejected() {
        for bad in ["a b/c", "a\\b", "a?b"] {
            assert!(expand_source(bad, "0").is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn random_token_shape() {
        for _ in 0..64 {
            assert!(is_random_token(&random_token()));
        }
    }

    #[test]
    fn normalize_collapses_slashes() {
        assert_eq!(normalize("//a///b/c/"), "a/b/c");
        assert_eq!(normalize("a/b"), "a/b");
        assert_eq!(normalize("/x"), "x");
    }
}
