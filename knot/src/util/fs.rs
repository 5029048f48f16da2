//! Mapping between filesystem paths and document keys.

use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;

/// Derive a document key from a file path.
///
/// The key is the concatenation of the `prefix` bytes, the path relative to
/// `root` (or the path as given, if no root is set) with components joined
/// by `/`, and a terminating NUL byte. [`key_to_path`] is the inverse.
pub fn path_to_key(
    path: impl AsRef<Path>,
    prefix: Option<String>,
    root: Option<PathBuf>,
) -> Result<Bytes> {
    let path = path.as_ref();
    let path = match root {
        Some(ref root) => path
            .strip_prefix(root)
            .with_context(|| format!("path {} is not below root {}", path.display(), root.display()))?,
        None => path,
    };
    let suffix = canonicalized_path_to_string(path, false)?.into_bytes();
    let mut key = prefix.map(String::into_bytes).unwrap_or_default();
    key.extend(suffix);
    key.push(0);
    Ok(key.into())
}

/// Derive a file path from a document key, inverse of [`path_to_key`].
pub fn key_to_path(
    key: impl AsRef<[u8]>,
    prefix: Option<String>,
    root: Option<PathBuf>,
) -> Result<PathBuf> {
    let key = key.as_ref();
    let key = key
        .strip_suffix(&[0])
        .context("key is not terminated with a NUL byte")?;
    let key = match prefix {
        Some(ref prefix) => key
            .strip_prefix(prefix.as_bytes())
            .with_context(|| format!("key does not start with prefix {prefix:?}"))?,
        None => key,
    };
    let path_str = std::str::from_utf8(key).context("key is not valid utf8")?;
    let mut path = if path_str.starts_with('/') {
        PathBuf::from("/")
    } else {
        PathBuf::new()
    };
    for component in path_str.split('/').filter(|part| !part.is_empty()) {
        path.push(component);
    }
    let path = match root {
        Some(root) => root.join(path),
        None => path,
    };
    Ok(path)
}

/// Turn a path into a canonical string with components joined by `/`.
///
/// Only normal components (and a leading root, unless `must_be_relative`)
/// are allowed: `..`, `.` and prefix components are rejected, as are
/// component names containing separators.
pub fn canonicalized_path_to_string(
    path: impl AsRef<Path>,
    must_be_relative: bool,
) -> Result<String> {
    let mut out = String::new();
    let parts = path
        .as_ref()
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => {
                let Some(part) = part.to_str() else {
                    return Some(Err(anyhow!("invalid character in path")));
                };
                if part.contains('/') || part.contains('\\') {
                    Some(Err(anyhow!("invalid path component {part:?}")))
                } else {
                    Some(Ok(part))
                }
            }
            Component::RootDir if !must_be_relative => {
                out.push('/');
                None
            }
            component => Some(Err(anyhow!("invalid path component {component:?}"))),
        })
        .collect::<Result<Vec<_>>>()?;
    out.push_str(&parts.join("/"));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_to_key_roundtrip() {
        let path = PathBuf::from("/foo/bar/baz.txt");
        let expect = Bytes::from("/foo/bar/baz.txt\0");
        assert_eq!(path_to_key(&path, None, None).unwrap(), expect);
        assert_eq!(key_to_path(&expect, None, None).unwrap(), path);

        // including a prefix
        let key = path_to_key(&path, Some("prefix:".into()), None).unwrap();
        assert_eq!(key, Bytes::from("prefix:/foo/bar/baz.txt\0"));
        assert_eq!(key_to_path(&key, Some("prefix:".into()), None).unwrap(), path);

        // including a root
        let key = path_to_key(&path, Some("prefix:".into()), Some("/foo".into())).unwrap();
        assert_eq!(key, Bytes::from("prefix:bar/baz.txt\0"));
        assert_eq!(
            key_to_path(&key, Some("prefix:".into()), Some("/foo".into())).unwrap(),
            path
        );
    }

    #[test]
    fn test_path_to_key_rejects_traversal() {
        assert!(path_to_key("../escape.txt", None, None).is_err());
        assert!(path_to_key("./a/b", None, None).is_err());
    }

    #[test]
    fn test_key_to_path_rejects_malformed() {
        // missing NUL terminator
        assert!(key_to_path(b"foo/bar", None, None).is_err());
        // wrong prefix
        assert!(key_to_path(b"other:foo\0", Some("prefix:".into()), None).is_err());
        // invalid utf8
        assert!(key_to_path(b"\xff\xfe\0", None, None).is_err());
    }

    #[test]
    fn test_canonicalized_path_to_string() {
        assert_eq!(
            canonicalized_path_to_string("foo/bar", true).unwrap(),
            "foo/bar"
        );
        assert_eq!(
            canonicalized_path_to_string("/foo/bar", false).unwrap(),
            "/foo/bar"
        );
        assert!(canonicalized_path_to_string("/foo/bar", true).is_err());
    }
}
