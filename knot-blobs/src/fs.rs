//! Importing files and directories into the store, and exporting them back.
//!
//! Imports report progress as a pull-based event stream. The import is atomic
//! from the outside: content is pinned with temp tags while files are read,
//! and the final tag is only written once everything is in the store. A
//! failed import emits [`AddProgress::Abort`] and leaves nothing tagged, so
//! the next gc pass cleans up whatever was already written.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, ensure, Context, Result};
use bytes::Bytes;
use futures::Stream;
use knot_base::{BlobFormat, Hash, HashAndFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::hashseq::HashSeq;
use crate::store::Store;
use crate::util::{Tag, TempTag};

/// Whether to wrap a single file into a collection on import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum WrapOption {
    /// Import the file as a raw blob.
    #[default]
    NoWrap,
    /// Wrap the file into a one element collection.
    Wrap {
        /// Override the displayed name of the file.
        name: Option<String>,
    },
}

/// Progress events of an import.
///
/// Consumers should match on the variants they know and ignore the rest, so
/// new variants can be added without breaking them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AddProgress {
    /// A file was found and import of it started.
    Found {
        /// Unique id of the file within this import.
        id: u64,
        /// The name of the file, relative to the import root.
        name: String,
        /// The size of the file in bytes.
        size: u64,
    },
    /// Progress ingesting the file with the given id.
    Progress {
        /// Unique id of the file within this import.
        id: u64,
        /// The offset up to which the file was ingested.
        offset: u64,
    },
    /// The file with the given id was fully ingested.
    Done {
        /// Unique id of the file within this import.
        id: u64,
        /// The hash of the file content.
        hash: Hash,
    },
    /// The import finished. Terminal event.
    AllDone {
        /// The hash of the imported content.
        hash: Hash,
        /// The format of the imported content.
        format: BlobFormat,
        /// The tag that now pins the content.
        tag: Tag,
    },
    /// The import failed. Terminal event.
    Abort(String),
}

/// Chunk size for progress reporting during file reads.
const READ_CHUNK: usize = 1024 * 1024;

/// Import a file or directory into the store.
///
/// A directory produces one blob per file plus a hash sequence root
/// enumerating the file hashes in path order. A file produces a single raw
/// blob, unless `wrap` asks for a one element collection. The root is pinned
/// with a fresh auto tag reported in [`AddProgress::AllDone`].
///
/// The returned stream ends after a terminal event.
pub fn import_path(
    store: Store,
    path: PathBuf,
    wrap: WrapOption,
) -> impl Stream<Item = AddProgress> {
    let (tx, rx) = flume::bounded(32);
    tokio::task::spawn_blocking(move || {
        let event = match import_path_sync(&store, &path, wrap, &tx) {
            Ok((hash, format, tag)) => AddProgress::AllDone { hash, format, tag },
            Err(cause) => AddProgress::Abort(cause.to_string()),
        };
        tx.send(event).ok();
    });
    rx.into_stream()
}

fn import_path_sync(
    store: &Store,
    path: &Path,
    wrap: WrapOption,
    tx: &flume::Sender<AddProgress>,
) -> Result<(Hash, BlobFormat, Tag)> {
    let path = path
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {}", path.display()))?;
    ensure!(path.exists(), "path {} does not exist", path.display());

    // temp tags keep everything alive until the final tag is written
    let mut pins: Vec<TempTag> = Vec::new();
    let root = if path.is_dir() {
        let mut hashes = Vec::new();
        for (id, entry) in source_files(&path)?.into_iter().enumerate() {
            let name = entry
                .strip_prefix(&path)
                .expect("walked below root")
                .to_string_lossy()
                .into_owned();
            let pin = import_file(store, id as u64, &entry, name, tx)?;
            hashes.push(*pin.hash());
            pins.push(pin);
        }
        let seq: HashSeq = hashes.into_iter().collect();
        store.import_bytes(seq.into_inner(), BlobFormat::HashSeq)
    } else {
        let name = match &wrap {
            WrapOption::Wrap { name: Some(name) } => name.clone(),
            _ => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| anyhow!("path has no file name"))?,
        };
        let pin = import_file(store, 0, &path, name, tx)?;
        match wrap {
            WrapOption::NoWrap => pin,
            WrapOption::Wrap { .. } => {
                let seq: HashSeq = [*pin.hash()].into_iter().collect();
                pins.push(pin);
                store.import_bytes(seq.into_inner(), BlobFormat::HashSeq)
            }
        }
    };
    let content = root.hash_and_format();
    let tag = store.create_tag(content);
    debug!(hash = %content.hash.fmt_short(), ?tag, "import done");
    Ok((content.hash, content.format, tag))
}

/// All files below a directory, in path order.
fn source_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn import_file(
    store: &Store,
    id: u64,
    path: &Path,
    name: String,
    tx: &flume::Sender<AddProgress>,
) -> Result<TempTag> {
    let size = path.metadata()?.len();
    tx.send(AddProgress::Found { id, name, size }).ok();
    let data = std::fs::read(path)?;
    for offset in (0..data.len()).step_by(READ_CHUNK).skip(1) {
        tx.send(AddProgress::Progress {
            id,
            offset: offset as u64,
        })
        .ok();
    }
    let pin = store.import_bytes(Bytes::from(data), BlobFormat::Raw);
    tx.send(AddProgress::Done {
        id,
        hash: *pin.hash(),
    })
    .ok();
    Ok(pin)
}

/// Export content from the store to a path.
///
/// A raw blob is written to `path` directly. A hash sequence creates `path`
/// as a directory and writes each child into it, named by its index in the
/// sequence. Each file is written completely or not at all.
pub async fn export_path(store: Store, content: HashAndFormat, path: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || export_path_sync(&store, content, &path)).await?
}

fn export_path_sync(store: &Store, content: HashAndFormat, path: &Path) -> Result<()> {
    match content.format {
        BlobFormat::Raw => {
            let data = read_complete(store, &content.hash)?;
            write_atomic(path, &data)
        }
        BlobFormat::HashSeq => {
            let root = read_complete(store, &content.hash)?;
            let seq = HashSeq::new(root)?;
            std::fs::create_dir_all(path)?;
            for (index, hash) in seq.iter().enumerate() {
                let data = read_complete(store, &hash)?;
                write_atomic(&path.join(index.to_string()), &data)?;
            }
            Ok(())
        }
    }
}

fn read_complete(store: &Store, hash: &Hash) -> Result<Bytes> {
    store
        .get(hash)
        .ok_or_else(|| anyhow!("blob {} not found", hash))
}

/// Write via a temporary sibling so a failed write leaves no torn file.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("knot-tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::store::EntryStatus;

    async fn collect(stream: impl Stream<Item = AddProgress>) -> Vec<AddProgress> {
        stream.collect().await
    }

    fn terminal(events: &[AddProgress]) -> &AddProgress {
        events.last().expect("stream emits a terminal event")
    }

    #[tokio::test]
    async fn test_import_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hello.txt");
        std::fs::write(&file, b"hello world").unwrap();

        let store = Store::new();
        let events = collect(import_path(store.clone(), file, WrapOption::NoWrap)).await;
        let AddProgress::AllDone { hash, format, .. } = terminal(&events) else {
            panic!("expected AllDone, got {:?}", terminal(&events));
        };
        assert_eq!(*format, BlobFormat::Raw);
        assert_eq!(*hash, Hash::new(b"hello world"));
        assert_eq!(store.get(hash).unwrap().as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn test_import_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"aaa").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bbb").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("c.txt"), b"ccc").unwrap();

        let store = Store::new();
        let events = collect(import_path(
            store.clone(),
            dir.path().to_owned(),
            WrapOption::NoWrap,
        ))
        .await;
        let AddProgress::AllDone { hash, format, tag } = terminal(&events) else {
            panic!("expected AllDone, got {:?}", terminal(&events));
        };
        assert_eq!(*format, BlobFormat::HashSeq);

        // three files plus the root
        assert_eq!(store.blobs().len(), 4);
        let seq = HashSeq::new(store.get(hash).unwrap()).unwrap();
        assert_eq!(seq.len(), 3);

        // the tag keeps the whole collection alive
        assert!(store.tags().iter().any(|(t, _)| t == tag));
        let stats = store.gc([]);
        assert_eq!(stats.blobs_deleted, 0);

        let found: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                AddProgress::Found { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(found, vec!["a.txt", "b.txt", "sub/c.txt"]);
    }

    #[tokio::test]
    async fn test_import_wrapped_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("single.bin");
        std::fs::write(&file, b"wrapped").unwrap();

        let store = Store::new();
        let events = collect(import_path(
            store.clone(),
            file,
            WrapOption::Wrap { name: None },
        ))
        .await;
        let AddProgress::AllDone { hash, format, .. } = terminal(&events) else {
            panic!("expected AllDone");
        };
        assert_eq!(*format, BlobFormat::HashSeq);
        let seq = HashSeq::new(store.get(hash).unwrap()).unwrap();
        assert_eq!(seq.len(), 1);
        assert_eq!(seq.get(0), Some(Hash::new(b"wrapped")));
    }

    #[tokio::test]
    async fn test_import_missing_path_aborts() {
        let store = Store::new();
        let events = collect(import_path(
            store.clone(),
            PathBuf::from("/definitely/not/here"),
            WrapOption::NoWrap,
        ))
        .await;
        assert!(matches!(terminal(&events), AddProgress::Abort(_)));
        assert!(store.tags().is_empty());
    }

    #[tokio::test]
    async fn test_export_roundtrip() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("x"), b"xx").unwrap();
        std::fs::write(src.path().join("y"), b"yy").unwrap();

        let store = Store::new();
        let events = collect(import_path(
            store.clone(),
            src.path().to_owned(),
            WrapOption::NoWrap,
        ))
        .await;
        let AddProgress::AllDone { hash, format, .. } = terminal(&events) else {
            panic!("expected AllDone");
        };
        let content = HashAndFormat {
            hash: *hash,
            format: *format,
        };

        let dst = tempfile::tempdir().unwrap();
        let out = dst.path().join("export");
        export_path(store.clone(), content, out.clone()).await.unwrap();
        assert_eq!(std::fs::read(out.join("0")).unwrap(), b"xx");
        assert_eq!(std::fs::read(out.join("1")).unwrap(), b"yy");
    }

    #[tokio::test]
    async fn test_export_missing_blob_fails() {
        let store = Store::new();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("missing");
        let content = HashAndFormat::raw(Hash::new(b"nowhere"));
        assert!(export_path(store, content, out.clone()).await.is_err());
        assert!(!out.exists());
    }
}
