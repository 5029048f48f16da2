//! Sequences of hashes, the wire format of collections.
//!
//! A hash sequence is just the concatenation of 32 byte hashes. A blob with
//! [`knot_base::BlobFormat::HashSeq`] format contains such a sequence and
//! thereby references its children, e.g. the files of an imported directory.

use anyhow::{ensure, Result};
use bytes::Bytes;
use knot_base::Hash;

/// A sequence of hashes backed by a byte blob.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HashSeq(Bytes);

impl HashSeq {
    /// Parse a hash sequence from its blob representation.
    ///
    /// Fails if the length is not a multiple of 32.
    pub fn new(bytes: Bytes) -> Result<Self> {
        ensure!(
            bytes.len() % 32 == 0,
            "invalid hash sequence length {}",
            bytes.len()
        );
        Ok(Self(bytes))
    }

    /// The number of hashes in the sequence.
    pub fn len(&self) -> usize {
        self.0.len() / 32
    }

    /// Whether the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The hash at the given index.
    pub fn get(&self, index: usize) -> Option<Hash> {
        if index < self.len() {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&self.0[index * 32..(index + 1) * 32]);
            Some(hash.into())
        } else {
            None
        }
    }

    /// Iterate over the hashes in the sequence.
    pub fn iter(&self) -> impl Iterator<Item = Hash> + '_ {
        (0..self.len()).map(|i| self.get(i).expect("within len"))
    }

    /// The underlying bytes.
    pub fn into_inner(self) -> Bytes {
        self.0
    }
}

impl FromIterator<Hash> for HashSeq {
    fn from_iter<T: IntoIterator<Item = Hash>>(iter: T) -> Self {
        let mut bytes = Vec::new();
        for hash in iter {
            bytes.extend_from_slice(hash.as_bytes());
        }
        Self(bytes.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let hashes = vec![Hash::new(b"a"), Hash::new(b"b"), Hash::new(b"c")];
        let seq: HashSeq = hashes.iter().copied().collect();
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.iter().collect::<Vec<_>>(), hashes);
        assert_eq!(seq.get(3), None);
        let parsed = HashSeq::new(seq.clone().into_inner()).unwrap();
        assert_eq!(parsed, seq);
    }

    #[test]
    fn test_invalid_length() {
        assert!(HashSeq::new(Bytes::from_static(&[0u8; 33])).is_err());
        assert!(HashSeq::new(Bytes::new()).unwrap().is_empty());
    }
}
