//! Keys used in documents.
//!
//! An [`Author`] signs the entries they write, a [`Namespace`] is the
//! document itself: holding the namespace secret is the capability to write
//! to the document. The public halves, [`AuthorId`] and [`NamespaceId`], are
//! the identifiers that appear in entries and tickets.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, SignatureError, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

use knot_base::base32;

/// Author key to insert entries in a document.
///
/// Internally, an author is a [`SigningKey`] which is used to sign entries.
#[derive(Clone, Serialize, Deserialize)]
pub struct Author {
    signing_key: SigningKey,
}

impl Author {
    /// Create a new author with a random key.
    pub fn new<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let signing_key = SigningKey::generate(rng);
        Author { signing_key }
    }

    /// Create an author from its byte representation.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        SigningKey::from_bytes(bytes).into()
    }

    /// The byte representation of the author secret.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The identifier of this author.
    pub fn id(&self) -> AuthorId {
        AuthorId(self.signing_key.verifying_key())
    }

    /// Sign a message with this author key.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }

    /// Strictly verify a signature on a message with this author's key.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.signing_key.verify_strict(msg, signature)
    }
}

impl From<SigningKey> for Author {
    fn from(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }
}

/// Identifier for an [`Author`], the public half of the key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthorId(VerifyingKey);

impl AuthorId {
    /// Verify that a signature matches a message, for this author.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.0.verify(msg, signature)
    }

    /// The byte representation of this author id.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Create an author id from its byte representation.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SignatureError> {
        Ok(AuthorId(VerifyingKey::from_bytes(bytes)?))
    }
}

/// A document: a namespace of entries.
///
/// Internally, a namespace is a [`SigningKey`]. Entries are countersigned
/// with it, so holding the namespace secret is the capability to write.
#[derive(Clone, Serialize, Deserialize)]
pub struct Namespace {
    signing_key: SigningKey,
}

impl Namespace {
    /// Create a new namespace with a random key.
    pub fn new<R: CryptoRngCore + ?Sized>(rng: &mut R) -> Self {
        let signing_key = SigningKey::generate(rng);
        Namespace { signing_key }
    }

    /// Create a namespace from its byte representation.
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        SigningKey::from_bytes(bytes).into()
    }

    /// The byte representation of the namespace secret.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The identifier of this namespace.
    pub fn id(&self) -> NamespaceId {
        NamespaceId(self.signing_key.verifying_key())
    }

    /// Sign a message with this namespace key.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        self.signing_key.sign(msg)
    }
}

impl From<SigningKey> for Namespace {
    fn from(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }
}

/// Identifier for a [`Namespace`], the public half of the key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespaceId(VerifyingKey);

impl NamespaceId {
    /// Verify that a signature matches a message, for this namespace.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        self.0.verify(msg, signature)
    }

    /// The byte representation of this namespace id.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Create a namespace id from its byte representation.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SignatureError> {
        Ok(NamespaceId(VerifyingKey::from_bytes(bytes)?))
    }
}

impl PartialOrd for AuthorId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AuthorId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl PartialOrd for NamespaceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NamespaceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.to_bytes()))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.to_bytes()))
    }
}

impl fmt::Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.as_bytes()))
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.as_bytes()))
    }
}

impl fmt::Debug for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Author({})", base32::fmt_short(self.id().as_bytes()))
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace({})", base32::fmt_short(self.id().as_bytes()))
    }
}

impl fmt::Debug for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorId({})", base32::fmt_short(self.as_bytes()))
    }
}

impl fmt::Debug for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NamespaceId({})", base32::fmt_short(self.as_bytes()))
    }
}

impl FromStr for Author {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_bytes(&base32::parse_array(s)?))
    }
}

impl FromStr for Namespace {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_bytes(&base32::parse_array(s)?))
    }
}

impl FromStr for AuthorId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_bytes(&base32::parse_array(s)?)?)
    }
}

impl FromStr for NamespaceId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_bytes(&base32::parse_array(s)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_author_roundtrip() {
        let author = Author::new(&mut rand::thread_rng());
        let text = author.to_string();
        let parsed: Author = text.parse().unwrap();
        assert_eq!(author.to_bytes(), parsed.to_bytes());
        assert_eq!(author.id(), parsed.id());

        let id_text = author.id().to_string();
        let parsed_id: AuthorId = id_text.parse().unwrap();
        assert_eq!(author.id(), parsed_id);
    }

    #[test]
    fn test_namespace_roundtrip() {
        let namespace = Namespace::new(&mut rand::thread_rng());
        let parsed: Namespace = namespace.to_string().parse().unwrap();
        assert_eq!(namespace.to_bytes(), parsed.to_bytes());
        let parsed_id: NamespaceId = namespace.id().to_string().parse().unwrap();
        assert_eq!(namespace.id(), parsed_id);
    }

    #[test]
    fn test_sign_and_verify() {
        let author = Author::new(&mut rand::thread_rng());
        let signature = author.sign(b"payload");
        author.id().verify(b"payload", &signature).unwrap();
        assert!(author.id().verify(b"tampered", &signature).is_err());
    }
}
