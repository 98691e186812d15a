//! Content keys and client URIs
//!
//! A content-hash key (CHK) names an immutable block by the SHA-256 of its
//! bytes. A signed-subspace key (SSK) names a mutable slot under a public
//! key hash plus a document name. Signature verification is the network
//! layer's concern; here an SSK is only an address.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, FetchFailureMode, Result};

/// Identifier for one network-retrievable block.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ContentKey {
    /// Content-hash key
    Chk([u8; 32]),
    /// Signed-subspace key
    Ssk { pubkey_hash: [u8; 32], doc_name: String },
}

impl ContentKey {
    /// Derive the CHK for a block.
    pub fn chk_for(data: &[u8]) -> Self {
        ContentKey::Chk(Sha256::digest(data).into())
    }

    /// Build an SSK from a public key and a document name.
    pub fn ssk(pubkey: &[u8], doc_name: impl Into<String>) -> Self {
        ContentKey::Ssk {
            pubkey_hash: Sha256::digest(pubkey).into(),
            doc_name: doc_name.into(),
        }
    }

    pub fn is_chk(&self) -> bool {
        matches!(self, ContentKey::Chk(_))
    }

    /// Check that `data` is what this key names. SSK payloads always pass.
    pub fn verify(&self, data: &[u8]) -> bool {
        match self {
            ContentKey::Chk(hash) => Sha256::digest(data).as_slice() == hash,
            ContentKey::Ssk { .. } => true,
        }
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentKey::Chk(hash) => write!(f, "CHK@{}", hex::encode(hash)),
            ContentKey::Ssk {
                pubkey_hash,
                doc_name,
            } => write!(f, "SSK@{}/{}", hex::encode(pubkey_hash), doc_name),
        }
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentKey::Chk(hash) => write!(f, "CHK@{}", hex::encode(&hash[..6])),
            ContentKey::Ssk {
                pubkey_hash,
                doc_name,
            } => write!(f, "SSK@{}/{}", hex::encode(&pubkey_hash[..6]), doc_name),
        }
    }
}

fn parse_hash(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s).map_err(|e| invalid_key(format!("bad hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| invalid_key("hash must be 32 bytes".to_string()))
}

fn invalid_key(message: String) -> Error {
    Error::fetch(FetchFailureMode::InvalidMetadata, message)
}

impl FromStr for ContentKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("CHK@") {
            return Ok(ContentKey::Chk(parse_hash(rest)?));
        }
        if let Some(rest) = s.strip_prefix("SSK@") {
            let (hash, doc_name) = rest
                .split_once('/')
                .ok_or_else(|| invalid_key(format!("SSK without document name: {}", s)))?;
            if doc_name.is_empty() || doc_name.contains('/') {
                return Err(invalid_key(format!("bad SSK document name: {}", s)));
            }
            return Ok(ContentKey::Ssk {
                pubkey_hash: parse_hash(hash)?,
                doc_name: doc_name.to_string(),
            });
        }
        Err(invalid_key(format!("unknown key type: {}", s)))
    }
}

impl TryFrom<String> for ContentKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ContentKey> for String {
    fn from(key: ContentKey) -> Self {
        key.to_string()
    }
}

// =============================================================================
// Client URI
// =============================================================================

/// A root key plus the manifest path to walk below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientUri {
    pub key: ContentKey,
    pub path: Vec<String>,
}

impl ClientUri {
    pub fn new(key: ContentKey) -> Self {
        Self {
            key,
            path: Vec::new(),
        }
    }

    pub fn with_path<I, S>(mut self, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.path.extend(components.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for ClientUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        for component in &self.path {
            write!(f, "/{}", component)?;
        }
        Ok(())
    }
}

impl FromStr for ClientUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // SSKs carry their document name as the first path segment.
        let key_segments = if s.starts_with("SSK@") { 2 } else { 1 };
        let mut parts = s.splitn(key_segments + 1, '/');
        let key_str = match key_segments {
            2 => {
                let hash = parts.next().unwrap_or_default();
                let doc = parts.next().unwrap_or_default();
                format!("{}/{}", hash, doc)
            }
            _ => parts.next().unwrap_or_default().to_string(),
        };
        let key: ContentKey = key_str.parse()?;
        let path = parts
            .next()
            .map(|rest| {
                rest.split('/')
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(ClientUri { key, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chk_verify() {
        let key = ContentKey::chk_for(b"hello");
        assert!(key.verify(b"hello"));
        assert!(!key.verify(b"hellO"));
        assert!(key.is_chk());
    }

    #[test]
    fn test_chk_parse() {
        let key = ContentKey::chk_for(b"block");
        let parsed: ContentKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_ssk_parse() {
        let key = ContentKey::ssk(b"pubkey", "site");
        let text = key.to_string();
        assert!(text.starts_with("SSK@"));
        assert!(text.ends_with("/site"));
        assert_eq!(text.parse::<ContentKey>().unwrap(), key);
        assert!(key.verify(b"anything"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("KSK@foo".parse::<ContentKey>().is_err());
        assert!("CHK@abcd".parse::<ContentKey>().is_err());
        assert!("CHK@zz".parse::<ContentKey>().is_err());
    }

    #[test]
    fn test_key_serde_as_string() {
        let key = ContentKey::chk_for(b"x");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key));
        let back: ContentKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_uri_with_path() {
        let key = ContentKey::chk_for(b"root");
        let uri: ClientUri = format!("{}/docs/index.html", key).parse().unwrap();
        assert_eq!(uri.key, key);
        assert_eq!(uri.path, vec!["docs", "index.html"]);
    }

    #[test]
    fn test_ssk_uri_with_path() {
        let key = ContentKey::ssk(b"pk", "site");
        let uri: ClientUri = format!("{}/a/b", key).parse().unwrap();
        assert_eq!(uri.key, key);
        assert_eq!(uri.path, vec!["a", "b"]);
        assert_eq!(uri.to_string(), format!("{}/a/b", key));
    }
}
