//! Bundle Archive Adapter
//!
//! Implements the `ArchiveExtractor` port for the bundle container: a flat
//! sequence of records, each a big-endian u32 name length, the UTF-8 name,
//! a big-endian u64 data length and the data. Zip and tar containers need
//! a different extractor.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::domain::ports::{ArchiveExtractor, ArchiveType};
use crate::error::{Error, FetchFailureMode, Result};

/// Members larger than this are refused
pub const MAX_MEMBER_SIZE: u64 = 64 * 1024 * 1024;

/// Reads bundle containers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BundleExtractor;

impl BundleExtractor {
    pub fn new() -> Self {
        Self
    }
}

fn archive_failure(message: impl Into<String>) -> Error {
    Error::fetch(FetchFailureMode::ArchiveFailure, message)
}

impl ArchiveExtractor for BundleExtractor {
    fn extract(
        &self,
        container: &Bytes,
        archive_type: ArchiveType,
    ) -> Result<BTreeMap<String, Bytes>> {
        if archive_type != ArchiveType::Bundle {
            return Err(archive_failure(format!(
                "unsupported archive type: {}",
                archive_type
            )));
        }

        let mut buf = container.clone();
        let mut members = BTreeMap::new();
        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(archive_failure("truncated name length"));
            }
            let name_len = buf.get_u32() as usize;
            if buf.remaining() < name_len {
                return Err(archive_failure("truncated name"));
            }
            let name = String::from_utf8(buf.split_to(name_len).to_vec())
                .map_err(|_| archive_failure("member name is not UTF-8"))?;

            if buf.remaining() < 8 {
                return Err(archive_failure("truncated data length"));
            }
            let data_len = buf.get_u64();
            if data_len > MAX_MEMBER_SIZE || buf.remaining() < data_len as usize {
                return Err(archive_failure(format!("bad length for member {}", name)));
            }
            let data = buf.split_to(data_len as usize);

            // Leading slashes are not part of the member name.
            members.insert(name.trim_start_matches('/').to_string(), data);
        }
        Ok(members)
    }
}

/// Builds bundle containers.
#[derive(Debug, Default)]
pub struct BundleBuilder {
    buf: BytesMut,
}

impl BundleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, name: &str, data: &[u8]) -> Self {
        self.buf.put_u32(name.len() as u32);
        self.buf.put_slice(name.as_bytes());
        self.buf.put_u64(data.len() as u64);
        self.buf.put_slice(data);
        self
    }

    pub fn build(self) -> Bytes {
        self.buf.freeze()
    }
}
