//! One harvested record.

use std::collections::BTreeSet;
use std::io::{self, Read, Write};

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};

/// Length of the payload digest (BLAKE3).
pub const CHECKSUM_LEN: usize = 32;

/// Header status value marking a deleted record.
pub const STATUS_DELETED: &str = "deleted";

/// A record as extracted from a response.
///
/// Built field by field while its container element is parsed, then
/// finalized with [`set_content`](Self::set_content): the payload is
/// digested and stored gzip-compressed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarvestedRecord {
    pub base_url: String,
    pub identifier: String,
    pub deleted: bool,
    pub datestamp: String,
    pub sets: BTreeSet<String>,
    pub checksum: Option<[u8; CHECKSUM_LEN]>,
    /// Gzip-compressed payload.
    pub xml: Vec<u8>,
}

impl HarvestedRecord {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn add_set(&mut self, set: impl Into<String>) {
        self.sets.insert(set.into());
    }

    /// Digest and compress the serialized payload.
    pub fn set_content(&mut self, content: &[u8]) -> io::Result<()> {
        self.checksum = Some(*blake3::hash(content).as_bytes());
        self.xml = compress(content)?;
        Ok(())
    }

    /// Decompressed payload.
    pub fn content(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.xml.len() * 4);
        GzDecoder::new(self.xml.as_slice()).read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn checksum_hex(&self) -> Option<String> {
        self.checksum
            .map(|c| blake3::Hash::from(c).to_hex().to_string())
    }

    pub fn is_finalized(&self) -> bool {
        self.checksum.is_some()
    }
}

/// Gzip with a fixed header so equal input gives equal bytes.
fn compress(content: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = GzBuilder::new()
        .mtime(0)
        .write(Vec::with_capacity(content.len() / 2), Compression::default());
    encoder.write_all(content)?;
    encoder.finish()
}
