//! Data Object Lists.
//!
//! A DOL is the card's marshalling schema for terminal data: an ordered list
//! of (tag, length) with no values. The terminal answers it with a bare
//! concatenation of fixed-width fields in exactly that order, no TLV framing.
//! PDOL (9F38) feeds GET PROCESSING OPTIONS, CDOL1/CDOL2 (8C/8D) feed
//! GENERATE AC. See EMV Book 3, Section 5.4.

use crate::ber::{self, Tag};
use crate::errors::{Error, Result};
use std::collections::HashMap;

/// Values a DOL gets filled from. Order never matters here; the DOL itself
/// is the authority on field order.
pub type TagValues = HashMap<Tag, Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DolEntry {
    pub tag: Tag,
    pub len: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dol {
    entries: Vec<DolEntry>,
}

impl Dol {
    /// Parses a DOL: tag bytes followed by a single length byte, repeated
    /// until the input ends. A tag with its length byte missing is malformed.
    pub fn parse(mut data: &[u8]) -> Result<Self> {
        let mut entries = Vec::new();
        while !data.is_empty() {
            let (rest, tag) = ber::take_tag(data).map_err(|_| Error::MalformedTlv)?;
            let (len, rest) = match rest.split_first() {
                Some((len, rest)) => (*len as usize, rest),
                None => return Err(Error::MalformedTlv),
            };
            entries.push(DolEntry { tag, len });
            data = rest;
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[DolEntry] {
        &self.entries
    }

    /// Total width of the built value buffer.
    pub fn size(&self) -> usize {
        self.entries.iter().map(|e| e.len).sum()
    }

    /// Builds the value buffer. Fields the map doesn't cover are zero
    /// filled; values that don't fit keep their leading bytes; short values
    /// are left-padded with zeroes.
    pub fn build(&self, values: &TagValues) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        for entry in &self.entries {
            match values.get(&entry.tag) {
                Some(v) if v.len() >= entry.len => out.extend_from_slice(&v[..entry.len]),
                Some(v) => {
                    out.resize(out.len() + entry.len - v.len(), 0x00);
                    out.extend_from_slice(v);
                }
                None => out.resize(out.len() + entry.len, 0x00),
            }
        }
        out
    }
}
