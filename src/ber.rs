//! ISO 7816 flavoured BER-TLV (Tag-Length-Value) implementation.
//!
//! BER is an ASN.1 encoding, originally documented in ISO 8825. While a standard ASN.1
//! parser can be used, the subset included in ISO 7816-6 is a slightly odd dialect, and
//! the ecosystem around it has some oddball conventions, most notably referring to tags
//! by their hex values (0x6F rather than Application 15).
//!
//! Aside from ISO 7816-6, this dialect is also documented in EMV Book 3, Annex B, which
//! is freely available from EMVCo's website. For ease of access, this implementation is
//! written using the EMV specs rather than ISO 7816 or ISO 8825 unless otherwise noted.
//!
//! Values parse into owned trees: a node is either a primitive byte string or
//! a constructed sequence of child nodes, in encounter order. Cards love to
//! pad records with 0xFF trailers, so record-scope callers use the lenient
//! entry points, which drop a truncated trailing TLV instead of erroring.

use crate::errors::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use nom::bytes::complete::take;
use nom::number::complete::be_u8;
use std::fmt;

pub type IResult<'a, T> = nom::IResult<&'a [u8], T>;

/// A tag, identified by the integer formed from its encoded bytes, big-endian:
/// `[0x9F, 0x38]` is `Tag(0x9F38)`. EMV tags are 1-3 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub u32);

impl Tag {
    /// The first encoded byte, which carries the class and constructed bits.
    fn leading_byte(self) -> u8 {
        let mut v = self.0;
        while v > 0xFF {
            v >>= 8;
        }
        v as u8
    }

    /// Does this tag introduce a constructed value, ie. further TLV tuples?
    /// The opposite is a primitive value (a string, number, etc. depending
    /// on context). See EMV Book 3, Annex B2.
    pub fn is_constructed(self) -> bool {
        self.leading_byte() & (1 << 5) != 0
    }

    /// Serializes the tag as 1-3 bytes.
    pub fn encode_into(self, out: &mut Vec<u8>) {
        if self.0 > 0xFFFF {
            out.push((self.0 >> 16) as u8);
        }
        if self.0 > 0xFF {
            out.push((self.0 >> 8) as u8);
        }
        out.push(self.0 as u8);
    }
}

impl From<u32> for Tag {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}

/// Parses a tag.
///
/// If bits 1-5 of the first byte are all set, this is a multi-byte tag, continuing until
/// and including the first subsequent byte without bit 8 set.
///
/// See EMV Book 3, Annex B1: "Coding of the Tag Field of BER-TLV Data Objects".
pub fn take_tag(data: &[u8]) -> IResult<Tag> {
    let (rest, first) = be_u8(data)?;
    if first & 0b0001_1111 != 0b0001_1111 {
        return Ok((rest, Tag(first as u32)));
    }
    let mut tag_len = 2usize;
    for b in rest {
        if b & (1 << 7) != 0 {
            tag_len += 1;
        } else {
            break;
        }
    }
    // EMV tags are at most 3 bytes; anything longer is one of ours misparsing.
    if tag_len > 3 {
        return Err(nom::Err::Error(nom::error::Error::new(
            data,
            nom::error::ErrorKind::TooLarge,
        )));
    }
    let (rest, raw) = take(tag_len)(data)?;
    let mut num = 0u32;
    for b in raw {
        num = (num << 8) | *b as u32;
    }
    Ok((rest, Tag(num)))
}

/// Parses a length field.
///
/// Short form (< 0x80) is the length itself; 0x81-0x84 prefix a 1-4 byte
/// big-endian length. 0x80 is the BER indefinite form, which ISO 7816 and
/// EMV both forbid, and longer forms can't describe a real card response.
pub fn take_len(data_: &[u8]) -> IResult<usize> {
    let (data, first) = be_u8(data_)?;
    if first <= 0x7F {
        return Ok((data, first as usize));
    }
    let lensize = (first & 0b0111_1111) as usize;
    if lensize < 1 || lensize > 4 {
        // Return the full input!
        return Err(nom::Err::Error(nom::error::Error::new(
            data_,
            nom::error::ErrorKind::TooLarge,
        )));
    }
    let (rest, raw) = take(lensize)(data)?;
    Ok((rest, BigEndian::read_uint(raw, lensize) as usize))
}

/// A single TLV node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tag: Tag,
    pub value: Value,
}

/// A TLV value: either raw bytes, or child nodes in encounter order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Primitive(Vec<u8>),
    Constructed(Vec<Tlv>),
}

impl Tlv {
    /// The value bytes of a primitive node; None for constructed ones.
    pub fn primitive(&self) -> Option<&[u8]> {
        match &self.value {
            Value::Primitive(v) => Some(v),
            Value::Constructed(_) => None,
        }
    }

    /// The child nodes of a constructed node; None for primitive ones.
    pub fn children(&self) -> Option<&[Tlv]> {
        match &self.value {
            Value::Primitive(_) => None,
            Value::Constructed(kids) => Some(kids),
        }
    }

    /// Depth-first pre-order search, first match wins. Primitive nodes are
    /// leaves; there is nothing to find inside them.
    pub fn find(&self, tag: Tag) -> Option<&Tlv> {
        if self.tag == tag {
            return Some(self);
        }
        match &self.value {
            Value::Primitive(_) => None,
            Value::Constructed(kids) => find(kids, tag),
        }
    }

    /// Re-encodes the node, choosing the minimal length form.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match &self.value {
            Value::Primitive(v) => {
                self.tag.encode_into(out);
                encode_len(v.len(), out);
                out.extend_from_slice(v);
            }
            Value::Constructed(kids) => {
                let mut body = Vec::new();
                for kid in kids {
                    kid.encode_into(&mut body);
                }
                self.tag.encode_into(out);
                encode_len(body.len(), out);
                out.extend_from_slice(&body);
            }
        }
    }
}

/// Searches a forest of nodes depth-first, in order.
pub fn find(tlvs: &[Tlv], tag: Tag) -> Option<&Tlv> {
    for tlv in tlvs {
        if let Some(hit) = tlv.find(tag) {
            return Some(hit);
        }
    }
    None
}

/// Like [`find`], but yields the value bytes of a primitive match.
pub fn find_value(tlvs: &[Tlv], tag: Tag) -> Option<&[u8]> {
    find(tlvs, tag).and_then(Tlv::primitive)
}

/// Parses a complete BER-TLV blob into a forest. Any leftover or truncated
/// bytes are an error; this is the right mode for SELECT responses and
/// anything else the card is required to encode properly.
pub fn parse(data: &[u8]) -> Result<Vec<Tlv>> {
    parse_mode(data, false)
}

/// Parses a record blob, silently dropping a truncated trailing TLV.
/// Cards commonly pad records out to the file's record length.
pub fn parse_records(data: &[u8]) -> Result<Vec<Tlv>> {
    parse_mode(data, true)
}

fn parse_mode(mut data: &[u8], lenient: bool) -> Result<Vec<Tlv>> {
    let mut out = Vec::new();
    while !data.is_empty() {
        match parse_next(data, lenient) {
            Ok((rest, tlv)) => {
                out.push(tlv);
                data = rest;
            }
            Err(_) if lenient => break,
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

fn parse_next(data: &[u8], lenient: bool) -> Result<(&[u8], Tlv)> {
    let (data, tag) = take_tag(data).map_err(|_| Error::MalformedTlv)?;
    let (data, len) = take_len(data).map_err(|_| Error::MalformedTlv)?;
    if len > data.len() {
        return Err(Error::MalformedTlv);
    }
    let (raw, rest) = data.split_at(len);
    let value = if tag.is_constructed() {
        Value::Constructed(parse_mode(raw, lenient)?)
    } else {
        Value::Primitive(raw.to_vec())
    };
    Ok((rest, Tlv { tag, value }))
}

/// Serializes a forest back to bytes.
pub fn encode(tlvs: &[Tlv]) -> Vec<u8> {
    let mut out = Vec::new();
    for tlv in tlvs {
        tlv.encode_into(&mut out);
    }
    out
}

/// Wraps raw bytes in a single tag, eg. the 0x83 envelope around PDOL data
/// in GET PROCESSING OPTIONS.
pub fn encode_one(tag: Tag, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    tag.encode_into(&mut out);
    encode_len(value.len(), &mut out);
    out.extend_from_slice(value);
    out
}

fn encode_len(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.push(0x81);
        out.push(len as u8);
    } else if len <= 0xFFFF {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    } else if len <= 0xFF_FFFF {
        out.push(0x83);
        out.push((len >> 16) as u8);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    } else {
        out.push(0x84);
        out.push((len >> 24) as u8);
        out.push((len >> 16) as u8);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
}
