//! Small encoding helpers shared by the EMV layer: BCD packing, the ISO 9564
//! PIN block, and the unpredictable number source.

use crate::errors::{Error, Result};
use chrono::Datelike;
use rand::rngs::OsRng;
use rand::RngCore;

/// Packs an integer as big-endian BCD of a fixed byte width, two decimal
/// digits per byte. Digits beyond the width are discarded from the left,
/// like a car odometer rolling over.
pub fn bcd(mut n: u64, width: usize) -> Vec<u8> {
    let mut out = vec![0u8; width];
    for b in out.iter_mut().rev() {
        let pair = (n % 100) as u8;
        n /= 100;
        *b = ((pair / 10) << 4) | (pair % 10);
    }
    out
}

/// Amount, Authorised (9F02): 12 BCD digits in 6 bytes.
pub fn amount_bcd(minor_units: u64) -> [u8; 6] {
    let mut out = [0u8; 6];
    out.copy_from_slice(&bcd(minor_units, 6));
    out
}

/// Transaction Date (9A): YYMMDD, one BCD pair each.
pub fn date_bcd<D: Datelike>(date: &D) -> [u8; 3] {
    let yy = (date.year().rem_euclid(100)) as u64;
    let mm = date.month() as u64;
    let dd = date.day() as u64;
    [bcd(yy, 1)[0], bcd(mm, 1)[0], bcd(dd, 1)[0]]
}

/// Builds an ISO 9564 format 2 PIN block.
///
/// Byte 0 is 0x20 | length; the digits follow as BCD nibbles, left-aligned,
/// with 0xF filling the rest. VERIFY and CHANGE REFERENCE DATA both take
/// this shape in the clear-text PIN case (EMV Book 3, Section 6.5.12).
pub fn pin_block(pin: &str) -> Result<[u8; 8]> {
    if pin.len() < 4 || pin.len() > 12 || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidPin);
    }
    let mut block = [0xFFu8; 8];
    block[0] = 0x20 | pin.len() as u8;
    for (i, digit) in pin.bytes().map(|b| b - b'0').enumerate() {
        let byte = 1 + i / 2;
        if i % 2 == 0 {
            block[byte] = (digit << 4) | 0x0F;
        } else {
            block[byte] = (block[byte] & 0xF0) | digit;
        }
    }
    Ok(block)
}

/// Four bytes of Unpredictable Number (9F37) from the operating system's
/// CSPRNG. Offline card authentication leans on this being unguessable, so
/// no fallback to a weaker generator.
pub fn unpredictable_number() -> [u8; 4] {
    let mut out = [0u8; 4];
    OsRng.fill_bytes(&mut out);
    out
}

/// Serde adapter: byte vectors as uppercase hex strings in JSON output.
pub mod serde_hex {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode_upper(bytes))
    }

    pub mod option {
        use serde::Serializer;

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            ser: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => ser.serialize_some(&hex::encode_upper(b)),
                None => ser.serialize_none(),
            }
        }
    }

    pub mod seq {
        use serde::ser::SerializeSeq;
        use serde::Serializer;

        pub fn serialize<S: Serializer>(items: &[Vec<u8>], ser: S) -> Result<S::Ok, S::Error> {
            let mut seq = ser.serialize_seq(Some(items.len()))?;
            for item in items {
                seq.serialize_element(&hex::encode_upper(item))?;
            }
            seq.end()
        }
    }
}
