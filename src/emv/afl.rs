//! The Application File Locator (tag 94) tells the terminal which records to
//! read after GET PROCESSING OPTIONS. See EMV Book 3, Section 10.2.

use serde::Serialize;

/// One AFL entry: a file and a span of records within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AflEntry {
    /// Short File Identifier, 1-30.
    pub sfi: u8,
    pub first_record: u8,
    pub last_record: u8,
    /// How many records, counting up from `first_record`, are signed for
    /// offline static data authentication.
    pub sda_records: u8,
}

/// Decodes an AFL in its fixed 4-byte stride. A trailing fragment shorter
/// than 4 bytes is dropped; cards have been seen emitting those.
pub fn parse(data: &[u8]) -> Vec<AflEntry> {
    data.chunks_exact(4)
        .map(|c| AflEntry {
            // The low 3 bits of the first byte are RFU and ignored.
            sfi: c[0] >> 3,
            first_record: c[1],
            last_record: c[2],
            sda_records: c[3],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single() {
        assert_eq!(
            parse(&[0x08, 0x01, 0x01, 0x00]),
            vec![AflEntry {
                sfi: 1,
                first_record: 1,
                last_record: 1,
                sda_records: 0,
            }]
        );
    }

    #[test]
    fn test_parse_multiple() {
        let entries = parse(&[0x10, 0x01, 0x03, 0x02, 0x18, 0x01, 0x02, 0x00]);
        assert_eq!(
            entries,
            vec![
                AflEntry {
                    sfi: 2,
                    first_record: 1,
                    last_record: 3,
                    sda_records: 2,
                },
                AflEntry {
                    sfi: 3,
                    first_record: 1,
                    last_record: 2,
                    sda_records: 0,
                },
            ]
        );
    }

    #[test]
    fn test_parse_drops_trailing_fragment() {
        let entries = parse(&[0x08, 0x01, 0x01, 0x00, 0x10, 0x01]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sfi, 1);
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse(&[]).is_empty());
        assert!(parse(&[0x08, 0x01, 0x01]).is_empty());
    }

    #[test]
    fn test_parse_ignores_rfu_bits() {
        let entries = parse(&[0x0B, 0x01, 0x01, 0x00]);
        assert_eq!(entries[0].sfi, 1);
    }
}
