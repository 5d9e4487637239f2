//! Short-form APDUs, as defined in ISO 7816-4 and recapped in EMV Book 1,
//! Section 9. Only T=0 style short APDUs are built here: Lc and Le are a
//! single byte each, and Le=0x00 means "give me up to 256 bytes".

use crate::errors::{Error, Result};
use std::fmt;

/// A command APDU. Immutable once built; construct via [`Command::new`] and
/// the `with_data`/`expect` builders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    data: Vec<u8>,
    le: Option<u8>,
}

impl Command {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
        }
    }

    pub fn with_data<T: Into<Vec<u8>>>(mut self, data: T) -> Self {
        self.data = data.into();
        self
    }

    /// Sets Le, the expected response length. 0x00 means up to 256 bytes.
    pub fn expect(mut self, le: u8) -> Self {
        self.le = Some(le);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn le(&self) -> Option<u8> {
        self.le
    }

    /// Serializes the command. The four short-form layouts are:
    ///
    /// ```text
    /// CLA INS P1 P2
    /// CLA INS P1 P2 Le
    /// CLA INS P1 P2 Lc data
    /// CLA INS P1 P2 Lc data Le
    /// ```
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut raw = Vec::with_capacity(6 + self.data.len());
        raw.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);
        if !self.data.is_empty() {
            let lc: u8 = self
                .data
                .len()
                .try_into()
                .map_err(|_| Error::DataTooLong(self.data.len()))?;
            raw.push(lc);
            raw.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            raw.push(le);
        }
        Ok(raw)
    }
}

/// The two mandatory trailer bytes of every response, SW1 and SW2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u8, pub u8);

impl Status {
    pub const OK: Status = Status(0x90, 0x00);

    pub fn is_ok(&self) -> bool {
        *self == Status::OK
    }

    /// 61xx: the card holds xx more bytes, fetch them with GET RESPONSE.
    pub fn bytes_remaining(&self) -> Option<u8> {
        (self.0 == 0x61).then_some(self.1)
    }

    /// 6Cxx: wrong Le, retransmit the same command with Le=xx.
    pub fn retry_le(&self) -> Option<u8> {
        (self.0 == 0x6C).then_some(self.1)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.0, self.1)
    }
}

/// A response APDU: data followed by the status trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub data: Vec<u8>,
    pub status: Status,
}

impl Response {
    pub fn new<T: Into<Vec<u8>>>(status: Status, data: T) -> Self {
        Self {
            data: data.into(),
            status,
        }
    }

    /// Splits a raw transport response into data and status words.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 {
            return Err(Error::ShortResponse(raw.len()));
        }
        let (data, sw) = raw.split_at(raw.len() - 2);
        Ok(Self {
            data: data.to_vec(),
            status: Status(sw[0], sw[1]),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// Returns the data field, or the status as an error if it isn't 9000.
    pub fn require_ok(self) -> Result<Vec<u8>> {
        if self.is_ok() {
            Ok(self.data)
        } else {
            Err(Error::Status(self.status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_header_only() {
        let cmd = Command::new(0x00, 0xA4, 0x12, 0x34);
        assert_eq!(cmd.encode().unwrap(), &[0x00, 0xA4, 0x12, 0x34]);
    }

    #[test]
    fn test_encode_le_only() {
        let cmd = Command::new(0x00, 0xB2, 0x01, 0x0C).expect(0x00);
        assert_eq!(cmd.encode().unwrap(), &[0x00, 0xB2, 0x01, 0x0C, 0x00]);
    }

    #[test]
    fn test_encode_data_only() {
        let cmd = Command::new(0x00, 0xA4, 0x04, 0x00).with_data(vec![0x56, 0x78]);
        assert_eq!(
            cmd.encode().unwrap(),
            &[0x00, 0xA4, 0x04, 0x00, 0x02, 0x56, 0x78]
        );
    }

    #[test]
    fn test_encode_data_and_le() {
        let cmd = Command::new(0x80, 0xA8, 0x00, 0x00)
            .with_data(vec![0x83, 0x00])
            .expect(0x00);
        assert_eq!(
            cmd.encode().unwrap(),
            &[0x80, 0xA8, 0x00, 0x00, 0x02, 0x83, 0x00, 0x00]
        );
    }

    #[test]
    fn test_encode_data_too_long() {
        let body: Vec<u8> = std::iter::repeat(0x69).take(512).collect();
        let cmd = Command::new(0x00, 0xA4, 0x04, 0x00).with_data(body);
        match cmd.encode().unwrap_err() {
            Error::DataTooLong(512) => {}
            e => panic!("wrong error: {e}"),
        }
    }

    #[test]
    fn test_parse_status_only() {
        let res = Response::parse(&[0x90, 0x00]).unwrap();
        assert_eq!(res, Response::new(Status(0x90, 0x00), vec![]));
        assert!(res.is_ok());
    }

    #[test]
    fn test_parse_data_and_status() {
        let res = Response::parse(&[0x12, 0x34, 0x56, 0x78, 0x6A, 0x82]).unwrap();
        assert_eq!(res.data, &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(res.status, Status(0x6A, 0x82));
        assert!(!res.is_ok());
    }

    #[test]
    fn test_parse_too_short() {
        match Response::parse(&[0x90]).unwrap_err() {
            Error::ShortResponse(1) => {}
            e => panic!("wrong error: {e}"),
        }
    }

    #[test]
    fn test_status_helpers() {
        assert_eq!(Status(0x61, 0x1A).bytes_remaining(), Some(0x1A));
        assert_eq!(Status(0x90, 0x00).bytes_remaining(), None);
        assert_eq!(Status(0x6C, 0x14).retry_le(), Some(0x14));
        assert_eq!(Status(0x61, 0x14).retry_le(), None);
        assert_eq!(format!("{}", Status(0x6A, 0x82)), "6A82");
    }
}
