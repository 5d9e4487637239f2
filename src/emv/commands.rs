//! The EMV command set: APDU builders plus the [`Session`] operations that
//! run them. Builders validate their arguments and never touch the card, so
//! the byte layouts are testable without one. Command coding is EMV Book 3,
//! Section 6.5, plus ISO 7816-4 for the interindustry ones.

use crate::apdu::{Command, Response};
use crate::ber::{self, Tag};
use crate::emv::{PPSE_DF_NAME, PSE_DF_NAME};
use crate::errors::{Error, Result};
use crate::session::Session;
use crate::transport::Transport;
use crate::util;
use num_enum::IntoPrimitive;
use serde::Serialize;

/// The cryptogram a GENERATE AC asks for (or gets). The request P1 carries
/// the type in its top two bits; the card answers with its own choice in the
/// CID (9F27), which may be a downgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, Serialize)]
#[repr(u8)]
pub enum CryptogramType {
    /// Application Authentication Cryptogram: transaction declined.
    Aac = 0x00,
    /// Transaction Certificate: approved offline.
    Tc = 0x40,
    /// Authorisation Request Cryptogram: go online.
    Arqc = 0x80,
    /// The RFU combination of CID bits. Never valid in a request.
    Reserved = 0xC0,
}

impl CryptogramType {
    /// Decodes the type from Cryptogram Information Data (9F27).
    pub fn from_cid(cid: u8) -> Self {
        match cid >> 6 {
            0b00 => Self::Aac,
            0b01 => Self::Tc,
            0b10 => Self::Arqc,
            _ => Self::Reserved,
        }
    }
}

/// SELECT by DF name, first occurrence.
pub fn select(name: &[u8]) -> Command {
    Command::new(0x00, 0xA4, 0x04, 0x00)
        .with_data(name)
        .expect(0x00)
}

pub fn select_pse() -> Command {
    select(PSE_DF_NAME.as_bytes())
}

pub fn select_ppse() -> Command {
    select(PPSE_DF_NAME.as_bytes())
}

/// SELECT an application by AID. AIDs are 5-16 bytes (ISO 7816-4: a 5-byte
/// RID plus up to 11 bytes of PIX).
pub fn select_application(aid: &[u8]) -> Result<Command> {
    if aid.len() < 5 || aid.len() > 16 {
        return Err(Error::InvalidAid(aid.len()));
    }
    Ok(select(aid))
}

/// READ RECORD by record number. P2's top 5 bits are the SFI, and its low 3
/// bits 0b100 mean "P1 is a record number".
pub fn read_record(sfi: u8, record: u8) -> Result<Command> {
    if sfi < 1 || sfi > 30 {
        return Err(Error::InvalidSfi(sfi));
    }
    Ok(Command::new(0x00, 0xB2, record, (sfi << 3) | 0b100).expect(0x00))
}

/// GET DATA for a primitive data object held by the card (eg. 9F17, the PIN
/// try counter). Proprietary class.
pub fn get_data(tag: u32) -> Result<Command> {
    if tag > 0xFFFF {
        return Err(Error::InvalidTag(tag));
    }
    Ok(Command::new(0x80, 0xCA, (tag >> 8) as u8, tag as u8).expect(0x00))
}

/// GET PROCESSING OPTIONS. The PDOL reply (possibly empty) goes inside a
/// 0x83 Command Template envelope.
pub fn get_processing_options(pdol_data: &[u8]) -> Command {
    Command::new(0x80, 0xA8, 0x00, 0x00)
        .with_data(ber::encode_one(Tag(0x83), pdol_data))
        .expect(0x00)
}

/// GENERATE AC. P1 is the requested cryptogram type; the data field is the
/// CDOL1 value buffer, which is never empty on a real card.
pub fn generate_ac(kind: CryptogramType, cdol_data: &[u8]) -> Result<Command> {
    if kind == CryptogramType::Reserved {
        return Err(Error::InvalidCryptogramType);
    }
    if cdol_data.is_empty() {
        return Err(Error::EmptyData("GENERATE AC"));
    }
    Ok(Command::new(0x80, 0xAE, kind.into(), 0x00)
        .with_data(cdol_data)
        .expect(0x00))
}

/// INTERNAL AUTHENTICATE with a DDOL value buffer, for DDA.
pub fn internal_authenticate(data: &[u8]) -> Result<Command> {
    if data.is_empty() {
        return Err(Error::EmptyData("INTERNAL AUTHENTICATE"));
    }
    Ok(Command::new(0x00, 0x88, 0x00, 0x00)
        .with_data(data)
        .expect(0x00))
}

/// VERIFY with a plaintext (format 2) PIN block. P2=0x80 selects plaintext
/// PIN against the card's reference data.
pub fn verify_pin(pin: &str) -> Result<Command> {
    let block = util::pin_block(pin)?;
    Ok(Command::new(0x00, 0x20, 0x00, 0x80).with_data(block.to_vec()))
}

/// CHANGE REFERENCE DATA: old PIN block followed by the new one.
pub fn change_pin(old_pin: &str, new_pin: &str) -> Result<Command> {
    let mut data = util::pin_block(old_pin)?.to_vec();
    data.extend_from_slice(&util::pin_block(new_pin)?);
    Ok(Command::new(0x00, 0x24, 0x00, 0x80).with_data(data))
}

impl<T: Transport> Session<T> {
    pub fn select_pse(&mut self) -> Result<Response> {
        self.call(&select_pse())
    }

    pub fn select_ppse(&mut self) -> Result<Response> {
        self.call(&select_ppse())
    }

    pub fn select_application(&mut self, aid: &[u8]) -> Result<Response> {
        self.call(&select_application(aid)?)
    }

    pub fn read_record(&mut self, sfi: u8, record: u8) -> Result<Response> {
        self.call(&read_record(sfi, record)?)
    }

    pub fn get_data(&mut self, tag: u32) -> Result<Response> {
        self.call(&get_data(tag)?)
    }

    pub fn get_processing_options(&mut self, pdol_data: &[u8]) -> Result<Response> {
        self.call(&get_processing_options(pdol_data))
    }

    pub fn generate_ac(&mut self, kind: CryptogramType, cdol_data: &[u8]) -> Result<Response> {
        self.call(&generate_ac(kind, cdol_data)?)
    }

    pub fn internal_authenticate(&mut self, data: &[u8]) -> Result<Response> {
        self.call(&internal_authenticate(data)?)
    }

    /// Verifies the PIN against the ICC. A refusal comes back as the typed
    /// PIN error, with the remaining attempts for 63Cx.
    pub fn verify_pin(&mut self, pin: &str) -> Result<Response> {
        let res = self.call(&verify_pin(pin)?)?;
        if res.is_ok() {
            Ok(res)
        } else {
            Err(Error::from_pin_status(res.status))
        }
    }

    pub fn change_pin(&mut self, old_pin: &str, new_pin: &str) -> Result<Response> {
        let res = self.call(&change_pin(old_pin, new_pin)?)?;
        if res.is_ok() {
            Ok(res)
        } else {
            Err(Error::from_pin_status(res.status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_pse_bytes() {
        assert_eq!(
            select_pse().encode().unwrap(),
            &[
                0x00, 0xA4, 0x04, 0x00, 0x0E, 0x31, 0x50, 0x41, 0x59, 0x2E, 0x53, 0x59, 0x53,
                0x2E, 0x44, 0x44, 0x46, 0x30, 0x31, 0x00,
            ]
        );
    }

    #[test]
    fn test_select_ppse_bytes() {
        let raw = select_ppse().encode().unwrap();
        assert_eq!(&raw[..5], &[0x00, 0xA4, 0x04, 0x00, 0x0E]);
        assert_eq!(&raw[5..19], "2PAY.SYS.DDF01".as_bytes());
    }

    #[test]
    fn test_select_application_layout() {
        let aid = [0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10];
        let raw = select_application(&aid).unwrap().encode().unwrap();
        assert_eq!(raw.len(), 5 + aid.len() + 1);
        assert_eq!(&raw[..5], &[0x00, 0xA4, 0x04, 0x00, aid.len() as u8]);
        assert_eq!(&raw[5..12], &aid);
    }

    #[test]
    fn test_select_application_length_bounds() {
        assert!(matches!(
            select_application(&[0xA0; 4]).unwrap_err(),
            Error::InvalidAid(4)
        ));
        assert!(matches!(
            select_application(&[0xA0; 17]).unwrap_err(),
            Error::InvalidAid(17)
        ));
        assert!(select_application(&[0xA0; 5]).is_ok());
        assert!(select_application(&[0xA0; 16]).is_ok());
    }

    #[test]
    fn test_read_record_bytes() {
        // (1 << 3) | 4 = 0x0C.
        assert_eq!(
            read_record(1, 1).unwrap().encode().unwrap(),
            &[0x00, 0xB2, 0x01, 0x0C, 0x00]
        );
        assert_eq!(
            read_record(30, 255).unwrap().encode().unwrap(),
            &[0x00, 0xB2, 0xFF, 0xF4, 0x00]
        );
    }

    #[test]
    fn test_read_record_sfi_bounds() {
        assert!(matches!(read_record(0, 1).unwrap_err(), Error::InvalidSfi(0)));
        assert!(matches!(
            read_record(31, 1).unwrap_err(),
            Error::InvalidSfi(31)
        ));
    }

    #[test]
    fn test_get_data_bytes() {
        assert_eq!(
            get_data(0x9F17).unwrap().encode().unwrap(),
            &[0x80, 0xCA, 0x9F, 0x17, 0x00]
        );
        assert_eq!(
            get_data(0x0042).unwrap().encode().unwrap(),
            &[0x80, 0xCA, 0x00, 0x42, 0x00]
        );
    }

    #[test]
    fn test_get_data_tag_bounds() {
        assert!(matches!(
            get_data(0x1_0000).unwrap_err(),
            Error::InvalidTag(0x1_0000)
        ));
    }

    #[test]
    fn test_gpo_wraps_pdol_in_83() {
        assert_eq!(
            get_processing_options(&[]).encode().unwrap(),
            &[0x80, 0xA8, 0x00, 0x00, 0x02, 0x83, 0x00, 0x00]
        );
        assert_eq!(
            get_processing_options(&[0x12, 0x34]).encode().unwrap(),
            &[0x80, 0xA8, 0x00, 0x00, 0x04, 0x83, 0x02, 0x12, 0x34, 0x00]
        );
    }

    #[test]
    fn test_generate_ac_bytes() {
        let raw = generate_ac(CryptogramType::Arqc, &[0xAA, 0xBB])
            .unwrap()
            .encode()
            .unwrap();
        assert_eq!(raw, &[0x80, 0xAE, 0x80, 0x00, 0x02, 0xAA, 0xBB, 0x00]);
    }

    #[test]
    fn test_generate_ac_validation() {
        assert!(generate_ac(CryptogramType::Tc, &[]).is_err());
        assert!(generate_ac(CryptogramType::Reserved, &[0x00]).is_err());
    }

    #[test]
    fn test_internal_authenticate_validation() {
        assert!(internal_authenticate(&[]).is_err());
        let raw = internal_authenticate(&[0x01, 0x02, 0x03, 0x04])
            .unwrap()
            .encode()
            .unwrap();
        assert_eq!(
            raw,
            &[0x00, 0x88, 0x00, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04, 0x00]
        );
    }

    #[test]
    fn test_verify_pin_bytes() {
        assert_eq!(
            verify_pin("1234").unwrap().encode().unwrap(),
            &[0x00, 0x20, 0x00, 0x80, 0x08, 0x24, 0x12, 0x34, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_verify_pin_validation() {
        assert!(verify_pin("123").is_err());
        assert!(verify_pin("12345678901234").is_err());
        assert!(verify_pin("12c4").is_err());
    }

    #[test]
    fn test_change_pin_concatenates_blocks() {
        let raw = change_pin("1234", "567890").unwrap().encode().unwrap();
        assert_eq!(&raw[..4], &[0x00, 0x24, 0x00, 0x80]);
        assert_eq!(raw[4], 16);
        assert_eq!(&raw[5..13], &[0x24, 0x12, 0x34, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&raw[13..], &[0x26, 0x56, 0x78, 0x90, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_cryptogram_type_from_cid() {
        assert_eq!(CryptogramType::from_cid(0x00), CryptogramType::Aac);
        assert_eq!(CryptogramType::from_cid(0x40), CryptogramType::Tc);
        assert_eq!(CryptogramType::from_cid(0x80), CryptogramType::Arqc);
        // Low bits are advice/reason codes, not the type.
        assert_eq!(CryptogramType::from_cid(0x9A), CryptogramType::Arqc);
        assert_eq!(CryptogramType::from_cid(0xC0), CryptogramType::Reserved);
    }
}
