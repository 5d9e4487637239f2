//! The purchase flow: SELECT, GET PROCESSING OPTIONS, the AFL record walk,
//! and GENERATE AC, per EMV Book 3, Section 10.
//!
//! The orchestrator never panics its way out: anything that goes wrong after
//! validation lands in the [`TransactionReport`] with the partial state
//! gathered so far, so a caller can still look at the AIP or the records of
//! a card that refused to cut a cryptogram.

use crate::ber::{self, Tag};
use crate::emv::afl::{self, AflEntry};
use crate::emv::commands::{self, CryptogramType};
use crate::emv::dol::{Dol, TagValues};
use crate::errors::{Error, Result};
use crate::session::Session;
use crate::transport::Transport;
use crate::util::{self, serde_hex};
use byteorder::{BigEndian, ByteOrder};
use chrono::Local;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use std::fmt::Display;
use tracing::{debug, warn};

/// What the terminal wants from the card.
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    /// Amount, Authorised in minor units (1337 = £13.37).
    pub amount: u64,
    /// ISO 4217 numeric currency code (826 = GBP).
    pub currency: u16,
    /// Transaction Type (9C); 0x00 is a plain purchase.
    pub transaction_type: u8,
    /// The cryptogram to ask for. ARQC unless you know better.
    pub cryptogram_type: CryptogramType,
    /// Replacements for the default PDOL values, by tag.
    pub pdol_overrides: TagValues,
    /// Replacements for the default CDOL values, by tag.
    pub cdol_overrides: TagValues,
}

impl TransactionRequest {
    /// A plain online purchase.
    pub fn purchase(amount: u64, currency: u16) -> Self {
        Self {
            amount,
            currency,
            transaction_type: 0x00,
            cryptogram_type: CryptogramType::Arqc,
            pdol_overrides: TagValues::new(),
            cdol_overrides: TagValues::new(),
        }
    }
}

/// The outcome, successful or not, with everything gathered along the way.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransactionReport {
    pub success: bool,
    /// The failing operation and why, when `success` is false.
    pub error: Option<String>,
    #[serde(serialize_with = "serde_hex::option::serialize")]
    pub aip: Option<Vec<u8>>,
    pub afl: Option<Vec<AflEntry>>,
    /// Raw record payloads, AFL walk order.
    #[serde(serialize_with = "serde_hex::seq::serialize")]
    pub records: Vec<Vec<u8>>,
    /// What the card actually returned in the CID, which may not be what
    /// was asked for.
    pub cryptogram_type: Option<CryptogramType>,
    #[serde(serialize_with = "serde_hex::option::serialize")]
    pub cryptogram: Option<Vec<u8>>,
    /// Application Transaction Counter, when the card returned 9F36.
    pub atc: Option<u16>,
    #[serde(serialize_with = "serde_hex::option::serialize")]
    pub raw_generate_ac: Option<Vec<u8>>,
}

impl TransactionReport {
    fn fail(mut self, op: &str, why: impl Display) -> Self {
        self.success = false;
        self.error = Some(format!("{op}: {why}"));
        self
    }
}

/// Splits a GET PROCESSING OPTIONS response into (AIP, AFL bytes).
///
/// Format 1 is a primitive 0x80 holding AIP ‖ AFL; format 2 is a 0x77
/// template holding them as 82 and 94. A 77 without an AFL is taken as
/// "no records to read", which contactless-profile cards do produce.
pub fn parse_gpo_response(data: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let tlvs = ber::parse(data).map_err(|_| Error::MalformedGpoResponse)?;
    let first = tlvs.first().ok_or(Error::MalformedGpoResponse)?;
    match first.tag.0 {
        0x80 => {
            let value = first.primitive().ok_or(Error::MalformedGpoResponse)?;
            if value.len() < 2 {
                return Err(Error::MalformedGpoResponse);
            }
            Ok((value[..2].to_vec(), value[2..].to_vec()))
        }
        0x77 => {
            let aip = ber::find_value(&tlvs, Tag(0x82))
                .ok_or(Error::MalformedGpoResponse)?
                .to_vec();
            let afl = ber::find_value(&tlvs, Tag(0x94))
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            Ok((aip, afl))
        }
        _ => Err(Error::MalformedGpoResponse),
    }
}

/// The default terminal-side data element values, per request.
fn terminal_values(req: &TransactionRequest, rng: &mut dyn RngCore) -> TagValues {
    let mut unpredictable = [0u8; 4];
    rng.fill_bytes(&mut unpredictable);

    let mut values = TagValues::new();
    values.insert(Tag(0x9F02), util::amount_bcd(req.amount).to_vec());
    values.insert(Tag(0x9F03), vec![0x00; 6]);
    values.insert(Tag(0x9F1A), req.currency.to_be_bytes().to_vec());
    values.insert(Tag(0x95), vec![0x00; 5]);
    values.insert(Tag(0x5F2A), req.currency.to_be_bytes().to_vec());
    values.insert(
        Tag(0x9A),
        util::date_bcd(&Local::now().date_naive()).to_vec(),
    );
    values.insert(Tag(0x9C), vec![req.transaction_type]);
    values.insert(Tag(0x9F37), unpredictable.to_vec());
    values
}

fn merged(defaults: &TagValues, overrides: &TagValues) -> TagValues {
    let mut values = defaults.clone();
    for (tag, value) in overrides {
        values.insert(*tag, value.clone());
    }
    values
}

impl<T: Transport> Session<T> {
    /// Runs a full purchase against the given application.
    ///
    /// Argument validation errors surface as `Err`; everything after the
    /// first transmit lands in the report instead.
    pub fn transaction(&mut self, aid: &[u8], req: &TransactionRequest) -> Result<TransactionReport> {
        // Fails fast on a bad AID or a reserved cryptogram type, before any I/O.
        commands::select_application(aid)?;
        if req.cryptogram_type == CryptogramType::Reserved {
            return Err(Error::InvalidCryptogramType);
        }
        Ok(self.transaction_with_rng(aid, req, &mut OsRng))
    }

    /// [`Session::transaction`] with the unpredictable-number source passed
    /// in. Tests hand this a fixed-step generator; everyone else wants the
    /// OS's CSPRNG and should call [`Session::transaction`].
    pub fn transaction_with_rng(
        &mut self,
        aid: &[u8],
        req: &TransactionRequest,
        rng: &mut dyn RngCore,
    ) -> TransactionReport {
        let mut report = TransactionReport::default();
        let values = terminal_values(req, rng);

        // SELECT the application; its FCI may carry a PDOL.
        let fci = match self.select_application(aid).map(|r| r.require_ok()) {
            Ok(Ok(data)) => data,
            Ok(Err(e)) | Err(e) => return report.fail("SELECT", e),
        };
        let pdol = match ber::parse(&fci)
            .ok()
            .and_then(|tlvs| ber::find_value(&tlvs, Tag(0x9F38)).map(Dol::parse))
        {
            Some(Ok(pdol)) => pdol,
            Some(Err(e)) => return report.fail("PDOL parse", e),
            None => Dol::default(),
        };

        // GET PROCESSING OPTIONS. A refusal here is final; no retries.
        let pdol_data = pdol.build(&merged(&values, &req.pdol_overrides));
        let gpo = match self
            .get_processing_options(&pdol_data)
            .map(|r| r.require_ok())
        {
            Ok(Ok(data)) => data,
            Ok(Err(e)) | Err(e) => return report.fail("GET PROCESSING OPTIONS", e),
        };
        let (aip, afl_bytes) = match parse_gpo_response(&gpo) {
            Ok(parsed) => parsed,
            Err(e) => return report.fail("GET PROCESSING OPTIONS", e),
        };
        report.aip = Some(aip);
        let entries = afl::parse(&afl_bytes);
        report.afl = Some(entries.clone());

        // Read every record the AFL names. Cards routinely claim records
        // that turn out unreadable, so a refusal skips the record and moves
        // on rather than sinking the transaction.
        for entry in &entries {
            for record in entry.first_record..=entry.last_record {
                match self.read_record(entry.sfi, record) {
                    Ok(res) if res.is_ok() => report.records.push(res.data),
                    Ok(res) => {
                        warn!(sfi = entry.sfi, record, status = %res.status, "skipping unreadable record")
                    }
                    Err(e) => return report.fail("READ RECORD", e),
                }
            }
        }

        // CDOL1 lives in one of the records.
        let cdol = match report
            .records
            .iter()
            .find_map(|rec| {
                ber::parse_records(rec)
                    .ok()
                    .and_then(|tlvs| ber::find_value(&tlvs, Tag(0x8C)).map(Dol::parse))
            })
            .unwrap_or(Err(Error::NoCdol))
        {
            Ok(cdol) => cdol,
            Err(e) => return report.fail("CDOL1", e),
        };

        // GENERATE AC.
        let cdol_data = cdol.build(&merged(&values, &req.cdol_overrides));
        let cmd = match commands::generate_ac(req.cryptogram_type, &cdol_data) {
            Ok(cmd) => cmd,
            Err(e) => return report.fail("GENERATE AC", e),
        };
        let ac = match self.call(&cmd).map(|r| r.require_ok()) {
            Ok(Ok(data)) => data,
            Ok(Err(e)) | Err(e) => return report.fail("GENERATE AC", e),
        };
        report.raw_generate_ac = Some(ac.clone());

        match decode_generate_ac(&ac, &mut report) {
            Ok(()) => {
                debug!(cryptogram_type = ?report.cryptogram_type, atc = ?report.atc, "transaction complete");
                report.success = true;
                report
            }
            Err(e) => report.fail("GENERATE AC decode", e),
        }
    }
}

/// Fills the cryptogram fields of the report from a GENERATE AC response.
///
/// Format 2 is a 77 template with 9F27/9F26/9F36; format 1 is a primitive
/// 0x80 with CID ‖ ATC ‖ cryptogram ‖ issuer application data, in that
/// order and width.
fn decode_generate_ac(data: &[u8], report: &mut TransactionReport) -> Result<()> {
    let tlvs = ber::parse(data).map_err(|_| Error::MalformedTlv)?;
    let first = tlvs.first().ok_or(Error::MalformedTlv)?;

    if first.tag == Tag(0x80) {
        let value = first.primitive().ok_or(Error::MalformedTlv)?;
        if value.len() < 11 {
            return Err(Error::MalformedTlv);
        }
        report.cryptogram_type = Some(CryptogramType::from_cid(value[0]));
        report.atc = Some(BigEndian::read_u16(&value[1..3]));
        report.cryptogram = Some(value[3..11].to_vec());
        return Ok(());
    }

    if let Some(cid) = ber::find_value(&tlvs, Tag(0x9F27)).and_then(|v| v.first()) {
        report.cryptogram_type = Some(CryptogramType::from_cid(*cid));
    }
    report.cryptogram = ber::find_value(&tlvs, Tag(0x9F26)).map(<[u8]>::to_vec);
    report.atc = ber::find_value(&tlvs, Tag(0x9F36))
        .filter(|v| v.len() == 2)
        .map(BigEndian::read_u16);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Scripted;
    use rand::rngs::mock::StepRng;

    const AID: &[u8] = &[0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10];

    fn select_apdu() -> Vec<u8> {
        let mut apdu = vec![0x00, 0xA4, 0x04, 0x00, 0x07];
        apdu.extend_from_slice(AID);
        apdu.push(0x00);
        apdu
    }

    // StepRng yields 0x01020304 forever; little-endian, so the first four
    // bytes drawn are 04 03 02 01.
    const UN: [u8; 4] = [0x04, 0x03, 0x02, 0x01];

    fn rng() -> StepRng {
        StepRng::new(0x01020304, 0)
    }

    fn ok(mut data: Vec<u8>) -> Vec<u8> {
        data.extend_from_slice(&[0x90, 0x00]);
        data
    }

    #[test]
    fn test_parse_gpo_format_1() {
        let (aip, afl) =
            parse_gpo_response(&[0x80, 0x06, 0x1C, 0x00, 0x08, 0x01, 0x01, 0x00]).unwrap();
        assert_eq!(aip, &[0x1C, 0x00]);
        assert_eq!(afl, &[0x08, 0x01, 0x01, 0x00]);
    }

    #[test]
    fn test_parse_gpo_format_2() {
        let (aip, afl) = parse_gpo_response(&[
            0x77, 0x0A, 0x82, 0x02, 0x1C, 0x00, 0x94, 0x04, 0x08, 0x01, 0x01, 0x00,
        ])
        .unwrap();
        assert_eq!(aip, &[0x1C, 0x00]);
        assert_eq!(afl, &[0x08, 0x01, 0x01, 0x00]);
    }

    #[test]
    fn test_parse_gpo_format_2_no_afl() {
        let (aip, afl) = parse_gpo_response(&[0x77, 0x04, 0x82, 0x02, 0x1C, 0x00]).unwrap();
        assert_eq!(aip, &[0x1C, 0x00]);
        assert!(afl.is_empty());
    }

    #[test]
    fn test_parse_gpo_garbage() {
        assert!(matches!(
            parse_gpo_response(&[0x6F, 0x00]).unwrap_err(),
            Error::MalformedGpoResponse
        ));
        assert!(matches!(
            parse_gpo_response(&[0x80, 0x01, 0x1C]).unwrap_err(),
            Error::MalformedGpoResponse
        ));
        assert!(matches!(
            parse_gpo_response(&[]).unwrap_err(),
            Error::MalformedGpoResponse
        ));
    }

    #[test]
    fn test_transaction_full_flow() {
        // FCI without a PDOL; CDOL1 = 9F02(6) 9F37(4), so the GENERATE AC
        // value buffer is amount then UN.
        let fci = vec![
            0x6F, 0x0F, 0x84, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10, 0xA5, 0x04, 0x50,
            0x02, 0x56, 0x49,
        ];
        let record = vec![0x70, 0x08, 0x8C, 0x06, 0x9F, 0x02, 0x06, 0x9F, 0x37, 0x04];
        let mut gen_ac = vec![0x80, 0xAE, 0x80, 0x00, 0x0A];
        gen_ac.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x13, 0x37]);
        gen_ac.extend_from_slice(&UN);
        gen_ac.push(0x00);
        let gen_ac_rsp = vec![
            0x77, 0x14, 0x9F, 0x27, 0x01, 0x80, 0x9F, 0x36, 0x02, 0x00, 0x07, 0x9F, 0x26, 0x08,
            0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6, 0x07, 0x08,
        ];

        let mut sess = Session::new(Scripted::new(vec![
            (select_apdu(), ok(fci)),
            (
                vec![0x80, 0xA8, 0x00, 0x00, 0x02, 0x83, 0x00, 0x00],
                ok(vec![0x80, 0x06, 0x1C, 0x00, 0x08, 0x01, 0x01, 0x00]),
            ),
            (vec![0x00, 0xB2, 0x01, 0x0C, 0x00], ok(record.clone())),
            (gen_ac, ok(gen_ac_rsp)),
        ]));

        let req = TransactionRequest::purchase(1337, 826);
        let report = sess.transaction_with_rng(AID, &req, &mut rng());
        assert!(report.success, "failed: {:?}", report.error);
        assert_eq!(report.aip.as_deref(), Some(&[0x1C, 0x00][..]));
        assert_eq!(
            report.afl.as_deref(),
            Some(
                &[AflEntry {
                    sfi: 1,
                    first_record: 1,
                    last_record: 1,
                    sda_records: 0,
                }][..]
            )
        );
        assert_eq!(report.records, vec![record]);
        assert_eq!(report.cryptogram_type, Some(CryptogramType::Arqc));
        assert_eq!(
            report.cryptogram.as_deref(),
            Some(&[0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6, 0x07, 0x08][..])
        );
        assert_eq!(report.atc, Some(7));
        assert!(sess.transport().done());
    }

    #[test]
    fn test_transaction_builds_pdol() {
        // FCI with PDOL = 9F37(4): GPO data is 83 04 ‖ UN.
        let fci = vec![
            0x6F, 0x11, 0x84, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10, 0xA5, 0x06, 0x9F,
            0x38, 0x03, 0x9F, 0x37, 0x04,
        ];
        let mut gpo = vec![0x80, 0xA8, 0x00, 0x00, 0x06, 0x83, 0x04];
        gpo.extend_from_slice(&UN);
        gpo.push(0x00);

        let mut sess = Session::new(Scripted::new(vec![
            (select_apdu(), ok(fci)),
            (gpo, vec![0x69, 0x85]),
        ]));
        let req = TransactionRequest::purchase(1337, 826);
        let report = sess.transaction_with_rng(AID, &req, &mut rng());
        assert!(!report.success);
        let error = report.error.unwrap();
        assert!(error.contains("GET PROCESSING OPTIONS"), "{error}");
        assert!(error.contains("6985"), "{error}");
        assert!(sess.transport().done());
    }

    #[test]
    fn test_transaction_gpo_refusal_keeps_partial_state() {
        let fci = vec![
            0x6F, 0x09, 0x84, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10,
        ];
        let mut sess = Session::new(Scripted::new(vec![
            (select_apdu(), ok(fci)),
            (
                vec![0x80, 0xA8, 0x00, 0x00, 0x02, 0x83, 0x00, 0x00],
                vec![0x69, 0x85],
            ),
        ]));
        let req = TransactionRequest::purchase(100, 826);
        let report = sess.transaction_with_rng(AID, &req, &mut rng());
        assert!(!report.success);
        assert!(report.aip.is_none());
        assert!(report.records.is_empty());
        assert!(sess.transport().done());
    }

    #[test]
    fn test_transaction_skips_unreadable_records() {
        let fci = vec![
            0x6F, 0x09, 0x84, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10,
        ];
        let record = vec![0x70, 0x08, 0x8C, 0x06, 0x9F, 0x02, 0x06, 0x9F, 0x37, 0x04];
        let mut gen_ac = vec![0x80, 0xAE, 0x00, 0x00, 0x0A];
        gen_ac.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x05, 0x12]);
        gen_ac.extend_from_slice(&UN);
        gen_ac.push(0x00);
        // Format 1 GENERATE AC response: CID=AAC, ATC=9, cryptogram.
        let mut ac_value = vec![0x00, 0x00, 0x09];
        ac_value.extend_from_slice(&[0x11; 8]);
        let gen_ac_rsp = ber::encode_one(Tag(0x80), &ac_value);

        let mut sess = Session::new(Scripted::new(vec![
            (select_apdu(), ok(fci)),
            (
                vec![0x80, 0xA8, 0x00, 0x00, 0x02, 0x83, 0x00, 0x00],
                // AFL: SFI 1, records 1-2.
                ok(vec![0x80, 0x06, 0x1C, 0x00, 0x08, 0x01, 0x02, 0x00]),
            ),
            (vec![0x00, 0xB2, 0x01, 0x0C, 0x00], vec![0x6A, 0x83]),
            (vec![0x00, 0xB2, 0x02, 0x0C, 0x00], ok(record.clone())),
            (gen_ac, ok(gen_ac_rsp)),
        ]));

        let mut req = TransactionRequest::purchase(512, 826);
        req.cryptogram_type = CryptogramType::Aac;
        let report = sess.transaction_with_rng(AID, &req, &mut rng());
        assert!(report.success, "failed: {:?}", report.error);
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.cryptogram_type, Some(CryptogramType::Aac));
        assert_eq!(report.atc, Some(9));
        assert_eq!(report.cryptogram.as_deref(), Some(&[0x11; 8][..]));
        assert!(sess.transport().done());
    }

    #[test]
    fn test_transaction_no_cdol() {
        let fci = vec![
            0x6F, 0x09, 0x84, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10,
        ];
        // The record has data, but no 8C anywhere.
        let record = vec![0x70, 0x04, 0x5A, 0x02, 0x12, 0x34];
        let mut sess = Session::new(Scripted::new(vec![
            (select_apdu(), ok(fci)),
            (
                vec![0x80, 0xA8, 0x00, 0x00, 0x02, 0x83, 0x00, 0x00],
                ok(vec![0x80, 0x06, 0x1C, 0x00, 0x08, 0x01, 0x01, 0x00]),
            ),
            (vec![0x00, 0xB2, 0x01, 0x0C, 0x00], ok(record)),
        ]));
        let req = TransactionRequest::purchase(100, 826);
        let report = sess.transaction_with_rng(AID, &req, &mut rng());
        assert!(!report.success);
        assert!(report.error.unwrap().contains("CDOL1"));
        assert_eq!(report.records.len(), 1);
        assert!(sess.transport().done());
    }

    #[test]
    fn test_transaction_validates_before_transmitting() {
        let mut sess = Session::new(Scripted::new(vec![]));
        let req = TransactionRequest::purchase(100, 826);
        assert!(sess.transaction(&[0xA0; 3], &req).is_err());
        assert!(sess.transport().done());
    }

    #[test]
    fn test_cdol_overrides_replace_defaults() {
        let fci = vec![
            0x6F, 0x09, 0x84, 0x07, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x10, 0x10,
        ];
        // CDOL1 = 9F02(6) only; the override replaces the seeded amount.
        let record = vec![0x70, 0x05, 0x8C, 0x03, 0x9F, 0x02, 0x06];
        let gen_ac = vec![
            0x80, 0xAE, 0x80, 0x00, 0x06, 0x99, 0x99, 0x99, 0x99, 0x99, 0x99, 0x00,
        ];
        let mut ac_value = vec![0x80, 0x00, 0x01];
        ac_value.extend_from_slice(&[0x22; 8]);
        let gen_ac_rsp = ber::encode_one(Tag(0x80), &ac_value);

        let mut sess = Session::new(Scripted::new(vec![
            (select_apdu(), ok(fci)),
            (
                vec![0x80, 0xA8, 0x00, 0x00, 0x02, 0x83, 0x00, 0x00],
                ok(vec![0x80, 0x06, 0x1C, 0x00, 0x08, 0x01, 0x01, 0x00]),
            ),
            (vec![0x00, 0xB2, 0x01, 0x0C, 0x00], ok(record)),
            (gen_ac, ok(gen_ac_rsp)),
        ]));

        let mut req = TransactionRequest::purchase(1337, 826);
        req.cdol_overrides.insert(Tag(0x9F02), vec![0x99; 6]);
        let report = sess.transaction_with_rng(AID, &req, &mut rng());
        assert!(report.success, "failed: {:?}", report.error);
        assert_eq!(report.cryptogram_type, Some(CryptogramType::Arqc));
        assert!(sess.transport().done());
    }
}
