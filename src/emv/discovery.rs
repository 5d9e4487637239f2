//! Application discovery through the Payment System Environment.
//!
//! The PSE is a directory file listing the card's payment applications. Its
//! FCI names the directory EF's SFI (tag 88); the records hold Application
//! Templates (61) with an AID (4F), a label (50) and a priority (87). See
//! EMV Book 1, Section 12.3.

use crate::ber::{self, Tag, Tlv, Value};
use crate::errors::Result;
use crate::session::Session;
use crate::transport::Transport;
use crate::util::serde_hex;
use serde::Serialize;
use tracing::{debug, warn};

/// Directory records are sparse; probing stops at the first hole anyway,
/// and nothing real has ten of them.
const MAX_DIRECTORY_RECORDS: u8 = 10;

/// One application advertised by the PSE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppEntry {
    #[serde(serialize_with = "serde_hex::serialize")]
    pub aid: Vec<u8>,
    pub label: Option<String>,
    pub priority: Option<u8>,
}

/// Everything discovery pulled out of the PSE.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PseDirectory {
    /// 5F2D off the PSE FCI: 2-character language codes, eg. "enfr".
    pub language_preference: Option<String>,
    /// PSE record order, then occurrence order within a record. Duplicates
    /// are the card's own business and are kept.
    pub applications: Vec<AppEntry>,
}

impl<T: Transport> Session<T> {
    /// Walks the PSE directory and lists the applications it advertises.
    /// A card without a (selectable) PSE yields an empty directory, not an
    /// error; contactless-only cards do exist.
    pub fn discover_applications(&mut self) -> Result<PseDirectory> {
        let res = self.select_pse()?;
        if !res.is_ok() {
            debug!(status = %res.status, "PSE not selectable");
            return Ok(PseDirectory::default());
        }

        let fci = ber::parse(&res.data)?;
        let sfi = match ber::find_value(&fci, Tag(0x88)).and_then(|v| v.first()) {
            Some(&sfi) => sfi,
            None => {
                warn!("PSE FCI has no directory SFI (tag 88), assuming SFI 1");
                1
            }
        };
        let language_preference = ber::find_value(&fci, Tag(0x5F2D))
            .map(|v| String::from_utf8_lossy(v).into_owned());

        let mut applications = Vec::new();
        for record in 1..=MAX_DIRECTORY_RECORDS {
            let res = self.read_record(sfi, record)?;
            if !res.is_ok() {
                debug!(sfi, record, status = %res.status, "end of PSE directory");
                break;
            }
            collect_entries(&ber::parse_records(&res.data)?, &mut applications);
        }

        Ok(PseDirectory {
            language_preference,
            applications,
        })
    }
}

/// Collects every 4F in the forest, pairing it with the 50 and 87 that sit
/// alongside it in the same template.
fn collect_entries(siblings: &[Tlv], out: &mut Vec<AppEntry>) {
    for tlv in siblings {
        match &tlv.value {
            Value::Primitive(aid) if tlv.tag == Tag(0x4F) => {
                out.push(AppEntry {
                    aid: aid.clone(),
                    label: ber::find_value(siblings, Tag(0x50))
                        .map(|v| String::from_utf8_lossy(v).into_owned()),
                    priority: ber::find_value(siblings, Tag(0x87)).and_then(|v| v.first().copied()),
                });
            }
            Value::Primitive(_) => {}
            Value::Constructed(kids) => collect_entries(kids, out),
        }
    }
}
