//! Interfaces to EMV payment cards.
//!
//! The EMV specifications can be downloaded freely from EMVCo's website, and
//! also contain a recap of ISO 7816. All data elements are defined in Book 1,
//! Annex B; the transaction flow in Book 3.

pub mod afl;
pub mod commands;
pub mod cvm;
pub mod discovery;
pub mod dol;
pub mod tags;
pub mod transaction;

pub use self::afl::AflEntry;
pub use self::commands::CryptogramType;
pub use self::cvm::{CvMethod, CvRule, CvmCondition, CvmContext, CvmList};
pub use self::discovery::AppEntry;
pub use self::dol::{Dol, DolEntry};
pub use self::transaction::{TransactionReport, TransactionRequest};

/// DF name of the contact Payment System Environment.
pub const PSE_DF_NAME: &str = "1PAY.SYS.DDF01";

/// DF name of the contactless Proximity PSE.
pub const PPSE_DF_NAME: &str = "2PAY.SYS.DDF01";
