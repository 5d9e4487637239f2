//! Cardholder Verification Method lists (tag 8E).
//!
//! A CVM List opens with two 4-byte amounts (the X and Y thresholds some
//! conditions compare against), then holds 2-byte rules in priority order.
//! Method, condition and rule layout are all from EMV Book 3, Annex C3 and
//! Section 10.5.

use byteorder::{BigEndian, ByteOrder};
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::Serialize;

/// How the cardholder is verified. Low 6 bits of the rule's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive, Serialize)]
#[repr(u8)]
pub enum CvMethod {
    /// Fail CVM processing outright.
    Fail = 0b00_0000,
    /// Plaintext PIN verified by the ICC.
    PlaintextPin = 0b00_0001,
    /// Enciphered PIN verified online.
    EncipheredPinOnline = 0b00_0010,
    /// Plaintext PIN verified by the ICC, plus paper signature.
    PlaintextPinAndSignature = 0b00_0011,
    /// Enciphered PIN verified by the ICC.
    EncipheredPin = 0b00_0100,
    /// Enciphered PIN verified by the ICC, plus paper signature.
    EncipheredPinAndSignature = 0b00_0101,
    /// Paper signature.
    Signature = 0b01_1110,
    /// No CVM required.
    NoCvm = 0b01_1111,
    /// Issuer- or payment-system-specific, or plain garbage.
    #[num_enum(catch_all)]
    Unknown(u8) = 0xFF,
}

/// When a rule applies. The rule's second byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive, Serialize)]
#[repr(u8)]
pub enum CvmCondition {
    Always = 0x00,
    UnattendedCash = 0x01,
    /// Not unattended cash, not manual cash, not purchase with cashback.
    NotUnattendedCashManualCashback = 0x02,
    /// The terminal supports this CVM.
    TerminalSupported = 0x03,
    ManualCash = 0x04,
    Cashback = 0x05,
    /// Application-currency transaction under the X threshold.
    AmountUnderX = 0x06,
    /// Application-currency transaction over the X threshold.
    AmountOverX = 0x07,
    /// Application-currency transaction under the Y threshold.
    AmountUnderY = 0x08,
    /// Application-currency transaction over the Y threshold.
    AmountOverY = 0x09,
    #[num_enum(catch_all)]
    Unknown(u8) = 0xFF,
}

/// One rule: a method, the condition under which to try it, and what to do
/// if it doesn't work out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CvRule {
    pub method: CvMethod,
    pub condition: CvmCondition,
    /// Bit 7 of the method byte *clear* means fail CVM processing when this
    /// rule's method fails, rather than moving to the next rule.
    pub fail_if_unsuccessful: bool,
}

impl CvRule {
    pub fn parse(method_byte: u8, condition_byte: u8) -> Self {
        Self {
            method: CvMethod::from(method_byte & 0x3F),
            condition: CvmCondition::from(condition_byte),
            fail_if_unsuccessful: method_byte & 0x40 == 0,
        }
    }
}

/// What the terminal knows about the transaction when choosing a CVM.
#[derive(Debug, Clone, Copy, Default)]
pub struct CvmContext {
    /// Transaction amount in minor units, in the application currency.
    /// Amount conditions can't match without it.
    pub amount: Option<u64>,
    pub terminal_supports_cvm: bool,
    pub unattended_cash: bool,
    pub manual_cash: bool,
    pub purchase_with_cashback: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CvmList {
    pub amount_x: u32,
    pub amount_y: u32,
    pub rules: Vec<CvRule>,
}

impl CvmList {
    /// Decodes a tag 8E value. Anything shorter than the 8-byte amount
    /// prefix decodes as an empty list; an odd trailing byte is dropped.
    pub fn parse(data: &[u8]) -> Self {
        if data.len() < 8 {
            return Self::default();
        }
        Self {
            amount_x: BigEndian::read_u32(&data[0..4]),
            amount_y: BigEndian::read_u32(&data[4..8]),
            rules: data[8..]
                .chunks_exact(2)
                .map(|pair| CvRule::parse(pair[0], pair[1]))
                .collect(),
        }
    }

    /// Picks the applicable rule: first in list order whose condition holds.
    /// EMV CVM selection is strictly priority-ordered, so no reordering, no
    /// best-match scoring.
    pub fn select(&self, ctx: &CvmContext) -> Option<&CvRule> {
        self.rules.iter().find(|r| self.holds(r.condition, ctx))
    }

    fn holds(&self, condition: CvmCondition, ctx: &CvmContext) -> bool {
        match condition {
            CvmCondition::Always => true,
            CvmCondition::UnattendedCash => ctx.unattended_cash,
            CvmCondition::NotUnattendedCashManualCashback => {
                !ctx.unattended_cash && !ctx.manual_cash && !ctx.purchase_with_cashback
            }
            CvmCondition::TerminalSupported => ctx.terminal_supports_cvm,
            CvmCondition::ManualCash => ctx.manual_cash,
            CvmCondition::Cashback => ctx.purchase_with_cashback,
            CvmCondition::AmountUnderX => ctx.amount.is_some_and(|a| a < self.amount_x as u64),
            CvmCondition::AmountOverX => ctx.amount.is_some_and(|a| a > self.amount_x as u64),
            CvmCondition::AmountUnderY => ctx.amount.is_some_and(|a| a < self.amount_y as u64),
            CvmCondition::AmountOverY => ctx.amount.is_some_and(|a| a > self.amount_y as u64),
            CvmCondition::Unknown(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // CVM list off a UK debit card: X=0, Y=0, enciphered PIN else signature
    // else no CVM.
    const DEBIT_8E: &[u8] = &[
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x42, 0x03, 0x5E, 0x03, 0x1F, 0x03,
    ];

    #[test]
    fn test_parse() {
        let list = CvmList::parse(DEBIT_8E);
        assert_eq!(list.amount_x, 0);
        assert_eq!(list.amount_y, 0);
        assert_eq!(
            list.rules,
            vec![
                CvRule {
                    method: CvMethod::EncipheredPin,
                    condition: CvmCondition::TerminalSupported,
                    fail_if_unsuccessful: false,
                },
                CvRule {
                    method: CvMethod::Signature,
                    condition: CvmCondition::TerminalSupported,
                    fail_if_unsuccessful: false,
                },
                CvRule {
                    method: CvMethod::NoCvm,
                    condition: CvmCondition::TerminalSupported,
                    fail_if_unsuccessful: false,
                },
            ]
        );
    }

    #[test]
    fn test_parse_rule_0x41_0x03() {
        let rule = CvRule::parse(0x41, 0x03);
        assert_eq!(rule.method, CvMethod::PlaintextPin);
        assert_eq!(rule.condition, CvmCondition::TerminalSupported);
        assert!(!rule.fail_if_unsuccessful);
    }

    #[test]
    fn test_parse_fail_bit() {
        // Bit 7 clear: failing this method fails cardholder verification.
        let rule = CvRule::parse(0x01, 0x00);
        assert!(rule.fail_if_unsuccessful);
    }

    #[test]
    fn test_parse_unknown_method_and_condition() {
        let rule = CvRule::parse(0x6A, 0x25);
        assert_eq!(rule.method, CvMethod::Unknown(0x2A));
        assert_eq!(rule.condition, CvmCondition::Unknown(0x25));
    }

    #[test]
    fn test_parse_short_input() {
        let list = CvmList::parse(&[0x00; 7]);
        assert_eq!(list, CvmList::default());
    }

    #[test]
    fn test_parse_odd_trailing_byte() {
        let mut data = DEBIT_8E.to_vec();
        data.push(0x1F);
        assert_eq!(CvmList::parse(&data).rules.len(), 3);
    }

    #[test]
    fn test_select_first_match() {
        let list = CvmList::parse(DEBIT_8E);
        let ctx = CvmContext {
            terminal_supports_cvm: true,
            ..Default::default()
        };
        assert_eq!(list.select(&ctx).unwrap().method, CvMethod::EncipheredPin);
    }

    #[test]
    fn test_select_no_match() {
        let list = CvmList::parse(DEBIT_8E);
        // A terminal that supports nothing matches nothing in this list.
        assert!(list.select(&CvmContext::default()).is_none());
    }

    #[test]
    fn test_select_amount_thresholds() {
        // X=1000, Y=5000: PIN under X, signature over X.
        let list = CvmList::parse(&[
            0x00, 0x00, 0x03, 0xE8, 0x00, 0x00, 0x13, 0x88, 0x41, 0x06, 0x5E, 0x07, 0x1F, 0x00,
        ]);
        let under = CvmContext {
            amount: Some(999),
            ..Default::default()
        };
        assert_eq!(
            list.select(&under).unwrap().method,
            CvMethod::PlaintextPin
        );
        let over = CvmContext {
            amount: Some(1001),
            ..Default::default()
        };
        assert_eq!(list.select(&over).unwrap().method, CvMethod::Signature);
        // Exactly X matches neither strict comparison; falls to the
        // unconditional no-CVM rule.
        let exact = CvmContext {
            amount: Some(1000),
            ..Default::default()
        };
        assert_eq!(list.select(&exact).unwrap().method, CvMethod::NoCvm);
    }

    #[test]
    fn test_select_amount_needs_amount() {
        let list = CvmList::parse(&[
            0x00, 0x00, 0x03, 0xE8, 0x00, 0x00, 0x13, 0x88, 0x41, 0x06, 0x1F, 0x00,
        ]);
        // No amount in context: the amount rule is skipped entirely.
        assert_eq!(
            list.select(&CvmContext::default()).unwrap().method,
            CvMethod::NoCvm
        );
    }

    #[test]
    fn test_select_not_unattended_manual_cashback() {
        let list = CvmList::parse(&[
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x42, 0x02, 0x1F, 0x00,
        ]);
        assert_eq!(
            list.select(&CvmContext::default()).unwrap().method,
            CvMethod::EncipheredPin
        );
        let cashback = CvmContext {
            purchase_with_cashback: true,
            ..Default::default()
        };
        assert_eq!(list.select(&cashback).unwrap().method, CvMethod::NoCvm);
    }
}
