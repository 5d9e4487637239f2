//! ATR (Answer-to-Reset) decoding, for showing the user what kind of card
//! turned up. The EMV layer itself never looks in here.
//!
//! Covered by ISO 7816-3 and the EMV L1 Contact Interface Specification,
//! Section 8. Only the structure is decoded; the electrical parameters
//! inside the interface bytes are the reader's problem.

use crate::errors::{Error, Result};
use nom::bytes::complete::take;
use nom::combinator::cond;
use nom::number::complete::be_u8;
use num_enum::{FromPrimitive, IntoPrimitive};

pub type IResult<'a, T> = nom::IResult<&'a [u8], T>;

/// Initial Character TS: the electrical transmission convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Convention {
    /// Direct, 1 is high. What every card this decade uses.
    Direct = 0x3B,
    /// Inverse, 1 is low. Deprecated by EMV, still out there.
    Inverse = 0x3F,
    #[num_enum(catch_all)]
    Invalid(u8) = 0xFF,
}

/// A transmission protocol from a TD byte's low nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Protocol {
    T0 = 0,
    T1 = 1,
    #[num_enum(catch_all)]
    Other(u8) = 0xFF,
}

/// One level of interface bytes: TAi, TBi, TCi, and TDi announcing the next.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceBytes {
    pub ta: Option<u8>,
    pub tb: Option<u8>,
    pub tc: Option<u8>,
    pub td: Option<u8>,
}

impl InterfaceBytes {
    /// The protocol this level's TD refers to.
    pub fn protocol(&self) -> Option<Protocol> {
        self.td.map(|td| Protocol::from(td & 0x0F))
    }

    fn next_mask(&self) -> u8 {
        self.td.map(|td| td >> 4).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atr {
    pub convention: Convention,
    /// Interface byte levels, in order. Real cards stop at three.
    pub interface: Vec<InterfaceBytes>,
    /// Historical bytes, raw. COMPACT-TLV more often than not, but nothing
    /// here depends on that.
    pub historical: Vec<u8>,
    /// Check character; absent when the card only ever offered T=0.
    pub tck: Option<u8>,
}

impl Atr {
    /// Every protocol mentioned across the TD bytes, T=0 assumed when the
    /// first TD is absent.
    pub fn protocols(&self) -> Vec<Protocol> {
        let named: Vec<Protocol> = self.interface.iter().filter_map(|i| i.protocol()).collect();
        if named.is_empty() {
            vec![Protocol::T0]
        } else {
            named
        }
    }
}

fn take_interface_level(data: &[u8], mask: u8) -> IResult<InterfaceBytes> {
    let (data, ta) = cond(mask & 1 << 0 != 0, be_u8)(data)?;
    let (data, tb) = cond(mask & 1 << 1 != 0, be_u8)(data)?;
    let (data, tc) = cond(mask & 1 << 2 != 0, be_u8)(data)?;
    let (data, td) = cond(mask & 1 << 3 != 0, be_u8)(data)?;
    Ok((data, InterfaceBytes { ta, tb, tc, td }))
}

/// Decodes an ATR. Truncated input is an error; trailing bytes after the
/// check character are ignored.
pub fn parse(raw: &[u8]) -> Result<Atr> {
    parse_inner(raw).map(|(_, atr)| atr).map_err(|_| Error::MalformedAtr)
}

fn parse_inner(raw: &[u8]) -> IResult<Atr> {
    let (data, ts) = be_u8(raw)?;
    let (data, t0) = be_u8(data)?;
    let historical_len = t0 & 0x0F;

    let mut interface = Vec::new();
    let mut mask = t0 >> 4;
    let mut rest = data;
    while mask != 0 {
        let (next, level) = take_interface_level(rest, mask)?;
        mask = level.next_mask();
        interface.push(level);
        rest = next;
    }

    let (rest, historical) = take(historical_len)(rest)?;

    // TCK is present unless T=0 is the only protocol on offer.
    let only_t0 = interface
        .iter()
        .all(|level| matches!(level.protocol(), None | Some(Protocol::T0)));
    let (rest, tck) = cond(!only_t0, be_u8)(rest)?;

    Ok((
        rest,
        Atr {
            convention: Convention::from(ts),
            interface,
            historical: historical.to_vec(),
            tck,
        },
    ))
}
