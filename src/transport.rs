//! The byte-level card channel.
//!
//! Everything above this module speaks [`crate::apdu`] structures; the
//! transport just moves raw bytes to a card and back. PC/SC is the only real
//! implementation; tests use a scripted one.

use crate::errors::Result;
use std::ffi::CString;
use tracing::{debug, trace};

/// One smartcard channel. A smartcard link is strictly half-duplex with one
/// outstanding APDU, which the `&mut self` receiver enforces at compile time.
pub trait Transport {
    /// Transmits a raw command APDU, returns the raw response including the
    /// status words. Per-exchange deadlines are this layer's business; the
    /// core propagates whatever error comes back.
    fn exchange(&mut self, capdu: &[u8]) -> Result<Vec<u8>>;

    /// The card's Answer To Reset. Opaque to the EMV layer.
    fn atr(&self) -> Result<Vec<u8>>;

    /// Name of the reader the card sits in, for humans and logs.
    fn reader_name(&self) -> &str;
}

/// A live card behind a PC/SC reader.
pub struct Pcsc {
    card: pcsc::Card,
    reader: String,
}

impl Pcsc {
    /// Lists the names of all connected readers.
    pub fn list_readers() -> Result<Vec<String>> {
        let ctx = pcsc::Context::establish(pcsc::Scope::User)?;
        let mut buf = vec![0u8; ctx.list_readers_len()?];
        Ok(ctx
            .list_readers(&mut buf)?
            .map(|r| r.to_string_lossy().into_owned())
            .collect())
    }

    /// Connects to the named reader, or the first one if `None`.
    pub fn connect(reader: Option<&str>) -> Result<Self> {
        let ctx = pcsc::Context::establish(pcsc::Scope::User)?;
        let mut buf = vec![0u8; ctx.list_readers_len()?];
        let name = ctx
            .list_readers(&mut buf)?
            .find(|r| match reader {
                Some(want) => r.to_string_lossy() == want,
                None => true,
            })
            .ok_or(pcsc::Error::ReaderUnavailable)?
            .to_owned();

        debug!(reader = %name.to_string_lossy(), "connecting");
        let card = ctx.connect(&name, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)?;
        Ok(Self {
            card,
            reader: name.to_string_lossy().into_owned(),
        })
    }

    /// Blocks until a card shows up in the named reader (or the first one),
    /// then connects to it.
    pub fn wait_for_card(reader: Option<&str>) -> Result<Self> {
        let ctx = pcsc::Context::establish(pcsc::Scope::User)?;
        let mut buf = vec![0u8; ctx.list_readers_len()?];
        let name: CString = ctx
            .list_readers(&mut buf)?
            .find(|r| match reader {
                Some(want) => r.to_string_lossy() == want,
                None => true,
            })
            .ok_or(pcsc::Error::ReaderUnavailable)?
            .to_owned();

        debug!(reader = %name.to_string_lossy(), "waiting for card");
        let mut states = [pcsc::ReaderState::new(name.clone(), pcsc::State::UNAWARE)];
        loop {
            ctx.get_status_change(None, &mut states)?;
            if states[0].event_state().contains(pcsc::State::PRESENT) {
                break;
            }
            states[0].sync_current_state();
        }

        let card = ctx.connect(&name, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)?;
        Ok(Self {
            card,
            reader: name.to_string_lossy().into_owned(),
        })
    }
}

impl Transport for Pcsc {
    fn exchange(&mut self, capdu: &[u8]) -> Result<Vec<u8>> {
        trace!(tx = %hex::encode_upper(capdu), ">> TX");
        let mut rbuf = [0u8; pcsc::MAX_BUFFER_SIZE];
        let rapdu = self.card.transmit(capdu, &mut rbuf)?;
        trace!(rx = %hex::encode_upper(rapdu), "<< RX");
        Ok(rapdu.to_vec())
    }

    fn atr(&self) -> Result<Vec<u8>> {
        let mut buf = [0u8; pcsc::MAX_ATR_SIZE];
        Ok(self
            .card
            .get_attribute(pcsc::Attribute::AtrString, &mut buf)?
            .to_vec())
    }

    fn reader_name(&self) -> &str {
        &self.reader
    }
}

/// A transport that replays a scripted exchange, panicking on any deviation.
#[cfg(test)]
pub(crate) struct Scripted {
    script: Vec<(Vec<u8>, Vec<u8>)>,
    cursor: usize,
}

#[cfg(test)]
impl Scripted {
    pub fn new(script: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self { script, cursor: 0 }
    }

    pub fn done(&self) -> bool {
        self.cursor == self.script.len()
    }
}

#[cfg(test)]
impl Transport for Scripted {
    fn exchange(&mut self, capdu: &[u8]) -> Result<Vec<u8>> {
        let (expect, reply) = self
            .script
            .get(self.cursor)
            .unwrap_or_else(|| panic!("unexpected exchange #{}: {:02X?}", self.cursor, capdu));
        assert_eq!(
            hex::encode_upper(capdu),
            hex::encode_upper(expect),
            "exchange #{} sent the wrong APDU",
            self.cursor
        );
        self.cursor += 1;
        Ok(reply.clone())
    }

    fn atr(&self) -> Result<Vec<u8>> {
        Ok(vec![0x3B, 0x00])
    }

    fn reader_name(&self) -> &str {
        "Scripted Reader 00 00"
    }
}
