//! A [`Session`] owns one card channel and runs command/response exchanges
//! over it, with the T=0 response-fetching dance handled in one place.

use crate::apdu::{Command, Response};
use crate::errors::Result;
use crate::transport::Transport;
use tracing::debug;

/// A connected card. All EMV operations hang off this; they borrow it
/// mutably, so command ordering is the caller's program order.
pub struct Session<T: Transport> {
    transport: T,
    auto_get_response: bool,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            auto_get_response: true,
        }
    }

    /// Disables the automatic GET RESPONSE / Le-retry handling; 61xx and
    /// 6Cxx statuses are then passed through to the caller untouched.
    pub fn raw_statuses(mut self) -> Self {
        self.auto_get_response = false;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn atr(&self) -> Result<Vec<u8>> {
        self.transport.atr()
    }

    pub fn reader_name(&self) -> &str {
        self.transport.reader_name()
    }

    /// Transmits one command and parses the response.
    ///
    /// With auto-fetch enabled (the default), two status families are
    /// resolved here (ISO 7816-4, 5.1.3):
    ///
    /// - `6C xx` — wrong Le; the same command is retransmitted with Le=xx.
    /// - `61 xx` — xx more bytes waiting; GET RESPONSE is issued until the
    ///   card runs dry, with each chunk appended and the status replaced.
    pub fn call(&mut self, cmd: &Command) -> Result<Response> {
        let mut res = self.exchange(cmd)?;

        if !self.auto_get_response {
            return Ok(res);
        }

        if let Some(le) = res.status.retry_le() {
            debug!(le, "retrying with corrected Le");
            res = self.exchange(&cmd.clone().expect(le))?;
        }

        while let Some(le) = res.status.bytes_remaining() {
            debug!(le, "fetching pending response bytes");
            let more = self.exchange(&Command::new(0x00, 0xC0, 0x00, 0x00).expect(le))?;
            res.data.extend_from_slice(&more.data);
            res.status = more.status;
        }

        Ok(res)
    }

    fn exchange(&mut self, cmd: &Command) -> Result<Response> {
        let raw = self.transport.exchange(&cmd.encode()?)?;
        Response::parse(&raw)
    }
}
