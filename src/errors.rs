use crate::apdu::Status;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("PC/SC: {0}")]
    Pcsc(#[from] pcsc::Error),

    /// The transport handed back fewer bytes than the two mandatory status words.
    #[error("response truncated: expected at least 2 bytes, got {0}")]
    ShortResponse(usize),

    #[error("malformed BER-TLV data")]
    MalformedTlv,

    #[error("malformed ATR")]
    MalformedAtr,

    #[error("malformed GET PROCESSING OPTIONS response")]
    MalformedGpoResponse,

    /// The card answered with a non-9000 status word. Whether this is fatal
    /// depends on the operation; callers can match on the status.
    #[error("card returned status {0}")]
    Status(Status),

    #[error("wrong PIN, {attempts_left} attempt(s) left")]
    WrongPin { attempts_left: u8 },

    #[error("PIN is blocked")]
    PinBlocked,

    #[error("PIN is not initialised")]
    PinNotInitialized,

    #[error("AID must be 5-16 bytes, got {0}")]
    InvalidAid(usize),

    #[error("SFI must be 1-30, got {0}")]
    InvalidSfi(u8),

    #[error("PIN must be 4-12 decimal digits")]
    InvalidPin,

    #[error("GET DATA tag must fit in two bytes, got {0:#X}")]
    InvalidTag(u32),

    #[error("{0} requires a non-empty data field")]
    EmptyData(&'static str),

    #[error("the reserved cryptogram type cannot be requested")]
    InvalidCryptogramType,

    #[error("command data field too long for a short APDU: {0} bytes")]
    DataTooLong(usize),

    #[error("card records contain no CDOL1 (tag 8C)")]
    NoCdol,
}

impl Error {
    /// Maps a PIN-related status word to its typed error.
    ///
    /// 63Cx carries the remaining attempt counter in the low nibble; 6983 and
    /// 6984 are the blocked / not-initialised states from ISO 7816-4.
    pub fn from_pin_status(status: Status) -> Error {
        match (status.0, status.1) {
            (0x63, sw2) if sw2 & 0xF0 == 0xC0 => Error::WrongPin {
                attempts_left: sw2 & 0x0F,
            },
            (0x69, 0x83) => Error::PinBlocked,
            (0x69, 0x84) => Error::PinNotInitialized,
            _ => Error::Status(status),
        }
    }
}
