use crate::range::Range;
use crate::sbi::{Sbi, SBI_NONE};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Direction of a generic transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Command {
    Read,
    Write,
    #[default]
    Ignore,
}

/// Outcome of a generic transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Response {
    Ok,
    /// No target processed the transaction yet. Never a valid final answer;
    /// a caller seeing this has found a bug in some target.
    #[default]
    Incomplete,
    AddressError,
    CommandError,
    BurstError,
    ByteEnableError,
    GenericError,
}

impl Response {
    pub fn is_ok(self) -> bool {
        self == Response::Ok
    }

    /// Converts a failed response into a typed error, [`None`] for
    /// [`Response::Ok`].
    pub fn err(self) -> Option<BusError> {
        match self {
            Response::Ok => None,
            Response::Incomplete => Some(BusError::Incomplete),
            Response::AddressError => Some(BusError::Address),
            Response::CommandError => Some(BusError::Command),
            Response::BurstError => Some(BusError::Burst),
            Response::ByteEnableError => Some(BusError::ByteEnable),
            Response::GenericError => Some(BusError::Generic),
        }
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let s = match self {
            Response::Ok => "OK",
            Response::Incomplete => "incomplete",
            Response::AddressError => "address error",
            Response::CommandError => "command error",
            Response::BurstError => "burst error",
            Response::ByteEnableError => "byte enable error",
            Response::GenericError => "generic error",
        };

        f.write_str(s)
    }
}

/// Represents a failed bus access.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("transaction was not processed by any target")]
    Incomplete,

    #[error("address out of mapped range")]
    Address,

    #[error("access violates target permissions")]
    Command,

    #[error("malformed streaming width")]
    Burst,

    #[error("inconsistent byte enable length")]
    ByteEnable,

    #[error("generic bus error")]
    Generic,
}

/// A generic bus transaction.
///
/// Initiator sockets allocate two of these once (one for normal traffic, one
/// for debug traffic) and reuse them for every send; [`Payload::setup`]
/// resets all mutable state. The data buffer is owned so reuse also reuses
/// the allocation.
#[derive(Debug, Default)]
pub struct Payload {
    pub command: Command,
    pub address: u64,
    pub response: Response,
    pub dmi_allowed: bool,
    data: Vec<u8>,
    streaming_width: usize,
    byte_enable: Option<Vec<u8>>,
    sbi: Option<Sbi>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the payload for a new transaction carrying `data`. The
    /// streaming width defaults to the full data length, byte enables and
    /// the sideband extension are cleared.
    pub fn setup(&mut self, command: Command, address: u64, data: &[u8]) {
        self.command = command;
        self.address = address;
        self.response = Response::Incomplete;
        self.dmi_allowed = false;
        self.data.clear();
        self.data.extend_from_slice(data);
        self.streaming_width = data.len();
        self.byte_enable = None;
        self.sbi = None;
    }

    /// Like [`Payload::setup`] but with a zero-filled buffer of `len` bytes,
    /// for reads.
    pub fn setup_empty(&mut self, command: Command, address: u64, len: usize) {
        self.setup(command, address, &[]);
        self.data.resize(len, 0);
        self.streaming_width = len;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn streaming_width(&self) -> usize {
        self.streaming_width
    }

    pub fn set_streaming_width(&mut self, width: usize) {
        self.streaming_width = width;
    }

    pub fn byte_enable(&self) -> Option<&[u8]> {
        self.byte_enable.as_deref()
    }

    /// Attaches a byte-enable mask. A byte is enabled when its mask byte is
    /// non-zero; the mask repeats when shorter than the data.
    pub fn set_byte_enable(&mut self, mask: &[u8]) {
        self.byte_enable = Some(mask.to_vec());
    }

    pub fn clear_byte_enable(&mut self) {
        self.byte_enable = None;
    }

    /// Sideband extension, [`SBI_NONE`] when absent.
    pub fn sbi(&self) -> Sbi {
        self.sbi.unwrap_or(SBI_NONE)
    }

    pub fn has_sbi(&self) -> bool {
        self.sbi.is_some()
    }

    pub fn set_sbi(&mut self, sbi: Sbi) {
        self.sbi = Some(sbi);
    }

    /// Address range covered by the transaction.
    ///
    /// # Panics
    /// If the payload carries no data.
    pub fn range(&self) -> Range {
        Range::with_size(self.address, self.data.len() as u64)
    }

    /// Checks the streaming-width and byte-enable invariants, returning the
    /// error response to report when they do not hold.
    pub fn validate(&self) -> Option<Response> {
        let len = self.data.len();
        let width = self.streaming_width;

        if width == 0 || width > len || len % width != 0 {
            return Some(Response::BurstError);
        }

        if matches!(&self.byte_enable, Some(v) if v.is_empty()) {
            return Some(Response::ByteEnableError);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sbi::SBI_DEBUG;

    #[test]
    fn setup_resets() {
        let mut tx = Payload::new();

        tx.setup(Command::Write, 0x40, &[1, 2, 3, 4]);
        tx.set_byte_enable(&[0xff, 0x00]);
        tx.set_sbi(SBI_DEBUG);
        tx.response = Response::Ok;
        tx.dmi_allowed = true;

        tx.setup(Command::Read, 0x80, &[5, 6]);

        assert_eq!(tx.command, Command::Read);
        assert_eq!(tx.address, 0x80);
        assert_eq!(tx.response, Response::Incomplete);
        assert!(!tx.dmi_allowed);
        assert_eq!(tx.data(), &[5, 6]);
        assert_eq!(tx.streaming_width(), 2);
        assert!(tx.byte_enable().is_none());
        assert!(!tx.has_sbi());
        assert_eq!(tx.sbi(), SBI_NONE);
    }

    #[test]
    fn validate_burst() {
        let mut tx = Payload::new();

        tx.setup(Command::Write, 0, &[0; 4]);
        assert_eq!(tx.validate(), None);

        tx.set_streaming_width(0);
        assert_eq!(tx.validate(), Some(Response::BurstError));

        tx.set_streaming_width(8);
        assert_eq!(tx.validate(), Some(Response::BurstError));

        tx.set_streaming_width(3);
        assert_eq!(tx.validate(), Some(Response::BurstError));

        tx.set_streaming_width(2);
        assert_eq!(tx.validate(), None);
    }

    #[test]
    fn validate_byte_enable() {
        let mut tx = Payload::new();

        tx.setup(Command::Write, 0, &[0; 4]);
        tx.set_byte_enable(&[]);
        assert_eq!(tx.validate(), Some(Response::ByteEnableError));

        tx.set_byte_enable(&[0xff]);
        assert_eq!(tx.validate(), None);
    }

    #[test]
    fn range() {
        let mut tx = Payload::new();

        tx.setup_empty(Command::Read, 0x1000, 8);

        assert_eq!(tx.range(), Range::new(0x1000, 0x1007));
        assert_eq!(tx.data(), &[0; 8]);
    }
}
