//! Implementation for parsing and encoding relay cells.
//!
//! A relay cell is the body of a RELAY or RELAY_EARLY channel cell:
//! it is onion-encrypted on the wire, and once decrypted it carries
//! the stream-level protocol between a client and one hop of a
//! circuit.

use crate::chancell::{RawCellBody, CELL_DATA_LEN};
use shroud_bytes::{Error, Result};
use shroud_bytes::{Reader, Writer};

use arrayref::array_mut_ref;
use caret::caret_int;
use rand::{CryptoRng, Rng};

pub mod msg;

caret_int! {
    /// A command that identifies the type of a relay cell.
    pub struct RelayCmd(u8) {
        /// Start a new stream
        BEGIN = 1,
        /// Data on a stream
        DATA = 2,
        /// Close a stream
        END = 3,
        /// Acknowledge a BEGIN; stream is open
        CONNECTED = 4,
        /// Used for flow control
        SENDME = 5,
        /// Extend a circuit to a new hop (obsolete public-key format)
        EXTEND = 6,
        /// Reply to an EXTEND handshake (obsolete)
        EXTENDED = 7,
        /// Partially close a circuit
        TRUNCATE = 8,
        /// Circuit has been partially closed
        TRUNCATED = 9,
        /// Padding cell
        DROP = 10,
        /// Start a DNS lookup
        RESOLVE = 11,
        /// Reply to a DNS lookup
        RESOLVED = 12,
        /// Start a directory stream
        BEGIN_DIR = 13,
        /// Extend a circuit to a new hop
        EXTEND2 = 14,
        /// Reply to an EXTEND2 message
        EXTENDED2 = 15,
    }
}

/// How many bytes of a relay cell are given over to its header
/// (command, recognized, stream ID, digest, and length).
pub const RELAY_HEADER_LEN: usize = 11;

/// The longest allowable length for the data portion of a relay cell.
pub const MAX_RELAY_DATA_LEN: usize = CELL_DATA_LEN - RELAY_HEADER_LEN;

/// Possible requirements on stream IDs for a relay command.
enum StreamIdReq {
    /// Can only be used with a stream ID of 0.
    WantZero,
    /// Can only be used with a stream ID that isn't 0.
    WantNonZero,
    /// Can be used with any stream ID.
    Any,
}

impl RelayCmd {
    /// Check whether this command requires a certain kind of
    /// StreamId, and return a corresponding StreamIdReq.
    fn expects_streamid(self) -> StreamIdReq {
        match self {
            RelayCmd::BEGIN
            | RelayCmd::DATA
            | RelayCmd::END
            | RelayCmd::CONNECTED
            | RelayCmd::RESOLVE
            | RelayCmd::RESOLVED
            | RelayCmd::BEGIN_DIR => StreamIdReq::WantNonZero,
            RelayCmd::EXTEND
            | RelayCmd::EXTENDED
            | RelayCmd::TRUNCATE
            | RelayCmd::TRUNCATED
            | RelayCmd::DROP
            | RelayCmd::EXTEND2
            | RelayCmd::EXTENDED2 => StreamIdReq::WantZero,
            _ => StreamIdReq::Any,
        }
    }
    /// Return true if this command is one that accepts the particular
    /// stream ID `id`.
    pub fn accepts_streamid_val(self, id: StreamId) -> bool {
        match (self.expects_streamid(), id.is_zero()) {
            (StreamIdReq::WantNonZero, true) => false,
            (StreamIdReq::WantZero, false) => false,
            (_, _) => true,
        }
    }
}

/// Identify a single stream on a circuit.
///
/// These identifiers are local to each hop on a circuit.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct StreamId(u16);

impl From<u16> for StreamId {
    fn from(v: u16) -> StreamId {
        StreamId(v)
    }
}

impl From<StreamId> for u16 {
    fn from(id: StreamId) -> u16 {
        id.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        self.0.fmt(f)
    }
}

impl StreamId {
    /// Return true if this is the zero StreamId.
    ///
    /// A zero-valued stream ID denotes a relay message that is not
    /// related to any particular stream, but which applies to the
    /// circuit as a whole.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

/// A decoded and decrypted relay cell.
#[derive(Debug)]
pub struct RelayCell {
    /// The stream ID for the stream that this cell corresponds to.
    streamid: StreamId,
    /// The relay message for this cell.
    msg: msg::RelayMsg,
}

impl RelayCell {
    /// Construct a new relay cell.
    pub fn new(streamid: StreamId, msg: msg::RelayMsg) -> Self {
        RelayCell { streamid, msg }
    }
    /// Consume this cell and return its components.
    pub fn into_streamid_and_msg(self) -> (StreamId, msg::RelayMsg) {
        (self.streamid, self.msg)
    }
    /// Return the command for this cell.
    pub fn cmd(&self) -> RelayCmd {
        self.msg.cmd()
    }
    /// Return the underlying message for this cell.
    pub fn msg(&self) -> &msg::RelayMsg {
        &self.msg
    }
    /// Return true if this cell counts towards the circuit-level
    /// flow-control windows.
    ///
    /// (Only DATA cells are counted, at either level.)
    pub fn counts_towards_circuit_windows(&self) -> bool {
        self.msg.counts_towards_windows()
    }
    /// Consume this relay message and encode it as a 509-byte padded
    /// cell body.
    ///
    /// The `recognized` and `digest` fields are left zero; the crypto
    /// layer fills them in when the cell is assigned to a hop.
    pub fn encode<R: Rng + CryptoRng>(self, rng: &mut R) -> crate::Result<RawCellBody> {
        /// We skip this much space before adding any random padding
        /// to the end of the cell.
        const MIN_SPACE_BEFORE_PADDING: usize = 4;

        let encoded = self.encode_to_vec();
        let enc_len = encoded.len();
        if enc_len > CELL_DATA_LEN {
            return Err(crate::Error::InternalError(
                "too many bytes in relay cell".into(),
            ));
        }
        let mut raw = [0_u8; CELL_DATA_LEN];
        raw[0..enc_len].copy_from_slice(&encoded);

        // Padding the unused part of the cell body with random bytes
        // makes the ciphertext at each hop indistinguishable from
        // noise even if later hops' keys are compromised.
        if enc_len < CELL_DATA_LEN - MIN_SPACE_BEFORE_PADDING {
            rng.fill_bytes(&mut raw[enc_len + MIN_SPACE_BEFORE_PADDING..]);
        }

        Ok(raw)
    }

    /// Consume a relay cell and return its contents, encoded for use
    /// in a RELAY or RELAY_EARLY cell.
    fn encode_to_vec(self) -> Vec<u8> {
        let mut w = Vec::new();
        w.write_u8(self.msg.cmd().into());
        w.write_u16(0); // "Recognized"
        w.write_u16(self.streamid.0);
        w.write_u32(0); // Digest
        let len_pos = w.len();
        w.write_u16(0); // Length.
        let body_pos = w.len();
        self.msg.encode_onto(&mut w);
        assert!(w.len() >= body_pos); // nothing was removed
        let payload_len = w.len() - body_pos;
        assert!(payload_len <= std::u16::MAX as usize);
        *(array_mut_ref![w, len_pos, 2]) = (payload_len as u16).to_be_bytes();
        w
    }
    /// Parse a RELAY or RELAY_EARLY cell body into a RelayCell.
    ///
    /// Requires that the cryptographic checks on the message have
    /// already been performed.
    pub fn decode(body: RawCellBody) -> Result<Self> {
        let mut reader = Reader::from_slice(body.as_ref());
        RelayCell::decode_from_reader(&mut reader)
    }
    /// Parse a RELAY or RELAY_EARLY cell body into a RelayCell from a
    /// reader.
    ///
    /// Requires that the cryptographic checks on the message have
    /// already been performed.
    pub fn decode_from_reader(r: &mut Reader<'_>) -> Result<Self> {
        let cmd = r.take_u8()?.into();
        r.advance(2)?; // "recognized"
        let streamid = StreamId(r.take_u16()?);
        r.advance(4)?; // digest
        let len = r.take_u16()? as usize;
        if len > MAX_RELAY_DATA_LEN {
            return Err(Error::BadMessage("Relay cell length too long"));
        }
        if r.remaining() < len {
            return Err(Error::BadMessage("Insufficient data in relay cell"));
        }
        r.truncate(len);
        let msg = msg::RelayMsg::decode_from_reader(cmd, r)?;
        Ok(RelayCell { streamid, msg })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn streamid_zero() {
        let z: StreamId = 0.into();
        assert!(z.is_zero());
        let nz: StreamId = 22.into();
        assert!(!nz.is_zero());
    }

    #[test]
    fn streamid_for_cmd() {
        let zero: StreamId = 0.into();
        let one: StreamId = 1.into();
        assert!(RelayCmd::DATA.accepts_streamid_val(one));
        assert!(!RelayCmd::DATA.accepts_streamid_val(zero));
        assert!(RelayCmd::EXTEND2.accepts_streamid_val(zero));
        assert!(!RelayCmd::EXTEND2.accepts_streamid_val(one));
        assert!(RelayCmd::SENDME.accepts_streamid_val(zero));
        assert!(RelayCmd::SENDME.accepts_streamid_val(one));
    }

    #[test]
    fn excessive_length_rejected() {
        let mut body = [0_u8; CELL_DATA_LEN];
        body[0] = 2; // DATA
        body[4] = 1; // stream 1
        body[9] = 0x01;
        body[10] = 0xf3; // length 499: too long by one.
        assert!(RelayCell::decode(body).is_err());

        let mut body = [0_u8; CELL_DATA_LEN];
        body[0] = 2;
        body[4] = 1;
        body[9] = 0x01;
        body[10] = 0xf2; // length 498: just fits.
        let cell = RelayCell::decode(body).unwrap();
        assert_eq!(cell.cmd(), RelayCmd::DATA);
    }
}
