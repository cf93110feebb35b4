//! Implementation for encoding and decoding of ChanCells.

use super::CELL_DATA_LEN;
use crate::chancell::{msg, ChanCell, ChanCmd, CircId};
use crate::Error;
use arrayref::{array_mut_ref, array_ref};
use shroud_bytes::{self, Reader, Writer};

use bytes::BytesMut;

/// This object can be used to encode and decode channel cells.
///
/// NOTE: only link protocol versions 3 and higher are supported.
/// VERSIONS cells are not handled via the encoder/decoder: they
/// always use the legacy 2-byte circuit-ID form, no matter what
/// version has been negotiated, and are read by hand during the
/// handshake.
///
/// The implemented formats, on protocol 4 and later:
///
/// ```ignore
///     u32 circid;
///     u8 command;
///     u16 len;
///     u8 body[len];
/// ```
///
/// ```ignore
///     u32 circid;
///     u8 command;
///     u8 body[509];
/// ```
///
/// On protocol 3 the circuit ID is a u16 instead.
pub struct ChannelCodec {
    /// The link protocol version in use on this channel.
    ///
    /// The version decides the width of circuit IDs, and with it the
    /// total size of a fixed-width cell (514 bytes on protocol 4 and
    /// later, 512 on protocol 3).
    link_version: u16,
}

impl ChannelCodec {
    /// Create a new ChannelCodec with a given link protocol version.
    pub fn new(link_version: u16) -> Self {
        ChannelCodec { link_version }
    }

    /// Return true if this codec uses 4-byte circuit IDs.
    fn wide_ids(&self) -> bool {
        self.link_version >= 4
    }

    /// Return the number of bytes that precede the cell body: the
    /// circuit ID and the command.
    fn header_len(&self) -> usize {
        if self.wide_ids() {
            4 + 1
        } else {
            2 + 1
        }
    }

    /// Write the given cell into the provided BytesMut object.
    pub fn write_cell(&mut self, item: ChanCell, dst: &mut BytesMut) -> crate::Result<()> {
        let ChanCell { circid, msg } = item;
        let cmd = msg.cmd();
        if self.wide_ids() {
            dst.write_u32(circid.into());
        } else {
            if !circid.fits_in_narrow_id() {
                return Err(Error::InternalError(
                    "circuit ID too wide for link protocol 3".into(),
                ));
            }
            dst.write_u16(u32::from(circid) as u16);
        }
        dst.write_u8(cmd.into());

        // now write the cell body and handle the length.
        if cmd.is_var_cell() {
            let pos = dst.len();
            dst.write_u16(0);
            msg.write_body_onto(dst);
            let len = dst.len() - pos - 2;
            if len > std::u16::MAX as usize {
                return Err(Error::InternalError("ran out of space for varcell".into()));
            }
            // go back and set the length.
            *(array_mut_ref![&mut dst[pos..pos + 2], 0, 2]) = (len as u16).to_be_bytes();
        } else {
            let pos = dst.len();
            msg.write_body_onto(dst);
            let len = dst.len() - pos;
            if len > CELL_DATA_LEN {
                return Err(Error::InternalError("ran out of space for cell".into()));
            }
            // pad to end of fixed-length cell
            dst.write_zeros(CELL_DATA_LEN - len);
        }
        Ok(())
    }

    /// Try to decode a cell from the provided BytesMut object.
    ///
    /// On a definite decoding error, return Err(_).  On a cell that
    /// might just be truncated, return Ok(None).
    pub fn decode_cell(&mut self, src: &mut BytesMut) -> crate::Result<Option<ChanCell>> {
        let hdr = self.header_len();
        if src.len() < hdr + 2 {
            // Smallest possible cell: varcell with length 0.
            return Ok(None);
        }
        let cmd: ChanCmd = src[hdr - 1].into();
        let varcell = cmd.is_var_cell();
        let cell_len: usize = if varcell {
            let msg_len = u16::from_be_bytes(*array_ref![&src[hdr..hdr + 2], 0, 2]);
            msg_len as usize + hdr + 2
        } else {
            hdr + CELL_DATA_LEN
        };
        if src.len() < cell_len {
            return Ok(None);
        }

        let cell = src.split_to(cell_len).freeze();
        let mut r = Reader::from_bytes(&cell);
        let circid: CircId = if self.wide_ids() {
            r.take_u32()?.into()
        } else {
            u32::from(r.take_u16()?).into()
        };
        r.advance(if varcell { 3 } else { 1 })?;
        let msg = msg::ChanMsg::take(&mut r, cmd)?;

        if !cmd.accepts_circid_val(circid) {
            return Err(Error::ChanProto(format!(
                "Invalid circuit ID {} for cell command {}",
                circid, cmd
            )));
        }
        Ok(Some(ChanCell { circid, msg }))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::chancell::msg::Body;
    use hex_literal::hex;

    fn decode_err(ver: u16, body: &[u8]) -> crate::Error {
        let mut codec = ChannelCodec::new(ver);
        let mut bm = BytesMut::new();
        bm.extend_from_slice(body);
        codec.decode_cell(&mut bm).err().unwrap()
    }

    fn cell_roundtrip(ver: u16, cell: ChanCell) -> ChanCell {
        let mut codec = ChannelCodec::new(ver);
        let mut bm = BytesMut::new();
        codec.write_cell(cell, &mut bm).unwrap();
        codec.decode_cell(&mut bm).unwrap().unwrap()
    }

    #[test]
    fn wide_and_narrow_fixed() {
        let destroy = msg::Destroy::new(2.into());
        let cell = ChanCell::new(0x0203_0405.into(), destroy.clone().into_message());
        let mut codec = ChannelCodec::new(4);
        let mut bm = BytesMut::new();
        codec.write_cell(cell, &mut bm).unwrap();
        assert_eq!(bm.len(), 514);
        assert_eq!(&bm[..6], &hex!("02030405 04 02"));

        // The same cell on a narrow channel has to have a narrow ID.
        let cell = ChanCell::new(0x0203_0405.into(), destroy.clone().into_message());
        let mut codec3 = ChannelCodec::new(3);
        let mut bm = BytesMut::new();
        assert!(codec3.write_cell(cell, &mut bm).is_err());

        let cell = ChanCell::new(0x0405.into(), destroy.into_message());
        let decoded = cell_roundtrip(3, cell);
        assert_eq!(decoded.circid(), 0x0405.into());
        assert!(matches!(decoded.msg(), msg::ChanMsg::Destroy(_)));
    }

    #[test]
    fn truncated_cells() {
        let mut codec = ChannelCodec::new(4);
        let mut bm = BytesMut::new();
        bm.extend_from_slice(&hex!("02030405 03 99"));
        // A fixed cell missing most of its body: not an error, just
        // not ready yet.
        assert!(codec.decode_cell(&mut bm).unwrap().is_none());
        assert_eq!(bm.len(), 6);
    }

    #[test]
    fn bad_circid_for_cmd() {
        // PADDING with a nonzero circuit ID is invalid.
        let mut body = vec![];
        body.extend_from_slice(&hex!("00000010 00"));
        body.resize(514, 0);
        let e = decode_err(4, &body);
        assert!(matches!(e, Error::ChanProto(_)));
    }

    #[test]
    fn varcell_roundtrip() {
        let vp = msg::VPadding::new(17);
        let cell = ChanCell::new(0.into(), vp.into_message());
        let mut codec = ChannelCodec::new(4);
        let mut bm = BytesMut::new();
        codec.write_cell(cell, &mut bm).unwrap();
        assert_eq!(bm.len(), 4 + 1 + 2 + 17);
        let decoded = codec.decode_cell(&mut bm).unwrap().unwrap();
        assert!(matches!(decoded.msg(), msg::ChanMsg::VPadding(_)));
    }
}
