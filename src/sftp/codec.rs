//! Length-prefixed framing of the SFTP subsystem channel
//!
//! Every packet is a 4-byte big-endian length followed by that many bytes
//! of payload (type byte included). A declared length above
//! [`MAX_PACKET_LENGTH`] is rejected before any payload byte is consumed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::SftpdError;

const LENGTH_PREFIX: usize = 4;

/// Largest payload accepted from a client
pub const MAX_PACKET_LENGTH: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct SftpPacketCodec;

impl Decoder for SftpPacketCodec {
    type Item = BytesMut;
    type Error = SftpdError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_PACKET_LENGTH {
            return Err(SftpdError::PacketTooLong);
        }
        let total = LENGTH_PREFIX + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(length)))
    }
}

impl Encoder<Bytes> for SftpPacketCodec {
    type Error = SftpdError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(LENGTH_PREFIX + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}
