use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{DecodeError, FramePayload, StreamErrorCode};

/// Frame header size on the wire: type, flags, length, stream id.
pub const HEADER_LEN: usize = 14;

/// Hard cap on a frame payload. Anything larger is a protocol violation.
pub const MAX_PAYLOAD_LEN: usize = 16384;

/// Frame type bytes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    StreamOpen = 0x01,
    StreamOpenAck = 0x02,
    StreamOpenErr = 0x03,
    StreamData = 0x04,
    StreamClose = 0x05,
    StreamReset = 0x06,
    RouteAdvertise = 0x10,
    RouteWithdraw = 0x11,
    PeerHello = 0x20,
    PeerHelloAck = 0x21,
    Keepalive = 0x22,
    KeepaliveAck = 0x23,
}

impl FrameType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => FrameType::StreamOpen,
            0x02 => FrameType::StreamOpenAck,
            0x03 => FrameType::StreamOpenErr,
            0x04 => FrameType::StreamData,
            0x05 => FrameType::StreamClose,
            0x06 => FrameType::StreamReset,
            0x10 => FrameType::RouteAdvertise,
            0x11 => FrameType::RouteWithdraw,
            0x20 => FrameType::PeerHello,
            0x21 => FrameType::PeerHelloAck,
            0x22 => FrameType::Keepalive,
            0x23 => FrameType::KeepaliveAck,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Control frames travel on stream id 0: handshake, keepalive, routing.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            FrameType::RouteAdvertise
                | FrameType::RouteWithdraw
                | FrameType::PeerHello
                | FrameType::PeerHelloAck
                | FrameType::Keepalive
                | FrameType::KeepaliveAck
        )
    }
}

bitflags! {
    /// Frame flags byte. Bits 2..7 are reserved and must be zero.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        const FIN_WRITE = 0b0000_0001;
        const FIN_READ = 0b0000_0010;
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub stream_id: u64,
    pub flags: FrameFlags,
    pub payload: FramePayload,
}

impl Frame {
    pub fn control(payload: FramePayload) -> Self {
        debug_assert!(payload.frame_type().is_control());
        Frame { stream_id: 0, flags: FrameFlags::empty(), payload }
    }

    pub fn data(stream_id: u64, bytes: Bytes) -> Self {
        Frame {
            stream_id,
            flags: FrameFlags::empty(),
            payload: FramePayload::StreamData(bytes),
        }
    }

    pub fn close(stream_id: u64, flags: FrameFlags) -> Self {
        Frame { stream_id, flags, payload: FramePayload::StreamClose }
    }

    pub fn reset(stream_id: u64, code: StreamErrorCode) -> Self {
        Frame {
            stream_id,
            flags: FrameFlags::empty(),
            payload: FramePayload::StreamReset { code },
        }
    }

    pub fn frame_type(&self) -> FrameType {
        self.payload.frame_type()
    }

    /// Serialize header and payload into one buffer.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(64);
        self.payload.encode_into(&mut body);
        debug_assert!(body.len() <= MAX_PAYLOAD_LEN);

        let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
        buf.put_u8(self.frame_type().as_u8());
        buf.put_u8(self.flags.bits());
        buf.put_u32(body.len() as u32);
        buf.put_u64(self.stream_id);
        buf.extend_from_slice(&body);
        buf.freeze()
    }

    /// Pull one frame off the front of `buf`, if a complete one has arrived.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Header fields are
    /// validated before the payload is awaited, so an oversize length or an
    /// unknown type fails immediately. On `Ok(Some(_))` and on
    /// [`DecodeError::UnsupportedTarget`] the frame's bytes have been
    /// consumed from `buf`; fatal errors leave the buffer poisoned and the
    /// connection must be dropped.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut hdr = &buf[..HEADER_LEN];
        let type_byte = hdr.get_u8();
        let flag_bits = hdr.get_u8();
        let len = hdr.get_u32();
        let stream_id = hdr.get_u64();

        if len as usize > MAX_PAYLOAD_LEN {
            return Err(DecodeError::Oversize { len });
        }
        let Some(frame_type) = FrameType::from_u8(type_byte) else {
            return Err(DecodeError::UnknownFrameType(type_byte));
        };
        let Some(flags) = FrameFlags::from_bits(flag_bits) else {
            return Err(DecodeError::ReservedFlags(flag_bits));
        };
        if frame_type.is_control() != (stream_id == 0) {
            return Err(DecodeError::UnexpectedStreamId { frame_type: type_byte, stream_id });
        }

        if buf.len() < HEADER_LEN + len as usize {
            return Ok(None);
        }
        buf.advance(HEADER_LEN);
        let body = buf.split_to(len as usize).freeze();
        let payload = FramePayload::decode(frame_type, body).map_err(|e| match e {
            DecodeError::UnsupportedTarget { request_id, addr_type, .. } => {
                DecodeError::UnsupportedTarget { stream_id, request_id, addr_type }
            }
            other => other,
        })?;
        Ok(Some(Frame { stream_id, flags, payload }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(bytes: &[u8]) -> Result<Option<Frame>, DecodeError> {
        let mut buf = BytesMut::from(bytes);
        Frame::decode(&mut buf)
    }

    #[test]
    fn header_layout_is_fourteen_bytes_big_endian() {
        let frame = Frame::data(0x0102030405060708, Bytes::from_static(b"hi"));
        let wire = frame.encode();
        assert_eq!(wire.len(), HEADER_LEN + 2);
        assert_eq!(wire[0], 0x04); // STREAM_DATA
        assert_eq!(wire[1], 0x00);
        assert_eq!(&wire[2..6], &[0, 0, 0, 2]);
        assert_eq!(&wire[6..14], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&wire[14..], b"hi");
    }

    #[test]
    fn partial_input_yields_none() {
        let frame = Frame::data(9, Bytes::from_static(b"abcdef"));
        let wire = frame.encode();
        for cut in 0..wire.len() {
            let mut buf = BytesMut::from(&wire[..cut]);
            assert_eq!(Frame::decode(&mut buf).unwrap(), None, "cut at {}", cut);
        }
        let mut buf = BytesMut::from(&wire[..]);
        assert_eq!(Frame::decode(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let a = Frame::data(3, Bytes::from_static(b"one"));
        let b = Frame::close(3, FrameFlags::FIN_WRITE);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a.encode());
        buf.extend_from_slice(&b.encode());
        assert_eq!(Frame::decode(&mut buf).unwrap(), Some(a));
        assert_eq!(Frame::decode(&mut buf).unwrap(), Some(b));
        assert_eq!(Frame::decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn payload_cap_boundary() {
        let max = Frame::data(1, Bytes::from(vec![0u8; MAX_PAYLOAD_LEN]));
        let wire = max.encode();
        assert!(feed(&wire).unwrap().is_some());

        // Same header with length 16385: rejected before the body arrives.
        let mut bad = BytesMut::from(&wire[..HEADER_LEN]);
        bad[2..6].copy_from_slice(&(MAX_PAYLOAD_LEN as u32 + 1).to_be_bytes());
        assert_eq!(
            Frame::decode(&mut bad),
            Err(DecodeError::Oversize { len: MAX_PAYLOAD_LEN as u32 + 1 })
        );
    }

    #[test]
    fn reserved_flag_bits_are_a_violation() {
        let mut wire = BytesMut::from(&Frame::data(1, Bytes::new()).encode()[..]);
        wire[1] = 0b0000_0100;
        assert_eq!(
            Frame::decode(&mut wire.clone()),
            Err(DecodeError::ReservedFlags(0b0000_0100))
        );
    }

    #[test]
    fn unknown_frame_type_is_fatal() {
        let mut wire = BytesMut::from(&Frame::data(1, Bytes::new()).encode()[..]);
        wire[0] = 0x7f;
        let err = Frame::decode(&mut wire).unwrap_err();
        assert_eq!(err, DecodeError::UnknownFrameType(0x7f));
        assert!(err.is_fatal());
    }

    #[test]
    fn control_frames_must_use_stream_id_zero() {
        // Keepalive on stream 5.
        let mut wire = BytesMut::from(
            &Frame::control(FramePayload::Keepalive { timestamp: 1 }).encode()[..],
        );
        wire[13] = 5;
        assert!(matches!(
            Frame::decode(&mut wire),
            Err(DecodeError::UnexpectedStreamId { frame_type: 0x22, stream_id: 5 })
        ));

        // Data on stream 0.
        let mut wire = BytesMut::from(&Frame::data(7, Bytes::new()).encode()[..]);
        wire[6..14].copy_from_slice(&[0; 8]);
        assert!(matches!(
            Frame::decode(&mut wire),
            Err(DecodeError::UnexpectedStreamId { frame_type: 0x04, stream_id: 0 })
        ));
    }

    #[test]
    fn empty_data_frame_is_legal() {
        let frame = Frame::data(1, Bytes::new());
        let mut buf = BytesMut::from(&frame.encode()[..]);
        assert_eq!(Frame::decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn close_carries_fin_bits() {
        let frame = Frame::close(11, FrameFlags::FIN_WRITE | FrameFlags::FIN_READ);
        let wire = frame.encode();
        assert_eq!(wire[1], 0b0000_0011);
        let mut buf = BytesMut::from(&wire[..]);
        assert_eq!(Frame::decode(&mut buf).unwrap(), Some(frame));
    }
}
