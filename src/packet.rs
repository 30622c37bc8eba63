use std::fmt::{Debug, Display, Formatter};

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use sha2::Sha256;


/// SHA-256 over a packet's kind, sequence number and payload. It detects corruption on the
///  simulated wire, it does not authenticate anything.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Digest(pub [u8; 32]);
impl Debug for Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
impl Digest {
    fn compute(kind: FrameKind, sequence_number: u64, payload: &[u8]) -> Digest {
        use sha2::Digest as _;

        let mut sha256 = Sha256::default();
        sha256.update([u8::from(kind)]);
        sha256.update(sequence_number.to_be_bytes());
        sha256.update(payload);
        Digest(sha256.finalize().into())
    }

    fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum FrameKind {
    Data = 0,
    Ack = 1,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Frame {
    Data { payload: Bytes },
    /// pure acknowledgement, never carries a payload
    Ack,
}
impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Data { .. } => FrameKind::Data,
            Frame::Ack => FrameKind::Ack,
        }
    }
}

/// The unit of transfer between two transport layers. A packet's digest is computed when it is
///  built and never changes afterwards: the only way its fields can diverge from the digest is
///  corruption on the (simulated) network.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Packet {
    sequence_number: u64,
    frame: Frame,
    digest: Digest,
}

impl Packet {
    /// kind + sequence number + digest + payload length
    pub const HEADER_LEN: usize = 1 + 8 + 32 + 4;

    pub fn data(payload: impl Into<Bytes>, sequence_number: u64) -> Packet {
        let payload = payload.into();
        let digest = Digest::compute(FrameKind::Data, sequence_number, &payload);
        Packet {
            sequence_number,
            frame: Frame::Data { payload },
            digest,
        }
    }

    pub fn ack(sequence_number: u64) -> Packet {
        Packet {
            sequence_number,
            frame: Frame::Ack,
            digest: Digest::compute(FrameKind::Ack, sequence_number, &[]),
        }
    }

    /// Turns a received data packet into the acknowledgement for it: same sequence number, no
    ///  payload, fresh digest
    pub fn into_ack(self) -> Packet {
        Packet::ack(self.sequence_number)
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn is_ack(&self) -> bool {
        matches!(self.frame, Frame::Ack)
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    /// empty for ACKs
    pub fn payload(&self) -> &[u8] {
        match &self.frame {
            Frame::Data { payload } => payload,
            Frame::Ack => &[],
        }
    }

    pub fn verify(&self) -> bool {
        Digest::compute(self.frame.kind(), self.sequence_number, self.payload()) == self.digest
    }

    /// Replaces the payload while keeping the digest, which is exactly what a bit-flipping
    ///  network does. ACKs have no payload, so there is nothing to replace.
    pub(crate) fn corrupt_payload(&mut self, garbage: Bytes) {
        if let Frame::Data { payload } = &mut self.frame {
            *payload = garbage;
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::HEADER_LEN + self.payload().len()
    }

    /// All numbers in network byte order:
    ///
    /// ```ascii
    ///  0: frame kind (u8) - 0 = data, 1 = ack
    ///  1: sequence number (u64)
    ///  9: digest (32 bytes)
    /// 41: payload length (u32), always 0 for ACKs
    /// 45: payload
    /// ```
    pub fn ser(&self, buf: &mut impl BufMut) {
        let payload = self.payload();
        debug_assert!(payload.len() <= u32::MAX as usize);

        buf.put_u8(self.frame.kind().into());
        buf.put_u64(self.sequence_number);
        buf.put_slice(&self.digest.0);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
    }

    /// NB: This does not verify the digest - a corrupted packet is still a well-formed packet,
    ///      and it is the receiver's decision what to do with it
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        if buf.remaining() < Self::HEADER_LEN {
            bail!("incomplete packet header: {} bytes", buf.remaining());
        }

        let kind = FrameKind::try_from(buf.get_u8())?;
        let sequence_number = buf.get_u64();
        let mut digest = [0u8; 32];
        buf.copy_to_slice(&mut digest);
        let payload_len = buf.get_u32() as usize;

        if buf.remaining() < payload_len {
            bail!("packet payload is truncated: expected {} bytes, got {}", payload_len, buf.remaining());
        }

        let frame = match kind {
            FrameKind::Data => Frame::Data { payload: buf.copy_to_bytes(payload_len) },
            FrameKind::Ack => {
                if payload_len != 0 {
                    bail!("ACK with a payload of {} bytes", payload_len);
                }
                Frame::Ack
            }
        };

        Ok(Packet {
            sequence_number,
            frame,
            digest: Digest(digest),
        })
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.frame {
            Frame::Data { payload } => write!(f, "DATA #{} ({} bytes, digest {}…)", self.sequence_number, payload.len(), self.digest.short()),
            Frame::Ack => write!(f, "ACK #{} (digest {}…)", self.sequence_number, self.digest.short()),
        }
    }
}
