use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Maximum plaintext frame length. Chosen as a multiple of the AES block size
/// so that `header + padded ciphertext` stays within the configured packet
/// size: 16 (header) + 1392 + up to 16 (PKCS7) = 1424 <= 1432.
pub const MAX_FRAME_LEN: usize = 1392;

/// Worst-case frame overhead before gene payload (stream-mode FirstGene:
/// type 2 + mode 2 + id 4 + data control 2 + rtt hint 4 + total genes 4 +
/// max stream length 8 + data id 8).
pub const FIRST_GENE_STREAM_OVERHEAD: usize = 34;

/// Uniform per-gene payload size. Using the worst-case overhead for every
/// gene keeps gene positions computable from byte offsets alone.
pub const GENE_PAYLOAD_LEN: usize = MAX_FRAME_LEN - FIRST_GENE_STREAM_OVERHEAD;

/// An ack packet under construction is closed and a new one started when the
/// remaining capacity falls below this margin.
pub const ACK_MARGIN: usize = 32;

/// Sentinel first field of a burst ack entry.
pub const BURST_SENTINEL: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum FrameType {
    Close = 1,
    Ack = 2,
    FirstGene = 3,
    FollowingGene = 4,
    Knock = 5,
    KnockResponse = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum TransmissionMode {
    Block = 1,
    Stream = 2,
}

/// Per-gene control tag: whether more genes follow in this transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum DataControl {
    More = 0,
    Complete = 1,
}

/// Stream-mode extension of a FirstGene frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    /// Requested total stream length; negative means unlimited.
    pub max_stream_length: i64,
    /// Application-chosen correlation id for the stream's data.
    pub data_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstGene {
    pub mode: TransmissionMode,
    pub transmission_id: u32,
    pub data_control: DataControl,
    /// Sender's current smoothed RTT in mics, 0 if unknown. Lets the receiver
    ///  seed its estimator before it has samples of its own.
    pub rtt_hint_mics: i32,
    pub total_genes: i32,
    pub stream: Option<StreamInfo>,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowingGene {
    pub transmission_id: u32,
    pub data_control: DataControl,
    /// Gene serial within the transmission; the first gene is position 0 and
    ///  travels in a FirstGene frame, so this is always >= 1.
    pub data_position: i32,
    pub payload: Bytes,
}

/// One entry of an Ack frame.
///
/// Wire format: a burst entry is `-1:i32, transmissionId:u32`; a block entry
/// is `maxReceivePosition:i32, transmissionId:u32, successive:i32,
/// pairCount:u16` followed by `pairCount` half-open `(start, end)` ranges.
/// `maxReceivePosition` is never negative, so the sentinel is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEntry {
    /// The entire transmission was received.
    Burst { transmission_id: u32 },
    /// Specific gene ranges were received.
    Block {
        transmission_id: u32,
        max_receive_position: i32,
        successive_received_position: i32,
        ranges: Vec<(i32, i32)>,
    },
}

impl AckEntry {
    pub fn serialized_len(&self) -> usize {
        match self {
            AckEntry::Burst { .. } => 8,
            AckEntry::Block { ranges, .. } => 14 + 8 * ranges.len(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            AckEntry::Burst { transmission_id } => {
                buf.put_i32_le(BURST_SENTINEL);
                buf.put_u32_le(*transmission_id);
            }
            AckEntry::Block {
                transmission_id,
                max_receive_position,
                successive_received_position,
                ranges,
            } => {
                buf.put_i32_le(*max_receive_position);
                buf.put_u32_le(*transmission_id);
                buf.put_i32_le(*successive_received_position);
                buf.put_u16_le(ranges.len() as u16);
                for &(start, end) in ranges {
                    buf.put_i32_le(start);
                    buf.put_i32_le(end);
                }
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckEntry> {
        let first = buf.try_get_i32_le()?;
        if first == BURST_SENTINEL {
            return Ok(AckEntry::Burst {
                transmission_id: buf.try_get_u32_le()?,
            });
        }

        let transmission_id = buf.try_get_u32_le()?;
        let successive_received_position = buf.try_get_i32_le()?;
        let pair_count = buf.try_get_u16_le()?;
        let mut ranges = Vec::with_capacity(pair_count as usize);
        for _ in 0..pair_count {
            let start = buf.try_get_i32_le()?;
            let end = buf.try_get_i32_le()?;
            ranges.push((start, end));
        }
        Ok(AckEntry::Block {
            transmission_id,
            max_receive_position: first,
            successive_received_position,
            ranges,
        })
    }
}

/// Everything that can follow the packet header, inside the encryption
/// envelope. A 2-byte frame type discriminator precedes the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Close,
    Ack(Vec<AckEntry>),
    FirstGene(FirstGene),
    FollowingGene(FollowingGene),
    Knock {
        transmission_id: u32,
    },
    KnockResponse {
        transmission_id: u32,
        max_receive_position: i32,
    },
}

impl Frame {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Frame::Close => {
                buf.put_u16_le(FrameType::Close.into());
            }
            Frame::Ack(entries) => {
                buf.put_u16_le(FrameType::Ack.into());
                for entry in entries {
                    entry.ser(buf);
                }
            }
            Frame::FirstGene(g) => {
                buf.put_u16_le(FrameType::FirstGene.into());
                buf.put_u16_le(g.mode.into());
                buf.put_u32_le(g.transmission_id);
                buf.put_u16_le(g.data_control.into());
                buf.put_i32_le(g.rtt_hint_mics);
                buf.put_i32_le(g.total_genes);
                if let Some(stream) = &g.stream {
                    buf.put_i64_le(stream.max_stream_length);
                    buf.put_u64_le(stream.data_id);
                }
                buf.put_slice(&g.payload);
            }
            Frame::FollowingGene(g) => {
                buf.put_u16_le(FrameType::FollowingGene.into());
                buf.put_u32_le(g.transmission_id);
                buf.put_u16_le(g.data_control.into());
                buf.put_i32_le(g.data_position);
                buf.put_slice(&g.payload);
            }
            Frame::Knock { transmission_id } => {
                buf.put_u16_le(FrameType::Knock.into());
                buf.put_u32_le(*transmission_id);
            }
            Frame::KnockResponse {
                transmission_id,
                max_receive_position,
            } => {
                buf.put_u16_le(FrameType::KnockResponse.into());
                buf.put_u32_le(*transmission_id);
                buf.put_i32_le(*max_receive_position);
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.to_vec()
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Frame> {
        let frame_type = FrameType::try_from(buf.try_get_u16_le()?)?;

        match frame_type {
            FrameType::Close => Ok(Frame::Close),
            FrameType::Ack => {
                let mut entries = Vec::new();
                while buf.has_remaining() {
                    entries.push(AckEntry::deser(buf)?);
                }
                Ok(Frame::Ack(entries))
            }
            FrameType::FirstGene => {
                let mode = TransmissionMode::try_from(buf.try_get_u16_le()?)?;
                let transmission_id = buf.try_get_u32_le()?;
                let data_control = DataControl::try_from(buf.try_get_u16_le()?)?;
                let rtt_hint_mics = buf.try_get_i32_le()?;
                let total_genes = buf.try_get_i32_le()?;
                let stream = if mode == TransmissionMode::Stream {
                    Some(StreamInfo {
                        max_stream_length: buf.try_get_i64_le()?,
                        data_id: buf.try_get_u64_le()?,
                    })
                } else {
                    None
                };
                let payload = buf.copy_to_bytes(buf.remaining());
                Ok(Frame::FirstGene(FirstGene {
                    mode,
                    transmission_id,
                    data_control,
                    rtt_hint_mics,
                    total_genes,
                    stream,
                    payload,
                }))
            }
            FrameType::FollowingGene => {
                let transmission_id = buf.try_get_u32_le()?;
                let data_control = DataControl::try_from(buf.try_get_u16_le()?)?;
                let data_position = buf.try_get_i32_le()?;
                let payload = buf.copy_to_bytes(buf.remaining());
                Ok(Frame::FollowingGene(FollowingGene {
                    transmission_id,
                    data_control,
                    data_position,
                    payload,
                }))
            }
            FrameType::Knock => Ok(Frame::Knock {
                transmission_id: buf.try_get_u32_le()?,
            }),
            FrameType::KnockResponse => Ok(Frame::KnockResponse {
                transmission_id: buf.try_get_u32_le()?,
                max_receive_position: buf.try_get_i32_le()?,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn roundtrip(frame: Frame) {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert!(buf.len() <= MAX_FRAME_LEN);
        let mut b: &[u8] = &buf;
        let deser = Frame::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, frame);
    }

    #[test]
    fn test_close_roundtrip() {
        roundtrip(Frame::Close);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::burst_only(vec![AckEntry::Burst { transmission_id: 77 }])]
    #[case::block_no_ranges(vec![AckEntry::Block { transmission_id: 1, max_receive_position: 10, successive_received_position: 3, ranges: vec![] }])]
    #[case::block_ranges(vec![AckEntry::Block { transmission_id: 1, max_receive_position: 10, successive_received_position: 3, ranges: vec![(0, 3), (5, 8)] }])]
    #[case::mixed(vec![
        AckEntry::Burst { transmission_id: 9 },
        AckEntry::Block { transmission_id: 2, max_receive_position: 1000, successive_received_position: 1000, ranges: vec![(0, 1000)] },
        AckEntry::Burst { transmission_id: u32::MAX },
    ])]
    fn test_ack_roundtrip(#[case] entries: Vec<AckEntry>) {
        roundtrip(Frame::Ack(entries));
    }

    #[rstest]
    #[case::block(TransmissionMode::Block, None, vec![1, 2, 3])]
    #[case::block_empty(TransmissionMode::Block, None, vec![])]
    #[case::stream(TransmissionMode::Stream, Some(StreamInfo { max_stream_length: 1 << 40, data_id: 42 }), vec![5; 100])]
    #[case::stream_unlimited(TransmissionMode::Stream, Some(StreamInfo { max_stream_length: -1, data_id: 0 }), vec![])]
    fn test_first_gene_roundtrip(
        #[case] mode: TransmissionMode,
        #[case] stream: Option<StreamInfo>,
        #[case] payload: Vec<u8>,
    ) {
        roundtrip(Frame::FirstGene(FirstGene {
            mode,
            transmission_id: 0x1234_5678,
            data_control: DataControl::More,
            rtt_hint_mics: 150_000,
            total_genes: 17,
            stream,
            payload: Bytes::from(payload),
        }));
    }

    #[test]
    fn test_following_gene_roundtrip() {
        roundtrip(Frame::FollowingGene(FollowingGene {
            transmission_id: 3,
            data_control: DataControl::Complete,
            data_position: 16,
            payload: Bytes::from_static(&[9; GENE_PAYLOAD_LEN]),
        }));
    }

    #[test]
    fn test_knock_roundtrip() {
        roundtrip(Frame::Knock { transmission_id: 11 });
        roundtrip(Frame::KnockResponse {
            transmission_id: 11,
            max_receive_position: 512,
        });
    }

    #[test]
    fn test_ack_entry_serialized_len_matches() {
        let entries = [
            AckEntry::Burst { transmission_id: 1 },
            AckEntry::Block {
                transmission_id: 2,
                max_receive_position: 7,
                successive_received_position: 7,
                ranges: vec![(0, 2), (4, 7), (9, 10)],
            },
        ];
        for entry in entries {
            let mut buf = BytesMut::new();
            entry.ser(&mut buf);
            assert_eq!(buf.len(), entry.serialized_len());
        }
    }

    #[test]
    fn test_deser_rejects_unknown_frame_type() {
        let buf: &[u8] = &[0xff, 0xff];
        assert!(Frame::deser(&mut &buf[..]).is_err());
    }

    #[test]
    fn test_deser_rejects_truncated_first_gene() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(FrameType::FirstGene.into());
        buf.put_u16_le(TransmissionMode::Block.into());
        buf.put_u8(3);
        assert!(Frame::deser(&mut &buf[..]).is_err());
    }

    #[test]
    fn test_max_frame_fits_packet_budget() {
        // plaintext of MAX_FRAME_LEN pads to MAX_FRAME_LEN + 16 under PKCS7
        assert_eq!(MAX_FRAME_LEN % 16, 0);
        assert!(crate::packet_header::PacketHeader::SERIALIZED_LEN + MAX_FRAME_LEN + 16 <= 1432);
    }
}
