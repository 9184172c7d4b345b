use crate::agreement::ConnectionAgreement;
use crate::frame::{DataControl, FirstGene, FollowingGene, TransmissionMode};
use bit_set::BitSet;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// What a newly arrived gene means for the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum ReceiveEvent {
    /// duplicate or out-of-window gene; nothing to ack
    Ignored,
    /// the transmission violates the negotiated agreement; drop it entirely
    Rejected,
    /// new gene buffered; worth a block ack
    Progress,
    /// all genes arrived; the reassembled block
    BlockComplete(Bytes),
    /// freshly contiguous stream data, in order
    StreamChunks(Vec<Bytes>),
    /// the final contiguous chunks; the stream is finished
    StreamComplete(Vec<Bytes>),
}

#[derive(Debug, Clone, Copy)]
struct Meta {
    mode: TransmissionMode,
    total_genes: i32,
    data_id: u64,
}

struct ReceiveInner {
    /// populated once the first gene (serial 0) arrives
    meta: Option<Meta>,
    received: BitSet,
    payloads: BTreeMap<i32, Bytes>,
    /// highest received serial + 1
    max_receive_position: i32,
    /// length of the contiguous received prefix
    successive_received_position: i32,
    /// serial count once a gene with `Complete` arrived
    complete_total: Option<i32>,
    /// stream: next serial to hand to the dispatcher
    delivered_position: i32,
    /// when the most recent gene (including duplicates) arrived
    last_gene_mics: u64,
    completed_mics: Option<u64>,
}

/// Reassembly state for one inbound transmission. Genes may arrive in any
/// order, including following genes before the first one.
pub struct ReceiveTransmission {
    id: u32,
    created_mics: u64,
    max_block_genes: u32,
    stream_buffer_genes: u32,
    inner: Mutex<ReceiveInner>,
}

impl ReceiveTransmission {
    pub fn new(id: u32, agreement: &ConnectionAgreement, now_mics: u64) -> ReceiveTransmission {
        ReceiveTransmission {
            id,
            created_mics: now_mics,
            max_block_genes: agreement.max_block_genes(),
            stream_buffer_genes: agreement.stream_buffer_genes(),
            inner: Mutex::new(ReceiveInner {
                meta: None,
                received: BitSet::new(),
                payloads: BTreeMap::new(),
                max_receive_position: 0,
                successive_received_position: 0,
                complete_total: None,
                delivered_position: 0,
                last_gene_mics: now_mics,
                completed_mics: None,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn created_mics(&self) -> u64 {
        self.created_mics
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().unwrap().completed_mics.is_some()
    }

    pub fn completed_mics(&self) -> Option<u64> {
        self.inner.lock().unwrap().completed_mics
    }

    /// When the most recent gene for this transmission arrived; the liveness
    /// signal for sweeping abandoned reassembly state.
    pub fn last_gene_mics(&self) -> u64 {
        self.inner.lock().unwrap().last_gene_mics
    }

    /// (max receive position, successive received position) for acks and
    /// knock responses.
    pub fn ack_positions(&self) -> (i32, i32) {
        let inner = self.inner.lock().unwrap();
        (
            inner.max_receive_position,
            inner.successive_received_position,
        )
    }

    pub fn on_first_gene(&self, gene: FirstGene, now_mics: u64) -> ReceiveEvent {
        let meta = match gene.mode {
            TransmissionMode::Block => {
                if gene.total_genes < 1 || gene.total_genes as u32 > self.max_block_genes {
                    warn!(
                        "rejecting block transmission {} with {} genes",
                        self.id, gene.total_genes
                    );
                    return ReceiveEvent::Rejected;
                }
                Meta {
                    mode: TransmissionMode::Block,
                    total_genes: gene.total_genes,
                    data_id: 0,
                }
            }
            TransmissionMode::Stream => {
                let stream = match gene.stream {
                    Some(s) => s,
                    None => {
                        warn!("stream gene without stream info on transmission {}", self.id);
                        return ReceiveEvent::Rejected;
                    }
                };
                Meta {
                    mode: TransmissionMode::Stream,
                    total_genes: 0,
                    data_id: stream.data_id,
                }
            }
        };

        self.on_gene(Some(meta), 0, gene.data_control, gene.payload, now_mics)
    }

    pub fn on_following_gene(&self, gene: FollowingGene, now_mics: u64) -> ReceiveEvent {
        if gene.data_position < 1 {
            return ReceiveEvent::Ignored;
        }
        self.on_gene(
            None,
            gene.data_position,
            gene.data_control,
            gene.payload,
            now_mics,
        )
    }

    pub fn data_id(&self) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .meta
            .filter(|m| m.mode == TransmissionMode::Stream)
            .map(|m| m.data_id)
    }

    fn on_gene(
        &self,
        meta: Option<Meta>,
        serial: i32,
        data_control: DataControl,
        payload: Bytes,
        now_mics: u64,
    ) -> ReceiveEvent {
        let mut inner = self.inner.lock().unwrap();
        inner.last_gene_mics = now_mics;
        if inner.completed_mics.is_some() {
            // a resend of an already completed transmission; the caller
            // answers with a burst ack
            return ReceiveEvent::Ignored;
        }
        if let Some(meta) = meta {
            inner.meta = Some(meta);
        }
        if inner.received.contains(serial as usize) {
            return ReceiveEvent::Ignored;
        }

        // before the first gene arrives the mode is unknown; buffer only what
        // either mode could legitimately need
        if inner.meta.is_none()
            && serial as u32 >= self.max_block_genes.max(self.stream_buffer_genes)
        {
            return ReceiveEvent::Ignored;
        }

        // bound buffering for streams; blocks are bounded by total_genes,
        // which was checked against the agreement
        let is_stream = inner.meta.map(|m| m.mode) == Some(TransmissionMode::Stream);
        if is_stream && serial >= inner.delivered_position + self.stream_buffer_genes as i32 {
            debug!(
                "dropping gene {} of stream {} beyond the receive window",
                serial, self.id
            );
            return ReceiveEvent::Ignored;
        }
        if let Some(m) = inner.meta {
            if m.mode == TransmissionMode::Block && serial >= m.total_genes {
                return ReceiveEvent::Ignored;
            }
        }

        inner.received.insert(serial as usize);
        inner.payloads.insert(serial, payload);
        inner.max_receive_position = inner.max_receive_position.max(serial + 1);
        while inner
            .received
            .contains(inner.successive_received_position as usize)
        {
            inner.successive_received_position += 1;
        }
        if data_control == DataControl::Complete {
            inner.complete_total = Some(serial + 1);
        }

        match inner.meta.map(|m| m.mode) {
            Some(TransmissionMode::Block) => self.check_block_complete(&mut inner, now_mics),
            Some(TransmissionMode::Stream) => self.drain_stream(&mut inner, now_mics),
            // following genes before the first one: buffer and ack, decide
            // once the first gene shows up
            None => ReceiveEvent::Progress,
        }
    }

    fn check_block_complete(&self, inner: &mut ReceiveInner, now_mics: u64) -> ReceiveEvent {
        let total = match inner.meta {
            Some(m) => m.total_genes,
            None => return ReceiveEvent::Progress,
        };
        if inner.successive_received_position < total {
            return ReceiveEvent::Progress;
        }

        let mut assembled = BytesMut::new();
        for (_, payload) in std::mem::take(&mut inner.payloads) {
            assembled.extend_from_slice(&payload);
        }
        inner.completed_mics = Some(now_mics);
        debug!(
            "block transmission {} complete, {} bytes",
            self.id,
            assembled.len()
        );
        ReceiveEvent::BlockComplete(assembled.freeze())
    }

    fn drain_stream(&self, inner: &mut ReceiveInner, now_mics: u64) -> ReceiveEvent {
        let mut chunks = Vec::new();
        while let Some(payload) = inner.payloads.remove(&inner.delivered_position) {
            // a bare completion flag travels in an empty gene
            if !payload.is_empty() {
                chunks.push(payload);
            }
            inner.delivered_position += 1;
        }

        if inner.complete_total == Some(inner.delivered_position) {
            inner.completed_mics = Some(now_mics);
            debug!("stream transmission {} complete", self.id);
            return ReceiveEvent::StreamComplete(chunks);
        }
        if chunks.is_empty() {
            ReceiveEvent::Progress
        } else {
            ReceiveEvent::StreamChunks(chunks)
        }
    }
}
