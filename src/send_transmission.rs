use crate::agreement::ConnectionAgreement;
use crate::error::TransmitError;
use crate::frame::{
    DataControl, FirstGene, FollowingGene, Frame, StreamInfo, TransmissionMode, GENE_PAYLOAD_LEN,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Active,
    Completed,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Block,
    Stream { max_length: i64, data_id: u64 },
}

struct GeneSlot {
    payload: Bytes,
    last_sent_mics: Option<u64>,
    resend_count: u32,
    acked: bool,
}

impl GeneSlot {
    fn new(payload: Bytes) -> GeneSlot {
        GeneSlot {
            payload,
            last_sent_mics: None,
            resend_count: 0,
            acked: false,
        }
    }
}

struct SendInner {
    mode: SendMode,
    state: SendState,
    /// live gene window; `genes[0]` has serial `window_base`
    genes: VecDeque<GeneSlot>,
    window_base: i32,
    /// next serial that has never been sent
    next_unsent: i32,
    /// block: fixed total; stream: gene count produced so far
    produced_genes: i32,
    /// all serials below this are acknowledged
    acked_contiguous: i32,
    total_genes_wire: i32,
    stream_window_genes: usize,
    stream_written: i64,
    stream_closed: bool,
    send_total: u64,
    resend_total: u64,
    completion: Option<oneshot::Sender<Result<(), TransmitError>>>,
}

/// A gene ready to go on the wire, already framed.
pub struct GeneToSend {
    pub frame: Frame,
    pub is_resend: bool,
}

/// Outcome of applying an ack to a send transmission.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct AckOutcome {
    pub newly_acked: u32,
    /// RTT sample from a first-transmission gene (Karn's rule: none from
    /// resent genes)
    pub rtt_sample_mics: Option<u64>,
    pub completed: bool,
}

/// One logical outbound message (block) or long-running transfer (stream),
/// split into genes that are individually sent, acknowledged and resent.
pub struct SendTransmission {
    id: u32,
    created_mics: u64,
    inner: Mutex<SendInner>,
    /// signaled when the stream window gains space or the transmission ends
    space_freed: Notify,
}

impl SendTransmission {
    /// Splits `data` into genes. Fails with `BlockSizeLimit` before anything
    /// is sent if the block exceeds the negotiated maximum.
    pub fn new_block(
        id: u32,
        data: Bytes,
        agreement: &ConnectionAgreement,
        now_mics: u64,
    ) -> Result<(SendTransmission, oneshot::Receiver<Result<(), TransmitError>>), TransmitError>
    {
        if data.len() > agreement.max_block_size as usize {
            return Err(TransmitError::BlockSizeLimit);
        }

        let total_genes = data.len().div_ceil(GENE_PAYLOAD_LEN).max(1) as i32;
        let mut genes = VecDeque::with_capacity(total_genes as usize);
        for serial in 0..total_genes as usize {
            let start = serial * GENE_PAYLOAD_LEN;
            let end = (start + GENE_PAYLOAD_LEN).min(data.len());
            genes.push_back(GeneSlot::new(data.slice(start..end)));
        }

        let (completion, receiver) = oneshot::channel();
        Ok((
            SendTransmission {
                id,
                created_mics: now_mics,
                inner: Mutex::new(SendInner {
                    mode: SendMode::Block,
                    state: SendState::Active,
                    genes,
                    window_base: 0,
                    next_unsent: 0,
                    produced_genes: total_genes,
                    acked_contiguous: 0,
                    total_genes_wire: total_genes,
                    stream_window_genes: 0,
                    stream_written: 0,
                    stream_closed: true,
                    send_total: 0,
                    resend_total: 0,
                    completion: Some(completion),
                }),
                space_freed: Notify::new(),
            },
            receiver,
        ))
    }

    /// Opens a stream transmission. `max_length < 0` requests an unlimited
    /// stream; fails with `StreamLengthLimit` if the agreement does not cover
    /// the request.
    pub fn new_stream(
        id: u32,
        max_length: i64,
        data_id: u64,
        agreement: &ConnectionAgreement,
        now_mics: u64,
    ) -> Result<(SendTransmission, oneshot::Receiver<Result<(), TransmitError>>), TransmitError>
    {
        if !agreement.accepts_stream_length(max_length) {
            return Err(TransmitError::StreamLengthLimit);
        }

        let (completion, receiver) = oneshot::channel();
        Ok((
            SendTransmission {
                id,
                created_mics: now_mics,
                inner: Mutex::new(SendInner {
                    mode: SendMode::Stream {
                        max_length,
                        data_id,
                    },
                    state: SendState::Active,
                    genes: VecDeque::new(),
                    window_base: 0,
                    next_unsent: 0,
                    produced_genes: 0,
                    acked_contiguous: 0,
                    total_genes_wire: 0,
                    stream_window_genes: agreement.stream_buffer_genes() as usize,
                    stream_written: 0,
                    stream_closed: false,
                    send_total: 0,
                    resend_total: 0,
                    completion: Some(completion),
                }),
                space_freed: Notify::new(),
            },
            receiver,
        ))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn created_mics(&self) -> u64 {
        self.created_mics
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().state == SendState::Active
    }

    /// (genes sent, genes resent) - resends are included in the sent count.
    pub fn delivery_stats(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.send_total, inner.resend_total)
    }

    /// Appends data to a stream, waiting for window space. Memory stays
    /// bounded to the window regardless of total stream length.
    pub async fn feed(&self, mut data: &[u8]) -> Result<(), TransmitError> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                match inner.state {
                    SendState::Active => {}
                    SendState::Completed => return Err(TransmitError::Closed),
                    SendState::Disposed => return Err(TransmitError::Canceled),
                }
                let max_length = match inner.mode {
                    SendMode::Stream { max_length, .. } => max_length,
                    SendMode::Block => return Err(TransmitError::SerializationError),
                };
                if inner.stream_closed {
                    return Err(TransmitError::Closed);
                }
                if max_length >= 0 && inner.stream_written + data.len() as i64 > max_length {
                    return Err(TransmitError::StreamLengthLimit);
                }

                while !data.is_empty() && inner.genes.len() < inner.stream_window_genes {
                    let take = data.len().min(GENE_PAYLOAD_LEN);
                    inner
                        .genes
                        .push_back(GeneSlot::new(Bytes::copy_from_slice(&data[..take])));
                    inner.produced_genes += 1;
                    inner.stream_written += take as i64;
                    data = &data[take..];
                }

                if data.is_empty() {
                    return Ok(());
                }
                trace!("stream window full, waiting for ack progress");
            }
            self.space_freed.notified().await;
        }
    }

    /// Marks the stream as complete; the transmission finishes once all
    /// produced genes are acknowledged.
    pub fn close_stream(&self) -> Result<(), TransmitError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            SendState::Active => {}
            SendState::Completed => return Err(TransmitError::Closed),
            SendState::Disposed => return Err(TransmitError::Canceled),
        }
        inner.stream_closed = true;
        if inner.produced_genes == 0 {
            // nothing was ever produced, so the peer has no counterpart that
            // would wait for a completion flag
            Self::complete(&mut inner);
            return Ok(());
        }

        // the completion flag travels on the last gene. If the last produced
        // gene already went out flagged as partial, carry the flag on a fresh
        // empty gene: a resend of the same serial would be dropped as a
        // duplicate by the receiver, flag and all
        if inner.next_unsent == inner.window_base + inner.genes.len() as i32 {
            inner.genes.push_back(GeneSlot::new(Bytes::new()));
            inner.produced_genes += 1;
        }
        Ok(())
    }

    /// The next gene that should go on the wire: a resend whose timeout
    /// elapsed takes priority, then the next never-sent gene. Returns `None`
    /// while nothing is due.
    pub fn pop_sendable(
        &self,
        now_mics: u64,
        rto_mics: u64,
        rtt_hint_mics: i32,
    ) -> Option<GeneToSend> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SendState::Active {
            return None;
        }

        // resends first - oldest data is most likely to block the receiver
        let window_base = inner.window_base;
        let resend_pos = inner.genes.iter().position(|g| {
            !g.acked
                && g.last_sent_mics
                    .is_some_and(|sent| now_mics.saturating_sub(sent) >= rto_mics)
        });
        if let Some(pos) = resend_pos {
            let serial = window_base + pos as i32;
            let slot = &mut inner.genes[pos];
            slot.last_sent_mics = Some(now_mics);
            slot.resend_count += 1;
            let payload = slot.payload.clone();
            inner.send_total += 1;
            inner.resend_total += 1;
            debug!("resending gene {} of transmission {}", serial, self.id);
            return Some(GeneToSend {
                frame: Self::frame_for(&inner, self.id, serial, payload, rtt_hint_mics),
                is_resend: true,
            });
        }

        let produced_end = inner.window_base + inner.genes.len() as i32;
        if inner.next_unsent < produced_end {
            let serial = inner.next_unsent;
            let pos = (serial - inner.window_base) as usize;
            let slot = &mut inner.genes[pos];
            slot.last_sent_mics = Some(now_mics);
            let payload = slot.payload.clone();
            inner.next_unsent += 1;
            inner.send_total += 1;
            return Some(GeneToSend {
                frame: Self::frame_for(&inner, self.id, serial, payload, rtt_hint_mics),
                is_resend: false,
            });
        }

        None
    }

    fn frame_for(
        inner: &SendInner,
        transmission_id: u32,
        serial: i32,
        payload: Bytes,
        rtt_hint_mics: i32,
    ) -> Frame {
        let is_last = match inner.mode {
            SendMode::Block => serial + 1 == inner.produced_genes,
            SendMode::Stream { .. } => inner.stream_closed && serial + 1 == inner.produced_genes,
        };
        let data_control = if is_last {
            DataControl::Complete
        } else {
            DataControl::More
        };

        if serial == 0 {
            let (mode, stream, total_genes) = match inner.mode {
                SendMode::Block => (TransmissionMode::Block, None, inner.total_genes_wire),
                SendMode::Stream {
                    max_length,
                    data_id,
                } => (
                    TransmissionMode::Stream,
                    Some(StreamInfo {
                        max_stream_length: max_length,
                        data_id,
                    }),
                    0,
                ),
            };
            Frame::FirstGene(FirstGene {
                mode,
                transmission_id,
                data_control,
                rtt_hint_mics,
                total_genes,
                stream,
                payload,
            })
        } else {
            Frame::FollowingGene(FollowingGene {
                transmission_id,
                data_control,
                data_position: serial,
                payload,
            })
        }
    }

    /// True if there is anything to put on the wire right now or at `now`.
    pub fn has_sendable(&self, now_mics: u64, rto_mics: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.state != SendState::Active {
            return false;
        }
        if inner.next_unsent < inner.window_base + inner.genes.len() as i32 {
            return true;
        }
        inner.genes.iter().any(|g| {
            !g.acked
                && g.last_sent_mics
                    .is_some_and(|sent| now_mics.saturating_sub(sent) >= rto_mics)
        })
    }

    /// True if any sent gene is still unacknowledged.
    pub fn has_in_flight(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .genes
            .iter()
            .take((inner.next_unsent - inner.window_base).max(0) as usize)
            .any(|g| !g.acked && g.last_sent_mics.is_some())
    }

    /// Applies half-open acked ranges of gene serials.
    pub fn on_ack_ranges(&self, ranges: &[(i32, i32)], now_mics: u64) -> AckOutcome {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SendState::Active {
            return AckOutcome::default();
        }

        let mut outcome = AckOutcome::default();
        for &(start, end) in ranges {
            for serial in start..end {
                let pos = serial - inner.window_base;
                if pos < 0 || pos as usize >= inner.genes.len() {
                    continue;
                }
                let slot = &mut inner.genes[pos as usize];
                if slot.acked {
                    continue;
                }
                slot.acked = true;
                outcome.newly_acked += 1;
                if outcome.rtt_sample_mics.is_none() && slot.resend_count == 0 {
                    if let Some(sent) = slot.last_sent_mics {
                        outcome.rtt_sample_mics = Some(now_mics.saturating_sub(sent));
                    }
                }
            }
        }

        if outcome.newly_acked > 0 {
            Self::advance_window(&mut inner);
            outcome.completed = Self::maybe_complete(&mut inner);
            self.space_freed.notify_waiters();
        }
        outcome
    }

    /// The peer reported the whole transmission received.
    pub fn on_ack_burst(&self) -> AckOutcome {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SendState::Active {
            return AckOutcome::default();
        }

        let newly_acked = inner.genes.iter().filter(|g| !g.acked).count() as u32;
        inner.acked_contiguous = inner.produced_genes;
        inner.window_base = inner.produced_genes;
        inner.next_unsent = inner.produced_genes;
        inner.genes.clear();
        Self::complete(&mut inner);
        self.space_freed.notify_waiters();

        AckOutcome {
            newly_acked,
            rtt_sample_mics: None,
            completed: true,
        }
    }

    /// A KnockResponse told us everything below `max_receive_position`
    /// arrived.
    pub fn on_knock_response(&self, max_receive_position: i32) -> AckOutcome {
        if max_receive_position <= 0 {
            return AckOutcome::default();
        }
        self.on_ack_ranges(&[(0, max_receive_position)], 0)
    }

    /// Resolves a pending caller with `error` and stops all sending.
    pub fn dispose(&self, error: TransmitError) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != SendState::Active {
            return;
        }
        inner.state = SendState::Disposed;
        inner.genes.clear();
        if let Some(completion) = inner.completion.take() {
            // the receiver may be gone, which is fine
            completion.send(Err(error)).ok();
        }
        self.space_freed.notify_waiters();
    }

    fn advance_window(inner: &mut SendInner) {
        while inner.genes.front().is_some_and(|g| g.acked) {
            inner.genes.pop_front();
            inner.window_base += 1;
        }
        inner.acked_contiguous = inner.acked_contiguous.max(inner.window_base);
        // a peer may ack genes it never received; never send from before the
        // window
        inner.next_unsent = inner.next_unsent.max(inner.window_base);
    }

    fn maybe_complete(inner: &mut SendInner) -> bool {
        let done = match inner.mode {
            SendMode::Block => inner.acked_contiguous >= inner.produced_genes,
            SendMode::Stream { .. } => {
                inner.stream_closed && inner.acked_contiguous >= inner.produced_genes
            }
        };
        if done {
            Self::complete(inner);
        }
        done
    }

    fn complete(inner: &mut SendInner) {
        if inner.state == SendState::Active {
            inner.state = SendState::Completed;
            if let Some(completion) = inner.completion.take() {
                completion.send(Ok(())).ok();
            }
        }
    }
}
