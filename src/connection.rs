use crate::ack_buffer::{AckBuffer, AckKey};
use crate::agreement::ConnectionAgreement;
use crate::cipher::PacketCipher;
use crate::config::TransportConfig;
use crate::congestion::{CongestionControl, CubicCongestionControl, NoCongestionControl};
use crate::dispatcher::ReceiveDispatcher;
use crate::embryo::Embryo;
use crate::error::TransmitError;
use crate::frame::{AckEntry, Frame};
use crate::net_sender::NetSender;
use crate::packet_header::{PacketHeader, PacketType};
use crate::receive_transmission::{ReceiveEvent, ReceiveTransmission};
use crate::rtt::RttStats;
use crate::send_transmission::SendTransmission;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};

/// Which side of the handshake this connection object represents. Both roles
/// share all invariants; they differ in packet-type tagging and in which
/// registry the terminal tracks them in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
    Disposed,
}

struct StateTrack {
    state: ConnectionState,
    since_mics: u64,
}

/// What a send cycle left behind, steering the terminal's scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendCycleOutcome {
    /// nothing left to send, drop from the send queue
    Drained,
    /// still has live transmissions, requeue at the tail
    Pending,
    /// the congestion window is exhausted, park on the congested list
    Congested,
}

/// If a transmission sits with unacked in-flight genes and nothing new to
/// send, a knock probes the peer's receive positions after this many
/// retransmission timeouts.
const KNOCK_AFTER_RTOS: u64 = 4;

/// One peer relationship: cipher state, transmission registries, RTT
/// tracking and the per-connection part of the send scheduler.
///
/// The connection owns no socket. Inbound packets are pushed in through
/// `process_receive`, outbound genes are pulled out by the terminal's send
/// cycle.
pub struct Connection {
    role: ConnectionRole,
    connection_id: u64,
    peer_addr: SocketAddr,
    config: Arc<TransportConfig>,
    agreement: ConnectionAgreement,
    embryo: Embryo,
    cipher: PacketCipher,

    state: Mutex<StateTrack>,
    rtt: Mutex<RttStats>,

    send_transmissions: Mutex<FxHashMap<u32, Arc<SendTransmission>>>,
    /// fully acked send transmission ids, retained to swallow late acks
    acked_sends: Mutex<FxHashMap<u32, u64>>,
    receive_transmissions: Mutex<FxHashMap<u32, Arc<ReceiveTransmission>>>,

    /// ready-to-send encrypted control packets (Close, KnockResponse, Knock)
    pending_control: Mutex<Vec<Vec<u8>>>,

    /// paired same-id connection of the other role, if bidirectional
    counterpart: Mutex<Option<Weak<Connection>>>,

    congestion: Mutex<Arc<dyn CongestionControl>>,
    cubic_attached: AtomicBool,
    /// whether the terminal currently advances this connection's congestion
    /// control every send cycle; owned by the terminal
    pub(crate) congestion_listed: AtomicBool,

    /// signaled when a transmission slot frees up or the connection closes
    slot_freed: Notify,

    last_activity_mics: AtomicU64,
    last_knock_mics: AtomicU64,
    genes_sent: AtomicU64,
    genes_resent: AtomicU64,

    /// scheduler-internal dedup flag, owned by the terminal
    pub(crate) in_send_queue: AtomicBool,
}

impl Connection {
    pub fn new(
        role: ConnectionRole,
        peer_addr: SocketAddr,
        embryo: &Embryo,
        agreement: ConnectionAgreement,
        config: Arc<TransportConfig>,
        now_mics: u64,
    ) -> Connection {
        Connection {
            role,
            connection_id: embryo.connection_id,
            peer_addr,
            config,
            agreement,
            embryo: embryo.clone(),
            cipher: PacketCipher::new(embryo),
            state: Mutex::new(StateTrack {
                state: ConnectionState::Open,
                since_mics: now_mics,
            }),
            rtt: Mutex::new(RttStats::default()),
            send_transmissions: Mutex::new(FxHashMap::default()),
            acked_sends: Mutex::new(FxHashMap::default()),
            receive_transmissions: Mutex::new(FxHashMap::default()),
            pending_control: Mutex::new(Vec::new()),
            counterpart: Mutex::new(None),
            congestion: Mutex::new(Arc::new(NoCongestionControl)),
            cubic_attached: AtomicBool::new(false),
            congestion_listed: AtomicBool::new(false),
            slot_freed: Notify::new(),
            last_activity_mics: AtomicU64::new(now_mics),
            last_knock_mics: AtomicU64::new(now_mics),
            genes_sent: AtomicU64::new(0),
            genes_resent: AtomicU64::new(0),
            in_send_queue: AtomicBool::new(false),
        }
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn agreement(&self) -> &ConnectionAgreement {
        &self.agreement
    }

    pub(crate) fn embryo(&self) -> &Embryo {
        &self.embryo
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().unwrap().state
    }

    pub fn last_activity_mics(&self) -> u64 {
        self.last_activity_mics.load(Ordering::Acquire)
    }

    pub fn ack_key(&self) -> AckKey {
        AckKey {
            connection_id: self.connection_id,
            server_side: self.role == ConnectionRole::Server,
        }
    }

    /// (genes sent, genes resent) over the connection's lifetime. The resend
    /// share is the delivery-ratio signal exported to the host.
    pub fn delivery_stats(&self) -> (u64, u64) {
        (
            self.genes_sent.load(Ordering::Relaxed),
            self.genes_resent.load(Ordering::Relaxed),
        )
    }

    pub fn retransmission_timeout_mics(&self) -> u64 {
        self.rtt
            .lock()
            .unwrap()
            .retransmission_timeout_mics(self.config.ack_delay_mics)
    }

    /// Wires the non-owning back-reference to the paired connection of the
    /// other role. The terminal calls this on both objects.
    pub fn set_counterpart(&self, other: &Arc<Connection>) {
        *self.counterpart.lock().unwrap() = Some(Arc::downgrade(other));
    }

    pub fn counterpart(&self) -> Option<Arc<Connection>> {
        self.counterpart
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Encrypts `frame` into a ready-to-send packet: 16-byte header with a
    /// fresh random salt, then the CBC ciphertext whose IV is derived from
    /// that salt.
    pub fn create_packet(&self, frame: &Frame) -> Result<Vec<u8>, TransmitError> {
        self.create_packet_from_bytes(&frame.to_bytes())
    }

    /// Same as `create_packet` for an already serialized frame.
    pub fn create_packet_from_bytes(&self, frame_bytes: &[u8]) -> Result<Vec<u8>, TransmitError> {
        let salt: u32 = rand::random();
        let packet_type = match self.role {
            ConnectionRole::Client => PacketType::Protected,
            ConnectionRole::Server => PacketType::ProtectedResponse,
        };
        let header = PacketHeader::new(salt, packet_type, self.connection_id);

        let mut buf = bytes::BytesMut::with_capacity(self.config.max_packet_size);
        header.ser(&mut buf);
        let ciphertext = self.cipher.encrypt(salt, frame_bytes);
        if buf.len() + ciphertext.len() > self.config.max_packet_size {
            return Err(TransmitError::PacketSizeLimit);
        }
        buf.extend_from_slice(&ciphertext);
        Ok(buf.to_vec())
    }

    /// Decrypts, parses and dispatches one inbound packet. Malformed or
    /// undecryptable input is dropped without a trace on the wire.
    pub async fn process_receive(
        &self,
        header: &PacketHeader,
        ciphertext: &[u8],
        now_mics: u64,
        ack_buffer: &AckBuffer,
        dispatcher: &Arc<dyn ReceiveDispatcher>,
    ) {
        let plaintext = match self.cipher.decrypt(header.salt, ciphertext) {
            Ok(p) => p,
            Err(e) => {
                debug!(
                    "dropping undecryptable packet on connection {:x}: {}",
                    self.connection_id, e
                );
                return;
            }
        };
        let frame = match Frame::deser(&mut &plaintext[..]) {
            Ok(f) => f,
            Err(e) => {
                debug!(
                    "dropping malformed frame on connection {:x}: {}",
                    self.connection_id, e
                );
                return;
            }
        };

        {
            let mut state = self.state.lock().unwrap();
            match state.state {
                ConnectionState::Open => {}
                ConnectionState::Closed if self.role == ConnectionRole::Server => {
                    // the peer wants to resume before disposal
                    debug!("reopening server connection {:x}", self.connection_id);
                    state.state = ConnectionState::Open;
                    state.since_mics = now_mics;
                }
                _ => return,
            }
        }
        self.last_activity_mics.store(now_mics, Ordering::Release);

        trace!(
            "connection {:x}: received {:?} frame",
            self.connection_id,
            std::mem::discriminant(&frame)
        );
        match frame {
            Frame::Close => {
                self.close(now_mics, false);
            }
            Frame::Ack(entries) => self.process_ack(entries, now_mics),
            Frame::FirstGene(gene) => {
                self.process_gene(
                    gene.transmission_id,
                    |rt| {
                        if gene.rtt_hint_mics > 0 {
                            self.rtt.lock().unwrap().seed(gene.rtt_hint_mics as u64);
                        }
                        rt.on_first_gene(gene, now_mics)
                    },
                    0,
                    now_mics,
                    ack_buffer,
                    dispatcher,
                )
                .await;
            }
            Frame::FollowingGene(gene) => {
                let serial = gene.data_position;
                self.process_gene(
                    gene.transmission_id,
                    |rt| rt.on_following_gene(gene, now_mics),
                    serial,
                    now_mics,
                    ack_buffer,
                    dispatcher,
                )
                .await;
            }
            Frame::Knock { transmission_id } => {
                let max_receive_position = self
                    .receive_transmissions
                    .lock()
                    .unwrap()
                    .get(&transmission_id)
                    .map(|rt| rt.ack_positions().0)
                    .unwrap_or(0);
                self.queue_control_frame(&Frame::KnockResponse {
                    transmission_id,
                    max_receive_position,
                });
            }
            Frame::KnockResponse {
                transmission_id,
                max_receive_position,
            } => {
                let transmission = self
                    .send_transmissions
                    .lock()
                    .unwrap()
                    .get(&transmission_id)
                    .cloned();
                if let Some(tx) = transmission {
                    let outcome = tx.on_knock_response(max_receive_position);
                    self.apply_ack_outcome(&tx, outcome.newly_acked, None, outcome.completed, now_mics);
                }
            }
        }
    }

    async fn process_gene(
        &self,
        transmission_id: u32,
        apply: impl FnOnce(&ReceiveTransmission) -> ReceiveEvent,
        gene_serial: i32,
        now_mics: u64,
        ack_buffer: &AckBuffer,
        dispatcher: &Arc<dyn ReceiveDispatcher>,
    ) {
        let (transmission, created) = {
            let mut map = self.receive_transmissions.lock().unwrap();
            match map.get(&transmission_id) {
                Some(rt) => (rt.clone(), false),
                None => {
                    if map.len() >= self.agreement.max_transmissions as usize {
                        warn!(
                            "connection {:x}: receive transmission capacity exhausted, dropping gene",
                            self.connection_id
                        );
                        return;
                    }
                    let rt = Arc::new(ReceiveTransmission::new(
                        transmission_id,
                        &self.agreement,
                        now_mics,
                    ));
                    map.insert(transmission_id, rt.clone());
                    (rt, true)
                }
            }
        };

        let event = apply(&transmission);
        let key = self.ack_key();
        match event {
            ReceiveEvent::Ignored => {
                if transmission.is_complete() {
                    // a resend of a finished transmission; repeat the burst
                    // ack until the peer stops
                    ack_buffer.ack_burst(key, transmission_id, now_mics);
                }
            }
            ReceiveEvent::Rejected => {
                if created {
                    self.receive_transmissions
                        .lock()
                        .unwrap()
                        .remove(&transmission_id);
                }
            }
            ReceiveEvent::Progress => {
                let (max_pos, successive) = transmission.ack_positions();
                ack_buffer.ack_block(key, transmission_id, gene_serial, max_pos, successive, now_mics);
            }
            ReceiveEvent::BlockComplete(data) => {
                ack_buffer.ack_burst(key, transmission_id, now_mics);
                dispatcher.on_block(self.connection_id, data).await;
            }
            ReceiveEvent::StreamChunks(chunks) => {
                let (max_pos, successive) = transmission.ack_positions();
                ack_buffer.ack_block(key, transmission_id, gene_serial, max_pos, successive, now_mics);
                let data_id = transmission.data_id().unwrap_or(0);
                for chunk in chunks {
                    dispatcher.on_stream_data(self.connection_id, data_id, chunk).await;
                }
            }
            ReceiveEvent::StreamComplete(chunks) => {
                ack_buffer.ack_burst(key, transmission_id, now_mics);
                let data_id = transmission.data_id().unwrap_or(0);
                for chunk in chunks {
                    dispatcher.on_stream_data(self.connection_id, data_id, chunk).await;
                }
                dispatcher.on_stream_end(self.connection_id, data_id).await;
            }
        }
    }

    fn process_ack(&self, entries: Vec<AckEntry>, now_mics: u64) {
        for entry in entries {
            match entry {
                AckEntry::Burst { transmission_id } => {
                    let transmission = self
                        .send_transmissions
                        .lock()
                        .unwrap()
                        .get(&transmission_id)
                        .cloned();
                    match transmission {
                        Some(tx) => {
                            let outcome = tx.on_ack_burst();
                            self.apply_ack_outcome(&tx, outcome.newly_acked, None, true, now_mics);
                        }
                        None => {
                            // expected for late duplicates of retained sends
                            trace!(
                                "burst ack for unknown transmission {} on {:x}",
                                transmission_id,
                                self.connection_id
                            );
                        }
                    }
                }
                AckEntry::Block {
                    transmission_id,
                    ranges,
                    ..
                } => {
                    let transmission = self
                        .send_transmissions
                        .lock()
                        .unwrap()
                        .get(&transmission_id)
                        .cloned();
                    if let Some(tx) = transmission {
                        let outcome = tx.on_ack_ranges(&ranges, now_mics);
                        self.apply_ack_outcome(
                            &tx,
                            outcome.newly_acked,
                            outcome.rtt_sample_mics,
                            outcome.completed,
                            now_mics,
                        );
                    }
                }
            }
        }
    }

    fn apply_ack_outcome(
        &self,
        transmission: &Arc<SendTransmission>,
        newly_acked: u32,
        rtt_sample_mics: Option<u64>,
        completed: bool,
        now_mics: u64,
    ) {
        if let Some(sample) = rtt_sample_mics {
            self.rtt.lock().unwrap().on_sample(sample);
        }
        if newly_acked > 0 {
            self.congestion.lock().unwrap().clone().on_ack(newly_acked);
        }
        if completed {
            let removed = self
                .send_transmissions
                .lock()
                .unwrap()
                .remove(&transmission.id());
            if removed.is_some() {
                self.acked_sends
                    .lock()
                    .unwrap()
                    .insert(transmission.id(), now_mics);
                self.slot_freed.notify_waiters();
                debug!(
                    "send transmission {} on {:x} fully acknowledged",
                    transmission.id(),
                    self.connection_id
                );
            }
        }
    }

    /// Allocates a random nonzero transmission id that is unused in this
    /// connection and direction. Must be called with the send map locked by
    /// the caller's context; takes both maps briefly.
    fn allocate_transmission_id(
        &self,
        send_map: &FxHashMap<u32, Arc<SendTransmission>>,
    ) -> u32 {
        let acked = self.acked_sends.lock().unwrap();
        loop {
            let id: u32 = rand::random();
            if id != 0 && !send_map.contains_key(&id) && !acked.contains_key(&id) {
                return id;
            }
        }
    }

    fn check_open(&self) -> Result<(), TransmitError> {
        match self.state() {
            ConnectionState::Open => Ok(()),
            ConnectionState::Closed => Err(TransmitError::Closed),
            ConnectionState::Disposed => Err(TransmitError::Canceled),
        }
    }

    /// Creates a block send transmission, failing fast on capacity. The
    /// returned receiver resolves when the peer acknowledged everything.
    pub fn create_block_send(
        &self,
        data: bytes::Bytes,
        now_mics: u64,
    ) -> Result<
        (
            Arc<SendTransmission>,
            oneshot::Receiver<Result<(), TransmitError>>,
        ),
        TransmitError,
    > {
        self.check_open()?;
        let mut map = self.send_transmissions.lock().unwrap();
        if map.len() >= self.agreement.max_transmissions as usize {
            return Err(TransmitError::NoTransmission);
        }
        let id = self.allocate_transmission_id(&map);
        let (transmission, receiver) =
            SendTransmission::new_block(id, data, &self.agreement, now_mics)?;
        let transmission = Arc::new(transmission);
        map.insert(id, transmission.clone());
        Ok((transmission, receiver))
    }

    /// Cancels a send transmission that is no longer wanted, e.g. because
    /// the waiting caller timed out. Frees its slot.
    pub fn remove_send_transmission(&self, transmission_id: u32, error: TransmitError) {
        let removed = self
            .send_transmissions
            .lock()
            .unwrap()
            .remove(&transmission_id);
        if let Some(tx) = removed {
            tx.dispose(error);
            self.slot_freed.notify_waiters();
        }
    }

    pub fn has_active_send_transmissions(&self) -> bool {
        self.send_transmissions
            .lock()
            .unwrap()
            .values()
            .any(|tx| tx.is_active())
    }

    /// Creates a stream send transmission, failing fast on capacity.
    pub fn create_stream_send(
        &self,
        max_length: i64,
        data_id: u64,
        now_mics: u64,
    ) -> Result<
        (
            Arc<SendTransmission>,
            oneshot::Receiver<Result<(), TransmitError>>,
        ),
        TransmitError,
    > {
        self.check_open()?;
        let mut map = self.send_transmissions.lock().unwrap();
        if map.len() >= self.agreement.max_transmissions as usize {
            return Err(TransmitError::NoTransmission);
        }
        let id = self.allocate_transmission_id(&map);
        let (transmission, receiver) =
            SendTransmission::new_stream(id, max_length, data_id, &self.agreement, now_mics)?;
        let transmission = Arc::new(transmission);
        map.insert(id, transmission.clone());
        Ok((transmission, receiver))
    }

    /// Waits until a transmission slot frees up or the connection leaves the
    /// `Open` state. The caller rechecks capacity after each wakeup.
    pub async fn wait_for_slot(&self) {
        self.slot_freed.notified().await;
    }

    /// Transitions `Open -> Closed`. Idempotent; all pending send
    /// transmissions resolve with `Closed`. Propagates to a bidirectional
    /// counterpart exactly once, breaking the back-reference before
    /// recursing.
    pub fn close(&self, now_mics: u64, send_close_frame: bool) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.state != ConnectionState::Open {
                return false;
            }
            state.state = ConnectionState::Closed;
            state.since_mics = now_mics;
        }
        debug!("closing connection {:x}", self.connection_id);

        if send_close_frame {
            self.queue_control_frame(&Frame::Close);
        }
        self.dispose_transmissions(TransmitError::Closed);
        self.slot_freed.notify_waiters();

        let counterpart = self.counterpart.lock().unwrap().take();
        if let Some(other) = counterpart.as_ref().and_then(Weak::upgrade) {
            other.close(now_mics, send_close_frame);
        }
        true
    }

    /// Transitions `Closed -> Disposed` (or straight from `Open` on terminal
    /// shutdown) and releases everything. Idempotent.
    pub fn dispose(&self, now_mics: u64) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.state == ConnectionState::Disposed {
                return false;
            }
            state.state = ConnectionState::Disposed;
            state.since_mics = now_mics;
        }
        debug!("disposing connection {:x}", self.connection_id);

        self.dispose_transmissions(TransmitError::Canceled);
        self.receive_transmissions.lock().unwrap().clear();
        self.acked_sends.lock().unwrap().clear();
        self.pending_control.lock().unwrap().clear();
        *self.counterpart.lock().unwrap() = None;
        self.slot_freed.notify_waiters();
        true
    }

    /// How long the connection has been in its current state.
    pub fn state_age_mics(&self, now_mics: u64) -> u64 {
        now_mics.saturating_sub(self.state.lock().unwrap().since_mics)
    }

    fn dispose_transmissions(&self, error: TransmitError) {
        let transmissions: Vec<_> = {
            let mut map = self.send_transmissions.lock().unwrap();
            map.drain().map(|(_, tx)| tx).collect()
        };
        for tx in transmissions {
            tx.dispose(error);
        }
    }

    /// Encrypts `frame` and queues it for the next send cycle. Control
    /// frames bypass congestion control.
    pub fn queue_control_frame(&self, frame: &Frame) {
        match self.create_packet(frame) {
            Ok(packet) => self.pending_control.lock().unwrap().push(packet),
            Err(e) => warn!(
                "dropping control frame on connection {:x}: {}",
                self.connection_id, e
            ),
        }
    }

    pub fn has_pending_control(&self) -> bool {
        !self.pending_control.lock().unwrap().is_empty()
    }

    pub(crate) fn congestion_control(&self) -> Arc<dyn CongestionControl> {
        self.congestion.lock().unwrap().clone()
    }

    pub fn is_congested(&self) -> bool {
        self.congestion_control().is_congested()
    }

    /// Attaches the real congestion algorithm lazily on the first gene send.
    /// Idempotent; the instance stays with the connection for its lifetime.
    pub fn ensure_congestion_control(&self) {
        if self.cubic_attached.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.congestion.lock().unwrap() = Arc::new(CubicCongestionControl::new());
    }

    /// One send cycle for this connection: flushes queued control packets,
    /// then drains due genes subject to congestion admission.
    pub async fn send_due(
        self: &Arc<Self>,
        net_sender: &Arc<dyn NetSender>,
        now_mics: u64,
    ) -> SendCycleOutcome {
        let control: Vec<Vec<u8>> = std::mem::take(&mut *self.pending_control.lock().unwrap());
        for packet in control {
            net_sender.do_send_packet(self.peer_addr, &packet).await;
        }

        if self.state() != ConnectionState::Open {
            return SendCycleOutcome::Drained;
        }

        let (rto_mics, rtt_hint_mics) = {
            let rtt = self.rtt.lock().unwrap();
            (
                rtt.retransmission_timeout_mics(self.config.ack_delay_mics),
                rtt.srtt_mics().min(i32::MAX as u64) as i32,
            )
        };
        let transmissions: Vec<Arc<SendTransmission>> = self
            .send_transmissions
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        if transmissions.is_empty() {
            return SendCycleOutcome::Drained;
        }

        let congestion = self.congestion_control();
        loop {
            let mut sent_this_round = false;
            for tx in &transmissions {
                if congestion.is_congested() {
                    return SendCycleOutcome::Congested;
                }
                let Some(gene) = tx.pop_sendable(now_mics, rto_mics, rtt_hint_mics) else {
                    continue;
                };
                let packet = match self.create_packet(&gene.frame) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(
                            "cannot packetize gene on connection {:x}: {}",
                            self.connection_id, e
                        );
                        continue;
                    }
                };
                net_sender.do_send_packet(self.peer_addr, &packet).await;
                congestion.on_send(1);
                self.genes_sent.fetch_add(1, Ordering::Relaxed);
                if gene.is_resend {
                    congestion.on_resend(1);
                    self.genes_resent.fetch_add(1, Ordering::Relaxed);
                }
                sent_this_round = true;
            }
            if !sent_this_round {
                break;
            }
        }

        // nothing due right now; probe stalled transmissions with a knock
        let stalled = transmissions.iter().any(|tx| tx.has_in_flight());
        if stalled {
            let last_knock = self.last_knock_mics.load(Ordering::Acquire);
            if now_mics.saturating_sub(last_knock) >= KNOCK_AFTER_RTOS * rto_mics {
                self.last_knock_mics.store(now_mics, Ordering::Release);
                for tx in &transmissions {
                    if tx.has_in_flight() {
                        trace!(
                            "knocking for transmission {} on {:x}",
                            tx.id(),
                            self.connection_id
                        );
                        let frame = Frame::Knock {
                            transmission_id: tx.id(),
                        };
                        if let Ok(packet) = self.create_packet(&frame) {
                            net_sender.do_send_packet(self.peer_addr, &packet).await;
                        }
                    }
                }
            }
        }

        if transmissions.iter().any(|tx| tx.is_active()) {
            SendCycleOutcome::Pending
        } else {
            SendCycleOutcome::Drained
        }
    }

    /// True if the next send cycle has work: due genes, stalled in-flight
    /// genes, or queued control packets.
    pub fn has_send_work(&self, now_mics: u64) -> bool {
        if self.has_pending_control() {
            return true;
        }
        if self.state() != ConnectionState::Open {
            return false;
        }
        let rto_mics = self.retransmission_timeout_mics();
        self.send_transmissions
            .lock()
            .unwrap()
            .values()
            .any(|tx| tx.is_active() && (tx.has_sendable(now_mics, rto_mics) || tx.has_in_flight()))
    }

    /// Drops retained acked sends and completed receive transmissions whose
    /// retention window elapsed.
    pub fn sweep_retained(&self, now_mics: u64) {
        self.acked_sends
            .lock()
            .unwrap()
            .retain(|_, acked_at| now_mics.saturating_sub(*acked_at) < self.config.acked_retention_mics);
        self.receive_transmissions.lock().unwrap().retain(|_, rt| {
            match rt.completed_mics() {
                Some(at) => now_mics.saturating_sub(at) < self.config.disposed_retention_mics,
                // incomplete: the sender resends every RTO while it is alive,
                // so prolonged silence means the transmission is abandoned
                None => {
                    now_mics.saturating_sub(rt.last_gene_mics())
                        < self.config.receive_stall_timeout_mics
                }
            }
        });
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("connection_id", &self.connection_id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
