use crate::ack_buffer::{AckBuffer, AckKey};
use crate::config::TransportConfig;
use crate::congestion::CongestionControl;
use crate::connection::{Connection, ConnectionRole, ConnectionState, SendCycleOutcome};
use crate::dispatcher::ReceiveDispatcher;
use crate::embryo::Embryo;
use crate::error::{ConnectError, TransmitError};
use crate::handshake::Handshaker;
use crate::net_sender::NetSender;
use crate::packet_header::PacketHeader;
use crate::send_transmission::SendTransmission;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// How [`ConnectionTerminal::connect`] treats an existing open connection to
/// the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// reuse an open connection, handshake a new one otherwise
    ReuseIfOpen,
    /// reuse an open connection, fail otherwise
    ReuseOnly,
    /// always handshake a fresh connection
    NoReuse,
}

struct SendQueue {
    /// round-robin queue of connections with send work
    fair: VecDeque<Arc<Connection>>,
    /// connections parked until their congestion window opens again,
    /// in parking order so nothing starves once resolved
    congested: Vec<Arc<Connection>>,
}

/// Single authority for connection lifecycle and the fairness- and
/// congestion-aware send scheduler.
///
/// The terminal owns no socket and no timer. The host wires it up by
/// forwarding every received datagram to [`process_receive`], calling
/// [`process_send`] on a short periodic tick (order of 1ms), and
/// [`clean`] on a coarser one.
///
/// [`process_receive`]: ConnectionTerminal::process_receive
/// [`process_send`]: ConnectionTerminal::process_send
/// [`clean`]: ConnectionTerminal::clean
pub struct ConnectionTerminal {
    config: Arc<TransportConfig>,
    epoch: tokio::time::Instant,
    net_sender: Arc<dyn NetSender>,
    handshaker: Arc<dyn Handshaker>,
    dispatcher: Arc<dyn ReceiveDispatcher>,

    client_connections: Mutex<FxHashMap<u64, Arc<Connection>>>,
    server_connections: Mutex<FxHashMap<u64, Arc<Connection>>>,
    /// connect() reuse index: peer address -> client connection id
    by_peer: Mutex<FxHashMap<SocketAddr, u64>>,

    send_queue: Mutex<SendQueue>,
    /// connections whose congestion control is advanced every send cycle
    congestion_list: Mutex<Vec<Arc<Connection>>>,
    ack_buffer: AckBuffer,
    last_send_cycle_mics: AtomicU64,
}

impl ConnectionTerminal {
    pub fn new(
        config: TransportConfig,
        net_sender: Arc<dyn NetSender>,
        handshaker: Arc<dyn Handshaker>,
        dispatcher: Arc<dyn ReceiveDispatcher>,
    ) -> anyhow::Result<ConnectionTerminal> {
        config.validate()?;
        let ack_delay_mics = config.ack_delay_mics;
        Ok(ConnectionTerminal {
            config: Arc::new(config),
            epoch: tokio::time::Instant::now(),
            net_sender,
            handshaker,
            dispatcher,
            client_connections: Mutex::new(FxHashMap::default()),
            server_connections: Mutex::new(FxHashMap::default()),
            by_peer: Mutex::new(FxHashMap::default()),
            send_queue: Mutex::new(SendQueue {
                fair: VecDeque::new(),
                congested: Vec::new(),
            }),
            congestion_list: Mutex::new(Vec::new()),
            ack_buffer: AckBuffer::new(ack_delay_mics),
            last_send_cycle_mics: AtomicU64::new(0),
        })
    }

    /// Microseconds since the terminal was created. All protocol timestamps
    /// are relative to this epoch.
    pub fn now_mics(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// (client connections, server connections) currently tracked.
    pub fn connection_count(&self) -> (usize, usize) {
        (
            self.client_connections.lock().unwrap().len(),
            self.server_connections.lock().unwrap().len(),
        )
    }

    fn client_by_peer(&self, peer: SocketAddr) -> Option<Arc<Connection>> {
        let id = *self.by_peer.lock().unwrap().get(&peer)?;
        self.client_connections.lock().unwrap().get(&id).cloned()
    }

    /// Establishes (or reuses) a client connection to `peer`, running the
    /// externally provided handshake.
    pub async fn connect(
        &self,
        peer: SocketAddr,
        mode: ConnectMode,
    ) -> Result<Arc<Connection>, ConnectError> {
        if mode != ConnectMode::NoReuse {
            if let Some(existing) = self.client_by_peer(peer) {
                if existing.state() == ConnectionState::Open {
                    trace!("reusing open connection {:x} to {}", existing.connection_id(), peer);
                    return Ok(existing);
                }
            }
            if mode == ConnectMode::ReuseOnly {
                return Err(ConnectError::NoEndpoint);
            }
        }

        let outcome = match tokio::time::timeout(
            self.config.handshake_timeout,
            self.handshaker.handshake_as_client(peer),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                debug!("handshake with {} rejected: {}", peer, e);
                return Err(ConnectError::HandshakeRejected);
            }
            Err(_) => return Err(ConnectError::HandshakeTimeout),
        };

        let embryo = Embryo::derive(&outcome.material);
        let agreement = self.config.default_agreement.accept_all(&outcome.agreement);
        let connection = Arc::new(Connection::new(
            ConnectionRole::Client,
            peer,
            &embryo,
            agreement,
            self.config.clone(),
            self.now_mics(),
        ));
        info!("connected to {} as {:x}", peer, connection.connection_id());

        self.client_connections
            .lock()
            .unwrap()
            .insert(connection.connection_id(), connection.clone());
        self.by_peer
            .lock()
            .unwrap()
            .insert(peer, connection.connection_id());
        Ok(connection)
    }

    /// Mirror path on accept: the host completed a handshake with a client
    /// and hands over the outcome. Both sides derive the same embryo from the
    /// same material, so the connection ids match. Idempotent per embryo.
    pub fn prepare_server_side(
        &self,
        peer: SocketAddr,
        outcome: crate::handshake::HandshakeOutcome,
    ) -> Arc<Connection> {
        let embryo = Embryo::derive(&outcome.material);
        let mut registry = self.server_connections.lock().unwrap();
        if let Some(existing) = registry.get(&embryo.connection_id) {
            if existing.state() != ConnectionState::Disposed {
                return existing.clone();
            }
        }

        let agreement = self.config.default_agreement.accept_all(&outcome.agreement);
        let connection = Arc::new(Connection::new(
            ConnectionRole::Server,
            peer,
            &embryo,
            agreement,
            self.config.clone(),
            self.now_mics(),
        ));
        info!(
            "accepted connection {:x} from {}",
            connection.connection_id(),
            peer
        );
        registry.insert(connection.connection_id(), connection.clone());
        connection
    }

    /// Idempotently creates (or returns) the same-id counterpart connection
    /// of the other role and wires the back-references both ways. This is
    /// what lets a server initiate transmissions towards a client.
    pub fn prepare_bidirectional_connection(
        &self,
        connection: &Arc<Connection>,
    ) -> Result<Arc<Connection>, ConnectError> {
        if !connection.agreement().allow_bidirectional {
            return Err(ConnectError::BidirectionalNotAllowed);
        }
        if let Some(existing) = connection.counterpart() {
            return Ok(existing);
        }

        let counterpart_role = match connection.role() {
            ConnectionRole::Client => ConnectionRole::Server,
            ConnectionRole::Server => ConnectionRole::Client,
        };
        let registry = match counterpart_role {
            ConnectionRole::Client => &self.client_connections,
            ConnectionRole::Server => &self.server_connections,
        };

        let mut registry = registry.lock().unwrap();
        let counterpart = match registry.get(&connection.connection_id()) {
            Some(existing) => existing.clone(),
            None => {
                let created = Arc::new(Connection::new(
                    counterpart_role,
                    connection.peer_addr(),
                    connection.embryo(),
                    connection.agreement().clone(),
                    self.config.clone(),
                    self.now_mics(),
                ));
                registry.insert(created.connection_id(), created.clone());
                debug!(
                    "created {:?} counterpart for connection {:x}",
                    counterpart_role,
                    created.connection_id()
                );
                created
            }
        };
        connection.set_counterpart(&counterpart);
        counterpart.set_counterpart(connection);
        Ok(counterpart)
    }

    /// Adds a connection to the fair send queue unless it is already queued.
    pub fn enqueue_for_send(&self, connection: &Arc<Connection>) {
        if !connection.in_send_queue.swap(true, Ordering::AcqRel) {
            self.send_queue
                .lock()
                .unwrap()
                .fair
                .push_back(connection.clone());
        }
    }

    /// Demultiplexes one inbound datagram to its connection. Unknown ids,
    /// foreign engagement tags and endpoint mismatches are dropped without
    /// any reply, so the terminal cannot be used as an amplifier or oracle.
    pub async fn process_receive(&self, from: SocketAddr, datagram: &[u8]) {
        let now_mics = self.now_mics();
        let mut buf = datagram;
        let header = match PacketHeader::deser(&mut buf) {
            Ok(h) => h,
            Err(e) => {
                trace!("dropping datagram with unparseable header from {}: {}", from, e);
                return;
            }
        };
        if header.engagement != PacketHeader::ENGAGEMENT_V1 {
            trace!("dropping datagram with engagement {} from {}", header.engagement, from);
            return;
        }

        let registry = if header.packet_type.routes_to_server() {
            &self.server_connections
        } else {
            &self.client_connections
        };
        let connection = registry.lock().unwrap().get(&header.connection_id).cloned();
        let Some(connection) = connection else {
            trace!("dropping datagram for unknown connection {:x}", header.connection_id);
            return;
        };
        if connection.peer_addr() != from {
            debug!(
                "dropping datagram for connection {:x}: source {} does not match {}",
                header.connection_id,
                from,
                connection.peer_addr()
            );
            return;
        }

        connection
            .process_receive(&header, buf, now_mics, &self.ack_buffer, &self.dispatcher)
            .await;

        if connection.has_pending_control() || connection.has_active_send_transmissions() {
            self.enqueue_for_send(&connection);
        }
    }

    /// One outbound tick: advances congestion controls, un-parks resolved
    /// connections, round-robins the fair send queue, and flushes due acks.
    pub async fn process_send(&self) {
        let now_mics = self.now_mics();
        let elapsed_mics =
            now_mics.saturating_sub(self.last_send_cycle_mics.swap(now_mics, Ordering::AcqRel));

        self.congestion_list.lock().unwrap().retain(|connection| {
            if connection.congestion_control().process(elapsed_mics) {
                true
            } else {
                // re-registered via `congestion_listed` when the connection
                // is next scheduled with active sends
                connection.congestion_listed.store(false, Ordering::Release);
                false
            }
        });

        {
            let mut queue = self.send_queue.lock().unwrap();
            let queue = &mut *queue;
            let mut still_congested = Vec::new();
            for connection in queue.congested.drain(..) {
                if connection.is_congested() {
                    still_congested.push(connection);
                } else {
                    queue.fair.push_back(connection);
                }
            }
            queue.congested = still_congested;
        }

        let rounds = self.send_queue.lock().unwrap().fair.len();
        for _ in 0..rounds {
            let connection = match self.send_queue.lock().unwrap().fair.pop_front() {
                Some(c) => c,
                None => break,
            };

            if connection.has_active_send_transmissions() {
                connection.ensure_congestion_control();
                if !connection.congestion_listed.swap(true, Ordering::AcqRel) {
                    self.congestion_list.lock().unwrap().push(connection.clone());
                }
            }

            match connection.send_due(&self.net_sender, now_mics).await {
                SendCycleOutcome::Pending => {
                    self.send_queue.lock().unwrap().fair.push_back(connection);
                }
                SendCycleOutcome::Congested => {
                    self.send_queue.lock().unwrap().congested.push(connection);
                }
                SendCycleOutcome::Drained => {
                    connection.in_send_queue.store(false, Ordering::Release);
                    // an enqueue that raced with this cycle was swallowed by
                    // the dedup flag; pick its work up now
                    if connection.has_send_work(now_mics) {
                        self.enqueue_for_send(&connection);
                    }
                }
            }
        }

        self.flush_due_acks(now_mics).await;
    }

    async fn flush_due_acks(&self, now_mics: u64) {
        for (key, entries) in self.ack_buffer.drain_due(now_mics) {
            let connection = self.lookup_by_ack_key(key);
            let frames = self.ack_buffer.serialize_and_recycle(entries);
            let Some(connection) = connection else {
                trace!("dropping acks for vanished connection {:x}", key.connection_id);
                continue;
            };
            if connection.state() == ConnectionState::Disposed {
                continue;
            }
            for frame_bytes in frames {
                match connection.create_packet_from_bytes(&frame_bytes) {
                    Ok(packet) => {
                        self.net_sender
                            .do_send_packet(connection.peer_addr(), &packet)
                            .await
                    }
                    Err(e) => warn!(
                        "cannot packetize ack frame for connection {:x}: {}",
                        key.connection_id, e
                    ),
                }
            }
        }
    }

    fn lookup_by_ack_key(&self, key: AckKey) -> Option<Arc<Connection>> {
        let registry = if key.server_side {
            &self.server_connections
        } else {
            &self.client_connections
        };
        registry.lock().unwrap().get(&key.connection_id).cloned()
    }

    /// Periodic sweep: closes idle connections, disposes closed ones past
    /// their grace period, drops disposed ones from the registries, and
    /// expires retained transmissions. All transitions are idempotent.
    pub fn clean(&self) {
        let now_mics = self.now_mics();
        for registry in [&self.client_connections, &self.server_connections] {
            let connections: Vec<Arc<Connection>> =
                registry.lock().unwrap().values().cloned().collect();
            for connection in connections {
                match connection.state() {
                    ConnectionState::Open => {
                        let idle = now_mics.saturating_sub(connection.last_activity_mics());
                        if idle >= connection.agreement().minimum_retention_mics
                            && !connection.has_active_send_transmissions()
                        {
                            debug!(
                                "closing idle connection {:x}",
                                connection.connection_id()
                            );
                            connection.close(now_mics, true);
                            self.enqueue_for_send(&connection);
                        } else {
                            connection.sweep_retained(now_mics);
                        }
                    }
                    ConnectionState::Closed => {
                        if connection.state_age_mics(now_mics) >= self.config.disposal_grace_mics {
                            connection.dispose(now_mics);
                        }
                    }
                    ConnectionState::Disposed => {}
                }
            }
            registry
                .lock()
                .unwrap()
                .retain(|_, c| c.state() != ConnectionState::Disposed);
        }

        let clients = self.client_connections.lock().unwrap();
        self.by_peer
            .lock()
            .unwrap()
            .retain(|_, id| clients.contains_key(id));
    }

    /// Sends one block and waits for the peer to acknowledge all of it.
    /// Waits for a free transmission slot if the connection is at capacity;
    /// if none frees up in time the call fails with `NoTransmission`, if the
    /// block is not fully acked in time it fails with `Timeout`.
    pub async fn send_block(
        &self,
        connection: &Arc<Connection>,
        data: Bytes,
        timeout: Duration,
    ) -> Result<(), TransmitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let (transmission, completion) = loop {
            match connection.create_block_send(data.clone(), self.now_mics()) {
                Ok(pair) => break pair,
                Err(TransmitError::NoTransmission) => {
                    if tokio::time::timeout_at(deadline, connection.wait_for_slot())
                        .await
                        .is_err()
                    {
                        return Err(TransmitError::NoTransmission);
                    }
                }
                Err(e) => return Err(e),
            }
        };
        self.enqueue_for_send(connection);

        match tokio::time::timeout_at(deadline, completion).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransmitError::Canceled),
            Err(_) => {
                connection.remove_send_transmission(transmission.id(), TransmitError::Timeout);
                Err(TransmitError::Timeout)
            }
        }
    }

    /// Opens a stream transmission towards the peer. Data is pushed through
    /// the returned handle; memory stays bounded to the negotiated window.
    pub fn open_stream(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        max_length: i64,
        data_id: u64,
    ) -> Result<StreamSendHandle, TransmitError> {
        let (transmission, completion) =
            connection.create_stream_send(max_length, data_id, self.now_mics())?;
        Ok(StreamSendHandle {
            terminal: self.clone(),
            connection: connection.clone(),
            transmission,
            completion,
        })
    }

    /// Closes and disposes every connection, flushing close notifications on
    /// a best-effort basis. The terminal is unusable afterwards.
    pub async fn shutdown(&self) {
        let now_mics = self.now_mics();
        let mut all: Vec<Arc<Connection>> = Vec::new();
        all.extend(self.client_connections.lock().unwrap().drain().map(|(_, c)| c));
        all.extend(self.server_connections.lock().unwrap().drain().map(|(_, c)| c));
        info!("shutting down terminal with {} connections", all.len());

        for connection in &all {
            connection.close(now_mics, true);
        }
        for connection in &all {
            connection.send_due(&self.net_sender, now_mics).await;
            connection.dispose(now_mics);
        }

        self.by_peer.lock().unwrap().clear();
        let mut queue = self.send_queue.lock().unwrap();
        queue.fair.clear();
        queue.congested.clear();
        drop(queue);
        self.congestion_list.lock().unwrap().clear();
    }
}

/// Caller-side handle for one outbound stream transmission.
pub struct StreamSendHandle {
    terminal: Arc<ConnectionTerminal>,
    connection: Arc<Connection>,
    transmission: Arc<SendTransmission>,
    completion: oneshot::Receiver<Result<(), TransmitError>>,
}

impl StreamSendHandle {
    /// Appends data to the stream, waiting if the send window is full.
    pub async fn write(&self, data: &[u8]) -> Result<(), TransmitError> {
        self.transmission.feed(data).await?;
        self.terminal.enqueue_for_send(&self.connection);
        Ok(())
    }

    /// Marks the stream complete and waits until the peer acknowledged all
    /// of it.
    pub async fn finish(self, timeout: Duration) -> Result<(), TransmitError> {
        self.transmission.close_stream()?;
        self.terminal.enqueue_for_send(&self.connection);
        match tokio::time::timeout(timeout, self.completion).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransmitError::Canceled),
            Err(_) => {
                self.connection
                    .remove_send_transmission(self.transmission.id(), TransmitError::Timeout);
                Err(TransmitError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agreement::ConnectionAgreement;
    use crate::embryo::HandshakeMaterial;
    use crate::handshake::HandshakeOutcome;
    use async_trait::async_trait;

    struct TestHandshaker {
        counter: AtomicU64,
    }

    impl TestHandshaker {
        fn new() -> TestHandshaker {
            TestHandshaker {
                counter: AtomicU64::new(1),
            }
        }
    }

    #[async_trait]
    impl Handshaker for TestHandshaker {
        async fn handshake_as_client(&self, _peer: SocketAddr) -> anyhow::Result<HandshakeOutcome> {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(HandshakeOutcome {
                material: HandshakeMaterial {
                    client_salt: n,
                    server_salt: n + 1,
                    material: vec![42; 32],
                    client_salt2: n + 2,
                    server_salt2: n + 3,
                },
                agreement: ConnectionAgreement::default(),
            })
        }
    }

    struct NeverHandshaker;

    #[async_trait]
    impl Handshaker for NeverHandshaker {
        async fn handshake_as_client(&self, _peer: SocketAddr) -> anyhow::Result<HandshakeOutcome> {
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct CollectingNetSender {
        packets: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl CollectingNetSender {
        fn drain(&self) -> Vec<(SocketAddr, Vec<u8>)> {
            std::mem::take(&mut self.packets.lock().unwrap())
        }

        fn count(&self) -> usize {
            self.packets.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NetSender for Arc<CollectingNetSender> {
        async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
            self.packets.lock().unwrap().push((to, packet_buf.to_vec()));
        }

        fn local_addr(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 1))
        }
    }

    #[derive(Default)]
    struct CollectingDispatcher {
        blocks: Mutex<Vec<(u64, Bytes)>>,
        stream_chunks: Mutex<Vec<(u64, u64, Bytes)>>,
        stream_ends: Mutex<Vec<(u64, u64)>>,
    }

    #[async_trait]
    impl ReceiveDispatcher for Arc<CollectingDispatcher> {
        async fn on_block(&self, connection_id: u64, data: Bytes) {
            self.blocks.lock().unwrap().push((connection_id, data));
        }

        async fn on_stream_data(&self, connection_id: u64, data_id: u64, chunk: Bytes) {
            self.stream_chunks
                .lock()
                .unwrap()
                .push((connection_id, data_id, chunk));
        }

        async fn on_stream_end(&self, connection_id: u64, data_id: u64) {
            self.stream_ends.lock().unwrap().push((connection_id, data_id));
        }
    }

    struct Fixture {
        terminal: Arc<ConnectionTerminal>,
        net: Arc<CollectingNetSender>,
        dispatcher: Arc<CollectingDispatcher>,
    }

    fn fixture_with(handshaker: Arc<dyn Handshaker>) -> Fixture {
        let net = Arc::new(CollectingNetSender::default());
        let dispatcher = Arc::new(CollectingDispatcher::default());
        let terminal = Arc::new(
            ConnectionTerminal::new(
                TransportConfig::default(),
                Arc::new(net.clone()),
                handshaker,
                Arc::new(dispatcher.clone()),
            )
            .unwrap(),
        );
        Fixture {
            terminal,
            net,
            dispatcher,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(TestHandshaker::new()))
    }

    fn server_addr() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 9000))
    }

    fn client_addr() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 2], 9001))
    }

    fn outcome() -> HandshakeOutcome {
        HandshakeOutcome {
            material: HandshakeMaterial {
                client_salt: 1,
                server_salt: 2,
                material: vec![42; 32],
                client_salt2: 3,
                server_salt2: 4,
            },
            agreement: ConnectionAgreement::default(),
        }
    }

    #[tokio::test]
    async fn test_connect_registers_and_reuses() {
        let f = fixture();
        let conn = f
            .terminal
            .connect(server_addr(), ConnectMode::ReuseIfOpen)
            .await
            .unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(f.terminal.connection_count(), (1, 0));

        let reused = f
            .terminal
            .connect(server_addr(), ConnectMode::ReuseIfOpen)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&conn, &reused));

        let fresh = f
            .terminal
            .connect(server_addr(), ConnectMode::NoReuse)
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&conn, &fresh));
    }

    #[tokio::test]
    async fn test_connect_reuse_only_without_open_connection_fails() {
        let f = fixture();
        assert_eq!(
            f.terminal
                .connect(server_addr(), ConnectMode::ReuseOnly)
                .await
                .err(),
            Some(ConnectError::NoEndpoint)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_handshake_timeout() {
        let f = fixture_with(Arc::new(NeverHandshaker));
        assert_eq!(
            f.terminal
                .connect(server_addr(), ConnectMode::NoReuse)
                .await
                .err(),
            Some(ConnectError::HandshakeTimeout)
        );
    }

    #[tokio::test]
    async fn test_prepare_bidirectional_is_idempotent() {
        let f = fixture();
        let server_conn = f.terminal.prepare_server_side(client_addr(), outcome());

        let counterpart = f
            .terminal
            .prepare_bidirectional_connection(&server_conn)
            .unwrap();
        assert_eq!(counterpart.role(), ConnectionRole::Client);
        assert_eq!(counterpart.connection_id(), server_conn.connection_id());

        let again = f
            .terminal
            .prepare_bidirectional_connection(&server_conn)
            .unwrap();
        assert!(Arc::ptr_eq(&counterpart, &again));
        assert_eq!(f.terminal.connection_count(), (1, 1));
    }

    #[tokio::test]
    async fn test_prepare_bidirectional_respects_agreement() {
        let net = Arc::new(CollectingNetSender::default());
        let dispatcher = Arc::new(CollectingDispatcher::default());
        let config = TransportConfig {
            default_agreement: ConnectionAgreement {
                allow_bidirectional: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let terminal = ConnectionTerminal::new(
            config,
            Arc::new(net),
            Arc::new(TestHandshaker::new()),
            Arc::new(dispatcher),
        )
        .unwrap();

        let mut one_sided = outcome();
        one_sided.agreement.allow_bidirectional = false;
        let server_conn = terminal.prepare_server_side(client_addr(), one_sided);
        assert_eq!(
            terminal.prepare_bidirectional_connection(&server_conn).err(),
            Some(ConnectError::BidirectionalNotAllowed)
        );
    }

    #[tokio::test]
    async fn test_receive_from_wrong_endpoint_is_dropped() {
        let f = fixture();
        let server_conn = f.terminal.prepare_server_side(client_addr(), outcome());
        let counterpart = f
            .terminal
            .prepare_bidirectional_connection(&server_conn)
            .unwrap();

        // a valid packet, but from an address that is not the peer
        let packet = counterpart
            .create_packet(&crate::frame::Frame::Close)
            .unwrap();
        let spoofed = SocketAddr::from(([192, 168, 1, 1], 1234));
        f.terminal.process_receive(spoofed, &packet).await;

        assert_eq!(server_conn.state(), ConnectionState::Open);
        assert_eq!(f.net.count(), 0);
    }

    #[tokio::test]
    async fn test_receive_for_unknown_connection_is_dropped_without_reply() {
        let f = fixture();
        f.terminal
            .process_receive(client_addr(), &[0u8; 64])
            .await;
        assert_eq!(f.net.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_closes_idle_then_disposes() {
        let f = fixture();
        let conn = f.terminal.prepare_server_side(client_addr(), outcome());
        let retention = conn.agreement().minimum_retention_mics;

        f.terminal.clean();
        assert_eq!(conn.state(), ConnectionState::Open);

        tokio::time::advance(Duration::from_micros(retention + 1)).await;
        f.terminal.clean();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(f.terminal.connection_count(), (0, 1));

        tokio::time::advance(Duration::from_micros(
            TransportConfig::default().disposal_grace_mics + 1,
        ))
        .await;
        f.terminal.clean();
        assert_eq!(conn.state(), ConnectionState::Disposed);
        assert_eq!(f.terminal.connection_count(), (0, 0));
    }

    #[tokio::test]
    async fn test_oversized_block_fails_before_any_packet() {
        let f = fixture();
        let conn = f
            .terminal
            .connect(server_addr(), ConnectMode::NoReuse)
            .await
            .unwrap();

        let max = conn.agreement().max_block_size as usize;
        let result = f
            .terminal
            .send_block(&conn, Bytes::from(vec![0; max + 1]), Duration::from_secs(1))
            .await;
        assert_eq!(result, Err(TransmitError::BlockSizeLimit));
        assert_eq!(f.net.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_block_resends_until_caller_timeout() {
        let f = fixture();
        let conn = f
            .terminal
            .connect(server_addr(), ConnectMode::NoReuse)
            .await
            .unwrap();

        let terminal = f.terminal.clone();
        let conn2 = conn.clone();
        let sender = tokio::spawn(async move {
            terminal
                .send_block(&conn2, Bytes::from_static(b"lost"), Duration::from_secs(3))
                .await
        });

        for _ in 0..60 {
            f.terminal.process_send().await;
            tokio::time::advance(Duration::from_millis(60)).await;
        }

        assert_eq!(sender.await.unwrap(), Err(TransmitError::Timeout));
        // the initial send plus at least one retransmission per RTO
        let packets = f.net.drain();
        assert!(packets.len() >= 2, "got {} packets", packets.len());
        assert!(packets.iter().all(|(to, _)| *to == server_addr()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_round_trip_through_paired_terminals() {
        let f = fixture();
        let client_conn = f
            .terminal
            .connect(server_addr(), ConnectMode::NoReuse)
            .await
            .unwrap();
        // same terminal plays the server side of its own connection, with
        // packets looped back through the collected sends
        let server_conn = f
            .terminal
            .prepare_bidirectional_connection(&client_conn)
            .unwrap();

        let terminal = f.terminal.clone();
        let conn2 = client_conn.clone();
        let sender = tokio::spawn(async move {
            terminal
                .send_block(
                    &conn2,
                    Bytes::from(vec![7u8; 5000]),
                    Duration::from_secs(10),
                )
                .await
        });

        for _ in 0..200 {
            if sender.is_finished() {
                break;
            }
            f.terminal.process_send().await;
            for (to, packet) in f.net.drain() {
                // both paired connections see the same peer address in this
                // loopback, so `to` doubles as the source address
                f.terminal.process_receive(to, &packet).await;
            }
            tokio::time::advance(Duration::from_millis(1)).await;
        }

        assert_eq!(sender.await.unwrap(), Ok(()));
        let blocks = f.dispatcher.blocks.lock().unwrap().clone();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].0, server_conn.connection_id());
        assert_eq!(blocks[0].1.as_ref(), vec![7u8; 5000].as_slice());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_limited_block_parks_and_resumes() {
        let f = fixture();
        let client_conn = f
            .terminal
            .connect(server_addr(), ConnectMode::NoReuse)
            .await
            .unwrap();
        let server_conn = f
            .terminal
            .prepare_bidirectional_connection(&client_conn)
            .unwrap();

        // more genes than the initial congestion window admits in one cycle
        let payload = vec![9u8; 60_000];
        let expected = Bytes::from(payload.clone());
        let terminal = f.terminal.clone();
        let conn2 = client_conn.clone();
        let sender = tokio::spawn(async move {
            terminal
                .send_block(&conn2, Bytes::from(payload), Duration::from_secs(10))
                .await
        });

        let mut parked = false;
        for _ in 0..400 {
            if sender.is_finished() {
                break;
            }
            f.terminal.process_send().await;
            parked |= !f.terminal.send_queue.lock().unwrap().congested.is_empty();
            for (to, packet) in f.net.drain() {
                f.terminal.process_receive(to, &packet).await;
            }
            tokio::time::advance(Duration::from_millis(1)).await;
        }

        assert_eq!(sender.await.unwrap(), Ok(()));
        assert!(parked);
        let blocks = f.dispatcher.blocks.lock().unwrap().clone();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].0, server_conn.connection_id());
        assert_eq!(blocks[0].1, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_congestion_control_ticks_resume_after_idle() {
        let f = fixture();
        let client_conn = f
            .terminal
            .connect(server_addr(), ConnectMode::NoReuse)
            .await
            .unwrap();
        f.terminal
            .prepare_bidirectional_connection(&client_conn)
            .unwrap();

        let terminal = f.terminal.clone();
        let conn2 = client_conn.clone();
        let sender = tokio::spawn(async move {
            terminal
                .send_block(&conn2, Bytes::from_static(b"warmup"), Duration::from_secs(10))
                .await
        });
        for _ in 0..200 {
            if sender.is_finished() {
                break;
            }
            f.terminal.process_send().await;
            for (to, packet) in f.net.drain() {
                f.terminal.process_receive(to, &packet).await;
            }
            tokio::time::advance(Duration::from_millis(1)).await;
        }
        assert_eq!(sender.await.unwrap(), Ok(()));

        // idle: nothing in flight, the instance drops off the active list
        f.terminal.process_send().await;
        assert!(f.terminal.congestion_list.lock().unwrap().is_empty());
        f.net.drain();

        // a later send puts the connection back on the list, and its genes
        // actually go out
        let (_tx, _rx) = client_conn
            .create_block_send(Bytes::from_static(b"later"), f.terminal.now_mics())
            .unwrap();
        f.terminal.enqueue_for_send(&client_conn);
        f.terminal.process_send().await;
        assert_eq!(f.terminal.congestion_list.lock().unwrap().len(), 1);
        assert_eq!(f.net.count(), 1);
    }

    /// Swaps in a replacement transmission while the scheduler is mid-cycle
    /// on the connection, mimicking a caller racing `process_send`.
    #[derive(Default)]
    struct MidCycleInjector {
        action: Mutex<Option<(Arc<ConnectionTerminal>, Arc<Connection>, u32)>>,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl NetSender for Arc<MidCycleInjector> {
        async fn do_send_packet(&self, _to: SocketAddr, packet_buf: &[u8]) {
            self.sent.lock().unwrap().push(packet_buf.to_vec());
            let action = self.action.lock().unwrap().take();
            if let Some((terminal, connection, old_id)) = action {
                connection.remove_send_transmission(old_id, TransmitError::Canceled);
                connection
                    .create_block_send(Bytes::from_static(b"replacement"), terminal.now_mics())
                    .unwrap();
                // swallowed by the dedup flag: the connection is being
                // serviced right now
                terminal.enqueue_for_send(&connection);
            }
        }

        fn local_addr(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 1))
        }
    }

    #[tokio::test]
    async fn test_transmission_created_mid_cycle_is_rescheduled() {
        let injector = Arc::new(MidCycleInjector::default());
        let terminal = Arc::new(
            ConnectionTerminal::new(
                TransportConfig::default(),
                Arc::new(injector.clone()),
                Arc::new(TestHandshaker::new()),
                Arc::new(Arc::new(CollectingDispatcher::default())),
            )
            .unwrap(),
        );
        let connection = terminal
            .connect(server_addr(), ConnectMode::NoReuse)
            .await
            .unwrap();

        let (old_tx, _old_rx) = connection
            .create_block_send(Bytes::from_static(b"abandoned"), terminal.now_mics())
            .unwrap();
        terminal.enqueue_for_send(&connection);
        *injector.action.lock().unwrap() =
            Some((terminal.clone(), connection.clone(), old_tx.id()));

        // cycle 1: while the old transmission's gene is on its way to the
        // socket, it is canceled and replaced
        terminal.process_send().await;
        assert_eq!(injector.sent.lock().unwrap().len(), 1);
        assert!(connection.has_active_send_transmissions());

        // the replacement must be scheduled on the next cycle regardless
        terminal.process_send().await;
        assert_eq!(injector.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_round_trip_with_late_close() {
        let f = fixture();
        let client_conn = f
            .terminal
            .connect(server_addr(), ConnectMode::NoReuse)
            .await
            .unwrap();
        let server_conn = f
            .terminal
            .prepare_bidirectional_connection(&client_conn)
            .unwrap();

        let handle = f.terminal.open_stream(&client_conn, 2000, 7).unwrap();
        handle.write(&[3u8; 2000]).await.unwrap();

        let finisher = tokio::spawn(async move { handle.finish(Duration::from_secs(10)).await });

        for _ in 0..200 {
            if finisher.is_finished() {
                break;
            }
            f.terminal.process_send().await;
            for (to, packet) in f.net.drain() {
                f.terminal.process_receive(to, &packet).await;
            }
            tokio::time::advance(Duration::from_millis(1)).await;
        }

        assert_eq!(finisher.await.unwrap(), Ok(()));

        let chunks = f.dispatcher.stream_chunks.lock().unwrap().clone();
        let total: usize = chunks.iter().map(|(_, _, chunk)| chunk.len()).sum();
        assert_eq!(total, 2000);
        assert!(chunks
            .iter()
            .all(|(conn, data_id, _)| *conn == server_conn.connection_id() && *data_id == 7));

        let ends = f.dispatcher.stream_ends.lock().unwrap().clone();
        assert_eq!(ends, vec![(server_conn.connection_id(), 7)]);
    }

    #[tokio::test]
    async fn test_shutdown_disposes_everything() {
        let f = fixture();
        let client = f
            .terminal
            .connect(server_addr(), ConnectMode::NoReuse)
            .await
            .unwrap();
        let server = f.terminal.prepare_server_side(client_addr(), outcome());

        f.terminal.shutdown().await;

        assert_eq!(client.state(), ConnectionState::Disposed);
        assert_eq!(server.state(), ConnectionState::Disposed);
        assert_eq!(f.terminal.connection_count(), (0, 0));
        // both close notifications went out before disposal
        assert!(f.net.count() >= 2);
    }
}
