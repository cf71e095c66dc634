//! Per-flow connection state machine.
//!
//! A [`Connection`] owns one captured flow. Packets reach it from three
//! directions (the kernel, a contacting endpoint or a traffic endpoint) and
//! what happens to each depends on the connection's [`State`].
//!
//! Client side (flow captured locally):
//!
//! ```text
//! Raw --kernel--> ClientReady --(traffic endpoint up)--> ClientEstablished --traffic--> Established
//! ```
//!
//! Server side (flow opened by a remote gateway):
//!
//! ```text
//! Raw --contacting--> ServerReady --traffic--> Established
//! ```
//!
//! Any error moves the connection to `Closed`, which drops everything.

pub mod registry;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::endpoint::{KernelSide, NetworkSide};
use crate::error::{EndpointError, Error, Result, RoutingError, Severity};
use crate::packet::{EndpointRole, Packet, PacketChannels};
use crate::router::Router;
use crate::types::{ConnectionId, Flow, FlowKind, IpFlowKey, NetFlow, TrafficStats};

pub use registry::Registry;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Nothing seen yet.
    Raw,
    /// Contacting client endpoint up, traffic endpoint being established.
    ClientReady,
    /// Traffic server endpoint up, waiting for the first traffic packet.
    ServerReady,
    /// Traffic client endpoint up, waiting for the first traffic packet.
    ClientEstablished,
    /// Traffic flows in both directions.
    Established,
    /// Terminal.
    Closed,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::ClientReady => "client-ready",
            Self::ServerReady => "server-ready",
            Self::ClientEstablished => "client-established",
            Self::Established => "established",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the backbone opened the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

/// Everything mutated while processing a packet.
#[derive(Debug)]
struct Inner {
    flow: Flow,
    kind: FlowKind,
    state: State,
    previous: State,
    side: Option<Side>,
    kernel: Option<PacketChannels>,
    contacting: Option<PacketChannels>,
    traffic: Option<PacketChannels>,
}

/// A logical connection.
pub struct Connection {
    id: ConnectionId,
    key: IpFlowKey,
    inner: tokio::sync::Mutex<Inner>,
    touched: Mutex<Instant>,
    stats: Mutex<TrafficStats>,
    router: Arc<Router>,
    kernel: Arc<dyn KernelSide>,
    network: Arc<dyn NetworkSide>,
    establish_delay: Duration,
    establishing: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection for `flow` in state [`State::Raw`].
    pub fn new(
        flow: Flow,
        router: Arc<Router>,
        kernel: Arc<dyn KernelSide>,
        network: Arc<dyn NetworkSide>,
        establish_delay: Duration,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            key: flow.ip_flow.key(),
            inner: tokio::sync::Mutex::new(Inner {
                flow,
                kind: FlowKind::Unknown,
                state: State::Raw,
                previous: State::Raw,
                side: None,
                kernel: None,
                contacting: None,
                traffic: None,
            }),
            touched: Mutex::new(Instant::now()),
            stats: Mutex::new(TrafficStats::default()),
            router,
            kernel,
            network,
            establish_delay,
            establishing: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn key(&self) -> IpFlowKey {
        self.key
    }

    pub async fn state(&self) -> State {
        self.inner.lock().await.state
    }

    pub async fn kind(&self) -> FlowKind {
        self.inner.lock().await.kind
    }

    pub async fn flow(&self) -> Flow {
        self.inner.lock().await.flow.clone()
    }

    /// Last time a packet was forwarded.
    pub fn touched(&self) -> Instant {
        *self.touched.lock()
    }

    pub fn idle_for(&self) -> Duration {
        self.touched().elapsed()
    }

    pub fn stats(&self) -> TrafficStats {
        *self.stats.lock()
    }

    /// Whether a traffic client endpoint is still being established.
    pub fn is_establishing(&self) -> bool {
        self.establishing
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Process one packet.
    ///
    /// Packets for a closed connection are dropped. Any error closes the
    /// connection before being returned.
    pub async fn process_packet(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if inner.state == State::Closed {
            debug!(connection = %self.id, flow = %self.key, "Dropping packet for closed connection");
            return Ok(());
        }

        let result = match packet.role() {
            EndpointRole::Kernel => self.process_kernel(&mut inner, packet).await,
            EndpointRole::ContactingNetwork => self.process_contacting(&mut inner, packet).await,
            EndpointRole::TrafficNetwork => self.process_traffic(&mut inner, packet).await,
        };

        if let Err(e) = &result {
            self.close_locked(&mut inner, e).await;
        }
        result
    }

    /// Close the connection, tearing down its endpoints. Idempotent.
    pub async fn close(&self, reason: &Error) {
        let mut inner = self.inner.lock().await;
        self.close_locked(&mut inner, reason).await;
    }

    async fn process_kernel(self: &Arc<Self>, inner: &mut Inner, mut packet: Packet) -> Result<()> {
        match inner.state {
            State::Raw => {
                let kernel = packet
                    .entrypoint
                    .channels
                    .clone()
                    .ok_or_else(|| Error::internal("kernel packet without kernel endpoint channels"))?;

                let (net_flow, kind) = self.router.route(&packet)?;
                inner.kind = kind;
                inner.flow.net_flow = net_flow;
                inner.kernel = Some(kernel);
                inner.side = Some(Side::Client);

                let (probed, contacting) = self.network.establish_contacting_client_endpoint(&inner.flow).await?;
                inner.flow.net_flow.src = probed.src;
                inner.contacting = Some(contacting.clone());

                packet.flow.net_flow = inner.flow.net_flow.clone();
                self.forward_to_network(&contacting, packet, "contacting").await?;
                self.transition(inner, State::ClientReady);

                self.spawn_traffic_establishment(inner.flow.clone());
                Ok(())
            }
            State::ClientReady => {
                let contacting = Self::channels(&inner.contacting, "contacting")?;
                packet.flow.net_flow = inner.flow.net_flow.clone();
                self.forward_to_network(&contacting, packet, "contacting").await
            }
            State::ServerReady | State::ClientEstablished | State::Established => {
                let traffic = Self::channels(&inner.traffic, "traffic")?;
                packet.flow.net_flow = inner.flow.net_flow.clone();
                self.forward_to_network(&traffic, packet, "traffic").await
            }
            State::Closed => Ok(()),
        }
    }

    async fn process_contacting(&self, inner: &mut Inner, packet: Packet) -> Result<()> {
        match inner.state {
            State::Raw => {
                let address = packet.flow.ip_flow.dst_ip_key();
                let kernel = self
                    .kernel
                    .traffic_channels(&address)
                    .ok_or(EndpointError::NoKernelEndpoint(address))?;

                inner.flow.net_flow = packet.flow.net_flow.swap();
                inner.kernel = Some(kernel.clone());
                inner.side = Some(Side::Server);

                self.forward_to_kernel(&kernel, packet).await?;

                let traffic = self.network.establish_traffic_server_endpoint(&inner.flow).await?;
                inner.traffic = Some(traffic);
                self.transition(inner, State::ServerReady);
                Ok(())
            }
            State::ServerReady | State::Established => {
                let kernel = Self::channels(&inner.kernel, "kernel")?;
                self.forward_to_kernel(&kernel, packet).await
            }
            State::ClientReady | State::ClientEstablished => Err(Error::UnexpectedPacket {
                entrypoint: EndpointRole::ContactingNetwork.as_str(),
                state: inner.state.as_str(),
            }),
            State::Closed => Ok(()),
        }
    }

    async fn process_traffic(&self, inner: &mut Inner, packet: Packet) -> Result<()> {
        match inner.state {
            State::ServerReady | State::ClientEstablished => {
                if inner.kind == FlowKind::Main {
                    self.learn_token(inner, &packet)?;
                }
                let kernel = Self::channels(&inner.kernel, "kernel")?;
                self.forward_to_kernel(&kernel, packet).await?;
                self.transition(inner, State::Established);
                Ok(())
            }
            State::Established => {
                let kernel = Self::channels(&inner.kernel, "kernel")?;
                self.forward_to_kernel(&kernel, packet).await
            }
            State::Raw | State::ClientReady => Err(Error::UnexpectedPacket {
                entrypoint: EndpointRole::TrafficNetwork.as_str(),
                state: inner.state.as_str(),
            }),
            State::Closed => Ok(()),
        }
    }

    /// Register the remote sender key so later subflows can be routed.
    ///
    /// A token that is already known keeps its first mapping.
    fn learn_token(&self, inner: &Inner, packet: &Packet) -> Result<()> {
        match self
            .router
            .insert_from_syn_ack_mp_capable(packet, inner.flow.net_flow.clone())
        {
            Err(Error::Routing(RoutingError::DuplicateToken(token))) => {
                warn!(connection = %self.id, %token, "MPTCP token already registered, keeping first mapping");
                Ok(())
            }
            other => other,
        }
    }

    fn spawn_traffic_establishment(self: &Arc<Self>, flow: Flow) {
        let connection = Arc::clone(self);
        let delay = self.establish_delay;

        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let result = connection.network.establish_traffic_client_endpoint(&flow).await;

            let mut inner = connection.inner.lock().await;
            // Detach before touching state so close() cannot abort this task.
            connection.establishing.lock().take();

            match result {
                Ok((net_flow, channels)) => {
                    if let Err(e) = connection.adopt_traffic_client(&mut inner, net_flow, channels).await {
                        connection.close_locked(&mut inner, &e).await;
                    }
                }
                Err(e) => connection.close_locked(&mut inner, &e).await,
            }
        });

        // The caller holds the inner lock, so the task cannot observe the
        // slot before the handle is stored.
        *self.establishing.lock() = Some(handle);
    }

    async fn adopt_traffic_client(&self, inner: &mut Inner, net_flow: NetFlow, channels: PacketChannels) -> Result<()> {
        // Not reached today: close_locked aborts the task while its handle is
        // still stored, and the task detaches only once it holds the lock.
        if inner.state != State::ClientReady {
            self.network.teardown_traffic_client_endpoint(&inner.flow.ip_flow).await;
            return Err(Error::UnexpectedPacket {
                entrypoint: "traffic establishment",
                state: inner.state.as_str(),
            });
        }

        inner.flow.net_flow = net_flow;
        inner.traffic = Some(channels);
        if inner.contacting.take().is_some() {
            self.network
                .teardown_contacting_client_endpoint(&inner.flow.ip_flow)
                .await;
        }
        self.transition(inner, State::ClientEstablished);
        Ok(())
    }

    async fn close_locked(&self, inner: &mut Inner, reason: &Error) {
        if inner.state == State::Closed {
            return;
        }

        let aborted = match self.establishing.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        };

        self.transition(inner, State::Closed);

        if inner.contacting.take().is_some() {
            self.network
                .teardown_contacting_client_endpoint(&inner.flow.ip_flow)
                .await;
        }
        let had_traffic = inner.traffic.take().is_some();
        match inner.side {
            Some(Side::Client) if had_traffic || aborted => {
                self.network
                    .teardown_traffic_client_endpoint(&inner.flow.ip_flow)
                    .await;
            }
            Some(Side::Server) if had_traffic => {
                self.network.teardown_traffic_server_endpoint(&inner.flow).await;
            }
            _ => {}
        }
        inner.kernel = None;

        match reason.severity() {
            Severity::Critical => {
                error!(connection = %self.id, flow = %self.key, error = %reason, "Connection closed")
            }
            Severity::Tolerable => {
                warn!(connection = %self.id, flow = %self.key, error = %reason, "Connection closed")
            }
            Severity::ThirdParty => {
                info!(connection = %self.id, flow = %self.key, error = %reason, "Connection closed")
            }
        }
    }

    fn transition(&self, inner: &mut Inner, next: State) {
        inner.previous = inner.state;
        inner.state = next;
        debug!(
            connection = %self.id,
            flow = %self.key,
            previous = %inner.previous,
            current = %inner.state,
            "State change"
        );
    }

    fn channels(slot: &Option<PacketChannels>, towards: &'static str) -> Result<PacketChannels> {
        slot.clone()
            .ok_or_else(|| Error::internal(format!("no {towards} endpoint channels")))
    }

    async fn forward_to_network(&self, channels: &PacketChannels, packet: Packet, towards: &'static str) -> Result<()> {
        let len = packet.len() as u64;
        channels.forward(packet, towards).await?;
        self.touch();
        let mut stats = self.stats.lock();
        stats.bytes_to_network += len;
        stats.packets_to_network += 1;
        Ok(())
    }

    async fn forward_to_kernel(&self, channels: &PacketChannels, packet: Packet) -> Result<()> {
        let len = packet.len() as u64;
        channels.forward(packet, "kernel").await?;
        self.touch();
        let mut stats = self.stats.lock();
        stats.bytes_to_kernel += len;
        stats.packets_to_kernel += 1;
        Ok(())
    }

    fn touch(&self) {
        *self.touched.lock() = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::KernelEndpoints;
    use crate::mptcp::{build, EndpointKey};
    use crate::packet::tcpip::build_ipv4_tcp;
    use crate::packet::{Entrypoint, PacketReceivers};
    use crate::types::{IpAddressPortKey, NetworkAddress, NetworkPath};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Network {
        fail_traffic_client: bool,
        contacting: Mutex<Vec<PacketReceivers>>,
        traffic: Mutex<Vec<PacketReceivers>>,
        teardowns: AtomicUsize,
    }

    #[async_trait]
    impl NetworkSide for Network {
        async fn establish_contacting_client_endpoint(&self, flow: &Flow) -> Result<(NetFlow, PacketChannels)> {
            let (channels, receivers) = PacketChannels::bounded(16);
            self.contacting.lock().push(receivers);
            let mut net_flow = flow.net_flow.clone();
            net_flow.src = NetworkAddress::new("local-probe");
            Ok((net_flow, channels))
        }

        async fn establish_traffic_client_endpoint(&self, flow: &Flow) -> Result<(NetFlow, PacketChannels)> {
            if self.fail_traffic_client {
                return Err(EndpointError::TrafficClient("refused".into()).into());
            }
            let (channels, receivers) = PacketChannels::bounded(16);
            self.traffic.lock().push(receivers);
            let mut net_flow = flow.net_flow.clone();
            net_flow.src = NetworkAddress::new("local-traffic");
            Ok((net_flow, channels))
        }

        async fn establish_traffic_server_endpoint(&self, _flow: &Flow) -> Result<PacketChannels> {
            let (channels, receivers) = PacketChannels::bounded(16);
            self.traffic.lock().push(receivers);
            Ok(channels)
        }

        async fn teardown_contacting_client_endpoint(&self, _flow: &crate::types::IpFlow) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }

        async fn teardown_traffic_client_endpoint(&self, _flow: &crate::types::IpFlow) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }

        async fn teardown_traffic_server_endpoint(&self, _flow: &Flow) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        router: Arc<Router>,
        kernel: Arc<KernelEndpoints>,
        network: Arc<Network>,
        kernel_channels: PacketChannels,
        kernel_receivers: PacketReceivers,
    }

    impl Fixture {
        fn new(network: Network) -> Self {
            let router = Arc::new(Router::new());
            router
                .insert_from_ip_address_port_key(
                    IpAddressPortKey("93.1.1.1:443".parse().unwrap()),
                    NetFlow::towards(NetworkAddress::new("remote"), NetworkPath::default()),
                )
                .unwrap();
            let kernel = Arc::new(KernelEndpoints::new());
            let (kernel_channels, kernel_receivers) = PacketChannels::bounded(16);
            kernel.register(crate::types::IpAddressKey("10.0.0.5".parse().unwrap()), kernel_channels.clone());
            Self {
                router,
                kernel,
                network: Arc::new(network),
                kernel_channels,
                kernel_receivers,
            }
        }

        fn connection(&self, packet: &Packet, delay: Duration) -> Arc<Connection> {
            Arc::new(Connection::new(
                packet.flow.clone(),
                self.router.clone(),
                self.kernel.clone(),
                self.network.clone(),
                delay,
            ))
        }

        fn kernel_packet(&self, options: &[u8]) -> Packet {
            Packet::from_raw(Entrypoint::kernel(self.kernel_channels.clone()), raw(outbound(), options)).unwrap()
        }
    }

    fn outbound() -> (&'static str, &'static str) {
        ("10.0.0.5:4000", "93.1.1.1:443")
    }

    fn raw((src, dst): (&str, &str), options: &[u8]) -> Vec<u8> {
        build_ipv4_tcp(src.parse().unwrap(), dst.parse().unwrap(), 0x02, options, b"")
    }

    fn inbound(entrypoint: Entrypoint, options: &[u8]) -> Packet {
        Packet::from_raw(entrypoint, raw(("93.1.1.1:443", "10.0.0.5:4000"), options)).unwrap()
    }

    async fn wait_for(connection: &Connection, state: State) {
        for _ in 0..200 {
            if connection.state().await == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("connection never reached {state}");
    }

    #[tokio::test]
    async fn test_client_flow_reaches_established() {
        let fixture = Fixture::new(Network::default());
        let packet = fixture.kernel_packet(&[]);
        let connection = fixture.connection(&packet, Duration::ZERO);

        connection.process_packet(packet).await.unwrap();
        assert_eq!(connection.kind().await, FlowKind::Main);
        assert_eq!(fixture.network.contacting.lock().len(), 1);

        wait_for(&connection, State::ClientEstablished).await;
        assert_eq!(connection.flow().await.net_flow.src.as_str(), "local-traffic");
        assert!(!connection.is_establishing());

        connection.process_packet(inbound(Entrypoint::traffic(), &[])).await.unwrap();
        assert_eq!(connection.state().await, State::Established);

        let before = connection.touched();
        tokio::time::sleep(Duration::from_millis(2)).await;
        connection.process_packet(fixture.kernel_packet(&[])).await.unwrap();
        assert_eq!(connection.state().await, State::Established);
        assert!(connection.touched() > before);

        let stats = connection.stats();
        assert_eq!(stats.packets_to_network, 2);
        assert_eq!(stats.packets_to_kernel, 1);
    }

    #[tokio::test]
    async fn test_unroutable_first_packet_closes() {
        let fixture = Fixture::new(Network::default());
        let packet = Packet::from_raw(
            Entrypoint::kernel(fixture.kernel_channels.clone()),
            raw(("10.0.0.5:4000", "93.9.9.9:80"), &[]),
        )
        .unwrap();
        let connection = fixture.connection(&packet, Duration::ZERO);

        let result = connection.process_packet(packet).await;
        assert!(matches!(result, Err(Error::Routing(RoutingError::NoRoute(_)))));
        assert_eq!(connection.state().await, State::Closed);

        // Later packets are dropped without error.
        connection.process_packet(fixture.kernel_packet(&[])).await.unwrap();
        assert_eq!(connection.state().await, State::Closed);
    }

    #[tokio::test]
    async fn test_traffic_before_ready_is_protocol_error() {
        let fixture = Fixture::new(Network::default());
        let packet = inbound(Entrypoint::traffic(), &[]);
        let connection = fixture.connection(&packet, Duration::ZERO);

        let result = connection.process_packet(packet).await;
        assert!(matches!(result, Err(Error::UnexpectedPacket { state: "raw", .. })));
        assert_eq!(connection.state().await, State::Closed);
    }

    #[tokio::test]
    async fn test_kernel_packet_without_channels_is_critical() {
        let fixture = Fixture::new(Network::default());
        let mut packet = fixture.kernel_packet(&[]);
        packet.entrypoint.channels = None;
        let connection = fixture.connection(&packet, Duration::ZERO);

        let err = connection.process_packet(packet).await.unwrap_err();
        assert!(err.is_critical());
    }

    #[tokio::test]
    async fn test_failed_traffic_establishment_closes() {
        let fixture = Fixture::new(Network {
            fail_traffic_client: true,
            ..Default::default()
        });
        let packet = fixture.kernel_packet(&[]);
        let connection = fixture.connection(&packet, Duration::ZERO);

        connection.process_packet(packet).await.unwrap();
        wait_for(&connection, State::Closed).await;
        assert!(fixture.network.teardowns.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_close_aborts_pending_establishment() {
        let fixture = Fixture::new(Network::default());
        let packet = fixture.kernel_packet(&[]);
        let connection = fixture.connection(&packet, Duration::from_secs(60));

        connection.process_packet(packet).await.unwrap();
        assert_eq!(connection.state().await, State::ClientReady);
        assert!(connection.is_establishing());

        connection.close(&Error::ConnectionClosed).await;
        assert_eq!(connection.state().await, State::Closed);
        assert!(!connection.is_establishing());
        assert!(fixture.network.traffic.lock().is_empty());

        // A second close is a no-op.
        let teardowns = fixture.network.teardowns.load(Ordering::SeqCst);
        connection.close(&Error::ConnectionClosed).await;
        assert_eq!(fixture.network.teardowns.load(Ordering::SeqCst), teardowns);
    }

    #[tokio::test]
    async fn test_server_flow() {
        let mut fixture = Fixture::new(Network::default());
        let mut packet = inbound(Entrypoint::contacting(), &[]);
        packet.flow.net_flow = NetFlow::new(
            NetworkAddress::new("remote"),
            NetworkPath::default(),
            NetworkAddress::new("local"),
        );
        let connection = fixture.connection(&packet, Duration::ZERO);

        connection.process_packet(packet).await.unwrap();
        assert_eq!(connection.state().await, State::ServerReady);
        assert_eq!(connection.flow().await.net_flow.src.as_str(), "local");
        assert!(fixture.kernel_receivers.egress.recv().await.is_some());

        connection
            .process_packet(inbound(Entrypoint::contacting(), &[]))
            .await
            .unwrap();
        assert_eq!(connection.state().await, State::ServerReady);

        connection.process_packet(inbound(Entrypoint::traffic(), &[])).await.unwrap();
        assert_eq!(connection.state().await, State::Established);
        assert_eq!(connection.kind().await, FlowKind::Unknown);
    }

    #[tokio::test]
    async fn test_contacting_in_client_ready_is_protocol_error() {
        let fixture = Fixture::new(Network::default());
        let packet = fixture.kernel_packet(&[]);
        let connection = fixture.connection(&packet, Duration::from_secs(60));
        connection.process_packet(packet).await.unwrap();

        let result = connection
            .process_packet(inbound(Entrypoint::contacting(), &[]))
            .await;
        assert!(matches!(result, Err(Error::UnexpectedPacket { state: "client-ready", .. })));
        assert_eq!(connection.state().await, State::Closed);
    }

    #[tokio::test]
    async fn test_main_flow_learns_token() {
        let fixture = Fixture::new(Network::default());
        let packet = fixture.kernel_packet(&[]);
        let connection = fixture.connection(&packet, Duration::ZERO);
        connection.process_packet(packet).await.unwrap();
        wait_for(&connection, State::ClientEstablished).await;

        let key = EndpointKey(0x0102030405060708);
        connection
            .process_packet(inbound(Entrypoint::traffic(), &build::mp_capable(key)))
            .await
            .unwrap();
        assert_eq!(fixture.router.token_count(), 1);

        let join = Packet::from_raw(
            Entrypoint::kernel(fixture.kernel_channels.clone()),
            raw(("10.0.0.5:4001", "93.1.1.1:443"), &build::mp_join_syn(key.token(), 2, 1)),
        )
        .unwrap();
        let (flow, kind) = fixture.router.route(&join).unwrap();
        assert_eq!(kind, FlowKind::Sub);
        assert_eq!(flow.src.as_str(), "local-traffic");
    }

    #[tokio::test]
    async fn test_malformed_key_on_traffic_closes() {
        let fixture = Fixture::new(Network::default());
        let packet = fixture.kernel_packet(&[]);
        let connection = fixture.connection(&packet, Duration::ZERO);
        connection.process_packet(packet).await.unwrap();
        wait_for(&connection, State::ClientEstablished).await;
        assert_eq!(connection.kind().await, FlowKind::Main);

        // MP_CAPABLE must be 12 or 20 bytes long.
        let truncated = [30, 8, 0x00, 0x81, 1, 2, 3, 4];
        let result = connection
            .process_packet(inbound(Entrypoint::traffic(), &truncated))
            .await;
        assert!(matches!(
            result,
            Err(Error::Protocol(crate::error::ProtocolError::InvalidMptcpLength { length: 8, .. }))
        ));
        assert_eq!(connection.state().await, State::Closed);
        assert_eq!(fixture.router.token_count(), 0);
    }

    #[tokio::test]
    async fn test_traffic_in_client_ready_is_protocol_error() {
        let fixture = Fixture::new(Network::default());
        let packet = fixture.kernel_packet(&[]);
        let connection = fixture.connection(&packet, Duration::from_secs(60));
        connection.process_packet(packet).await.unwrap();
        assert_eq!(connection.state().await, State::ClientReady);

        let result = connection.process_packet(inbound(Entrypoint::traffic(), &[])).await;
        assert!(matches!(result, Err(Error::UnexpectedPacket { state: "client-ready", .. })));
        assert_eq!(connection.state().await, State::Closed);
        assert!(!connection.is_establishing());
    }

    #[tokio::test]
    async fn test_kernel_packet_in_server_ready_uses_traffic() {
        let fixture = Fixture::new(Network::default());
        let packet = inbound(Entrypoint::contacting(), &[]);
        let connection = fixture.connection(&packet, Duration::ZERO);
        connection.process_packet(packet).await.unwrap();
        assert_eq!(connection.state().await, State::ServerReady);

        connection.process_packet(fixture.kernel_packet(&[])).await.unwrap();
        assert_eq!(connection.state().await, State::ServerReady);

        let mut traffic = fixture.network.traffic.lock();
        assert_eq!(traffic.len(), 1);
        assert!(traffic[0].egress.try_recv().is_ok());
        assert!(fixture.network.contacting.lock().is_empty());
    }
}
