//! End-to-end tests of the gateway core with in-memory endpoints.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use mpgate::config::Config;
use mpgate::connection::State;
use mpgate::context::Context;
use mpgate::endpoint::{KernelEndpoints, NetworkSide};
use mpgate::error::{EndpointError, Error, Result};
use mpgate::packet::tcpip::build_ipv4_tcp;
use mpgate::packet::{Entrypoint, Packet, PacketChannels, PacketReceivers};
use mpgate::router::Router;
use mpgate::shutdown::ShutdownReason;
use mpgate::types::{Flow, FlowKind, IpAddressKey, IpAddressPortKey, IpFlow, NetFlow, NetworkAddress, NetworkPath};
use mpgate::worker::WorkingSide;

/// Backbone whose traffic endpoints come up only when the test allows it.
struct Backbone {
    traffic_gate: Semaphore,
    refuse_contacting: bool,
    contacting: Mutex<Vec<PacketReceivers>>,
    traffic: Mutex<Vec<PacketReceivers>>,
    contacting_teardowns: AtomicUsize,
}

impl Backbone {
    fn new() -> Self {
        Self {
            traffic_gate: Semaphore::new(0),
            refuse_contacting: false,
            contacting: Mutex::new(Vec::new()),
            traffic: Mutex::new(Vec::new()),
            contacting_teardowns: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl NetworkSide for Backbone {
    async fn establish_contacting_client_endpoint(&self, flow: &Flow) -> Result<(NetFlow, PacketChannels)> {
        if self.refuse_contacting {
            return Err(EndpointError::ContactingClient("remote gateway unreachable".into()).into());
        }
        let (channels, receivers) = PacketChannels::bounded(16);
        self.contacting.lock().push(receivers);
        let mut net_flow = flow.net_flow.clone();
        net_flow.src = NetworkAddress::new("local,10.1.0.1");
        Ok((net_flow, channels))
    }

    async fn establish_traffic_client_endpoint(&self, flow: &Flow) -> Result<(NetFlow, PacketChannels)> {
        let permit = self
            .traffic_gate
            .acquire()
            .await
            .map_err(|_| EndpointError::TrafficClient("backbone gone".into()))?;
        permit.forget();

        let (channels, receivers) = PacketChannels::bounded(16);
        self.traffic.lock().push(receivers);
        let mut net_flow = flow.net_flow.clone();
        net_flow.src = NetworkAddress::new("local,10.2.0.1");
        Ok((net_flow, channels))
    }

    async fn establish_traffic_server_endpoint(&self, _flow: &Flow) -> Result<PacketChannels> {
        let (channels, receivers) = PacketChannels::bounded(16);
        self.traffic.lock().push(receivers);
        Ok(channels)
    }

    async fn teardown_contacting_client_endpoint(&self, _flow: &IpFlow) {
        self.contacting_teardowns.fetch_add(1, Ordering::SeqCst);
    }

    async fn teardown_traffic_client_endpoint(&self, _flow: &IpFlow) {}

    async fn teardown_traffic_server_endpoint(&self, _flow: &Flow) {}
}

struct Gateway {
    worker: WorkingSide,
    backbone: Arc<Backbone>,
    kernel_channels: PacketChannels,
    kernel_receivers: PacketReceivers,
}

fn gateway(backbone: Backbone) -> Gateway {
    let mut config = Config::default();
    config.connection.traffic_establish_delay = Duration::ZERO;
    config.shutdown.fatal_delay = Duration::from_millis(5);
    config.shutdown.force_exit = false;

    let router = Arc::new(Router::new());
    router
        .insert_from_ip_address_port_key(
            IpAddressPortKey("93.1.1.1:443".parse().unwrap()),
            NetFlow::towards(NetworkAddress::new("remote,10.9.0.1"), NetworkPath::new("fast")),
        )
        .unwrap();

    let kernel = Arc::new(KernelEndpoints::new());
    let (kernel_channels, kernel_receivers) = PacketChannels::bounded(16);
    kernel.register(IpAddressKey("10.0.0.5".parse().unwrap()), kernel_channels.clone());

    let backbone = Arc::new(backbone);
    let context = Context::with_router(config, router, kernel, backbone.clone());

    Gateway {
        worker: WorkingSide::new(Arc::new(context)),
        backbone,
        kernel_channels,
        kernel_receivers,
    }
}

fn tcp(src: &str, dst: &str, payload: &[u8]) -> Vec<u8> {
    build_ipv4_tcp(src.parse().unwrap(), dst.parse().unwrap(), 0x18, &[], payload)
}

async fn wait_for_state(worker: &WorkingSide, flow: &Flow, state: State) {
    let connection = worker.context().registry.retrieve(flow);
    for _ in 0..200 {
        if connection.state().await == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("connection never reached {state}");
}

#[tokio::test]
async fn test_client_flow_end_to_end() {
    let mut gateway = gateway(Backbone::new());
    let worker = gateway.worker.clone();

    let first = Packet::from_raw(
        Entrypoint::kernel(gateway.kernel_channels.clone()),
        tcp("10.0.0.5:4000", "93.1.1.1:443", b"hello"),
    )
    .unwrap();
    let flow = first.flow.clone();

    worker.process(first).await;

    let connection = worker.context().registry.retrieve(&flow);
    assert_eq!(connection.state().await, State::ClientReady);
    assert_eq!(connection.kind().await, FlowKind::Main);

    // The first packet goes out through the contacting endpoint with the routed flow.
    let forwarded = {
        let mut contacting = gateway.backbone.contacting.lock();
        assert_eq!(contacting.len(), 1);
        contacting[0].egress.try_recv().unwrap()
    };
    assert_eq!(forwarded.flow.net_flow.dst.as_str(), "remote,10.9.0.1");
    assert_eq!(forwarded.flow.net_flow.src.as_str(), "local,10.1.0.1");
    assert_eq!(forwarded.flow.net_flow.path.as_str(), "fast");

    // Let the traffic endpoint come up.
    gateway.backbone.traffic_gate.add_permits(1);
    wait_for_state(&worker, &flow, State::ClientEstablished).await;
    assert_eq!(gateway.backbone.contacting_teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(connection.flow().await.net_flow.src.as_str(), "local,10.2.0.1");

    // First reply over the traffic endpoint establishes the connection.
    let reply = Packet::from_raw(Entrypoint::traffic(), tcp("93.1.1.1:443", "10.0.0.5:4000", b"world")).unwrap();
    worker.process(reply).await;
    assert_eq!(connection.state().await, State::Established);

    let delivered = gateway.kernel_receivers.egress.recv().await.unwrap();
    assert_eq!(delivered.flow.ip_flow.src, "93.1.1.1:443".parse().unwrap());

    // Later kernel packets use the traffic endpoint.
    let before = connection.touched();
    tokio::time::sleep(Duration::from_millis(2)).await;
    let next = Packet::from_raw(
        Entrypoint::kernel(gateway.kernel_channels.clone()),
        tcp("10.0.0.5:4000", "93.1.1.1:443", b"again"),
    )
    .unwrap();
    worker.process(next).await;
    assert_eq!(connection.state().await, State::Established);
    assert!(connection.touched() > before);
    assert!(gateway.backbone.traffic.lock()[0].egress.try_recv().is_ok());

    assert_eq!(worker.context().registry.len(), 1);
}

#[tokio::test]
async fn test_server_flow_end_to_end() {
    // Server side mirror: the flow arrives from the backbone first.
    let mut gateway = gateway(Backbone::new());
    let worker = gateway.worker.clone();

    let mut hello = Packet::from_raw(
        Entrypoint::contacting(),
        tcp("198.51.100.7:5555", "10.0.0.5:8080", b"syn"),
    )
    .unwrap();
    hello.flow.net_flow = NetFlow::new(
        NetworkAddress::new("remote,10.9.0.1"),
        NetworkPath::default(),
        NetworkAddress::new("local,10.1.0.1"),
    );
    let flow = hello.flow.clone();

    worker.process(hello).await;
    let connection = worker.context().registry.retrieve(&flow);
    assert_eq!(connection.state().await, State::ServerReady);
    assert!(gateway.kernel_receivers.egress.recv().await.is_some());

    // Kernel answer goes out on the traffic server endpoint.
    let answer = Packet::from_raw(
        Entrypoint::kernel(gateway.kernel_channels.clone()),
        tcp("10.0.0.5:8080", "198.51.100.7:5555", b"syn-ack"),
    )
    .unwrap();
    worker.process(answer).await;
    let sent = gateway.backbone.traffic.lock()[0].egress.try_recv().unwrap();
    assert_eq!(sent.flow.net_flow.src.as_str(), "local,10.1.0.1");
    assert_eq!(sent.flow.net_flow.dst.as_str(), "remote,10.9.0.1");

    let data = Packet::from_raw(Entrypoint::traffic(), tcp("198.51.100.7:5555", "10.0.0.5:8080", b"data")).unwrap();
    worker.process(data).await;
    assert_eq!(connection.state().await, State::Established);
}

#[tokio::test]
async fn test_unreachable_remote_closes_flow_only() {
    let gateway = gateway(Backbone {
        refuse_contacting: true,
        ..Backbone::new()
    });
    let worker = gateway.worker.clone();

    let packet = Packet::from_raw(
        Entrypoint::kernel(gateway.kernel_channels.clone()),
        tcp("10.0.0.5:4000", "93.1.1.1:443", b""),
    )
    .unwrap();
    let flow = packet.flow.clone();
    worker.process(packet).await;

    let connection = worker.context().registry.retrieve(&flow);
    assert_eq!(connection.state().await, State::Closed);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!worker.context().shutdown.is_shutdown());
}

#[tokio::test]
async fn test_unroutable_flow_is_closed() {
    let gateway = gateway(Backbone::new());
    let worker = gateway.worker.clone();

    let packet = Packet::from_raw(
        Entrypoint::kernel(gateway.kernel_channels.clone()),
        tcp("10.0.0.5:4000", "203.0.113.1:22", b""),
    )
    .unwrap();
    let flow = packet.flow.clone();
    worker.process(packet).await;

    let connection = worker.context().registry.retrieve(&flow);
    assert_eq!(connection.state().await, State::Closed);
    assert!(gateway.backbone.contacting.lock().is_empty());
}

#[tokio::test]
async fn test_kernel_channels_via_workers() {
    let gateway = gateway(Backbone::new());
    let worker = gateway.worker.clone();

    let (ingress_tx, ingress_rx) = tokio::sync::mpsc::channel(8);
    let handles = worker.spawn_packet_workers("kernel", ingress_rx);

    let packet = Packet::from_raw(
        Entrypoint::kernel(gateway.kernel_channels.clone()),
        tcp("10.0.0.5:4000", "93.1.1.1:443", b"via worker"),
    )
    .unwrap();
    let flow = packet.flow.clone();
    ingress_tx.send(packet).await.unwrap();

    wait_for_state(&worker, &flow, State::ClientReady).await;

    worker.context().shutdown.request(ShutdownReason::Clean);
    for handle in handles {
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn test_closed_connection_cancels_establishment() {
    let gateway = gateway(Backbone::new());
    let worker = gateway.worker.clone();

    let packet = Packet::from_raw(
        Entrypoint::kernel(gateway.kernel_channels.clone()),
        tcp("10.0.0.5:4000", "93.1.1.1:443", b""),
    )
    .unwrap();
    let flow = packet.flow.clone();
    worker.process(packet).await;

    let connection = worker.context().registry.retrieve(&flow);
    assert!(connection.is_establishing());

    assert!(worker.context().registry.close(&flow.ip_flow.key(), &Error::ConnectionClosed).await);
    assert!(!connection.is_establishing());

    // Opening the gate now must not revive the closed connection.
    gateway.backbone.traffic_gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(connection.state().await, State::Closed);
    assert!(gateway.backbone.traffic.lock().is_empty());
}
