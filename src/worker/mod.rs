//! Working side: tasks that drain packet channels into connections and
//! react to endpoint issues.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::endpoint::EndpointIssue;
use crate::error::{Error, Severity};
use crate::packet::Packet;
use crate::shutdown::ShutdownReason;

/// Sending halves handed to the endpoints.
#[derive(Clone)]
pub struct Feeds {
    pub kernel: mpsc::Sender<Packet>,
    pub contacting: mpsc::Sender<Packet>,
    pub traffic: mpsc::Sender<Packet>,
    pub issues: mpsc::Sender<EndpointIssue>,
}

/// Receiving halves drained by the working side.
pub struct Inputs {
    pub kernel: mpsc::Receiver<Packet>,
    pub contacting: mpsc::Receiver<Packet>,
    pub traffic: mpsc::Receiver<Packet>,
    pub issues: mpsc::Receiver<EndpointIssue>,
}

/// Dispatches packets and issues for the whole gateway.
#[derive(Clone)]
pub struct WorkingSide {
    context: Arc<Context>,
}

impl WorkingSide {
    pub fn new(context: Arc<Context>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Create the gateway input channels, sized by `channel_capacity`.
    pub fn channels(&self) -> (Feeds, Inputs) {
        let capacity = self.context.config.connection.channel_capacity;
        let (kernel_tx, kernel_rx) = mpsc::channel(capacity);
        let (contacting_tx, contacting_rx) = mpsc::channel(capacity);
        let (traffic_tx, traffic_rx) = mpsc::channel(capacity);
        let (issues_tx, issues_rx) = mpsc::channel(capacity);

        (
            Feeds {
                kernel: kernel_tx,
                contacting: contacting_tx,
                traffic: traffic_tx,
                issues: issues_tx,
            },
            Inputs {
                kernel: kernel_rx,
                contacting: contacting_rx,
                traffic: traffic_rx,
                issues: issues_rx,
            },
        )
    }

    /// Start every gateway task.
    ///
    /// Spawns the reclamation task, the packet workers of the three input
    /// channels, the issue handler, the signal listener and a task that
    /// closes all connections once shutdown is requested.
    pub fn start(&self, inputs: Inputs) -> Vec<JoinHandle<()>> {
        let context = &self.context;
        let mut handles = Vec::new();

        let reclaimer = Arc::clone(&context.registry).start_reclaim_task();

        handles.extend(self.spawn_packet_workers("kernel", inputs.kernel));
        handles.extend(self.spawn_packet_workers("contacting", inputs.contacting));
        handles.extend(self.spawn_packet_workers("traffic", inputs.traffic));
        handles.push(self.spawn_issue_handler(inputs.issues));

        let shutdown = context.shutdown.clone();
        handles.push(tokio::spawn(async move { shutdown.listen_signals().await }));

        let shutdown = context.shutdown.clone();
        let registry = Arc::clone(&context.registry);
        handles.push(tokio::spawn(async move {
            let reason = shutdown.wait().await;
            reclaimer.abort();
            let closed = registry.close_all(&Error::ConnectionClosed).await;
            info!(%reason, closed, "Closed remaining connections");
        }));

        info!(
            workers_per_channel = context.config.worker.workers_per_channel,
            "Gateway started"
        );
        handles
    }

    /// Start every gateway task and wait until all of them stopped.
    pub async fn run(&self, inputs: Inputs) -> ShutdownReason {
        for handle in self.start(inputs) {
            if let Err(e) = handle.await {
                warn!("Gateway task failed: {}", e);
            }
        }
        self.context.shutdown.reason().unwrap_or(ShutdownReason::Clean)
    }

    /// Hand one packet to its connection.
    pub async fn process(&self, packet: Packet) {
        let connection = self.context.registry.retrieve(&packet.flow);
        let role = packet.role();

        if let Err(e) = connection.process_packet(packet).await {
            self.report(&e, || format!("{role} packet for {}", connection.key()));
        }
    }

    /// React to a failure reported by an endpoint.
    ///
    /// Kernel and contacting server endpoints are shared by every flow, so
    /// losing one stops the gateway. The other endpoints belong to a single
    /// flow whose connection is closed.
    pub async fn handle_issue(&self, issue: EndpointIssue) {
        if issue.issuer.is_fatal() {
            self.context.shutdown.fatal(&issue.error);
            return;
        }

        match &issue.flow {
            Some(flow) => {
                let key = flow.ip_flow.key();
                if !self.context.registry.close(&key, &issue.error).await {
                    debug!(flow = %key, issuer = %issue.issuer, "Issue for unknown connection");
                }
            }
            None => warn!("Issue without flow: {}", issue),
        }
    }

    /// Spawn `workers_per_channel` tasks sharing one packet channel.
    pub fn spawn_packet_workers(&self, name: &'static str, rx: mpsc::Receiver<Packet>) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        let count = self.context.config.worker.workers_per_channel;

        (0..count)
            .map(|index| {
                let worker = self.clone();
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    debug!(channel = name, index, "Packet worker started");
                    loop {
                        let next = tokio::select! {
                            _ = worker.context.shutdown.wait() => break,
                            next = async { rx.lock().await.recv().await } => next,
                        };
                        match next {
                            Some(packet) => worker.process(packet).await,
                            None => break,
                        }
                    }
                    debug!(channel = name, index, "Packet worker stopped");
                })
            })
            .collect()
    }

    /// Spawn the task consuming endpoint issues.
    pub fn spawn_issue_handler(&self, mut rx: mpsc::Receiver<EndpointIssue>) -> JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = worker.context.shutdown.wait() => break,
                    next = rx.recv() => next,
                };
                match next {
                    Some(issue) => worker.handle_issue(issue).await,
                    None => break,
                }
            }
            info!("Issue handler stopped");
        })
    }

    fn report(&self, err: &Error, what: impl FnOnce() -> String) {
        match err.severity() {
            Severity::Critical => self.context.shutdown.fatal(err),
            Severity::Tolerable => debug!(error = %err, "Dropped {}", what()),
            Severity::ThirdParty => debug!(error = %err, "Dropped {} (third party)", what()),
        }
    }
}
