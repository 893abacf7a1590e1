#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use portmux_ipc::memory::{MemoryChannel, MemoryTransport};
use portmux_ipc::{
    ChannelHandler, DuplexChannel, HandlerError, HandlerOutput, IpcError, Payload, PeerIdentity,
    ResponseEnvelope, StreamFrame,
};
use portmux_ipc_server::{ApprovalPolicy, Registry, ServerConfig};
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub const NAMESPACE: &str = "portmux-test";
pub const LOCAL_ORIGIN: &str = "chrome-extension://portmux";
pub const TRUSTED: &str = "https://wallet.example";
pub const WAIT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(100);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Handler driven by the request payload:
///
/// - `"ping"` → `"pong"`
/// - `"boom"` → fails with a plain (non-`IpcError`) error
/// - `{"stream": n}` → streams `0..n`
/// - `{"sleep": ms, "reply": v}` → waits, then answers `v`
/// - `"wait"` → blocks until cancelled, then fails with `canceled`
#[derive(Default)]
pub struct ScriptedHandler {
    pub calls: AtomicUsize,
    pub cancelled: AtomicUsize,
    pub cancel_seen: Notify,
}

#[async_trait]
impl ChannelHandler for ScriptedHandler {
    async fn handle(
        &self,
        request: Payload,
        cancel: CancellationToken,
    ) -> Result<HandlerOutput, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if request == json!("ping") {
            return Ok(HandlerOutput::Unary(json!("pong")));
        }
        if request == json!("boom") {
            return Err(Box::new(std::io::Error::other("boom")));
        }
        if request == json!("wait") {
            cancel.cancelled().await;
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            self.cancel_seen.notify_waiters();
            return Err(Box::new(IpcError::canceled("request cancelled")));
        }
        if let Some(n) = request.get("stream").and_then(Payload::as_u64) {
            let values = futures::stream::iter((0..n).map(|i| Ok(json!(i))));
            return Ok(HandlerOutput::Stream(values.boxed()));
        }
        if let Some(ms) = request.get("sleep").and_then(Payload::as_u64) {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Box::new(IpcError::canceled("sleep"))),
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            }
            return Ok(HandlerOutput::Unary(request.get("reply").cloned().unwrap_or(Payload::Null)));
        }
        Err(Box::new(IpcError::Unimplemented {
            method: request.to_string(),
        }))
    }
}

/// Approves every peer after `delay`, counting calls.
pub struct SlowApprove {
    pub delay: Duration,
    pub approve: bool,
    pub calls: AtomicUsize,
}

impl SlowApprove {
    pub fn new(delay: Duration, approve: bool) -> Self {
        Self {
            delay,
            approve,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ApprovalPolicy for SlowApprove {
    async fn approve(
        &self,
        _metadata: &portmux_ipc::ConnectionMetadata,
    ) -> Result<bool, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.approve)
    }
}

pub struct Harness {
    pub transport: Arc<MemoryTransport>,
    pub registry: Arc<Registry>,
    pub handler: Arc<ScriptedHandler>,
}

impl Harness {
    pub fn start(policy: Option<Arc<dyn ApprovalPolicy>>) -> Self {
        Self::start_with(policy, ServerConfig::default().trust(TRUSTED))
    }

    pub fn start_with(policy: Option<Arc<dyn ApprovalPolicy>>, config: ServerConfig) -> Self {
        init_logging();
        let handler = Arc::new(ScriptedHandler::default());
        let registry =
            Registry::new(NAMESPACE, handler.clone(), policy, config).expect("registry");
        let transport = Arc::new(MemoryTransport::new(LOCAL_ORIGIN));
        tokio::spawn(registry.clone().serve(transport.clone()));
        Self {
            transport,
            registry,
            handler,
        }
    }

    pub fn connect(&self, client_id: &str, origin: &str) -> MemoryChannel {
        self.connect_as(client_id, PeerIdentity::new(origin))
    }

    pub fn connect_as(&self, client_id: &str, peer: PeerIdentity) -> MemoryChannel {
        self.transport.connect(format!("{NAMESPACE}-control-{client_id}"), peer)
    }

    /// Connect from a trusted origin and wait for the session to register.
    pub async fn session(&self, client_id: &str) -> MemoryChannel {
        let before = self.registry.len();
        let client = self.connect(client_id, TRUSTED);
        wait_until(|| self.registry.len() > before).await;
        client
    }
}

pub async fn request(client: &MemoryChannel, id: &str, message: Payload) {
    client
        .send(json!({"requestId": id, "message": message}))
        .await
        .expect("send request");
}

pub async fn response(client: &MemoryChannel) -> ResponseEnvelope {
    let message = tokio::time::timeout(WAIT, client.recv())
        .await
        .expect("response in time")
        .expect("channel open");
    serde_json::from_value(message).expect("response envelope")
}

pub async fn frame(stream: &MemoryChannel) -> StreamFrame {
    let message = tokio::time::timeout(WAIT, stream.recv())
        .await
        .expect("frame in time")
        .expect("stream open");
    serde_json::from_value(message).expect("stream frame")
}

/// `true` if nothing arrives on `client` for a short while.
pub async fn stays_silent(client: &MemoryChannel) -> bool {
    tokio::time::timeout(QUIET, client.recv()).await.is_err()
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}
