use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use portmux_ipc::{
    ChannelError, ClientEnvelope, DuplexChannel, Payload, PeerIdentity, RequestId,
    ResponseEnvelope,
};
use tokio_util::sync::CancellationToken;

/// Process-unique session number, assigned by the registry.
pub type SessionId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Aborted,
}

/// One in-flight request registered with its session.
///
/// A request id may be reused once released, so the ticket, not the id,
/// identifies the registration to release.
#[derive(Clone, Debug)]
pub struct RequestTicket {
    request_id: RequestId,
    seq: u64,
    cancel: CancellationToken,
}

impl RequestTicket {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Fires on client abort, disconnect, or session abort.
    pub fn cancel_signal(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// One accepted, validated connection and its in-flight work.
///
/// The session owns its channel for its whole life. Its cancellation token
/// fires on transport disconnect or [`Session::abort`], and every request
/// token is a child of it.
pub struct Session {
    id: SessionId,
    namespace: String,
    client_id: String,
    channel: Arc<dyn DuplexChannel>,
    cancel: CancellationToken,
    aborted: AtomicBool,
    next_seq: AtomicU64,
    pending: Mutex<HashMap<RequestId, (u64, CancellationToken)>>,
}

impl Session {
    /// Take ownership of `channel` and start watching it for disconnect.
    pub(crate) fn open(
        id: SessionId,
        namespace: impl Into<String>,
        client_id: impl Into<String>,
        channel: Arc<dyn DuplexChannel>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            id,
            namespace: namespace.into(),
            client_id: client_id.into(),
            channel,
            cancel: CancellationToken::new(),
            aborted: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        });

        let channel = session.channel.clone();
        let cancel = session.cancel.clone();
        let id = session.id;
        tokio::spawn(async move {
            tokio::select! {
                _ = channel.closed() => {
                    log::debug!("session: disconnected id={} channel={}", id, channel.name());
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
            channel.close();
        });

        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Connection id the client put in its control-channel name.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.channel.metadata().peer
    }

    pub fn channel_name(&self) -> &str {
        self.channel.name()
    }

    pub(crate) fn channel(&self) -> &Arc<dyn DuplexChannel> {
        &self.channel
    }

    pub fn state(&self) -> SessionState {
        if self.cancel.is_cancelled() {
            SessionState::Aborted
        } else {
            SessionState::Active
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// A handle to the session-wide cancellation signal.
    pub fn cancel_signal(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Tear the session down: cancel all work and close the channel so the
    /// peer sees a disconnect. Repeated calls do nothing.
    pub fn abort(&self) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("session: abort id={} peer={}", self.id, self.identity());
        self.cancel.cancel();
        self.channel.close();
    }

    /// Register an inbound request. `None` if `request_id` is still outstanding.
    pub fn begin_request(&self, request_id: &RequestId) -> Option<RequestTicket> {
        let mut pending = self.pending.lock().ok()?;
        if pending.contains_key(request_id) {
            return None;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        pending.insert(request_id.clone(), (seq, cancel.clone()));
        Some(RequestTicket {
            request_id: request_id.clone(),
            seq,
            cancel,
        })
    }

    /// Release the ticket's request id. A later request that reused the id
    /// is left alone.
    pub fn finish_request(&self, ticket: &RequestTicket) {
        if let Ok(mut pending) = self.pending.lock() {
            if matches!(pending.get(&ticket.request_id), Some((seq, _)) if *seq == ticket.seq) {
                pending.remove(&ticket.request_id);
            }
        }
    }

    /// Cancel one outstanding request at the client's asking.
    pub(crate) fn abort_request(&self, request_id: &RequestId) -> bool {
        let entry = self.pending.lock().ok().and_then(|mut pending| pending.remove(request_id));
        match entry {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    pub(crate) fn decode(message: Payload) -> Result<ClientEnvelope, serde_json::Error> {
        serde_json::from_value(message)
    }

    /// Post a response on the control channel.
    pub(crate) async fn post(&self, response: &ResponseEnvelope) -> Result<(), ChannelError> {
        let message = serde_json::to_value(response)?;
        self.channel.send(message).await
    }

    /// [`post`](Self::post), logging instead of failing. A peer that already
    /// left is not an error. Returns whether the response went out.
    pub(crate) async fn respond(&self, response: &ResponseEnvelope) -> bool {
        match self.post(response).await {
            Ok(()) => true,
            Err(err) if err.is_disconnect() => {
                log::debug!(
                    "session: response dropped id={} request={} (disconnected)",
                    self.id,
                    response.request_id
                );
                false
            }
            Err(err) => {
                log::warn!(
                    "session: response failed id={} request={} err={}",
                    self.id,
                    response.request_id,
                    err
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", self.identity())
            .field("channel", &self.channel.name())
            .field("state", &self.state())
            .finish()
    }
}
