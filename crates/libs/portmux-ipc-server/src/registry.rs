//! The process-wide table of live sessions, and the connection listener that
//! fills it.
//!
//! # Lifecycle
//!
//! [`Registry::init`] creates the registry for a namespace on first call and
//! returns the same `Arc` on every later call with the same parameters.
//! [`Registry::get`] looks an initialized registry up without creating one.
//! Hand the `Arc` to whatever needs it; nothing else in the crate reaches for
//! global state. [`Registry::new`] builds a private, unregistered instance.
//!
//! Sessions register themselves when accepted and drop out as soon as their
//! cancellation token fires, whether from a disconnect or an abort.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use portmux_ipc::{ChannelHandler, DuplexChannel, PeerIdentity, Transport};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::naming::{ChannelName, Purpose};
use crate::promoter::StreamPromoter;
use crate::session::{Session, SessionId};
use crate::trust::{ApprovalPolicy, TrustValidator, Verdict};

static REGISTRIES: OnceLock<Mutex<HashMap<String, Arc<Registry>>>> = OnceLock::new();

fn registries() -> MutexGuard<'static, HashMap<String, Arc<Registry>>> {
    REGISTRIES
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<PeerIdentity, HashMap<SessionId, Arc<Session>>>,
    /// Control-channel ids in use, including connections awaiting approval.
    client_ids: HashSet<String>,
    awaiting: HashMap<u64, (PeerIdentity, CancellationToken)>,
}

pub struct Registry {
    namespace: String,
    handler: Arc<dyn ChannelHandler>,
    validator: TrustValidator,
    config: ServerConfig,
    next_id: AtomicU64,
    tables: Mutex<Tables>,
}

impl Registry {
    /// Build a registry that is not entered in the process-wide table.
    pub fn new(
        namespace: &str,
        handler: Arc<dyn ChannelHandler>,
        trust_policy: Option<Arc<dyn ApprovalPolicy>>,
        config: ServerConfig,
    ) -> Result<Arc<Self>, ServerError> {
        // Reject namespaces that cannot appear in a channel name.
        ChannelName::new(namespace, Purpose::Control, None)?;
        Ok(Arc::new(Self {
            namespace: namespace.to_string(),
            handler,
            validator: TrustValidator::new(&config, trust_policy),
            config,
            next_id: AtomicU64::new(1),
            tables: Mutex::new(Tables::default()),
        }))
    }

    /// Initialize the registry for `namespace`, or return the existing one.
    pub fn init(
        namespace: &str,
        handler: Arc<dyn ChannelHandler>,
        trust_policy: Option<Arc<dyn ApprovalPolicy>>,
    ) -> Result<Arc<Self>, ServerError> {
        Self::init_with_config(namespace, handler, trust_policy, ServerConfig::default())
    }

    /// [`init`](Self::init) with explicit configuration.
    ///
    /// Fails with [`ServerError::InitMismatch`] if the namespace is already
    /// initialized with a different handler, policy, or config.
    pub fn init_with_config(
        namespace: &str,
        handler: Arc<dyn ChannelHandler>,
        trust_policy: Option<Arc<dyn ApprovalPolicy>>,
        config: ServerConfig,
    ) -> Result<Arc<Self>, ServerError> {
        let mut registries = registries();
        if let Some(existing) = registries.get(namespace) {
            if !same_arc(&existing.handler, &handler)
                || !same_policy(existing.validator.policy(), trust_policy.as_ref())
                || existing.config != config
            {
                return Err(ServerError::init_mismatch(namespace));
            }
            return Ok(existing.clone());
        }

        let registry = Self::new(namespace, handler, trust_policy, config)?;
        registries.insert(namespace.to_string(), registry.clone());
        log::info!("registry: initialized namespace={}", namespace);
        Ok(registry)
    }

    /// The registry previously initialized for `namespace`.
    pub fn get(namespace: &str) -> Option<Arc<Self>> {
        registries().get(namespace).cloned()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatcher for sessions whose streams are offered through `transport`.
    pub fn dispatcher(&self, transport: Arc<dyn Transport>) -> Arc<Dispatcher> {
        let promoter = StreamPromoter::new(transport, self.config.stream_idle_timeout());
        Arc::new(Dispatcher::new(self.handler.clone(), Arc::new(promoter)))
    }

    /// Accept connections from `transport` until it shuts down.
    pub async fn serve(self: Arc<Self>, transport: Arc<dyn Transport>) {
        let dispatcher = self.dispatcher(transport.clone());
        log::info!("registry: listening namespace={}", self.namespace);
        while let Some(channel) = transport.accept().await {
            self.accept(channel, &dispatcher);
        }
        log::info!("registry: transport closed namespace={}", self.namespace);
    }

    /// Screen one inbound connection and, if it passes, start a session on it.
    ///
    /// Connections that are not control channels for this namespace, reuse a
    /// live connection id, or fail validation are closed without a word.
    pub fn accept(self: &Arc<Self>, channel: Arc<dyn DuplexChannel>, dispatcher: &Arc<Dispatcher>) {
        let Some(client_id) = self.control_id(channel.name()) else {
            log::debug!("registry: ignoring channel={}", channel.name());
            channel.close();
            return;
        };

        if !self.tables().client_ids.insert(client_id.clone()) {
            log::warn!("registry: connection id collision channel={}", channel.name());
            channel.close();
            return;
        }

        let metadata = channel.metadata().clone();
        match self.validator.validate(&metadata) {
            Some(Verdict::Accept) => self.establish(channel, client_id, dispatcher, None),
            Some(Verdict::Reject) => self.reject(channel, &client_id),
            None => self.await_approval(channel, client_id, dispatcher.clone()),
        }
    }

    fn control_id(&self, name: &str) -> Option<String> {
        let name = ChannelName::parse(name).ok()?;
        if name.namespace() != self.namespace || name.purpose() != Purpose::Control {
            return None;
        }
        name.discriminator().map(|discriminator| discriminator.to_string())
    }

    fn await_approval(
        self: &Arc<Self>,
        channel: Arc<dyn DuplexChannel>,
        client_id: String,
        dispatcher: Arc<Dispatcher>,
    ) {
        let ticket = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let peer = channel.metadata().peer.clone();
        self.tables().awaiting.insert(ticket, (peer.clone(), cancel.clone()));
        log::debug!("registry: awaiting approval peer={} channel={}", peer, channel.name());

        let registry = self.clone();
        tokio::spawn(async move {
            let metadata = channel.metadata().clone();
            let verdict = tokio::select! {
                _ = channel.closed() => None,
                verdict = registry.validator.validate_async(&metadata, &cancel) => Some(verdict),
            };

            match verdict {
                Some(Verdict::Accept) if !channel.is_closed() => {
                    registry.establish(channel, client_id, &dispatcher, Some(ticket));
                }
                verdict => {
                    registry.tables().awaiting.remove(&ticket);
                    if verdict.is_none() {
                        log::debug!("registry: peer left before approval peer={}", peer);
                    }
                    registry.reject(channel, &client_id);
                }
            }
        });
    }

    fn reject(&self, channel: Arc<dyn DuplexChannel>, client_id: &str) {
        log::info!(
            "registry: rejected peer={} channel={}",
            channel.metadata().peer,
            channel.name()
        );
        self.tables().client_ids.remove(client_id);
        channel.close();
    }

    /// Register a session on `channel` and start serving it.
    ///
    /// With an approval `ticket`, retiring the ticket and registering the
    /// session happen under one lock, so a [`kill_origin`](Self::kill_origin)
    /// either cancels the ticket first or finds the session.
    fn establish(
        self: &Arc<Self>,
        channel: Arc<dyn DuplexChannel>,
        client_id: String,
        dispatcher: &Arc<Dispatcher>,
        ticket: Option<u64>,
    ) {
        let session = {
            let mut tables = self.tables();
            if let Some(ticket) = ticket {
                let revoked = match tables.awaiting.remove(&ticket) {
                    Some((_, cancel)) => cancel.is_cancelled(),
                    None => true,
                };
                if revoked {
                    drop(tables);
                    self.reject(channel, &client_id);
                    return;
                }
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let session = Session::open(id, self.namespace.clone(), client_id, channel);
            tables
                .sessions
                .entry(session.identity().clone())
                .or_default()
                .insert(id, session.clone());
            session
        };
        let id = session.id();
        log::info!(
            "registry: session open id={} peer={} channel={}",
            id,
            session.identity(),
            session.channel_name()
        );

        let registry = self.clone();
        let watched = session.clone();
        tokio::spawn(async move {
            watched.cancelled().await;
            registry.remove(&watched);
        });

        tokio::spawn(dispatcher.clone().run(session));
    }

    fn remove(&self, session: &Session) {
        let mut tables = self.tables();
        if let Some(by_id) = tables.sessions.get_mut(session.identity()) {
            by_id.remove(&session.id());
            if by_id.is_empty() {
                tables.sessions.remove(session.identity());
            }
        }
        tables.client_ids.remove(session.client_id());
        log::info!("registry: session closed id={} peer={}", session.id(), session.identity());
    }

    /// Abort every session from `origin`, and drop its connections still
    /// awaiting approval. Later connections are unaffected.
    ///
    /// Returns the identities that were cut off.
    pub fn kill_origin(&self, origin: &str) -> Vec<PeerIdentity> {
        let mut killed = HashSet::new();
        let sessions: Vec<Arc<Session>> = {
            let tables = self.tables();
            // Pending approvals are revoked under the same lock `establish`
            // takes to retire them.
            for (identity, cancel) in tables.awaiting.values() {
                if identity.origin == origin {
                    cancel.cancel();
                    killed.insert(identity.clone());
                }
            }
            tables
                .sessions
                .iter()
                .filter(|(identity, _)| identity.origin == origin)
                .flat_map(|(_, by_id)| by_id.values().cloned())
                .collect()
        };

        for session in sessions {
            session.abort();
            killed.insert(session.identity().clone());
        }
        if !killed.is_empty() {
            log::info!("registry: killed origin={} identities={}", origin, killed.len());
        }
        killed.into_iter().collect()
    }

    /// Abort every session registered for exactly `identity`.
    pub fn kill_identity(&self, identity: &PeerIdentity) -> usize {
        let sessions = self.sessions_for(identity);
        for session in &sessions {
            session.abort();
        }
        sessions.len()
    }

    /// Abort every session in the registry.
    pub fn abort_all(&self) {
        for session in self.sessions() {
            session.abort();
        }
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.tables().sessions.values().flat_map(|by_id| by_id.values().cloned()).collect()
    }

    pub fn sessions_for(&self, identity: &PeerIdentity) -> Vec<Arc<Session>> {
        self.tables()
            .sessions
            .get(identity)
            .map(|by_id| by_id.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tables().sessions.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Connections waiting on the approval policy.
    pub fn awaiting_approval(&self) -> usize {
        self.tables().awaiting.len()
    }
}

fn same_arc<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn same_policy(a: Option<&Arc<dyn ApprovalPolicy>>, b: Option<&Arc<dyn ApprovalPolicy>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => same_arc(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("namespace", &self.namespace)
            .field("sessions", &self.len())
            .finish()
    }
}
