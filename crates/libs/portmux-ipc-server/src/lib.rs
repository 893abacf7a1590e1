//! Session layer multiplexing RPC calls over named duplex channels.
//!
//! A [`Registry`] listens on a [`Transport`](portmux_ipc::Transport). Each
//! inbound control channel is screened by the [`TrustValidator`]; accepted
//! peers get a [`Session`] whose [`Dispatcher`] feeds envelopes to the
//! application's [`ChannelHandler`](portmux_ipc::ChannelHandler). Streaming
//! results are moved to their own channel by the [`StreamPromoter`].
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use portmux_ipc::{handler_fn, HandlerError, HandlerOutput, memory::MemoryTransport};
//! # use portmux_ipc_server::Registry;
//! # async fn run() -> Result<(), portmux_ipc_server::ServerError> {
//! let handler = Arc::new(handler_fn(|request, _cancel| async move {
//!     Ok::<_, HandlerError>(HandlerOutput::Unary(request))
//! }));
//! let registry = Registry::init("echo", handler, None)?;
//! let transport = Arc::new(MemoryTransport::new("chrome-extension://echo"));
//! tokio::spawn(registry.serve(transport));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod naming;
pub mod promoter;
pub mod registry;
pub mod session;
pub mod trust;

pub use config::ServerConfig;
pub use dispatcher::Dispatcher;
pub use error::{NamingError, ServerError};
pub use naming::{ChannelName, Discriminator, Purpose};
pub use promoter::{StreamOutcome, StreamPromoter};
pub use registry::Registry;
pub use session::{RequestTicket, Session, SessionId, SessionState};
pub use trust::{ApprovalPolicy, DenyAll, TrustValidator, Verdict};
