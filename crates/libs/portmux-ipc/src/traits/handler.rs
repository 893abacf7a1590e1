use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::types::Payload;

/// A server-streaming result. Values are forwarded in production order.
pub type PayloadStream = BoxStream<'static, Result<Payload, HandlerError>>;

/// What a handler produced for one request.
pub enum HandlerOutput {
    Unary(Payload),
    Stream(PayloadStream),
}

impl std::fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unary(payload) => f.debug_tuple("Unary").field(payload).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// The application entry point every accepted request is handed to.
///
/// Long-running work must watch `cancel`: it fires when the client aborts the
/// request, the channel disconnects, or the session is revoked.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn handle(
        &self,
        request: Payload,
        cancel: CancellationToken,
    ) -> Result<HandlerOutput, HandlerError>;
}

/// Adapter returned by [`handler_fn`].
pub struct HandlerFn<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a [`ChannelHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F, Fut>
where
    F: Fn(Payload, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
{
    HandlerFn {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> ChannelHandler for HandlerFn<F, Fut>
where
    F: Fn(Payload, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        request: Payload,
        cancel: CancellationToken,
    ) -> Result<HandlerOutput, HandlerError> {
        (self.f)(request, cancel).await
    }
}
