use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use portmux_ipc::{
    ChannelHandler, ClientEnvelope, ErrorCode, ErrorPayload, HandlerOutput, Payload,
    ResponseEnvelope,
};
use tokio::task::JoinSet;

use crate::promoter::StreamPromoter;
use crate::session::{RequestTicket, Session};

/// Per-session message loop: decode envelopes, call the handler, reply.
///
/// Each request runs in its own task, so a slow call never holds up the
/// others and replies may leave in any order.
pub struct Dispatcher {
    handler: Arc<dyn ChannelHandler>,
    promoter: Arc<StreamPromoter>,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn ChannelHandler>, promoter: Arc<StreamPromoter>) -> Self {
        Self { handler, promoter }
    }

    /// Serve `session` until it is cancelled or its channel disconnects.
    ///
    /// Requests still running when the loop ends are left to observe their
    /// cancellation tokens.
    pub async fn run(self: Arc<Self>, session: Arc<Session>) {
        let cancel = session.cancel_signal();
        let mut tasks = JoinSet::new();
        log::debug!(
            "dispatcher: start session={} channel={}",
            session.id(),
            session.channel_name()
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        log::error!(
                            "dispatcher: request task failed session={} err={}",
                            session.id(),
                            err
                        );
                    }
                }
                message = session.channel().recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    match Session::decode(message) {
                        Ok(ClientEnvelope::Request(request)) => {
                            let Some(ticket) = session.begin_request(&request.request_id) else {
                                log::warn!(
                                    "dispatcher: duplicate request dropped session={} request={}",
                                    session.id(),
                                    request.request_id
                                );
                                continue;
                            };
                            let this = self.clone();
                            let session = session.clone();
                            let message = request.message;
                            tasks.spawn(async move { this.serve(&session, ticket, message).await });
                        }
                        Ok(ClientEnvelope::Abort(abort)) => {
                            if abort.abort && session.abort_request(&abort.request_id) {
                                log::debug!(
                                    "dispatcher: request aborted by client session={} request={}",
                                    session.id(),
                                    abort.request_id
                                );
                            }
                        }
                        Err(err) => {
                            log::warn!(
                                "dispatcher: malformed envelope session={} err={}",
                                session.id(),
                                err
                            );
                        }
                    }
                }
            }
        }

        log::debug!(
            "dispatcher: stop session={} in_flight={}",
            session.id(),
            session.pending_requests()
        );
        tasks.detach_all();
    }

    async fn serve(&self, session: &Session, ticket: RequestTicket, message: Payload) {
        let request_id = ticket.request_id().clone();
        let invocation =
            AssertUnwindSafe(self.handler.handle(message, ticket.cancel_signal())).catch_unwind();

        let response = match invocation.await {
            Ok(Ok(HandlerOutput::Unary(value))) => {
                ResponseEnvelope::message(request_id.clone(), value)
            }
            Ok(Ok(HandlerOutput::Stream(stream))) => {
                self.promoter.promote(session, ticket, stream).await;
                return;
            }
            Ok(Err(err)) => {
                log::debug!(
                    "dispatcher: handler error session={} request={} err={}",
                    session.id(),
                    request_id,
                    err
                );
                ResponseEnvelope::error(request_id.clone(), ErrorPayload::from_handler_error(&err))
            }
            Err(_) => {
                log::error!(
                    "dispatcher: handler panicked session={} request={}",
                    session.id(),
                    request_id
                );
                ResponseEnvelope::error(
                    request_id.clone(),
                    ErrorPayload::new(ErrorCode::Internal, "handler panicked"),
                )
            }
        };

        // Free the id first: the client may reuse it as soon as it sees the reply.
        session.finish_request(&ticket);
        session.respond(&response).await;
    }
}
