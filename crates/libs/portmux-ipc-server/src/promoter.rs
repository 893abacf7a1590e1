//! Moving a server-streaming result onto its own channel.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use portmux_ipc::{
    DuplexChannel, ErrorCode, ErrorPayload, IpcError, PayloadStream, ResponseEnvelope, StreamFrame,
    Transport,
};
use tokio_util::sync::CancellationToken;

use crate::naming::ChannelName;
use crate::session::{RequestTicket, Session};

const MAX_NAME_ATTEMPTS: usize = 8;

/// How a forwarding loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// A terminal frame (`done` or `error`) was delivered.
    Finished,
    /// The request or session was cancelled; no terminal frame was sent.
    Canceled,
    /// The consumer closed the stream channel.
    ConsumerGone,
    /// The stream channel could not be set up; an error response was sent instead.
    NotOpened,
}

pub struct StreamPromoter {
    transport: Arc<dyn Transport>,
    idle_timeout: Option<Duration>,
    live: Mutex<HashSet<String>>,
}

impl StreamPromoter {
    pub fn new(transport: Arc<dyn Transport>, idle_timeout: Option<Duration>) -> Self {
        Self {
            transport,
            idle_timeout,
            live: Mutex::new(HashSet::new()),
        }
    }

    /// Number of stream channels currently open.
    pub fn live_streams(&self) -> usize {
        self.live.lock().map(|live| live.len()).unwrap_or(0)
    }

    /// Announce a stream channel for the ticket's request on the session
    /// channel and forward `stream` onto it. Returns once the stream is over.
    ///
    /// The announcement (or the error sent instead) is the request's only
    /// response, so the ticket is released before it goes out. The stream
    /// stays bound to the ticket's cancel signal and the session's teardown.
    pub async fn promote(
        &self,
        session: &Session,
        ticket: RequestTicket,
        stream: PayloadStream,
    ) -> StreamOutcome {
        let request_id = ticket.request_id().clone();
        let cancel = ticket.cancel_signal();
        let name = match self.allocate(session.namespace()) {
            Some(name) => name,
            None => {
                let error =
                    ErrorPayload::new(ErrorCode::Internal, "no stream channel name available");
                session.finish_request(&ticket);
                session.respond(&ResponseEnvelope::error(request_id, error)).await;
                return StreamOutcome::NotOpened;
            }
        };

        let channel = match self.transport.open(&name, session.identity()).await {
            Ok(channel) => channel,
            Err(err) => {
                log::warn!("promoter: open failed channel={} err={}", name, err);
                self.release(&name);
                let error = ErrorPayload::new(ErrorCode::Unavailable, err.to_string());
                session.finish_request(&ticket);
                session.respond(&ResponseEnvelope::error(request_id, error)).await;
                return StreamOutcome::NotOpened;
            }
        };

        session.finish_request(&ticket);
        let announcement = ResponseEnvelope::channel(request_id.clone(), name.clone());
        let outcome = if session.respond(&announcement).await {
            log::debug!(
                "promoter: stream open session={} request={} channel={}",
                session.id(),
                request_id,
                name
            );
            self.pump(channel.as_ref(), stream, &cancel).await
        } else {
            StreamOutcome::Canceled
        };

        log::debug!("promoter: stream closed channel={} outcome={:?}", name, outcome);
        channel.close();
        self.release(&name);
        outcome
    }

    fn allocate(&self, namespace: &str) -> Option<String> {
        let mut live = self.live.lock().ok()?;
        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = match ChannelName::fresh_stream(namespace) {
                Ok(name) => name.to_string(),
                Err(err) => {
                    log::warn!("promoter: cannot name stream namespace={} err={}", namespace, err);
                    return None;
                }
            };
            if live.insert(name.clone()) {
                return Some(name);
            }
        }
        None
    }

    fn release(&self, name: &str) {
        if let Ok(mut live) = self.live.lock() {
            live.remove(name);
        }
    }

    async fn pump(
        &self,
        channel: &dyn DuplexChannel,
        mut stream: PayloadStream,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamOutcome::Canceled,
                _ = channel.closed() => return StreamOutcome::ConsumerGone,
                next = next_item(&mut stream, self.idle_timeout) => next,
            };

            let frame = match next {
                Ok(Some(Ok(value))) => StreamFrame::value(value),
                Ok(Some(Err(err))) => StreamFrame::error(ErrorPayload::from_handler_error(&err)),
                Ok(None) => StreamFrame::done(),
                Err(_) => StreamFrame::error(IpcError::deadline_exceeded("stream idle").into()),
            };
            let terminal = frame.is_terminal();
            let message = match serde_json::to_value(&frame) {
                Ok(message) => message,
                Err(err) => {
                    let error = ErrorPayload::new(ErrorCode::Internal, err.to_string());
                    serde_json::json!({ "error": error })
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamOutcome::Canceled,
                sent = channel.send(message) => {
                    if sent.is_err() {
                        return StreamOutcome::ConsumerGone;
                    }
                }
            }
            if terminal {
                return StreamOutcome::Finished;
            }
        }
    }
}

type NextItem = Option<Result<portmux_ipc::Payload, portmux_ipc::HandlerError>>;

async fn next_item(
    stream: &mut PayloadStream,
    idle_timeout: Option<Duration>,
) -> Result<NextItem, tokio::time::error::Elapsed> {
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, stream.next()).await,
        None => Ok(stream.next().await),
    }
}
