mod channel;
mod handler;

pub use channel::{DuplexChannel, Transport};
pub use handler::{handler_fn, ChannelHandler, HandlerFn, HandlerOutput, PayloadStream};
