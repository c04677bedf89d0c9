//! Seams between the connection manager and the outside world: the transport
//! used to reach an exchange, and the exchange-specific frame handler.

use std::pin::Pin;
use log::{debug, info};
use futures::future::{self, BoxFuture};
use futures::prelude::*;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::protocol::Message};

use crate::client::Client;
use crate::core::*;


/// Outbound half of a transport.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = StreamError> + Send>>;

/// Inbound half of a transport. Items arrive in the order the peer sent them.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;

/// An established duplex connection.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens transports. One call per physical connection.
pub trait Connector: Send + Sync + 'static {
    /// Perform the handshake with `url`.
    ///
    /// # Returns
    ///
    /// The connected [Transport](Transport), or a [Network](StreamError::Network)
    /// error if the handshake failed.
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport>>;
}

/// Exchange-specific behavior plugged into a [Client](Client).
///
/// The handler decodes inbound frames and routes them back to the waiters with
/// [Client::resolve](Client::resolve) and [Client::reject](Client::reject), passing
/// along the `url` the frame arrived on. It is called from the inbound loop of the connection, one frame at a time, in
/// arrival order, so it must not block.
pub trait FrameHandler<V>: Send + Sync + 'static {
    fn on_frame(&self, client: &Client<V>, url: &str, frame: Frame);

    fn on_open(&self, _client: &Client<V>, _url: &str) {}

    /// Called once the connection is gone and its waiters have been rejected.
    fn on_close(&self, _client: &Client<V>, _url: &str, _reason: &StreamError) {}

    /// Liveness probe sent every keepalive interval.
    fn keepalive_frame(&self) -> Frame {
        Frame::Ping(vec![])
    }
}

fn network_error(error: tungstenite::Error) -> StreamError {
    StreamError::Network(error.to_string())
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        }
    }
}

/// Conversion of a WebSocket message, raw frames have no counterpart.
fn read_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text)),
        Message::Binary(data) => Some(Frame::Binary(data)),
        Message::Ping(data) => Some(Frame::Ping(data)),
        Message::Pong(data) => Some(Frame::Pong(data)),
        Message::Close(close_frame) => {
            debug!("Received close frame {:?}", close_frame);
            Some(Frame::Close)
        }
        Message::Frame(_) => None,
    }
}

/// WebSocket [Connector](Connector), with TLS support.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport>> {
        let ws_url = url.to_string();
        Box::pin(async move {
            info!("Connecting to WebSocket: {}", &ws_url);
            let (ws, response) = connect_async(ws_url.as_str()).await.map_err(network_error)?;
            debug!("Connection {:?}", response);
            let (sink, stream) = ws.split();
            let sink = sink
                .sink_map_err(network_error)
                .with(|frame: Frame| future::ready(Ok::<Message, StreamError>(frame.into())));
            let stream = stream.filter_map(|message| future::ready(match message {
                Ok(message) => read_message(message).map(Ok),
                Err(error) => Some(Err(network_error(error))),
            }));
            Ok(Transport { sink: Box::pin(sink), stream: Box::pin(stream) })
        })
    }
}
