pub mod core;
pub mod completion;
pub mod config;
pub mod throttle;
pub mod orderbook;
pub mod exchange;
pub mod client;
pub mod registry;

pub use crate::client::{Client, ConnectionState, Subscription};
pub use crate::completion::{race, Completion};
pub use crate::config::{ClientConfig, ThrottleConfig};
pub use crate::core::{Frame, Level, Result, Side, StreamError};
pub use crate::exchange::{Connector, FrameHandler, Transport, WsConnector};
pub use crate::orderbook::{BookDelta, DeltaOperation, OrderBook, OrderBookSnapshot};
pub use crate::registry::AdapterRegistry;
pub use crate::throttle::Throttle;
