//! Types shared by the connection manager, the throttle and the order book.

use std::fmt::{Display, Formatter};
use rust_decimal::prelude::*;
use serde::Serialize;
use thiserror::Error;


/// Side of a trading book.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub enum Side {
    /// Buy side, prices ordered from the higher.
    Bids,
    /// Sell side, prices ordered from the lower.
    Asks,
}

impl Display for Side {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Bids => write!(f, "bids"),
            Side::Asks => write!(f, "asks"),
        }
    }
}

/// A price level of one side of a trading book.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Level {
    pub price: Decimal,
    pub amount: Decimal,
}

impl Level {
    pub fn new(price: Decimal, amount: Decimal) -> Level {
        Level { price, amount }
    }

    /// Build a level from its textual representation, as exchanges usually send it.
    ///
    /// # Returns
    ///
    /// [None](None) if either field is not a decimal number.
    pub fn from_strs(price_str: &str, amount_str: &str) -> Option<Level> {
        Some(Level {
            price: Decimal::from_str(price_str).ok()?,
            amount: Decimal::from_str(amount_str).ok()?,
        })
    }
}

/// Transport-neutral frame exchanged over a duplex connection.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl Frame {
    /// Serialize a message to a text frame.
    ///
    /// # Arguments
    ///
    /// * `message` - Any serializable value, typically a subscription request.
    pub fn json<T: Serialize + ?Sized>(message: &T) -> Result<Frame> {
        serde_json::to_string(message)
            .map(Frame::Text)
            .map_err(|error| StreamError::Config(format!("cannot serialize frame: {}", error)))
    }

    /// Control frames are never paced by the outbound throttle.
    pub fn is_control(&self) -> bool {
        matches!(self, Frame::Ping(_) | Frame::Pong(_) | Frame::Close)
    }
}

/// Failure conditions delivered to waiters.
///
/// Errors are cloned to every waiter registered on a failing connection,
/// hence the owned string payloads.
#[derive(Error, PartialEq, Eq, Clone, Debug)]
pub enum StreamError {
    /// The transport failed or closed unexpectedly. Retrying may succeed.
    #[error("network error: {0}")]
    Network(String),
    /// The connection was closed on purpose. Callers should stop retrying.
    #[error("connection closed by user")]
    ClosedByUser,
    /// The throttle queue was full when the permit was requested.
    #[error("throttle backlog exceeded ({queued} queued, max {max})")]
    BacklogExceeded { queued: usize, max: usize },
    /// A rejection produced by an exchange adapter for a given message hash.
    #[error("exchange error: {0}")]
    Exchange(String),
    /// No adapter registered under the identifier.
    #[error("unknown adapter '{0}'")]
    UnknownAdapter(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StreamError {
    pub fn is_closed_by_user(&self) -> bool {
        matches!(self, StreamError::ClosedByUser)
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
