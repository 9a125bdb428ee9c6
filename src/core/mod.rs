//! Acquisition core: connections, dispatch, scheduling, parsing, change
//! tracking and the rule engine

pub mod connection;
pub mod dispatch;
pub mod events;
pub mod manager;
pub mod parser;
pub mod poller;
pub mod rules;
pub mod tracker;

pub use connection::{Connection, LinkState};
pub use dispatch::{DispatcherHandle, RequestKind, Response};
pub use events::{DataAcquired, DataParsed, ParamChanged, ParameterSample, Value};
pub use manager::ConnectionManager;
pub use tracker::ChangeTracker;
