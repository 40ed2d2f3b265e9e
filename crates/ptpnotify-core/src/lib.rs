//! # ptpnotify-core
//!
//! Shared data model for the ptpnotify sidecar: the CloudEvent payload
//! types emitted for PTP synchronization events, the message type carried
//! by the in-process event bus, publisher/subscription records, and the
//! disk-backed store that persists them.
//!
//! The daemon crate (`ptpnotify-daemon`) builds the event engine, bus
//! dispatchers and transport plugins on top of these types; external
//! consumers only ever see the JSON shapes defined here.
//!
//! ## Example
//!
//! ```rust
//! use ptpnotify_core::event::{Event, EventData, EventType, SyncState};
//!
//! let data = EventData::state_and_metric("/cluster/node/worker-0/sync/ptp-status", SyncState::Locked, 42);
//! let event = Event::new(EventType::PtpStateChange, "/cluster/node/worker-0/sync/ptp-status", data);
//! assert_eq!(event.data.values.len(), 2);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod channel;
pub mod event;
pub mod pubsub;
pub mod resource;
pub mod store;

pub use channel::{ChannelStatus, ChannelType, DataChan};
pub use event::{DataValue, Event, EventData, EventType, SyncState};
pub use pubsub::PubSub;
pub use resource::ResourceTemplate;
pub use store::{PubSubStore, StoreKind};
