//! The message type carried by the in-process event bus.
//!
//! A [`DataChan`] lives for exactly one hop: a producer (engine, REST
//! handler or transport receiver) builds it, one dispatcher consumes it.
//! Messages on the `out` channel travel towards transports and local
//! subscribers; messages on the `in` channel arrive from a transport and are
//! routed by `(address, channel_type)`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Event;

/// What a bus message is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelType {
    /// Publisher registration traffic.
    Publisher,
    /// Subscription registration traffic.
    Subscription,
    /// An event to deliver.
    Event,
    /// A status probe or acknowledgement.
    Status,
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Publisher => "PUBLISHER",
            Self::Subscription => "SUBSCRIPTION",
            Self::Event => "EVENT",
            Self::Status => "STATUS",
        };
        f.write_str(s)
    }
}

/// Delivery status attached to a bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChannelStatus {
    /// Freshly produced, not yet dispatched.
    New,
    /// Dispatch succeeded.
    Success,
    /// Dispatch failed after the retry.
    Failed,
    /// The referenced record should be removed.
    Delete,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Hook invoked by the in-dispatcher when an event arrives for the message's
/// address. Returning `false` stops further local delivery of that event.
pub type ProcessEventFn = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// A message travelling one hop through the event bus.
#[derive(Clone)]
pub struct DataChan {
    /// Resource address the message is published to.
    pub address: String,

    /// The event, when the message carries one.
    pub data: Option<Event>,

    /// Message kind.
    pub channel_type: ChannelType,

    /// Delivery status.
    pub status: ChannelStatus,

    /// Identity of the producing client.
    pub client_id: Uuid,

    /// Address to send replies to, when the producer expects one.
    pub return_address: Option<String>,

    /// Optional local consumer hook, see [`ProcessEventFn`].
    pub process_event_fn: Option<ProcessEventFn>,
}

impl DataChan {
    /// Builds a fresh outbound event message.
    #[must_use]
    pub fn event(address: impl Into<String>, event: Event) -> Self {
        Self {
            address: address.into(),
            data: Some(event),
            channel_type: ChannelType::Event,
            status: ChannelStatus::New,
            client_id: Uuid::new_v4(),
            return_address: None,
            process_event_fn: None,
        }
    }

    /// Builds a status message without a payload.
    #[must_use]
    pub fn status(address: impl Into<String>, status: ChannelStatus) -> Self {
        Self {
            address: address.into(),
            data: None,
            channel_type: ChannelType::Status,
            status,
            client_id: Uuid::new_v4(),
            return_address: None,
            process_event_fn: None,
        }
    }
}

impl fmt::Debug for DataChan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChan")
            .field("address", &self.address)
            .field("data", &self.data)
            .field("channel_type", &self.channel_type)
            .field("status", &self.status)
            .field("client_id", &self.client_id)
            .field("return_address", &self.return_address)
            .field(
                "process_event_fn",
                &self.process_event_fn.as_ref().map(|_| "<fn>"),
            )
            .finish()
    }
}
