//! # ptpnotify-daemon
//!
//! The PTP event notification sidecar. It sits between the host's time
//! synchronization daemons (`ptp4l`, `phc2sys`, `ts2phc`) and a pub/sub
//! transport fabric:
//!
//! - the [`engine`] consumes typed PTP samples and configuration updates and
//!   decides which synchronization-state events to emit;
//! - the [`bus`] carries those events over two bounded channels with FIFO
//!   dispatch, bounded back-pressure and a cooperative close signal;
//! - [`transport`] plugins (AMQP or a local HTTP fabric) move bus messages
//!   on and off the wire, degrading to local-only delivery when a broker is
//!   unreachable;
//! - the [`api`] exposes publisher/subscription management and the
//!   current-state query over REST.
//!
//! State lives in three registries, [`threshold`], [`ptp4lconf`] and
//! [`stats`], each guarded by a single reader-writer lock that is never
//! held across a channel send or network call. Lock acquisition order is
//! threshold, then config, then stats.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod bus;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod ptp4lconf;
pub mod stats;
pub mod threshold;
pub mod transport;
