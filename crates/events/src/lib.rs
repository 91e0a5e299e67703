//! Pub/sub glue between database writes and in-process subscribers, backed by
//! the shared redis broker.
//!
//! Two shapes: table-scoped edits (`edit_and_publish` + table watchers) and
//! generic named events. Both carry an ignore-id so a node's own subscriber
//! loop can drop the echo of its own publishes.

pub mod broker;
pub mod bus;
pub mod ignore;

pub use {
    broker::Broker,
    bus::{EventBus, GenericSubscription, TABLE_UPDATE_CHANNEL},
    ignore::IgnoreSet,
};
