//! AMQP client wrapper for the fan-out gateway.
//!
//! Owns the broker connection and channel for one gateway instance and
//! manages the header bindings that route messages into its private queue.

pub mod client;

pub use client::{binding_arguments, AmqpClient, AmqpConfig, BindingSet, DEFAULT_PREFETCH_COUNT};
pub use lapin::Consumer;
