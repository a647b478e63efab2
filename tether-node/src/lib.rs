//! # tether-node: reliable peer relay
//!
//! Keeps a [`ReliableConnection`](tether_core::ReliableConnection) to
//! every configured peer over TCP, adopts sessions that peers dial in on,
//! and relays input lines to all of them with acknowledged delivery.
//!
//! Connections that lose their transport reconnect on their own; a peer
//! that stays away long enough to exhaust its retries is picked up again
//! as soon as it dials back in.

pub mod config;
pub mod node;
