//! # spcsim-mac
//!
//! Superposition-coding MAC for the SPC MAC simulator.
//!
//! This crate provides:
//! - The node entity ([`SpcNode`]) that owns a MAC and its PHY
//! - The MAC state machine ([`SpcMac`]) with RTS/CTS, SPC and no-ACK paths
//! - Power and rate allocation ([`allocator::Allocator`])
//! - The outgoing queue with same-flow aggregation ([`queue::MacQueue`])
//! - Per-neighbor path loss and traffic statistics ([`node_table::NeighborTable`])
//! - MAC parameters and derived timing ([`config`])

pub mod allocator;
pub mod config;
pub mod mac;
pub mod node;
pub mod node_table;
pub mod queue;

pub use allocator::{Allocator, BufferPlan, PowerTimeRate, StreamDemand, TimeRate};
pub use config::{MacConfig, MacTiming};
pub use mac::{MacState, PendingFrame, SendState, SpcMac};
pub use node::SpcNode;
pub use node_table::{NeighborRecord, NeighborTable};
pub use queue::{MacQueue, QueueEntry};
