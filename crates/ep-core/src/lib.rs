//! Core runtime of the proxy pool server: shared member state, the node
//! supervisor, selection strategies, the dispatch frontends (pool,
//! multi-port, virtual pools) and the management API.
//!
//! Transports are not implemented here. The [`outbound`] module defines the
//! adapter seam that turns a node URI into an actual tunnel; the core only
//! dials through it.

pub mod api;
pub mod inbound;
pub mod member;
pub mod monitor;
pub mod outbound;
pub mod select;
pub mod vpool;

pub use inbound::{MultiPortManager, PoolFrontend};
pub use member::{ActiveGuard, MemberRegistry, MemberState};
pub use monitor::{tag_of, Monitor, MonitorConfig, Snapshot};
pub use outbound::{ConnectorFactory, DefaultConnectorFactory, OutboundConnector};
pub use select::{Selector, Strategy, WeightParams};
pub use vpool::{VirtualPool, VirtualPoolManager};
