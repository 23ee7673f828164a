//! Leader-routed access to a consensus group.
//!
//! [`ConsensusRoutedClient`] sends mutating requests to the group leader it finds in a
//! [`RouteViewRegistry`], follows a single redirect hop when leadership has moved, and
//! keeps the route view fresh from connection and leader-change signals.

pub mod client;
pub mod executor;
pub mod in_memory;
pub mod lifecycle;
pub mod provider;
pub mod route_view;

pub use client::ConsensusRoutedClient;
pub use executor::{TaskExecutor, TaskHandle, TokioTaskExecutor};
pub use in_memory::InMemoryConsensusGroup;
pub use lifecycle::{LifecycleGuard, LifecycleState};
pub use provider::{
    ConnectionEvent, ConnectionEventKind, ConnectionEventListener, ConsensusProvider,
    ConsensusRequest, ConsensusResponse, ConsensusTransport, LeaderChangeListener,
};
pub use route_view::{RouteView, RouteViewRegistry};
