//! Request-processing data plane for the l8e-harbor reverse proxy.
//!
//! An inbound request flows: [`router::Router`] match → [`pipeline`]
//! pre-request → [`retry::RetryEngine`] driving [`selector::Selector`] →
//! [`circuit_breaker::CircuitBreaker`] → [`forwarder::Forwarder`] →
//! pipeline post-response. [`route_store`] publishes the immutable
//! [`model::Snapshot`]s the router compiles from; [`health`] runs
//! independently of request traffic. [`context::GatewayContext`] wires all
//! of it together without global singletons.

pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod error;
pub mod forwarder;
pub mod handlers;
pub mod health;
pub mod logging;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod retry;
pub mod route_store;
pub mod router;
pub mod selector;
