//! RPC serving and gateway framework.
//!
//! A [`rpc::Server`] exposes registered services over a binary framed
//! protocol, newline-delimited JSON-RPC and an HTTP bridge, and drains all
//! three together on shutdown. A [`gateway::Gateway`] routes HTTP calls to
//! backend servers by service name.

pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod rpc;
pub mod web;
