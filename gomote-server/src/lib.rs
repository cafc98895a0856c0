//! gomote server front door.
//!
//! One TCP listener carries both the gomote RPC service (cleartext HTTP/2)
//! and a plain-HTTP status page. [`mux`] routes each request by protocol
//! version and content type; [`bootstrap`] wires the listener, the RPC auth
//! policy, the auxiliary clients and the SSH subsystem together in order.

pub mod bootstrap;
pub mod cli;
pub mod clients;
pub mod error;
pub mod mux;
pub mod rpc;
pub mod serve;
pub mod service;
pub mod status;
