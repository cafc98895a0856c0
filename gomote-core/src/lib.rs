//! Gomote Core — transport-agnostic startup policy for the gomote server.
//!
//! This library holds the decisions the server makes once at startup and then
//! treats as immutable for the rest of the process lifetime:
//!
//! - which deployment context the process runs in ([`environment`]),
//! - which authentication interceptors guard the RPC surface ([`auth`]),
//! - whether the interactive-shell subsystem may run, and with which
//!   credentials ([`shell`]).
//!
//! It also carries the collaborators those decisions need at their boundary:
//! secret access, the instance metadata substrate, the remote-session pool and
//! scheduler, plus the telemetry initialisation shared by every binary.
//!
//! The HTTP transport that serves the primary listener lives in the
//! `gomote-server` crate.

pub mod auth;
pub mod config;
pub mod environment;
pub mod remote;
pub mod secret;
pub mod shell;
pub mod telemetry;

pub use auth::{AuthPolicy, CallKind};
pub use config::{Mode, ServerSettings};
pub use environment::{DeploymentContext, EnvConfig, EnvironmentResolver, Resolution};
pub use shell::{ShellCredentials, ShellStatus, SubsystemHandle};
