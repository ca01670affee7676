//! Multi-flavor line-based chat server.
//!
//! Every connection first picks a session kind from a menu (echo, reverse or
//! a shared broadcast room) and keeps it for its lifetime. The modules:
//!
//! - [`server`] owns the accept loop and coordinated shutdown.
//! - [`admission`] pauses accepting once live sessions plus clients still
//!   negotiating reach the configured capacity.
//! - [`redirector`] runs the menu handshake and starts the chosen session.
//! - [`session`] implements the echo, reverse and broadcast loops.
//! - [`room`] tracks live sessions; broadcasts, username claims and
//!   shutdown run as bulk operations under its single lock.
//! - [`protocol`] holds the kind names, control tokens and line framing.
//! - [`audit`] appends every processed line to a text audit trail.
//! - [`cli`] and [`client`] provide the command line and a terminal client.

pub mod admission;
pub mod audit;
pub mod cli;
pub mod client;
pub mod protocol;
pub mod redirector;
pub mod room;
pub mod server;
pub mod session;
