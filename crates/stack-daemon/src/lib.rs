//! # Stack Daemon
//!
//! WebSocket daemon and client for the container stack controller.
//!
//! The daemon (`stackd`) loads a stack file, tracks the compose project and
//! executes start, stop and restart operations. Clients such as `stackctl`
//! talk to it over a plain WebSocket on localhost using JSON messages tagged
//! by `type`.
//!
//! ```no_run
//! use stack_daemon::client::DaemonClient;
//! use stack_daemon::protocol::{Request, Response};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut client = DaemonClient::connect(9443).await?;
//! if let Response::Groups { groups } = client.send_request(Request::GetGroups).await? {
//!     for group in groups {
//!         println!("{}: {}/{} running", group.name, group.running, group.total);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod client;
pub mod daemon;
pub mod logging;
pub mod protocol;
