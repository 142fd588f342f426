//! The Ivy agent runtime: decentralized publish/subscribe over a TCP mesh.
//!
//! Every agent on a bus keeps a direct TCP connection to every other agent
//! and announces itself with one UDP broadcast (or multicast) datagram.
//! Subscriptions are regular expressions; a sent message is delivered once
//! per matching (peer, subscription) pair.
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), ivy_bus::IvyError> {
//! use ivy_bus::IvyBus;
//!
//! let bus = IvyBus::new("monitor", Some("monitor READY"));
//! bus.bind_msg("^hello (.*)$", |peer, captures| {
//!     println!("{} says hello to {}", peer, captures[0]);
//! });
//! bus.start(Some("127:2010")).await?;
//! bus.send_msg("hello world");
//! bus.stop().await?;
//! # Ok(())
//! # }
//! ```

mod agent;
mod callbacks;
mod discovery;
mod error;
mod handler;
mod peer;
mod registry;
mod timer;

pub use agent::IvyBus;
pub use callbacks::{ApplicationEvent, DieAction, RegexpEvent};
pub use error::IvyError;
pub use peer::{Peer, PeerStatus};
