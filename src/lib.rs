//! canopy — an IRC network monitor.
//!
//! Connects to one server of an IRC network as an oper, reads the `LINKS`
//! spanning tree, probes every server with `TIME` on a fixed tick, and
//! reports splits, joins, and stalled servers to a channel.

pub mod config;
pub mod irc;
pub mod watch;
