// rusty-ivy: Library entry point.
// Re-exports the agent runtime and the wire codec for integration testing.

pub use ivy_bus::{ApplicationEvent, DieAction, IvyBus, IvyError, Peer, PeerStatus, RegexpEvent};
pub use ivy_wire as wire;
