//! Session orchestration for the selective forwarding relay
//!
//! Parties negotiate a transport, then publish and subscribe through it. The
//! coordinator enforces the order of those steps against the shared
//! [`ResourceRegistry`](crate::registry::ResourceRegistry), the fan-out
//! announces publication changes, and the lifecycle manager drains a party's
//! resources when it leaves.

mod capabilities;
mod coordinator;
mod fanout;
mod lifecycle;

pub use capabilities::CapabilityService;
pub use coordinator::{
    ConsumerDescriptor, NegotiationCoordinator, NegotiationState, Released, TransportDescriptor,
};
pub use fanout::FanOut;
pub use lifecycle::{ReleaseReport, ReleasedResource, SessionLifecycle};

#[cfg(test)]
pub(crate) mod testing;
