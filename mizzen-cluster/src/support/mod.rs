//! Built-in cluster failure policies

mod available;
mod broadcast;
mod failback;
mod failfast;
mod failover;
mod failsafe;
mod forking;

pub use available::AvailableCluster;
pub use broadcast::BroadcastCluster;
pub use failback::FailbackCluster;
pub use failfast::FailfastCluster;
pub use failover::FailoverCluster;
pub use failsafe::FailsafeCluster;
pub use forking::ForkingCluster;
