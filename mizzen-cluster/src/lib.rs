//! # Mizzen Cluster
//!
//! Consumer-side fault tolerance: directories of live invokers fed by the
//! registry, routers, load balancing, and the failure policies that wrap
//! everything into one invoker. The `registry://` protocol ties the whole
//! consumer pipeline together.

pub mod cluster;
pub mod configurator;
pub mod directory;
pub mod loadbalance;
pub mod registry_protocol;
pub mod router;
pub mod support;

pub use cluster::{builtin_registry as builtin_clusters, Cluster, ClusterRegistry, ClusterSupport};
pub use configurator::{apply_configurators, configurators_from_urls, Configurator};
pub use directory::{Directory, RegistryDirectory, StaticDirectory};
pub use loadbalance::{
    builtin_registry as builtin_load_balances, LoadBalance, LoadBalanceRegistry,
};
pub use registry_protocol::RegistryProtocol;
pub use router::{routers_from_urls, ConditionRouter, Router, TagRouter};
