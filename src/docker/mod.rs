//! Runtime adapter: facts and events from the container runtime.

pub mod api;
pub mod data;
pub mod events;
pub mod types;

pub use api::{DockerRuntime, RuntimeApi, RuntimeEvent, SharedRuntime};
pub use data::{local_shard_key, DockerData};
pub use types::{ContainerInfo, DockerNetworkInfo, EndpointMode, ServiceInfo};
