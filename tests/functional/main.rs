#![cfg(feature = "functional-tests")]

mod cluster;
mod lifecycle;
mod resources;

pub use cluster::TestCluster;
pub use resources::TestResources;
