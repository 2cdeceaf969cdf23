pub mod config;
pub mod error;
pub mod flow;
pub mod instance_port;
pub mod leadership;
pub mod listener;
pub mod model;
pub mod nat;
pub mod reconciler;
pub mod service;
pub mod store;
pub mod topology;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;
