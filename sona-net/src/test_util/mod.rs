//! Test doubles for the dataplane collaborators and a ready-made topology.
//!
//! Compiled for unit tests and, behind the `test-util` feature, for
//! integration tests.

mod fixture;
mod flow;
pub mod packets;

pub use fixture::{
    C1_DATA_IP, C2_DATA_IP, EXTERNAL_GATEWAY_IP, EXTERNAL_PEER_IP, EXTERNAL_PEER_MAC, Fixture,
    G1_DATA_IP, init_tracing,
};
pub use flow::{EmittedFrame, RecordingEmitter, RecordingFlowProgram};
