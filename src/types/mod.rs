//! Core types shared by the framer, server and gateways.

mod datapoint;

pub use datapoint::Datapoint;
