//! Cluster state exchange: member identity, advisor messages, the advisor
//! itself, the transport contract, and bounded convergence waits.

pub mod advisor;
pub mod convergence;
pub mod member;
pub mod message;
pub mod transport;
