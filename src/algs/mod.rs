//! Algorithm module: communication backends, the ghost-exchange
//! pipeline, and the load-balancer adapter.

pub mod communicator;
pub mod exchange;
pub mod partition;
