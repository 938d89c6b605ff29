//! Concrete stage implementations, in outgoing order.

pub mod protocol;
pub mod codec;
pub mod flow_control;
pub mod quality;
