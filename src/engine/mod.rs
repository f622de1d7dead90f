//! Engine: in-process dispatch and the queue-driven control plane.

pub mod control;
pub mod dispatch;

pub use control::{ControlConfig, ControlPlane};
pub use dispatch::Dispatcher;
