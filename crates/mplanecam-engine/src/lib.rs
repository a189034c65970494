//! Capture source controller for the mplane camera source.
//!
//! This crate ties a multi-planar video session, a double-buffered frame exchange, a host
//! renderer and an optional audio capture thread into one [`CaptureSource`] with start,
//! periodic step, render, live reconfiguration and teardown.

mod controller;
mod error;
mod exchange;
mod metrics;
mod render;

pub use controller::CaptureSource;
pub use error::{EngineError, EngineResult};
pub use exchange::{ConsumerGuard, ExchangeGate, FrameExchange, SessionGuard, SessionLocks};
pub use metrics::CaptureStats;
pub use render::{NullRenderer, Renderer, TextureHandle};
