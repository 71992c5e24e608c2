//! Live stream fan-out.
//!
//! Many consumers want frames for overlapping sets of channels. The
//! [`StreamMultiplexer`] keeps one transport stream whose subscription is the
//! union of every registered [`Subscriber`]'s channels and routes each frame to
//! the listeners it concerns.
//!
//! ```text
//! transport ──frames──► StreamMultiplexer::pump ──► listener 1 (channels {1,2})
//!                                              ├──► listener 2 (channels {2,3})
//!                                              └──► ...
//! ```
//!
//! Registration returns a [`ListenerGuard`]. Dropping it or calling
//! [`ListenerGuard::remove`] unregisters the listener; the last removal closes
//! the stream and the next registration opens a new one.

pub mod multiplexer;
pub mod subscriber;

pub use multiplexer::{ListenerGuard, ListenerId, MultiplexerStats, StreamMultiplexer, StreamState};
pub use subscriber::{FrameHandler, OpenHandler, Subscriber};
