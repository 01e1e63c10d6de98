//! hdr-capture-bridge: HDR desktop capture negotiation and frame transport
//!
//! This library selects among ranked native capture backends, runs each
//! capture in an isolated worker with a non-blocking frame pump, moves frames
//! to consumers over the fastest transport available (shared region, push
//! slot or loopback HTTP), keeps an adaptive JPEG preview, and falls back to
//! lower backend tiers without interrupting the session.
//!
//! Native capture APIs are outside this crate; they plug in through
//! [`capture::CaptureBackend`]. [`capture::SyntheticBackend`] stands in for
//! them in tests and in the demo binary.

pub mod capture;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod perf;
pub mod preview;
pub mod transport;
pub mod worker;
