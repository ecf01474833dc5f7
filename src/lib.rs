//! Relay for device-local screen mirroring streams.
//!
//! Viewers connect over WebSocket and are admitted by a shared-secret
//! gatekeeper. For each admitted viewer the relay resolves the device's
//! locally published MJPEG port, decodes the multipart stream into discrete
//! frames, decimates them, and forwards the survivors as binary messages
//! until the source ends, an I/O error occurs, the viewer disconnects, or
//! the idle watchdog fires.
//!
//! The device and port registries are populated by an external device
//! bridge; this crate only reads them.

pub mod app;
pub mod net;
pub mod registry;
pub mod relay;
pub mod runtime;
pub mod session;
pub mod source;
