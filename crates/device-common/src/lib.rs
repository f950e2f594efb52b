//! Device runtime shared by every compute backend.
//!
//! Backends are discovered into a [registry::BackendRegistry]. Selecting a device yields a
//! [common::DeviceContext], which owns nothing itself but scopes memory allocation, stream
//! creation and kernel launches to that device. Device memory lives in
//! [d_buffer::DeviceBuffer]s, which host code can only reach through [copy] transfers or
//! kernels executing on a [stream::Stream].

pub mod common;
pub mod copy;
pub mod d_buffer;
pub mod error;
pub mod memory_manager;
pub mod registry;
pub mod stream;
