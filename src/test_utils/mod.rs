//! Test utilities for `streamcam`
//!
//! Provides synthetic frame generation and an in-process DMA transport for
//! exercising the acquisition pipeline without camera hardware.

pub mod frame_generator;
pub mod mock_transport;

pub use frame_generator::*;
pub use mock_transport::*;
