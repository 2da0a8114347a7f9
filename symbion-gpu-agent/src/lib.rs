//! Symbion GPU Agent - GPU telemetry for Compute Engine instances
//!
//! Samples per-GPU metrics with nvidia-smi, derives memory usage percentage,
//! and publishes everything to Cloud Monitoring as custom metrics:
//! - One-shot preflight (tool installed, GPUs detected, instance identity)
//! - Fixed-cadence collection loop with per-cycle fault isolation
//! - Batched submission, one call per cycle

pub mod catalog;
pub mod collector;
pub mod config;
pub mod error;
pub mod metadata;
pub mod preflight;
pub mod probe;
pub mod publish;
pub mod samples;
pub mod transform;
