//! Bridge for the modern multi-interface reference-counted plugin ABI
//! (VST3).
//!
//! Every plugin object the host creates gets a 64-bit instance id and a
//! capability set discovered by probing the real object on the foreign
//! side. All control traffic is grouped under one message family per
//! channel; the audio processor has its own hot channel.

pub mod bridge;
pub mod host;
pub mod messages;
pub mod module;
pub mod proxy;
pub mod registry;

/// Channel names of a modern-ABI socket group. `control-aux` is the
/// per-side duplicate for control calls issued off the main thread.
pub const CHANNELS: [&str; 4] = ["control", "control-aux", "callback", "audio"];
