//! Bridge for the legacy opcode-dispatched plugin ABI (VST 2.4).
//!
//! The native side ([`host_proxy::Vst2Bridge`]) presents an effect struct
//! to the DAW and proxies every entry point over the instance's socket
//! group. The foreign side ([`plugin_host::Vst2HostProcess`]) drives the
//! real plugin and mirrors the host's callback interface back across.

pub mod api;
pub mod event;
pub mod host_proxy;
pub mod plugin_host;

/// Channel names of a legacy-ABI socket group.
pub const CHANNELS: [&str; 5] = ["control", "dispatch", "callback", "parameters", "process"];
