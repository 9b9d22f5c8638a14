#![deny(missing_docs, unused_imports)]

//! Core of a cross-ABI audio plugin bridge.
//!
//! A native DAW loads a small stub in place of each foreign (Windows)
//! plugin; the stub proxies every plugin-ABI call to a companion host
//! process running under the foreign-OS compatibility layer, which has
//! loaded the real plugin. From the DAW's perspective the plugin behaves
//! as if it were native.
//!
//! Two processes cooperate per plugin load. The native side owns a private
//! socket group (one strictly typed channel per call family) and spawns
//! the foreign host with the group's directory; audio samples cross in a
//! file-backed shared memory region, linearised by a per-block
//! request/acknowledge round-trip on the process channel.
//!
//! Two plugin ABIs are bridged:
//!
//! - the legacy opcode-dispatched effect ABI ([`vst2`]): an opaque struct
//!   of function pointers driven by a 32-bit opcode dispatcher, with a
//!   host callback running the other way;
//! - the modern multi-interface reference-counted ABI ([`vst3`]): plugin
//!   objects addressed by 64-bit instance ids, with capability discovery,
//!   connection points, component handler and plug frame callbacks.
//!
//! The crate is the bridging core only. Path discovery, prefix detection,
//! configuration parsing, installers, notifications and window embedding
//! are collaborators; their only contact with the core is the immutable
//! [`config::BridgeConfig`] record and the process launch contract of
//! [`supervisor`].

#[macro_use]
extern crate log;
#[macro_use]
extern crate bitflags;

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod rt;
pub mod shmem;
pub mod supervisor;
pub mod transport;

pub mod vst2;
pub mod vst3;

pub use config::BridgeConfig;
pub use error::{BridgeError, CodecError, Result};
