//! The immutable per-plugin configuration record.
//!
//! The core never parses configuration files. The collaborator that located
//! the plugin and read its settings hands one of these in at construction
//! time and it stays fixed for the lifetime of the bridge.

/// Behavioural switches for one bridged plugin instance.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    /// Answer `GetVendorString`/`GetProductString` host callbacks with a
    /// canned identity instead of the DAW's real one. Some plugins change
    /// behaviour (or refuse to load) based on the host they detect.
    pub hide_daw: bool,

    /// Ask the foreign host to negotiate 32-bit sample processing even when
    /// the plugin advertises double precision support.
    pub prefer_32bit: bool,

    /// Force drag-and-drop translation in the editor embedding layer.
    /// Opaque to the core; forwarded to the foreign host.
    pub editor_force_dnd: bool,

    /// Editor idle timer rate override, in Hz. `None` keeps the foreign
    /// host's default.
    pub frame_rate: Option<f64>,

    /// Group identifier passed to the foreign host process, used by the
    /// orchestration layer above the core for group hosting.
    pub group: Option<String>,
}

/// Environment variable that disables the startup watchdog when set.
pub const WATCHDOG_OPT_OUT_ENV: &str = "WINEBRIDGE_NO_WATCHDOG";

impl BridgeConfig {
    /// Whether the startup watchdog should run.
    pub fn watchdog_enabled(&self) -> bool {
        std::env::var_os(WATCHDOG_OPT_OUT_ENV).is_none()
    }
}
