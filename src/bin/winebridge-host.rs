//! The foreign host process entry point.
//!
//! Spawned by the native stub with the socket group directory and the
//! plugin module path. Loads the real plugin, connects to every channel in
//! the group and serves until the native side disconnects. The module's
//! flavour decides which bridge half runs: modern modules get the
//! object-table host, everything else the legacy effect host.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use winebridge::transport::SocketGroup;
use winebridge::vst2::plugin_host::{install_router, LoadedEffect, Vst2HostProcess};
use winebridge::vst3::host::Vst3HostProcess;
use winebridge::vst3::module::{is_vst3_module, Vst3Module};

fn main() -> ExitCode {
    let mut args = std::env::args_os().skip(1);
    let (group_dir, module_path) = match (args.next(), args.next()) {
        (Some(group_dir), Some(module_path)) => {
            (PathBuf::from(group_dir), PathBuf::from(module_path))
        }
        _ => {
            eprintln!("usage: winebridge-host <socket-directory> <plugin-module> [--group <id>]");
            return ExitCode::FAILURE;
        }
    };

    let group = SocketGroup::adopt(group_dir);
    let result = if is_vst3_module(&module_path) {
        serve_vst3(&group, &module_path)
    } else {
        serve_vst2(&group, &module_path)
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("winebridge-host: {}", message);
            ExitCode::FAILURE
        }
    }
}

fn serve_vst2(group: &SocketGroup, module_path: &Path) -> Result<(), String> {
    let (streams, router) = Vst2HostProcess::connect(group)
        .map_err(|err| format!("could not reach the native stub: {}", err))?;
    install_router(Arc::clone(&router)).map_err(|err| err.to_string())?;

    let effect = LoadedEffect::load(module_path)
        .map(Arc::new)
        .map_err(|err| format!("could not load {}: {}", module_path.display(), err))?;

    Vst2HostProcess::new(group, streams, effect, router)
        .run()
        .map_err(|err| err.to_string())
}

fn serve_vst3(group: &SocketGroup, module_path: &Path) -> Result<(), String> {
    let factory = Vst3Module::load(module_path)
        .map(Arc::new)
        .map_err(|err| format!("could not load {}: {}", module_path.display(), err))?;

    Vst3HostProcess::connect(group, factory)
        .map_err(|err| format!("could not reach the native stub: {}", err))?
        .run()
        .map_err(|err| err.to_string())
}
