//! Native side plumbing of the modern bridge: channels, spawn, callback
//! routing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::messages::{
    tresult, CallbackRequest, CallbackResponse, Cid, ControlRequest, ControlResponse,
    InterfaceFlags, ProcessRequest, ProcessResponse,
};
use super::proxy::Vst3PluginProxy;
use crate::config::BridgeConfig;
use crate::dispatcher::{spawn_receiver, EventHandler, IdleQueue, ReceiverHandle};
use crate::error::{BridgeError, Result};
use crate::shmem::{AudioShmBuffer, AudioShmDescriptor};
use crate::supervisor::HostProcess;
use crate::transport::{
    EventChannel, GroupEndpoints, SocketGroup, VersionInfo, HANDSHAKE_TIMEOUT,
};

/// Non-owning table of live proxies, keyed by instance id. The host owns
/// every proxy through the ABI's reference counting; the bridge only ever
/// holds weak back-references, which breaks the host↔plugin callback cycle.
#[derive(Default)]
pub struct ProxyTable {
    entries: Mutex<HashMap<u64, Weak<Vst3PluginProxy>>>,
}

impl ProxyTable {
    pub(crate) fn register(&self, instance_id: u64, proxy: &Arc<Vst3PluginProxy>) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(instance_id, Arc::downgrade(proxy));
    }

    pub(crate) fn unregister(&self, instance_id: u64) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).remove(&instance_id);
    }

    pub(crate) fn get(&self, instance_id: u64) -> Option<Arc<Vst3PluginProxy>> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&instance_id)
            .and_then(Weak::upgrade)
    }

    /// Number of registered (possibly already dropped) entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no proxies are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Routes foreign-side callbacks to the host objects the proxies hold.
struct CallbackRouter {
    proxies: Arc<ProxyTable>,
    idle: Arc<IdleQueue>,
}

impl EventHandler<CallbackRequest> for CallbackRouter {
    fn handle(&self, request: CallbackRequest, main_thread_safe: bool) -> CallbackResponse {
        let instance_id = match &request {
            CallbackRequest::BeginEdit { instance_id, .. }
            | CallbackRequest::PerformEdit { instance_id, .. }
            | CallbackRequest::EndEdit { instance_id, .. }
            | CallbackRequest::RestartComponent { instance_id, .. }
            | CallbackRequest::Notify { instance_id, .. }
            | CallbackRequest::ResizeView { instance_id, .. }
            | CallbackRequest::GetHostName { instance_id } => *instance_id,
        };
        let proxy = match self.proxies.get(instance_id) {
            Some(proxy) => proxy,
            None => {
                warn!("callback for unknown instance {}", instance_id);
                return CallbackResponse::Result(tresult::INTERNAL_ERROR);
            }
        };

        // Restarts reconfigure the host's graph and get thunked onto the
        // idle queue; the stub drains it from the host's own thread.
        if let (CallbackRequest::RestartComponent { flags, .. }, false) =
            (&request, main_thread_safe)
        {
            let flags = *flags;
            let queued = Arc::clone(&proxy);
            self.idle.push(move || {
                queued.route_callback(CallbackRequest::RestartComponent {
                    instance_id: queued.instance_id(),
                    flags,
                });
            });
            return CallbackResponse::Result(tresult::OK);
        }

        proxy.route_callback(request)
    }
}

/// Native side of the modern bridge: one foreign process, one socket
/// group, any number of plugin object proxies.
pub struct Vst3Bridge {
    pub(crate) config: BridgeConfig,
    group: SocketGroup,
    foreign_host: Mutex<Option<HostProcess>>,
    control: EventChannel<ControlRequest>,
    control_aux: EventChannel<ControlRequest>,
    audio: EventChannel<ProcessRequest>,
    callback_receiver: Mutex<Option<ReceiverHandle>>,
    proxies: Arc<ProxyTable>,
    idle: Arc<IdleQueue>,
    failed: AtomicBool,
}

impl Vst3Bridge {
    /// Spawn the foreign host for `module_path` and pair every channel.
    pub fn new(
        host_binary: &Path,
        module_path: &Path,
        config: BridgeConfig,
    ) -> Result<Arc<Vst3Bridge>> {
        let spawn_config = config.clone();
        let host_binary = host_binary.to_path_buf();
        let module_path = module_path.to_path_buf();
        Vst3Bridge::with_launcher(config, move |group| {
            HostProcess::spawn(&host_binary, group, &module_path, &spawn_config).map(Some)
        })
    }

    /// As [`new`](Self::new), but with the foreign process supplied by
    /// `launcher`. Orchestration layers that attach to an already running
    /// host (group hosting) return `None` instead of a child.
    pub fn with_launcher<F>(config: BridgeConfig, launcher: F) -> Result<Arc<Vst3Bridge>>
    where
        F: FnOnce(&SocketGroup) -> Result<Option<HostProcess>>,
    {
        let group = SocketGroup::create()?;
        let endpoints = GroupEndpoints::bind(&group, &super::CHANNELS)?;
        let mut foreign_host = launcher(&group)?;

        let mut streams = endpoints.accept_all(HANDSHAKE_TIMEOUT, || {
            foreign_host.as_ref().map_or(Ok(()), |host| host.startup_liveness())
        })?;
        let control = EventChannel::<ControlRequest>::new(
            streams.remove("control").ok_or(BridgeError::Protocol("missing control channel"))?,
        );
        let control_aux = EventChannel::<ControlRequest>::new(
            streams
                .remove("control-aux")
                .ok_or(BridgeError::Protocol("missing aux control channel"))?,
        );
        let audio = EventChannel::<ProcessRequest>::new(
            streams.remove("audio").ok_or(BridgeError::Protocol("missing audio channel"))?,
        );
        let callback_stream =
            streams.remove("callback").ok_or(BridgeError::Protocol("missing callback channel"))?;

        let ours = VersionInfo::current();
        match control.send_and_receive(&ControlRequest::Version(ours.clone()))? {
            ControlResponse::Version(theirs) => ours.check(&theirs),
            _ => return Err(BridgeError::Protocol("bad version response")),
        }

        let proxies = Arc::new(ProxyTable::default());
        let idle = Arc::new(IdleQueue::default());
        let callback_receiver = spawn_receiver(
            "vst3-callback",
            callback_stream,
            Arc::new(CallbackRouter { proxies: Arc::clone(&proxies), idle: Arc::clone(&idle) })
                as Arc<dyn EventHandler<CallbackRequest>>,
            crate::codec::DEFAULT_FRAME_CAP,
        )?;

        if let Some(host) = foreign_host.as_mut() {
            host.start_monitor();
        }

        Ok(Arc::new(Vst3Bridge {
            config,
            group,
            foreign_host: Mutex::new(foreign_host),
            control,
            control_aux,
            audio,
            callback_receiver: Mutex::new(Some(callback_receiver)),
            proxies,
            idle,
            failed: AtomicBool::new(false),
        }))
    }

    /// Drain thunked callbacks. The stub calls this from the host's idle
    /// or timer entry point.
    pub fn on_idle(&self) {
        self.idle.drain();
    }

    /// Create a plugin object on the foreign side and build its proxy.
    /// The capability set advertised by the proxy is exactly what the
    /// probe of the real object reported.
    pub fn create_instance(self: &Arc<Self>, cid: Cid) -> Result<Arc<Vst3PluginProxy>> {
        match self.send(&ControlRequest::CreateInstance { cid })? {
            ControlResponse::Created { instance_id, capabilities } => {
                let proxy = Vst3PluginProxy::new(
                    Arc::clone(self),
                    instance_id,
                    InterfaceFlags::from_bits_truncate(capabilities),
                );
                self.proxies.register(instance_id, &proxy);
                Ok(proxy)
            }
            ControlResponse::Result(code) => {
                warn!("foreign factory refused class: {:#x}", code);
                Err(BridgeError::Protocol("class not exported by the foreign module"))
            }
            _ => Err(BridgeError::Protocol("bad create response")),
        }
    }

    /// The live proxy table.
    pub fn proxies(&self) -> &ProxyTable {
        &self.proxies
    }

    pub(crate) fn mark_failed(&self, err: &BridgeError) {
        if err.is_fatal() && !self.failed.swap(true, Ordering::SeqCst) {
            error!("modern bridge channel failed: {}", err);
        }
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Send a control request on the main control channel.
    pub(crate) fn send(&self, request: &ControlRequest) -> Result<ControlResponse> {
        if self.is_failed() {
            return Err(BridgeError::Protocol("bridge already failed"));
        }
        self.control.send_and_receive(request).map_err(|err| {
            self.mark_failed(&err);
            err
        })
    }

    /// Send a control request on the per-side duplicate, used by calls
    /// issued off the main thread so they never contend with it.
    pub(crate) fn send_aux(&self, request: &ControlRequest) -> Result<ControlResponse> {
        if self.is_failed() {
            return Err(BridgeError::Protocol("bridge already failed"));
        }
        self.control_aux.send_and_receive(request).map_err(|err| {
            self.mark_failed(&err);
            err
        })
    }

    /// One block round-trip on the audio channel.
    pub(crate) fn send_audio(&self, request: &ProcessRequest) -> Result<ProcessResponse> {
        if self.is_failed() {
            return Err(BridgeError::Protocol("bridge already failed"));
        }
        self.audio.send_and_receive(request).map_err(|err| {
            self.mark_failed(&err);
            err
        })
    }

    /// Map a buffer the foreign side described.
    pub(crate) fn open_buffer(&self, descriptor: &AudioShmDescriptor) -> Result<AudioShmBuffer> {
        let buffer = AudioShmBuffer::open(&self.group.dir().join(&descriptor.file_name))?;
        if buffer.config() != &descriptor.config {
            return Err(BridgeError::Protocol("audio buffer header does not match descriptor"));
        }
        Ok(buffer)
    }
}

impl Drop for Vst3Bridge {
    fn drop(&mut self) {
        if let Some(receiver) =
            self.callback_receiver.lock().unwrap_or_else(|e| e.into_inner()).take()
        {
            receiver.shutdown();
        }
        self.control.shutdown();
        self.control_aux.shutdown();
        self.audio.shutdown();
        if let Some(foreign_host) =
            self.foreign_host.lock().unwrap_or_else(|e| e.into_inner()).take()
        {
            foreign_host.terminate();
        }
    }
}
