//! Foreign side of the legacy bridge: drives the real plugin module.

use std::cell::Cell;
use std::os::raw::c_void;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use super::api::{self, consts, HostOpCode, OpCode};
use super::event::{
    AudioRequest, DispatchRequest, DispatchResponse, EventBlock, ForeignHostConfig,
    MidiEventData, ParameterRequest, ParameterResponse, Payload, PinPropertiesData,
    SpeakerArrangementData, Vst2ControlRequest, Vst2ControlResponse, AUDIO_ACK_BYTE,
};
use crate::codec;
use crate::error::{BridgeError, Result};
use crate::rt::{set_realtime_priority, ScopedFlushToZero, ScopedValueCache, TimedValueCache};
use crate::shmem::{AudioShmBuffer, AudioShmConfig, AudioShmDescriptor};
use crate::transport::{connect_group, EventChannel, SocketGroup, VersionInfo, HANDSHAKE_TIMEOUT};

/// Default editor idle rate when the host pushed no override.
const DEFAULT_IDLE_RATE_HZ: f64 = 30.0;

/// How long cross-process host identity strings stay cached. Plugins poll
/// them far more often than any host changes them.
const HOST_STRING_TTL: Duration = Duration::from_secs(10);

/// What the foreign process needs from the plugin it hosts.
///
/// The real implementation wraps the loaded module's effect struct; tests
/// substitute plain Rust.
pub trait EffectTarget: Send + Sync + 'static {
    /// The bridged effect fields in their current state.
    fn effect_fields(&self) -> EffectFields;

    /// Service one dispatcher call.
    fn dispatch(&self, request: DispatchRequest) -> DispatchResponse;

    /// Read a parameter.
    fn get_parameter(&self, index: i32) -> f32;

    /// Write a parameter.
    fn set_parameter(&self, index: i32, value: f32);

    /// Process one single precision block in place in the shared buffer.
    fn process_f32(&self, shm: &mut AudioShmBuffer, frames: usize);

    /// Process one double precision block in place in the shared buffer.
    fn process_f64(&self, shm: &mut AudioShmBuffer, frames: usize);
}

pub use super::event::EffectFields;

/// Forwards plugin→host callbacks over the callback channel, answering the
/// per-block queries from the caches filled while a block is in flight.
pub struct HostCallbackRouter {
    channel: EventChannel<DispatchRequest>,
    /// Transport info prefetched by the native side for the current block.
    pub time_cache: ScopedValueCache<api::TimeInfo>,
    /// Process level prefetched for the current block.
    pub level_cache: ScopedValueCache<i32>,
    vendor_cache: TimedValueCache<String>,
    product_cache: TimedValueCache<String>,
}

impl HostCallbackRouter {
    /// Wrap the callback channel's foreign end.
    pub fn new(stream: UnixStream) -> HostCallbackRouter {
        HostCallbackRouter {
            channel: EventChannel::new(stream),
            time_cache: ScopedValueCache::default(),
            level_cache: ScopedValueCache::default(),
            vendor_cache: TimedValueCache::new(HOST_STRING_TTL),
            product_cache: TimedValueCache::new(HOST_STRING_TTL),
        }
    }

    fn forward(&self, request: DispatchRequest) -> DispatchResponse {
        match self.channel.send_and_receive(&request) {
            Ok(response) => response,
            Err(err) => {
                warn!("host callback failed: {}", err);
                DispatchResponse::ret(0)
            }
        }
    }

    /// Service one raw host callback from the plugin.
    ///
    /// # Safety
    /// `ptr` must match what the ABI mandates for `opcode`.
    pub unsafe fn callback(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        ptr: *mut c_void,
        opt: f32,
    ) -> isize {
        let opcode = match HostOpCode::try_from(opcode) {
            Ok(opcode) => opcode,
            Err(_) => {
                debug!("unimplemented host opcode {}", opcode);
                return 0;
            }
        };

        match opcode {
            HostOpCode::Version => return consts::VST_2_4,

            HostOpCode::GetTime => {
                // Answered from the per-block prefetch while processing;
                // queries outside a block cross the socket.
                let info = self.time_cache.get().or_else(|| {
                    let response = self.forward(DispatchRequest {
                        opcode: opcode.into(),
                        index: 0,
                        value: value as i64,
                        opt: 0.0,
                        payload: Payload::None,
                    });
                    match response.payload {
                        Payload::TimeInfo(info) => Some(info),
                        _ => None,
                    }
                });
                return match info {
                    None => 0,
                    Some(result) => {
                        thread_local! {
                            static TIME_INFO: Cell<api::TimeInfo> =
                                Cell::new(api::TimeInfo::default());
                        }
                        TIME_INFO.with(|time_info| {
                            time_info.set(result);
                            time_info.as_ptr() as isize
                        })
                    }
                };
            }

            HostOpCode::GetCurrentProcessLevel => {
                if let Some(level) = self.level_cache.get() {
                    return level as isize;
                }
            }

            HostOpCode::ProcessEvents => {
                let events = MidiEventData::from_raw_block(ptr as *const api::Events);
                let response = self.forward(DispatchRequest {
                    opcode: opcode.into(),
                    index: 0,
                    value: 0,
                    opt: 0.0,
                    payload: Payload::Events(events),
                });
                return response.ret as isize;
            }

            HostOpCode::CanDo => {
                let response = self.forward(DispatchRequest {
                    opcode: opcode.into(),
                    index: 0,
                    value: 0,
                    opt: 0.0,
                    payload: Payload::Utf8(api::read_string(ptr)),
                });
                return response.ret as isize;
            }

            HostOpCode::GetVendorString | HostOpCode::GetProductString => {
                let cache = if opcode == HostOpCode::GetVendorString {
                    &self.vendor_cache
                } else {
                    &self.product_cache
                };
                if let Some(text) = cache.get() {
                    api::copy_string(ptr, &text, consts::MAX_VENDOR_STR_LEN);
                    return 1;
                }
                let response = self.forward(DispatchRequest {
                    opcode: opcode.into(),
                    index: 0,
                    value: 0,
                    opt: 0.0,
                    payload: Payload::WantsString,
                });
                if let Payload::Utf8(text) = &response.payload {
                    api::copy_string(ptr, text, consts::MAX_VENDOR_STR_LEN);
                    if response.ret != 0 {
                        cache.set(text.clone());
                    }
                }
                return response.ret as isize;
            }

            _ => {}
        }

        let response = self.forward(DispatchRequest {
            opcode: opcode.into(),
            index,
            value: value as i64,
            opt,
            payload: Payload::None,
        });
        response.ret as isize
    }
}

static ROUTER: OnceLock<Arc<HostCallbackRouter>> = OnceLock::new();

/// Install the process-wide callback router the loaded module's trampoline
/// resolves through. The foreign process hosts exactly one plugin.
pub fn install_router(router: Arc<HostCallbackRouter>) -> Result<()> {
    ROUTER
        .set(router)
        .map_err(|_| BridgeError::Protocol("callback router already installed"))
}

unsafe extern "C" fn host_callback_trampoline(
    _effect: *mut api::AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> isize {
    match ROUTER.get() {
        Some(router) => router.callback(opcode, index, value, ptr, opt),
        // The plugin probes the host version from inside its entry point,
        // before the router exists.
        None => match HostOpCode::try_from(opcode) {
            Ok(HostOpCode::Version) => consts::VST_2_4,
            _ => 0,
        },
    }
}

/// The real plugin, loaded from its module file.
pub struct LoadedEffect {
    _library: libloading::Library,
    effect: *mut api::AEffect,
    // The legacy ABI is single threaded apart from parameter access; one
    // lock serialises dispatcher, editor timer and process calls.
    call_lock: Mutex<()>,
}

// The effect pointer is only dereferenced under `call_lock` (or through
// the parameter entry points, which the ABI requires to be thread safe).
unsafe impl Send for LoadedEffect {}
unsafe impl Sync for LoadedEffect {}

impl LoadedEffect {
    /// Load the module and run its entry point. [`install_router`] must
    /// have been called first so the plugin can reach its host.
    pub fn load(path: &Path) -> Result<LoadedEffect> {
        unsafe {
            let library = libloading::Library::new(path)
                .map_err(|err| BridgeError::Transport(std::io::Error::other(err)))?;
            let main: libloading::Symbol<api::PluginMain> = library
                .get(b"VSTPluginMain")
                .or_else(|_| library.get(b"main"))
                .map_err(|err| BridgeError::Transport(std::io::Error::other(err)))?;
            let effect = main(host_callback_trampoline);
            if effect.is_null() || (*effect).magic != consts::VST_MAGIC {
                return Err(BridgeError::Protocol("module produced no valid effect"));
            }
            info!("loaded plugin module {}", path.display());
            Ok(LoadedEffect { _library: library, effect, call_lock: Mutex::new(()) })
        }
    }

    unsafe fn raw_dispatch(&self, opcode: i32, index: i32, value: isize, ptr: *mut c_void, opt: f32) -> isize {
        ((*self.effect).dispatcher)(self.effect, opcode, index, value, ptr, opt)
    }
}

impl EffectTarget for LoadedEffect {
    fn effect_fields(&self) -> EffectFields {
        let _guard = self.call_lock.lock().unwrap_or_else(|e| e.into_inner());
        EffectFields::capture(unsafe { &*self.effect })
    }

    fn dispatch(&self, request: DispatchRequest) -> DispatchResponse {
        let opcode = match OpCode::try_from(request.opcode) {
            Ok(opcode) => opcode,
            Err(_) => return DispatchResponse::ret(0),
        };
        let _guard = self.call_lock.lock().unwrap_or_else(|e| e.into_inner());
        let raw_opcode: i32 = opcode.into();
        let index = request.index;
        let value = request.value as isize;
        let opt = request.opt;

        unsafe {
            match &request.payload {
                Payload::WantsEffectUpdate => {
                    let ret = self.raw_dispatch(raw_opcode, index, value, std::ptr::null_mut(), opt);
                    DispatchResponse {
                        ret: ret as i64,
                        payload: Payload::EffectFields(EffectFields::capture(&*self.effect)),
                        aux: Payload::None,
                    }
                }

                Payload::Utf8(text) => {
                    let c_string = std::ffi::CString::new(text.as_str()).unwrap_or_default();
                    let ret = self.raw_dispatch(
                        raw_opcode,
                        index,
                        value,
                        c_string.as_ptr() as *mut c_void,
                        opt,
                    );
                    DispatchResponse::ret(ret as i64)
                }

                Payload::WantsString => {
                    let mut buffer = [0u8; 256];
                    let ret = self.raw_dispatch(
                        raw_opcode,
                        index,
                        value,
                        buffer.as_mut_ptr() as *mut c_void,
                        opt,
                    );
                    DispatchResponse {
                        ret: ret as i64,
                        payload: Payload::Utf8(api::read_string(buffer.as_ptr() as *const c_void)),
                        aux: Payload::None,
                    }
                }

                Payload::WantsChunkBuffer => {
                    let mut chunk: *mut c_void = std::ptr::null_mut();
                    let ret = self.raw_dispatch(
                        raw_opcode,
                        index,
                        value,
                        &mut chunk as *mut *mut c_void as *mut c_void,
                        opt,
                    );
                    let bytes = if chunk.is_null() || ret <= 0 {
                        Vec::new()
                    } else {
                        std::slice::from_raw_parts(chunk as *const u8, ret as usize).to_vec()
                    };
                    DispatchResponse {
                        ret: ret as i64,
                        payload: Payload::Bytes(bytes),
                        aux: Payload::None,
                    }
                }

                Payload::Bytes(bytes) => {
                    let ret = self.raw_dispatch(
                        raw_opcode,
                        index,
                        bytes.len() as isize,
                        bytes.as_ptr() as *mut c_void,
                        opt,
                    );
                    DispatchResponse::ret(ret as i64)
                }

                Payload::Events(events) => {
                    let block = EventBlock::new(events);
                    let ret = self.raw_dispatch(
                        raw_opcode,
                        index,
                        value,
                        block.as_ptr() as *mut c_void,
                        opt,
                    );
                    DispatchResponse::ret(ret as i64)
                }

                Payload::WantsRect => {
                    let mut rect: *mut api::Rect = std::ptr::null_mut();
                    let ret = self.raw_dispatch(
                        raw_opcode,
                        index,
                        value,
                        &mut rect as *mut *mut api::Rect as *mut c_void,
                        opt,
                    );
                    let payload =
                        if rect.is_null() { Payload::None } else { Payload::Rect(*rect) };
                    DispatchResponse { ret: ret as i64, payload, aux: Payload::None }
                }

                Payload::Handle(handle) => {
                    let ret =
                        self.raw_dispatch(raw_opcode, index, value, *handle as *mut c_void, opt);
                    DispatchResponse::ret(ret as i64)
                }

                Payload::WantsPinProperties => {
                    let mut properties: api::ChannelProperties = std::mem::zeroed();
                    let ret = self.raw_dispatch(
                        raw_opcode,
                        index,
                        value,
                        &mut properties as *mut api::ChannelProperties as *mut c_void,
                        opt,
                    );
                    DispatchResponse {
                        ret: ret as i64,
                        payload: Payload::PinProperties(PinPropertiesData {
                            name: api::read_string(properties.name.as_ptr() as *const c_void),
                            flags: properties.flags,
                            arrangement_type: properties.arrangement_type,
                            short_name: api::read_string(
                                properties.short_name.as_ptr() as *const c_void,
                            ),
                        }),
                        aux: Payload::None,
                    }
                }

                Payload::KeyName { program, key } => {
                    let mut request = api::MidiKeyName {
                        this_program_index: *program,
                        this_key_number: *key,
                        key_name: [0; consts::MAX_LABEL],
                        reserved: 0,
                        flags: 0,
                    };
                    let ret = self.raw_dispatch(
                        raw_opcode,
                        index,
                        value,
                        &mut request as *mut api::MidiKeyName as *mut c_void,
                        opt,
                    );
                    DispatchResponse {
                        ret: ret as i64,
                        payload: Payload::Utf8(api::read_string(
                            request.key_name.as_ptr() as *const c_void,
                        )),
                        aux: Payload::None,
                    }
                }

                Payload::SpeakerArrangements { input, output } => {
                    let mut input_block = vec![0u8; input.raw_len()];
                    input.write_to(&mut input_block);
                    let mut output_block = vec![0u8; output.raw_len()];
                    output.write_to(&mut output_block);
                    let ret = self.raw_dispatch(
                        raw_opcode,
                        index,
                        input_block.as_mut_ptr() as isize,
                        output_block.as_mut_ptr() as *mut c_void,
                        opt,
                    );
                    DispatchResponse::ret(ret as i64)
                }

                Payload::WantsSpeakerArrangements => {
                    let mut input: *mut api::SpeakerArrangement = std::ptr::null_mut();
                    let mut output: *mut api::SpeakerArrangement = std::ptr::null_mut();
                    let ret = self.raw_dispatch(
                        raw_opcode,
                        index,
                        &mut input as *mut *mut api::SpeakerArrangement as isize,
                        &mut output as *mut *mut api::SpeakerArrangement as *mut c_void,
                        opt,
                    );
                    let payload = if input.is_null() || output.is_null() {
                        Payload::None
                    } else {
                        Payload::SpeakerArrangements {
                            input: SpeakerArrangementData::from_raw(input),
                            output: SpeakerArrangementData::from_raw(output),
                        }
                    };
                    DispatchResponse { ret: ret as i64, payload, aux: Payload::None }
                }

                _ => {
                    let ret = self.raw_dispatch(raw_opcode, index, value, std::ptr::null_mut(), opt);
                    DispatchResponse::ret(ret as i64)
                }
            }
        }
    }

    fn get_parameter(&self, index: i32) -> f32 {
        unsafe { ((*self.effect).getParameter)(self.effect, index) }
    }

    fn set_parameter(&self, index: i32, value: f32) {
        unsafe { ((*self.effect).setParameter)(self.effect, index, value) }
    }

    fn process_f32(&self, shm: &mut AudioShmBuffer, frames: usize) {
        let _guard = self.call_lock.lock().unwrap_or_else(|e| e.into_inner());
        let fields = unsafe { EffectFields::capture(&*self.effect) };
        let inputs: Vec<*const f32> = (0..fields.num_inputs.max(0) as usize)
            .map(|channel| shm.input_f32(0, channel, frames).as_ptr())
            .collect();
        let outputs: Vec<*mut f32> = (0..fields.num_outputs.max(0) as usize)
            .map(|channel| shm.output_f32_mut(0, channel, frames).as_mut_ptr())
            .collect();
        unsafe {
            ((*self.effect).processReplacing)(
                self.effect,
                inputs.as_ptr(),
                outputs.as_ptr() as *mut *mut f32,
                frames as i32,
            );
        }
    }

    fn process_f64(&self, shm: &mut AudioShmBuffer, frames: usize) {
        let _guard = self.call_lock.lock().unwrap_or_else(|e| e.into_inner());
        let fields = unsafe { EffectFields::capture(&*self.effect) };
        let inputs: Vec<*const f64> = (0..fields.num_inputs.max(0) as usize)
            .map(|channel| shm.input_f64(0, channel, frames).as_ptr())
            .collect();
        let outputs: Vec<*mut f64> = (0..fields.num_outputs.max(0) as usize)
            .map(|channel| shm.output_f64_mut(0, channel, frames).as_mut_ptr())
            .collect();
        unsafe {
            ((*self.effect).processReplacingF64)(
                self.effect,
                inputs.as_ptr(),
                outputs.as_ptr() as *mut *mut f64,
                frames as i32,
            );
        }
    }
}

/// The foreign host's serving half for one legacy plugin.
pub struct Vst2HostProcess {
    target: Arc<dyn EffectTarget>,
    router: Arc<HostCallbackRouter>,
    control: UnixStream,
    dispatch: UnixStream,
    parameters: UnixStream,
    process: UnixStream,
    shm: Arc<Mutex<Option<AudioShmBuffer>>>,
    shm_path: std::path::PathBuf,
    shm_name: String,
    host_config: Arc<Mutex<ForeignHostConfig>>,
    editor_open: Arc<AtomicBool>,
    last_block_size: Cell<i64>,
    last_precision: Cell<i64>,
}

impl Vst2HostProcess {
    /// Connect to the native side's socket group and build the router the
    /// plugin's host callback will route through.
    pub fn connect(group: &SocketGroup) -> Result<(Vst2HostProcessStreams, Arc<HostCallbackRouter>)> {
        let mut streams = connect_group(group, &super::CHANNELS, HANDSHAKE_TIMEOUT)?;
        let callback = streams
            .remove("callback")
            .ok_or(BridgeError::Protocol("missing callback channel"))?;
        let router = Arc::new(HostCallbackRouter::new(callback));
        Ok((
            Vst2HostProcessStreams {
                control: streams
                    .remove("control")
                    .ok_or(BridgeError::Protocol("missing control channel"))?,
                dispatch: streams
                    .remove("dispatch")
                    .ok_or(BridgeError::Protocol("missing dispatch channel"))?,
                parameters: streams
                    .remove("parameters")
                    .ok_or(BridgeError::Protocol("missing parameters channel"))?,
                process: streams
                    .remove("process")
                    .ok_or(BridgeError::Protocol("missing process channel"))?,
            },
            router,
        ))
    }

    /// Assemble the serving half once the plugin is loaded.
    pub fn new(
        group: &SocketGroup,
        streams: Vst2HostProcessStreams,
        target: Arc<dyn EffectTarget>,
        router: Arc<HostCallbackRouter>,
    ) -> Vst2HostProcess {
        Vst2HostProcess {
            target,
            router,
            control: streams.control,
            dispatch: streams.dispatch,
            parameters: streams.parameters,
            process: streams.process,
            shm: Arc::new(Mutex::new(None)),
            shm_path: group.dir().join(group.shm_file_name()),
            shm_name: group.shm_file_name(),
            host_config: Arc::new(Mutex::new(ForeignHostConfig::default())),
            editor_open: Arc::new(AtomicBool::new(false)),
            last_block_size: Cell::new(1024),
            last_precision: Cell::new(0),
        }
    }

    /// Serve every channel until the native side disconnects.
    ///
    /// The dispatch loop runs on the calling thread, which doubles as the
    /// plugin's main thread; parameters, control and the audio path each
    /// get their own.
    pub fn run(mut self) -> Result<()> {
        let control = self.control.try_clone()?;
        let control_target = Arc::clone(&self.target);
        let control_config = Arc::clone(&self.host_config);
        let control_thread = std::thread::Builder::new()
            .name("winebridge-vst2-control".into())
            .spawn(move || serve_control(control, control_target, control_config))?;

        let parameters = self.parameters.try_clone()?;
        let parameter_target = Arc::clone(&self.target);
        let parameter_thread = std::thread::Builder::new()
            .name("winebridge-vst2-parameters".into())
            .spawn(move || serve_parameters(parameters, parameter_target))?;

        let process = self.process.try_clone()?;
        let process_target = Arc::clone(&self.target);
        let process_router = Arc::clone(&self.router);
        let process_shm = Arc::clone(&self.shm);
        let process_thread = std::thread::Builder::new()
            .name("winebridge-vst2-audio".into())
            .spawn(move || serve_audio(process, process_target, process_router, process_shm))?;

        let stopping = Arc::new(AtomicBool::new(false));
        let idle_target = Arc::clone(&self.target);
        let idle_open = Arc::clone(&self.editor_open);
        let idle_config = Arc::clone(&self.host_config);
        let idle_stopping = Arc::clone(&stopping);
        let idle_thread = std::thread::Builder::new()
            .name("winebridge-vst2-idle".into())
            .spawn(move || drive_editor_idle(idle_target, idle_open, idle_config, idle_stopping))?;

        let result = self.serve_dispatch();

        stopping.store(true, Ordering::SeqCst);
        self.editor_open.store(false, Ordering::SeqCst);
        let _ = self.control.shutdown(std::net::Shutdown::Both);
        let _ = self.parameters.shutdown(std::net::Shutdown::Both);
        let _ = self.process.shutdown(std::net::Shutdown::Both);
        let _ = control_thread.join();
        let _ = parameter_thread.join();
        let _ = process_thread.join();
        let _ = idle_thread.join();
        result
    }

    fn serve_dispatch(&mut self) -> Result<()> {
        loop {
            let request: DispatchRequest =
                match codec::read_frame(&mut self.dispatch, codec::DEFAULT_FRAME_CAP) {
                    Ok(request) => request,
                    Err(err) => {
                        debug!("dispatch channel closed: {}", err);
                        return Ok(());
                    }
                };
            let opcode = OpCode::try_from(request.opcode).ok();
            let shutting_down = opcode == Some(OpCode::Shutdown);

            match opcode {
                Some(OpCode::SetBlockSize) => self.last_block_size.set(request.value),
                Some(OpCode::SetPrecision) => self.last_precision.set(request.value),
                Some(OpCode::EditorOpen) => self.editor_open.store(true, Ordering::SeqCst),
                Some(OpCode::EditorClose) => self.editor_open.store(false, Ordering::SeqCst),
                _ => {}
            }

            let mut response = self.target.dispatch(request.clone());

            if opcode == Some(OpCode::StateChanged) && request.value != 0 {
                match self.enable_audio() {
                    Ok(descriptor) => response.payload = Payload::AudioShm(descriptor),
                    Err(err) => {
                        error!("failed to lay out the shared audio buffer: {}", err);
                        response.ret = 0;
                    }
                }
            }

            codec::write_frame(&mut self.dispatch, &response, codec::DEFAULT_FRAME_CAP)?;
            if shutting_down {
                return Ok(());
            }
        }
    }

    /// Lay out (or re-lay-out) the shared buffer for the current bus and
    /// block configuration and describe it to the native side.
    fn enable_audio(&self) -> Result<AudioShmDescriptor> {
        let fields = self.target.effect_fields();
        let config = AudioShmConfig {
            element_size: if self.last_precision.get() != 0 { 8 } else { 4 },
            max_block_size: self.last_block_size.get().clamp(1, i64::from(u32::MAX)) as u32,
            inputs: vec![fields.num_inputs.max(0) as u32],
            outputs: vec![fields.num_outputs.max(0) as u32],
        };
        let mut shm = self.shm.lock().unwrap_or_else(|e| e.into_inner());
        match shm.as_mut() {
            Some(buffer) if buffer.config() == &config => {}
            Some(buffer) => buffer.reconfigure(config.clone())?,
            None => *shm = Some(AudioShmBuffer::create(&self.shm_path, config.clone())?),
        }
        Ok(AudioShmDescriptor { file_name: self.shm_name.clone(), config })
    }
}

/// The paired channel streams of a foreign host, minus the callback
/// channel consumed by the router.
pub struct Vst2HostProcessStreams {
    control: UnixStream,
    dispatch: UnixStream,
    parameters: UnixStream,
    process: UnixStream,
}

fn serve_control(
    mut stream: UnixStream,
    target: Arc<dyn EffectTarget>,
    host_config: Arc<Mutex<ForeignHostConfig>>,
) {
    loop {
        let request: Vst2ControlRequest =
            match codec::read_frame(&mut stream, codec::DEFAULT_FRAME_CAP) {
                Ok(request) => request,
                Err(err) => {
                    debug!("control channel closed: {}", err);
                    return;
                }
            };
        let response = match request {
            Vst2ControlRequest::Version(theirs) => {
                let ours = VersionInfo::current();
                ours.check(&theirs);
                Vst2ControlResponse::Version(ours)
            }
            Vst2ControlRequest::Configure(config) => {
                *host_config.lock().unwrap_or_else(|e| e.into_inner()) = config;
                Vst2ControlResponse::Ack
            }
            Vst2ControlRequest::GetEffectFields => {
                Vst2ControlResponse::EffectFields(target.effect_fields())
            }
        };
        if let Err(err) = codec::write_frame(&mut stream, &response, codec::DEFAULT_FRAME_CAP) {
            debug!("control channel closed: {}", err);
            return;
        }
    }
}

fn serve_parameters(mut stream: UnixStream, target: Arc<dyn EffectTarget>) {
    loop {
        let request: ParameterRequest =
            match codec::read_frame(&mut stream, codec::DEFAULT_FRAME_CAP) {
                Ok(request) => request,
                Err(err) => {
                    debug!("parameters channel closed: {}", err);
                    return;
                }
            };
        let response = match request {
            ParameterRequest::Get { index } => {
                ParameterResponse { value: Some(target.get_parameter(index)) }
            }
            ParameterRequest::Set { index, value } => {
                target.set_parameter(index, value);
                ParameterResponse { value: None }
            }
        };
        if let Err(err) = codec::write_frame(&mut stream, &response, codec::DEFAULT_FRAME_CAP) {
            debug!("parameters channel closed: {}", err);
            return;
        }
    }
}

fn serve_audio(
    mut stream: UnixStream,
    target: Arc<dyn EffectTarget>,
    router: Arc<HostCallbackRouter>,
    shm: Arc<Mutex<Option<AudioShmBuffer>>>,
) {
    use std::io::Write;

    loop {
        let request: AudioRequest =
            match codec::read_frame(&mut stream, codec::DEFAULT_FRAME_CAP) {
                Ok(request) => request,
                Err(err) => {
                    debug!("process channel closed: {}", err);
                    return;
                }
            };

        if let Some(priority) = request.new_realtime_priority {
            if let Err(err) = set_realtime_priority(priority) {
                debug!("could not mirror realtime priority {}: {}", priority, err);
            }
        }

        // The per-block prefetch answers the plugin's synchronous host
        // queries for the duration of this block.
        let _time_guard = request.time_info.map(|info| router.time_cache.set(info));
        let _level_guard = request.process_level.map(|level| router.level_cache.set(level));

        {
            let _ftz = ScopedFlushToZero::new();
            let mut shm = shm.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(shm) = shm.as_mut() {
                let frames = request.sample_frames.max(0) as usize;
                if request.double_precision {
                    target.process_f64(shm, frames);
                } else {
                    target.process_f32(shm, frames);
                }
            }
        }

        if stream.write_all(&[AUDIO_ACK_BYTE]).is_err() {
            return;
        }
    }
}

fn drive_editor_idle(
    target: Arc<dyn EffectTarget>,
    editor_open: Arc<AtomicBool>,
    host_config: Arc<Mutex<ForeignHostConfig>>,
    stopping: Arc<AtomicBool>,
) {
    while !stopping.load(Ordering::SeqCst) {
        let rate = host_config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .frame_rate
            .unwrap_or(DEFAULT_IDLE_RATE_HZ)
            .max(1.0);
        std::thread::sleep(Duration::from_secs_f64(1.0 / rate));
        if editor_open.load(Ordering::SeqCst) && !stopping.load(Ordering::SeqCst) {
            target.dispatch(DispatchRequest {
                opcode: OpCode::EditorIdle.into(),
                index: 0,
                value: 0,
                opt: 0.0,
                payload: Payload::None,
            });
        }
    }
}
