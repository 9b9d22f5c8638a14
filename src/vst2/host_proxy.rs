//! Native side of the legacy bridge: the effect struct the DAW drives.

use std::os::raw::c_void;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use super::api::{self, consts, HostOpCode, OpCode};
use super::event::{
    capture_dispatch, AudioRequest, DispatchRequest, DispatchResponse, EventBlock,
    ForeignHostConfig, MidiEventData, ParameterRequest, Payload, Vst2ControlRequest,
    Vst2ControlResponse, AUDIO_ACK_BYTE,
};
use crate::config::BridgeConfig;
use crate::dispatcher::{spawn_receiver, EventHandler, ReceiverHandle};
use crate::error::{BridgeError, Result};
use crate::rt::PrioritySync;
use crate::shmem::AudioShmBuffer;
use crate::supervisor::HostProcess;
use crate::transport::{
    EventChannel, GroupEndpoints, SocketGroup, VersionInfo, HANDSHAKE_TIMEOUT,
};

/// Vendor string answered for `GetVendorString` when the DAW is hidden.
const HIDDEN_VENDOR: &str = "Steinberg Media Technologies";
/// Product string answered for `GetProductString` when the DAW is hidden.
const HIDDEN_PRODUCT: &str = "VST Host";

/// State shared between the bridge and its callback receiver thread.
struct HostSide {
    /// The DAW's callback, handed to us at load time.
    host_callback: api::HostCallbackProc,
    /// The host-visible effect struct, once constructed.
    effect: AtomicPtr<api::AEffect>,
    hide_daw: bool,
    /// MIDI bundles the plugin played back mid-block; flushed right after
    /// the audio call returns or the host would discard them.
    pending_midi: Mutex<Vec<Vec<MidiEventData>>>,
    /// Most recent window resize the plugin asked for; replayed on the
    /// next `EditorIdle` because some hosts require it on the GUI thread.
    pending_resize: Mutex<Option<(i32, i32)>>,
}

impl HostSide {
    fn call_host(&self, opcode: HostOpCode, index: i32, value: isize, ptr: *mut c_void, opt: f32) -> isize {
        let effect = self.effect.load(Ordering::Acquire);
        unsafe { (self.host_callback)(effect, opcode.into(), index, value, ptr, opt) }
    }

    fn fetch_time_info(&self, mask: i32) -> Option<api::TimeInfo> {
        let raw = self.call_host(HostOpCode::GetTime, 0, mask as isize, std::ptr::null_mut(), 0.0);
        if raw == 0 {
            None
        } else {
            Some(unsafe { *(raw as *const api::TimeInfo) })
        }
    }

    fn fetch_process_level(&self) -> Option<i32> {
        match self.call_host(HostOpCode::GetCurrentProcessLevel, 0, 0, std::ptr::null_mut(), 0.0) {
            0 => None,
            level => Some(level as i32),
        }
    }

    fn flush_pending_midi(&self) {
        let bundles = std::mem::take(
            &mut *self.pending_midi.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for bundle in bundles {
            let block = EventBlock::new(&bundle);
            self.call_host(
                HostOpCode::ProcessEvents,
                0,
                0,
                block.as_ptr() as *mut c_void,
                0.0,
            );
        }
    }

    fn drain_pending_resize(&self) {
        let resize =
            self.pending_resize.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((width, height)) = resize {
            self.call_host(HostOpCode::SizeWindow, width, height as isize, std::ptr::null_mut(), 0.0);
        }
    }
}

/// Routes plugin→host callbacks arriving on the callback channel.
impl EventHandler<DispatchRequest> for HostSide {
    fn handle(&self, request: DispatchRequest, _main_thread_safe: bool) -> DispatchResponse {
        let opcode = match HostOpCode::try_from(request.opcode) {
            Ok(opcode) => opcode,
            Err(_) => {
                debug!("unimplemented host opcode {}", request.opcode);
                return DispatchResponse::ret(0);
            }
        };

        match opcode {
            HostOpCode::GetTime => {
                let info = self.fetch_time_info(request.value as i32);
                DispatchResponse {
                    ret: i64::from(info.is_some()),
                    payload: info.map_or(Payload::None, Payload::TimeInfo),
                    aux: Payload::None,
                }
            }

            HostOpCode::ProcessEvents => {
                if let Payload::Events(events) = request.payload {
                    self.pending_midi.lock().unwrap_or_else(|e| e.into_inner()).push(events);
                }
                DispatchResponse::ret(1)
            }

            HostOpCode::SizeWindow => {
                *self.pending_resize.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some((request.index, request.value as i32));
                DispatchResponse::ret(1)
            }

            HostOpCode::GetVendorString if self.hide_daw => DispatchResponse {
                ret: 1,
                payload: Payload::Utf8(HIDDEN_VENDOR.to_string()),
                aux: Payload::None,
            },
            HostOpCode::GetProductString if self.hide_daw => DispatchResponse {
                ret: 1,
                payload: Payload::Utf8(HIDDEN_PRODUCT.to_string()),
                aux: Payload::None,
            },

            HostOpCode::GetVendorString | HostOpCode::GetProductString => {
                let mut buffer = [0u8; consts::MAX_VENDOR_STR_LEN];
                let ret = self.call_host(opcode, 0, 0, buffer.as_mut_ptr() as *mut c_void, 0.0);
                DispatchResponse {
                    ret: ret as i64,
                    payload: Payload::Utf8(unsafe {
                        api::read_string(buffer.as_ptr() as *const c_void)
                    }),
                    aux: Payload::None,
                }
            }

            HostOpCode::CanDo => {
                let can_do = match &request.payload {
                    Payload::Utf8(s) => s.clone(),
                    _ => String::new(),
                };
                let c_string = std::ffi::CString::new(can_do).unwrap_or_default();
                let ret = self.call_host(
                    opcode,
                    0,
                    0,
                    c_string.as_ptr() as *mut c_void,
                    0.0,
                );
                DispatchResponse::ret(ret as i64)
            }

            // Plain integer traffic is forwarded verbatim.
            HostOpCode::Automate
            | HostOpCode::Version
            | HostOpCode::CurrentId
            | HostOpCode::Idle
            | HostOpCode::IoChanged
            | HostOpCode::GetSampleRate
            | HostOpCode::GetBlockSize
            | HostOpCode::GetInputLatency
            | HostOpCode::GetOutputLatency
            | HostOpCode::GetCurrentProcessLevel
            | HostOpCode::GetAutomationState
            | HostOpCode::GetVendorVersion
            | HostOpCode::GetLanguage
            | HostOpCode::UpdateDisplay
            | HostOpCode::BeginEdit
            | HostOpCode::EndEdit => {
                let ret = self.call_host(
                    opcode,
                    request.index,
                    request.value as isize,
                    std::ptr::null_mut(),
                    request.opt,
                );
                DispatchResponse::ret(ret as i64)
            }

            other => {
                debug!("host opcode {:?} not bridged", other);
                DispatchResponse::ret(0)
            }
        }
    }
}

/// Pointer-stable storage backing the out-pointer returns of the last
/// dispatcher call. The ABI requires the addresses to stay valid until the
/// next call on the same channel; co-locating them with the bridge gives
/// them exactly that lifetime.
#[derive(Default)]
struct ResponseScratch {
    chunk: Vec<u8>,
    rect: Option<Box<api::Rect>>,
    arrangement_input: Vec<u8>,
    arrangement_output: Vec<u8>,
}

/// The native stub standing in for one foreign plugin.
///
/// All shared mutable state lives behind `EventChannel`/`Mutex`/`AtomicBool`;
/// the embedded `AEffect` only exposes raw ABI pointers (function pointers
/// and the host/plugin-owned `object`/`user` fields) that are never
/// dereferenced by `Vst2Bridge` itself, so the struct is safe to share
/// across threads despite those raw pointers disabling the auto traits.
pub struct Vst2Bridge {
    config: BridgeConfig,
    group: SocketGroup,
    foreign_host: Option<HostProcess>,
    control: EventChannel<Vst2ControlRequest>,
    dispatch: EventChannel<DispatchRequest>,
    parameters: EventChannel<ParameterRequest>,
    process: EventChannel<AudioRequest>,
    callback_receiver: Option<ReceiverHandle>,
    host_side: Arc<HostSide>,
    shm: Mutex<Option<AudioShmBuffer>>,
    scratch: Mutex<ResponseScratch>,
    priority_sync: PrioritySync,
    failed: AtomicBool,
    closed: AtomicBool,
    effect: Option<Box<api::AEffect>>,
}

// SAFETY: see the type-level doc comment above — the only non-auto-Send/Sync
// fields are raw ABI pointers inside `AEffect` that `Vst2Bridge` never reads
// or writes itself.
unsafe impl Send for Vst2Bridge {}
unsafe impl Sync for Vst2Bridge {}

impl Vst2Bridge {
    /// Spawn the foreign host for `plugin_path`, pair every channel, read
    /// the initial effect fields and build the host-visible effect struct.
    pub fn new(
        host_binary: &Path,
        plugin_path: &Path,
        config: BridgeConfig,
        host_callback: api::HostCallbackProc,
    ) -> Result<Box<Vst2Bridge>> {
        let spawn_config = config.clone();
        let host_binary = host_binary.to_path_buf();
        let plugin_path = plugin_path.to_path_buf();
        Vst2Bridge::with_launcher(config, host_callback, move |group| {
            HostProcess::spawn(&host_binary, group, &plugin_path, &spawn_config).map(Some)
        })
    }

    /// As [`new`](Self::new), but with the foreign process supplied by
    /// `launcher`. Orchestration layers that attach to an already running
    /// host (group hosting) return `None` instead of a child.
    pub fn with_launcher<F>(
        config: BridgeConfig,
        host_callback: api::HostCallbackProc,
        launcher: F,
    ) -> Result<Box<Vst2Bridge>>
    where
        F: FnOnce(&SocketGroup) -> Result<Option<HostProcess>>,
    {
        let group = SocketGroup::create()?;
        let endpoints = GroupEndpoints::bind(&group, &super::CHANNELS)?;
        let foreign_host = launcher(&group)?;

        let mut streams = endpoints.accept_all(HANDSHAKE_TIMEOUT, || {
            foreign_host.as_ref().map_or(Ok(()), |host| host.startup_liveness())
        })?;
        let control = EventChannel::<Vst2ControlRequest>::new(
            streams.remove("control").ok_or(BridgeError::Protocol("missing control channel"))?,
        );
        let ours = VersionInfo::current();
        match control.send_and_receive(&Vst2ControlRequest::Version(ours.clone()))? {
            Vst2ControlResponse::Version(theirs) => ours.check(&theirs),
            _ => return Err(BridgeError::Protocol("bad version response")),
        }
        control.send_and_receive(&Vst2ControlRequest::Configure(ForeignHostConfig {
            frame_rate: config.frame_rate,
            editor_force_dnd: config.editor_force_dnd,
        }))?;

        let dispatch = EventChannel::new(
            streams.remove("dispatch").ok_or(BridgeError::Protocol("missing dispatch channel"))?,
        );
        let parameters = EventChannel::new(
            streams
                .remove("parameters")
                .ok_or(BridgeError::Protocol("missing parameters channel"))?,
        );
        let process = EventChannel::new(
            streams.remove("process").ok_or(BridgeError::Protocol("missing process channel"))?,
        );
        let callback_stream =
            streams.remove("callback").ok_or(BridgeError::Protocol("missing callback channel"))?;

        let host_side = Arc::new(HostSide {
            host_callback,
            effect: AtomicPtr::new(std::ptr::null_mut()),
            hide_daw: config.hide_daw,
            pending_midi: Mutex::new(Vec::new()),
            pending_resize: Mutex::new(None),
        });
        let callback_receiver = spawn_receiver(
            "vst2-callback",
            callback_stream,
            Arc::clone(&host_side) as Arc<dyn EventHandler<DispatchRequest>>,
            crate::codec::DEFAULT_FRAME_CAP,
        )?;

        let mut bridge = Box::new(Vst2Bridge {
            config,
            group,
            foreign_host,
            control,
            dispatch,
            parameters,
            process,
            callback_receiver: Some(callback_receiver),
            host_side,
            shm: Mutex::new(None),
            scratch: Mutex::new(ResponseScratch::default()),
            priority_sync: PrioritySync::default(),
            failed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            effect: None,
        });

        // Read the freshly loaded plugin's fields and patch them into an
        // effect struct whose thunks resolve back to this bridge through
        // the reserved object slot.
        let fields = match bridge.control.send_and_receive(&Vst2ControlRequest::GetEffectFields)? {
            Vst2ControlResponse::EffectFields(fields) => fields,
            _ => return Err(BridgeError::Protocol("bad effect fields response")),
        };
        let mut effect = Box::new(new_effect(&mut *bridge));
        fields.apply(&mut effect);
        if bridge.config.prefer_32bit {
            effect.flags &= !api::flags::Plugin::CAN_DOUBLE_REPLACING.bits();
        }
        bridge.host_side.effect.store(&mut *effect, Ordering::Release);
        bridge.effect = Some(effect);

        if let Some(foreign_host) = bridge.foreign_host.as_mut() {
            foreign_host.start_monitor();
        }

        Ok(bridge)
    }

    /// The effect struct to hand to the host.
    pub fn effect_ptr(&mut self) -> *mut api::AEffect {
        self.effect
            .as_mut()
            .map(|effect| &mut **effect as *mut api::AEffect)
            .unwrap_or(std::ptr::null_mut())
    }

    fn fail(&self, err: &BridgeError) -> i64 {
        if err.is_fatal() {
            if !self.failed.swap(true, Ordering::SeqCst) {
                error!("legacy bridge channel failed: {}", err);
            }
        } else {
            warn!("legacy bridge call failed: {}", err);
        }
        0
    }

    /// Handle one host dispatcher call.
    ///
    /// # Safety
    /// `ptr` and `value` must match what the ABI mandates for `opcode`.
    pub unsafe fn dispatch(
        &self,
        opcode: i32,
        index: i32,
        value: isize,
        ptr: *mut c_void,
        opt: f32,
    ) -> isize {
        let opcode = match OpCode::try_from(opcode) {
            Ok(opcode) => opcode,
            Err(_) => {
                debug!("unimplemented opcode {}", opcode);
                return 0;
            }
        };
        if self.failed.load(Ordering::SeqCst) {
            return 0;
        }

        match opcode {
            // Not forwarded: the foreign side drives the plugin's idle from
            // its own timer. This entry point only replays GUI-affine
            // plugin requests on the host's GUI thread.
            OpCode::EditorIdle => {
                self.host_side.drain_pending_resize();
                return 0;
            }

            // The substitute editor handle this answers about is never
            // compatible across the process boundary.
            OpCode::CanDo => {
                if api::read_string(ptr) == "hasCockosViewAsConfig" {
                    return -1;
                }
            }

            // Offline processing and parameter properties are not bridged.
            OpCode::OfflineNotify
            | OpCode::OfflinePrepare
            | OpCode::OfflineRun
            | OpCode::ProcessVarIo
            | OpCode::GetParamInfo => return 0,

            _ => {}
        }

        if opcode == OpCode::Shutdown {
            self.closed.store(true, Ordering::SeqCst);
        }

        let request = capture_dispatch(opcode, index, value, ptr, opt);
        let response = match self.dispatch.send_and_receive(&request) {
            Ok(response) => response,
            Err(err) => return self.fail(&err) as isize,
        };

        if opcode == OpCode::StateChanged {
            if let Err(err) = self.apply_engine_state(value != 0, &response) {
                return self.fail(&err) as isize;
            }
        }

        self.write_back(opcode, value, ptr, &response)
    }

    /// Apply an audio engine state change: map (or remap) the shared
    /// buffer the foreign side laid out on enable.
    fn apply_engine_state(&self, enabled: bool, response: &DispatchResponse) -> Result<()> {
        if !enabled {
            return Ok(());
        }
        let descriptor = match &response.payload {
            Payload::AudioShm(descriptor) => descriptor,
            _ => return Err(BridgeError::Protocol("audio engine enable returned no buffer")),
        };
        let path = self.group.dir().join(&descriptor.file_name);
        let buffer = AudioShmBuffer::open(&path)?;
        if buffer.config() != &descriptor.config {
            return Err(BridgeError::Protocol("audio buffer header does not match descriptor"));
        }
        *self.shm.lock().unwrap_or_else(|e| e.into_inner()) = Some(buffer);
        Ok(())
    }

    /// Write a response back through the ABI's output conventions.
    unsafe fn write_back(
        &self,
        opcode: OpCode,
        value: isize,
        ptr: *mut c_void,
        response: &DispatchResponse,
    ) -> isize {
        let mut scratch = self.scratch.lock().unwrap_or_else(|e| e.into_inner());
        match (&response.payload, opcode) {
            (Payload::EffectFields(fields), _) => {
                let effect = self.host_side.effect.load(Ordering::Acquire);
                if !effect.is_null() {
                    fields.apply(&mut *effect);
                }
            }

            (Payload::Utf8(text), OpCode::GetMidiKeyName) => {
                let out = ptr as *mut api::MidiKeyName;
                api::copy_string(
                    (*out).key_name.as_mut_ptr() as *mut c_void,
                    text,
                    consts::MAX_LABEL,
                );
            }

            (Payload::Utf8(text), _) => {
                api::copy_string(ptr, text, string_capacity(opcode));
            }

            (Payload::Bytes(bytes), OpCode::GetData) => {
                scratch.chunk = bytes.clone();
                *(ptr as *mut *mut c_void) = scratch.chunk.as_ptr() as *mut c_void;
                return scratch.chunk.len() as isize;
            }

            (Payload::Rect(rect), OpCode::EditorGetRect) => {
                let stable = scratch.rect.get_or_insert_with(Default::default);
                **stable = *rect;
                *(ptr as *mut *mut api::Rect) = &mut **stable;
            }

            (Payload::PinProperties(pin), _) => {
                pin.write_to(ptr as *mut api::ChannelProperties);
            }

            (Payload::SpeakerArrangements { input, output }, OpCode::GetSpeakerArrangement) => {
                scratch.arrangement_input = vec![0; input.raw_len()];
                input.write_to(&mut scratch.arrangement_input);
                scratch.arrangement_output = vec![0; output.raw_len()];
                output.write_to(&mut scratch.arrangement_output);
                *(value as *mut *mut api::SpeakerArrangement) =
                    scratch.arrangement_input.as_mut_ptr() as *mut api::SpeakerArrangement;
                *(ptr as *mut *mut api::SpeakerArrangement) =
                    scratch.arrangement_output.as_mut_ptr() as *mut api::SpeakerArrangement;
            }

            _ => {}
        }
        response.ret as isize
    }

    /// Forward a parameter write over the parameters channel.
    pub fn set_parameter(&self, index: i32, value: f32) {
        if self.failed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.parameters.send_and_receive(&ParameterRequest::Set { index, value })
        {
            self.fail(&err);
        }
    }

    /// Forward a parameter read over the parameters channel.
    pub fn get_parameter(&self, index: i32) -> f32 {
        if self.failed.load(Ordering::SeqCst) {
            return 0.0;
        }
        match self.parameters.send_and_receive(&ParameterRequest::Get { index }) {
            Ok(response) => response.value.unwrap_or(0.0),
            Err(err) => {
                self.fail(&err);
                0.0
            }
        }
    }

    fn audio_round_trip(&self, request: &AudioRequest) -> Result<()> {
        self.process.with_stream(|stream, cap| {
            crate::codec::write_frame(stream, request, cap)?;
            let mut ack = [0u8; 1];
            use std::io::Read;
            stream.read_exact(&mut ack)?;
            if ack[0] == AUDIO_ACK_BYTE {
                Ok(())
            } else {
                Err(BridgeError::Protocol("bad audio acknowledgement"))
            }
        })
    }

    fn block_request(&self, sample_frames: i32, double_precision: bool) -> AudioRequest {
        AudioRequest {
            sample_frames,
            double_precision,
            time_info: self
                .host_side
                .fetch_time_info(api::flags::TimeInfo::all().bits()),
            process_level: self.host_side.fetch_process_level(),
            new_realtime_priority: self.priority_sync.poll(),
        }
    }

    /// Run one single precision block through the foreign plugin.
    ///
    /// # Safety
    /// The pointer arrays must hold the effect's input/output channel
    /// counts of buffers, each `sample_frames` long.
    pub unsafe fn process_replacing(
        &self,
        inputs: *const *const f32,
        outputs: *mut *mut f32,
        sample_frames: i32,
    ) {
        if self.failed.load(Ordering::SeqCst) {
            return;
        }
        let request = self.block_request(sample_frames, false);
        let frames = sample_frames.max(0) as usize;
        {
            let mut shm = self.shm.lock().unwrap_or_else(|e| e.into_inner());
            let shm = match shm.as_mut() {
                Some(shm) => shm,
                None => return,
            };
            for channel in 0..shm.config().inputs.first().copied().unwrap_or(0) as usize {
                let input = std::slice::from_raw_parts(*inputs.add(channel), frames);
                shm.input_f32_mut(0, channel, frames).copy_from_slice(input);
            }
            if let Err(err) = self.audio_round_trip(&request) {
                self.fail(&err);
                return;
            }
            for channel in 0..shm.config().outputs.first().copied().unwrap_or(0) as usize {
                let output = std::slice::from_raw_parts_mut(*outputs.add(channel), frames);
                output.copy_from_slice(shm.output_f32(0, channel, frames));
            }
        }
        self.host_side.flush_pending_midi();
    }

    /// Run one double precision block through the foreign plugin.
    ///
    /// # Safety
    /// As [`process_replacing`](Self::process_replacing).
    pub unsafe fn process_replacing_f64(
        &self,
        inputs: *const *const f64,
        outputs: *mut *mut f64,
        sample_frames: i32,
    ) {
        if self.failed.load(Ordering::SeqCst) {
            return;
        }
        let request = self.block_request(sample_frames, true);
        let frames = sample_frames.max(0) as usize;
        {
            let mut shm = self.shm.lock().unwrap_or_else(|e| e.into_inner());
            let shm = match shm.as_mut() {
                Some(shm) => shm,
                None => return,
            };
            for channel in 0..shm.config().inputs.first().copied().unwrap_or(0) as usize {
                let input = std::slice::from_raw_parts(*inputs.add(channel), frames);
                shm.input_f64_mut(0, channel, frames).copy_from_slice(input);
            }
            if let Err(err) = self.audio_round_trip(&request) {
                self.fail(&err);
                return;
            }
            for channel in 0..shm.config().outputs.first().copied().unwrap_or(0) as usize {
                let output = std::slice::from_raw_parts_mut(*outputs.add(channel), frames);
                output.copy_from_slice(shm.output_f64(0, channel, frames));
            }
        }
        self.host_side.flush_pending_midi();
    }
}

impl Drop for Vst2Bridge {
    fn drop(&mut self) {
        // The remote end may already be gone; teardown tolerates both.
        if !self.failed.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst) {
            let _ = self.dispatch.send_and_receive(&DispatchRequest {
                opcode: OpCode::Shutdown.into(),
                index: 0,
                value: 0,
                opt: 0.0,
                payload: Payload::None,
            });
        }
        self.control.shutdown();
        if let Some(receiver) = self.callback_receiver.take() {
            receiver.shutdown();
        }
        self.dispatch.shutdown();
        self.parameters.shutdown();
        self.process.shutdown();
        *self.shm.lock().unwrap_or_else(|e| e.into_inner()) = None;
        if let Some(foreign_host) = self.foreign_host.take() {
            foreign_host.terminate();
        }
    }
}

fn string_capacity(opcode: OpCode) -> usize {
    match opcode {
        OpCode::GetParameterLabel | OpCode::GetParameterDisplay | OpCode::GetParameterName => {
            consts::MAX_PARAM_STR_LEN
        }
        OpCode::GetCurrentPresetName | OpCode::GetPresetName => consts::MAX_PRESET_NAME_LEN,
        _ => consts::MAX_PRODUCT_STR_LEN,
    }
}

/// Build the host-visible effect struct wired to the bridge thunks.
///
/// Each thunk recovers the bridge through the struct's object slot, so any
/// number of bridged instances coexist without process-global state.
fn new_effect(bridge: *mut Vst2Bridge) -> api::AEffect {
    api::AEffect {
        magic: consts::VST_MAGIC,
        dispatcher: dispatch_thunk,
        _process: process_deprecated_thunk,
        setParameter: set_parameter_thunk,
        getParameter: get_parameter_thunk,
        numPrograms: 0,
        numParams: 0,
        numInputs: 0,
        numOutputs: 0,
        flags: 0,
        reserved1: 0,
        reserved2: 0,
        initialDelay: 0,
        _realQualities: 0,
        _offQualities: 0,
        _ioRatio: 0.0,
        object: bridge as *mut c_void,
        user: std::ptr::null_mut(),
        uniqueId: 0,
        version: 0,
        processReplacing: process_replacing_thunk,
        processReplacingF64: process_replacing_f64_thunk,
        future: [0u8; 56],
    }
}

unsafe fn bridge_of(effect: *mut api::AEffect) -> *mut Vst2Bridge {
    (*effect).object as *mut Vst2Bridge
}

unsafe extern "C" fn dispatch_thunk(
    effect: *mut api::AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> isize {
    let bridge = bridge_of(effect);
    let ret = (*bridge).dispatch(opcode, index, value, ptr, opt);
    if matches!(OpCode::try_from(opcode), Ok(OpCode::Shutdown)) {
        // Deletion is deferred until after the return value has been
        // captured; the host still owns `effect` during the call itself.
        drop(Box::from_raw(bridge));
    }
    ret
}

unsafe extern "C" fn set_parameter_thunk(effect: *mut api::AEffect, index: i32, value: f32) {
    (*bridge_of(effect)).set_parameter(index, value);
}

unsafe extern "C" fn get_parameter_thunk(effect: *mut api::AEffect, index: i32) -> f32 {
    (*bridge_of(effect)).get_parameter(index)
}

unsafe extern "C" fn process_replacing_thunk(
    effect: *mut api::AEffect,
    inputs: *const *const f32,
    outputs: *mut *mut f32,
    sample_frames: i32,
) {
    (*bridge_of(effect)).process_replacing(inputs, outputs, sample_frames);
}

unsafe extern "C" fn process_replacing_f64_thunk(
    effect: *mut api::AEffect,
    inputs: *const *const f64,
    outputs: *mut *mut f64,
    sample_frames: i32,
) {
    (*bridge_of(effect)).process_replacing_f64(inputs, outputs, sample_frames);
}

unsafe extern "C" fn process_deprecated_thunk(
    _effect: *mut api::AEffect,
    _inputs: *const *const f32,
    _outputs: *mut *mut f32,
    _sample_frames: i32,
) {
}
