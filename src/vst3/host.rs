//! Foreign side of the modern bridge: the object table and its handlers.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, Weak};

use super::messages::{
    tresult, AttributeMessage, BusDirection, BusInfoData, CallbackRequest, CallbackResponse, Cid,
    ControlRequest, ControlResponse, InterfaceFlags, MediaType, ParameterInfoData, ProcessData,
    ProcessRequest, ProcessResponse, ProcessSetup, ProgramListInfoData, UnitInfoData, ViewRect,
};
use super::registry::Registry;
use crate::codec;
use crate::error::{BridgeError, Result};
use crate::rt::{set_realtime_priority, ScopedFlushToZero};
use crate::shmem::{AudioShmBuffer, AudioShmConfig, AudioShmDescriptor};
use crate::transport::{connect_group, EventChannel, SocketGroup, VersionInfo, HANDSHAKE_TIMEOUT};

/// Host-owned component handler as seen by the plugin side.
pub trait ComponentHandlerSink: Send + Sync {
    /// A parameter gesture begins.
    fn begin_edit(&self, param_id: u32) -> i32;
    /// A normalized parameter value changed.
    fn perform_edit(&self, param_id: u32, value: f64) -> i32;
    /// A parameter gesture ends.
    fn end_edit(&self, param_id: u32) -> i32;
    /// The component changed and the host should re-read it.
    fn restart_component(&self, flags: i32) -> i32;
}

/// Receiving end of a connection point.
pub trait MessageSink: Send + Sync {
    /// Deliver one attribute message.
    fn notify(&self, message: &AttributeMessage) -> i32;
}

/// Host context as seen by the plugin side.
pub trait HostContextHandle: Send + Sync {
    /// The host application name.
    fn name(&self) -> String;
}

/// Plug frame as seen by the plugin's editor view.
pub trait FrameSink: Send + Sync {
    /// The view asks its frame for a new size.
    fn resize_view(&self, rect: ViewRect) -> i32;
}

/// Everything a processing call produced besides the samples.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ProcessOutput {
    /// The processor's result code.
    pub result: i32,
    /// Output parameter automation.
    pub output_params: Vec<super::messages::ParameterQueue>,
    /// Output events.
    pub output_events: Vec<super::messages::Event>,
    /// Per output bus silence flags.
    pub silence_flags: Vec<u64>,
}

/// The real plugin object seam.
///
/// The module-loading glue adapts the loaded class's interfaces onto this
/// trait; tests substitute plain Rust. One object per instance id.
#[allow(missing_docs)]
pub trait Vst3Plugin: Send {
    /// Which interfaces the object implements, probed at construction.
    fn capabilities(&self) -> InterfaceFlags;

    fn initialize(&mut self, context: Option<Arc<dyn HostContextHandle>>) -> i32;
    fn terminate(&mut self) -> i32;

    fn set_component_handler(&mut self, handler: Option<Arc<dyn ComponentHandlerSink>>) -> i32;
    fn connect(&mut self, peer: Arc<dyn MessageSink>) -> i32;
    fn disconnect(&mut self) -> i32;
    fn notify(&mut self, message: &AttributeMessage) -> i32;

    fn get_state(&mut self, scope: super::messages::StateScope) -> Option<Vec<u8>>;
    fn set_state(&mut self, scope: super::messages::StateScope, data: &[u8]) -> i32;

    fn bus_count(&self, media_type: MediaType, direction: BusDirection) -> i32;
    fn bus_info(
        &self,
        media_type: MediaType,
        direction: BusDirection,
        index: i32,
    ) -> Option<BusInfoData>;
    fn activate_bus(
        &mut self,
        media_type: MediaType,
        direction: BusDirection,
        index: i32,
        active: bool,
    ) -> i32;

    fn setup_processing(&mut self, setup: &ProcessSetup) -> i32;
    fn set_processing(&mut self, active: bool) -> i32;
    fn set_active(&mut self, active: bool) -> i32;
    fn process(&mut self, shm: &mut AudioShmBuffer, data: &ProcessData) -> ProcessOutput;

    fn parameter_count(&self) -> i32;
    fn parameter_info(&self, index: i32) -> Option<ParameterInfoData>;
    fn param_normalized(&self, param_id: u32) -> f64;
    fn set_param_normalized(&mut self, param_id: u32, value: f64) -> i32;
    fn param_string_by_value(&self, param_id: u32, value: f64) -> Option<String>;

    fn unit_count(&self) -> i32;
    fn unit_info(&self, index: i32) -> Option<UnitInfoData>;
    fn program_list_count(&self) -> i32;
    fn program_list_info(&self, index: i32) -> Option<ProgramListInfoData>;
    fn program_data(&mut self, list_id: i32, program_index: i32) -> Option<Vec<u8>>;
    fn set_program_data(&mut self, list_id: i32, program_index: i32, data: &[u8]) -> i32;

    fn create_view(&mut self) -> bool;
    fn set_frame(&mut self, frame: Option<Arc<dyn FrameSink>>) -> i32;
    fn view_size(&self) -> Option<ViewRect>;
    fn attach_view(&mut self, parent: u64) -> i32;
    fn remove_view(&mut self) -> i32;
    fn on_view_size(&mut self, rect: ViewRect) -> i32;
}

/// Creates plugin objects for class ids, backed by the loaded module's
/// class factory.
pub trait Vst3Factory: Send + Sync {
    /// Instantiate the class, or `None` when the module does not export it.
    fn create(&self, cid: &Cid) -> Option<Box<dyn Vst3Plugin>>;
}

/// A plugin object shared between the control and audio handlers.
pub type PluginHandle = Arc<Mutex<Box<dyn Vst3Plugin>>>;

/// Connection endpoint that delivers directly to a peer object in the same
/// process. Messages between two bridged plugins never cross the sockets.
struct PeerSink {
    peer: Weak<Mutex<Box<dyn Vst3Plugin>>>,
}

impl MessageSink for PeerSink {
    fn notify(&self, message: &AttributeMessage) -> i32 {
        match self.peer.upgrade() {
            Some(peer) => peer.lock().unwrap_or_else(|e| e.into_inner()).notify(message),
            None => tresult::FALSE,
        }
    }
}

/// Connection endpoint mirroring a host-owned object on the native side.
struct HostSink {
    channel: Arc<EventChannel<CallbackRequest>>,
    instance_id: u64,
}

impl MessageSink for HostSink {
    fn notify(&self, message: &AttributeMessage) -> i32 {
        match self.channel.send_and_receive(&CallbackRequest::Notify {
            instance_id: self.instance_id,
            message: message.clone(),
        }) {
            Ok(CallbackResponse::Result(result)) => result,
            Ok(_) => tresult::INTERNAL_ERROR,
            Err(err) => {
                warn!("connection notify callback failed: {}", err);
                tresult::INTERNAL_ERROR
            }
        }
    }
}

/// Component handler proxy forwarding every callback with its instance id.
struct ComponentHandlerProxy {
    channel: Arc<EventChannel<CallbackRequest>>,
    instance_id: u64,
}

impl ComponentHandlerProxy {
    fn forward(&self, request: CallbackRequest) -> i32 {
        match self.channel.send_and_receive(&request) {
            Ok(CallbackResponse::Result(result)) => result,
            Ok(_) => tresult::INTERNAL_ERROR,
            Err(err) => {
                warn!("component handler callback failed: {}", err);
                tresult::INTERNAL_ERROR
            }
        }
    }
}

impl ComponentHandlerSink for ComponentHandlerProxy {
    fn begin_edit(&self, param_id: u32) -> i32 {
        self.forward(CallbackRequest::BeginEdit { instance_id: self.instance_id, param_id })
    }

    fn perform_edit(&self, param_id: u32, value: f64) -> i32 {
        self.forward(CallbackRequest::PerformEdit {
            instance_id: self.instance_id,
            param_id,
            value,
        })
    }

    fn end_edit(&self, param_id: u32) -> i32 {
        self.forward(CallbackRequest::EndEdit { instance_id: self.instance_id, param_id })
    }

    fn restart_component(&self, flags: i32) -> i32 {
        self.forward(CallbackRequest::RestartComponent { instance_id: self.instance_id, flags })
    }
}

/// Plug frame proxy forwarding view resize requests to the native side.
struct FrameProxy {
    channel: Arc<EventChannel<CallbackRequest>>,
    instance_id: u64,
}

impl FrameSink for FrameProxy {
    fn resize_view(&self, rect: ViewRect) -> i32 {
        match self
            .channel
            .send_and_receive(&CallbackRequest::ResizeView { instance_id: self.instance_id, rect })
        {
            Ok(CallbackResponse::Result(result)) => result,
            Ok(_) => tresult::INTERNAL_ERROR,
            Err(err) => {
                warn!("view resize callback failed: {}", err);
                tresult::INTERNAL_ERROR
            }
        }
    }
}

/// Host context proxy answering through the callback channel.
struct HostContextProxy {
    channel: Arc<EventChannel<CallbackRequest>>,
    instance_id: u64,
}

impl HostContextHandle for HostContextProxy {
    fn name(&self) -> String {
        match self
            .channel
            .send_and_receive(&CallbackRequest::GetHostName { instance_id: self.instance_id })
        {
            Ok(CallbackResponse::Name(name)) => name,
            _ => String::new(),
        }
    }
}

/// State shared by every serving loop of the foreign process.
pub struct Vst3HostContext {
    factory: Arc<dyn Vst3Factory>,
    registry: Registry<PluginHandle>,
    callback: Arc<EventChannel<CallbackRequest>>,
    setups: Mutex<HashMap<u64, ProcessSetup>>,
    shms: Mutex<HashMap<u64, AudioShmBuffer>>,
    shm_dir: std::path::PathBuf,
}

impl Vst3HostContext {
    fn plugin(&self, instance_id: u64) -> Result<PluginHandle> {
        self.registry.get(instance_id).ok_or(BridgeError::UnknownInstance(instance_id))
    }

    /// Lay out the shared buffer for an activated processor.
    fn activate_buffer(&self, instance_id: u64) -> Result<AudioShmDescriptor> {
        let plugin = self.plugin(instance_id)?;
        let plugin = plugin.lock().unwrap_or_else(|e| e.into_inner());
        let setup = self
            .setups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&instance_id)
            .copied()
            .ok_or(BridgeError::Protocol("activated without a processing setup"))?;

        let buses = |direction| -> Vec<u32> {
            (0..plugin.bus_count(MediaType::Audio, direction))
                .map(|index| {
                    plugin
                        .bus_info(MediaType::Audio, direction, index)
                        .map_or(0, |info| info.channel_count.max(0) as u32)
                })
                .collect()
        };
        let config = AudioShmConfig {
            element_size: if setup.symbolic_sample_size == 1 { 8 } else { 4 },
            max_block_size: setup.max_samples_per_block.max(1) as u32,
            inputs: buses(BusDirection::Input),
            outputs: buses(BusDirection::Output),
        };

        let file_name = format!("audio-{}.shm", instance_id);
        let path = self.shm_dir.join(&file_name);
        let mut shms = self.shms.lock().unwrap_or_else(|e| e.into_inner());
        match shms.get_mut(&instance_id) {
            Some(buffer) if buffer.config() == &config => {}
            Some(buffer) => buffer.reconfigure(config.clone())?,
            None => {
                shms.insert(instance_id, AudioShmBuffer::create(&path, config.clone())?);
            }
        }
        Ok(AudioShmDescriptor { file_name, config })
    }

    /// Service one control request.
    pub fn handle_control(&self, request: ControlRequest) -> ControlResponse {
        match self.try_handle_control(request) {
            Ok(response) => response,
            Err(BridgeError::UnknownInstance(id)) => {
                warn!("control request for unknown instance {}", id);
                ControlResponse::Result(tresult::INTERNAL_ERROR)
            }
            Err(err) => {
                error!("control request failed: {}", err);
                ControlResponse::Result(tresult::INTERNAL_ERROR)
            }
        }
    }

    fn try_handle_control(&self, request: ControlRequest) -> Result<ControlResponse> {
        Ok(match request {
            ControlRequest::Version(theirs) => {
                let ours = VersionInfo::current();
                ours.check(&theirs);
                ControlResponse::Version(ours)
            }

            ControlRequest::CreateInstance { cid } => match self.factory.create(&cid) {
                Some(plugin) => {
                    let capabilities = plugin.capabilities();
                    let instance_id = self.registry.insert(Arc::new(Mutex::new(plugin)));
                    debug!("created instance {} with {:?}", instance_id, capabilities);
                    ControlResponse::Created { instance_id, capabilities: capabilities.bits() }
                }
                None => ControlResponse::Result(tresult::NO_INTERFACE),
            },

            ControlRequest::Initialize { instance_id, has_context } => {
                let context: Option<Arc<dyn HostContextHandle>> = has_context.then(|| {
                    Arc::new(HostContextProxy {
                        channel: Arc::clone(&self.callback),
                        instance_id,
                    }) as Arc<dyn HostContextHandle>
                });
                let plugin = self.plugin(instance_id)?;
                let result =
                    plugin.lock().unwrap_or_else(|e| e.into_inner()).initialize(context);
                ControlResponse::Result(result)
            }

            ControlRequest::Terminate { instance_id } => {
                let plugin = self.plugin(instance_id)?;
                let result = plugin.lock().unwrap_or_else(|e| e.into_inner()).terminate();
                ControlResponse::Result(result)
            }

            ControlRequest::SetComponentHandler { instance_id, present } => {
                let handler: Option<Arc<dyn ComponentHandlerSink>> = present.then(|| {
                    Arc::new(ComponentHandlerProxy {
                        channel: Arc::clone(&self.callback),
                        instance_id,
                    }) as Arc<dyn ComponentHandlerSink>
                });
                let plugin = self.plugin(instance_id)?;
                let result = plugin
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .set_component_handler(handler);
                ControlResponse::Result(result)
            }

            ControlRequest::Connect { instance_id, other } => {
                let plugin = self.plugin(instance_id)?;
                let peer = self.plugin(other)?;
                let sink = Arc::new(PeerSink { peer: Arc::downgrade(&peer) });
                let result = plugin.lock().unwrap_or_else(|e| e.into_inner()).connect(sink);
                ControlResponse::Result(result)
            }

            ControlRequest::ConnectProxy { instance_id } => {
                let plugin = self.plugin(instance_id)?;
                let sink = Arc::new(HostSink {
                    channel: Arc::clone(&self.callback),
                    instance_id,
                });
                let result = plugin.lock().unwrap_or_else(|e| e.into_inner()).connect(sink);
                ControlResponse::Result(result)
            }

            ControlRequest::Disconnect { instance_id } => {
                let plugin = self.plugin(instance_id)?;
                let result = plugin.lock().unwrap_or_else(|e| e.into_inner()).disconnect();
                ControlResponse::Result(result)
            }

            ControlRequest::Notify { instance_id, message } => {
                let plugin = self.plugin(instance_id)?;
                let result = plugin.lock().unwrap_or_else(|e| e.into_inner()).notify(&message);
                ControlResponse::Result(result)
            }

            ControlRequest::GetState { instance_id, scope } => {
                let plugin = self.plugin(instance_id)?;
                let state = plugin.lock().unwrap_or_else(|e| e.into_inner()).get_state(scope);
                match state {
                    Some(data) => ControlResponse::State { result: tresult::OK, data },
                    None => ControlResponse::State { result: tresult::FALSE, data: Vec::new() },
                }
            }

            ControlRequest::SetState { instance_id, scope, data } => {
                let plugin = self.plugin(instance_id)?;
                let result =
                    plugin.lock().unwrap_or_else(|e| e.into_inner()).set_state(scope, &data);
                ControlResponse::Result(result)
            }

            ControlRequest::GetBusCount { instance_id, media_type, direction } => {
                let plugin = self.plugin(instance_id)?;
                let count = plugin
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .bus_count(media_type, direction);
                ControlResponse::Count(count)
            }

            ControlRequest::GetBusInfo { instance_id, media_type, direction, index } => {
                let plugin = self.plugin(instance_id)?;
                let info = plugin
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .bus_info(media_type, direction, index);
                match info {
                    Some(info) => ControlResponse::BusInfo { result: tresult::OK, info },
                    None => ControlResponse::BusInfo {
                        result: tresult::FALSE,
                        info: BusInfoData::default(),
                    },
                }
            }

            ControlRequest::ActivateBus { instance_id, media_type, direction, index, active } => {
                let plugin = self.plugin(instance_id)?;
                let result = plugin
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .activate_bus(media_type, direction, index, active);
                ControlResponse::Result(result)
            }

            ControlRequest::SetupProcessing { instance_id, setup } => {
                self.setups
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(instance_id, setup);
                let plugin = self.plugin(instance_id)?;
                let result = plugin
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .setup_processing(&setup);
                ControlResponse::Result(result)
            }

            ControlRequest::SetProcessing { instance_id, active } => {
                let plugin = self.plugin(instance_id)?;
                let result =
                    plugin.lock().unwrap_or_else(|e| e.into_inner()).set_processing(active);
                ControlResponse::Result(result)
            }

            ControlRequest::SetActive { instance_id, active } => {
                let plugin = self.plugin(instance_id)?;
                let result =
                    plugin.lock().unwrap_or_else(|e| e.into_inner()).set_active(active);
                drop(plugin);
                if active && result == tresult::OK {
                    let buffer = self.activate_buffer(instance_id)?;
                    ControlResponse::Activated { result, buffer: Some(buffer) }
                } else {
                    ControlResponse::Activated { result, buffer: None }
                }
            }

            ControlRequest::GetParameterCount { instance_id } => {
                let plugin = self.plugin(instance_id)?;
                let count = plugin.lock().unwrap_or_else(|e| e.into_inner()).parameter_count();
                ControlResponse::Count(count)
            }

            ControlRequest::GetParameterInfo { instance_id, index } => {
                let plugin = self.plugin(instance_id)?;
                let info =
                    plugin.lock().unwrap_or_else(|e| e.into_inner()).parameter_info(index);
                match info {
                    Some(info) => ControlResponse::ParameterInfo { result: tresult::OK, info },
                    None => ControlResponse::ParameterInfo {
                        result: tresult::FALSE,
                        info: ParameterInfoData::default(),
                    },
                }
            }

            ControlRequest::GetParamNormalized { instance_id, param_id } => {
                let plugin = self.plugin(instance_id)?;
                let value =
                    plugin.lock().unwrap_or_else(|e| e.into_inner()).param_normalized(param_id);
                ControlResponse::Value(value)
            }

            ControlRequest::SetParamNormalized { instance_id, param_id, value } => {
                let plugin = self.plugin(instance_id)?;
                let result = plugin
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .set_param_normalized(param_id, value);
                ControlResponse::Result(result)
            }

            ControlRequest::GetParamStringByValue { instance_id, param_id, value } => {
                let plugin = self.plugin(instance_id)?;
                let text = plugin
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .param_string_by_value(param_id, value);
                match text {
                    Some(text) => ControlResponse::String { result: tresult::OK, text },
                    None => {
                        ControlResponse::String { result: tresult::FALSE, text: String::new() }
                    }
                }
            }

            ControlRequest::GetUnitCount { instance_id } => {
                let plugin = self.plugin(instance_id)?;
                let count = plugin.lock().unwrap_or_else(|e| e.into_inner()).unit_count();
                ControlResponse::Count(count)
            }

            ControlRequest::GetUnitInfo { instance_id, index } => {
                let plugin = self.plugin(instance_id)?;
                let info = plugin.lock().unwrap_or_else(|e| e.into_inner()).unit_info(index);
                match info {
                    Some(info) => ControlResponse::UnitInfo { result: tresult::OK, info },
                    None => ControlResponse::UnitInfo {
                        result: tresult::FALSE,
                        info: UnitInfoData::default(),
                    },
                }
            }

            ControlRequest::GetProgramListCount { instance_id } => {
                let plugin = self.plugin(instance_id)?;
                let count =
                    plugin.lock().unwrap_or_else(|e| e.into_inner()).program_list_count();
                ControlResponse::Count(count)
            }

            ControlRequest::GetProgramListInfo { instance_id, index } => {
                let plugin = self.plugin(instance_id)?;
                let info =
                    plugin.lock().unwrap_or_else(|e| e.into_inner()).program_list_info(index);
                match info {
                    Some(info) => ControlResponse::ProgramListInfo { result: tresult::OK, info },
                    None => ControlResponse::ProgramListInfo {
                        result: tresult::FALSE,
                        info: ProgramListInfoData::default(),
                    },
                }
            }

            ControlRequest::GetProgramData { instance_id, list_id, program_index } => {
                let plugin = self.plugin(instance_id)?;
                let data = plugin
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .program_data(list_id, program_index);
                match data {
                    Some(data) => ControlResponse::State { result: tresult::OK, data },
                    None => ControlResponse::State { result: tresult::FALSE, data: Vec::new() },
                }
            }

            ControlRequest::SetProgramData { instance_id, list_id, program_index, data } => {
                let plugin = self.plugin(instance_id)?;
                let result = plugin
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .set_program_data(list_id, program_index, &data);
                ControlResponse::Result(result)
            }

            ControlRequest::CreateView { instance_id } => {
                let plugin = self.plugin(instance_id)?;
                let mut plugin = plugin.lock().unwrap_or_else(|e| e.into_inner());
                if plugin.create_view() {
                    plugin.set_frame(Some(Arc::new(FrameProxy {
                        channel: Arc::clone(&self.callback),
                        instance_id,
                    })));
                    ControlResponse::View { result: tresult::OK, size: plugin.view_size() }
                } else {
                    ControlResponse::View { result: tresult::FALSE, size: None }
                }
            }

            ControlRequest::AttachView { instance_id, parent } => {
                let plugin = self.plugin(instance_id)?;
                let result =
                    plugin.lock().unwrap_or_else(|e| e.into_inner()).attach_view(parent);
                ControlResponse::Result(result)
            }

            ControlRequest::RemoveView { instance_id } => {
                let plugin = self.plugin(instance_id)?;
                let mut plugin = plugin.lock().unwrap_or_else(|e| e.into_inner());
                plugin.set_frame(None);
                ControlResponse::Result(plugin.remove_view())
            }

            ControlRequest::GetViewSize { instance_id } => {
                let plugin = self.plugin(instance_id)?;
                let size = plugin.lock().unwrap_or_else(|e| e.into_inner()).view_size();
                ControlResponse::View {
                    result: if size.is_some() { tresult::OK } else { tresult::FALSE },
                    size,
                }
            }

            ControlRequest::OnViewSize { instance_id, rect } => {
                let plugin = self.plugin(instance_id)?;
                let result =
                    plugin.lock().unwrap_or_else(|e| e.into_inner()).on_view_size(rect);
                ControlResponse::Result(result)
            }

            ControlRequest::Destruct { instance_id } => {
                self.setups.lock().unwrap_or_else(|e| e.into_inner()).remove(&instance_id);
                self.shms.lock().unwrap_or_else(|e| e.into_inner()).remove(&instance_id);
                match self.registry.remove(instance_id) {
                    Some(_) => ControlResponse::Result(tresult::OK),
                    None => return Err(BridgeError::UnknownInstance(instance_id)),
                }
            }
        })
    }

    /// Service one audio request.
    pub fn handle_process(&self, request: ProcessRequest) -> ProcessResponse {
        if let Some(priority) = request.new_realtime_priority {
            if let Err(err) = set_realtime_priority(priority) {
                debug!("could not mirror realtime priority {}: {}", priority, err);
            }
        }

        let plugin = match self.registry.get(request.instance_id) {
            Some(plugin) => plugin,
            None => {
                warn!("audio request for unknown instance {}", request.instance_id);
                return ProcessResponse {
                    result: tresult::INTERNAL_ERROR,
                    output_params: Vec::new(),
                    output_events: Vec::new(),
                    silence_flags: Vec::new(),
                };
            }
        };

        let mut shms = self.shms.lock().unwrap_or_else(|e| e.into_inner());
        let output = match shms.get_mut(&request.instance_id) {
            Some(shm) => {
                let _ftz = ScopedFlushToZero::new();
                plugin.lock().unwrap_or_else(|e| e.into_inner()).process(shm, &request.data)
            }
            None => ProcessOutput { result: tresult::INTERNAL_ERROR, ..Default::default() },
        };

        ProcessResponse {
            result: output.result,
            output_params: output.output_params,
            output_events: output.output_events,
            silence_flags: output.silence_flags,
        }
    }

    /// Live object count, used by teardown assertions.
    pub fn live_instances(&self) -> usize {
        self.registry.len()
    }
}

/// The foreign host's serving half for one modern plugin module.
pub struct Vst3HostProcess {
    context: Arc<Vst3HostContext>,
    control: UnixStream,
    control_aux: UnixStream,
    audio: UnixStream,
}

impl Vst3HostProcess {
    /// Connect to the native side's socket group.
    pub fn connect(group: &SocketGroup, factory: Arc<dyn Vst3Factory>) -> Result<Vst3HostProcess> {
        let mut streams = connect_group(group, &super::CHANNELS, HANDSHAKE_TIMEOUT)?;
        let callback = streams
            .remove("callback")
            .ok_or(BridgeError::Protocol("missing callback channel"))?;
        let context = Arc::new(Vst3HostContext {
            factory,
            registry: Registry::default(),
            callback: Arc::new(EventChannel::new(callback)),
            setups: Mutex::new(HashMap::new()),
            shms: Mutex::new(HashMap::new()),
            shm_dir: group.dir().to_path_buf(),
        });
        Ok(Vst3HostProcess {
            context,
            control: streams
                .remove("control")
                .ok_or(BridgeError::Protocol("missing control channel"))?,
            control_aux: streams
                .remove("control-aux")
                .ok_or(BridgeError::Protocol("missing aux control channel"))?,
            audio: streams.remove("audio").ok_or(BridgeError::Protocol("missing audio channel"))?,
        })
    }

    /// The shared serving context.
    pub fn context(&self) -> Arc<Vst3HostContext> {
        Arc::clone(&self.context)
    }

    /// Serve every channel until the native side disconnects. The primary
    /// control loop runs on the calling thread, which doubles as the
    /// module's main thread.
    pub fn run(self) -> Result<()> {
        let Vst3HostProcess { context, mut control, mut control_aux, mut audio } = self;

        let aux_context = Arc::clone(&context);
        let aux_thread = std::thread::Builder::new()
            .name("winebridge-vst3-control-aux".into())
            .spawn(move || serve_control(&mut control_aux, aux_context))?;

        let audio_context = Arc::clone(&context);
        let audio_thread = std::thread::Builder::new()
            .name("winebridge-vst3-audio".into())
            .spawn(move || serve_audio(&mut audio, audio_context))?;

        serve_control(&mut control, context);

        let _ = aux_thread.join();
        let _ = audio_thread.join();
        Ok(())
    }
}

fn serve_control(stream: &mut UnixStream, context: Arc<Vst3HostContext>) {
    loop {
        let request: ControlRequest = match codec::read_frame(stream, codec::DEFAULT_FRAME_CAP) {
            Ok(request) => request,
            Err(err) => {
                debug!("control channel closed: {}", err);
                return;
            }
        };
        let response = context.handle_control(request);
        if let Err(err) = codec::write_frame(stream, &response, codec::DEFAULT_FRAME_CAP) {
            debug!("control channel closed: {}", err);
            return;
        }
    }
}

fn serve_audio(stream: &mut UnixStream, context: Arc<Vst3HostContext>) {
    loop {
        let request: ProcessRequest = match codec::read_frame(stream, codec::DEFAULT_FRAME_CAP) {
            Ok(request) => request,
            Err(err) => {
                debug!("audio channel closed: {}", err);
                return;
            }
        };
        let response = context.handle_process(request);
        if let Err(err) = codec::write_frame(stream, &response, codec::DEFAULT_FRAME_CAP) {
            debug!("audio channel closed: {}", err);
            return;
        }
    }
}
