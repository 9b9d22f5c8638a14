//! Native-side proxies for plugin objects and their editor views.

use std::any::Any;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, Weak};

use super::bridge::Vst3Bridge;
use super::messages::{
    tresult, AttributeMessage, BusDirection, BusInfoData, CallbackRequest, CallbackResponse,
    ControlRequest, ControlResponse, InterfaceFlags, MediaType, ParameterInfoData, ProcessData,
    ProcessResponse, ProcessSetup, StateScope, ViewRect,
};
use crate::error::{BridgeError, Result};
use crate::rt::PrioritySync;
use crate::shmem::AudioShmBuffer;

/// Host-owned component handler the proxy calls back into.
pub trait ComponentHandler: Send + Sync {
    /// A parameter gesture begins.
    fn begin_edit(&self, param_id: u32) -> i32;
    /// A normalized parameter value changed.
    fn perform_edit(&self, param_id: u32, value: f64) -> i32;
    /// A parameter gesture ends.
    fn end_edit(&self, param_id: u32) -> i32;
    /// The component changed and the host should re-read it.
    fn restart_component(&self, flags: i32) -> i32;
}

/// Host-owned application context.
pub trait HostContext: Send + Sync {
    /// The host application name.
    fn name(&self) -> String;
}

/// A connection endpoint. Implemented by [`Vst3PluginProxy`] itself and by
/// the glue wrapping host-owned connection objects.
pub trait ConnectionPoint: Send + Sync {
    /// Deliver one attribute message.
    fn notify(&self, message: &AttributeMessage) -> i32;
    /// Downcast support for detecting our own proxies.
    fn as_any(&self) -> &dyn Any;
}

/// Host-owned plug frame attached to an editor view.
pub trait PlugFrame: Send + Sync {
    /// The view asks its frame for a new size.
    fn resize_view(&self, rect: ViewRect) -> i32;
}

fn expect_result(response: ControlResponse) -> Result<i32> {
    match response {
        ControlResponse::Result(result) => Ok(result),
        _ => Err(BridgeError::Protocol("expected a result response")),
    }
}

/// Proxy for one plugin object on the foreign side.
///
/// Owned exclusively by the host through the ABI's reference counting; the
/// bridge itself only keeps a weak entry in its proxy table. Dropping the
/// proxy destroys the foreign object.
pub struct Vst3PluginProxy {
    bridge: Arc<Vst3Bridge>,
    instance_id: u64,
    capabilities: InterfaceFlags,
    handler: Mutex<Option<Arc<dyn ComponentHandler>>>,
    context: Mutex<Option<Arc<dyn HostContext>>>,
    /// The host's opaque connection object, mirrored on the foreign side
    /// when the peer is not one of ours.
    host_connection: Mutex<Option<Arc<dyn ConnectionPoint>>>,
    /// Most recently created editor view, for routing frame callbacks.
    last_view: Mutex<Weak<PlugViewProxy>>,
    shm: Mutex<Option<AudioShmBuffer>>,
    priority_sync: PrioritySync,
}

impl Vst3PluginProxy {
    pub(crate) fn new(
        bridge: Arc<Vst3Bridge>,
        instance_id: u64,
        capabilities: InterfaceFlags,
    ) -> Arc<Vst3PluginProxy> {
        Arc::new(Vst3PluginProxy {
            bridge,
            instance_id,
            capabilities,
            handler: Mutex::new(None),
            context: Mutex::new(None),
            host_connection: Mutex::new(None),
            last_view: Mutex::new(Weak::new()),
            shm: Mutex::new(None),
            priority_sync: PrioritySync::default(),
        })
    }

    /// The proxy's instance id.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Which interfaces the real object implements. The proxy advertises
    /// exactly these.
    pub fn capabilities(&self) -> InterfaceFlags {
        self.capabilities
    }

    /// Whether the real object implements `interface`.
    pub fn implements(&self, interface: InterfaceFlags) -> bool {
        self.capabilities.contains(interface)
    }

    fn result_of(&self, request: &ControlRequest) -> i32 {
        match self.bridge.send(request).and_then(expect_result) {
            Ok(result) => result,
            Err(err) => {
                warn!("control call failed: {}", err);
                tresult::INTERNAL_ERROR
            }
        }
    }

    /// Initialize the object, registering the host context for callbacks.
    pub fn initialize(&self, context: Option<Arc<dyn HostContext>>) -> i32 {
        let has_context = context.is_some();
        *self.context.lock().unwrap_or_else(|e| e.into_inner()) = context;
        self.result_of(&ControlRequest::Initialize { instance_id: self.instance_id, has_context })
    }

    /// Terminate the object.
    pub fn terminate(&self) -> i32 {
        let result = self.result_of(&ControlRequest::Terminate { instance_id: self.instance_id });
        *self.context.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = None;
        result
    }

    /// Store the host's component handler and expose a callback route for
    /// it on the foreign side, addressed by this proxy's instance id.
    pub fn set_component_handler(&self, handler: Option<Arc<dyn ComponentHandler>>) -> i32 {
        let present = handler.is_some();
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = handler;
        self.result_of(&ControlRequest::SetComponentHandler {
            instance_id: self.instance_id,
            present,
        })
    }

    /// Connect this object to `other`.
    ///
    /// When `other` is one of our own proxies the two foreign objects are
    /// connected directly by id and later messages never cross the
    /// process boundary. Anything else is a host-owned object, mirrored by
    /// a proxy on the foreign side that forwards `notify` back here.
    pub fn connect(&self, other: &Arc<dyn ConnectionPoint>) -> i32 {
        if let Some(peer) = other.as_any().downcast_ref::<Vst3PluginProxy>() {
            self.result_of(&ControlRequest::Connect {
                instance_id: self.instance_id,
                other: peer.instance_id,
            })
        } else {
            *self.host_connection.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(Arc::clone(other));
            self.result_of(&ControlRequest::ConnectProxy { instance_id: self.instance_id })
        }
    }

    /// Disconnect the object and drop any mirror.
    pub fn disconnect(&self) -> i32 {
        *self.host_connection.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.result_of(&ControlRequest::Disconnect { instance_id: self.instance_id })
    }

    /// Read the object's state stream into the host's stream.
    pub fn get_state(&self, scope: StateScope, stream: &mut dyn Write) -> i32 {
        match self.bridge.send(&ControlRequest::GetState { instance_id: self.instance_id, scope })
        {
            Ok(ControlResponse::State { result, data }) => {
                if result == tresult::OK {
                    if let Err(err) = stream.write_all(&data) {
                        warn!("could not write state into the host stream: {}", err);
                        return tresult::INTERNAL_ERROR;
                    }
                }
                result
            }
            Ok(_) => tresult::INTERNAL_ERROR,
            Err(err) => {
                warn!("state read failed: {}", err);
                tresult::INTERNAL_ERROR
            }
        }
    }

    /// Marshal the host's stream to bytes and hand them to the object.
    pub fn set_state(&self, scope: StateScope, stream: &mut dyn Read) -> i32 {
        let mut data = Vec::new();
        if let Err(err) = stream.read_to_end(&mut data) {
            warn!("could not read the host stream: {}", err);
            return tresult::INTERNAL_ERROR;
        }
        self.result_of(&ControlRequest::SetState { instance_id: self.instance_id, scope, data })
    }

    /// Bus count query.
    pub fn bus_count(&self, media_type: MediaType, direction: BusDirection) -> i32 {
        match self.bridge.send_aux(&ControlRequest::GetBusCount {
            instance_id: self.instance_id,
            media_type,
            direction,
        }) {
            Ok(ControlResponse::Count(count)) => count,
            _ => 0,
        }
    }

    /// Bus info query.
    pub fn bus_info(
        &self,
        media_type: MediaType,
        direction: BusDirection,
        index: i32,
    ) -> Option<BusInfoData> {
        match self.bridge.send_aux(&ControlRequest::GetBusInfo {
            instance_id: self.instance_id,
            media_type,
            direction,
            index,
        }) {
            Ok(ControlResponse::BusInfo { result, info }) if result == tresult::OK => Some(info),
            _ => None,
        }
    }

    /// Activate or deactivate a bus.
    pub fn activate_bus(
        &self,
        media_type: MediaType,
        direction: BusDirection,
        index: i32,
        active: bool,
    ) -> i32 {
        self.result_of(&ControlRequest::ActivateBus {
            instance_id: self.instance_id,
            media_type,
            direction,
            index,
            active,
        })
    }

    /// Negotiate the processing setup.
    pub fn setup_processing(&self, setup: ProcessSetup) -> i32 {
        self.result_of(&ControlRequest::SetupProcessing { instance_id: self.instance_id, setup })
    }

    /// Toggle realtime processing.
    pub fn set_processing(&self, active: bool) -> i32 {
        self.result_of(&ControlRequest::SetProcessing { instance_id: self.instance_id, active })
    }

    /// Activate or deactivate the component. Activation maps the shared
    /// audio buffer the foreign side laid out for the agreed setup.
    pub fn set_active(&self, active: bool) -> i32 {
        match self.bridge.send(&ControlRequest::SetActive { instance_id: self.instance_id, active })
        {
            Ok(ControlResponse::Activated { result, buffer }) => {
                if active && result == tresult::OK {
                    match buffer.as_ref().map(|desc| self.bridge.open_buffer(desc)) {
                        Some(Ok(shm)) => {
                            *self.shm.lock().unwrap_or_else(|e| e.into_inner()) = Some(shm);
                        }
                        Some(Err(err)) => {
                            warn!("could not map the shared audio buffer: {}", err);
                            return tresult::INTERNAL_ERROR;
                        }
                        None => {
                            warn!("activation returned no audio buffer");
                            return tresult::INTERNAL_ERROR;
                        }
                    }
                }
                result
            }
            Ok(_) => tresult::INTERNAL_ERROR,
            Err(err) => {
                warn!("activation failed: {}", err);
                tresult::INTERNAL_ERROR
            }
        }
    }

    /// Run one single precision block. `inputs`/`outputs` are flat channel
    /// lists in bus order; samples cross in the shared buffer, everything
    /// else in the request.
    pub fn process_f32(
        &self,
        data: ProcessData,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
    ) -> Result<ProcessResponse> {
        let frames = data.num_samples.max(0) as usize;
        let mut shm_guard = self.shm.lock().unwrap_or_else(|e| e.into_inner());
        let shm = shm_guard
            .as_mut()
            .ok_or(BridgeError::Protocol("processing while inactive"))?;

        let mut channel = 0;
        for (bus, &count) in shm.config().inputs.clone().iter().enumerate() {
            for bus_channel in 0..count as usize {
                if let Some(samples) = inputs.get(channel) {
                    shm.input_f32_mut(bus, bus_channel, frames).copy_from_slice(samples);
                }
                channel += 1;
            }
        }

        let request = super::messages::ProcessRequest {
            instance_id: self.instance_id,
            data,
            new_realtime_priority: self.priority_sync.poll(),
        };
        let response = self.bridge.send_audio(&request)?;

        let mut channel = 0;
        for (bus, &count) in shm.config().outputs.clone().iter().enumerate() {
            for bus_channel in 0..count as usize {
                if let Some(samples) = outputs.get_mut(channel) {
                    samples.copy_from_slice(shm.output_f32(bus, bus_channel, frames));
                }
                channel += 1;
            }
        }

        Ok(response)
    }

    /// Parameter count query.
    pub fn parameter_count(&self) -> i32 {
        match self
            .bridge
            .send_aux(&ControlRequest::GetParameterCount { instance_id: self.instance_id })
        {
            Ok(ControlResponse::Count(count)) => count,
            _ => 0,
        }
    }

    /// Parameter info query.
    pub fn parameter_info(&self, index: i32) -> Option<ParameterInfoData> {
        match self.bridge.send_aux(&ControlRequest::GetParameterInfo {
            instance_id: self.instance_id,
            index,
        }) {
            Ok(ControlResponse::ParameterInfo { result, info }) if result == tresult::OK => {
                Some(info)
            }
            _ => None,
        }
    }

    /// Normalized parameter read.
    pub fn param_normalized(&self, param_id: u32) -> f64 {
        match self.bridge.send_aux(&ControlRequest::GetParamNormalized {
            instance_id: self.instance_id,
            param_id,
        }) {
            Ok(ControlResponse::Value(value)) => value,
            _ => 0.0,
        }
    }

    /// Normalized parameter write.
    pub fn set_param_normalized(&self, param_id: u32, value: f64) -> i32 {
        match self
            .bridge
            .send_aux(&ControlRequest::SetParamNormalized {
                instance_id: self.instance_id,
                param_id,
                value,
            })
            .and_then(expect_result)
        {
            Ok(result) => result,
            Err(err) => {
                warn!("parameter write failed: {}", err);
                tresult::INTERNAL_ERROR
            }
        }
    }

    /// Display string for a normalized value.
    pub fn param_string_by_value(&self, param_id: u32, value: f64) -> Option<String> {
        match self.bridge.send_aux(&ControlRequest::GetParamStringByValue {
            instance_id: self.instance_id,
            param_id,
            value,
        }) {
            Ok(ControlResponse::String { result, text }) if result == tresult::OK => Some(text),
            _ => None,
        }
    }

    /// Unit count query.
    pub fn unit_count(&self) -> i32 {
        match self.bridge.send_aux(&ControlRequest::GetUnitCount { instance_id: self.instance_id })
        {
            Ok(ControlResponse::Count(count)) => count,
            _ => 0,
        }
    }

    /// Unit info query.
    pub fn unit_info(&self, index: i32) -> Option<super::messages::UnitInfoData> {
        match self
            .bridge
            .send_aux(&ControlRequest::GetUnitInfo { instance_id: self.instance_id, index })
        {
            Ok(ControlResponse::UnitInfo { result, info }) if result == tresult::OK => Some(info),
            _ => None,
        }
    }

    /// Program list count query.
    pub fn program_list_count(&self) -> i32 {
        match self
            .bridge
            .send_aux(&ControlRequest::GetProgramListCount { instance_id: self.instance_id })
        {
            Ok(ControlResponse::Count(count)) => count,
            _ => 0,
        }
    }

    /// Program list info query.
    pub fn program_list_info(&self, index: i32) -> Option<super::messages::ProgramListInfoData> {
        match self
            .bridge
            .send_aux(&ControlRequest::GetProgramListInfo { instance_id: self.instance_id, index })
        {
            Ok(ControlResponse::ProgramListInfo { result, info }) if result == tresult::OK => {
                Some(info)
            }
            _ => None,
        }
    }

    /// Read one program's stream into the host's stream.
    pub fn program_data(&self, list_id: i32, program_index: i32, stream: &mut dyn Write) -> i32 {
        match self.bridge.send(&ControlRequest::GetProgramData {
            instance_id: self.instance_id,
            list_id,
            program_index,
        }) {
            Ok(ControlResponse::State { result, data }) => {
                if result == tresult::OK && stream.write_all(&data).is_err() {
                    return tresult::INTERNAL_ERROR;
                }
                result
            }
            _ => tresult::INTERNAL_ERROR,
        }
    }

    /// Marshal the host's stream into one program's data.
    pub fn set_program_data(
        &self,
        list_id: i32,
        program_index: i32,
        stream: &mut dyn Read,
    ) -> i32 {
        let mut data = Vec::new();
        if stream.read_to_end(&mut data).is_err() {
            return tresult::INTERNAL_ERROR;
        }
        self.result_of(&ControlRequest::SetProgramData {
            instance_id: self.instance_id,
            list_id,
            program_index,
            data,
        })
    }

    /// Create an editor view proxy. The host owns the returned proxy; a
    /// weak pointer is kept so frame callbacks find the right view.
    pub fn create_view(self: &Arc<Self>) -> Option<Arc<PlugViewProxy>> {
        match self.bridge.send(&ControlRequest::CreateView { instance_id: self.instance_id }) {
            Ok(ControlResponse::View { result, size }) if result == tresult::OK => {
                let view = Arc::new(PlugViewProxy {
                    owner: Arc::clone(self),
                    frame: Mutex::new(None),
                    last_size: Mutex::new(size.unwrap_or_default()),
                });
                *self.last_view.lock().unwrap_or_else(|e| e.into_inner()) =
                    Arc::downgrade(&view);
                Some(view)
            }
            _ => None,
        }
    }

    pub(crate) fn route_callback(&self, request: CallbackRequest) -> CallbackResponse {
        match request {
            CallbackRequest::BeginEdit { param_id, .. } => {
                CallbackResponse::Result(self.with_handler(|h| h.begin_edit(param_id)))
            }
            CallbackRequest::PerformEdit { param_id, value, .. } => {
                CallbackResponse::Result(self.with_handler(|h| h.perform_edit(param_id, value)))
            }
            CallbackRequest::EndEdit { param_id, .. } => {
                CallbackResponse::Result(self.with_handler(|h| h.end_edit(param_id)))
            }
            CallbackRequest::RestartComponent { flags, .. } => {
                CallbackResponse::Result(self.with_handler(|h| h.restart_component(flags)))
            }
            CallbackRequest::Notify { message, .. } => {
                let connection =
                    self.host_connection.lock().unwrap_or_else(|e| e.into_inner()).clone();
                CallbackResponse::Result(match connection {
                    Some(connection) => connection.notify(&message),
                    None => {
                        warn!("notify for instance {} without a connection", self.instance_id);
                        tresult::FALSE
                    }
                })
            }
            CallbackRequest::ResizeView { rect, .. } => {
                let view = self.last_view.lock().unwrap_or_else(|e| e.into_inner()).upgrade();
                CallbackResponse::Result(match view {
                    Some(view) => view.request_resize(rect),
                    None => tresult::FALSE,
                })
            }
            CallbackRequest::GetHostName { .. } => {
                if self.bridge.config.hide_daw {
                    return CallbackResponse::Name("VST Host".to_string());
                }
                let context = self.context.lock().unwrap_or_else(|e| e.into_inner()).clone();
                CallbackResponse::Name(context.map(|c| c.name()).unwrap_or_default())
            }
        }
    }

    fn with_handler(&self, f: impl FnOnce(&dyn ComponentHandler) -> i32) -> i32 {
        let handler = self.handler.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match handler {
            Some(handler) => f(&*handler),
            None => tresult::FALSE,
        }
    }
}

impl ConnectionPoint for Vst3PluginProxy {
    fn notify(&self, message: &AttributeMessage) -> i32 {
        self.result_of(&ControlRequest::Notify {
            instance_id: self.instance_id,
            message: message.clone(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for Vst3PluginProxy {
    fn drop(&mut self) {
        // Tolerate a dead peer; the host may drop proxies after a crash.
        if !self.bridge.is_failed() {
            let _ = self.bridge.send(&ControlRequest::Destruct { instance_id: self.instance_id });
        }
        self.bridge.proxies().unregister(self.instance_id);
    }
}

/// Proxy for one editor view, owned by the host's reference counting.
pub struct PlugViewProxy {
    owner: Arc<Vst3PluginProxy>,
    frame: Mutex<Option<Arc<dyn PlugFrame>>>,
    last_size: Mutex<ViewRect>,
}

impl PlugViewProxy {
    /// Attach the view to a host window handle.
    pub fn attach(&self, parent: u64) -> i32 {
        self.owner.result_of(&ControlRequest::AttachView {
            instance_id: self.owner.instance_id,
            parent,
        })
    }

    /// Detach the view from its window.
    pub fn removed(&self) -> i32 {
        self.owner
            .result_of(&ControlRequest::RemoveView { instance_id: self.owner.instance_id })
    }

    /// The view's current size.
    pub fn size(&self) -> ViewRect {
        match self
            .owner
            .bridge
            .send(&ControlRequest::GetViewSize { instance_id: self.owner.instance_id })
        {
            Ok(ControlResponse::View { result, size }) if result == tresult::OK => {
                let size = size.unwrap_or_default();
                *self.last_size.lock().unwrap_or_else(|e| e.into_inner()) = size;
                size
            }
            _ => *self.last_size.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// The host resized the view.
    pub fn on_size(&self, rect: ViewRect) -> i32 {
        *self.last_size.lock().unwrap_or_else(|e| e.into_inner()) = rect;
        self.owner.result_of(&ControlRequest::OnViewSize {
            instance_id: self.owner.instance_id,
            rect,
        })
    }

    /// Install the host's plug frame.
    pub fn set_frame(&self, frame: Option<Arc<dyn PlugFrame>>) -> i32 {
        *self.frame.lock().unwrap_or_else(|e| e.into_inner()) = frame;
        tresult::OK
    }

    /// The plugin asked its frame for a new size.
    pub(crate) fn request_resize(&self, rect: ViewRect) -> i32 {
        let frame = self.frame.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match frame {
            Some(frame) => {
                *self.last_size.lock().unwrap_or_else(|e| e.into_inner()) = rect;
                frame.resize_view(rect)
            }
            None => tresult::FALSE,
        }
    }
}
