//! Message families of the modern-ABI bridge.

use serde::{Deserialize, Serialize};

use crate::shmem::AudioShmDescriptor;
use crate::transport::{Request, VersionInfo};

/// Result codes mirrored from the ABI's COM-style `tresult`.
#[allow(missing_docs)]
pub mod tresult {
    pub const OK: i32 = 0;
    pub const FALSE: i32 = 1;
    pub const NOT_IMPLEMENTED: i32 = 0x8000_4001u32 as i32;
    pub const NO_INTERFACE: i32 = 0x8000_4002u32 as i32;
    pub const INTERNAL_ERROR: i32 = 0x8000_4005u32 as i32;
}

/// A 16-byte class identifier. Opaque: only compared for equality and
/// shipped as raw bytes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Cid(pub [u8; 16]);

bitflags! {
    /// Which interfaces a plugin object implements, probed once at
    /// construction. The proxy advertises exactly this set to the host.
    pub struct InterfaceFlags: u32 {
        /// The processing half of a plugin.
        const COMPONENT = 1 << 0;
        /// Realtime audio processing.
        const AUDIO_PROCESSOR = 1 << 1;
        /// The parameter/UI half of a plugin.
        const EDIT_CONTROLLER = 1 << 2;
        /// Inter-object messaging.
        const CONNECTION_POINT = 1 << 3;
        /// Unit (parameter group) queries.
        const UNIT_INFO = 1 << 4;
        /// Program list stream access.
        const PROGRAM_LIST_DATA = 1 << 5;
        /// MIDI controller to parameter mapping.
        const MIDI_MAPPING = 1 << 6;
        /// Per-note expression.
        const NOTE_EXPRESSION = 1 << 7;
        /// An editor view can be created.
        const EDITOR = 1 << 8;
    }
}

/// A typed value in an attribute message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// Integer attribute.
    Int(i64),
    /// Float attribute.
    Float(f64),
    /// String attribute.
    String(String),
    /// Binary attribute.
    Binary(Vec<u8>),
}

/// A connection-point message built by our own message factory.
///
/// The ABI's attribute list has no enumeration primitive, so only messages
/// we created ourselves can be serialised; foreign message objects are
/// dropped with a warning at the call site.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AttributeMessage {
    /// Message id.
    pub id: String,
    /// Attribute key/value pairs in insertion order.
    pub attributes: Vec<(String, AttributeValue)>,
}

impl AttributeMessage {
    /// A message with the given id and no attributes yet.
    pub fn new(id: impl Into<String>) -> AttributeMessage {
        AttributeMessage { id: id.into(), attributes: Vec::new() }
    }

    /// Append an attribute.
    pub fn set(&mut self, key: impl Into<String>, value: AttributeValue) {
        self.attributes.push((key.into(), value));
    }

    /// Look up an attribute by key.
    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// An editor view rectangle.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewRect {
    /// Left edge in pixels.
    pub left: i32,
    /// Top edge in pixels.
    pub top: i32,
    /// Right edge in pixels.
    pub right: i32,
    /// Bottom edge in pixels.
    pub bottom: i32,
}

/// Bus media type selector.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    /// Audio buses.
    Audio,
    /// Event (MIDI) buses.
    Event,
}

/// Bus direction selector.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusDirection {
    /// Input buses.
    Input,
    /// Output buses.
    Output,
}

/// Description of one bus.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BusInfoData {
    /// Bus name.
    pub name: String,
    /// Channel count.
    pub channel_count: i32,
    /// Main (0) or auxiliary (1) bus.
    pub bus_type: i32,
    /// Bus flags.
    pub flags: u32,
}

/// One normalized parameter automation point.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ParameterPoint {
    /// Sample offset within the current block.
    pub sample_offset: i32,
    /// Normalized value.
    pub value: f64,
}

/// Automation queue for a single parameter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParameterQueue {
    /// Parameter id.
    pub param_id: u32,
    /// Points sorted by sample offset.
    pub points: Vec<ParameterPoint>,
}

/// Description of one parameter.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ParameterInfoData {
    /// Parameter id.
    pub param_id: u32,
    /// Display title.
    pub title: String,
    /// Measurement units.
    pub units: String,
    /// Discrete step count, 0 for continuous.
    pub step_count: i32,
    /// Default normalized value.
    pub default_normalized: f64,
    /// Unit this parameter belongs to.
    pub unit_id: i32,
    /// Parameter flags.
    pub flags: i32,
}

/// Description of one unit (parameter group).
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UnitInfoData {
    /// Unit id.
    pub unit_id: i32,
    /// Parent unit id, -1 for the root.
    pub parent_unit_id: i32,
    /// Display name.
    pub name: String,
    /// Attached program list, -1 for none.
    pub program_list_id: i32,
}

/// Description of one program list.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ProgramListInfoData {
    /// Program list id.
    pub list_id: i32,
    /// Display name.
    pub name: String,
    /// Number of programs in the list.
    pub program_count: i32,
}

/// One event on an event bus.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum EventData {
    /// Note on.
    NoteOn {
        /// MIDI channel.
        channel: i16,
        /// Pitch in semitones.
        pitch: i16,
        /// Normalized velocity.
        velocity: f32,
        /// Detuning in cents.
        tuning: f32,
        /// Note identifier, -1 when unused.
        note_id: i32,
        /// Note length in frames, 0 when unknown.
        length: i32,
    },
    /// Note off.
    NoteOff {
        /// MIDI channel.
        channel: i16,
        /// Pitch in semitones.
        pitch: i16,
        /// Normalized release velocity.
        velocity: f32,
        /// Note identifier, -1 when unused.
        note_id: i32,
    },
    /// Polyphonic pressure.
    PolyPressure {
        /// MIDI channel.
        channel: i16,
        /// Pitch in semitones.
        pitch: i16,
        /// Normalized pressure.
        pressure: f32,
        /// Note identifier, -1 when unused.
        note_id: i32,
    },
    /// Raw data event (SysEx).
    Data {
        /// Payload bytes.
        bytes: Vec<u8>,
    },
}

/// An event with its bus routing and timing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Event {
    /// Bus this event belongs to.
    pub bus_index: i32,
    /// Sample offset within the current block.
    pub sample_offset: i32,
    /// The event itself.
    pub data: EventData,
}

/// Transport state for one processing block.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct TransportData {
    /// Transport is playing.
    pub playing: bool,
    /// Recording is active.
    pub recording: bool,
    /// Cycle is active.
    pub cycle_active: bool,
    /// Tempo in BPM.
    pub tempo: f64,
    /// Time signature numerator.
    pub time_sig_numerator: i32,
    /// Time signature denominator.
    pub time_sig_denominator: i32,
    /// Position in samples from project start.
    pub position_samples: i64,
    /// Musical position in quarter notes.
    pub position_quarters: f64,
    /// Last bar start in quarter notes.
    pub bar_position_quarters: f64,
    /// Cycle start in quarter notes.
    pub cycle_start_quarters: f64,
    /// Cycle end in quarter notes.
    pub cycle_end_quarters: f64,
}

/// Processing setup negotiated before activation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ProcessSetup {
    /// Realtime (0) or offline (1) processing.
    pub process_mode: i32,
    /// 32 (0) or 64 (1) bit samples.
    pub symbolic_sample_size: i32,
    /// Maximum frames per block.
    pub max_samples_per_block: i32,
    /// Sample rate in Hz.
    pub sample_rate: f64,
}

/// Everything about one block except the samples, which live in the
/// shared audio buffer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessData {
    /// Frames in this block.
    pub num_samples: i32,
    /// Realtime or offline, as in the setup.
    pub process_mode: i32,
    /// 64-bit samples in the shared buffer.
    pub double_precision: bool,
    /// Input parameter automation.
    pub param_changes: Vec<ParameterQueue>,
    /// Input events.
    pub events: Vec<Event>,
    /// Transport state, if the host provides one.
    pub transport: Option<TransportData>,
}

/// The per-block request on the audio channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessRequest {
    /// The audio processor instance.
    pub instance_id: u64,
    /// Block description.
    pub data: ProcessData,
    /// Realtime FIFO priority for the foreign audio thread to mirror.
    pub new_realtime_priority: Option<i32>,
}

/// The per-block response on the audio channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessResponse {
    /// The processor's result code.
    pub result: i32,
    /// Output parameter automation.
    pub output_params: Vec<ParameterQueue>,
    /// Output events.
    pub output_events: Vec<Event>,
    /// Per output bus silence flags.
    pub silence_flags: Vec<u64>,
}

impl Request for ProcessRequest {
    type Response = ProcessResponse;
}

/// Which of a plugin's two state streams a request addresses.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateScope {
    /// The component (processor) state.
    Component,
    /// The edit controller state.
    Controller,
}

/// Requests on the modern control channels. Every request names the
/// instance it addresses; responses are strictly shaped per variant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum ControlRequest {
    Version(VersionInfo),
    CreateInstance { cid: Cid },
    Initialize { instance_id: u64, has_context: bool },
    Terminate { instance_id: u64 },
    SetComponentHandler { instance_id: u64, present: bool },
    Connect { instance_id: u64, other: u64 },
    ConnectProxy { instance_id: u64 },
    Disconnect { instance_id: u64 },
    Notify { instance_id: u64, message: AttributeMessage },
    GetState { instance_id: u64, scope: StateScope },
    SetState { instance_id: u64, scope: StateScope, data: Vec<u8> },
    GetBusCount { instance_id: u64, media_type: MediaType, direction: BusDirection },
    GetBusInfo { instance_id: u64, media_type: MediaType, direction: BusDirection, index: i32 },
    ActivateBus {
        instance_id: u64,
        media_type: MediaType,
        direction: BusDirection,
        index: i32,
        active: bool,
    },
    SetupProcessing { instance_id: u64, setup: ProcessSetup },
    SetProcessing { instance_id: u64, active: bool },
    SetActive { instance_id: u64, active: bool },
    GetParameterCount { instance_id: u64 },
    GetParameterInfo { instance_id: u64, index: i32 },
    GetParamNormalized { instance_id: u64, param_id: u32 },
    SetParamNormalized { instance_id: u64, param_id: u32, value: f64 },
    GetParamStringByValue { instance_id: u64, param_id: u32, value: f64 },
    GetUnitCount { instance_id: u64 },
    GetUnitInfo { instance_id: u64, index: i32 },
    GetProgramListCount { instance_id: u64 },
    GetProgramListInfo { instance_id: u64, index: i32 },
    GetProgramData { instance_id: u64, list_id: i32, program_index: i32 },
    SetProgramData { instance_id: u64, list_id: i32, program_index: i32, data: Vec<u8> },
    CreateView { instance_id: u64 },
    AttachView { instance_id: u64, parent: u64 },
    RemoveView { instance_id: u64 },
    GetViewSize { instance_id: u64 },
    OnViewSize { instance_id: u64, rect: ViewRect },
    Destruct { instance_id: u64 },
}

/// Responses on the modern control channels.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum ControlResponse {
    Version(VersionInfo),
    Created { instance_id: u64, capabilities: u32 },
    Result(i32),
    State { result: i32, data: Vec<u8> },
    Count(i32),
    Value(f64),
    String { result: i32, text: String },
    BusInfo { result: i32, info: BusInfoData },
    ParameterInfo { result: i32, info: ParameterInfoData },
    UnitInfo { result: i32, info: UnitInfoData },
    ProgramListInfo { result: i32, info: ProgramListInfoData },
    Activated { result: i32, buffer: Option<AudioShmDescriptor> },
    View { result: i32, size: Option<ViewRect> },
}

impl Request for ControlRequest {
    type Response = ControlResponse;

    fn main_thread_safe(&self) -> bool {
        // View traffic runs on the foreign side's GUI thread.
        !matches!(
            self,
            ControlRequest::CreateView { .. }
                | ControlRequest::AttachView { .. }
                | ControlRequest::RemoveView { .. }
                | ControlRequest::GetViewSize { .. }
                | ControlRequest::OnViewSize { .. }
        )
    }
}

/// Plugin→host callbacks on the callback channel, addressed by the
/// originating plugin's instance id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum CallbackRequest {
    BeginEdit { instance_id: u64, param_id: u32 },
    PerformEdit { instance_id: u64, param_id: u32, value: f64 },
    EndEdit { instance_id: u64, param_id: u32 },
    RestartComponent { instance_id: u64, flags: i32 },
    Notify { instance_id: u64, message: AttributeMessage },
    ResizeView { instance_id: u64, rect: ViewRect },
    GetHostName { instance_id: u64 },
}

/// Responses on the callback channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum CallbackResponse {
    Result(i32),
    Name(String),
}

impl Request for CallbackRequest {
    type Response = CallbackResponse;

    fn main_thread_safe(&self) -> bool {
        // Component restarts reconfigure the host's graph; resize reaches
        // into the host's window hierarchy. Both belong on its main thread.
        !matches!(
            self,
            CallbackRequest::ResizeView { .. } | CallbackRequest::RestartComponent { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    #[test]
    fn control_requests_round_trip() {
        let requests = vec![
            ControlRequest::CreateInstance { cid: Cid([7; 16]) },
            ControlRequest::Connect { instance_id: 1, other: 2 },
            ControlRequest::SetState {
                instance_id: 3,
                scope: StateScope::Controller,
                data: vec![1, 2, 3],
            },
            ControlRequest::SetupProcessing {
                instance_id: 4,
                setup: ProcessSetup {
                    process_mode: 0,
                    symbolic_sample_size: 0,
                    max_samples_per_block: 512,
                    sample_rate: 48_000.0,
                },
            },
        ];
        for request in requests {
            let bytes = codec::encode(&request).unwrap();
            assert_eq!(codec::decode::<ControlRequest>(&bytes).unwrap(), request);
        }
    }

    #[test]
    fn process_request_round_trips() {
        let request = ProcessRequest {
            instance_id: 9,
            data: ProcessData {
                num_samples: 256,
                process_mode: 0,
                double_precision: false,
                param_changes: vec![ParameterQueue {
                    param_id: 5,
                    points: vec![ParameterPoint { sample_offset: 0, value: 0.5 }],
                }],
                events: vec![Event {
                    bus_index: 0,
                    sample_offset: 17,
                    data: EventData::NoteOn {
                        channel: 0,
                        pitch: 60,
                        velocity: 0.8,
                        tuning: 0.0,
                        note_id: -1,
                        length: 0,
                    },
                }],
                transport: None,
            },
            new_realtime_priority: Some(70),
        };
        let bytes = codec::encode(&request).unwrap();
        assert_eq!(codec::decode::<ProcessRequest>(&bytes).unwrap(), request);
    }

    #[test]
    fn attribute_messages_keep_insertion_order() {
        let mut message = AttributeMessage::new("midi_learn");
        message.set("param", AttributeValue::Int(12));
        message.set("cc", AttributeValue::Int(74));
        message.set("label", AttributeValue::String("cutoff".into()));
        let bytes = codec::encode(&message).unwrap();
        let back: AttributeMessage = codec::decode(&bytes).unwrap();
        assert_eq!(back, message);
        assert_eq!(back.get("cc"), Some(&AttributeValue::Int(74)));
    }

    #[test]
    fn view_traffic_is_gui_affine() {
        assert!(!ControlRequest::CreateView { instance_id: 1 }.main_thread_safe());
        assert!(ControlRequest::GetParameterCount { instance_id: 1 }.main_thread_safe());
        assert!(!CallbackRequest::ResizeView {
            instance_id: 1,
            rect: ViewRect::default(),
        }
        .main_thread_safe());
    }
}
