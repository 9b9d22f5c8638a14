//! Typed wire form of dispatcher and host-callback calls.
//!
//! The ABI encodes everything into `(opcode, index, value, ptr, opt)` with
//! the meaning of `value` and `ptr` depending on the opcode. On the wire
//! each call becomes one [`DispatchRequest`] whose payload variant captures
//! what the pointer argument actually was: nothing, a buffer, a string, a
//! fixed struct, an event list, or a marker asking the other side to
//! allocate and fill the output.

use std::os::raw::c_void;

use serde::{Deserialize, Serialize};

use super::api::{self, consts, OpCode};
use crate::transport::Request;

/// Serializable subset of the effect structure.
///
/// Captured from the real plugin on the foreign side and applied to the
/// host-visible struct on the native side; also pushed again after
/// `Initialize` for plugins that fill their fields in late.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectFields {
    /// Number of programs.
    pub num_programs: i32,
    /// Number of parameters.
    pub num_params: i32,
    /// Number of audio inputs.
    pub num_inputs: i32,
    /// Number of audio outputs.
    pub num_outputs: i32,
    /// `flags::Plugin` bitmask.
    pub flags: i32,
    /// Latency in samples.
    pub initial_delay: i32,
    /// Registered unique identifier.
    pub unique_id: i32,
    /// Plugin version.
    pub version: i32,
}

impl EffectFields {
    /// Capture the bridged fields from a live effect struct.
    pub fn capture(effect: &api::AEffect) -> EffectFields {
        EffectFields {
            num_programs: effect.numPrograms,
            num_params: effect.numParams,
            num_inputs: effect.numInputs,
            num_outputs: effect.numOutputs,
            flags: effect.flags,
            initial_delay: effect.initialDelay,
            unique_id: effect.uniqueId,
            version: effect.version,
        }
    }

    /// Write the bridged fields into the host-visible struct.
    pub fn apply(&self, effect: &mut api::AEffect) {
        effect.numPrograms = self.num_programs;
        effect.numParams = self.num_params;
        effect.numInputs = self.num_inputs;
        effect.numOutputs = self.num_outputs;
        effect.flags = self.flags;
        effect.initialDelay = self.initial_delay;
        effect.uniqueId = self.unique_id;
        effect.version = self.version;
    }
}

/// Owned form of one entry in an event block.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum MidiEventData {
    /// A plain midi event.
    Midi {
        /// 1 to 3 midi bytes.
        data: [u8; 3],
        /// Sample offset into the current block.
        delta_frames: i32,
        /// Played live rather than from a sequencer track.
        live: bool,
        /// Note length in frames, 0 when unknown.
        note_length: i32,
        /// Offset into the note, 0 when unknown.
        note_offset: i32,
        /// Detuning in cents.
        detune: i8,
        /// Note off velocity.
        note_off_velocity: u8,
    },
    /// A system exclusive event.
    SysEx {
        /// Raw SysEx payload.
        payload: Vec<u8>,
        /// Sample offset into the current block.
        delta_frames: i32,
    },
}

impl MidiEventData {
    /// Read an owned event out of a raw event block entry.
    ///
    /// # Safety
    /// `event` must point at a live, correctly discriminated event.
    pub unsafe fn from_raw(event: *const api::Event) -> Option<MidiEventData> {
        match (*event).event_type {
            api::EventType::Midi => {
                let event = &*(event as *const api::MidiEvent);
                let flags = api::flags::MidiEvent::from_bits_truncate(event.flags);
                Some(MidiEventData::Midi {
                    data: event.midi_data,
                    delta_frames: event.delta_frames,
                    live: flags.contains(api::flags::MidiEvent::REALTIME_EVENT),
                    note_length: event.note_length,
                    note_offset: event.note_offset,
                    detune: event.detune,
                    note_off_velocity: event.note_off_velocity,
                })
            }
            api::EventType::SysEx => {
                let event = &*(event as *const api::SysExEvent);
                Some(MidiEventData::SysEx {
                    payload: std::slice::from_raw_parts(
                        event.system_data,
                        event.data_size as usize,
                    )
                    .to_vec(),
                    delta_frames: event.delta_frames,
                })
            }
            _ => None,
        }
    }

    /// Read every supported event out of a raw block.
    ///
    /// # Safety
    /// `events` must point at a live event block.
    pub unsafe fn from_raw_block(events: *const api::Events) -> Vec<MidiEventData> {
        (*events)
            .events_raw()
            .iter()
            .filter_map(|&event| MidiEventData::from_raw(event))
            .collect()
    }
}

/// An ABI-compatible event block rebuilt from owned events.
///
/// Keeps every allocation the raw pointers refer to alive for as long as
/// the block itself, so the receiving side may read it until the next call
/// on the same channel.
pub struct EventBlock {
    // Pointer-aligned backing store for the `Events` header and its
    // flexible pointer array.
    header: Vec<usize>,
    _midi: Vec<Box<api::MidiEvent>>,
    _sysex: Vec<(Box<api::SysExEvent>, Vec<u8>)>,
}

impl EventBlock {
    /// Lay out a raw block for the given events.
    pub fn new(events: &[MidiEventData]) -> EventBlock {
        let mut midi = Vec::new();
        let mut sysex = Vec::new();
        let mut pointers: Vec<*mut api::Event> = Vec::with_capacity(events.len());

        for event in events {
            match event {
                MidiEventData::Midi {
                    data,
                    delta_frames,
                    live,
                    note_length,
                    note_offset,
                    detune,
                    note_off_velocity,
                } => {
                    let mut raw = Box::new(api::MidiEvent {
                        event_type: api::EventType::Midi,
                        byte_size: std::mem::size_of::<api::MidiEvent>() as i32,
                        delta_frames: *delta_frames,
                        flags: if *live {
                            api::flags::MidiEvent::REALTIME_EVENT.bits()
                        } else {
                            0
                        },
                        note_length: *note_length,
                        note_offset: *note_offset,
                        midi_data: *data,
                        _midi_reserved: 0,
                        detune: *detune,
                        note_off_velocity: *note_off_velocity,
                        _reserved1: 0,
                        _reserved2: 0,
                    });
                    pointers.push(&mut *raw as *mut api::MidiEvent as *mut api::Event);
                    midi.push(raw);
                }
                MidiEventData::SysEx { payload, delta_frames } => {
                    let mut bytes = payload.clone();
                    let mut raw = Box::new(api::SysExEvent {
                        event_type: api::EventType::SysEx,
                        byte_size: std::mem::size_of::<api::SysExEvent>() as i32,
                        delta_frames: *delta_frames,
                        _flags: 0,
                        data_size: bytes.len() as i32,
                        _reserved1: 0,
                        system_data: bytes.as_mut_ptr(),
                        _reserved2: 0,
                    });
                    pointers.push(&mut *raw as *mut api::SysExEvent as *mut api::Event);
                    sysex.push((raw, bytes));
                }
            }
        }

        // The header ends in a flexible pointer array; lay it out by hand
        // in pointer-sized words. Word 0 holds `num_events` (the upper half
        // is struct padding on 64-bit), word 1 the reserved field, the rest
        // the pointer array.
        let mut header = vec![0usize; 2 + pointers.len()];
        header[0] = pointers.len();
        for (i, pointer) in pointers.iter().enumerate() {
            header[2 + i] = *pointer as usize;
        }

        EventBlock { header, _midi: midi, _sysex: sysex }
    }

    /// The raw block pointer to hand to the ABI.
    pub fn as_ptr(&self) -> *const api::Events {
        self.header.as_ptr() as *const api::Events
    }
}

/// Serializable channel pin description.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct PinPropertiesData {
    /// Channel name.
    pub name: String,
    /// `flags::Channel` bitmask.
    pub flags: i32,
    /// Arrangement type this pin belongs to.
    pub arrangement_type: i32,
    /// Short channel name.
    pub short_name: String,
}

impl PinPropertiesData {
    /// Write into the host-provided pin struct.
    ///
    /// # Safety
    /// `ptr` must point at a writable `ChannelProperties`.
    pub unsafe fn write_to(&self, ptr: *mut api::ChannelProperties) {
        api::copy_string(
            (*ptr).name.as_mut_ptr() as *mut c_void,
            &self.name,
            consts::MAX_LABEL,
        );
        api::copy_string(
            (*ptr).short_name.as_mut_ptr() as *mut c_void,
            &self.short_name,
            consts::MAX_SHORT_LABEL,
        );
        (*ptr).flags = self.flags;
        (*ptr).arrangement_type = self.arrangement_type;
        (*ptr).future = [0; 48];
    }
}

/// Serializable speaker arrangement.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SpeakerArrangementData {
    /// Arrangement type from the arrangement tables.
    pub arrangement_type: i32,
    /// Per speaker type ordinals; the length is the channel count.
    pub speakers: Vec<i32>,
}

impl SpeakerArrangementData {
    /// Read from a raw arrangement block.
    ///
    /// # Safety
    /// `ptr` must point at a live arrangement sized for its channel count.
    pub unsafe fn from_raw(ptr: *const api::SpeakerArrangement) -> SpeakerArrangementData {
        let num_channels = (*ptr).num_channels.max(0) as usize;
        let speakers = std::slice::from_raw_parts((*ptr).speakers.as_ptr(), num_channels)
            .iter()
            .map(|speaker| speaker.speaker_type)
            .collect();
        SpeakerArrangementData { arrangement_type: (*ptr).arrangement_type, speakers }
    }

    /// Byte length of the raw block this arrangement needs.
    pub fn raw_len(&self) -> usize {
        let fixed = std::mem::size_of::<api::SpeakerArrangement>();
        let extra = self
            .speakers
            .len()
            .saturating_sub(8)
            .saturating_mul(std::mem::size_of::<api::SpeakerProperties>());
        fixed + extra
    }

    /// Lay the arrangement out into `block`, which must be at least
    /// [`raw_len`](Self::raw_len) bytes.
    pub fn write_to(&self, block: &mut [u8]) {
        assert!(block.len() >= self.raw_len());
        block.fill(0);
        block[..4].copy_from_slice(&self.arrangement_type.to_le_bytes());
        block[4..8].copy_from_slice(&(self.speakers.len() as i32).to_le_bytes());
        let speakers_base = 8;
        let stride = std::mem::size_of::<api::SpeakerProperties>();
        let type_offset = std::mem::offset_of!(api::SpeakerProperties, speaker_type);
        for (i, speaker_type) in self.speakers.iter().enumerate() {
            let at = speakers_base + i * stride + type_offset;
            block[at..at + 4].copy_from_slice(&speaker_type.to_le_bytes());
        }
    }
}

/// What travelled in the pointer argument of one bridged call, or a marker
/// asking the other side to produce the output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Payload {
    /// Nothing; the integer slots carry the whole call.
    None,
    /// A raw byte buffer.
    Bytes(Vec<u8>),
    /// A zero-terminated string.
    Utf8(String),
    /// A window or other opaque handle passed through as an integer.
    Handle(u64),
    /// An editor rectangle.
    Rect(api::Rect),
    /// A channel pin description.
    PinProperties(PinPropertiesData),
    /// A MIDI key name request.
    KeyName {
        /// Program the key name belongs to.
        program: i32,
        /// Key number.
        key: i32,
    },
    /// Host time and transport info.
    TimeInfo(api::TimeInfo),
    /// A block of MIDI and SysEx events.
    Events(Vec<MidiEventData>),
    /// Input and output speaker arrangements travelling together.
    SpeakerArrangements {
        /// Input arrangement (from the `value` slot).
        input: SpeakerArrangementData,
        /// Output arrangement (from the pointer slot).
        output: SpeakerArrangementData,
    },
    /// Bridged fields of the effect struct.
    EffectFields(EffectFields),
    /// Descriptor of the shared audio buffer the foreign side laid out.
    AudioShm(crate::shmem::AudioShmDescriptor),
    /// The other side should produce a string.
    WantsString,
    /// The other side should produce a state chunk.
    WantsChunkBuffer,
    /// The other side should produce an editor rectangle.
    WantsRect,
    /// The other side should produce pin properties.
    WantsPinProperties,
    /// The other side should produce both speaker arrangements.
    WantsSpeakerArrangements,
    /// The other side should push refreshed effect struct fields.
    WantsEffectUpdate,
}

/// One dispatcher or host-callback call on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    /// The raw opcode.
    pub opcode: i32,
    /// The `index` argument.
    pub index: i32,
    /// The `value` argument. Pointer-valued uses are captured in the
    /// payload instead; this keeps the integer uses.
    pub value: i64,
    /// The `opt` argument.
    pub opt: f32,
    /// Typed capture of the pointer argument.
    pub payload: Payload,
}

/// The response counterpart of [`DispatchRequest`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DispatchResponse {
    /// The dispatcher return value.
    pub ret: i64,
    /// Output payload the opcode produced.
    pub payload: Payload,
    /// Second output slot, for the opcodes that produce two (speaker
    /// arrangement queries).
    pub aux: Payload,
}

impl DispatchResponse {
    /// A bare integer response.
    pub fn ret(ret: i64) -> DispatchResponse {
        DispatchResponse { ret, payload: Payload::None, aux: Payload::None }
    }
}

impl Request for DispatchRequest {
    type Response = DispatchResponse;

    fn main_thread_safe(&self) -> bool {
        // Editor traffic must reach the plugin on its GUI thread.
        !matches!(
            OpCode::try_from(self.opcode),
            Ok(OpCode::EditorGetRect)
                | Ok(OpCode::EditorOpen)
                | Ok(OpCode::EditorClose)
                | Ok(OpCode::EditorIdle)
                | Ok(OpCode::EditorKeyDown)
                | Ok(OpCode::EditorKeyUp)
                | Ok(OpCode::EditorSetKnobMode)
        )
    }
}

/// Host-side settings the foreign process needs, pushed over the control
/// channel right after the version exchange.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ForeignHostConfig {
    /// Editor idle timer rate override, in Hz.
    pub frame_rate: Option<f64>,
    /// Force drag-and-drop translation in the editor embedding layer.
    pub editor_force_dnd: bool,
}

/// Requests on the legacy control channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Vst2ControlRequest {
    /// Version exchange; the response echoes the foreign side's version.
    Version(crate::transport::VersionInfo),
    /// Push the host-side configuration.
    Configure(ForeignHostConfig),
    /// Read the freshly loaded plugin's effect fields.
    GetEffectFields,
}

/// Responses on the legacy control channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Vst2ControlResponse {
    /// The foreign side's version.
    Version(crate::transport::VersionInfo),
    /// Plain acknowledgement.
    Ack,
    /// The plugin's effect fields.
    EffectFields(EffectFields),
}

impl Request for Vst2ControlRequest {
    type Response = Vst2ControlResponse;
}

/// A call on the shared request/reply parameters channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ParameterRequest {
    /// Read a parameter value.
    Get {
        /// Parameter index.
        index: i32,
    },
    /// Write a parameter value.
    Set {
        /// Parameter index.
        index: i32,
        /// New value.
        value: f32,
    },
}

/// Response on the parameters channel; `value` is set for reads.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ParameterResponse {
    /// The read value, absent for writes.
    pub value: Option<f32>,
}

impl Request for ParameterRequest {
    type Response = ParameterResponse;
}

/// Per-block request on the process channel. The samples themselves live
/// in the shared audio buffer; this struct only carries the block metadata
/// the plugin will synchronously ask the host for.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AudioRequest {
    /// Frames in this block.
    pub sample_frames: i32,
    /// Whether the samples in the shared buffer are doubles.
    pub double_precision: bool,
    /// Prefetched host transport state for this block.
    pub time_info: Option<api::TimeInfo>,
    /// Prefetched host process level for this block.
    pub process_level: Option<i32>,
    /// Realtime FIFO priority for the foreign audio thread to mirror,
    /// attached at most once per sync interval.
    pub new_realtime_priority: Option<i32>,
}

/// Marker response type for the process channel. On the wire the
/// acknowledgement is a single bare byte, not a frame.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioAck;

/// The byte written back for every serviced audio request.
pub const AUDIO_ACK_BYTE: u8 = 1;

impl Request for AudioRequest {
    type Response = AudioAck;
}

/// Capture a host dispatcher call into its wire form.
///
/// # Safety
/// `ptr` must match what the ABI mandates for `opcode`.
pub unsafe fn capture_dispatch(
    opcode: OpCode,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> DispatchRequest {
    let payload = match opcode {
        OpCode::Initialize => Payload::WantsEffectUpdate,

        OpCode::SetCurrentPresetName | OpCode::StringToParameter | OpCode::CanDo => {
            Payload::Utf8(api::read_string(ptr))
        }

        OpCode::GetCurrentPresetName
        | OpCode::GetParameterLabel
        | OpCode::GetParameterDisplay
        | OpCode::GetParameterName
        | OpCode::GetPresetName
        | OpCode::GetVendorName
        | OpCode::GetProductName
        | OpCode::GetEffectName
        | OpCode::ShellGetNextPlugin => Payload::WantsString,

        OpCode::EditorGetRect => Payload::WantsRect,
        OpCode::EditorOpen => Payload::Handle(ptr as u64),

        OpCode::GetData => Payload::WantsChunkBuffer,
        OpCode::SetData => Payload::Bytes(
            std::slice::from_raw_parts(ptr as *const u8, value.max(0) as usize).to_vec(),
        ),

        OpCode::ProcessEvents => {
            Payload::Events(MidiEventData::from_raw_block(ptr as *const api::Events))
        }

        OpCode::GetInputInfo | OpCode::GetOutputInfo => Payload::WantsPinProperties,

        OpCode::GetMidiKeyName => {
            let request = &*(ptr as *const api::MidiKeyName);
            Payload::KeyName {
                program: request.this_program_index,
                key: request.this_key_number,
            }
        }

        // The only opcodes where `value` is a pointer rather than an
        // integer: both arrangements travel in the payload.
        OpCode::SetSpeakerArrangement => Payload::SpeakerArrangements {
            input: SpeakerArrangementData::from_raw(value as *const api::SpeakerArrangement),
            output: SpeakerArrangementData::from_raw(ptr as *const api::SpeakerArrangement),
        },
        OpCode::GetSpeakerArrangement => Payload::WantsSpeakerArrangements,

        _ => Payload::None,
    };

    let value = match opcode {
        // Pointer-valued `value` slots never travel as integers.
        OpCode::SetSpeakerArrangement | OpCode::GetSpeakerArrangement => 0,
        _ => value as i64,
    };

    DispatchRequest { opcode: opcode.into(), index, value, opt, payload }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    #[test]
    fn payload_variants_round_trip() {
        let values = vec![
            Payload::None,
            Payload::Bytes(vec![0xde, 0xad, 0xbe, 0xef]),
            Payload::Utf8("receiveVstMidiEvent".into()),
            Payload::Handle(0x00ff_aa00),
            Payload::Rect(api::Rect { top: 0, left: 0, bottom: 600, right: 800 }),
            Payload::PinProperties(PinPropertiesData {
                name: "Main L".into(),
                flags: 3,
                arrangement_type: 1,
                short_name: "L".into(),
            }),
            Payload::TimeInfo(api::TimeInfo { tempo: 133.0, ..Default::default() }),
            Payload::Events(vec![
                MidiEventData::Midi {
                    data: [0x90, 60, 100],
                    delta_frames: 12,
                    live: true,
                    note_length: 0,
                    note_offset: 0,
                    detune: 0,
                    note_off_velocity: 0,
                },
                MidiEventData::SysEx { payload: vec![0xf0, 0x7e, 0xf7], delta_frames: 0 },
            ]),
            Payload::SpeakerArrangements {
                input: SpeakerArrangementData { arrangement_type: 1, speakers: vec![1, 2] },
                output: SpeakerArrangementData { arrangement_type: 1, speakers: vec![1, 2] },
            },
            Payload::EffectFields(EffectFields { num_params: 3, ..Default::default() }),
            Payload::WantsChunkBuffer,
        ];
        for value in values {
            let bytes = codec::encode(&value).unwrap();
            assert_eq!(codec::decode::<Payload>(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn event_block_round_trips_through_raw_layout() {
        let events = vec![
            MidiEventData::Midi {
                data: [0x80, 64, 0],
                delta_frames: 3,
                live: false,
                note_length: 480,
                note_offset: 10,
                detune: -2,
                note_off_velocity: 64,
            },
            MidiEventData::SysEx { payload: vec![0xf0, 1, 2, 3, 0xf7], delta_frames: 9 },
        ];
        let block = EventBlock::new(&events);
        let back = unsafe { MidiEventData::from_raw_block(block.as_ptr()) };
        assert_eq!(back, events);
    }

    #[test]
    fn speaker_arrangement_round_trips_through_raw_layout() {
        let arrangement = SpeakerArrangementData {
            arrangement_type: 6,
            speakers: vec![1, 2, 3, 4, 5, 6],
        };
        let mut block = vec![0u8; arrangement.raw_len()];
        arrangement.write_to(&mut block);
        let back = unsafe {
            SpeakerArrangementData::from_raw(block.as_ptr() as *const api::SpeakerArrangement)
        };
        assert_eq!(back, arrangement);
    }

    #[test]
    fn capture_marks_editor_calls_gui_affine() {
        let request = unsafe {
            capture_dispatch(OpCode::EditorOpen, 0, 0, 0x1234 as *mut c_void, 0.0)
        };
        assert!(!request.main_thread_safe());
        assert_eq!(request.payload, Payload::Handle(0x1234));

        let request =
            unsafe { capture_dispatch(OpCode::StateChanged, 0, 1, std::ptr::null_mut(), 0.0) };
        assert!(request.main_thread_safe());
    }

    #[test]
    fn set_data_captures_the_chunk_inline() {
        let chunk = [0xdeu8, 0xad, 0xbe, 0xef];
        let request = unsafe {
            capture_dispatch(
                OpCode::SetData,
                0,
                chunk.len() as isize,
                chunk.as_ptr() as *mut c_void,
                0.0,
            )
        };
        assert_eq!(request.payload, Payload::Bytes(chunk.to_vec()));
        assert_eq!(request.value, chunk.len() as i64);
    }
}
