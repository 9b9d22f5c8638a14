//! Raw structures and types of the VST 2.4 ABI, as presented to the host.

use std::os::raw::c_void;

/// Constant values
#[allow(missing_docs)] // For obvious constants
pub mod consts {
    pub const MAX_PRESET_NAME_LEN: usize = 24;
    pub const MAX_PARAM_STR_LEN: usize = 32;
    pub const MAX_LABEL: usize = 64;
    pub const MAX_SHORT_LABEL: usize = 8;
    pub const MAX_PRODUCT_STR_LEN: usize = 64;
    pub const MAX_VENDOR_STR_LEN: usize = 64;

    /// Plugins are identified by a magic number corresponding to 0x56737450.
    pub const VST_MAGIC: i32 = ('V' as i32) << 24
        | ('s' as i32) << 16
        | ('t' as i32) << 8
        | ('P' as i32);

    /// Value returned by `GetApiVersion` and the host `Version` callback.
    pub const VST_2_4: isize = 2400;
}

/// `VSTPluginMain` function signature.
pub type PluginMain = unsafe extern "C" fn(callback: HostCallbackProc) -> *mut AEffect;

/// Host callback function passed to the plugin at load time.
pub type HostCallbackProc = unsafe extern "C" fn(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> isize;

/// Opcode dispatch function. Called by the host.
pub type DispatcherProc = unsafe extern "C" fn(
    effect: *mut AEffect,
    opcode: i32,
    index: i32,
    value: isize,
    ptr: *mut c_void,
    opt: f32,
) -> isize;

/// Single precision process function. Called by the host.
pub type ProcessProc = unsafe extern "C" fn(
    effect: *mut AEffect,
    inputs: *const *const f32,
    outputs: *mut *mut f32,
    sample_frames: i32,
);

/// Double precision process function. Called by the host.
pub type ProcessProcF64 = unsafe extern "C" fn(
    effect: *mut AEffect,
    inputs: *const *const f64,
    outputs: *mut *mut f64,
    sample_frames: i32,
);

/// Parameter setter. Called by the host.
pub type SetParameterProc = unsafe extern "C" fn(effect: *mut AEffect, index: i32, value: f32);

/// Parameter getter. Called by the host.
pub type GetParameterProc = unsafe extern "C" fn(effect: *mut AEffect, index: i32) -> f32;

/// The opaque effect structure through which the host drives a plugin.
#[allow(non_snake_case)]
#[repr(C)]
pub struct AEffect {
    /// Magic number. Must be `['V', 'S', 'T', 'P']`.
    pub magic: i32,

    /// Host to plug-in dispatcher.
    pub dispatcher: DispatcherProc,

    /// Accumulating process mode, deprecated in VST 2.4.
    pub _process: ProcessProc,

    /// Set value of automatable parameter.
    pub setParameter: SetParameterProc,

    /// Get value of automatable parameter.
    pub getParameter: GetParameterProc,

    /// Number of programs (presets).
    pub numPrograms: i32,

    /// Number of parameters. All programs are assumed to have this many.
    pub numParams: i32,

    /// Number of audio inputs.
    pub numInputs: i32,

    /// Number of audio outputs.
    pub numOutputs: i32,

    /// Bitmask made of values from `flags::Plugin`.
    pub flags: i32,

    /// Reserved for host, must be 0.
    pub reserved1: isize,

    /// Reserved for host, must be 0.
    pub reserved2: isize,

    /// Group delay or latency in samples.
    pub initialDelay: i32,

    /// Deprecated unused member.
    pub _realQualities: i32,

    /// Deprecated unused member.
    pub _offQualities: i32,

    /// Deprecated unused member.
    pub _ioRatio: f32,

    /// Void pointer usable by the implementation to store object data.
    /// The bridge keeps its own pointer here; the thunks recover it.
    pub object: *mut c_void,

    /// User defined pointer.
    pub user: *mut c_void,

    /// Registered unique identifier, used during save/load of presets and
    /// projects.
    pub uniqueId: i32,

    /// Plug-in version (e.g. 1100 for v1.1.0.0).
    pub version: i32,

    /// Process audio samples in replacing mode.
    pub processReplacing: ProcessProc,

    /// Process double precision audio samples in replacing mode.
    pub processReplacingF64: ProcessProcF64,

    /// Reserved for future use (please zero).
    pub future: [u8; 56],
}

/// Rectangle returned for `EditorGetRect`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Rect {
    /// Y value in pixels of top side.
    pub top: i16,
    /// X value in pixels of left side.
    pub left: i16,
    /// Y value in pixels of bottom side.
    pub bottom: i16,
    /// X value in pixels of right side.
    pub right: i16,
}

/// Information about a channel. Only some hosts use this information.
#[repr(C)]
pub struct ChannelProperties {
    /// Channel name.
    pub name: [u8; consts::MAX_LABEL],

    /// Flags found in `flags::Channel`.
    pub flags: i32,

    /// Type of speaker arrangement this channel is a part of.
    pub arrangement_type: i32,

    /// Name of channel (recommended: 6 characters + delimiter).
    pub short_name: [u8; consts::MAX_SHORT_LABEL],

    /// Reserved for future use.
    pub future: [u8; 48],
}

/// Properties of one speaker in an arrangement.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct SpeakerProperties {
    /// Azimuth in radians, clockwise from straight ahead.
    pub azimuth: f32,
    /// Elevation in radians.
    pub elevation: f32,
    /// Distance in meters.
    pub radius: f32,
    /// Reserved, must be 0.
    pub reserved: f32,
    /// Speaker name.
    pub name: [u8; 64],
    /// Speaker type from the arrangement tables.
    pub speaker_type: i32,
    /// Reserved for future use.
    pub future: [u8; 28],
}

/// A speaker arrangement as passed on the `value` and `ptr` slots of the
/// arrangement opcodes. The fixed array holds up to eight speakers; hosts
/// allocate larger blocks for wider layouts, which the bridge re-reads
/// through `num_channels`.
#[repr(C)]
pub struct SpeakerArrangement {
    /// Arrangement type from the arrangement tables.
    pub arrangement_type: i32,
    /// Number of channels in this arrangement.
    pub num_channels: i32,
    /// Per speaker properties.
    pub speakers: [SpeakerProperties; 8],
}

/// Time and transport information returned by the host `GetTime` callback.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TimeInfo {
    /// Current position in audio samples.
    pub sample_pos: f64,
    /// Current sample rate in Hz.
    pub sample_rate: f64,
    /// System time in nanoseconds.
    pub nanoseconds: f64,
    /// Musical position in quarter notes.
    pub ppq_pos: f64,
    /// Current tempo in BPM.
    pub tempo: f64,
    /// Last bar start position in quarter notes.
    pub bar_start_pos: f64,
    /// Cycle start in quarter notes.
    pub cycle_start_pos: f64,
    /// Cycle end in quarter notes.
    pub cycle_end_pos: f64,
    /// Time signature numerator.
    pub time_sig_numerator: i32,
    /// Time signature denominator.
    pub time_sig_denominator: i32,
    /// SMPTE offset in SMPTE subframes.
    pub smpte_offset: i32,
    /// SMPTE frame rate selector.
    pub smpte_frame_rate: i32,
    /// MIDI clock resolution, absolute sample position of the next clock.
    pub samples_to_next_clock: i32,
    /// Bitmask from `flags::TimeInfo`.
    pub flags: i32,
}

/// A struct which contains events, as passed to `ProcessEvents`.
#[repr(C)]
pub struct Events {
    /// Number of events.
    pub num_events: i32,

    /// Reserved for future use. Should be 0.
    pub _reserved: isize,

    /// Variable-length array of pointers to `Event` objects. The standard
    /// declares an initial size of 2; larger blocks hold more.
    pub events: [*mut Event; 2],
}

impl Events {
    /// The raw event pointers of this block.
    ///
    /// # Safety
    /// `num_events` must describe a live allocation of that many pointers.
    pub unsafe fn events_raw(&self) -> &[*const Event] {
        std::slice::from_raw_parts(
            self.events.as_ptr() as *const *const Event,
            self.num_events as usize,
        )
    }
}

/// The type of event that has occurred. See `Event::event_type`.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventType {
    /// Midi event. See `MidiEvent`.
    Midi = 1,

    /// Deprecated.
    _Audio,
    /// Deprecated.
    _Video,
    /// Deprecated.
    _Parameter,
    /// Deprecated.
    _Trigger,

    /// System exclusive event. See `SysExEvent`.
    SysEx,
}

/// A VST event intended to be cast to its concrete type.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct Event {
    /// Discriminates which concrete event struct this block is.
    pub event_type: EventType,

    /// Size of this structure.
    pub byte_size: i32,

    /// Number of samples into the current block at which this event fires.
    pub delta_frames: i32,

    /// Generic flags, none defined in the api yet.
    pub _flags: i32,

    /// Reserved space; the concrete event types overlay it.
    pub _reserved: [u8; 16],
}

/// A midi event.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct MidiEvent {
    /// Should be `EventType::Midi`.
    pub event_type: EventType,

    /// Size of this structure.
    pub byte_size: i32,

    /// Number of samples into the current block at which this event fires.
    pub delta_frames: i32,

    /// See `flags::MidiEvent`.
    pub flags: i32,

    /// Length in sample frames of the entire note if available, else 0.
    pub note_length: i32,

    /// Offset in samples into the note from its start if available, else 0.
    pub note_offset: i32,

    /// 1 to 3 midi bytes.
    pub midi_data: [u8; 3],

    /// Reserved midi byte (0).
    pub _midi_reserved: u8,

    /// Detuning between -63 and +64 cents.
    pub detune: i8,

    /// Note off velocity between 0 and 127.
    pub note_off_velocity: u8,

    /// Reserved for future use. Should be 0.
    pub _reserved1: u8,
    /// Reserved for future use. Should be 0.
    pub _reserved2: u8,
}

/// A midi system exclusive event. Raw byte data, interpreted by the plugin.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct SysExEvent {
    /// Should be `EventType::SysEx`.
    pub event_type: EventType,

    /// Size of this structure.
    pub byte_size: i32,

    /// Number of samples into the current block at which this event fires.
    pub delta_frames: i32,

    /// Generic flags, none defined in the api yet.
    pub _flags: i32,

    /// Size of payload in bytes.
    pub data_size: i32,

    /// Reserved for future use. Should be 0.
    pub _reserved1: isize,

    /// Pointer to payload.
    pub system_data: *mut u8,

    /// Reserved for future use. Should be 0.
    pub _reserved2: isize,
}

/// Bitflags.
pub mod flags {
    bitflags! {
        /// Flags for VST channels.
        pub struct Channel: i32 {
            /// Indicates channel is active. Ignored by host.
            const ACTIVE = 1;
            /// Indicates channel is first of stereo pair.
            const STEREO = 1 << 1;
            /// Use channel's specified speaker arrangement instead of the
            /// stereo flag.
            const SPEAKER = 1 << 2;
        }
    }

    bitflags! {
        /// Flags for VST plugins.
        pub struct Plugin: i32 {
            /// Plugin has an editor.
            const HAS_EDITOR = 1 << 0;
            /// Plugin can process 32 bit audio. (Mandatory in VST 2.4).
            const CAN_REPLACING = 1 << 4;
            /// Plugin preset data is handled in formatless chunks.
            const PROGRAM_CHUNKS = 1 << 5;
            /// Plugin is a synth.
            const IS_SYNTH = 1 << 8;
            /// Plugin does not produce sound when all input is silence.
            const NO_SOUND_IN_STOP = 1 << 9;
            /// Supports 64 bit audio processing.
            const CAN_DOUBLE_REPLACING = 1 << 12;
        }
    }

    bitflags! {
        /// MIDI event flags.
        pub struct MidiEvent: i32 {
            /// This event is played live (not from a sequencer track).
            const REALTIME_EVENT = 1 << 0;
        }
    }

    bitflags! {
        /// Validity and transport flags of `TimeInfo`.
        pub struct TimeInfo: i32 {
            /// Play, cycle or record state has changed.
            const TRANSPORT_CHANGED = 1;
            /// Transport is playing.
            const TRANSPORT_PLAYING = 1 << 1;
            /// Cycle is active.
            const TRANSPORT_CYCLE_ACTIVE = 1 << 2;
            /// Transport is recording.
            const TRANSPORT_RECORDING = 1 << 3;
            /// Automation write mode is active.
            const AUTOMATION_WRITING = 1 << 6;
            /// Automation read mode is active.
            const AUTOMATION_READING = 1 << 7;
            /// `nanoseconds` is valid.
            const NANOSECONDS_VALID = 1 << 8;
            /// `ppq_pos` is valid.
            const PPQ_POS_VALID = 1 << 9;
            /// `tempo` is valid.
            const TEMPO_VALID = 1 << 10;
            /// `bar_start_pos` is valid.
            const BARS_VALID = 1 << 11;
            /// Cycle positions are valid.
            const CYCLE_POS_VALID = 1 << 12;
            /// Time signature is valid.
            const TIME_SIG_VALID = 1 << 13;
            /// SMPTE fields are valid.
            const SMPTE_VALID = 1 << 14;
            /// `samples_to_next_clock` is valid.
            const CLOCK_VALID = 1 << 15;
        }
    }
}

/// Opcodes the host sends through the effect dispatcher.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[doc(hidden)]
#[allow(missing_docs)]
pub enum OpCode {
    Initialize = 0,
    Shutdown,

    /// [value]: preset number to change to.
    ChangePreset,
    /// [return]: current preset number.
    GetCurrentPresetNum,
    /// [ptr]: char array with new preset name.
    SetCurrentPresetName,
    /// [ptr]: char buffer for current preset name.
    GetCurrentPresetName,

    /// [ptr]: char buffer for parameter label (e.g. "db", "ms").
    GetParameterLabel,
    /// [ptr]: char buffer (e.g. "0.5", "ROOM").
    GetParameterDisplay,
    /// [ptr]: char buffer (e.g. "Release", "Gain").
    GetParameterName,

    /// Deprecated.
    _GetVu,

    /// [opt]: new sample rate.
    SetSampleRate,
    /// [value]: new maximum block size.
    SetBlockSize,
    /// [value]: 1 when the audio engine is enabled, 0 when disabled.
    StateChanged,

    /// [ptr]: `Rect**` receiving a pointer to the editor size.
    EditorGetRect,
    /// [ptr]: system dependent window handle.
    EditorOpen,
    /// Close editor. No arguments.
    EditorClose,

    /// Deprecated.
    _EditorDraw,
    /// Deprecated.
    _EditorMouse,
    /// Deprecated.
    _EditorKey,

    /// Idle call from host.
    EditorIdle,

    /// Deprecated.
    _EditorTop,
    /// Deprecated.
    _EditorSleep,
    /// Deprecated.
    _EditorIdentify,

    /// [ptr]: `void**` for chunk data address. [index]: 0 bank, 1 program.
    GetData,
    /// [ptr]: data. [value]: byte size. [index]: 0 bank, 1 program.
    SetData,

    /// [ptr]: `Events*`.
    ProcessEvents,
    /// [index]: param index. [return]: 1=true, 0=false.
    CanBeAutomated,
    /// [index]: param index. [ptr]: parameter string.
    StringToParameter,

    /// Deprecated.
    _GetNumCategories,

    /// [index]: preset number. [ptr]: char buffer for name.
    GetPresetName,

    /// Deprecated.
    _CopyPreset,
    /// Deprecated.
    _ConnectIn,
    /// Deprecated.
    _ConnectOut,

    /// [index]: input index. [ptr]: `ChannelProperties*`.
    GetInputInfo,
    /// [index]: output index. [ptr]: `ChannelProperties*`.
    GetOutputInfo,
    /// [return]: category ordinal.
    GetCategory,

    /// Deprecated.
    _GetCurrentPosition,
    /// Deprecated.
    _GetDestinationBuffer,

    /// Offline processing, not bridged.
    OfflineNotify,
    /// Offline processing, not bridged.
    OfflinePrepare,
    /// Offline processing, not bridged.
    OfflineRun,

    /// Variable I/O processing, not bridged.
    ProcessVarIo,
    /// [value]: input `*mut SpeakerArrangement`.
    /// [ptr]: output `*mut SpeakerArrangement`.
    SetSpeakerArrangement,

    /// Deprecated.
    _SetBlocksizeAndSampleRate,

    /// [value]: 1 = bypass, 0 = no bypass.
    SoftBypass,
    /// [ptr]: buffer for effect name.
    GetEffectName,

    /// Deprecated.
    _GetErrorText,

    /// [ptr]: buffer for vendor name.
    GetVendorName,
    /// [ptr]: buffer for product name.
    GetProductName,
    /// [return]: vendor specific version.
    GetVendorVersion,
    /// No definition, vendor specific.
    VendorSpecific,
    /// [ptr]: "can do" string. [return]: 1 = yes, 0 = maybe, -1 = no.
    CanDo,
    /// [return]: tail size (e.g. reverb time); 0 default, 1 no tail.
    GetTailSize,

    /// Deprecated.
    _Idle,
    /// Deprecated.
    _GetIcon,
    /// Deprecated.
    _SetViewPosition,

    /// [index]: param index. [ptr]: parameter properties, not bridged.
    GetParamInfo,

    /// Deprecated.
    _KeysRequired,

    /// [return]: 2400 for vst 2.4.
    GetApiVersion,

    /// [index]: ASCII char. [value]: keycode. [opt]: modifier bitmask.
    EditorKeyDown,
    /// [index]: ASCII char. [value]: keycode. [opt]: modifier bitmask.
    EditorKeyUp,
    /// [value]: 0 = circular, 1 = circular relative, 2 = linear.
    EditorSetKnobMode,

    /// [index]: MIDI channel. [ptr]: `*mut MidiProgramName`.
    GetMidiProgramName,
    /// [index]: MIDI channel. [ptr]: `*mut MidiProgramName`.
    GetCurrentMidiProgram,
    /// [index]: MIDI channel. [ptr]: `*mut MidiProgramCategory`.
    GetMidiProgramCategory,
    /// [index]: MIDI channel. [return]: 1 if program names changed.
    HasMidiProgramsChanged,
    /// [index]: MIDI channel. [ptr]: `*mut MidiKeyName`.
    GetMidiKeyName,

    /// Called before a preset is loaded.
    BeginSetPreset,
    /// Called after a preset is loaded.
    EndSetPreset,

    /// [value]: inputs `*mut *mut SpeakerArrangement`.
    /// [ptr]: outputs `*mut *mut SpeakerArrangement`.
    GetSpeakerArrangement,
    /// [ptr]: buffer for plugin name. [return]: next plugin's uniqueID.
    ShellGetNextPlugin,

    /// No args. Called once before the first process call.
    StartProcess,
    /// No arguments. Called after the last process call.
    StopProcess,
    /// [value]: number of samples to process. Offline only.
    SetTotalSampleToProcess,
    /// [value]: pan law. [opt]: gain.
    SetPanLaw,

    /// [ptr]: `*mut PatchChunkInfo`.
    BeginLoadBank,
    /// [ptr]: `*mut PatchChunkInfo`.
    BeginLoadPreset,

    /// [value]: 0 if 32 bit, anything else if 64 bit.
    SetPrecision,

    /// [return]: number of used MIDI inputs (1-15).
    GetNumMidiInputs,
    /// [return]: number of used MIDI outputs (1-15).
    GetNumMidiOutputs,
}

/// A MIDI key name request, exchanged for `GetMidiKeyName`.
#[repr(C)]
pub struct MidiKeyName {
    /// Program this key name belongs to.
    pub this_program_index: i32,
    /// Key number between 0 and 127.
    pub this_key_number: i32,
    /// Receives the key name.
    pub key_name: [u8; consts::MAX_LABEL],
    /// Reserved, zero.
    pub reserved: i32,
    /// Reserved for future use.
    pub flags: i32,
}

/// Opcodes a plugin sends through the host callback.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[doc(hidden)]
#[allow(missing_docs)]
pub enum HostOpCode {
    /// [index]: parameter index. [opt]: parameter value.
    Automate = 0,
    /// [return]: host vst version (e.g. 2400 for VST 2.4).
    Version,
    /// [return]: current plugin ID, for shell plugins.
    CurrentId,
    /// Give idle time to the host.
    Idle,
    /// Deprecated.
    _PinConnected = 4,

    /// Deprecated.
    _WantMidi = 6,
    /// [value]: request mask from `flags::TimeInfo`.
    /// [return]: `TimeInfo` pointer or null.
    GetTime,
    /// [ptr]: `Events*` the plugin plays back to the host.
    ProcessEvents,
    /// Deprecated.
    _SetTime,
    /// Deprecated.
    _TempoAt,
    /// Deprecated.
    _GetNumAutomatableParameters,
    /// Deprecated.
    _GetParameterQuantization,

    /// The plugin's I/O setup has changed. [return]: 1 if supported.
    IoChanged,

    /// Deprecated.
    _NeedIdle,

    /// [index]: new width. [value]: new height. [return]: 1 if supported.
    SizeWindow,
    /// [return]: current sample rate.
    GetSampleRate,
    /// [return]: current block size.
    GetBlockSize,
    /// [return]: input latency in samples.
    GetInputLatency,
    /// [return]: output latency in samples.
    GetOutputLatency,

    /// Deprecated.
    _GetPreviousPlug = 20,
    /// Deprecated.
    _GetNextPlug,
    /// Deprecated.
    _WillReplaceOrAccumulate,

    /// [return]: a `ProcessLevel` ordinal.
    GetCurrentProcessLevel,
    /// [return]: 0 unsupported, 1 off, 2 read, 3 write, 4 read/write.
    GetAutomationState,

    /// Offline processing, not bridged.
    OfflineStart,
    /// Offline processing, not bridged.
    OfflineRead,
    /// Offline processing, not bridged.
    OfflineWrite,
    /// Offline processing, not bridged.
    OfflineGetCurrentPass,
    /// Offline processing, not bridged.
    OfflineGetCurrentMetaPass,

    /// Deprecated.
    _SetOutputSampleRate = 30,
    /// Deprecated.
    _GetOutputSpeakerArrangement,

    /// [ptr]: buffer for the host vendor string.
    GetVendorString,
    /// [ptr]: buffer for the host product string.
    GetProductString,
    /// [return]: host vendor specific version.
    GetVendorVersion,
    /// No definition, vendor specific.
    VendorSpecific,

    /// Deprecated.
    _SetIcon = 36,

    /// [ptr]: "can do" string. [return]: 1 = yes, 0 = maybe, -1 = no.
    CanDo,
    /// [return]: language ordinal.
    GetLanguage,

    /// Deprecated.
    _OpenWindow = 39,
    /// Deprecated.
    _CloseWindow,

    /// [ptr]: buffer for the plugin directory.
    GetDirectory,
    /// The plugin's display derived values changed, host should re-read.
    UpdateDisplay,
    /// [index]: parameter index. Begin of a gesture.
    BeginEdit,
    /// [index]: parameter index. End of a gesture.
    EndEdit,

    /// Not bridged.
    OpenFileSelector,
    /// Not bridged.
    CloseFileSelector,
}

/// Denotes in which thread the host currently is.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
pub enum ProcessLevel {
    /// Unsupported by host.
    Unknown = 0,
    /// GUI thread.
    User,
    /// Audio process thread.
    Realtime,
    /// Sequencer thread (MIDI, etc).
    Prefetch,
    /// Offline processing thread.
    Offline,
}

/// Copy a string into a zero-terminated fixed-size ABI buffer, truncating
/// at `max` bytes.
///
/// # Safety
/// `dst` must point to at least `max` writable bytes.
pub unsafe fn copy_string(dst: *mut c_void, src: &str, max: usize) -> isize {
    use libc::{memcpy, memset};
    use std::cmp::min;

    memset(dst, 0, max);
    memcpy(
        dst,
        src.as_ptr() as *const c_void,
        min(max.saturating_sub(1), src.len()),
    );
    1
}

/// Read a zero-terminated C string from an ABI pointer. Lossy on invalid
/// UTF-8; empty on null.
///
/// # Safety
/// `ptr` must be null or point to a zero-terminated buffer.
pub unsafe fn read_string(ptr: *const c_void) -> String {
    use std::ffi::CStr;

    if ptr.is_null() {
        return String::new();
    }
    String::from_utf8_lossy(CStr::from_ptr(ptr as *const libc::c_char).to_bytes()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_ordinals_match_the_published_abi() {
        assert_eq!(i32::from(OpCode::StateChanged), 12);
        assert_eq!(i32::from(OpCode::EditorGetRect), 13);
        assert_eq!(i32::from(OpCode::GetData), 23);
        assert_eq!(i32::from(OpCode::SetData), 24);
        assert_eq!(i32::from(OpCode::ProcessEvents), 25);
        assert_eq!(i32::from(OpCode::SetSpeakerArrangement), 42);
        assert_eq!(i32::from(OpCode::CanDo), 51);
        assert_eq!(i32::from(OpCode::GetApiVersion), 58);
        assert_eq!(i32::from(OpCode::GetSpeakerArrangement), 69);
        assert_eq!(i32::from(OpCode::GetNumMidiOutputs), 79);
    }

    #[test]
    fn host_opcode_ordinals_match_the_published_abi() {
        assert_eq!(i32::from(HostOpCode::GetTime), 7);
        assert_eq!(i32::from(HostOpCode::IoChanged), 13);
        assert_eq!(i32::from(HostOpCode::SizeWindow), 15);
        assert_eq!(i32::from(HostOpCode::GetCurrentProcessLevel), 23);
        assert_eq!(i32::from(HostOpCode::GetVendorString), 32);
        assert_eq!(i32::from(HostOpCode::CanDo), 37);
        assert_eq!(i32::from(HostOpCode::EndEdit), 44);
    }

    #[test]
    fn unknown_opcodes_are_rejected() {
        assert!(OpCode::try_from(1000).is_err());
        assert!(HostOpCode::try_from(5).is_err());
    }

    #[test]
    fn string_copy_truncates_and_terminates() {
        let mut buf = [0xffu8; 8];
        unsafe {
            copy_string(buf.as_mut_ptr() as *mut c_void, "winebridge", buf.len());
        }
        assert_eq!(&buf[..7], b"winebri");
        assert_eq!(buf[7], 0);
    }
}
