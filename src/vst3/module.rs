//! The real plugin module behind the foreign host's object seam.
//!
//! Loads a VST3 module with `libloading`, adapts its class factory onto
//! [`Vst3Factory`] and drives created objects through their COM interfaces.
//! Host-owned collaborators (context, component handler, connection
//! endpoints, streams, plug frame) are wrapped as COM objects so the
//! plugin can call back into the trait seams of [`super::host`].

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use vst3::com_scrape_types::Interface;
use vst3::Steinberg::Vst::*;
use vst3::Steinberg::*;
use vst3::{Class, ComPtr, ComWrapper};

use super::host::{
    ComponentHandlerSink, FrameSink, HostContextHandle, MessageSink, ProcessOutput, Vst3Factory,
    Vst3Plugin,
};
use super::messages::{
    AttributeMessage, AttributeValue, BusInfoData, Cid, EventData, InterfaceFlags,
    ParameterInfoData, ProgramListInfoData, StateScope, UnitInfoData, ViewRect,
};
use crate::error::{BridgeError, Result};
use crate::shmem::AudioShmBuffer;

/// Whether a module path names a modern (VST3) module rather than a
/// legacy one. The path discovery layer hands us the module file itself;
/// only the flavour is decided here.
pub fn is_vst3_module(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case("vst3"))
}

fn tuid_of(cid: &Cid) -> TUID {
    let mut tuid: TUID = [0; 16];
    for (dst, src) in tuid.iter_mut().zip(cid.0.iter()) {
        *dst = *src as _;
    }
    tuid
}

fn tuid_bytes(tuid: &TUID) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    for (dst, src) in bytes.iter_mut().zip(tuid.iter()) {
        *dst = *src as u8;
    }
    bytes
}

/// Copy a Rust string into a UTF-16 ABI buffer, zero terminated.
unsafe fn copy_wstring(src: &str, dst: *mut TChar, len: usize) {
    let mut written = 0;
    for unit in src.encode_utf16().take(len.saturating_sub(1)) {
        *dst.add(written) = unit as TChar;
        written += 1;
    }
    *dst.add(written) = 0;
}

/// Read a zero-terminated UTF-16 ABI buffer.
unsafe fn read_wstring(src: *const TChar, max: usize) -> String {
    let mut units = Vec::new();
    for i in 0..max {
        let unit = *src.add(i);
        if unit == 0 {
            break;
        }
        units.push(unit as u16);
    }
    String::from_utf16_lossy(&units)
}

unsafe fn read_cstring(src: *const c_void) -> String {
    crate::vst2::api::read_string(src)
}

/// Query one interface off a COM object through its `FUnknown` prefix.
unsafe fn probe_interface<I: Interface>(unknown: *mut FUnknown) -> Option<ComPtr<I>> {
    let mut obj: *mut c_void = std::ptr::null_mut();
    let result = ((*(*unknown).vtbl).queryInterface)(
        unknown,
        &I::IID as *const _ as *const TUID,
        &mut obj,
    );
    if result == kResultOk && !obj.is_null() {
        ComPtr::from_raw(obj as *mut I)
    } else {
        None
    }
}

/// Live message objects created through our factory, keyed by the
/// `IMessage` pointer the plugin holds. Only these can be read back when
/// the plugin notifies a connection; a foreign message object's attribute
/// list has no enumeration primitive.
#[derive(Default)]
struct MessageTable {
    entries: Mutex<HashMap<usize, Weak<Mutex<AttributeMessage>>>>,
}

impl MessageTable {
    fn register(&self, key: usize, data: &Arc<Mutex<AttributeMessage>>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.insert(key, Arc::downgrade(data));
    }

    fn resolve(&self, key: usize) -> Option<AttributeMessage> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .and_then(Weak::upgrade)
            .map(|data| data.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

/// Attribute list half of a message object.
struct AttrShim {
    data: Arc<Mutex<AttributeMessage>>,
    // Backs the raw pointer returned by getBinary until the next call.
    binary_scratch: Mutex<Vec<u8>>,
}

impl Class for AttrShim {
    type Interfaces = (IAttributeList,);
}

impl AttrShim {
    fn set(&self, id: IAttrID, value: AttributeValue) {
        let key = unsafe { read_cstring(id as *const c_void) };
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        data.attributes.retain(|(existing, _)| *existing != key);
        data.attributes.push((key, value));
    }

    fn get(&self, id: IAttrID) -> Option<AttributeValue> {
        let key = unsafe { read_cstring(id as *const c_void) };
        self.data.lock().unwrap_or_else(|e| e.into_inner()).get(&key).cloned()
    }
}

impl IAttributeListTrait for AttrShim {
    unsafe fn setInt(&self, id: IAttrID, value: int64) -> tresult {
        self.set(id, AttributeValue::Int(value));
        kResultOk
    }

    unsafe fn getInt(&self, id: IAttrID, value: *mut int64) -> tresult {
        if value.is_null() {
            return kInvalidArgument;
        }
        match self.get(id) {
            Some(AttributeValue::Int(stored)) => {
                *value = stored;
                kResultOk
            }
            _ => kResultFalse,
        }
    }

    unsafe fn setFloat(&self, id: IAttrID, value: f64) -> tresult {
        self.set(id, AttributeValue::Float(value));
        kResultOk
    }

    unsafe fn getFloat(&self, id: IAttrID, value: *mut f64) -> tresult {
        if value.is_null() {
            return kInvalidArgument;
        }
        match self.get(id) {
            Some(AttributeValue::Float(stored)) => {
                *value = stored;
                kResultOk
            }
            _ => kResultFalse,
        }
    }

    unsafe fn setString(&self, id: IAttrID, string: *const TChar) -> tresult {
        if string.is_null() {
            return kInvalidArgument;
        }
        self.set(id, AttributeValue::String(read_wstring(string, 4096)));
        kResultOk
    }

    unsafe fn getString(&self, id: IAttrID, string: *mut TChar, size_in_bytes: uint32) -> tresult {
        if string.is_null() {
            return kInvalidArgument;
        }
        match self.get(id) {
            Some(AttributeValue::String(stored)) => {
                let len = size_in_bytes as usize / std::mem::size_of::<TChar>();
                if len == 0 {
                    return kInvalidArgument;
                }
                copy_wstring(&stored, string, len);
                kResultOk
            }
            _ => kResultFalse,
        }
    }

    unsafe fn setBinary(&self, id: IAttrID, data: *const c_void, size_in_bytes: uint32) -> tresult {
        if data.is_null() {
            return kInvalidArgument;
        }
        let bytes =
            std::slice::from_raw_parts(data as *const u8, size_in_bytes as usize).to_vec();
        self.set(id, AttributeValue::Binary(bytes));
        kResultOk
    }

    unsafe fn getBinary(
        &self,
        id: IAttrID,
        data: *mut *const c_void,
        size_in_bytes: *mut uint32,
    ) -> tresult {
        if data.is_null() || size_in_bytes.is_null() {
            return kInvalidArgument;
        }
        match self.get(id) {
            Some(AttributeValue::Binary(stored)) => {
                let mut scratch = self.binary_scratch.lock().unwrap_or_else(|e| e.into_inner());
                *scratch = stored;
                *data = scratch.as_ptr() as *const c_void;
                *size_in_bytes = scratch.len() as uint32;
                kResultOk
            }
            _ => kResultFalse,
        }
    }
}

/// A message created by our factory.
struct MessageShim {
    data: Arc<Mutex<AttributeMessage>>,
    // Zero-terminated storage behind the getMessageID pointer.
    id: Mutex<CString>,
    attributes: Mutex<Option<ComPtr<IAttributeList>>>,
}

impl Class for MessageShim {
    type Interfaces = (IMessage,);
}

impl IMessageTrait for MessageShim {
    unsafe fn getMessageID(&self) -> FIDString {
        self.id.lock().unwrap_or_else(|e| e.into_inner()).as_ptr() as FIDString
    }

    unsafe fn setMessageID(&self, id: FIDString) {
        let text = read_cstring(id as *const c_void);
        self.data.lock().unwrap_or_else(|e| e.into_inner()).id = text.clone();
        *self.id.lock().unwrap_or_else(|e| e.into_inner()) =
            CString::new(text).unwrap_or_default();
    }

    unsafe fn getAttributes(&self) -> *mut IAttributeList {
        let mut attributes = self.attributes.lock().unwrap_or_else(|e| e.into_inner());
        let attributes = attributes.get_or_insert_with(|| {
            let shim = ComWrapper::new(AttrShim {
                data: Arc::clone(&self.data),
                binary_scratch: Mutex::new(Vec::new()),
            });
            shim.to_com_ptr::<IAttributeList>()
                .expect("BUG: IAttributeList is declared on AttrShim")
        });
        attributes.as_ptr()
    }
}

fn new_message(
    data: AttributeMessage,
    table: Option<&MessageTable>,
) -> (ComPtr<IMessage>, Arc<Mutex<AttributeMessage>>) {
    let id = CString::new(data.id.clone()).unwrap_or_default();
    let data = Arc::new(Mutex::new(data));
    let shim = ComWrapper::new(MessageShim {
        data: Arc::clone(&data),
        id: Mutex::new(id),
        attributes: Mutex::new(None),
    });
    let message =
        shim.to_com_ptr::<IMessage>().expect("BUG: IMessage is declared on MessageShim");
    if let Some(table) = table {
        table.register(message.as_ptr() as usize, &data);
    }
    (message, data)
}

/// The host context handed to `IPluginBase::initialize`, doubling as the
/// message factory.
struct HostShim {
    context: Option<Arc<dyn HostContextHandle>>,
    messages: Arc<MessageTable>,
}

impl Class for HostShim {
    type Interfaces = (IHostApplication,);
}

impl IHostApplicationTrait for HostShim {
    unsafe fn getName(&self, name: *mut [TChar; 128]) -> tresult {
        if name.is_null() {
            return kInvalidArgument;
        }
        let text = self.context.as_ref().map(|context| context.name()).unwrap_or_default();
        copy_wstring(&text, (*name).as_mut_ptr(), 128);
        kResultOk
    }

    unsafe fn createInstance(
        &self,
        cid: *mut TUID,
        iid: *mut TUID,
        obj: *mut *mut c_void,
    ) -> tresult {
        if obj.is_null() {
            return kInvalidArgument;
        }
        let message_iid = &IMessage::IID as *const _ as *const TUID;
        let wants_message = (!cid.is_null() && *cid == *message_iid)
            || (!iid.is_null() && *iid == *message_iid);
        if !wants_message {
            return kNoInterface;
        }
        let (message, _) = new_message(AttributeMessage::default(), Some(&self.messages));
        *obj = message.into_raw() as *mut c_void;
        kResultOk
    }
}

/// Connection endpoint we hand to the plugin; forwards its notifies into
/// a [`MessageSink`].
struct ConnectionShim {
    sink: Arc<dyn MessageSink>,
    messages: Arc<MessageTable>,
}

impl Class for ConnectionShim {
    type Interfaces = (IConnectionPoint,);
}

impl IConnectionPointTrait for ConnectionShim {
    unsafe fn connect(&self, _other: *mut IConnectionPoint) -> tresult {
        kResultOk
    }

    unsafe fn disconnect(&self, _other: *mut IConnectionPoint) -> tresult {
        kResultOk
    }

    unsafe fn notify(&self, message: *mut IMessage) -> tresult {
        if message.is_null() {
            return kInvalidArgument;
        }
        match self.messages.resolve(message as usize) {
            Some(data) => self.sink.notify(&data),
            None => {
                warn!("dropping connection message not created by our factory");
                kResultFalse
            }
        }
    }
}

/// Component handler forwarding into the callback seam.
struct HandlerShim {
    sink: Arc<dyn ComponentHandlerSink>,
}

impl Class for HandlerShim {
    type Interfaces = (IComponentHandler,);
}

impl IComponentHandlerTrait for HandlerShim {
    unsafe fn beginEdit(&self, id: ParamID) -> tresult {
        self.sink.begin_edit(id)
    }

    unsafe fn performEdit(&self, id: ParamID, value_normalized: ParamValue) -> tresult {
        self.sink.perform_edit(id, value_normalized)
    }

    unsafe fn endEdit(&self, id: ParamID) -> tresult {
        self.sink.end_edit(id)
    }

    unsafe fn restartComponent(&self, flags: int32) -> tresult {
        self.sink.restart_component(flags)
    }
}

/// Plug frame forwarding view resize requests into the callback seam.
struct FrameShim {
    sink: Arc<dyn FrameSink>,
}

impl Class for FrameShim {
    type Interfaces = (IPlugFrame,);
}

impl IPlugFrameTrait for FrameShim {
    unsafe fn resizeView(
        &self,
        _view: *mut IPlugView,
        new_size: *mut vst3::Steinberg::ViewRect,
    ) -> tresult {
        if new_size.is_null() {
            return kInvalidArgument;
        }
        let rect = &*new_size;
        self.sink.resize_view(ViewRect {
            left: rect.left,
            top: rect.top,
            right: rect.right,
            bottom: rect.bottom,
        })
    }
}

type StreamData = Arc<Mutex<(Vec<u8>, usize)>>;

/// Byte-vector stream used for every state and program-data read-back.
struct StreamShim {
    data: StreamData,
}

impl Class for StreamShim {
    type Interfaces = (IBStream,);
}

/// Build a stream object; the returned handle reads the bytes back after
/// the plugin wrote into it.
fn new_stream(bytes: &[u8]) -> (ComPtr<IBStream>, StreamData) {
    let data: StreamData = Arc::new(Mutex::new((bytes.to_vec(), 0)));
    let shim = ComWrapper::new(StreamShim { data: Arc::clone(&data) });
    let com = shim.to_com_ptr::<IBStream>().expect("BUG: IBStream is declared on StreamShim");
    (com, data)
}

fn stream_bytes(data: &StreamData) -> Vec<u8> {
    data.lock().unwrap_or_else(|e| e.into_inner()).0.clone()
}

impl IBStreamTrait for StreamShim {
    unsafe fn read(
        &self,
        buffer: *mut c_void,
        num_bytes: int32,
        num_bytes_read: *mut int32,
    ) -> tresult {
        if buffer.is_null() || num_bytes < 0 {
            return kInvalidArgument;
        }
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let (bytes, position) = &mut *data;
        let available = bytes.len().saturating_sub(*position).min(num_bytes as usize);
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr().add(*position),
            buffer as *mut u8,
            available,
        );
        *position += available;
        if !num_bytes_read.is_null() {
            *num_bytes_read = available as int32;
        }
        kResultOk
    }

    unsafe fn write(
        &self,
        buffer: *mut c_void,
        num_bytes: int32,
        num_bytes_written: *mut int32,
    ) -> tresult {
        if buffer.is_null() || num_bytes < 0 {
            return kInvalidArgument;
        }
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let (bytes, position) = &mut *data;
        let incoming = std::slice::from_raw_parts(buffer as *const u8, num_bytes as usize);
        if bytes.len() < *position + incoming.len() {
            bytes.resize(*position + incoming.len(), 0);
        }
        bytes[*position..*position + incoming.len()].copy_from_slice(incoming);
        *position += incoming.len();
        if !num_bytes_written.is_null() {
            *num_bytes_written = incoming.len() as int32;
        }
        kResultOk
    }

    unsafe fn seek(&self, pos: int64, mode: int32, result: *mut int64) -> tresult {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let (bytes, position) = &mut *data;
        let base = match mode {
            0 => 0,                  // set
            1 => *position as i64,   // current
            2 => bytes.len() as i64, // end
            _ => return kInvalidArgument,
        };
        let target = (base + pos).clamp(0, bytes.len() as i64) as usize;
        *position = target;
        if !result.is_null() {
            *result = target as int64;
        }
        kResultOk
    }

    unsafe fn tell(&self, pos: *mut int64) -> tresult {
        if pos.is_null() {
            return kInvalidArgument;
        }
        *pos = self.data.lock().unwrap_or_else(|e| e.into_inner()).1 as int64;
        kResultOk
    }
}

type QueuePoints = Arc<Mutex<Vec<(i32, f64)>>>;

/// One parameter's automation queue.
struct QueueShim {
    id: ParamID,
    points: QueuePoints,
}

impl Class for QueueShim {
    type Interfaces = (IParamValueQueue,);
}

impl IParamValueQueueTrait for QueueShim {
    unsafe fn getParameterId(&self) -> ParamID {
        self.id
    }

    unsafe fn getPointCount(&self) -> int32 {
        self.points.lock().unwrap_or_else(|e| e.into_inner()).len() as int32
    }

    unsafe fn getPoint(
        &self,
        index: int32,
        sample_offset: *mut int32,
        value: *mut ParamValue,
    ) -> tresult {
        let points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        match points.get(index as usize) {
            Some(&(offset, stored)) => {
                if !sample_offset.is_null() {
                    *sample_offset = offset;
                }
                if !value.is_null() {
                    *value = stored;
                }
                kResultOk
            }
            None => kInvalidArgument,
        }
    }

    unsafe fn addPoint(
        &self,
        sample_offset: int32,
        value: ParamValue,
        index: *mut int32,
    ) -> tresult {
        let mut points = self.points.lock().unwrap_or_else(|e| e.into_inner());
        points.push((sample_offset, value));
        if !index.is_null() {
            *index = points.len() as int32 - 1;
        }
        kResultOk
    }
}

struct QueueEntry {
    id: ParamID,
    points: QueuePoints,
    com: ComPtr<IParamValueQueue>,
}

fn new_queue(id: ParamID, points: Vec<(i32, f64)>) -> QueueEntry {
    let points: QueuePoints = Arc::new(Mutex::new(points));
    let shim = ComWrapper::new(QueueShim { id, points: Arc::clone(&points) });
    let com = shim
        .to_com_ptr::<IParamValueQueue>()
        .expect("BUG: IParamValueQueue is declared on QueueShim");
    QueueEntry { id, points, com }
}

type QueueTable = Arc<Mutex<Vec<QueueEntry>>>;

/// Parameter change list for one direction of one block.
struct ParamChangesShim {
    queues: QueueTable,
}

impl Class for ParamChangesShim {
    type Interfaces = (IParameterChanges,);
}

/// Build a change list pre-filled with the block's input automation; the
/// returned table reads back whatever the plugin appended.
fn new_param_changes(
    queues: &[super::messages::ParameterQueue],
) -> (ComPtr<IParameterChanges>, QueueTable) {
    let table: QueueTable = Arc::new(Mutex::new(
        queues
            .iter()
            .map(|queue| {
                new_queue(
                    queue.param_id,
                    queue.points.iter().map(|point| (point.sample_offset, point.value)).collect(),
                )
            })
            .collect(),
    ));
    let shim = ComWrapper::new(ParamChangesShim { queues: Arc::clone(&table) });
    let com = shim
        .to_com_ptr::<IParameterChanges>()
        .expect("BUG: IParameterChanges is declared on ParamChangesShim");
    (com, table)
}

fn collect_queues(table: &QueueTable) -> Vec<super::messages::ParameterQueue> {
    table
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .map(|entry| super::messages::ParameterQueue {
            param_id: entry.id,
            points: entry
                .points
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|&(sample_offset, value)| super::messages::ParameterPoint {
                    sample_offset,
                    value,
                })
                .collect(),
        })
        .collect()
}

impl IParameterChangesTrait for ParamChangesShim {
    unsafe fn getParameterCount(&self) -> int32 {
        self.queues.lock().unwrap_or_else(|e| e.into_inner()).len() as int32
    }

    unsafe fn getParameterData(&self, index: int32) -> *mut IParamValueQueue {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        match queues.get(index as usize) {
            Some(entry) => entry.com.as_ptr(),
            None => std::ptr::null_mut(),
        }
    }

    unsafe fn addParameterData(
        &self,
        id: *const ParamID,
        index: *mut int32,
    ) -> *mut IParamValueQueue {
        if id.is_null() {
            return std::ptr::null_mut();
        }
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(at) = queues.iter().position(|entry| entry.id == *id) {
            if !index.is_null() {
                *index = at as int32;
            }
            return queues[at].com.as_ptr();
        }
        queues.push(new_queue(*id, Vec::new()));
        if !index.is_null() {
            *index = queues.len() as int32 - 1;
        }
        queues.last().map_or(std::ptr::null_mut(), |entry| entry.com.as_ptr())
    }
}

const NOTE_ON_EVENT: u16 = 0;
const NOTE_OFF_EVENT: u16 = 1;
const DATA_EVENT: u16 = 2;
const POLY_PRESSURE_EVENT: u16 = 3;
const DATA_TYPE_MIDI_SYSEX: u32 = 0;

fn raw_note_event(event: &super::messages::Event) -> Option<Event> {
    let mut raw: Event = unsafe { std::mem::zeroed() };
    raw.busIndex = event.bus_index;
    raw.sampleOffset = event.sample_offset;
    raw.ppqPosition = 0.0;
    raw.flags = 0;
    match &event.data {
        EventData::NoteOn { channel, pitch, velocity, tuning, note_id, length } => {
            raw.r#type = NOTE_ON_EVENT;
            raw.__field0.noteOn.channel = *channel;
            raw.__field0.noteOn.pitch = *pitch;
            raw.__field0.noteOn.velocity = *velocity;
            raw.__field0.noteOn.tuning = *tuning;
            raw.__field0.noteOn.noteId = *note_id;
            raw.__field0.noteOn.length = *length;
        }
        EventData::NoteOff { channel, pitch, velocity, note_id } => {
            raw.r#type = NOTE_OFF_EVENT;
            raw.__field0.noteOff.channel = *channel;
            raw.__field0.noteOff.pitch = *pitch;
            raw.__field0.noteOff.velocity = *velocity;
            raw.__field0.noteOff.noteId = *note_id;
        }
        EventData::PolyPressure { channel, pitch, pressure, note_id } => {
            raw.r#type = POLY_PRESSURE_EVENT;
            raw.__field0.polyPressure.channel = *channel;
            raw.__field0.polyPressure.pitch = *pitch;
            raw.__field0.polyPressure.pressure = *pressure;
            raw.__field0.polyPressure.noteId = *note_id;
        }
        // Raw data events carry caller-owned bytes; they are staged in
        // the event list's arena instead.
        EventData::Data { .. } => return None,
    }
    Some(raw)
}

unsafe fn owned_event(raw: &Event) -> Option<super::messages::Event> {
    let data = match raw.r#type {
        NOTE_ON_EVENT => EventData::NoteOn {
            channel: raw.__field0.noteOn.channel,
            pitch: raw.__field0.noteOn.pitch,
            velocity: raw.__field0.noteOn.velocity,
            tuning: raw.__field0.noteOn.tuning,
            note_id: raw.__field0.noteOn.noteId,
            length: raw.__field0.noteOn.length,
        },
        NOTE_OFF_EVENT => EventData::NoteOff {
            channel: raw.__field0.noteOff.channel,
            pitch: raw.__field0.noteOff.pitch,
            velocity: raw.__field0.noteOff.velocity,
            note_id: raw.__field0.noteOff.noteId,
        },
        POLY_PRESSURE_EVENT => EventData::PolyPressure {
            channel: raw.__field0.polyPressure.channel,
            pitch: raw.__field0.polyPressure.pitch,
            pressure: raw.__field0.polyPressure.pressure,
            note_id: raw.__field0.polyPressure.noteId,
        },
        DATA_EVENT if raw.__field0.data.r#type == DATA_TYPE_MIDI_SYSEX => EventData::Data {
            bytes: std::slice::from_raw_parts(
                raw.__field0.data.bytes,
                raw.__field0.data.size as usize,
            )
            .to_vec(),
        },
        _ => return None,
    };
    Some(super::messages::Event {
        bus_index: raw.busIndex,
        sample_offset: raw.sampleOffset,
        data,
    })
}

/// Shared state of one event list. SysEx payload bytes are staged in the
/// arena so their pointers stay valid for the whole call.
#[derive(Default)]
struct EventListData {
    events: Mutex<Vec<Event>>,
    arena: Mutex<Vec<Vec<u8>>>,
}

impl EventListData {
    fn fill(&self, events: &[super::messages::Event]) {
        let mut raw_events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let mut arena = self.arena.lock().unwrap_or_else(|e| e.into_inner());
        for event in events {
            match &event.data {
                EventData::Data { bytes } => {
                    arena.push(bytes.clone());
                    let stable =
                        arena.last().map(|bytes| bytes.as_ptr()).unwrap_or(std::ptr::null());
                    let mut raw: Event = unsafe { std::mem::zeroed() };
                    raw.busIndex = event.bus_index;
                    raw.sampleOffset = event.sample_offset;
                    raw.r#type = DATA_EVENT;
                    raw.__field0.data.r#type = DATA_TYPE_MIDI_SYSEX;
                    raw.__field0.data.size = bytes.len() as u32;
                    raw.__field0.data.bytes = stable;
                    raw_events.push(raw);
                }
                _ => {
                    if let Some(raw) = raw_note_event(event) {
                        raw_events.push(raw);
                    }
                }
            }
        }
    }

    fn collect(&self) -> Vec<super::messages::Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|raw| unsafe { owned_event(raw) })
            .collect()
    }
}

/// Event list for one direction of one block.
struct EventListShim {
    data: Arc<EventListData>,
}

impl Class for EventListShim {
    type Interfaces = (IEventList,);
}

fn new_event_list(events: &[super::messages::Event]) -> (ComPtr<IEventList>, Arc<EventListData>) {
    let data = Arc::new(EventListData::default());
    data.fill(events);
    let shim = ComWrapper::new(EventListShim { data: Arc::clone(&data) });
    let com =
        shim.to_com_ptr::<IEventList>().expect("BUG: IEventList is declared on EventListShim");
    (com, data)
}

impl IEventListTrait for EventListShim {
    unsafe fn getEventCount(&self) -> int32 {
        self.data.events.lock().unwrap_or_else(|e| e.into_inner()).len() as int32
    }

    unsafe fn getEvent(&self, index: int32, out: *mut Event) -> tresult {
        if out.is_null() {
            return kInvalidArgument;
        }
        let events = self.data.events.lock().unwrap_or_else(|e| e.into_inner());
        match events.get(index as usize) {
            Some(event) => {
                *out = *event;
                kResultOk
            }
            None => kInvalidArgument,
        }
    }

    unsafe fn addEvent(&self, event: *mut Event) -> tresult {
        if event.is_null() {
            return kInvalidArgument;
        }
        let mut event = *event;
        // SysEx bytes belong to the caller; copy them into the arena so
        // the collected event outlives the call.
        if event.r#type == DATA_EVENT && !event.__field0.data.bytes.is_null() {
            let mut arena = self.data.arena.lock().unwrap_or_else(|e| e.into_inner());
            arena.push(
                std::slice::from_raw_parts(
                    event.__field0.data.bytes,
                    event.__field0.data.size as usize,
                )
                .to_vec(),
            );
            event.__field0.data.bytes =
                arena.last().map(|bytes| bytes.as_ptr()).unwrap_or(std::ptr::null());
        }
        self.data.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
        kResultOk
    }
}

fn raw_process_context(transport: &super::messages::TransportData) -> ProcessContext {
    const PLAYING: u32 = 1 << 1;
    const CYCLE_ACTIVE: u32 = 1 << 2;
    const RECORDING: u32 = 1 << 3;
    const PROJECT_TIME_MUSIC_VALID: u32 = 1 << 9;
    const TEMPO_VALID: u32 = 1 << 10;
    const BAR_POSITION_VALID: u32 = 1 << 11;
    const CYCLE_VALID: u32 = 1 << 12;
    const TIME_SIG_VALID: u32 = 1 << 13;

    let mut context: ProcessContext = unsafe { std::mem::zeroed() };
    context.state = PROJECT_TIME_MUSIC_VALID
        | TEMPO_VALID
        | BAR_POSITION_VALID
        | CYCLE_VALID
        | TIME_SIG_VALID;
    if transport.playing {
        context.state |= PLAYING;
    }
    if transport.recording {
        context.state |= RECORDING;
    }
    if transport.cycle_active {
        context.state |= CYCLE_ACTIVE;
    }
    context.tempo = transport.tempo;
    context.timeSigNumerator = transport.time_sig_numerator;
    context.timeSigDenominator = transport.time_sig_denominator;
    context.projectTimeSamples = transport.position_samples;
    context.projectTimeMusic = transport.position_quarters;
    context.barPositionMusic = transport.bar_position_quarters;
    context.cycleStartMusic = transport.cycle_start_quarters;
    context.cycleEndMusic = transport.cycle_end_quarters;
    context
}

/// A loaded VST3 module and its class factory.
pub struct Vst3Module {
    factory: Option<ComPtr<IPluginFactory>>,
    library: libloading::Library,
    messages: Arc<MessageTable>,
}

// The factory is only used behind the foreign host's registry locks; the
// COM objects themselves never leave them.
unsafe impl Send for Vst3Module {}
unsafe impl Sync for Vst3Module {}

impl Vst3Module {
    /// Load the module, run its entry point and fetch the class factory.
    pub fn load(path: &Path) -> Result<Vst3Module> {
        unsafe {
            let library = libloading::Library::new(path)
                .map_err(|err| BridgeError::Transport(std::io::Error::other(err)))?;

            // The init entry differs per module flavour; call whichever
            // one the module exports.
            if let Ok(init) = library.get::<unsafe extern "system" fn() -> bool>(b"InitDll") {
                if !init() {
                    return Err(BridgeError::Protocol("module init entry failed"));
                }
            } else if let Ok(init) =
                library.get::<unsafe extern "system" fn(*mut c_void) -> bool>(b"ModuleEntry")
            {
                if !init(std::ptr::null_mut()) {
                    return Err(BridgeError::Protocol("module init entry failed"));
                }
            }

            let get_factory: libloading::Symbol<unsafe extern "system" fn() -> *mut c_void> =
                library
                    .get(b"GetPluginFactory")
                    .map_err(|err| BridgeError::Transport(std::io::Error::other(err)))?;
            let factory = ComPtr::from_raw(get_factory() as *mut IPluginFactory)
                .ok_or(BridgeError::Protocol("module exported no class factory"))?;

            info!("loaded plugin module {}", path.display());
            Ok(Vst3Module {
                factory: Some(factory),
                library,
                messages: Arc::new(MessageTable::default()),
            })
        }
    }

    unsafe fn create_object(&self, cid: &Cid) -> Option<ComPtr<FUnknown>> {
        let factory = self.factory.as_ref()?;
        let tuid = tuid_of(cid);
        let exported = (0..factory.countClasses()).any(|index| {
            let mut info: PClassInfo = std::mem::zeroed();
            factory.getClassInfo(index, &mut info) == kResultOk && tuid_bytes(&info.cid) == cid.0
        });
        if !exported {
            return None;
        }
        let mut obj: *mut c_void = std::ptr::null_mut();
        let result = factory.createInstance(
            tuid.as_ptr() as FIDString,
            &FUnknown::IID as *const _ as FIDString,
            &mut obj,
        );
        if result == kResultOk && !obj.is_null() {
            ComPtr::from_raw(obj as *mut FUnknown)
        } else {
            None
        }
    }
}

impl Drop for Vst3Module {
    fn drop(&mut self) {
        // Release the factory before the module's exit entry runs.
        self.factory = None;
        unsafe {
            if let Ok(exit) = self.library.get::<unsafe extern "system" fn() -> bool>(b"ExitDll")
            {
                exit();
            } else if let Ok(exit) =
                self.library.get::<unsafe extern "system" fn() -> bool>(b"ModuleExit")
            {
                exit();
            }
        }
    }
}

impl Vst3Factory for Vst3Module {
    fn create(&self, cid: &Cid) -> Option<Box<dyn Vst3Plugin>> {
        unsafe {
            let unknown = self.create_object(cid)?;
            let plugin = LoadedVst3Plugin::wrap(unknown, Arc::clone(&self.messages))?;
            Some(Box::new(plugin))
        }
    }
}

/// One created plugin object, driven through its probed interfaces.
pub struct LoadedVst3Plugin {
    // Keeps the object's base reference while interface pointers live.
    _unknown: ComPtr<FUnknown>,
    component: Option<ComPtr<IComponent>>,
    controller: Option<ComPtr<IEditController>>,
    processor: Option<ComPtr<IAudioProcessor>>,
    connection: Option<ComPtr<IConnectionPoint>>,
    units: Option<ComPtr<IUnitInfo>>,
    program_data: Option<ComPtr<IProgramListData>>,
    view: Option<ComPtr<IPlugView>>,
    messages: Arc<MessageTable>,
    // Host-owned collaborators the plugin holds raw pointers into;
    // stored only to keep their references alive.
    _host: Option<ComPtr<IHostApplication>>,
    _handler: Option<ComPtr<IComponentHandler>>,
    peer: Option<ComPtr<IConnectionPoint>>,
    _frame: Option<ComPtr<IPlugFrame>>,
}

// Calls are serialised by the object table's per-instance mutex.
unsafe impl Send for LoadedVst3Plugin {}

impl LoadedVst3Plugin {
    unsafe fn wrap(
        unknown: ComPtr<FUnknown>,
        messages: Arc<MessageTable>,
    ) -> Option<LoadedVst3Plugin> {
        let raw = unknown.as_ptr();
        let component = probe_interface::<IComponent>(raw);
        let controller = probe_interface::<IEditController>(raw);
        if component.is_none() && controller.is_none() {
            warn!("created object implements neither half of the plugin");
            return None;
        }
        Some(LoadedVst3Plugin {
            component,
            controller,
            processor: probe_interface::<IAudioProcessor>(raw),
            connection: probe_interface::<IConnectionPoint>(raw),
            units: probe_interface::<IUnitInfo>(raw),
            program_data: probe_interface::<IProgramListData>(raw),
            view: None,
            messages,
            _host: None,
            _handler: None,
            peer: None,
            _frame: None,
            _unknown: unknown,
        })
    }

    fn media_type(media_type: super::messages::MediaType) -> MediaType {
        match media_type {
            super::messages::MediaType::Audio => MediaTypes_::kAudio as MediaType,
            super::messages::MediaType::Event => MediaTypes_::kEvent as MediaType,
        }
    }

    fn direction(direction: super::messages::BusDirection) -> BusDirection {
        match direction {
            super::messages::BusDirection::Input => BusDirections_::kInput as BusDirection,
            super::messages::BusDirection::Output => BusDirections_::kOutput as BusDirection,
        }
    }
}

impl Vst3Plugin for LoadedVst3Plugin {
    fn capabilities(&self) -> InterfaceFlags {
        let mut flags = InterfaceFlags::empty();
        if self.component.is_some() {
            flags |= InterfaceFlags::COMPONENT;
        }
        if self.processor.is_some() {
            flags |= InterfaceFlags::AUDIO_PROCESSOR;
        }
        if self.controller.is_some() {
            flags |= InterfaceFlags::EDIT_CONTROLLER | InterfaceFlags::EDITOR;
        }
        if self.connection.is_some() {
            flags |= InterfaceFlags::CONNECTION_POINT;
        }
        if self.units.is_some() {
            flags |= InterfaceFlags::UNIT_INFO;
        }
        if self.program_data.is_some() {
            flags |= InterfaceFlags::PROGRAM_LIST_DATA;
        }
        flags
    }

    fn initialize(&mut self, context: Option<Arc<dyn HostContextHandle>>) -> i32 {
        let host =
            ComWrapper::new(HostShim { context, messages: Arc::clone(&self.messages) })
                .to_com_ptr::<IHostApplication>()
                .expect("BUG: IHostApplication is declared on HostShim");
        let context_ptr = host.as_ptr() as *mut FUnknown;
        self._host = Some(host);
        unsafe {
            if let Some(component) = &self.component {
                let result = component.initialize(context_ptr);
                if result != kResultOk {
                    return result;
                }
            }
            // A combined object is initialised once through its component
            // half; a separate controller class has only the one half.
            if self.component.is_none() {
                if let Some(controller) = &self.controller {
                    return controller.initialize(context_ptr);
                }
            }
        }
        kResultOk
    }

    fn terminate(&mut self) -> i32 {
        self.view = None;
        self._frame = None;
        unsafe {
            if let Some(component) = &self.component {
                return component.terminate();
            }
            if let Some(controller) = &self.controller {
                return controller.terminate();
            }
        }
        kResultOk
    }

    fn set_component_handler(&mut self, handler: Option<Arc<dyn ComponentHandlerSink>>) -> i32 {
        let controller = match &self.controller {
            Some(controller) => controller,
            None => return kNotImplemented,
        };
        match handler {
            Some(sink) => {
                let shim = ComWrapper::new(HandlerShim { sink })
                    .to_com_ptr::<IComponentHandler>()
                    .expect("BUG: IComponentHandler is declared on HandlerShim");
                let result = unsafe { controller.setComponentHandler(shim.as_ptr()) };
                self._handler = Some(shim);
                result
            }
            None => {
                let result = unsafe { controller.setComponentHandler(std::ptr::null_mut()) };
                self._handler = None;
                result
            }
        }
    }

    fn connect(&mut self, peer: Arc<dyn MessageSink>) -> i32 {
        let connection = match &self.connection {
            Some(connection) => connection,
            None => return kNotImplemented,
        };
        let shim = ComWrapper::new(ConnectionShim {
            sink: peer,
            messages: Arc::clone(&self.messages),
        })
        .to_com_ptr::<IConnectionPoint>()
        .expect("BUG: IConnectionPoint is declared on ConnectionShim");
        let result = unsafe { connection.connect(shim.as_ptr()) };
        self.peer = Some(shim);
        result
    }

    fn disconnect(&mut self) -> i32 {
        let connection = match &self.connection {
            Some(connection) => connection,
            None => return kNotImplemented,
        };
        let result = match &self.peer {
            Some(peer) => unsafe { connection.disconnect(peer.as_ptr()) },
            None => kResultOk,
        };
        self.peer = None;
        result
    }

    fn notify(&mut self, message: &AttributeMessage) -> i32 {
        let connection = match &self.connection {
            Some(connection) => connection,
            None => return kNotImplemented,
        };
        let (com, _data) = new_message(message.clone(), None);
        unsafe { connection.notify(com.as_ptr()) }
    }

    fn get_state(&mut self, scope: StateScope) -> Option<Vec<u8>> {
        let (com, data) = new_stream(&[]);
        let result = unsafe {
            match scope {
                StateScope::Component => self
                    .component
                    .as_ref()
                    .map_or(kNotImplemented, |component| component.getState(com.as_ptr())),
                StateScope::Controller => self
                    .controller
                    .as_ref()
                    .map_or(kNotImplemented, |controller| controller.getState(com.as_ptr())),
            }
        };
        (result == kResultOk).then(|| stream_bytes(&data))
    }

    fn set_state(&mut self, scope: StateScope, bytes: &[u8]) -> i32 {
        let (com, _data) = new_stream(bytes);
        unsafe {
            match scope {
                StateScope::Component => self
                    .component
                    .as_ref()
                    .map_or(kNotImplemented, |component| component.setState(com.as_ptr())),
                StateScope::Controller => self
                    .controller
                    .as_ref()
                    .map_or(kNotImplemented, |controller| controller.setState(com.as_ptr())),
            }
        }
    }

    fn bus_count(
        &self,
        media_type: super::messages::MediaType,
        direction: super::messages::BusDirection,
    ) -> i32 {
        match &self.component {
            Some(component) => unsafe {
                component.getBusCount(Self::media_type(media_type), Self::direction(direction))
            },
            None => 0,
        }
    }

    fn bus_info(
        &self,
        media_type: super::messages::MediaType,
        direction: super::messages::BusDirection,
        index: i32,
    ) -> Option<BusInfoData> {
        let component = self.component.as_ref()?;
        unsafe {
            let mut info: BusInfo = std::mem::zeroed();
            let result = component.getBusInfo(
                Self::media_type(media_type),
                Self::direction(direction),
                index,
                &mut info,
            );
            (result == kResultOk).then(|| BusInfoData {
                name: read_wstring(info.name.as_ptr(), info.name.len()),
                channel_count: info.channelCount,
                bus_type: info.busType,
                flags: info.flags,
            })
        }
    }

    fn activate_bus(
        &mut self,
        media_type: super::messages::MediaType,
        direction: super::messages::BusDirection,
        index: i32,
        active: bool,
    ) -> i32 {
        match &self.component {
            Some(component) => unsafe {
                component.activateBus(
                    Self::media_type(media_type),
                    Self::direction(direction),
                    index,
                    u8::from(active),
                )
            },
            None => kNotImplemented,
        }
    }

    fn setup_processing(&mut self, setup: &super::messages::ProcessSetup) -> i32 {
        let processor = match &self.processor {
            Some(processor) => processor,
            None => return kNotImplemented,
        };
        let mut raw: ProcessSetup = unsafe { std::mem::zeroed() };
        raw.processMode = setup.process_mode;
        raw.symbolicSampleSize = setup.symbolic_sample_size;
        raw.maxSamplesPerBlock = setup.max_samples_per_block;
        raw.sampleRate = setup.sample_rate;
        unsafe { processor.setupProcessing(&mut raw) }
    }

    fn set_processing(&mut self, active: bool) -> i32 {
        match &self.processor {
            Some(processor) => unsafe { processor.setProcessing(u8::from(active)) },
            None => kNotImplemented,
        }
    }

    fn set_active(&mut self, active: bool) -> i32 {
        match &self.component {
            Some(component) => unsafe { component.setActive(u8::from(active)) },
            None => kNotImplemented,
        }
    }

    fn process(
        &mut self,
        shm: &mut AudioShmBuffer,
        data: &super::messages::ProcessData,
    ) -> ProcessOutput {
        let processor = match &self.processor {
            Some(processor) => processor,
            None => return ProcessOutput { result: kNotImplemented, ..Default::default() },
        };
        let frames = data.num_samples.max(0) as usize;
        let config = shm.config().clone();
        let double_precision = data.double_precision;

        // Per-bus channel pointer tables into the shared buffer runs.
        // They must outlive the process call itself.
        let mut input_channels: Vec<Vec<*mut c_void>> = Vec::with_capacity(config.inputs.len());
        for (bus, &count) in config.inputs.iter().enumerate() {
            let mut channels = Vec::with_capacity(count as usize);
            for channel in 0..count as usize {
                channels.push(if double_precision {
                    shm.input_f64_mut(bus, channel, frames).as_mut_ptr() as *mut c_void
                } else {
                    shm.input_f32_mut(bus, channel, frames).as_mut_ptr() as *mut c_void
                });
            }
            input_channels.push(channels);
        }
        let mut output_channels: Vec<Vec<*mut c_void>> =
            Vec::with_capacity(config.outputs.len());
        for (bus, &count) in config.outputs.iter().enumerate() {
            let mut channels = Vec::with_capacity(count as usize);
            for channel in 0..count as usize {
                channels.push(if double_precision {
                    shm.output_f64_mut(bus, channel, frames).as_mut_ptr() as *mut c_void
                } else {
                    shm.output_f32_mut(bus, channel, frames).as_mut_ptr() as *mut c_void
                });
            }
            output_channels.push(channels);
        }

        let bus_buffers = |tables: &mut [Vec<*mut c_void>]| -> Vec<AudioBusBuffers> {
            tables
                .iter_mut()
                .map(|channels| {
                    let mut bus: AudioBusBuffers = unsafe { std::mem::zeroed() };
                    bus.numChannels = channels.len() as i32;
                    bus.silenceFlags = 0;
                    if double_precision {
                        bus.__field0.channelBuffers64 = channels.as_mut_ptr() as *mut *mut f64;
                    } else {
                        bus.__field0.channelBuffers32 = channels.as_mut_ptr() as *mut *mut f32;
                    }
                    bus
                })
                .collect()
        };
        let mut inputs = bus_buffers(&mut input_channels);
        let mut outputs = bus_buffers(&mut output_channels);

        let (in_changes, _in_queues) = new_param_changes(&data.param_changes);
        let (out_changes, out_queues) = new_param_changes(&[]);
        let (in_events, _in_event_data) = new_event_list(&data.events);
        let (out_events, out_event_data) = new_event_list(&[]);
        let mut context = data.transport.as_ref().map(raw_process_context);

        let result = unsafe {
            let mut raw: ProcessData = std::mem::zeroed();
            raw.processMode = data.process_mode;
            raw.symbolicSampleSize = if double_precision {
                SymbolicSampleSizes_::kSample64 as i32
            } else {
                SymbolicSampleSizes_::kSample32 as i32
            };
            raw.numSamples = data.num_samples;
            raw.numInputs = inputs.len() as i32;
            raw.numOutputs = outputs.len() as i32;
            raw.inputs = inputs.as_mut_ptr();
            raw.outputs = outputs.as_mut_ptr();
            raw.inputParameterChanges = in_changes.as_ptr();
            raw.outputParameterChanges = out_changes.as_ptr();
            raw.inputEvents = in_events.as_ptr();
            raw.outputEvents = out_events.as_ptr();
            raw.processContext = context
                .as_mut()
                .map_or(std::ptr::null_mut(), |context| context as *mut ProcessContext);
            processor.process(&mut raw)
        };

        ProcessOutput {
            result,
            output_params: collect_queues(&out_queues),
            output_events: out_event_data.collect(),
            silence_flags: outputs.iter().map(|bus| bus.silenceFlags).collect(),
        }
    }

    fn parameter_count(&self) -> i32 {
        match &self.controller {
            Some(controller) => unsafe { controller.getParameterCount() },
            None => 0,
        }
    }

    fn parameter_info(&self, index: i32) -> Option<ParameterInfoData> {
        let controller = self.controller.as_ref()?;
        unsafe {
            let mut info: ParameterInfo = std::mem::zeroed();
            let result = controller.getParameterInfo(index, &mut info);
            (result == kResultOk).then(|| ParameterInfoData {
                param_id: info.id,
                title: read_wstring(info.title.as_ptr(), info.title.len()),
                units: read_wstring(info.units.as_ptr(), info.units.len()),
                step_count: info.stepCount,
                default_normalized: info.defaultNormalizedValue,
                unit_id: info.unitId,
                flags: info.flags,
            })
        }
    }

    fn param_normalized(&self, param_id: u32) -> f64 {
        match &self.controller {
            Some(controller) => unsafe { controller.getParamNormalized(param_id) },
            None => 0.0,
        }
    }

    fn set_param_normalized(&mut self, param_id: u32, value: f64) -> i32 {
        match &self.controller {
            Some(controller) => unsafe { controller.setParamNormalized(param_id, value) },
            None => kNotImplemented,
        }
    }

    fn param_string_by_value(&self, param_id: u32, value: f64) -> Option<String> {
        let controller = self.controller.as_ref()?;
        unsafe {
            let mut buffer: [TChar; 128] = [0; 128];
            let result =
                controller.getParamStringByValue(param_id, value, buffer.as_mut_ptr() as *mut _);
            (result == kResultOk).then(|| read_wstring(buffer.as_ptr(), buffer.len()))
        }
    }

    fn unit_count(&self) -> i32 {
        match &self.units {
            Some(units) => unsafe { units.getUnitCount() },
            None => 0,
        }
    }

    fn unit_info(&self, index: i32) -> Option<UnitInfoData> {
        let units = self.units.as_ref()?;
        unsafe {
            let mut info: UnitInfo = std::mem::zeroed();
            let result = units.getUnitInfo(index, &mut info);
            (result == kResultOk).then(|| UnitInfoData {
                unit_id: info.id,
                parent_unit_id: info.parentUnitId,
                name: read_wstring(info.name.as_ptr(), info.name.len()),
                program_list_id: info.programListId,
            })
        }
    }

    fn program_list_count(&self) -> i32 {
        match &self.units {
            Some(units) => unsafe { units.getProgramListCount() },
            None => 0,
        }
    }

    fn program_list_info(&self, index: i32) -> Option<ProgramListInfoData> {
        let units = self.units.as_ref()?;
        unsafe {
            let mut info: ProgramListInfo = std::mem::zeroed();
            let result = units.getProgramListInfo(index, &mut info);
            (result == kResultOk).then(|| ProgramListInfoData {
                list_id: info.id,
                name: read_wstring(info.name.as_ptr(), info.name.len()),
                program_count: info.programCount,
            })
        }
    }

    fn program_data(&mut self, list_id: i32, program_index: i32) -> Option<Vec<u8>> {
        let program_data = self.program_data.as_ref()?;
        let (com, data) = new_stream(&[]);
        let result =
            unsafe { program_data.getProgramData(list_id, program_index, com.as_ptr()) };
        (result == kResultOk).then(|| stream_bytes(&data))
    }

    fn set_program_data(&mut self, list_id: i32, program_index: i32, bytes: &[u8]) -> i32 {
        let program_data = match &self.program_data {
            Some(program_data) => program_data,
            None => return kNotImplemented,
        };
        let (com, _data) = new_stream(bytes);
        unsafe { program_data.setProgramData(list_id, program_index, com.as_ptr()) }
    }

    fn create_view(&mut self) -> bool {
        let controller = match &self.controller {
            Some(controller) => controller,
            None => return false,
        };
        let view = unsafe { controller.createView(b"editor\0".as_ptr() as FIDString) };
        match unsafe { ComPtr::from_raw(view) } {
            Some(view) => {
                self.view = Some(view);
                true
            }
            None => false,
        }
    }

    fn set_frame(&mut self, frame: Option<Arc<dyn FrameSink>>) -> i32 {
        let view = match &self.view {
            Some(view) => view,
            None => return kNotImplemented,
        };
        match frame {
            Some(sink) => {
                let shim = ComWrapper::new(FrameShim { sink })
                    .to_com_ptr::<IPlugFrame>()
                    .expect("BUG: IPlugFrame is declared on FrameShim");
                let result = unsafe { view.setFrame(shim.as_ptr()) };
                self._frame = Some(shim);
                result
            }
            None => {
                let result = unsafe { view.setFrame(std::ptr::null_mut()) };
                self._frame = None;
                result
            }
        }
    }

    fn view_size(&self) -> Option<ViewRect> {
        let view = self.view.as_ref()?;
        unsafe {
            let mut rect: vst3::Steinberg::ViewRect = std::mem::zeroed();
            let result = view.getSize(&mut rect);
            (result == kResultOk).then(|| ViewRect {
                left: rect.left,
                top: rect.top,
                right: rect.right,
                bottom: rect.bottom,
            })
        }
    }

    fn attach_view(&mut self, parent: u64) -> i32 {
        match &self.view {
            Some(view) => unsafe {
                view.attached(parent as *mut c_void, b"HWND\0".as_ptr() as FIDString)
            },
            None => kNotImplemented,
        }
    }

    fn remove_view(&mut self) -> i32 {
        let result = match &self.view {
            Some(view) => unsafe { view.removed() },
            None => kNotImplemented,
        };
        self.view = None;
        result
    }

    fn on_view_size(&mut self, rect: ViewRect) -> i32 {
        match &self.view {
            Some(view) => unsafe {
                let mut raw = vst3::Steinberg::ViewRect {
                    left: rect.left,
                    top: rect.top,
                    right: rect.right,
                    bottom: rect.bottom,
                };
                view.onSize(&mut raw)
            },
            None => kNotImplemented,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_flavour_follows_the_extension() {
        assert!(is_vst3_module(Path::new("/plugins/Diva.vst3")));
        assert!(is_vst3_module(Path::new("synth.VST3")));
        assert!(!is_vst3_module(Path::new("/plugins/Diva.dll")));
        assert!(!is_vst3_module(Path::new("effect.so")));
        assert!(!is_vst3_module(Path::new("noext")));
    }

    #[test]
    fn cid_survives_the_tuid_round_trip() {
        let cid = Cid([0xde, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 0xff]);
        assert_eq!(tuid_bytes(&tuid_of(&cid)), cid.0);
    }

    #[test]
    fn stream_shim_reads_back_what_was_written() {
        let data: StreamData = Arc::new(Mutex::new((Vec::new(), 0)));
        let shim = StreamShim { data: Arc::clone(&data) };
        unsafe {
            let payload = [0xdeu8, 0xad, 0xbe, 0xef];
            let mut written = 0;
            assert_eq!(
                shim.write(payload.as_ptr() as *mut c_void, payload.len() as i32, &mut written),
                kResultOk
            );
            assert_eq!(written, 4);

            let mut seeked = 0;
            assert_eq!(shim.seek(0, 0, &mut seeked), kResultOk);
            assert_eq!(seeked, 0);

            let mut buffer = [0u8; 8];
            let mut read = 0;
            assert_eq!(
                shim.read(buffer.as_mut_ptr() as *mut c_void, buffer.len() as i32, &mut read),
                kResultOk
            );
            assert_eq!(read, 4);
            assert_eq!(&buffer[..4], &payload);
        }
        assert_eq!(stream_bytes(&data), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn event_lists_round_trip_owned_events() {
        let events = vec![
            super::super::messages::Event {
                bus_index: 0,
                sample_offset: 12,
                data: EventData::NoteOn {
                    channel: 0,
                    pitch: 60,
                    velocity: 0.5,
                    tuning: 0.0,
                    note_id: -1,
                    length: 0,
                },
            },
            super::super::messages::Event {
                bus_index: 0,
                sample_offset: 30,
                data: EventData::Data { bytes: vec![0xf0, 0x7e, 0xf7] },
            },
        ];
        let data = EventListData::default();
        data.fill(&events);
        assert_eq!(data.collect(), events);
    }

    #[test]
    fn message_table_only_resolves_our_messages() {
        let table = MessageTable::default();
        let mut message = AttributeMessage::new("midi_learn");
        message.set("cc", AttributeValue::Int(74));
        let (com, _data) = new_message(message.clone(), Some(&table));
        assert_eq!(table.resolve(com.as_ptr() as usize), Some(message));
        assert_eq!(table.resolve(0xdead_beef), None);
    }
}
