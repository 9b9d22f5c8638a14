//! End-to-end tests of the modern bridge: proxies on the native side, a
//! fake plugin module behind the real channels on the other.

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use winebridge::shmem::AudioShmBuffer;
use winebridge::transport::SocketGroup;
use winebridge::vst3::host::{
    ComponentHandlerSink, FrameSink, HostContextHandle, MessageSink, ProcessOutput, Vst3Factory,
    Vst3HostProcess, Vst3Plugin,
};
use winebridge::vst3::messages::{
    tresult, AttributeMessage, AttributeValue, BusDirection, BusInfoData, Cid, InterfaceFlags,
    MediaType, ParameterInfoData, ProcessData, ProcessSetup, ProgramListInfoData, StateScope,
    UnitInfoData, ViewRect,
};
use winebridge::vst3::proxy::{ComponentHandler, ConnectionPoint, HostContext, PlugFrame};
use winebridge::vst3::bridge::Vst3Bridge;
use winebridge::BridgeConfig;

/// Shared observable state of one fake plugin object.
#[derive(Default)]
struct FakeShared {
    state: Mutex<Vec<u8>>,
    notify_log: Mutex<Vec<AttributeMessage>>,
    handler: Mutex<Option<Arc<dyn ComponentHandlerSink>>>,
    peer: Mutex<Option<Arc<dyn MessageSink>>>,
    frame: Mutex<Option<Arc<dyn FrameSink>>>,
    context: Mutex<Option<Arc<dyn HostContextHandle>>>,
    parameter: Mutex<f64>,
}

struct FakePlugin {
    shared: Arc<FakeShared>,
}

impl Vst3Plugin for FakePlugin {
    fn capabilities(&self) -> InterfaceFlags {
        InterfaceFlags::COMPONENT
            | InterfaceFlags::AUDIO_PROCESSOR
            | InterfaceFlags::EDIT_CONTROLLER
            | InterfaceFlags::CONNECTION_POINT
            | InterfaceFlags::EDITOR
    }

    fn initialize(&mut self, context: Option<Arc<dyn HostContextHandle>>) -> i32 {
        *self.shared.context.lock().unwrap() = context;
        tresult::OK
    }

    fn terminate(&mut self) -> i32 {
        tresult::OK
    }

    fn set_component_handler(&mut self, handler: Option<Arc<dyn ComponentHandlerSink>>) -> i32 {
        *self.shared.handler.lock().unwrap() = handler;
        tresult::OK
    }

    fn connect(&mut self, peer: Arc<dyn MessageSink>) -> i32 {
        *self.shared.peer.lock().unwrap() = Some(peer);
        tresult::OK
    }

    fn disconnect(&mut self) -> i32 {
        *self.shared.peer.lock().unwrap() = None;
        tresult::OK
    }

    fn notify(&mut self, message: &AttributeMessage) -> i32 {
        self.shared.notify_log.lock().unwrap().push(message.clone());
        tresult::OK
    }

    fn get_state(&mut self, _scope: StateScope) -> Option<Vec<u8>> {
        Some(self.shared.state.lock().unwrap().clone())
    }

    fn set_state(&mut self, _scope: StateScope, data: &[u8]) -> i32 {
        *self.shared.state.lock().unwrap() = data.to_vec();
        tresult::OK
    }

    fn bus_count(&self, media_type: MediaType, _direction: BusDirection) -> i32 {
        match media_type {
            MediaType::Audio => 1,
            MediaType::Event => 0,
        }
    }

    fn bus_info(
        &self,
        media_type: MediaType,
        direction: BusDirection,
        index: i32,
    ) -> Option<BusInfoData> {
        (media_type == MediaType::Audio && index == 0).then(|| BusInfoData {
            name: match direction {
                BusDirection::Input => "Stereo In".into(),
                BusDirection::Output => "Stereo Out".into(),
            },
            channel_count: 2,
            bus_type: 0,
            flags: 1,
        })
    }

    fn activate_bus(
        &mut self,
        _media_type: MediaType,
        _direction: BusDirection,
        _index: i32,
        _active: bool,
    ) -> i32 {
        tresult::OK
    }

    fn setup_processing(&mut self, _setup: &ProcessSetup) -> i32 {
        tresult::OK
    }

    fn set_processing(&mut self, _active: bool) -> i32 {
        tresult::OK
    }

    fn set_active(&mut self, _active: bool) -> i32 {
        tresult::OK
    }

    fn process(&mut self, shm: &mut AudioShmBuffer, data: &ProcessData) -> ProcessOutput {
        let frames = data.num_samples.max(0) as usize;
        for channel in 0..2 {
            let input: Vec<f32> = shm.input_f32(0, channel, frames).to_vec();
            shm.output_f32_mut(0, channel, frames).copy_from_slice(&input);
        }
        ProcessOutput {
            result: tresult::OK,
            silence_flags: vec![0],
            ..Default::default()
        }
    }

    fn parameter_count(&self) -> i32 {
        1
    }

    fn parameter_info(&self, index: i32) -> Option<ParameterInfoData> {
        (index == 0).then(|| ParameterInfoData {
            param_id: 100,
            title: "Gain".into(),
            units: "dB".into(),
            step_count: 0,
            default_normalized: 0.5,
            unit_id: 0,
            flags: 1,
        })
    }

    fn param_normalized(&self, _param_id: u32) -> f64 {
        *self.shared.parameter.lock().unwrap()
    }

    fn set_param_normalized(&mut self, _param_id: u32, value: f64) -> i32 {
        *self.shared.parameter.lock().unwrap() = value;
        tresult::OK
    }

    fn param_string_by_value(&self, _param_id: u32, value: f64) -> Option<String> {
        Some(format!("{:.2}", value))
    }

    fn unit_count(&self) -> i32 {
        1
    }

    fn unit_info(&self, index: i32) -> Option<UnitInfoData> {
        (index == 0).then(|| UnitInfoData {
            unit_id: 0,
            parent_unit_id: -1,
            name: "Root".into(),
            program_list_id: -1,
        })
    }

    fn program_list_count(&self) -> i32 {
        0
    }

    fn program_list_info(&self, _index: i32) -> Option<ProgramListInfoData> {
        None
    }

    fn program_data(&mut self, _list_id: i32, _program_index: i32) -> Option<Vec<u8>> {
        None
    }

    fn set_program_data(&mut self, _list_id: i32, _program_index: i32, _data: &[u8]) -> i32 {
        tresult::NOT_IMPLEMENTED
    }

    fn create_view(&mut self) -> bool {
        true
    }

    fn set_frame(&mut self, frame: Option<Arc<dyn FrameSink>>) -> i32 {
        *self.shared.frame.lock().unwrap() = frame;
        tresult::OK
    }

    fn view_size(&self) -> Option<ViewRect> {
        Some(ViewRect { left: 0, top: 0, right: 800, bottom: 600 })
    }

    fn attach_view(&mut self, _parent: u64) -> i32 {
        tresult::OK
    }

    fn remove_view(&mut self) -> i32 {
        tresult::OK
    }

    fn on_view_size(&mut self, _rect: ViewRect) -> i32 {
        tresult::OK
    }
}

#[derive(Default)]
struct FakeFactory {
    created: Mutex<Vec<Arc<FakeShared>>>,
}

impl Vst3Factory for FakeFactory {
    fn create(&self, cid: &Cid) -> Option<Box<dyn Vst3Plugin>> {
        if *cid == Cid([0xff; 16]) {
            return None;
        }
        let shared = Arc::new(FakeShared::default());
        self.created.lock().unwrap().push(Arc::clone(&shared));
        Some(Box::new(FakePlugin { shared }))
    }
}

struct Harness {
    bridge: Arc<Vst3Bridge>,
    factory: Arc<FakeFactory>,
    context: Arc<winebridge::vst3::host::Vst3HostContext>,
    server: Option<std::thread::JoinHandle<()>>,
}

impl Harness {
    fn new() -> Harness {
        let factory = Arc::new(FakeFactory::default());
        let serving_factory = Arc::clone(&factory);
        let (dir_tx, dir_rx) = std::sync::mpsc::channel();
        let (context_tx, context_rx) = std::sync::mpsc::channel();

        let server = std::thread::spawn(move || {
            let dir: std::path::PathBuf = dir_rx.recv().unwrap();
            let group = SocketGroup::adopt(dir);
            let process = Vst3HostProcess::connect(&group, serving_factory).unwrap();
            context_tx.send(process.context()).unwrap();
            process.run().unwrap();
        });

        let bridge = Vst3Bridge::with_launcher(BridgeConfig::default(), move |group| {
            dir_tx.send(group.dir().to_path_buf()).unwrap();
            Ok(None)
        })
        .unwrap();
        let context = context_rx.recv().unwrap();

        Harness { bridge, factory, context, server: Some(server) }
    }

    fn shared(&self, index: usize) -> Arc<FakeShared> {
        Arc::clone(&self.factory.created.lock().unwrap()[index])
    }
}

/// Drop the native side, then reap the serving thread; closing the last
/// bridge handle is what ends its loops.
fn finish(mut harness: Harness) {
    let server = harness.server.take();
    drop(harness);
    if let Some(server) = server {
        server.join().unwrap();
    }
}

#[derive(Default)]
struct RecordingHandler {
    edits: Mutex<Vec<(u32, f64)>>,
    restarts: Mutex<Vec<i32>>,
}

impl ComponentHandler for RecordingHandler {
    fn begin_edit(&self, _param_id: u32) -> i32 {
        tresult::OK
    }

    fn perform_edit(&self, param_id: u32, value: f64) -> i32 {
        self.edits.lock().unwrap().push((param_id, value));
        tresult::OK
    }

    fn end_edit(&self, _param_id: u32) -> i32 {
        tresult::OK
    }

    fn restart_component(&self, flags: i32) -> i32 {
        self.restarts.lock().unwrap().push(flags);
        tresult::OK
    }
}

struct RecordingFrame {
    resizes: Mutex<Vec<ViewRect>>,
}

impl PlugFrame for RecordingFrame {
    fn resize_view(&self, rect: ViewRect) -> i32 {
        self.resizes.lock().unwrap().push(rect);
        tresult::OK
    }
}

struct NamedContext;

impl HostContext for NamedContext {
    fn name(&self) -> String {
        "winebridge tests".to_string()
    }
}

#[test]
fn capabilities_come_from_the_probe() {
    let harness = Harness::new();
    let proxy = harness.bridge.create_instance(Cid([1; 16])).unwrap();
    assert!(proxy.implements(InterfaceFlags::AUDIO_PROCESSOR));
    assert!(proxy.implements(InterfaceFlags::CONNECTION_POINT));
    assert!(!proxy.implements(InterfaceFlags::UNIT_INFO));

    // A class the module does not export yields no proxy.
    assert!(harness.bridge.create_instance(Cid([0xff; 16])).is_err());

    drop(proxy);
    finish(harness);
}

#[test]
fn instance_registrations_balance_on_both_sides() {
    let harness = Harness::new();
    {
        let proxies: Vec<_> = (0..4)
            .map(|i| harness.bridge.create_instance(Cid([i; 16])).unwrap())
            .collect();
        assert_eq!(harness.context.live_instances(), 4);
        assert_eq!(harness.bridge.proxies().len(), 4);
        drop(proxies);
    }
    assert_eq!(harness.context.live_instances(), 0);
    assert!(harness.bridge.proxies().is_empty());
    finish(harness);
}

#[test]
fn state_streams_round_trip_as_bytes() {
    let harness = Harness::new();
    let proxy = harness.bridge.create_instance(Cid([2; 16])).unwrap();

    let saved = vec![0xde, 0xad, 0xbe, 0xef, 0x01];
    let mut upload = Cursor::new(saved.clone());
    assert_eq!(proxy.set_state(StateScope::Component, &mut upload), tresult::OK);
    assert_eq!(*harness.shared(0).state.lock().unwrap(), saved);

    let mut download = Vec::new();
    assert_eq!(proxy.get_state(StateScope::Component, &mut download), tresult::OK);
    assert_eq!(download, saved);

    drop(proxy);
    finish(harness);
}

#[test]
fn connecting_two_proxies_stays_on_the_foreign_side() {
    let harness = Harness::new();
    let a = harness.bridge.create_instance(Cid([3; 16])).unwrap();
    let b = harness.bridge.create_instance(Cid([4; 16])).unwrap();

    let b_endpoint: Arc<dyn ConnectionPoint> = b.clone();
    assert_eq!(a.connect(&b_endpoint), tresult::OK);

    // The fake behind `a` got a direct peer endpoint; a message it sends
    // lands in `b` without ever crossing back to the native side.
    let mut message = AttributeMessage::new("midi_learn");
    message.set("cc", AttributeValue::Int(74));
    let sink = harness.shared(0).peer.lock().unwrap().clone().unwrap();
    assert_eq!(sink.notify(&message), tresult::OK);
    assert_eq!(*harness.shared(1).notify_log.lock().unwrap(), vec![message]);

    drop((a, b, b_endpoint));
    finish(harness);
}

#[test]
fn component_handler_and_frame_callbacks_reach_the_host_objects() {
    let harness = Harness::new();
    let proxy = harness.bridge.create_instance(Cid([5; 16])).unwrap();

    assert_eq!(proxy.initialize(Some(Arc::new(NamedContext))), tresult::OK);
    let handler = Arc::new(RecordingHandler::default());
    assert_eq!(proxy.set_component_handler(Some(handler.clone())), tresult::OK);

    // The plugin automates a parameter: the proxy handler on the foreign
    // side forwards to the host's object, addressed by instance id.
    let sink = harness.shared(0).handler.lock().unwrap().clone().unwrap();
    assert_eq!(sink.perform_edit(100, 0.75), tresult::OK);
    assert_eq!(*handler.edits.lock().unwrap(), vec![(100, 0.75)]);

    // The host context is reachable the same way.
    let context = harness.shared(0).context.lock().unwrap().clone().unwrap();
    assert_eq!(context.name(), "winebridge tests");

    // Editor resize requests route to the most recently created view.
    let view = proxy.create_view().unwrap();
    assert_eq!(view.size(), ViewRect { left: 0, top: 0, right: 800, bottom: 600 });
    let frame = Arc::new(RecordingFrame { resizes: Mutex::new(Vec::new()) });
    view.set_frame(Some(frame.clone()));
    let frame_sink = harness.shared(0).frame.lock().unwrap().clone().unwrap();
    let rect = ViewRect { left: 0, top: 0, right: 1024, bottom: 768 };
    assert_eq!(frame_sink.resize_view(rect), tresult::OK);
    assert_eq!(*frame.resizes.lock().unwrap(), vec![rect]);

    // Component restarts are thunked onto the idle queue and only reach
    // the host's handler once the stub drains it.
    assert_eq!(sink.restart_component(1), tresult::OK);
    assert!(handler.restarts.lock().unwrap().is_empty());
    harness.bridge.on_idle();
    assert_eq!(*handler.restarts.lock().unwrap(), vec![1]);

    drop(view);
    drop(proxy);
    finish(harness);
}

#[test]
fn audio_blocks_pass_through_the_shared_buffer() {
    let harness = Harness::new();
    let proxy = harness.bridge.create_instance(Cid([6; 16])).unwrap();

    let setup = ProcessSetup {
        process_mode: 0,
        symbolic_sample_size: 0,
        max_samples_per_block: 128,
        sample_rate: 48_000.0,
    };
    assert_eq!(proxy.setup_processing(setup), tresult::OK);
    assert_eq!(proxy.set_active(true), tresult::OK);
    assert_eq!(proxy.set_processing(true), tresult::OK);

    let left_in = vec![0.25f32; 64];
    let right_in = vec![-0.25f32; 64];
    let mut left_out = vec![0.0f32; 64];
    let mut right_out = vec![0.0f32; 64];
    let data = ProcessData {
        num_samples: 64,
        process_mode: 0,
        double_precision: false,
        param_changes: Vec::new(),
        events: Vec::new(),
        transport: None,
    };
    let inputs: Vec<&[f32]> = vec![&left_in, &right_in];
    let mut outputs: Vec<&mut [f32]> = vec![&mut left_out, &mut right_out];
    let response = proxy.process_f32(data, &inputs, &mut outputs).unwrap();

    assert_eq!(response.result, tresult::OK);
    assert_eq!(response.silence_flags, vec![0]);
    assert!(left_out.iter().all(|&s| s == 0.25));
    assert!(right_out.iter().all(|&s| s == -0.25));

    drop(proxy);
    finish(harness);
}

#[test]
fn parameter_and_unit_queries_are_forwarded() {
    let harness = Harness::new();
    let proxy = harness.bridge.create_instance(Cid([7; 16])).unwrap();

    assert_eq!(proxy.parameter_count(), 1);
    let info = proxy.parameter_info(0).unwrap();
    assert_eq!(info.param_id, 100);
    assert_eq!(info.title, "Gain");

    assert_eq!(proxy.set_param_normalized(100, 0.42), tresult::OK);
    assert!((proxy.param_normalized(100) - 0.42).abs() < f64::EPSILON);
    assert_eq!(proxy.param_string_by_value(100, 0.42).unwrap(), "0.42");

    assert_eq!(proxy.unit_count(), 1);
    assert_eq!(proxy.unit_info(0).unwrap().name, "Root");
    assert_eq!(proxy.program_list_count(), 0);

    drop(proxy);
    finish(harness);
}
