//! End-to-end tests of the legacy bridge: the native stub on one side, an
//! in-process stand-in for the foreign host on the other, talking over the
//! real socket group and shared audio buffer.

use std::os::raw::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use winebridge::shmem::AudioShmBuffer;
use winebridge::transport::{connect_group, SocketGroup, HANDSHAKE_TIMEOUT};
use winebridge::vst2::api::{self, OpCode};
use winebridge::vst2::event::{
    DispatchRequest, DispatchResponse, EffectFields, Payload,
};
use winebridge::vst2::host_proxy::Vst2Bridge;
use winebridge::vst2::plugin_host::{EffectTarget, Vst2HostProcess};
use winebridge::BridgeConfig;

/// A pass-through effect with two ins, two outs and recorded state.
#[derive(Default)]
struct FakeEffect {
    parameters: Mutex<Vec<(i32, f32)>>,
    parameter_calls: AtomicUsize,
    chunk: Mutex<Vec<u8>>,
    opened: AtomicUsize,
}

impl FakeEffect {
    fn fields(&self, late_init_done: bool) -> EffectFields {
        EffectFields {
            num_programs: 1,
            // Late initialisation: the parameter count only appears once
            // the plugin has been opened.
            num_params: if late_init_done { 11 } else { 0 },
            num_inputs: 2,
            num_outputs: 2,
            flags: api::flags::Plugin::CAN_REPLACING.bits(),
            initial_delay: 0,
            unique_id: 0x57425631,
            version: 1000,
        }
    }
}

impl EffectTarget for FakeEffect {
    fn effect_fields(&self) -> EffectFields {
        self.fields(self.opened.load(Ordering::SeqCst) > 0)
    }

    fn dispatch(&self, request: DispatchRequest) -> DispatchResponse {
        match OpCode::try_from(request.opcode) {
            Ok(OpCode::Initialize) => {
                self.opened.fetch_add(1, Ordering::SeqCst);
                DispatchResponse {
                    ret: 0,
                    payload: Payload::EffectFields(self.fields(true)),
                    aux: Payload::None,
                }
            }
            Ok(OpCode::GetData) => {
                let chunk = self.chunk.lock().unwrap().clone();
                DispatchResponse {
                    ret: chunk.len() as i64,
                    payload: Payload::Bytes(chunk),
                    aux: Payload::None,
                }
            }
            Ok(OpCode::SetData) => {
                if let Payload::Bytes(bytes) = &request.payload {
                    *self.chunk.lock().unwrap() = bytes.clone();
                }
                DispatchResponse::ret(1)
            }
            Ok(OpCode::StateChanged) => DispatchResponse::ret(1),
            _ => DispatchResponse::ret(0),
        }
    }

    fn get_parameter(&self, index: i32) -> f32 {
        self.parameter_calls.fetch_add(1, Ordering::SeqCst);
        self.parameters
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(i, _)| *i == index)
            .map(|(_, v)| *v)
            .unwrap_or(0.0)
    }

    fn set_parameter(&self, index: i32, value: f32) {
        self.parameter_calls.fetch_add(1, Ordering::SeqCst);
        self.parameters.lock().unwrap().push((index, value));
    }

    fn process_f32(&self, shm: &mut AudioShmBuffer, frames: usize) {
        for channel in 0..2 {
            let input: Vec<f32> = shm.input_f32(0, channel, frames).to_vec();
            shm.output_f32_mut(0, channel, frames).copy_from_slice(&input);
        }
    }

    fn process_f64(&self, shm: &mut AudioShmBuffer, frames: usize) {
        for channel in 0..2 {
            let input: Vec<f64> = shm.input_f64(0, channel, frames).to_vec();
            shm.output_f64_mut(0, channel, frames).copy_from_slice(&input);
        }
    }
}

unsafe extern "C" fn silent_host_callback(
    _effect: *mut api::AEffect,
    opcode: i32,
    _index: i32,
    _value: isize,
    _ptr: *mut c_void,
    _opt: f32,
) -> isize {
    match api::HostOpCode::try_from(opcode) {
        Ok(api::HostOpCode::Version) => api::consts::VST_2_4,
        _ => 0,
    }
}

/// Build a bridge whose "foreign process" is a thread serving the fake
/// effect over the real channels.
fn bridged_fake() -> (Box<Vst2Bridge>, Arc<FakeEffect>, std::thread::JoinHandle<()>) {
    let effect = Arc::new(FakeEffect::default());
    let serving = Arc::clone(&effect);
    let (dir_tx, dir_rx) = std::sync::mpsc::channel();

    let server = std::thread::spawn(move || {
        let dir: std::path::PathBuf = dir_rx.recv().unwrap();
        let group = SocketGroup::adopt(dir);
        let (streams, router) = Vst2HostProcess::connect(&group).unwrap();
        Vst2HostProcess::new(&group, streams, serving, router).run().unwrap();
    });

    let bridge = Vst2Bridge::with_launcher(
        BridgeConfig::default(),
        silent_host_callback,
        move |group| {
            dir_tx.send(group.dir().to_path_buf()).unwrap();
            Ok(None)
        },
    )
    .unwrap();

    (bridge, effect, server)
}

#[test]
fn late_init_fields_reach_the_host_after_open() {
    let (mut bridge, _effect, server) = bridged_fake();
    let effect_ptr = bridge.effect_ptr();

    // Before `Initialize` the plugin reports no parameters.
    unsafe {
        assert_eq!((*effect_ptr).numParams, 0);
        assert_eq!((*effect_ptr).numInputs, 2);
        bridge.dispatch(OpCode::Initialize.into(), 0, 0, std::ptr::null_mut(), 0.0);
        assert_eq!((*effect_ptr).numParams, 11);
    }

    drop(bridge);
    server.join().unwrap();
}

#[test]
fn parameters_round_trip_in_fifo_order() {
    let (bridge, effect, server) = bridged_fake();

    bridge.set_parameter(7, 0.25);
    assert_eq!(bridge.get_parameter(7), 0.25);
    // Exactly the two calls above crossed the parameters channel.
    assert_eq!(effect.parameter_calls.load(Ordering::SeqCst), 2);

    // Interleaved writers still observe request order per channel.
    let bridge = Arc::new(bridge);
    let writers: Vec<_> = (0..4)
        .map(|i| {
            let bridge = Arc::clone(&bridge);
            std::thread::spawn(move || {
                for step in 0..16 {
                    bridge.set_parameter(i, step as f32 / 16.0);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    let writes = effect.parameters.lock().unwrap().clone();
    for i in 0..4 {
        let per_index: Vec<f32> =
            writes.iter().filter(|(index, _)| *index == i).map(|(_, v)| *v).collect();
        let mut sorted = per_index.clone();
        sorted.sort_by(f32::total_cmp);
        assert_eq!(per_index, sorted);
    }

    drop(bridge);
    server.join().unwrap();
}

#[test]
fn audio_block_passes_through_unchanged() {
    let (bridge, _effect, server) = bridged_fake();

    unsafe {
        bridge.dispatch(OpCode::SetBlockSize.into(), 0, 64, std::ptr::null_mut(), 0.0);
        assert_eq!(
            bridge.dispatch(OpCode::StateChanged.into(), 0, 1, std::ptr::null_mut(), 0.0),
            1
        );

        let left_in = [1.0f32; 64];
        let right_in = [-1.0f32; 64];
        let mut left_out = [0.0f32; 64];
        let mut right_out = [0.0f32; 64];
        let inputs = [left_in.as_ptr(), right_in.as_ptr()];
        let mut outputs = [left_out.as_mut_ptr(), right_out.as_mut_ptr()];

        for _block in 0..3 {
            left_out.fill(0.0);
            right_out.fill(0.0);
            bridge.process_replacing(inputs.as_ptr(), outputs.as_mut_ptr(), 64);
            assert!(left_out.iter().all(|&s| s == 1.0));
            assert!(right_out.iter().all(|&s| s == -1.0));
        }
    }

    drop(bridge);
    server.join().unwrap();
}

#[test]
fn chunk_pointer_stays_valid_until_the_next_call() {
    let (bridge, effect, server) = bridged_fake();
    *effect.chunk.lock().unwrap() = vec![0xde, 0xad, 0xbe, 0xef];

    unsafe {
        let mut chunk_ptr: *mut c_void = std::ptr::null_mut();
        let len = bridge.dispatch(
            OpCode::GetData.into(),
            0,
            0,
            &mut chunk_ptr as *mut *mut c_void as *mut c_void,
            0.0,
        );
        assert_eq!(len, 4);
        assert!(!chunk_ptr.is_null());
        let bytes = std::slice::from_raw_parts(chunk_ptr as *const u8, len as usize);
        assert_eq!(bytes, &[0xde, 0xad, 0xbe, 0xef]);

        // Restoring the same bytes reaches the plugin unchanged.
        let restored = bytes.to_vec();
        bridge.dispatch(
            OpCode::SetData.into(),
            0,
            restored.len() as isize,
            restored.as_ptr() as *mut c_void,
            0.0,
        );
    }
    assert_eq!(*effect.chunk.lock().unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);

    drop(bridge);
    server.join().unwrap();
}

#[test]
fn a_dead_peer_fails_calls_without_blocking_teardown() {
    let (dir_tx, dir_rx) = std::sync::mpsc::channel();

    // A foreign host that serves construction, answers one parameter
    // request and then dies.
    let server = std::thread::spawn(move || {
        use winebridge::codec;
        use winebridge::vst2::event::{
            ParameterRequest, ParameterResponse, Vst2ControlRequest, Vst2ControlResponse,
        };

        let dir: std::path::PathBuf = dir_rx.recv().unwrap();
        let group = SocketGroup::adopt(dir);
        let mut streams =
            connect_group(&group, &winebridge::vst2::CHANNELS, HANDSHAKE_TIMEOUT).unwrap();
        let mut control = streams.remove("control").unwrap();
        let mut parameters = streams.remove("parameters").unwrap();

        for _ in 0..3 {
            let request: Vst2ControlRequest =
                codec::read_frame(&mut control, codec::DEFAULT_FRAME_CAP).unwrap();
            let response = match request {
                Vst2ControlRequest::Version(theirs) => Vst2ControlResponse::Version(theirs),
                Vst2ControlRequest::Configure(_) => Vst2ControlResponse::Ack,
                Vst2ControlRequest::GetEffectFields => {
                    Vst2ControlResponse::EffectFields(EffectFields::default())
                }
            };
            codec::write_frame(&mut control, &response, codec::DEFAULT_FRAME_CAP).unwrap();
        }

        let request: ParameterRequest =
            codec::read_frame(&mut parameters, codec::DEFAULT_FRAME_CAP).unwrap();
        assert_eq!(request, ParameterRequest::Get { index: 3 });
        codec::write_frame(
            &mut parameters,
            &ParameterResponse { value: Some(0.5) },
            codec::DEFAULT_FRAME_CAP,
        )
        .unwrap();
        // Dropping every stream here is the crash.
    });

    let bridge = Vst2Bridge::with_launcher(
        BridgeConfig::default(),
        silent_host_callback,
        move |group| {
            dir_tx.send(group.dir().to_path_buf()).unwrap();
            Ok(None)
        },
    )
    .unwrap();

    assert_eq!(bridge.get_parameter(3), 0.5);
    server.join().unwrap();

    // The peer is gone: the call fails with the generic failure value and
    // never hangs.
    assert_eq!(bridge.get_parameter(3), 0.0);

    let torn_down = std::thread::spawn(move || drop(bridge));
    std::thread::sleep(Duration::from_millis(200));
    assert!(torn_down.is_finished(), "teardown must not block on a dead peer");
    torn_down.join().unwrap();
}
