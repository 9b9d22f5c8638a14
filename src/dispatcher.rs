//! Per-channel receive loops and the main-thread thunk queue.
//!
//! Each channel that receives requests gets exactly one dedicated thread:
//! read a frame, decode, hand to the handler, write the encoded response.
//! There is no multiplexing within a channel; the sender's channel mutex
//! already serialises concurrent calls.

use std::io::ErrorKind;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::codec;
use crate::error::BridgeError;
use crate::transport::Request;

/// Services decoded requests from one channel.
///
/// `main_thread_safe` mirrors the request's own claim; handlers use it to
/// thunk GUI-affine work onto an [`IdleQueue`] instead of running it on the
/// socket thread.
pub trait EventHandler<R: Request>: Send + Sync + 'static {
    /// Produce the response for one request.
    fn handle(&self, request: R, main_thread_safe: bool) -> R::Response;
}

impl<R: Request, F> EventHandler<R> for F
where
    F: Fn(R, bool) -> R::Response + Send + Sync + 'static,
{
    fn handle(&self, request: R, main_thread_safe: bool) -> R::Response {
        self(request, main_thread_safe)
    }
}

/// Handle to a running receiver thread. Shutting down closes the socket,
/// which unblocks the loop, then joins the thread.
pub struct ReceiverHandle {
    name: String,
    socket: UnixStream,
    stopping: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReceiverHandle {
    /// Signal the loop to exit and wait for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("receiver thread {} panicked", self.name);
            }
        }
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Realtime FIFO priority requested for callback receiver threads. They
/// service calls the foreign audio thread blocks on, so they follow the
/// audio path's scheduling class.
const RECEIVER_RT_PRIORITY: i32 = 10;

/// Spawn the receive loop for one channel.
pub fn spawn_receiver<R: Request>(
    name: &str,
    stream: UnixStream,
    handler: Arc<dyn EventHandler<R>>,
    cap: u64,
) -> std::io::Result<ReceiverHandle> {
    let stopping = Arc::new(AtomicBool::new(false));
    let socket = stream.try_clone()?;
    let loop_name = name.to_string();
    let loop_stopping = Arc::clone(&stopping);
    let thread = std::thread::Builder::new().name(format!("winebridge-{}", name)).spawn(
        move || {
            if let Err(err) = crate::rt::set_realtime_priority(RECEIVER_RT_PRIORITY) {
                debug!("receiver {} stays at normal priority: {}", loop_name, err);
            }
            let mut stream = stream;
            loop {
                let request: R = match codec::read_frame(&mut stream, cap) {
                    Ok(request) => request,
                    Err(err) => {
                        log_loop_exit(&loop_name, &loop_stopping, &err);
                        break;
                    }
                };
                let main_thread_safe = request.main_thread_safe();
                let response = handler.handle(request, main_thread_safe);
                if let Err(err) = codec::write_frame(&mut stream, &response, cap) {
                    log_loop_exit(&loop_name, &loop_stopping, &err);
                    break;
                }
            }
        },
    )?;
    Ok(ReceiverHandle { name: name.to_string(), socket, stopping, thread: Some(thread) })
}

fn log_loop_exit(name: &str, stopping: &AtomicBool, err: &BridgeError) {
    if stopping.load(Ordering::SeqCst) || is_disconnect(err) {
        debug!("receiver {} finished: {}", name, err);
    } else {
        error!("receiver {} failed: {}", name, err);
    }
}

fn is_disconnect(err: &BridgeError) -> bool {
    match err {
        BridgeError::Transport(io) => matches!(
            io.kind(),
            ErrorKind::UnexpectedEof
                | ErrorKind::BrokenPipe
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
        ),
        _ => false,
    }
}

/// Queue of calls that must run on a host-driven thread.
///
/// Plugin→host callbacks that a host only tolerates on its GUI thread (the
/// editor resize case) are parked here by the socket thread and drained on
/// the next host-initiated idle entry point.
pub struct IdleQueue {
    sender: crossbeam_channel::Sender<Box<dyn FnOnce() + Send>>,
    receiver: crossbeam_channel::Receiver<Box<dyn FnOnce() + Send>>,
}

impl Default for IdleQueue {
    fn default() -> IdleQueue {
        let (sender, receiver) = crossbeam_channel::unbounded();
        IdleQueue { sender, receiver }
    }
}

impl IdleQueue {
    /// Park a call for the next idle drain.
    pub fn push<F: FnOnce() + Send + 'static>(&self, thunk: F) {
        // Send only fails when both halves are gone, which cannot happen
        // while `self` holds the receiver.
        let _ = self.sender.send(Box::new(thunk));
    }

    /// Run every parked call. Called from the host's idle entry point.
    pub fn drain(&self) {
        while let Ok(thunk) = self.receiver.try_recv() {
            thunk();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{EventChannel, Request};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Double(u32);

    impl Request for Double {
        type Response = u32;
        fn main_thread_safe(&self) -> bool {
            self.0 % 2 == 0
        }
    }

    #[test]
    fn receiver_answers_in_fifo_order() {
        let (client, server) = UnixStream::pair().unwrap();
        let handle = spawn_receiver::<Double>(
            "test",
            server,
            Arc::new(|request: Double, _main| request.0 * 2),
            crate::codec::DEFAULT_FRAME_CAP,
        )
        .unwrap();

        let channel = EventChannel::<Double>::new(client);
        for i in 0..32 {
            assert_eq!(channel.send_and_receive(&Double(i)).unwrap(), i * 2);
        }
        handle.shutdown();
    }

    #[test]
    fn handler_sees_main_thread_flag() {
        let (client, server) = UnixStream::pair().unwrap();
        let handle = spawn_receiver::<Double>(
            "test",
            server,
            Arc::new(|_request: Double, main| u32::from(main)),
            crate::codec::DEFAULT_FRAME_CAP,
        )
        .unwrap();

        let channel = EventChannel::<Double>::new(client);
        assert_eq!(channel.send_and_receive(&Double(2)).unwrap(), 1);
        assert_eq!(channel.send_and_receive(&Double(3)).unwrap(), 0);
        handle.shutdown();
    }

    #[test]
    fn idle_queue_drains_in_push_order() {
        let queue = IdleQueue::default();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = Arc::clone(&seen);
            queue.push(move || seen.lock().unwrap().push(i));
        }
        assert!(seen.lock().unwrap().is_empty());
        queue.drain();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }
}
