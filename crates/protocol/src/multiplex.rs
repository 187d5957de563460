//! Outbound half of a connection: sequence-stamped calls with routed replies.
//!
//! A [`Caller`] owns the write side of a stream and a background reader
//! thread. Each call inserts a one-shot channel into the pending table keyed
//! by sequence number, writes its frame under the writer lock, and blocks on
//! the channel with a deadline. The reader routes every incoming reply or
//! fault to the matching channel. When the reader exits, the pending table
//! is drained and the caller is poisoned: every later call fails with
//! [`ProtocolError::Closed`].

use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::envelope::{Frame, FrameKind};
use crate::error::ProtocolError;
use crate::message::{Call, Fault, Reply};

type PendingMap = Mutex<FxHashMap<u32, Sender<Result<Reply, Fault>>>>;

/// Outcome of a failed call: either the servant reported a typed fault, or
/// the transport failed before an answer arrived.
#[derive(Debug, Error)]
pub enum CallError {
    /// The servant answered with a fault.
    #[error(transparent)]
    Fault(Fault),
    /// The stream failed, the reply was malformed, or the deadline passed.
    #[error(transparent)]
    Transport(ProtocolError),
}

/// The calling side of one TCP stream.
pub struct Caller {
    stream: TcpStream,
    writer: Mutex<TcpStream>,
    pending: Arc<PendingMap>,
    alive: Arc<AtomicBool>,
    next_seq: AtomicU32,
    deadline: Duration,
}

impl Caller {
    /// Takes ownership of `stream` and spawns the reply reader. `deadline`
    /// bounds how long each call waits for its answer.
    pub fn start(stream: TcpStream, deadline: Duration) -> io::Result<Self> {
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(FxHashMap::default()));
        let alive = Arc::new(AtomicBool::new(true));

        let thread_pending = Arc::clone(&pending);
        let thread_alive = Arc::clone(&alive);
        thread::Builder::new()
            .name("rpc-replies".into())
            .spawn(move || read_replies(reader, &thread_pending, &thread_alive))?;

        Ok(Self {
            stream,
            writer: Mutex::new(writer),
            pending,
            alive,
            next_seq: AtomicU32::new(0),
            deadline,
        })
    }

    /// Whether the reader thread is still routing replies.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Issues `call` and blocks for its reply, the servant's fault, or the
    /// deadline.
    pub fn call(&self, call: Call) -> Result<Reply, CallError> {
        if !self.is_alive() {
            return Err(CallError::Transport(ProtocolError::Closed));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx): (_, Receiver<Result<Reply, Fault>>) = bounded(1);
        {
            let mut pending = self.pending.lock().expect("pending table lock");
            pending.insert(seq, tx);
        }

        if let Err(error) = self.send_frame(seq, &call) {
            self.forget(seq);
            return Err(CallError::Transport(error));
        }

        match rx.recv_timeout(self.deadline) {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(fault)) => Err(CallError::Fault(fault)),
            Err(RecvTimeoutError::Timeout) => {
                self.forget(seq);
                Err(CallError::Transport(ProtocolError::Deadline(self.deadline)))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(CallError::Transport(ProtocolError::Closed))
            }
        }
    }

    /// Shuts the stream down, unblocking the reader thread and failing every
    /// pending call.
    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn send_frame(&self, seq: u32, call: &Call) -> Result<(), ProtocolError> {
        let frame = Frame::new(FrameKind::Call, seq, call.encode())?;
        let mut writer = self.writer.lock().expect("stream writer lock");
        frame.write_to(&mut *writer)
    }

    fn forget(&self, seq: u32) {
        let mut pending = self.pending.lock().expect("pending table lock");
        pending.remove(&seq);
    }
}

impl Drop for Caller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_replies(mut stream: TcpStream, pending: &PendingMap, alive: &AtomicBool) {
    loop {
        match Frame::read_from(&mut stream) {
            Ok(Some(frame)) => dispatch_frame(frame, pending),
            Ok(None) => break,
            Err(error) => {
                if alive.load(Ordering::Acquire) {
                    debug!(%error, "reply stream failed");
                }
                break;
            }
        }
    }

    alive.store(false, Ordering::Release);
    // Dropping the senders wakes every parked caller with a disconnect.
    let mut pending = pending.lock().expect("pending table lock");
    pending.clear();
}

fn dispatch_frame(frame: Frame, pending: &PendingMap) {
    let answer = match frame.kind {
        FrameKind::Reply => Reply::decode(&frame.payload).map(Ok),
        FrameKind::Fault => Fault::decode(&frame.payload).map(Err),
        FrameKind::Call => {
            warn!(seq = frame.seq, "unexpected call frame on a reply stream");
            return;
        }
    };

    let answer = match answer {
        Ok(answer) => answer,
        Err(error) => {
            warn!(seq = frame.seq, %error, "dropping undecodable answer");
            return;
        }
    };

    let tx = {
        let mut pending = pending.lock().expect("pending table lock");
        pending.remove(&frame.seq)
    };
    match tx {
        // The receiver may have timed out in the meantime; a failed send is
        // indistinguishable from a late reply and equally ignorable.
        Some(tx) => drop(tx.send(answer)),
        None => debug!(seq = frame.seq, "reply for an abandoned call"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    use crate::message::FaultCode;

    fn answered_pair() -> (Caller, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let dialed = TcpStream::connect(addr).expect("connect");
        let (accepted, _) = listener.accept().expect("accept");
        let caller = Caller::start(dialed, Duration::from_millis(500)).expect("caller");
        (caller, accepted)
    }

    fn answer_calls(mut servant: TcpStream, answers: usize) -> thread::JoinHandle<Vec<u32>> {
        thread::spawn(move || {
            let mut seqs = Vec::new();
            for _ in 0..answers {
                let frame = Frame::read_from(&mut servant)
                    .expect("read call")
                    .expect("call present");
                assert_eq!(frame.kind, FrameKind::Call);
                seqs.push(frame.seq);
                let reply = Frame::new(FrameKind::Reply, frame.seq, Reply::Ok.encode())
                    .expect("reply frame");
                reply.write_to(&mut servant).expect("write reply");
            }
            seqs
        })
    }

    #[test]
    fn calls_receive_their_own_replies() {
        let (caller, servant) = answered_pair();
        let answering = answer_calls(servant, 3);

        for _ in 0..3 {
            let reply = caller.call(Call::Ping).expect("call succeeds");
            assert_eq!(reply, Reply::Ok);
        }

        let seqs = answering.join().expect("servant thread");
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn faults_surface_as_typed_errors() {
        let (caller, mut servant) = answered_pair();
        let answering = thread::spawn(move || {
            let frame = Frame::read_from(&mut servant)
                .expect("read call")
                .expect("call present");
            let fault = Fault::new(FaultCode::UnknownMethod, "ping");
            Frame::new(FrameKind::Fault, frame.seq, fault.encode())
                .expect("fault frame")
                .write_to(&mut servant)
                .expect("write fault");
        });

        let err = caller.call(Call::Ping).expect_err("fault expected");
        match err {
            CallError::Fault(fault) => assert_eq!(fault.code, FaultCode::UnknownMethod),
            CallError::Transport(other) => panic!("unexpected transport error: {other}"),
        }
        answering.join().expect("servant thread");
    }

    #[test]
    fn a_silent_servant_times_out() {
        let (caller, _servant) = answered_pair();
        let err = caller.call(Call::Ping).expect_err("deadline expected");
        assert!(matches!(
            err,
            CallError::Transport(ProtocolError::Deadline(_))
        ));
    }

    #[test]
    fn a_closed_stream_poisons_the_caller() {
        let (caller, servant) = answered_pair();
        drop(servant);

        // The reader notices EOF; afterwards every call fails fast.
        let err = caller.call(Call::Ping).expect_err("closed expected");
        assert!(matches!(err, CallError::Transport(_)));

        while caller.is_alive() {
            thread::yield_now();
        }
        let err = caller.call(Call::Ping).expect_err("poisoned caller");
        assert!(matches!(
            err,
            CallError::Transport(ProtocolError::Closed)
        ));
    }

    #[test]
    fn out_of_order_replies_reach_the_right_callers() {
        let (caller, mut servant) = answered_pair();
        let caller = Arc::new(caller);

        let answering = thread::spawn(move || {
            let first = Frame::read_from(&mut servant)
                .expect("read call")
                .expect("call present");
            let second = Frame::read_from(&mut servant)
                .expect("read call")
                .expect("call present");

            // Answer in reverse order with distinguishable replies.
            for frame in [&second, &first] {
                let reply = Reply::Committed {
                    version: u64::from(frame.seq) + 100,
                };
                Frame::new(FrameKind::Reply, frame.seq, reply.encode())
                    .expect("reply frame")
                    .write_to(&mut servant)
                    .expect("write reply");
            }
        });

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let caller = Arc::clone(&caller);
                thread::spawn(move || caller.call(Call::Ping).expect("call succeeds"))
            })
            .collect();

        let mut versions: Vec<u64> = workers
            .into_iter()
            .map(|w| match w.join().expect("worker") {
                Reply::Committed { version } => version,
                other => panic!("unexpected reply: {other:?}"),
            })
            .collect();
        versions.sort_unstable();
        assert_eq!(versions, vec![100, 101]);
        answering.join().expect("servant thread");
    }
}
