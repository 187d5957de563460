//! Inbound half of a connection: decode calls, dispatch, answer.
//!
//! Each call runs on its own thread so one blocking method (a chunk
//! resolution waiting out a dead owner) cannot delay the heartbeats queued
//! behind it on the same stream. Answers are written under a shared writer
//! lock; frame order on the wire is therefore completion order, which the
//! sequence numbers make unambiguous.

use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::envelope::{Frame, FrameKind};
use crate::error::ProtocolError;
use crate::message::{Call, Fault, FaultCode, Reply};

/// A servant for one side of the protocol.
///
/// Implementations must be cheap to share: the serve loop clones the `Arc`
/// for every in-flight call.
pub trait Handler: Send + Sync {
    /// Answers one call with a reply or a typed fault.
    fn handle(&self, call: Call) -> Result<Reply, Fault>;
}

/// Serves `stream` until the peer disconnects. Returns `Ok(())` on a clean
/// close and the underlying error otherwise.
pub fn serve<H: Handler + 'static>(stream: TcpStream, handler: Arc<H>) -> Result<(), ProtocolError> {
    let writer = Arc::new(Mutex::new(stream.try_clone()?));
    let mut reader = stream;

    loop {
        let frame = match Frame::read_from(&mut reader)? {
            Some(frame) => frame,
            None => return Ok(()),
        };

        if frame.kind != FrameKind::Call {
            warn!(seq = frame.seq, kind = ?frame.kind, "ignoring answer frame on a call stream");
            continue;
        }

        let seq = frame.seq;
        let call = match Call::decode(&frame.payload) {
            Ok(call) => call,
            Err(error) => {
                debug!(seq, %error, "undecodable call");
                let fault = Fault::new(FaultCode::UnknownMethod, error.to_string());
                write_answer(&writer, seq, &Err(fault));
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        let writer = Arc::clone(&writer);
        thread::Builder::new()
            .name(format!("rpc-{}", call.method_name()))
            .spawn(move || {
                let answer = handler.handle(call);
                write_answer(&writer, seq, &answer);
            })
            .map_err(ProtocolError::Io)?;
    }
}

fn write_answer(writer: &Mutex<TcpStream>, seq: u32, answer: &Result<Reply, Fault>) {
    let frame = match answer {
        Ok(reply) => Frame::new(FrameKind::Reply, seq, reply.encode()),
        Err(fault) => Frame::new(FrameKind::Fault, seq, fault.encode()),
    };
    let frame = match frame {
        Ok(frame) => frame,
        Err(error) => {
            warn!(seq, %error, "answer exceeds frame limits");
            return;
        }
    };

    let mut writer = writer.lock().expect("stream writer lock");
    if let Err(error) = frame.write_to(&mut *writer) {
        debug!(seq, %error, "failed to write answer; peer likely gone");
    }
}
