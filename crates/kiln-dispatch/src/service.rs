//! The service interface executed by worker threads.

use kiln_wire::{ResponseHeader, Status};

use crate::transport::ReplySink;
use crate::worker::WorkerShared;

/// A request being executed by a service handler.
///
/// The handler reads the raw request (common header included) and builds the
/// reply in place. On a worker thread it may additionally call
/// [`Rpc::send_reply`] before returning: the reply is then shipped while the
/// handler finishes its remaining bookkeeping (the postprocessing window).
pub struct Rpc<'a> {
    request: &'a [u8],
    reply: Vec<u8>,
    sink: Option<ReplySink>,
    worker: Option<&'a WorkerShared>,
}

impl<'a> Rpc<'a> {
    /// An RPC executing on a worker thread, with early-reply support.
    pub(crate) fn on_worker(
        request: &'a [u8],
        sink: ReplySink,
        worker: &'a WorkerShared,
    ) -> Self {
        Rpc {
            request,
            reply: Vec::new(),
            sink: Some(sink),
            worker: Some(worker),
        }
    }

    /// An RPC executed inline, outside the worker pool (in-process
    /// sessions). `send_reply` degrades to a no-op marker; the reply is
    /// delivered when the handler returns.
    pub fn direct(request: &'a [u8], sink: ReplySink) -> Self {
        Rpc {
            request,
            reply: Vec::new(),
            sink: Some(sink),
            worker: None,
        }
    }

    /// The raw request, common header included. The returned slice borrows
    /// the request buffer, not this handle, so it stays usable while the
    /// reply is being built.
    pub fn request(&self) -> &'a [u8] {
        self.request
    }

    pub fn reply_mut(&mut self) -> &mut Vec<u8> {
        &mut self.reply
    }

    /// Hands the reply to the dispatch thread now instead of at handler
    /// return. Anything the handler does afterwards runs in the
    /// postprocessing window and must not touch the reply again.
    pub fn send_reply(&mut self) {
        let Some(sink) = self.sink.take() else {
            return;
        };
        let reply = std::mem::take(&mut self.reply);
        match self.worker {
            Some(worker) => worker.publish_reply(reply, sink, true),
            // Inline execution has no dispatch thread to hand off to.
            None => sink(reply),
        }
    }

    /// Delivers the reply if the handler did not already send it early.
    pub(crate) fn finish(mut self) {
        let Some(sink) = self.sink.take() else {
            return;
        };
        let reply = std::mem::take(&mut self.reply);
        match self.worker {
            Some(worker) => worker.publish_reply(reply, sink, false),
            None => sink(reply),
        }
    }
}

/// One registered RPC service. Handlers convert every recognized failure
/// into a status code in the reply; they never unwind past the worker.
pub trait Service: Send + Sync {
    fn handle(&self, rpc: &mut Rpc<'_>);
}

/// A bare error reply: a response header and nothing else.
pub fn error_reply(status: Status) -> Vec<u8> {
    let mut reply = Vec::with_capacity(4);
    ResponseHeader { status }.encode(&mut reply);
    reply
}
