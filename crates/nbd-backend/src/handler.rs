//! The back-end handler contract (spec.md §4.2): the capability every back
//! end satisfies, and the completion-message model a handler uses to reply
//! without ever touching the session's socket directly.

use tokio::sync::mpsc;

/// What a completed operation resolved to.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// A successful READ, carrying the bytes to send back.
    ReadOk(Vec<u8>),
    /// A successful WRITE or FLUSH.
    Ok,
    /// A failed operation; `errno` is a POSIX error code (`EIO` if the
    /// back end had no more specific mapping).
    Err(i32),
}

/// One handler reply, funnelled back onto the reactor instead of being
/// written to the socket directly by a back-end thread or task.
#[derive(Debug, Clone)]
pub struct Completion {
    pub cookie: u64,
    pub outcome: Outcome,
}

/// The sending half of a session's completion channel. Cloned and handed to
/// a handler so it can post completions from any task; posting after the
/// session has closed is a silent no-op (the receiver is simply gone), per
/// spec.md §5: "completion callbacks must tolerate a closed session".
#[derive(Clone)]
pub struct CompletionSink(mpsc::UnboundedSender<Completion>);

impl CompletionSink {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<Completion>) -> Self {
        Self(tx)
    }

    pub fn ok_read(&self, cookie: u64, data: Vec<u8>) {
        let _ = self.0.send(Completion {
            cookie,
            outcome: Outcome::ReadOk(data),
        });
    }

    pub fn ok(&self, cookie: u64) {
        let _ = self.0.send(Completion {
            cookie,
            outcome: Outcome::Ok,
        });
    }

    pub fn err(&self, cookie: u64, errno: i32) {
        let _ = self.0.send(Completion {
            cookie,
            outcome: Outcome::Err(errno),
        });
    }
}

/// Create a fresh completion channel for a session.
#[must_use]
pub fn completion_channel() -> (CompletionSink, mpsc::UnboundedReceiver<Completion>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CompletionSink::new(tx), rx)
}

/// Common POSIX errno used when a back end has no more specific mapping.
pub const EIO: i32 = 5;
/// Operation not permitted (used for writes against a read-only export).
pub const EPERM: i32 = 1;
/// Invalid argument (used for commands the back end cannot interpret).
pub const EINVAL: i32 = 22;

/// A back end's handler: owns whatever resources it acquired at
/// construction and is owned exclusively by its session.
///
/// Every method must post exactly one completion per accepted request
/// (possibly synchronously, before returning) — even a handler that fails
/// to queue an operation must still report an error rather than drop the
/// request silently.
pub trait Handler: Send + Sync {
    /// Total byte size of the export. Queried once at handshake.
    fn size(&self) -> u64;

    /// `ceil(size / block_size)`, reported to the host during the
    /// handshake and never recomputed afterwards.
    fn blocks(&self, block_size: u64) -> u64 {
        self.size().div_ceil(block_size)
    }

    /// Initiate an asynchronous read. Must not block the reactor thread;
    /// implementations that talk to something synchronous offload to a
    /// spawned task and post the completion when it finishes.
    fn read(&self, sink: CompletionSink, cookie: u64, offset: u64, length: u32);

    /// Initiate an asynchronous write.
    fn write(&self, sink: CompletionSink, cookie: u64, offset: u64, data: Vec<u8>);

    /// Initiate an asynchronous flush.
    fn flush(&self, sink: CompletionSink, cookie: u64);

    /// Release any back-end resources. Called exactly once, when the
    /// session closes.
    fn close(&self);
}
