use std::{
    any::Any,
    borrow::Cow,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use rayon::ThreadPool;

use crate::{
    common::{BackendKind, Device},
    d_buffer::{release_writer, WriterMark},
    error::{DeviceError, StreamError},
};

pub type StreamId = u64;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Capability token handed to kernels while they execute on a device.
///
/// Device buffers can only be dereferenced with a `KernelContext`, which host code cannot
/// construct.
pub struct KernelContext {
    device: Device,
    kind: BackendKind,
}

impl KernelContext {
    pub(crate) fn new(device: Device, kind: BackendKind) -> Self {
        Self { device, kind }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Builds the error a kernel reports when it cannot complete.
    pub fn fail(&self, kernel: &'static str, message: impl Into<String>) -> DeviceError {
        DeviceError::KernelFailed {
            device: self.device.clone(),
            kernel,
            message: message.into(),
        }
    }
}

type Command = Box<dyn FnOnce(&KernelContext) -> Result<(), DeviceError> + Send>;

struct Job {
    ticket: u64,
    name: &'static str,
    /// Runs on the device's compute threads. Ordering commands stay on the stream worker.
    compute: bool,
    command: Command,
}

#[derive(Default)]
struct Progress {
    submitted: u64,
    completed: u64,
    /// First failure and the ticket that produced it.
    error: Option<(u64, DeviceError)>,
}

pub(crate) struct StreamShared {
    id: StreamId,
    progress: Mutex<Progress>,
    cond: Condvar,
    /// Writer marks dropped by the command currently executing; `None` between commands.
    running: Mutex<Option<Vec<WriterMark>>>,
    /// Writer marks of failed commands, held until the failure is reported.
    poisoned: Mutex<Vec<WriterMark>>,
}

impl StreamShared {
    fn new(id: StreamId) -> Self {
        Self {
            id,
            progress: Mutex::default(),
            cond: Condvar::new(),
            running: Mutex::new(None),
            poisoned: Mutex::new(Vec::new()),
        }
    }

    /// Releases `mark` once the running command has finished, or right away when no command
    /// is running.
    pub(crate) fn release_after_command(&self, mark: WriterMark) {
        if let Some(held) = self.running.lock().as_mut() {
            held.push(mark);
            return;
        }
        release_writer(&mark, self.id);
    }

    /// Takes the first recorded failure at or before `ticket` and releases the buffers that
    /// failed commands left pending.
    fn take_error(&self, ticket: u64) -> Option<DeviceError> {
        let mut progress = self.progress.lock();
        let err = match progress.error.take() {
            Some((failed, err)) if failed <= ticket => err,
            other => {
                progress.error = other;
                return None;
            }
        };
        drop(progress);
        for mark in self.poisoned.lock().drain(..) {
            release_writer(&mark, self.id);
        }
        Some(err)
    }

    fn wait_until(&self, ticket: u64) {
        let mut progress = self.progress.lock();
        while progress.completed < ticket {
            self.cond.wait(&mut progress);
        }
    }

    fn is_completed(&self, ticket: u64) -> bool {
        self.progress.lock().completed >= ticket
    }
}

/// An ordered command queue bound to one device.
///
/// Commands run in submission order on a dedicated worker. Nothing orders two streams against
/// each other except an explicit [Event] wait.
pub struct Stream {
    id: StreamId,
    device: Device,
    shared: Arc<StreamShared>,
    sender: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    pub(crate) fn new(
        device: Device,
        kind: BackendKind,
        pool: Arc<ThreadPool>,
    ) -> Result<Self, StreamError> {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(StreamShared::new(id));
        let (sender, receiver) = mpsc::channel::<Job>();

        let worker_shared = shared.clone();
        let ctx = KernelContext::new(device.clone(), kind);
        let worker = thread::Builder::new()
            .name(format!("stream-{}-{}", device, id))
            .spawn(move || worker_loop(worker_shared, receiver, ctx, pool))
            .map_err(|e| StreamError::Spawn {
                id,
                message: e.to_string(),
            })?;

        tracing::debug!(stream = id, %device, "created stream");
        Ok(Self {
            id,
            device,
            shared,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    /// Appends `command` to the queue and returns its ticket. Never blocks.
    pub fn enqueue(
        &self,
        name: &'static str,
        command: impl FnOnce(&KernelContext) -> Result<(), DeviceError> + Send + 'static,
    ) -> Result<u64, StreamError> {
        self.submit(name, true, Box::new(command))
    }

    fn submit(
        &self,
        name: &'static str,
        compute: bool,
        command: Command,
    ) -> Result<u64, StreamError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or(StreamError::Destroyed { id: self.id })?;

        // Tickets are assigned and sent under the same lock so they reach the worker in order.
        let mut progress = self.shared.progress.lock();
        let ticket = progress.submitted + 1;
        sender
            .send(Job {
                ticket,
                name,
                compute,
                command,
            })
            .map_err(|_| StreamError::Destroyed { id: self.id })?;
        progress.submitted = ticket;
        Ok(ticket)
    }

    /// Enqueues a command producing a value that becomes readable after synchronization.
    pub fn enqueue_with_result<R: Send + 'static>(
        &self,
        name: &'static str,
        command: impl FnOnce(&KernelContext) -> Result<R, DeviceError> + Send + 'static,
    ) -> Result<Pending<'_, R>, StreamError> {
        let slot = Arc::new(Mutex::new(None));
        let out = slot.clone();
        let ticket = self.enqueue(name, move |ctx| {
            let value = command(ctx)?;
            *out.lock() = Some(value);
            Ok(())
        })?;
        Ok(Pending {
            stream: self,
            ticket,
            value: PendingValue::Slot(slot),
        })
    }

    /// Ties `value` to the completion of `ticket` on this stream.
    pub fn pending<T>(&self, ticket: u64, value: T) -> Pending<'_, T> {
        Pending {
            stream: self,
            ticket,
            value: PendingValue::Ready(value),
        }
    }

    /// Blocks until every command enqueued so far has completed.
    ///
    /// Returns the first error any of those commands reported since the last synchronization.
    pub fn synchronize(&self) -> Result<(), StreamError> {
        if self.sender.is_none() {
            return Err(StreamError::Destroyed { id: self.id });
        }
        let ticket = self.shared.progress.lock().submitted;
        self.wait_for(ticket)
    }

    pub(crate) fn wait_for(&self, ticket: u64) -> Result<(), StreamError> {
        self.shared.wait_until(ticket);
        match self.shared.take_error(ticket) {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    pub fn is_completed(&self, ticket: u64) -> bool {
        self.shared.is_completed(ticket)
    }

    /// Number of enqueued commands that have not finished yet.
    pub fn outstanding(&self) -> u64 {
        let progress = self.shared.progress.lock();
        progress.submitted - progress.completed
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    /// Releases the queue. Fails with [StreamError::StreamBusy] while work is outstanding.
    ///
    /// A failure no synchronization has reported yet is returned instead, and the stream stays
    /// alive until `destroy` is called again.
    pub fn destroy(&mut self) -> Result<(), StreamError> {
        if self.sender.is_none() {
            return Err(StreamError::Destroyed { id: self.id });
        }
        let outstanding = self.outstanding();
        if outstanding > 0 {
            return Err(StreamError::StreamBusy {
                id: self.id,
                outstanding,
            });
        }
        if let Some(err) = self.shared.take_error(u64::MAX) {
            return Err(err.into());
        }
        self.shutdown();
        tracing::debug!(stream = self.id, device = %self.device, "destroyed stream");
        Ok(())
    }

    /// Records `event` at the current tail of this stream.
    pub fn record(&self, event: &Event) -> Result<(), StreamError> {
        *event.inner.timestamp.lock() = None;
        let inner = event.inner.clone();
        let ticket = self.submit(
            "event_record",
            false,
            Box::new(move |_| {
                *inner.timestamp.lock() = Some(Instant::now());
                Ok(())
            }),
        )?;
        *event.inner.recorded.lock() = Some(EventRecord {
            shared: self.shared.clone(),
            ticket,
        });
        Ok(())
    }

    /// Makes all later work on this stream wait until `event` has completed on its stream.
    pub fn wait_event(&self, event: &Event) -> Result<(), StreamError> {
        let Some(record) = event.record() else {
            return Ok(());
        };
        self.submit(
            "event_wait",
            false,
            Box::new(move |_| {
                record.shared.wait_until(record.ticket);
                Ok(())
            }),
        )?;
        Ok(())
    }

    fn shutdown(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(stream = self.id, "stream worker panicked");
            }
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.sender.is_some() {
            if let Err(err) = self.synchronize() {
                tracing::warn!(stream = self.id, "dropping stream with failed work: {err}");
            }
            self.shutdown();
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("device", &self.device)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

fn worker_loop(
    shared: Arc<StreamShared>,
    receiver: mpsc::Receiver<Job>,
    ctx: KernelContext,
    pool: Arc<ThreadPool>,
) {
    let id = shared.id;
    for Job {
        ticket,
        name,
        compute,
        command,
    } in receiver
    {
        *shared.running.lock() = Some(Vec::new());
        let run = || {
            if compute {
                pool.install(|| command(&ctx))
            } else {
                command(&ctx)
            }
        };
        let result = match catch_unwind(AssertUnwindSafe(run)) {
            Ok(result) => result,
            Err(payload) => Err(DeviceError::KernelPanicked {
                device: ctx.device.clone(),
                kernel: name,
                message: panic_message(payload.as_ref()),
            }),
        };
        if let Err(err) = &result {
            tracing::warn!(stream = id, kernel = name, "{err}");
        }

        let marks = shared.running.lock().take().unwrap_or_default();
        if result.is_ok() {
            for mark in &marks {
                release_writer(mark, id);
            }
        } else {
            shared.poisoned.lock().extend(marks);
        }

        let mut progress = shared.progress.lock();
        if let Err(err) = result {
            if progress.error.is_none() {
                progress.error = Some((ticket, err));
            }
        }
        progress.completed = ticket;
        drop(progress);
        shared.cond.notify_all();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

enum PendingValue<T> {
    Ready(T),
    Slot(Arc<Mutex<Option<T>>>),
}

/// Result of asynchronous device work.
///
/// The value is only handed out by [Pending::wait], which blocks until the producing command has
/// completed on its stream. The borrow of the stream keeps it from being destroyed meanwhile.
#[must_use = "asynchronous device work must be waited on before its result is used"]
pub struct Pending<'s, T> {
    stream: &'s Stream,
    ticket: u64,
    value: PendingValue<T>,
}

impl<'s, T> Pending<'s, T> {
    pub fn stream(&self) -> &'s Stream {
        self.stream
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn is_ready(&self) -> bool {
        self.stream.is_completed(self.ticket)
    }

    /// Waits for the producing command and returns its value.
    pub fn wait(self) -> Result<T, StreamError> {
        self.stream.wait_for(self.ticket)?;
        match self.value {
            PendingValue::Ready(value) => Ok(value),
            PendingValue::Slot(slot) => slot.lock().take().ok_or(StreamError::MissingResult {
                id: self.stream.id,
                ticket: self.ticket,
            }),
        }
    }

    /// Borrows a handle-like value for further work ordered on the same stream.
    ///
    /// Returns `None` for values that are produced by the device.
    pub fn ordered(&self) -> Option<&T> {
        match &self.value {
            PendingValue::Ready(value) => Some(value),
            PendingValue::Slot(_) => None,
        }
    }
}

#[derive(Clone)]
struct EventRecord {
    shared: Arc<StreamShared>,
    ticket: u64,
}

#[derive(Default)]
struct EventInner {
    recorded: Mutex<Option<EventRecord>>,
    timestamp: Mutex<Option<Instant>>,
}

/// A marker recorded into a stream, used for cross-stream ordering and device timing.
#[derive(Clone, Default)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self) -> Option<EventRecord> {
        self.inner.recorded.lock().clone()
    }

    /// Blocks until the stream reaches this event. A never-recorded event is complete.
    pub fn synchronize(&self) {
        if let Some(record) = self.record() {
            record.shared.wait_until(record.ticket);
        }
    }

    pub fn completed(&self) -> bool {
        self.record()
            .map_or(true, |record| record.shared.is_completed(record.ticket))
    }

    /// Time between `start` and this event, once both have completed.
    pub fn elapsed_since(&self, start: &Event) -> Option<Duration> {
        let start = (*start.inner.timestamp.lock())?;
        let end = (*self.inner.timestamp.lock())?;
        Some(end.saturating_duration_since(start))
    }
}

/// A device-aware span that collects a gauge metric using stream events.
pub fn device_metrics_span<R, F: FnOnce() -> R>(
    stream: &Stream,
    name: impl Into<Cow<'static, str>>,
    f: F,
) -> Result<R, StreamError> {
    let start = Event::new();
    let stop = Event::new();
    stream.record(&start)?;
    let res = f();
    stream.record(&stop)?;
    stop.synchronize();

    if let Some(elapsed) = stop.elapsed_since(&start) {
        metrics::gauge!(name.into()).set(elapsed.as_secs_f64() * 1000.0);
    }
    Ok(res)
}
