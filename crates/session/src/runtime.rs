//! Thread runtime: four long-lived task threads (main, worker, signaling,
//! network), each draining its own FIFO task queue.
//!
//! Every spawned thread drives a current-thread tokio runtime, so sockets
//! wrapped on the network thread are polled by the network thread itself.
//! The main thread is not spawned: it is the thread that created the
//! [`ThreadRuntime`], and it only processes its queue while [`ThreadRuntime::run`]
//! pumps it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How often the shutdown flag is polled while [`ThreadRuntime::run`] pumps
/// the main thread.
pub const QUIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type Task = Box<dyn FnOnce() + Send + 'static>;
pub type AsyncTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum Command {
    Run(Task),
    /// Awaited to completion before the next queued command runs.
    Await(AsyncTask),
    Quit,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to start {name} thread: {source}")]
    Start {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{name} thread is not running")]
    NotRunning { name: String },
    #[error("{0} must be called on the main thread")]
    WrongThread(&'static str),
    #[error("blocking call onto {name} from its own thread")]
    WouldDeadlock { name: String },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Manual-reset event.
#[derive(Default)]
pub struct Event {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn set(&self) {
        *lock(&self.set) = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.set)
    }

    /// Wait up to `timeout` for the event. A zero timeout just polls.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = lock(&self.set);
        if *guard || timeout.is_zero() {
            return *guard;
        }
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// One named thread with a FIFO task queue.
pub struct TaskThread {
    name: String,
    tx: mpsc::UnboundedSender<Command>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    handle: OnceLock<Handle>,
    thread_id: OnceLock<ThreadId>,
    join: Mutex<Option<JoinHandle<()>>>,
    /// Present only for a wrapped (not spawned) thread, which drives it from
    /// [`TaskThread::process_messages`].
    wrapped: Option<Runtime>,
    stopped: AtomicBool,
    pending_delayed: Arc<AtomicUsize>,
}

impl TaskThread {
    /// Create a thread that is spawned later by [`TaskThread::start`].
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name: name.into(),
            tx,
            rx: Mutex::new(Some(rx)),
            handle: OnceLock::new(),
            thread_id: OnceLock::new(),
            join: Mutex::new(None),
            wrapped: None,
            stopped: AtomicBool::new(false),
            pending_delayed: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Adopt the calling thread. Its queue only runs inside
    /// [`TaskThread::process_messages`].
    pub fn wrap_current(name: impl Into<String>) -> Result<Arc<Self>, RuntimeError> {
        let name = name.into();
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| RuntimeError::Start {
                name: name.clone(),
                source,
            })?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = OnceLock::new();
        let _ = handle.set(runtime.handle().clone());
        let thread_id = OnceLock::new();
        let _ = thread_id.set(thread::current().id());
        Ok(Arc::new(Self {
            name,
            tx,
            rx: Mutex::new(Some(rx)),
            handle,
            thread_id,
            join: Mutex::new(None),
            wrapped: Some(runtime),
            stopped: AtomicBool::new(false),
            pending_delayed: Arc::new(AtomicUsize::new(0)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the OS thread. Starting twice is a no-op.
    pub fn start(&self) -> Result<(), RuntimeError> {
        if self.wrapped.is_some() {
            return Ok(());
        }
        let Some(rx) = lock(&self.rx).take() else {
            return Ok(());
        };
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| RuntimeError::Start {
                name: self.name.clone(),
                source,
            })?;
        let _ = self.handle.set(runtime.handle().clone());

        let name = self.name.clone();
        let join = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                runtime.block_on(drain(rx));
                debug!(thread = %name, "Task thread exiting");
            })
            .map_err(|source| RuntimeError::Start {
                name: self.name.clone(),
                source,
            })?;
        let _ = self.thread_id.set(join.thread().id());
        *lock(&self.join) = Some(join);
        debug!(thread = %self.name, "Task thread started");
        Ok(())
    }

    pub fn is_current(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Runtime handle for spawning I/O onto this thread. `None` until started.
    pub fn handle(&self) -> Option<Handle> {
        self.handle.get().cloned()
    }

    /// Queue a task. Tasks posted to the same thread run in FIFO order.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.send(Command::Run(Box::new(task)))
    }

    /// Queue a future; the queue does not advance until it completes.
    pub fn post_async(&self, task: impl Future<Output = ()> + Send + 'static) -> bool {
        self.send(Command::Await(Box::pin(task)))
    }

    /// Queue a task after `delay`. Returns false if the thread never started
    /// or has been stopped.
    pub fn post_delayed(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> bool {
        self.send_delayed(delay, Command::Run(Box::new(task)))
    }

    pub fn post_delayed_async(
        &self,
        delay: Duration,
        task: impl Future<Output = ()> + Send + 'static,
    ) -> bool {
        self.send_delayed(delay, Command::Await(Box::pin(task)))
    }

    /// Spawn a future onto this thread's runtime, outside the FIFO queue.
    pub fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) -> bool {
        match self.handle.get() {
            Some(handle) if !self.is_stopped() => {
                handle.spawn(task);
                true
            }
            _ => false,
        }
    }

    /// Delayed tasks scheduled but not yet queued.
    pub fn pending_delayed(&self) -> usize {
        self.pending_delayed.load(Ordering::Acquire)
    }

    /// Run `f` on this thread and wait for its result. Runs inline when
    /// already on this thread.
    pub fn blocking_call<R, F>(&self, f: F) -> Result<R, RuntimeError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(f());
        }
        if self.handle.get().is_none() {
            return Err(self.not_running());
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        if !self.post(move || {
            let _ = tx.send(f());
        }) {
            return Err(self.not_running());
        }
        rx.recv().map_err(|_| self.not_running())
    }

    /// Run the future produced by `f` on this thread and wait for its output.
    pub fn blocking_call_async<R, F, Fut>(&self, f: F) -> Result<R, RuntimeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Err(RuntimeError::WouldDeadlock {
                name: self.name.clone(),
            });
        }
        if self.handle.get().is_none() {
            return Err(self.not_running());
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        if !self.post_async(async move {
            let _ = tx.send(f().await);
        }) {
            return Err(self.not_running());
        }
        rx.recv().map_err(|_| self.not_running())
    }

    /// Drain the queue of a wrapped thread for up to `timeout`. Returns false
    /// once the thread has been asked to quit.
    pub fn process_messages(&self, timeout: Duration) -> bool {
        if !self.is_current() {
            warn!(thread = %self.name, "process_messages called off-thread");
            return false;
        }
        let Some(runtime) = self.wrapped.as_ref() else {
            return false;
        };
        let Some(mut rx) = lock(&self.rx).take() else {
            // Re-entered from one of our own tasks.
            return false;
        };

        let keep_going = runtime.block_on(async {
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => return true,
                    command = rx.recv() => match command {
                        Some(Command::Run(task)) => task(),
                        Some(Command::Await(task)) => task.await,
                        Some(Command::Quit) | None => return false,
                    },
                }
            }
        });

        *lock(&self.rx) = Some(rx);
        keep_going
    }

    /// Ask the thread to finish. Tasks already queued behind this are dropped.
    pub fn quit(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Command::Quit);
        }
    }

    /// Quit and join. Never joins from the thread itself.
    pub fn stop(&self) {
        self.quit();
        if self.is_current() {
            return;
        }
        if let Some(join) = lock(&self.join).take() {
            if join.join().is_err() {
                error!(thread = %self.name, "Task thread panicked");
            } else {
                debug!(thread = %self.name, "Task thread stopped");
            }
        }
    }

    fn send(&self, command: Command) -> bool {
        if self.is_stopped() {
            debug!(thread = %self.name, "Dropping task posted to stopped thread");
            return false;
        }
        self.tx.send(command).is_ok()
    }

    fn send_delayed(&self, delay: Duration, command: Command) -> bool {
        let Some(handle) = self.handle.get() else {
            warn!(thread = %self.name, "Delayed task posted before thread start");
            return false;
        };
        if self.is_stopped() {
            return false;
        }
        let tx = self.tx.clone();
        let pending = Arc::clone(&self.pending_delayed);
        pending.fetch_add(1, Ordering::AcqRel);
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(command);
            pending.fetch_sub(1, Ordering::AcqRel);
        });
        true
    }

    fn not_running(&self) -> RuntimeError {
        RuntimeError::NotRunning {
            name: self.name.clone(),
        }
    }
}

impl Drop for TaskThread {
    fn drop(&mut self) {
        // May run inside another runtime's context, where a blocking
        // shutdown would panic.
        if let Some(runtime) = self.wrapped.take() {
            runtime.shutdown_background();
        }
    }
}

async fn drain(mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Run(task) => task(),
            Command::Await(task) => task.await,
            Command::Quit => break,
        }
    }
}

/// Owns the four task threads of one call session.
pub struct ThreadRuntime {
    main: Arc<TaskThread>,
    worker: Arc<TaskThread>,
    signaling: Arc<TaskThread>,
    network: Arc<TaskThread>,
    should_quit: Arc<AtomicBool>,
}

impl ThreadRuntime {
    /// Create the runtime, adopting the calling thread as the main thread.
    /// Worker, signaling and network threads are created but not started.
    pub fn new() -> Result<Arc<Self>, RuntimeError> {
        Ok(Arc::new(Self {
            main: TaskThread::wrap_current("main")?,
            worker: TaskThread::new("worker"),
            signaling: TaskThread::new("signaling"),
            network: TaskThread::new("network"),
            should_quit: Arc::new(AtomicBool::new(false)),
        }))
    }

    pub fn main(&self) -> &Arc<TaskThread> {
        &self.main
    }

    pub fn worker(&self) -> &Arc<TaskThread> {
        &self.worker
    }

    pub fn signaling(&self) -> &Arc<TaskThread> {
        &self.signaling
    }

    pub fn network(&self) -> &Arc<TaskThread> {
        &self.network
    }

    /// Start worker, signaling and network threads. Must run on the main thread.
    pub fn initialize(&self) -> Result<(), RuntimeError> {
        if !self.main.is_current() {
            error!("ThreadRuntime::initialize called off the main thread");
            return Err(RuntimeError::WrongThread("initialize"));
        }
        for thread in [&self.worker, &self.signaling, &self.network] {
            if let Err(e) = thread.start() {
                error!("Failed to start threads: {e}");
                return Err(e);
            }
        }
        info!("Thread runtime initialized");
        Ok(())
    }

    /// Pump the main thread until [`ThreadRuntime::quit`] is called, then
    /// clean up.
    pub fn run(self: &Arc<Self>) -> Result<(), RuntimeError> {
        if !self.main.is_current() {
            error!("ThreadRuntime::run called off the main thread");
            return Err(RuntimeError::WrongThread("run"));
        }

        let quit_event = Arc::new(Event::default());
        poll_quit_flag(
            Arc::clone(&self.network),
            Arc::clone(&self.should_quit),
            Arc::clone(&quit_event),
        );

        while !quit_event.wait(Duration::ZERO) && !self.should_quit() {
            if !self.main.process_messages(QUIT_POLL_INTERVAL) {
                break;
            }
        }

        self.cleanup_socket_server();
        Ok(())
    }

    /// Request shutdown of every thread. Returns true only for the call that
    /// actually flipped the flag.
    pub fn quit(&self) -> bool {
        if self.should_quit.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!("Thread runtime quitting");
        self.network.quit();
        self.worker.quit();
        self.signaling.quit();
        self.main.quit();
        true
    }

    pub fn should_quit(&self) -> bool {
        self.should_quit.load(Ordering::Acquire)
    }

    /// Stop threads in reverse order of creation. Reposts itself onto the
    /// main thread when called elsewhere; repeated calls are no-ops.
    pub fn cleanup_socket_server(self: &Arc<Self>) {
        if !self.main.is_current() {
            let weak: Weak<Self> = Arc::downgrade(self);
            self.main.post(move || {
                if let Some(runtime) = weak.upgrade() {
                    runtime.cleanup_socket_server();
                }
            });
            return;
        }
        self.stop_threads();
    }

    fn stop_threads(&self) {
        self.network.stop();
        self.worker.stop();
        self.signaling.stop();
        self.main.quit();
    }
}

impl Drop for ThreadRuntime {
    fn drop(&mut self) {
        self.quit();
        self.stop_threads();
    }
}

fn poll_quit_flag(network: Arc<TaskThread>, flag: Arc<AtomicBool>, event: Arc<Event>) {
    if flag.load(Ordering::Acquire) {
        event.set();
        return;
    }
    let thread = Arc::clone(&network);
    network.post_delayed(QUIT_POLL_INTERVAL, move || {
        poll_quit_flag(thread, flag, event)
    });
}
