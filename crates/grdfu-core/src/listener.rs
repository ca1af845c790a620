//! Listener callbacks, their delivery context, and cooperative cancellation.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};

/// Receives session lifecycle callbacks. All calls arrive on one executor.
pub trait DfuListener: Send + Sync {
    fn on_start(&self) {}
    fn on_progress(&self, _message: &str, _percent: u8) {}
    fn on_complete(&self) {}
    fn on_error(&self, _message: &str) {}
    fn on_cancelled(&self, _percent: u8) {}
}

/// Ignores every callback.
pub struct NullListener;

impl DfuListener for NullListener {}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A serialized execution context for listener callbacks.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Runs jobs on the calling thread.
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, job: Job) {
        job();
    }
}

/// Runs jobs in order on one dedicated thread.
pub struct ThreadExecutor {
    tx: Option<mpsc::Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadExecutor {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            for job in rx {
                job();
            }
        })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }
}

impl Executor for ThreadExecutor {
    fn execute(&self, job: Job) {
        if let Some(tx) = &self.tx {
            if tx.send(job).is_err() {
                tracing::warn!("listener thread gone, callback dropped");
            }
        }
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        // Closing the channel ends the loop once queued jobs have run.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Posts listener callbacks through an executor.
#[derive(Clone)]
pub struct Notifier {
    listener: Arc<dyn DfuListener>,
    executor: Arc<dyn Executor>,
}

impl Notifier {
    pub fn new(listener: Arc<dyn DfuListener>, executor: Arc<dyn Executor>) -> Self {
        Self { listener, executor }
    }

    pub fn start(&self) {
        let l = self.listener.clone();
        self.executor.execute(Box::new(move || l.on_start()));
    }

    pub fn progress(&self, message: &str, percent: u8) {
        let l = self.listener.clone();
        let message = message.to_string();
        self.executor
            .execute(Box::new(move || l.on_progress(&message, percent)));
    }

    pub fn complete(&self) {
        let l = self.listener.clone();
        self.executor.execute(Box::new(move || l.on_complete()));
    }

    pub fn error(&self, message: &str) {
        let l = self.listener.clone();
        let message = message.to_string();
        self.executor.execute(Box::new(move || l.on_error(&message)));
    }

    pub fn cancelled(&self, percent: u8) {
        let l = self.listener.clone();
        self.executor
            .execute(Box::new(move || l.on_cancelled(percent)));
    }
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Progress channel handed to the engines.
///
/// Cancellation is only observed when the engine reports progress, i.e.
/// between chunks.
pub struct ProgressReporter {
    notifier: Notifier,
    cancel: CancelToken,
    percent: AtomicU8,
}

impl ProgressReporter {
    pub fn new(notifier: Notifier, cancel: CancelToken) -> Self {
        Self {
            notifier,
            cancel,
            percent: AtomicU8::new(0),
        }
    }

    /// Report progress; `Break` once the session has been cancelled.
    pub fn report(&self, message: &str, percent: u8) -> ControlFlow<()> {
        if self.cancel.is_cancelled() {
            return ControlFlow::Break(());
        }
        let percent = percent.min(100);
        self.percent.store(percent, Ordering::SeqCst);
        self.notifier.progress(message, percent);
        ControlFlow::Continue(())
    }

    /// Progress callback for chunked writes: reports `message` whenever the
    /// percentage changes and stops the write once cancelled.
    pub fn throttled<'a>(&'a self, message: &'a str) -> impl FnMut(u8) -> ControlFlow<()> + 'a {
        let mut last = None;
        move |percent| {
            if self.is_cancelled() {
                return ControlFlow::Break(());
            }
            if last == Some(percent) {
                return ControlFlow::Continue(());
            }
            last = Some(percent);
            self.report(message, percent)
        }
    }

    /// Last percentage reported.
    pub fn percent(&self) -> u8 {
        self.percent.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Percent of `done` out of `total`, integer arithmetic.
pub fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done as u64 * 100) / total as u64).min(100) as u8
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Call {
        Start,
        Progress(String, u8),
        Complete,
        Error(String),
        Cancelled(u8),
    }

    #[derive(Default)]
    pub(crate) struct RecordingListener {
        pub calls: Mutex<Vec<Call>>,
    }

    impl RecordingListener {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn percents(&self) -> Vec<u8> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Progress(_, p) => Some(p),
                    _ => None,
                })
                .collect()
        }
    }

    impl DfuListener for RecordingListener {
        fn on_start(&self) {
            self.calls.lock().unwrap().push(Call::Start);
        }
        fn on_progress(&self, message: &str, percent: u8) {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Progress(message.to_string(), percent));
        }
        fn on_complete(&self) {
            self.calls.lock().unwrap().push(Call::Complete);
        }
        fn on_error(&self, message: &str) {
            self.calls.lock().unwrap().push(Call::Error(message.to_string()));
        }
        fn on_cancelled(&self, percent: u8) {
            self.calls.lock().unwrap().push(Call::Cancelled(percent));
        }
    }

    #[test]
    fn test_reporter_stops_after_cancel() {
        let listener = Arc::new(RecordingListener::default());
        let notifier = Notifier::new(listener.clone(), Arc::new(InlineExecutor));
        let cancel = CancelToken::new();
        let reporter = ProgressReporter::new(notifier, cancel.clone());

        assert!(reporter.report("Downloading...", 40).is_continue());
        cancel.cancel();
        assert!(reporter.report("Downloading...", 60).is_break());
        assert_eq!(reporter.percent(), 40);
        assert_eq!(
            listener.calls(),
            vec![Call::Progress("Downloading...".into(), 40)]
        );
    }

    #[test]
    fn test_thread_executor_preserves_order() {
        let listener = Arc::new(RecordingListener::default());
        {
            let exec = Arc::new(ThreadExecutor::new("main").unwrap());
            let notifier = Notifier::new(listener.clone(), exec);
            notifier.start();
            for p in [10, 20, 30] {
                notifier.progress("step", p);
            }
            notifier.complete();
        }
        // Executor dropped: all queued callbacks have run.
        let calls = listener.calls();
        assert_eq!(calls.first(), Some(&Call::Start));
        assert_eq!(calls.last(), Some(&Call::Complete));
        assert_eq!(listener.percents(), vec![10, 20, 30]);
    }

    #[test]
    fn test_throttled_skips_repeats() {
        let listener = Arc::new(RecordingListener::default());
        let notifier = Notifier::new(listener.clone(), Arc::new(InlineExecutor));
        let cancel = CancelToken::new();
        let reporter = ProgressReporter::new(notifier, cancel.clone());
        {
            let mut progress = reporter.throttled("Downloading...");
            for p in [1, 1, 2, 2, 2, 3] {
                assert!(progress(p).is_continue());
            }
            cancel.cancel();
            assert!(progress(4).is_break());
        }
        assert_eq!(listener.percents(), vec![1, 2, 3]);
        assert_eq!(reporter.percent(), 3);
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(0, 4096), 0);
        assert_eq!(percent_of(1024, 4096), 25);
        assert_eq!(percent_of(4096, 4096), 100);
        assert_eq!(percent_of(5, 0), 100);
    }
}
