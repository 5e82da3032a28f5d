// Bounded single-consumer work queue on a dedicated thread, with an
// optional periodic wake-up and duplicate-suppressing enqueue.
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

struct WorkerState<R> {
    queue: VecDeque<R>,
    stop_requested: bool,
    consume_all: bool,
}

struct WorkerShared<R> {
    state: Mutex<WorkerState<R>>,
    condvar: Condvar,
}

/// Cloneable handle into a worker's queue and stop flag, usable from inside
/// the worker's own callback.
pub struct WorkerHandle<R> {
    shared: Arc<WorkerShared<R>>,
}

impl<R> Clone for WorkerHandle<R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<R> WorkerHandle<R> {
    /// Appends unconditionally and wakes the consumer.
    pub fn push_request(&self, req: R) {
        let mut state = self.shared.state.lock().unwrap();
        state.queue.push_back(req);
        drop(state);
        self.shared.condvar.notify_one();
    }

    /// Appends unless an already-queued entry satisfies `check_dup`.
    /// Returns false when the new entry was dropped as a duplicate.
    pub fn push_request_conditional<P>(&self, req: R, check_dup: P) -> bool
    where
        P: Fn(&R) -> bool,
    {
        let mut state = self.shared.state.lock().unwrap();
        if state.queue.iter().any(check_dup) {
            return false;
        }
        state.queue.push_back(req);
        drop(state);
        self.shared.condvar.notify_one();
        true
    }

    /// Signals the consumer loop to exit without joining it; safe to call
    /// from the worker callback itself.
    pub fn request_stop(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.stop_requested = true;
        drop(state);
        self.shared.condvar.notify_all();
    }
}

/// A worker owning one consumer thread and a FIFO request queue.
///
/// Dropping the worker signals stop, joins the thread and discards any
/// residual queue items.
pub struct TaskWorker<R> {
    shared: Arc<WorkerShared<R>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl<R: Send + 'static> TaskWorker<R> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                state: Mutex::new(WorkerState {
                    queue: VecDeque::new(),
                    stop_requested: false,
                    consume_all: false,
                }),
                condvar: Condvar::new(),
            }),
            thread: None,
        }
    }

    /// When set, a stop signal lets the consumer drain the queue before
    /// exiting instead of abandoning it.
    pub fn set_consume_all_requests(&self, consume_all: bool) {
        self.shared.state.lock().unwrap().consume_all = consume_all;
    }

    pub fn handle(&self) -> WorkerHandle<R> {
        WorkerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn push_request(&self, req: R) {
        self.handle().push_request(req);
    }

    pub fn push_request_conditional<P>(&self, req: R, check_dup: P) -> bool
    where
        P: Fn(&R) -> bool,
    {
        self.handle().push_request_conditional(req, check_dup)
    }

    fn assert_not_started(&self) {
        // Starting a worker twice is a programming error.
        assert!(self.thread.is_none(), "task worker already started");
    }

    /// Pure worker mode: `f` runs once per queued request.
    pub fn start<F>(&mut self, mut f: F)
    where
        F: FnMut(R) + Send + 'static,
    {
        self.assert_not_started();
        self.shared.state.lock().unwrap().stop_requested = false;

        let shared = self.shared.clone();
        self.thread = Some(thread::spawn(move || {
            loop {
                let mut state = shared.state.lock().unwrap();
                state = shared
                    .condvar
                    .wait_while(state, |s| s.queue.is_empty() && !s.stop_requested)
                    .unwrap();

                if state.stop_requested && (state.queue.is_empty() || !state.consume_all) {
                    break;
                }

                let Some(req) = state.queue.pop_front() else {
                    continue;
                };
                drop(state);

                f(req);
            }

            shared.state.lock().unwrap().queue.clear();
        }));
    }

    /// Periodic worker mode: `f(None)` fires once on start and again after
    /// every quiet `period`; queued requests arrive as `f(Some(req))`.
    pub fn start_periodic<F>(&mut self, period: Duration, mut f: F)
    where
        F: FnMut(Option<R>) + Send + 'static,
    {
        self.assert_not_started();
        self.shared.state.lock().unwrap().stop_requested = false;

        let shared = self.shared.clone();
        self.thread = Some(thread::spawn(move || {
            f(None);

            loop {
                let state = shared.state.lock().unwrap();
                let (mut state, _timeout) = shared
                    .condvar
                    .wait_timeout_while(state, period, |s| {
                        s.queue.is_empty() && !s.stop_requested
                    })
                    .unwrap();

                if state.stop_requested && (state.queue.is_empty() || !state.consume_all) {
                    break;
                }

                let req = state.queue.pop_front();
                drop(state);

                f(req);
            }

            shared.state.lock().unwrap().queue.clear();
        }));
    }

    /// Signals stop and joins the consumer thread.
    pub fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop_requested = true;
        }
        self.shared.condvar.notify_all();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl<R> Drop for TaskWorker<R> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop_requested = true;
        }
        self.shared.condvar.notify_all();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl<R: Send + 'static> Default for TaskWorker<R> {
    fn default() -> Self {
        Self::new()
    }
}
