//! Per-stream encoder worker
//!
//! Every encoded stream runs on its own thread. The worker gates whether
//! upstream may hand it new samples, tracks pause and end-of-stream state,
//! and holds its thread at a startup barrier until the controller has wired
//! all sibling streams.
//!
//! State is split in two: the source of truth (`paused`, `auto_stop`,
//! `end_of_source_stream` and the queue) lives behind one mutex, while the
//! derived `can_push_frame` flag is published through an atomic so producers
//! can read it without locking.

use crate::capture::{AdmissionControl, MediaSample, SourceId};
use crate::recorder::barrier::StartupBarrier;
use crate::recorder::binding::{self, SourceLink};
use crate::utils::{RecorderError, RecorderResult, SessionError, Signal};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Where a worker is in its lifecycle, as seen by its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Thread not yet past the startup barrier
    Starting,
    /// Processing loop running
    Encoding,
    /// Thread has exited
    Finished,
}

/// Stream-specific queue kept under the worker's loop lock
pub trait StreamQueue: Send + 'static {
    type Sample: MediaSample;
    type Item: Send + 'static;

    /// Returns false if the sample was dropped
    fn push(&mut self, sample: Self::Sample) -> bool;

    /// Called instead of `push` for samples arriving while paused
    fn skip_paused(&mut self) {}

    fn pop(&mut self) -> Option<Self::Item>;

    /// Stream-specific readiness predicate, e.g. "the codec has input room"
    fn can_accept(&self, phase: WorkerPhase) -> bool;
}

/// Work done on the worker thread
pub trait StreamProcessor<Item>: Send {
    /// One-time setup before the startup barrier
    fn init(&mut self) -> Result<(), SessionError>;

    fn process(&mut self, item: Item);

    /// Flush after the queue is drained
    fn cleanup(&mut self);
}

pub struct LoopData<Q> {
    pub paused: bool,
    pub auto_stop: bool,
    pub end_of_source_stream: bool,
    exit: bool,
    pub queue: Q,
}

/// Type-erased worker surface used by the engine
pub trait EncoderThread: Send + Sync {
    fn name(&self) -> &str;
    fn start_thread(self: Arc<Self>) -> RecorderResult<()>;
    fn start_encoding(&self, proceed: bool);
    fn set_paused(&self, paused: bool);
    fn set_auto_stop(&self, auto_stop: bool);
    fn is_initialized(&self) -> bool;
    fn is_end_of_source_stream(&self) -> bool;
    fn disconnect_source(&self);
    fn stop_and_join(&self);
    fn initialized(&self) -> &Signal<()>;
    fn end_of_source_stream(&self) -> &Signal<()>;
}

pub struct StreamWorker<Q: StreamQueue> {
    name: String,
    loop_data: Mutex<LoopData<Q>>,
    data_ready: Condvar,
    can_push_frame: AtomicBool,
    initialized: AtomicBool,
    encoding_started: AtomicBool,
    finished: AtomicBool,
    barrier: StartupBarrier,
    processor: Mutex<Option<Box<dyn StreamProcessor<Q::Item>>>>,
    thread: Mutex<Option<JoinHandle<()>>>,

    /// Written only by the controller while binding or unbinding
    source: Mutex<Option<Box<dyn SourceLink>>>,

    readiness_changed: Signal<bool>,
    end_of_source_stream_reached: Signal<()>,
    initialized_event: Signal<()>,
}

/// Exclusive access to the loop data.
///
/// Dropping the guard recomputes and publishes `can_push_frame`, releases
/// the lock, then emits notifications.
pub struct LoopDataGuard<'a, Q: StreamQueue> {
    worker: &'a StreamWorker<Q>,
    data: Option<MutexGuard<'a, LoopData<Q>>>,
    end_of_stream_reached: bool,
}

impl<'a, Q: StreamQueue> LoopDataGuard<'a, Q> {
    fn wait(&mut self, condvar: &Condvar) {
        if let Some(data) = self.data.as_mut() {
            condvar.wait(data);
        }
    }
}

impl<'a, Q: StreamQueue> Deref for LoopDataGuard<'a, Q> {
    type Target = LoopData<Q>;

    fn deref(&self) -> &LoopData<Q> {
        match &self.data {
            Some(data) => &**data,
            None => unreachable!("loop data used after release"),
        }
    }
}

impl<'a, Q: StreamQueue> DerefMut for LoopDataGuard<'a, Q> {
    fn deref_mut(&mut self) -> &mut LoopData<Q> {
        match &mut self.data {
            Some(data) => &mut **data,
            None => unreachable!("loop data used after release"),
        }
    }
}

impl<'a, Q: StreamQueue> Drop for LoopDataGuard<'a, Q> {
    fn drop(&mut self) {
        let Some(data) = self.data.take() else {
            return;
        };

        let can_push = self.worker.compute_can_push_frame(&data);
        let changed = self.worker.can_push_frame.swap(can_push, Ordering::SeqCst) != can_push;
        drop(data);

        if changed {
            self.worker.readiness_changed.emit(&can_push);
        }
        if self.end_of_stream_reached {
            self.worker.end_of_source_stream_reached.emit(&());
        }
    }
}

impl<Q: StreamQueue> StreamWorker<Q> {
    pub fn new(name: impl Into<String>, queue: Q) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            loop_data: Mutex::new(LoopData {
                paused: false,
                auto_stop: false,
                end_of_source_stream: false,
                exit: false,
                queue,
            }),
            data_ready: Condvar::new(),
            can_push_frame: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            encoding_started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            barrier: StartupBarrier::new(),
            processor: Mutex::new(None),
            thread: Mutex::new(None),
            source: Mutex::new(None),
            readiness_changed: Signal::new(),
            end_of_source_stream_reached: Signal::new(),
            initialized_event: Signal::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_loop_data(&self) -> LoopDataGuard<'_, Q> {
        LoopDataGuard {
            worker: self,
            data: Some(self.loop_data.lock()),
            end_of_stream_reached: false,
        }
    }

    /// Lock-free; safe on the producer's hot path
    pub fn can_push_frame(&self) -> bool {
        self.can_push_frame.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.lock_loop_data().paused = paused;
    }

    pub fn set_auto_stop(&self, auto_stop: bool) {
        self.lock_loop_data().auto_stop = auto_stop;
    }

    /// Always notifies end of stream, whether or not readiness changed
    pub fn set_end_of_source_stream(&self) {
        let mut data = self.lock_loop_data();
        data.end_of_source_stream = true;
        data.end_of_stream_reached = true;
    }

    pub fn is_end_of_source_stream(&self) -> bool {
        self.loop_data.lock().end_of_source_stream
    }

    pub fn is_paused(&self) -> bool {
        self.loop_data.lock().paused
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_encoding_started(&self) -> bool {
        self.encoding_started.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Fired with the new value whenever `can_push_frame` flips
    pub fn readiness_changed(&self) -> &Signal<bool> {
        &self.readiness_changed
    }

    pub fn end_of_source_stream(&self) -> &Signal<()> {
        &self.end_of_source_stream_reached
    }

    pub fn initialized(&self) -> &Signal<()> {
        &self.initialized_event
    }

    /// Enqueue a sample from the bound source, in the producer's thread
    pub fn add_sample(&self, sample: Q::Sample) {
        if !sample.is_valid() {
            self.set_end_of_source_stream();
            return;
        }

        {
            let mut data = self.lock_loop_data();
            data.end_of_source_stream = false;

            if data.paused {
                data.queue.skip_paused();
                return;
            }

            if !data.queue.push(sample) {
                tracing::debug!("{}: queue full, sample dropped", self.name);
                return;
            }
        }

        self.data_ready.notify_one();
    }

    pub(crate) fn set_processor(&self, processor: Box<dyn StreamProcessor<Q::Item>>) {
        *self.processor.lock() = Some(processor);
    }

    /// Spawn the worker thread; it stops at the startup barrier
    pub fn start(self: &Arc<Self>) -> RecorderResult<()> {
        let processor = self.processor.lock().take().ok_or_else(|| {
            RecorderError::InvalidState(format!("{} has no processor or already started", self.name))
        })?;

        let worker = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker.run(processor))?;
        *self.thread.lock() = Some(handle);

        tracing::debug!("{} thread started", self.name);
        Ok(())
    }

    /// Release the startup barrier; `false` makes the thread exit at once
    pub fn start_encoding(&self, proceed: bool) {
        if self.barrier.release(proceed) {
            tracing::debug!("{}: start encoding (proceed: {})", self.name, proceed);
        }
    }

    /// Ask the loop to exit once the queue is drained
    pub fn request_stop(&self) {
        self.lock_loop_data().exit = true;
        self.data_ready.notify_all();
        self.barrier.release(false);
    }

    pub fn stop_and_join(&self) {
        self.request_stop();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("{} thread panicked", self.name);
            }
        }
    }

    pub fn bound_source(&self) -> Option<SourceId> {
        self.source.lock().as_ref().map(|link| link.source_id())
    }

    /// Hands the link back if another source got bound first
    pub(crate) fn bind_source_link(
        &self,
        link: Box<dyn SourceLink>,
    ) -> Result<(), Box<dyn SourceLink>> {
        let mut source = self.source.lock();
        if source.is_some() {
            return Err(link);
        }
        *source = Some(link);
        Ok(())
    }

    pub(crate) fn take_source_link(&self) -> Option<Box<dyn SourceLink>> {
        self.source.lock().take()
    }

    fn phase(&self) -> WorkerPhase {
        if self.finished.load(Ordering::SeqCst) {
            WorkerPhase::Finished
        } else if self.encoding_started.load(Ordering::SeqCst) {
            WorkerPhase::Encoding
        } else {
            WorkerPhase::Starting
        }
    }

    fn compute_can_push_frame(&self, data: &LoopData<Q>) -> bool {
        self.initialized.load(Ordering::SeqCst)
            && !data.paused
            && !(data.end_of_source_stream && data.auto_stop)
            && data.queue.can_accept(self.phase())
    }

    pub(crate) fn mark_initialized(&self) {
        let _data = self.lock_loop_data();
        self.initialized.store(true, Ordering::SeqCst);
    }

    fn mark_encoding_started(&self) {
        let _data = self.lock_loop_data();
        self.encoding_started.store(true, Ordering::SeqCst);
    }

    fn mark_finished(&self) {
        let _data = self.lock_loop_data();
        self.finished.store(true, Ordering::SeqCst);
    }

    fn init(&self, processor: &mut dyn StreamProcessor<Q::Item>) -> bool {
        if let Err(error) = processor.init() {
            tracing::warn!("{} failed to initialize: {}", self.name, error);
            return false;
        }

        self.mark_initialized();
        self.initialized_event.emit(&());

        self.barrier.wait()
    }

    fn run(self: Arc<Self>, mut processor: Box<dyn StreamProcessor<Q::Item>>) {
        if !self.init(processor.as_mut()) {
            tracing::debug!("{} exits without encoding", self.name);
            self.mark_finished();
            return;
        }

        self.mark_encoding_started();

        loop {
            let item = {
                let mut data = self.lock_loop_data();
                loop {
                    if let Some(item) = data.queue.pop() {
                        break Some(item);
                    }
                    if data.exit {
                        break None;
                    }
                    data.wait(&self.data_ready);
                }
            };

            match item {
                Some(item) => processor.process(item),
                None => break,
            }
        }

        processor.cleanup();
        self.mark_finished();
        tracing::debug!("{} thread finished", self.name);
    }
}

impl<Q: StreamQueue> AdmissionControl for StreamWorker<Q> {
    fn can_push_frame(&self) -> bool {
        StreamWorker::can_push_frame(self)
    }
}

impl<Q: StreamQueue> EncoderThread for StreamWorker<Q> {
    fn name(&self) -> &str {
        StreamWorker::name(self)
    }

    fn start_thread(self: Arc<Self>) -> RecorderResult<()> {
        StreamWorker::start(&self)
    }

    fn start_encoding(&self, proceed: bool) {
        StreamWorker::start_encoding(self, proceed)
    }

    fn set_paused(&self, paused: bool) {
        StreamWorker::set_paused(self, paused)
    }

    fn set_auto_stop(&self, auto_stop: bool) {
        StreamWorker::set_auto_stop(self, auto_stop)
    }

    fn is_initialized(&self) -> bool {
        StreamWorker::is_initialized(self)
    }

    fn is_end_of_source_stream(&self) -> bool {
        StreamWorker::is_end_of_source_stream(self)
    }

    fn disconnect_source(&self) {
        binding::disconnect_encoder_from_source(self);
    }

    fn stop_and_join(&self) {
        StreamWorker::stop_and_join(self)
    }

    fn initialized(&self) -> &Signal<()> {
        StreamWorker::initialized(self)
    }

    fn end_of_source_stream(&self) -> &Signal<()> {
        StreamWorker::end_of_source_stream(self)
    }
}

impl<Q: StreamQueue> Drop for StreamWorker<Q> {
    fn drop(&mut self) {
        self.barrier.release(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::wait_until;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct TestSample(pub Option<u32>);

    impl MediaSample for TestSample {
        fn is_valid(&self) -> bool {
            self.0.is_some()
        }
    }

    /// Queue whose readiness predicate is driven by the test
    pub(crate) struct TestQueue {
        pub items: VecDeque<u32>,
        pub ready: Arc<AtomicBool>,
    }

    impl TestQueue {
        pub(crate) fn new(ready: bool) -> (Self, Arc<AtomicBool>) {
            let flag = Arc::new(AtomicBool::new(ready));
            (
                Self {
                    items: VecDeque::new(),
                    ready: flag.clone(),
                },
                flag,
            )
        }
    }

    impl StreamQueue for TestQueue {
        type Sample = TestSample;
        type Item = u32;

        fn push(&mut self, sample: TestSample) -> bool {
            match sample.0 {
                Some(value) => {
                    self.items.push_back(value);
                    true
                }
                None => false,
            }
        }

        fn pop(&mut self) -> Option<u32> {
            self.items.pop_front()
        }

        fn can_accept(&self, phase: WorkerPhase) -> bool {
            phase != WorkerPhase::Finished && self.ready.load(Ordering::SeqCst)
        }
    }

    pub(crate) struct CollectingProcessor {
        pub processed: Arc<Mutex<Vec<u32>>>,
        pub fail_init: bool,
    }

    impl StreamProcessor<u32> for CollectingProcessor {
        fn init(&mut self) -> Result<(), SessionError> {
            if self.fail_init {
                return Err(SessionError::new(
                    crate::utils::ErrorKind::ResourceError,
                    "cannot open codec",
                ));
            }
            Ok(())
        }

        fn process(&mut self, item: u32) {
            self.processed.lock().push(item);
        }

        fn cleanup(&mut self) {}
    }

    struct Counters {
        readiness: Arc<AtomicUsize>,
        end_of_stream: Arc<AtomicUsize>,
    }

    fn count_notifications(worker: &StreamWorker<TestQueue>) -> Counters {
        let readiness = Arc::new(AtomicUsize::new(0));
        let end_of_stream = Arc::new(AtomicUsize::new(0));

        let counter = readiness.clone();
        worker.readiness_changed().connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = end_of_stream.clone();
        worker.end_of_source_stream().connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        Counters {
            readiness,
            end_of_stream,
        }
    }

    #[test]
    fn test_readiness_derivation_over_all_combinations() {
        for bits in 0..32u32 {
            let initialized = bits & 1 != 0;
            let paused = bits & 2 != 0;
            let end_of_stream = bits & 4 != 0;
            let auto_stop = bits & 8 != 0;
            let queue_ready = bits & 16 != 0;

            let (queue, _) = TestQueue::new(queue_ready);
            let worker = StreamWorker::new("test-worker", queue);
            if initialized {
                worker.mark_initialized();
            }
            worker.set_paused(paused);
            worker.set_auto_stop(auto_stop);
            if end_of_stream {
                worker.set_end_of_source_stream();
            }

            let expected = initialized && !paused && !(end_of_stream && auto_stop) && queue_ready;
            assert_eq!(
                worker.can_push_frame(),
                expected,
                "initialized={initialized} paused={paused} eos={end_of_stream} \
                 auto_stop={auto_stop} ready={queue_ready}"
            );
        }
    }

    #[test]
    fn test_unchanged_readiness_is_not_notified() {
        let (queue, _) = TestQueue::new(true);
        let worker = StreamWorker::new("test-worker", queue);
        worker.mark_initialized();
        let counters = count_notifications(&worker);

        worker.set_paused(false);
        worker.set_auto_stop(true);
        assert_eq!(counters.readiness.load(Ordering::SeqCst), 0);

        worker.set_paused(true);
        assert_eq!(counters.readiness.load(Ordering::SeqCst), 1);
        worker.set_paused(true);
        assert_eq!(counters.readiness.load(Ordering::SeqCst), 1);
        worker.set_paused(false);
        assert_eq!(counters.readiness.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_auto_stop_change_notifies_once() {
        let (queue, _) = TestQueue::new(true);
        let worker = StreamWorker::new("test-worker", queue);
        worker.mark_initialized();
        worker.set_end_of_source_stream();
        assert!(worker.can_push_frame());
        let counters = count_notifications(&worker);

        worker.set_auto_stop(true);
        assert!(!worker.can_push_frame());
        assert_eq!(counters.readiness.load(Ordering::SeqCst), 1);

        worker.set_auto_stop(true);
        assert_eq!(counters.readiness.load(Ordering::SeqCst), 1);

        worker.set_auto_stop(false);
        assert!(worker.can_push_frame());
        assert_eq!(counters.readiness.load(Ordering::SeqCst), 2);
        assert_eq!(counters.end_of_stream.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_end_of_stream_always_notifies() {
        let (queue, _) = TestQueue::new(true);
        let worker = StreamWorker::new("test-worker", queue);
        worker.mark_initialized();
        let counters = count_notifications(&worker);

        // auto-stop off: readiness does not move
        worker.set_end_of_source_stream();
        worker.set_end_of_source_stream();

        assert_eq!(counters.end_of_stream.load(Ordering::SeqCst), 2);
        assert_eq!(counters.readiness.load(Ordering::SeqCst), 0);
        assert!(worker.can_push_frame());
    }

    #[test]
    fn test_end_of_stream_with_auto_stop_blocks_pushing() {
        let (queue, _) = TestQueue::new(true);
        let worker = StreamWorker::new("test-worker", queue);
        worker.mark_initialized();
        worker.set_auto_stop(true);
        assert!(worker.can_push_frame());

        let counters = count_notifications(&worker);
        worker.set_end_of_source_stream();

        assert!(!worker.can_push_frame());
        assert_eq!(counters.end_of_stream.load(Ordering::SeqCst), 1);
        assert_eq!(counters.readiness.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_sample_marks_end_and_valid_sample_resets_it() {
        let (queue, _) = TestQueue::new(true);
        let worker = StreamWorker::new("test-worker", queue);

        worker.add_sample(TestSample(None));
        assert!(worker.is_end_of_source_stream());

        worker.add_sample(TestSample(Some(1)));
        assert!(!worker.is_end_of_source_stream());
        assert_eq!(worker.lock_loop_data().queue.items.len(), 1);
    }

    #[test]
    fn test_paused_worker_drops_samples() {
        let (queue, _) = TestQueue::new(true);
        let worker = StreamWorker::new("test-worker", queue);
        worker.set_paused(true);

        worker.add_sample(TestSample(Some(7)));
        assert!(worker.lock_loop_data().queue.items.is_empty());
    }

    #[test]
    fn test_samples_wait_for_start_encoding() {
        let (queue, _) = TestQueue::new(true);
        let worker = StreamWorker::new("test-worker", queue);
        let processed = Arc::new(Mutex::new(Vec::new()));
        worker.set_processor(Box::new(CollectingProcessor {
            processed: processed.clone(),
            fail_init: false,
        }));

        worker.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || worker.is_initialized()));

        worker.add_sample(TestSample(Some(1)));
        worker.add_sample(TestSample(Some(2)));
        std::thread::sleep(Duration::from_millis(50));
        assert!(processed.lock().is_empty());
        assert!(!worker.is_encoding_started());

        worker.start_encoding(true);
        assert!(wait_until(Duration::from_secs(5), || processed.lock().len() == 2));
        assert_eq!(*processed.lock(), vec![1, 2]);

        worker.stop_and_join();
        assert!(worker.is_finished());
        assert!(!worker.can_push_frame());
    }

    #[test]
    fn test_start_encoding_false_exits_without_processing() {
        let (queue, _) = TestQueue::new(true);
        let worker = StreamWorker::new("test-worker", queue);
        let processed = Arc::new(Mutex::new(Vec::new()));
        worker.set_processor(Box::new(CollectingProcessor {
            processed: processed.clone(),
            fail_init: false,
        }));

        worker.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || worker.is_initialized()));
        worker.add_sample(TestSample(Some(1)));

        worker.start_encoding(false);
        assert!(wait_until(Duration::from_secs(5), || worker.is_finished()));
        worker.stop_and_join();

        assert!(processed.lock().is_empty());
        assert!(!worker.is_encoding_started());
    }

    #[test]
    fn test_failed_init_never_reports_initialized() {
        let (queue, _) = TestQueue::new(true);
        let worker = StreamWorker::new("test-worker", queue);
        let initialized = Arc::new(AtomicUsize::new(0));
        let counter = initialized.clone();
        worker.initialized().connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        worker.set_processor(Box::new(CollectingProcessor {
            processed: Arc::new(Mutex::new(Vec::new())),
            fail_init: true,
        }));

        worker.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || worker.is_finished()));
        worker.stop_and_join();

        assert!(!worker.is_initialized());
        assert_eq!(initialized.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (queue, _) = TestQueue::new(true);
        let worker = StreamWorker::new("test-worker", queue);
        worker.set_processor(Box::new(CollectingProcessor {
            processed: Arc::new(Mutex::new(Vec::new())),
            fail_init: false,
        }));

        worker.start().unwrap();
        assert!(matches!(worker.start(), Err(RecorderError::InvalidState(_))));
        worker.stop_and_join();
    }
}
