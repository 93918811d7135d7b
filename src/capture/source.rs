//! Capture sources as seen by the recording core
//!
//! The capture layer owns the sources and drives them from its own threads.
//! Each source exposes a "new sample" event, a "destroyed" event and an
//! admission-control slot holding whoever currently gates its production.

use crate::capture::traits::{
    AudioBuffer, AudioDeviceInfo, AudioFormat, MediaSample, VideoFrame, VideoFrameFormat,
};
use crate::utils::{ConnectionId, ContextHandle, Signal};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Weak;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique source identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(u64);

impl SourceId {
    fn next() -> Self {
        Self(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Answers whether a producer may push another sample right now
pub trait AdmissionControl: Send + Sync {
    fn can_push_frame(&self) -> bool;
}

/// State and events shared by every source kind
pub struct SourceCore<S: MediaSample> {
    id: SourceId,
    context: ContextHandle,
    new_sample: Signal<S>,
    admission_updated: Signal<()>,
    destroyed: Signal<SourceId>,
    admission: Mutex<Option<Weak<dyn AdmissionControl>>>,
}

impl<S: MediaSample> SourceCore<S> {
    pub fn new(context: ContextHandle) -> Self {
        Self {
            id: SourceId::next(),
            context,
            new_sample: Signal::new(),
            admission_updated: Signal::new(),
            destroyed: Signal::new(),
            admission: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    /// The execution context the source's notifications are delivered in
    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    pub fn new_sample(&self) -> &Signal<S> {
        &self.new_sample
    }

    /// Fired when the answer of `can_push_frame` may have changed
    pub fn admission_updated(&self) -> &Signal<()> {
        &self.admission_updated
    }

    pub fn destroyed(&self) -> &Signal<SourceId> {
        &self.destroyed
    }

    /// Hand a sample to whoever is listening, in the caller's thread
    pub fn push(&self, sample: S) {
        self.new_sample.emit(&sample);
    }

    /// False while nobody gates the source
    pub fn can_push_frame(&self) -> bool {
        let admission = self.admission.lock().clone();
        admission
            .and_then(|weak| weak.upgrade())
            .map(|control| control.can_push_frame())
            .unwrap_or(false)
    }

    pub fn has_admission_control(&self) -> bool {
        self.admission
            .lock()
            .as_ref()
            .map(|weak| weak.strong_count() > 0)
            .unwrap_or(false)
    }

    pub(crate) fn replace_admission_control(
        &self,
        control: Option<Weak<dyn AdmissionControl>>,
    ) -> Option<Weak<dyn AdmissionControl>> {
        std::mem::replace(&mut *self.admission.lock(), control)
    }
}

impl<S: MediaSample> Drop for SourceCore<S> {
    fn drop(&mut self) {
        self.destroyed.emit(&self.id);
    }
}

/// Common surface the binding and the initializer work against
pub trait MediaSource: Send + Sync + 'static {
    type Sample: MediaSample;

    /// Human-readable kind, used in logs and error messages
    const DESCRIPTION: &'static str;

    fn core(&self) -> &SourceCore<Self::Sample>;

    fn id(&self) -> SourceId {
        self.core().id()
    }

    /// Connect a listener fired when the source stops producing without
    /// sending an end marker. Sources that cannot deactivate return `None`.
    fn connect_deactivated<F>(&self, _listener: F) -> Option<ConnectionId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        None
    }

    fn disconnect_deactivated(&self, _id: ConnectionId) {}
}

/// Source of raw audio buffers pushed by an external producer
pub struct AudioBufferInput {
    core: SourceCore<AudioBuffer>,
    format: Mutex<Option<AudioFormat>>,
}

impl AudioBufferInput {
    /// `format` is `None` when it is only revealed by the first buffer
    pub fn new(context: ContextHandle, format: Option<AudioFormat>) -> Self {
        Self {
            core: SourceCore::new(context),
            format: Mutex::new(format),
        }
    }

    pub fn audio_format(&self) -> Option<AudioFormat> {
        *self.format.lock()
    }

    pub fn set_audio_format(&self, format: Option<AudioFormat>) {
        *self.format.lock() = format;
    }

    pub fn push_buffer(&self, buffer: AudioBuffer) {
        self.core.push(buffer);
    }

    pub fn can_push_frame(&self) -> bool {
        self.core.can_push_frame()
    }
}

impl MediaSource for AudioBufferInput {
    type Sample = AudioBuffer;
    const DESCRIPTION: &'static str = "audio buffer input";

    fn core(&self) -> &SourceCore<AudioBuffer> {
        &self.core
    }
}

/// Audio captured from a device whose format is known up front
pub struct AudioDeviceInput {
    core: SourceCore<AudioBuffer>,
    device: Option<AudioDeviceInfo>,
    running: AtomicBool,
}

impl AudioDeviceInput {
    pub fn new(context: ContextHandle, device: Option<AudioDeviceInfo>) -> Self {
        Self {
            core: SourceCore::new(context),
            device,
            running: AtomicBool::new(false),
        }
    }

    pub fn device(&self) -> Option<&AudioDeviceInfo> {
        self.device.as_ref()
    }

    pub fn set_running(&self, running: bool) {
        if self.running.swap(running, Ordering::SeqCst) != running {
            tracing::debug!(
                "Audio device input {} {}",
                self.core.id(),
                if running { "started" } else { "stopped" }
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn push_buffer(&self, buffer: AudioBuffer) {
        self.core.push(buffer);
    }
}

impl MediaSource for AudioDeviceInput {
    type Sample = AudioBuffer;
    const DESCRIPTION: &'static str = "audio device input";

    fn core(&self) -> &SourceCore<AudioBuffer> {
        &self.core
    }
}

/// Camera, screen or externally pushed video frames
pub struct VideoFrameInput {
    core: SourceCore<VideoFrame>,
    format: Mutex<Option<VideoFrameFormat>>,
    active: AtomicBool,
    error: Mutex<Option<String>>,
    active_changed: Signal<bool>,
    error_changed: Signal<Option<String>>,
}

impl VideoFrameInput {
    /// `format` is `None` when it is only revealed by the first frame
    pub fn new(context: ContextHandle, format: Option<VideoFrameFormat>) -> Self {
        Self {
            core: SourceCore::new(context),
            format: Mutex::new(format),
            active: AtomicBool::new(true),
            error: Mutex::new(None),
            active_changed: Signal::new(),
            error_changed: Signal::new(),
        }
    }

    pub fn frame_format(&self) -> Option<VideoFrameFormat> {
        *self.format.lock()
    }

    pub fn set_frame_format(&self, format: Option<VideoFrameFormat>) {
        *self.format.lock() = format;
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        if self.active.swap(active, Ordering::SeqCst) != active {
            self.active_changed.emit(&active);
        }
    }

    pub fn active_changed(&self) -> &Signal<bool> {
        &self.active_changed
    }

    pub fn has_error(&self) -> bool {
        self.error.lock().is_some()
    }

    pub fn error_string(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub fn set_error(&self, error: Option<String>) {
        let changed = {
            let mut current = self.error.lock();
            let changed = *current != error;
            *current = error.clone();
            changed
        };

        if changed {
            self.error_changed.emit(&error);
        }
    }

    pub fn error_changed(&self) -> &Signal<Option<String>> {
        &self.error_changed
    }

    pub fn push_frame(&self, frame: VideoFrame) {
        self.core.push(frame);
    }

    pub fn can_push_frame(&self) -> bool {
        self.core.can_push_frame()
    }
}

impl MediaSource for VideoFrameInput {
    type Sample = VideoFrame;
    const DESCRIPTION: &'static str = "video source";

    fn core(&self) -> &SourceCore<VideoFrame> {
        &self.core
    }

    fn connect_deactivated<F>(&self, listener: F) -> Option<ConnectionId>
    where
        F: Fn() + Send + Sync + 'static,
    {
        Some(self.active_changed.connect(move |active| {
            if !*active {
                listener();
            }
        }))
    }

    fn disconnect_deactivated(&self, id: ConnectionId) {
        self.active_changed.disconnect(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::EventLoop;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct Always(bool);

    impl AdmissionControl for Always {
        fn can_push_frame(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn test_ungated_source_cannot_push() {
        let event_loop = EventLoop::new();
        let source = AudioBufferInput::new(event_loop.handle(), None);
        assert!(!source.can_push_frame());
        assert!(!source.core().has_admission_control());
    }

    #[test]
    fn test_admission_follows_installed_control() {
        let event_loop = EventLoop::new();
        let source = VideoFrameInput::new(event_loop.handle(), None);
        let control: Arc<dyn AdmissionControl> = Arc::new(Always(true));

        source
            .core()
            .replace_admission_control(Some(Arc::downgrade(&control)));
        assert!(source.can_push_frame());

        drop(control);
        assert!(!source.can_push_frame());
    }

    #[test]
    fn test_drop_emits_destroyed() {
        let event_loop = EventLoop::new();
        let source = AudioBufferInput::new(event_loop.handle(), None);
        let expected = source.id();
        let seen = Arc::new(Mutex::new(None));

        let slot = seen.clone();
        source.core().destroyed().connect(move |id| *slot.lock() = Some(*id));
        drop(source);

        assert_eq!(*seen.lock(), Some(expected));
    }

    #[test]
    fn test_deactivation_listener_ignores_activation() {
        let event_loop = EventLoop::new();
        let source = VideoFrameInput::new(event_loop.handle(), None);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        source.connect_deactivated(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        source.set_active(false);
        source.set_active(false);
        source.set_active(true);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_change_is_reported_once() {
        let event_loop = EventLoop::new();
        let source = VideoFrameInput::new(event_loop.handle(), None);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        source.error_changed().connect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        source.set_error(Some("device lost".to_string()));
        source.set_error(Some("device lost".to_string()));

        assert!(source.has_error());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
