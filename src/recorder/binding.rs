//! Wiring between capture sources and stream workers
//!
//! One generic implementation serves every source kind. Samples flow
//! directly from the producer into the worker; readiness flows back as a
//! queued "admission updated" notification in the source's own context.

use crate::capture::{AdmissionControl, MediaSource, SourceId};
use crate::recorder::worker::{StreamQueue, StreamWorker};
use crate::utils::{ConnectionId, RecorderError, RecorderResult, Signal};
use std::sync::{Arc, Weak};

/// A live binding, held by the worker it feeds
pub trait SourceLink: Send + Sync {
    fn source_id(&self) -> SourceId;

    /// Sever every connection made by the binding
    fn detach(&self, readiness: &Signal<bool>);
}

struct Binding<Src: MediaSource> {
    source: Weak<Src>,
    source_id: SourceId,
    sample_connection: ConnectionId,
    deactivated_connection: Option<ConnectionId>,
    readiness_connection: ConnectionId,
}

impl<Src: MediaSource> SourceLink for Binding<Src> {
    fn source_id(&self) -> SourceId {
        self.source_id
    }

    fn detach(&self, readiness: &Signal<bool>) {
        readiness.disconnect(self.readiness_connection);

        let Some(source) = self.source.upgrade() else {
            return;
        };
        source.core().new_sample().disconnect(self.sample_connection);
        if let Some(id) = self.deactivated_connection {
            source.disconnect_deactivated(id);
        }
        set_admission_control(&source, None);
    }
}

/// Bind `source` to `worker`. A worker feeds from one source at a time.
pub fn connect_encoder_to_source<Q, Src>(
    worker: &Arc<StreamWorker<Q>>,
    source: &Arc<Src>,
) -> RecorderResult<()>
where
    Q: StreamQueue<Sample = Src::Sample>,
    Src: MediaSource,
{
    if let Some(existing) = worker.bound_source() {
        tracing::warn!(
            "{} is already bound to {}, refusing {}",
            worker.name(),
            existing,
            source.id()
        );
        return Err(RecorderError::AlreadyBound(existing));
    }

    let target = Arc::downgrade(worker);
    let sample_connection = source.core().new_sample().connect(move |sample| {
        if let Some(worker) = target.upgrade() {
            worker.add_sample(sample.clone());
        }
    });

    let target = Arc::downgrade(worker);
    let deactivated_connection = source.connect_deactivated(move || {
        if let Some(worker) = target.upgrade() {
            worker.set_end_of_source_stream();
        }
    });

    let context = source.core().context().clone();
    let weak_source = Arc::downgrade(source);
    let readiness_connection = worker.readiness_changed().connect(move |_| {
        let weak_source = weak_source.clone();
        context.post(move || {
            if let Some(source) = weak_source.upgrade() {
                source.core().admission_updated().emit(&());
            }
        });
    });

    let link = Binding {
        source: Arc::downgrade(source),
        source_id: source.id(),
        sample_connection,
        deactivated_connection,
        readiness_connection,
    };

    if let Err(link) = worker.bind_source_link(Box::new(link)) {
        link.detach(worker.readiness_changed());
        let existing = worker.bound_source().unwrap_or_else(|| link.source_id());
        return Err(RecorderError::AlreadyBound(existing));
    }

    let control: Arc<dyn AdmissionControl> = worker.clone();
    set_admission_control(source, Some(Arc::downgrade(&control)));

    tracing::debug!("Bound {} {} to {}", Src::DESCRIPTION, source.id(), worker.name());
    Ok(())
}

/// Unbind whatever source feeds `worker`; no-op when unbound.
///
/// Clears the worker's source reference, so `bound_source()` is `None`
/// afterwards and the worker may be bound again.
pub fn disconnect_encoder_from_source<Q: StreamQueue>(worker: &StreamWorker<Q>) {
    let Some(link) = worker.take_source_link() else {
        return;
    };

    link.detach(worker.readiness_changed());
    tracing::debug!("Unbound {} from {}", link.source_id(), worker.name());
}

/// Install or clear the capability gating `source`.
///
/// Installing defers the admission notification to the source's next turn,
/// since the pipeline may still be mid-wiring. Clearing notifies at once.
pub fn set_admission_control<Src: MediaSource>(
    source: &Arc<Src>,
    control: Option<Weak<dyn AdmissionControl>>,
) {
    let installing = control.is_some();
    source.core().replace_admission_control(control);

    if installing {
        let weak_source = Arc::downgrade(source);
        source.core().context().post(move || {
            if let Some(source) = weak_source.upgrade() {
                source.core().admission_updated().emit(&());
            }
        });
    } else {
        source.core().admission_updated().emit(&());
    }
}
