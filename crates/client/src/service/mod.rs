mod factory;
mod feeder;
mod handler;

pub use factory::ServiceFactory;
pub(crate) use feeder::FeederHandle;

use crate::consumer::Consumer;
use crate::group::MsgGroupServiceMgr;
use crate::router::WorkerHandle;

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::info;

/// Lifecycle state of a [`Service`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    /// Constructed, nothing attached yet.
    Created,

    /// A consumer or feeder is attached and running.
    Running,

    /// Stopped; terminal.
    Stopped,
}

/// The kind of work a [`Service`] performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    /// Answers requests on a queue.
    Request,

    /// Answers requests and manages message groups.
    MsgGroupRequest,

    /// Publishes on a schedule.
    Feeder,

    /// Receives topic publications.
    Subscriber,
}

struct ServiceInner {
    name: String,
    kind: ServiceKind,
    state: Mutex<ServiceState>,
    stopped: AtomicBool,
    consumer: Mutex<Option<Consumer>>,
    group_manager: Mutex<Option<MsgGroupServiceMgr>>,
    feeder: Mutex<Option<FeederHandle>>,
    worker: Mutex<Option<Arc<dyn WorkerHandle>>>,
}

/// A long-lived bundle of consumer, worker, feeder and group manager, with a
/// single [`stop`](Service::stop) releasing all of it.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Service {
    pub(crate) fn new(name: impl Into<String>, kind: ServiceKind) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                name: name.into(),
                kind,
                state: Mutex::new(ServiceState::Created),
                stopped: AtomicBool::new(false),
                consumer: Mutex::new(None),
                group_manager: Mutex::new(None),
                feeder: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    /// The service name, usually the queue or exchange it serves.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The service kind.
    #[must_use]
    pub fn kind(&self) -> ServiceKind {
        self.inner.kind
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        *self.inner.state.lock()
    }

    /// The group manager of a grouped request service.
    #[must_use]
    pub fn group_manager(&self) -> Option<MsgGroupServiceMgr> {
        self.inner.group_manager.lock().clone()
    }

    fn mark_running(&self) {
        let mut state = self.inner.state.lock();
        if *state == ServiceState::Created {
            *state = ServiceState::Running;
        }
    }

    pub(crate) fn attach_consumer(&self, consumer: Consumer) {
        *self.inner.consumer.lock() = Some(consumer);
        self.mark_running();
    }

    pub(crate) fn attach_worker(&self, worker: Arc<dyn WorkerHandle>) {
        *self.inner.worker.lock() = Some(worker);
    }

    pub(crate) fn attach_feeder(&self, feeder: FeederHandle) {
        *self.inner.feeder.lock() = Some(feeder);
        self.mark_running();
    }

    pub(crate) fn attach_group_manager(&self, group_manager: MsgGroupServiceMgr) {
        *self.inner.group_manager.lock() = Some(group_manager);
    }

    /// Tells the worker not to replace routees that terminate from now on.
    pub fn will_stop_soon(&self) {
        if let Some(worker) = self.inner.worker.lock().as_ref() {
            worker.will_stop_soon();
        }
    }

    /// Stops the consumer, the group manager, the feeder schedule, then the
    /// worker and feeder handles. Returns `false` if the service was already
    /// stopped.
    pub async fn stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }

        let consumer = self.inner.consumer.lock().take();
        if let Some(consumer) = consumer {
            consumer.stop().await;
        }

        let group_manager = self.inner.group_manager.lock().take();
        if let Some(group_manager) = group_manager {
            group_manager.stop().await;
        }

        let feeder = self.inner.feeder.lock().take();
        if let Some(feeder) = &feeder {
            feeder.cancel_schedule();
        }

        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            worker.will_stop_soon();
            worker.kill();
        }

        if let Some(feeder) = feeder {
            feeder.terminate().await;
        }

        *self.inner.state.lock() = ServiceState::Stopped;
        info!(service = %self.inner.name, kind = ?self.inner.kind, "stopped service");

        true
    }
}
