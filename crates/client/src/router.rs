use crate::consumer::Dispatch;
use crate::error::Error;

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use switchyard_messaging::Envelope;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

const MAILBOX_CAPACITY: usize = 64;

/// The work a routee performs for each routed message.
#[async_trait]
pub trait RouteeHandler: Send + Sync + 'static {
    /// Message type flowing through the router.
    type Message: Send + 'static;

    /// Handles one message on the routee at `routee_index`.
    async fn handle(&self, routee_index: usize, message: Self::Message);
}

/// A snapshot of one routee slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteeInfo {
    /// Slot index.
    pub index: usize,

    /// Routee name, `<prefix>__<index>`.
    pub name: String,

    /// Incremented every time the slot is respawned.
    pub generation: u64,

    /// Whether the routee is currently accepting messages.
    pub alive: bool,
}

struct Slot<M> {
    name: String,
    generation: u64,
    sender: mpsc::Sender<M>,
    abort_handle: AbortHandle,
}

struct RouteeExit {
    index: usize,
    generation: u64,
    panicked: bool,
}

struct RouterInner<H: RouteeHandler> {
    prefix: String,
    handler: Arc<H>,
    slots: RwLock<Vec<Slot<H::Message>>>,
    cursor: AtomicUsize,
    stopping_soon: AtomicBool,
    killed: AtomicBool,
    exits: mpsc::UnboundedSender<RouteeExit>,
    supervisor: Mutex<Option<AbortHandle>>,
}

fn routee_name(prefix: &str, index: usize) -> String {
    format!("{prefix}__{index}")
}

fn spawn_routee<H: RouteeHandler>(
    handler: &Arc<H>,
    exits: &mpsc::UnboundedSender<RouteeExit>,
    name: String,
    index: usize,
    generation: u64,
) -> Slot<H::Message> {
    let (sender, mut mailbox) = mpsc::channel(MAILBOX_CAPACITY);

    let routee_handler = handler.clone();
    let handle = tokio::spawn(async move {
        while let Some(message) = mailbox.recv().await {
            routee_handler.handle(index, message).await;
        }
    });
    let abort_handle = handle.abort_handle();

    let exits = exits.clone();
    tokio::spawn(async move {
        let panicked = handle.await.is_err_and(|e| e.is_panic());
        let _ = exits.send(RouteeExit {
            index,
            generation,
            panicked,
        });
    });

    Slot {
        name,
        generation,
        sender,
        abort_handle,
    }
}

impl<H: RouteeHandler> RouterInner<H> {
    fn on_routee_exit(&self, exit: &RouteeExit) {
        let mut slots = self.slots.write();
        let Some(slot) = slots.get_mut(exit.index) else {
            return;
        };
        if slot.generation != exit.generation {
            return;
        }

        if self.killed.load(Ordering::SeqCst) || self.stopping_soon.load(Ordering::SeqCst) {
            debug!(routee = %slot.name, "routee stopped");
            return;
        }

        warn!(
            routee = %slot.name,
            panicked = exit.panicked,
            "routee terminated, respawning"
        );
        *slot = spawn_routee(
            &self.handler,
            &self.exits,
            slot.name.clone(),
            exit.index,
            exit.generation + 1,
        );
    }
}

/// Round-robin dispatch over a fixed pool of routees.
///
/// Routees are tasks with bounded mailboxes, created eagerly. A routee that
/// ends (panic or kill) is respawned at the same index under the same name
/// unless the router is stopping.
pub struct RequestRouter<H: RouteeHandler> {
    inner: Arc<RouterInner<H>>,
}

impl<H: RouteeHandler> Clone for RequestRouter<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: RouteeHandler> Debug for RequestRouter<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestRouter")
            .field("prefix", &self.inner.prefix)
            .field("routees", &self.inner.slots.read().len())
            .finish_non_exhaustive()
    }
}

impl<H: RouteeHandler> RequestRouter<H> {
    /// Creates a router with `nb_routees` routees named `<prefix>__<index>`.
    /// Must be called inside a Tokio runtime.
    pub fn new(prefix: impl Into<String>, nb_routees: usize, handler: H) -> Self {
        let prefix = prefix.into();
        let handler = Arc::new(handler);
        let (exits, exit_receiver) = mpsc::unbounded_channel();

        let slots = (0..nb_routees)
            .map(|index| spawn_routee(&handler, &exits, routee_name(&prefix, index), index, 0))
            .collect();

        let inner = Arc::new(RouterInner {
            prefix,
            handler,
            slots: RwLock::new(slots),
            cursor: AtomicUsize::new(0),
            stopping_soon: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            exits,
            supervisor: Mutex::new(None),
        });

        let supervisor = Self::spawn_supervisor(Arc::downgrade(&inner), exit_receiver);
        *inner.supervisor.lock() = Some(supervisor);

        Self { inner }
    }

    fn spawn_supervisor(
        inner: Weak<RouterInner<H>>,
        mut exits: mpsc::UnboundedReceiver<RouteeExit>,
    ) -> AbortHandle {
        tokio::spawn(async move {
            while let Some(exit) = exits.recv().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.on_routee_exit(&exit);
            }
        })
        .abort_handle()
    }

    /// The routee name prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    /// Sends `message` to the next live routee in cyclic order.
    ///
    /// # Errors
    ///
    /// Returns an error if no routee is alive.
    pub async fn route(&self, message: H::Message) -> Result<(), Error> {
        let nb_routees = self.inner.slots.read().len();
        let mut message = message;

        for _ in 0..nb_routees {
            let index = self.inner.cursor.fetch_add(1, Ordering::SeqCst) % nb_routees;
            let sender = {
                let slots = self.inner.slots.read();
                let slot = &slots[index];
                if slot.sender.is_closed() {
                    continue;
                }
                slot.sender.clone()
            };

            match sender.send(message).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => message = returned,
            }
        }

        Err(Error::NoRoutee(self.inner.prefix.clone()))
    }

    /// Snapshot of every slot.
    #[must_use]
    pub fn routees(&self) -> Vec<RouteeInfo> {
        self.inner
            .slots
            .read()
            .iter()
            .enumerate()
            .map(|(index, slot)| RouteeInfo {
                index,
                name: slot.name.clone(),
                generation: slot.generation,
                alive: !slot.sender.is_closed(),
            })
            .collect()
    }

    /// Terminates the routee at `index`. Returns `false` if there is no such
    /// slot.
    pub fn kill_routee(&self, index: usize) -> bool {
        self.inner
            .slots
            .read()
            .get(index)
            .map(|slot| slot.abort_handle.abort())
            .is_some()
    }

    /// Stops replacing routees that terminate.
    pub fn will_stop_soon(&self) {
        self.inner.stopping_soon.store(true, Ordering::SeqCst);
    }

    /// Whether the router has been told it is about to stop.
    #[must_use]
    pub fn is_stopping_soon(&self) -> bool {
        self.inner.stopping_soon.load(Ordering::SeqCst)
    }

    /// Terminates every routee and the supervisor.
    pub fn kill(&self) {
        self.inner.killed.store(true, Ordering::SeqCst);

        if let Some(supervisor) = self.inner.supervisor.lock().take() {
            supervisor.abort();
        }
        for slot in self.inner.slots.read().iter() {
            slot.abort_handle.abort();
        }

        debug!(router = %self.inner.prefix, "killed router");
    }
}

#[async_trait]
impl<H> Dispatch for RequestRouter<H>
where
    H: RouteeHandler<Message = Envelope>,
{
    async fn dispatch(&self, message: Envelope) {
        if let Err(e) = self.route(message).await {
            warn!(router = %self.inner.prefix, "dropping message: {e}");
        }
    }
}

/// Lifecycle controls of a router, independent of its handler type.
pub(crate) trait WorkerHandle: Send + Sync + 'static {
    fn will_stop_soon(&self);

    fn kill(&self);
}

impl<H: RouteeHandler> WorkerHandle for RequestRouter<H> {
    fn will_stop_soon(&self) {
        Self::will_stop_soon(self);
    }

    fn kill(&self) {
        Self::kill(self);
    }
}
