use crate::error::Error;
use crate::service::Service;

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Outcome of a group open or close.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgGroupStatus {
    /// The group was opened.
    Opened,

    /// The group was already open; nothing changed.
    AlreadyOpen,

    /// The group was closed.
    Closed,

    /// No such group was open.
    NotFound,
}

/// Creates the service backing one message group.
#[async_trait]
pub(crate) trait GroupServiceSpawner: Send + Sync + 'static {
    async fn spawn(&self, group_id: &str) -> Result<Service, Error>;

    /// Releases broker resources owned by a closed group.
    async fn release(&self, _group_id: &str) {}
}

/// Tracks the services of every open message group of one grouped request
/// service.
#[derive(Clone)]
pub struct MsgGroupServiceMgr {
    source: String,
    groups: Arc<Mutex<IndexMap<String, Service>>>,
    spawner: Arc<dyn GroupServiceSpawner>,
    stopped: Arc<AtomicBool>,
}

impl Debug for MsgGroupServiceMgr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgGroupServiceMgr")
            .field("source", &self.source)
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl MsgGroupServiceMgr {
    pub(crate) fn new(source: impl Into<String>, spawner: Arc<dyn GroupServiceSpawner>) -> Self {
        Self {
            source: source.into(),
            groups: Arc::new(Mutex::new(IndexMap::new())),
            spawner,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The base source the groups are derived from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Opens `group_id`, starting its service on `<group_id>-<source>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the manager is stopped or the service cannot start.
    pub async fn open_msg_group_service(&self, group_id: &str) -> Result<MsgGroupStatus, Error> {
        let mut groups = self.groups.lock().await;

        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::ServiceStopped(self.source.clone()));
        }
        if groups.contains_key(group_id) {
            debug!(source = %self.source, group_id, "message group already open");
            return Ok(MsgGroupStatus::AlreadyOpen);
        }

        let service = self.spawner.spawn(group_id).await?;
        groups.insert(group_id.to_string(), service);
        info!(source = %self.source, group_id, "opened message group service");

        Ok(MsgGroupStatus::Opened)
    }

    /// Closes `group_id`, stopping its service.
    pub async fn close_msg_group_service(&self, group_id: &str) -> MsgGroupStatus {
        let service = self.groups.lock().await.shift_remove(group_id);

        match service {
            Some(service) => {
                Box::pin(service.stop()).await;
                self.spawner.release(group_id).await;
                info!(source = %self.source, group_id, "closed message group service");
                MsgGroupStatus::Closed
            }
            None => {
                debug!(source = %self.source, group_id, "closing unknown message group");
                MsgGroupStatus::NotFound
            }
        }
    }

    /// Ids of the open groups, in opening order.
    pub async fn open_groups(&self) -> Vec<String> {
        self.groups.lock().await.keys().cloned().collect()
    }

    /// Closes every open group and refuses new ones. Returns how many groups
    /// were closed.
    pub async fn stop(&self) -> usize {
        let services: Vec<(String, Service)> = {
            let mut groups = self.groups.lock().await;
            self.stopped.store(true, Ordering::SeqCst);
            groups.drain(..).collect()
        };

        let closed = services.len();
        for (group_id, service) in services {
            Box::pin(service.stop()).await;
            self.spawner.release(&group_id).await;
        }

        debug!(source = %self.source, closed, "stopped message group manager");
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::service::ServiceKind;

    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingSpawner {
        spawned: AtomicUsize,
    }

    #[async_trait]
    impl GroupServiceSpawner for CountingSpawner {
        async fn spawn(&self, group_id: &str) -> Result<Service, Error> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            Ok(Service::new(format!("{group_id}-Q1"), ServiceKind::Request))
        }
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let spawner = Arc::new(CountingSpawner::default());
        let manager = MsgGroupServiceMgr::new("Q1", spawner.clone());

        assert_eq!(
            manager.open_msg_group_service("g1").await.unwrap(),
            MsgGroupStatus::Opened
        );
        assert_eq!(
            manager.open_msg_group_service("g1").await.unwrap(),
            MsgGroupStatus::AlreadyOpen
        );

        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(manager.open_groups().await, vec!["g1".to_string()]);
    }

    #[tokio::test]
    async fn test_close_stops_the_group_service() {
        let manager = MsgGroupServiceMgr::new("Q1", Arc::new(CountingSpawner::default()));
        manager.open_msg_group_service("g1").await.unwrap();

        assert_eq!(
            manager.close_msg_group_service("g1").await,
            MsgGroupStatus::Closed
        );
        assert_eq!(
            manager.close_msg_group_service("g1").await,
            MsgGroupStatus::NotFound
        );
        assert!(manager.open_groups().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_closes_everything_and_refuses_new_groups() {
        let manager = MsgGroupServiceMgr::new("Q1", Arc::new(CountingSpawner::default()));
        manager.open_msg_group_service("g1").await.unwrap();
        manager.open_msg_group_service("g2").await.unwrap();

        assert_eq!(manager.stop().await, 2);
        assert!(matches!(
            manager.open_msg_group_service("g3").await,
            Err(Error::ServiceStopped(_))
        ));
    }
}
