use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ecogrow_proto::DeviceId;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::session::{DeviceSession, ViewerSession};
use crate::transport::CLOSE_SUPERSEDED;

/// Live controller and viewer connections.
///
/// Every mutation happens under one lock that is only held for the in-memory
/// update; closing a transport is a non-blocking `try_send`, so nothing here
/// ever waits on I/O.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    devices: HashMap<DeviceId, Arc<DeviceSession>>,
    viewers: HashMap<Uuid, Arc<ViewerSession>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a controller session, closing any session that already holds the
    /// same id. The previous session is fully evicted before the new one is
    /// marked Online.
    pub fn register_device(&self, session: Arc<DeviceSession>) -> Option<Arc<DeviceSession>> {
        let mut inner = self.inner.lock();
        let previous = inner.devices.remove(session.id());
        if let Some(previous) = &previous {
            previous.close(CLOSE_SUPERSEDED, "superseded by a newer connection");
        }
        session.mark_online();
        inner.devices.insert(session.id().clone(), session);
        previous
    }

    /// Remove a controller session. Returns false when the registered session
    /// for that id belongs to a different connection, e.g. a successor.
    pub fn unregister_device(&self, session: &DeviceSession) -> bool {
        let mut inner = self.inner.lock();
        let owned = inner
            .devices
            .get(session.id())
            .is_some_and(|current| current.connection_id() == session.connection_id());
        if owned {
            inner.devices.remove(session.id());
        }
        owned
    }

    pub fn register_viewer(&self, session: Arc<ViewerSession>) {
        self.inner.lock().viewers.insert(session.id(), session);
    }

    pub fn unregister_viewer(&self, id: Uuid) -> Option<Arc<ViewerSession>> {
        self.inner.lock().viewers.remove(&id)
    }

    pub fn lookup_device(&self, id: &str) -> Option<Arc<DeviceSession>> {
        self.inner.lock().devices.get(id).cloned()
    }

    pub fn all_devices(&self) -> Vec<Arc<DeviceSession>> {
        let mut devices: Vec<_> = self.inner.lock().devices.values().cloned().collect();
        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }

    pub fn all_viewers(&self) -> Vec<Arc<ViewerSession>> {
        self.inner.lock().viewers.values().cloned().collect()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self.inner.lock().devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn device_count(&self) -> usize {
        self.inner.lock().devices.len()
    }

    pub fn viewer_count(&self) -> usize {
        self.inner.lock().viewers.len()
    }

    /// Controllers that have not produced a frame for longer than `timeout`.
    pub fn idle_devices(&self, timeout: Duration) -> Vec<Arc<DeviceSession>> {
        let now = Utc::now();
        self.inner
            .lock()
            .devices
            .values()
            .filter(|session| session.idle_for(now) > timeout)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionState, Subscription};
    use crate::transport::{Frame, Outbox};
    use tokio::sync::mpsc::Receiver;

    fn device(id: &str) -> (Arc<DeviceSession>, Receiver<Frame>) {
        let (outbox, rx) = Outbox::channel(8);
        (
            Arc::new(DeviceSession::new(DeviceId::parse(id).unwrap(), outbox, None)),
            rx,
        )
    }

    #[test]
    fn register_marks_session_online() {
        let registry = ConnectionRegistry::new();
        let (session, _rx) = device("pump-1");
        assert!(registry.register_device(session.clone()).is_none());
        assert_eq!(session.state(), SessionState::Online);
        assert_eq!(registry.device_count(), 1);
        assert!(registry.lookup_device("pump-1").is_some());
        assert!(registry.lookup_device("pump-2").is_none());
    }

    #[test]
    fn second_connection_supersedes_the_first() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_rx) = device("pump-1");
        let (second, _second_rx) = device("pump-1");

        registry.register_device(first.clone());
        let evicted = registry.register_device(second.clone()).unwrap();

        assert_eq!(evicted.connection_id(), first.connection_id());
        assert_eq!(first.state(), SessionState::Closed);
        assert!(first.closed().is_cancelled());
        assert_eq!(
            first_rx.try_recv().unwrap(),
            Frame::Close {
                code: CLOSE_SUPERSEDED,
                reason: "superseded by a newer connection"
            }
        );

        let online: Vec<_> = registry
            .all_devices()
            .into_iter()
            .filter(|s| s.state() == SessionState::Online)
            .collect();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].connection_id(), second.connection_id());
    }

    #[test]
    fn stale_unregister_does_not_evict_successor() {
        let registry = ConnectionRegistry::new();
        let (first, _a) = device("pump-1");
        let (second, _b) = device("pump-1");
        registry.register_device(first.clone());
        registry.register_device(second.clone());

        assert!(!registry.unregister_device(&first));
        assert_eq!(
            registry.lookup_device("pump-1").unwrap().connection_id(),
            second.connection_id()
        );
        assert!(registry.unregister_device(&second));
        assert_eq!(registry.device_count(), 0);
    }

    #[test]
    fn viewers_are_tracked_by_id() {
        let registry = ConnectionRegistry::new();
        let (outbox, _rx) = Outbox::channel(8);
        let viewer = Arc::new(ViewerSession::new(outbox, Subscription::All, None));
        registry.register_viewer(viewer.clone());
        assert_eq!(registry.viewer_count(), 1);
        assert!(registry.unregister_viewer(viewer.id()).is_some());
        assert!(registry.unregister_viewer(viewer.id()).is_none());
        assert_eq!(registry.viewer_count(), 0);
    }

    #[test]
    fn idle_devices_respects_timeout() {
        let registry = ConnectionRegistry::new();
        let (session, _rx) = device("pump-1");
        registry.register_device(session);
        assert!(registry.idle_devices(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(registry.idle_devices(Duration::from_millis(5)).len(), 1);
    }

    #[test]
    fn device_ids_are_sorted() {
        let registry = ConnectionRegistry::new();
        let (b, _rb) = device("b");
        let (a, _ra) = device("a");
        registry.register_device(b);
        registry.register_device(a);
        let ids: Vec<_> = registry
            .device_ids()
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
