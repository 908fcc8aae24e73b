//! Session management
//!
//! A session stitches one client connection to one device connection. The
//! manager owns every live session between `create` and `end`, mints the
//! process-unique ids and drives the optional lifecycle hooks.

pub mod bridge;

pub use bridge::Bridge;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::transport::Transport;

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// An active client-device session
pub struct Session {
    id: String,
    device_id: String,
    client: Arc<Transport>,
    device: Arc<Transport>,
    started_at: SystemTime,
    /// Bytes from client to device
    bytes_in: AtomicU64,
    /// Bytes from device to client
    bytes_out: AtomicU64,
    /// Unix seconds of last client activity
    last_client_active: AtomicI64,
    /// Unix seconds of last device activity
    last_device_active: AtomicI64,
    idle_timeout: Duration,
    debug: bool,
    /// Completion signal, fired exactly once by `Manager::end`
    done: CancellationToken,
}

impl Session {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    #[must_use]
    pub fn client(&self) -> &Arc<Transport> {
        &self.client
    }

    #[must_use]
    pub fn device(&self) -> &Arc<Transport> {
        &self.device
    }

    #[must_use]
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    #[must_use]
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("device_id", &self.device_id)
            .field("bytes_in", &self.bytes_in())
            .field("bytes_out", &self.bytes_out())
            .finish()
    }
}

/// Lifecycle hooks invoked by the manager, supplied once at construction
pub trait SessionHooks: Send + Sync {
    fn on_start(&self, session: &Session);
    fn on_end(&self, session: &Session);
}

/// Serializable snapshot of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub device_id: String,
    pub client_addr: String,
    pub device_addr: String,
    /// Unix seconds
    pub started_at: u64,
    pub duration_secs: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Owner of all live sessions
pub struct Manager {
    sessions: DashMap<String, Arc<Session>>,
    counter: AtomicU64,
    debug: bool,
    idle_timeout: Duration,
    hooks: Option<Arc<dyn SessionHooks>>,
}

impl Manager {
    #[must_use]
    pub fn new(debug: bool, idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            counter: AtomicU64::new(0),
            debug,
            idle_timeout,
            hooks: None,
        }
    }

    /// Attach lifecycle hooks (builder style, called once at startup)
    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Create and record a new session and invoke `on_start`.
    pub fn create(
        &self,
        device_id: &str,
        client: Arc<Transport>,
        device: Arc<Transport>,
    ) -> Arc<Session> {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("sess_{}_{}", unix_now(), seq);

        let now = unix_now();
        let session = Arc::new(Session {
            id: id.clone(),
            device_id: device_id.to_string(),
            client,
            device,
            started_at: SystemTime::now(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            last_client_active: AtomicI64::new(now),
            last_device_active: AtomicI64::new(now),
            idle_timeout: self.idle_timeout,
            debug: self.debug,
            done: CancellationToken::new(),
        });

        self.sessions.insert(id, session.clone());

        if let Some(hooks) = &self.hooks {
            hooks.on_start(&session);
        }

        session
    }

    /// Remove a session, fire its completion signal and invoke `on_end`.
    /// Exactly once per session; later calls are no-ops.
    pub fn end(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            session.done.cancel();
            if let Some(hooks) = &self.hooks {
                hooks.on_end(&session);
            }
        }
    }

    /// Forcefully terminate a session by closing both transports, which
    /// drives the bridge out; the bridge's caller then invokes `end`.
    /// Returns whether the session existed.
    pub fn terminate(&self, session_id: &str) -> bool {
        match self.sessions.get(session_id) {
            Some(session) => {
                session.client.close();
                session.device.close();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    /// Session currently using the given device, if any
    #[must_use]
    pub fn get_by_device(&self, device_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .iter()
            .find(|e| e.value().device_id == device_id)
            .map(|e| e.value().clone())
    }

    #[must_use]
    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of every session for the status API. Byte counters are
    /// read atomically at enumeration time.
    #[must_use]
    pub fn list_info(&self) -> Vec<SessionInfo> {
        let now = SystemTime::now();
        self.sessions
            .iter()
            .map(|e| {
                let s = e.value();
                SessionInfo {
                    id: s.id.clone(),
                    device_id: s.device_id.clone(),
                    client_addr: s.client.peer_addr().to_string(),
                    device_addr: s.device.peer_addr().to_string(),
                    started_at: s
                        .started_at
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs(),
                    duration_secs: now
                        .duration_since(s.started_at)
                        .unwrap_or_default()
                        .as_secs_f64(),
                    bytes_in: s.bytes_in(),
                    bytes_out: s.bytes_out(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::BufReader;
    use tokio::net::{TcpListener, TcpStream};

    async fn transport() -> (Arc<Transport>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let peer = TcpStream::connect(addr).await.expect("connect");
        let (stream, peer_addr) = listener.accept().await.expect("accept");
        let (read_half, write_half) = stream.into_split();
        (
            Arc::new(Transport::new(
                BufReader::new(read_half),
                write_half,
                peer_addr,
            )),
            peer,
        )
    }

    #[tokio::test]
    async fn test_session_id_format() {
        let manager = Manager::new(false, Duration::from_secs(30));
        let (client, _p1) = transport().await;
        let (device, _p2) = transport().await;

        let session = manager.create("dev1", client, device);
        let parts: Vec<&str> = session.id().split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "sess");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2], "1");
    }

    #[tokio::test]
    async fn test_ids_unique_within_run() {
        let manager = Manager::new(false, Duration::from_secs(30));
        let (c1, _p1) = transport().await;
        let (d1, _p2) = transport().await;
        let (c2, _p3) = transport().await;
        let (d2, _p4) = transport().await;

        let s1 = manager.create("dev1", c1, d1);
        let s2 = manager.create("dev2", c2, d2);
        assert_ne!(s1.id(), s2.id());
    }

    #[tokio::test]
    async fn test_end_fires_hooks_exactly_once() {
        struct CountingHooks {
            started: AtomicUsize,
            ended: AtomicUsize,
        }
        impl SessionHooks for CountingHooks {
            fn on_start(&self, _session: &Session) {
                self.started.fetch_add(1, Ordering::SeqCst);
            }
            fn on_end(&self, _session: &Session) {
                self.ended.fetch_add(1, Ordering::SeqCst);
            }
        }

        let hooks = Arc::new(CountingHooks {
            started: AtomicUsize::new(0),
            ended: AtomicUsize::new(0),
        });
        let manager = Manager::new(false, Duration::from_secs(30)).with_hooks(hooks.clone());

        let (client, _p1) = transport().await;
        let (device, _p2) = transport().await;
        let session = manager.create("dev1", client, device);
        assert_eq!(hooks.started.load(Ordering::SeqCst), 1);
        assert_eq!(manager.count(), 1);

        manager.end(session.id());
        assert_eq!(hooks.ended.load(Ordering::SeqCst), 1);
        assert_eq!(manager.count(), 0);

        // Ending again is a no-op
        manager.end(session.id());
        assert_eq!(hooks.ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminate_closes_transports() {
        let manager = Manager::new(false, Duration::from_secs(30));
        let (client, _p1) = transport().await;
        let (device, _p2) = transport().await;
        let session = manager.create("dev1", client.clone(), device.clone());

        assert!(manager.terminate(session.id()));
        assert!(client.is_closed());
        assert!(device.is_closed());

        // Terminate leaves removal to end()
        assert_eq!(manager.count(), 1);
        manager.end(session.id());

        assert!(!manager.terminate(session.id()));
    }

    #[tokio::test]
    async fn test_get_by_device() {
        let manager = Manager::new(false, Duration::from_secs(30));
        let (client, _p1) = transport().await;
        let (device, _p2) = transport().await;
        let session = manager.create("dev1", client, device);

        let found = manager.get_by_device("dev1").expect("by device");
        assert_eq!(found.id(), session.id());
        assert!(manager.get_by_device("dev2").is_none());
    }

    #[tokio::test]
    async fn test_list_info() {
        let manager = Manager::new(false, Duration::from_secs(30));
        let (client, _p1) = transport().await;
        let (device, _p2) = transport().await;
        let session = manager.create("dev1", client, device);
        session.bytes_in.fetch_add(5, Ordering::Relaxed);
        session.bytes_out.fetch_add(7, Ordering::Relaxed);

        let infos = manager.list_info();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, session.id());
        assert_eq!(infos[0].device_id, "dev1");
        assert_eq!(infos[0].bytes_in, 5);
        assert_eq!(infos[0].bytes_out, 7);
        assert!(infos[0].started_at > 0);
    }
}
