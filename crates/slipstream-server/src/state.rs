use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;

use crate::config::ServerConfig;
use crate::session_manager::SessionManager;

pub type SharedSessionManager = Arc<RwLock<SessionManager>>;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SharedSessionManager,
    pub config: Arc<ServerConfig>,
    pub ws_connection_count: Arc<AtomicUsize>,
    pub ws_per_ip: Arc<Mutex<HashMap<IpAddr, usize>>>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(SessionManager::new())),
            config: Arc::new(config),
            ws_connection_count: Arc::new(AtomicUsize::new(0)),
            ws_per_ip: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// RAII guard for the global WebSocket connection count.
pub struct ConnectionGuard {
    count: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    pub fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Self { count }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// RAII guard for the per-IP connection count. Acquisition fails when the
/// address already holds `max_per_ip` connections.
pub struct IpConnectionGuard {
    ip: IpAddr,
    map: Arc<Mutex<HashMap<IpAddr, usize>>>,
}

impl IpConnectionGuard {
    pub fn try_acquire(
        ip: IpAddr,
        map: Arc<Mutex<HashMap<IpAddr, usize>>>,
        max_per_ip: usize,
    ) -> Option<Self> {
        {
            let mut counts = map.lock().ok()?;
            let count = counts.entry(ip).or_insert(0);
            if *count >= max_per_ip {
                return None;
            }
            *count += 1;
        }
        Some(Self { ip, map })
    }
}

impl Drop for IpConnectionGuard {
    fn drop(&mut self) {
        if let Ok(mut counts) = self.map.lock()
            && let Some(count) = counts.get_mut(&self.ip)
        {
            *count -= 1;
            if *count == 0 {
                counts.remove(&self.ip);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_guard_counts() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let _a = ConnectionGuard::new(Arc::clone(&count));
            let _b = ConnectionGuard::new(Arc::clone(&count));
            assert_eq!(count.load(Ordering::Relaxed), 2);
        }
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn ip_guard_enforces_cap() {
        let map = Arc::new(Mutex::new(HashMap::new()));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        let a = IpConnectionGuard::try_acquire(ip, Arc::clone(&map), 2);
        let b = IpConnectionGuard::try_acquire(ip, Arc::clone(&map), 2);
        let c = IpConnectionGuard::try_acquire(ip, Arc::clone(&map), 2);
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none());

        drop(a);
        let d = IpConnectionGuard::try_acquire(ip, Arc::clone(&map), 2);
        assert!(d.is_some());

        drop(b);
        drop(d);
        assert!(map.lock().unwrap().is_empty());
    }
}
