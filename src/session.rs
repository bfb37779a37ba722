use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::address::AddressIdentity;
use crate::rules::RouteRule;
use crate::service::Service;
use crate::socks::{AddressType, Command, SocksVersion};
use crate::tunnel::Tunnel;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Coarse outcome of a session, reported in the status document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusCode {
    Okay = 0,
    Error = 1,
    ErrInternal = 2,
    ErrNetwork = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub code: StatusCode,
    pub name: String,
    pub description: String,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            code: StatusCode::Okay,
            name: "Accepted".to_string(),
            description: String::new(),
        }
    }
}

/// Mutable per-connection state. Only reachable through [`Session::lock`].
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub socks_version: Option<SocksVersion>,
    pub command: Option<Command>,
    pub command_original: Option<Command>,
    pub address_type: Option<AddressType>,
    pub address_type_original: Option<AddressType>,
    pub destination: AddressIdentity,
    pub source: AddressIdentity,
    pub route: Option<Arc<RouteRule>>,
    pub tunnel: Option<Tunnel>,
    pub status: SessionStatus,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub end_time: Option<SystemTime>,
    pub inbound_open: bool,
    pub outbound_open: bool,
    pub exited: bool,
}

/// Value copy of a session taken under its lock.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: u64,
    pub service_id: u32,
    pub start_time: SystemTime,
    pub destination_original: Option<AddressIdentity>,
    pub state: SessionState,
}

/// One accepted client connection, end to end.
///
/// The owning handler task mutates it; the server's housekeeping and the
/// tunnel supervisor read it concurrently, always through the lock or a
/// snapshot.
#[derive(Debug)]
pub struct Session {
    id: u64,
    service: Arc<Service>,
    start_time: SystemTime,
    destination_original: OnceLock<AddressIdentity>,
    state: Mutex<SessionState>,
    status_requested: AtomicBool,
    status_document: Mutex<Option<String>>,
}

impl Session {
    pub fn new(service: Arc<Service>, source: AddressIdentity) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            service,
            start_time: SystemTime::now(),
            destination_original: OnceLock::new(),
            state: Mutex::new(SessionState {
                source,
                inbound_open: true,
                ..Default::default()
            }),
            status_requested: AtomicBool::new(false),
            status_document: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    pub fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }

    /// Record the destination as the client asked for it. Later calls are ignored.
    pub fn set_destination_original(&self, destination: AddressIdentity) {
        let _ = self.destination_original.set(destination);
    }

    pub fn destination_original(&self) -> Option<&AddressIdentity> {
        self.destination_original.get()
    }

    pub fn destination(&self) -> AddressIdentity {
        self.lock().destination.clone()
    }

    pub fn tunnel(&self) -> Option<Tunnel> {
        self.lock().tunnel.clone()
    }

    pub fn set_status(&self, code: StatusCode, name: &str, description: impl Into<String>) {
        let mut st = self.lock();
        st.status = SessionStatus {
            code,
            name: name.to_string(),
            description: description.into(),
        };
    }

    pub fn add_tx(&self, n: usize) {
        self.lock().bytes_tx += n as u64;
    }

    pub fn add_rx(&self, n: usize) {
        self.lock().bytes_rx += n as u64;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock().clone();
        SessionSnapshot {
            id: self.id,
            service_id: self.service.id,
            start_time: self.start_time,
            destination_original: self.destination_original.get().cloned(),
            state,
        }
    }

    /// Signal that the handler is finished with this session.
    pub fn mark_exited(&self) {
        let mut st = self.lock();
        st.inbound_open = false;
        st.outbound_open = false;
        st.end_time.get_or_insert_with(SystemTime::now);
        st.exited = true;
    }

    /// Ask the server loop for a fresh status document.
    pub fn request_status(&self) {
        self.status_requested.store(true, Ordering::Release);
    }

    /// True while a request is outstanding and not yet answered.
    pub fn wants_status(&self) -> bool {
        self.status_requested.load(Ordering::Acquire) && self.status_document.lock().is_none()
    }

    pub fn fulfil_status(&self, document: String) {
        *self.status_document.lock() = Some(document);
    }

    /// Take a ready document, clearing the request.
    pub fn take_status(&self) -> Option<String> {
        let doc = self.status_document.lock().take()?;
        self.status_requested.store(false, Ordering::Release);
        Some(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceSpec;

    fn test_session() -> Session {
        let spec = ServiceSpec::Socks {
            bind: "127.0.0.1".parse().unwrap(),
            port: 1080,
        };
        let service = Arc::new(Service::from_spec(7, &spec));
        Session::new(service, AddressIdentity::from_socket_addr("10.0.0.9:5555".parse().unwrap()))
    }

    #[test]
    fn test_ids_are_monotonic() {
        let a = test_session();
        let b = test_session();
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_destination_original_is_write_once() {
        let session = test_session();
        session.set_destination_original(AddressIdentity::from_hostname("first", 1));
        session.set_destination_original(AddressIdentity::from_hostname("second", 2));
        assert_eq!(session.destination_original().unwrap().hostname.as_deref(), Some("first"));
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let session = test_session();
        session.add_tx(3);
        let snap = session.snapshot();
        session.add_rx(10);
        assert_eq!(snap.state.bytes_tx, 3);
        assert_eq!(snap.state.bytes_rx, 0);
        assert_eq!(snap.service_id, 7);
        assert_eq!(snap.state.source.port, 5555);
        assert_eq!(session.snapshot().state.bytes_rx, 10);
    }

    #[test]
    fn test_mark_exited_sets_end_time_once() {
        let session = test_session();
        assert!(!session.snapshot().state.exited);
        session.mark_exited();
        let first = session.snapshot().state.end_time;
        session.mark_exited();
        assert!(session.snapshot().state.exited);
        assert_eq!(session.snapshot().state.end_time, first);
        assert!(!session.snapshot().state.inbound_open);
    }

    #[test]
    fn test_status_request_pair() {
        let session = test_session();
        assert!(!session.wants_status());
        assert_eq!(session.take_status(), None);

        session.request_status();
        assert!(session.wants_status());

        session.fulfil_status("[]".to_string());
        assert!(!session.wants_status());
        assert_eq!(session.take_status().as_deref(), Some("[]"));
        assert!(!session.wants_status());
    }

    #[test]
    fn test_set_status() {
        let session = test_session();
        session.set_status(StatusCode::ErrNetwork, "Error", "refused");
        let st = session.snapshot().state.status;
        assert_eq!(st.code, StatusCode::ErrNetwork);
        assert_eq!(st.description, "refused");
    }
}
