use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::session::{Session, SessionSnapshot};

/// One row of the status document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    pub connection_id: u64,
    pub service: u32,
    pub route: String,
    pub socks_version: Option<u8>,
    pub socks_command: Option<u8>,
    pub remote_address: String,
    pub remote_port: u16,
    pub remote_address_effective: String,
    pub remote_port_effective: u16,
    pub status: u8,
    pub status_name: String,
    pub status_description: String,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub source_address: String,
    pub source_port: u16,
    pub time_start: u64,
    pub time_end: Option<u64>,
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl From<&SessionSnapshot> for StatusEntry {
    fn from(snap: &SessionSnapshot) -> Self {
        let st = &snap.state;
        let route = match (&st.tunnel, &st.route) {
            (Some(tunnel), _) => tunnel.name().to_string(),
            (None, Some(route)) => route.tunnel_names().join(","),
            (None, None) => String::new(),
        };
        let original = snap.destination_original.clone().unwrap_or_default();
        Self {
            connection_id: snap.id,
            service: snap.service_id,
            route,
            socks_version: st.socks_version.map(|v| v.number()),
            socks_command: st.command_original.map(|c| c.as_byte()),
            remote_address: original.host(),
            remote_port: original.port,
            remote_address_effective: st.destination.host(),
            remote_port_effective: st.destination.port,
            status: st.status.code as u8,
            status_name: st.status.name.clone(),
            status_description: st.status.description.clone(),
            bytes_tx: st.bytes_tx,
            bytes_rx: st.bytes_rx,
            source_address: st.source.host(),
            source_port: st.source.port,
            time_start: unix_secs(snap.start_time),
            time_end: st.end_time.map(unix_secs),
        }
    }
}

/// Snapshot every session, then serialize outside any session lock.
pub fn build_document(sessions: &[Arc<Session>]) -> serde_json::Result<String> {
    let snapshots: Vec<SessionSnapshot> = sessions.iter().map(|s| s.snapshot()).collect();
    let entries: Vec<StatusEntry> = snapshots.iter().map(StatusEntry::from).collect();
    serde_json::to_string(&entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressIdentity;
    use crate::config::ServiceSpec;
    use crate::rules::{Provenance, RouteRule};
    use crate::service::Service;
    use crate::session::StatusCode;
    use crate::socks::{Command, SocksVersion};
    use crate::tunnel::Tunnel;
    use serde_json::Value;

    #[test]
    fn test_document_fields() {
        let spec = ServiceSpec::Socks {
            bind: "127.0.0.1".parse().unwrap(),
            port: 1080,
        };
        let service = Arc::new(Service::from_spec(4, &spec));
        let session = Arc::new(Session::new(
            service,
            AddressIdentity::from_socket_addr("10.0.0.2:50000".parse().unwrap()),
        ));
        let original = AddressIdentity::from_hostname("example.com", 443);
        session.set_destination_original(original.clone());
        {
            let mut st = session.lock();
            st.socks_version = Some(SocksVersion::V5);
            st.command_original = Some(Command::Connect);
            st.destination = original;
            st.destination.address = Some("93.184.216.34".parse().unwrap());
            st.route = Some(Arc::new(RouteRule::via(
                vec![Tunnel::Direct, Tunnel::Null],
                Provenance::new("t", 1),
            )));
            st.bytes_tx = 12;
        }
        session.set_status(StatusCode::ErrNetwork, "Error", "refused");

        let doc: Value = serde_json::from_str(&build_document(&[session.clone()]).unwrap()).unwrap();
        let row = &doc[0];
        assert_eq!(row["connectionId"], session.id());
        assert_eq!(row["service"], 4);
        assert_eq!(row["route"], "direct,null");
        assert_eq!(row["socksVersion"], 5);
        assert_eq!(row["socksCommand"], 1);
        assert_eq!(row["remoteAddress"], "example.com");
        assert_eq!(row["remotePortEffective"], 443);
        assert_eq!(row["status"], 3);
        assert_eq!(row["statusDescription"], "refused");
        assert_eq!(row["bytesTx"], 12);
        assert_eq!(row["sourceAddress"], "10.0.0.2");
        assert_eq!(row["timeEnd"], Value::Null);

        session.lock().tunnel = Some(Tunnel::Null);
        session.mark_exited();
        let doc: Value = serde_json::from_str(&build_document(&[session]).unwrap()).unwrap();
        assert_eq!(doc[0]["route"], "null");
        assert!(doc[0]["timeEnd"].is_u64());
    }

    #[test]
    fn test_empty_document() {
        assert_eq!(build_document(&[]).unwrap(), "[]");
    }
}
