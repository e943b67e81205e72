use serde::{Deserialize, Serialize};

/// Runtime status of the SSH tunnel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

/// Point-in-time snapshot of tunnel state. `local_port` is present iff the
/// status is `connected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStateSnapshot {
    pub status: TunnelStatus,
    pub local_port: Option<u16>,
    pub uptime_seconds: Option<u64>,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
}

/// Driver pool counters plus the manager's own gate accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub total_connections: u32,
    pub idle_connections: u32,
    pub in_flight_queries: usize,
    pub waiting_queries: usize,
}

/// Full connection status exposed by the `get_connection_status` tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub initialized: bool,
    pub reconnecting: bool,
    pub read_only: bool,
    pub database: String,
    pub host: String,
    pub port: u16,
    pub ssl_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelStateSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&TunnelStatus::Reconnecting).unwrap(),
            "\"reconnecting\""
        );
        assert_eq!(
            serde_json::to_string(&TunnelStatus::Disconnected).unwrap(),
            "\"disconnected\""
        );
    }

    #[test]
    fn test_snapshot_camel_case() {
        let snapshot = TunnelStateSnapshot {
            status: TunnelStatus::Connected,
            local_port: Some(40123),
            uptime_seconds: Some(7),
            reconnect_attempts: 0,
            last_error: None,
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["localPort"], 40123);
        assert_eq!(value["reconnectAttempts"], 0);
    }
}
