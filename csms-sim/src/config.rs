//! Configuration for the simulated CSMS

use crate::driver::CommandSchedule;

/// Subprotocols the CSMS accepts, in preference order
pub const DEFAULT_SUBPROTOCOLS: &[&str] = &["ocpp2.0", "ocpp2.0.1"];

/// Complete server configuration
#[derive(Debug, Clone)]
pub struct CsmsConfig {
    /// Listen host
    pub host: String,

    /// Listen port (0 picks a free port)
    pub port: u16,

    /// Accepted WebSocket subprotocols
    pub subprotocols: Vec<String>,

    /// Command issued on every accepted session, if any
    pub schedule: Option<CommandSchedule>,
}

impl Default for CsmsConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            subprotocols: DEFAULT_SUBPROTOCOLS.iter().map(|p| p.to_string()).collect(),
            schedule: None,
        }
    }
}

impl CsmsConfig {
    /// Create config listening on `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Set listen host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set listen port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Replace the accepted subprotocols
    pub fn with_subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    /// Issue a command on every session
    pub fn with_schedule(mut self, schedule: CommandSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Address to bind, as `host:port`
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::commands::OutboundCommand;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = CsmsConfig::default();
        assert_eq!(config.bind_address(), "127.0.0.1:9000");
        assert_eq!(config.subprotocols, vec!["ocpp2.0", "ocpp2.0.1"]);
        assert!(config.schedule.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = CsmsConfig::new("0.0.0.0", 9100)
            .with_subprotocols(["ocpp2.0.1"])
            .with_schedule(
                CommandSchedule::once(OutboundCommand::GetBaseReport).with_period(Duration::from_secs(30)),
            );

        assert_eq!(config.bind_address(), "0.0.0.0:9100");
        assert_eq!(config.subprotocols, vec!["ocpp2.0.1"]);
        assert_eq!(config.schedule.unwrap().period, Some(Duration::from_secs(30)));

        let config = CsmsConfig::default().with_host("localhost").with_port(0);
        assert_eq!(config.bind_address(), "localhost:0");
    }
}
