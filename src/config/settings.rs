use serde::Deserialize;

use crate::broker::topic::WildcardMode;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
}

/// Where the two transports listen.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub line_port: u16,
    pub frame_port: u16,
}

/// Controls operational parameters of the broker engine.
///
/// `read_poll_ms` is the read timeout line workers use to notice shutdown;
/// it is not a protocol timeout. `send_queue` bounds how many outbound
/// messages may wait for one connection, and `write_timeout_ms` is how long
/// a single socket write may stall. A subscriber that exceeds either is
/// dropped.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub max_connections: usize,
    pub read_poll_ms: u64,
    pub send_queue: usize,
    pub write_timeout_ms: u64,
    pub wildcard: WildcardMode,
    pub event_capacity: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub line_port: Option<u16>,
    pub frame_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub read_poll_ms: Option<u64>,
    pub send_queue: Option<usize>,
    pub write_timeout_ms: Option<u64>,
    pub wildcard: Option<WildcardMode>,
    pub event_capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Settings {
    pub fn line_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.line_port)
    }

    pub fn frame_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.frame_port)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                line_port: 5051,
                frame_port: 5052,
            },
            broker: BrokerSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            read_poll_ms: 500,
            send_queue: 1024,
            write_timeout_ms: 500,
            wildcard: WildcardMode::Prefix,
            event_capacity: 256,
        }
    }
}

impl PartialSettings {
    /// Overlay whatever was provided on top of `base`.
    pub fn merge_into(self, base: Settings) -> Settings {
        let server = self.server;
        let broker = self.broker;
        let logging = self.logging;

        Settings {
            server: ServerSettings {
                host: server
                    .as_ref()
                    .and_then(|s| s.host.clone())
                    .unwrap_or(base.server.host),
                line_port: server
                    .as_ref()
                    .and_then(|s| s.line_port)
                    .unwrap_or(base.server.line_port),
                frame_port: server
                    .as_ref()
                    .and_then(|s| s.frame_port)
                    .unwrap_or(base.server.frame_port),
            },
            broker: BrokerSettings {
                max_connections: broker
                    .as_ref()
                    .and_then(|b| b.max_connections)
                    .unwrap_or(base.broker.max_connections),
                read_poll_ms: broker
                    .as_ref()
                    .and_then(|b| b.read_poll_ms)
                    .unwrap_or(base.broker.read_poll_ms),
                send_queue: broker
                    .as_ref()
                    .and_then(|b| b.send_queue)
                    .unwrap_or(base.broker.send_queue),
                write_timeout_ms: broker
                    .as_ref()
                    .and_then(|b| b.write_timeout_ms)
                    .unwrap_or(base.broker.write_timeout_ms),
                wildcard: broker
                    .as_ref()
                    .and_then(|b| b.wildcard)
                    .unwrap_or(base.broker.wildcard),
                event_capacity: broker
                    .as_ref()
                    .and_then(|b| b.event_capacity)
                    .unwrap_or(base.broker.event_capacity),
            },
            logging: LoggingSettings {
                level: logging
                    .and_then(|l| l.level)
                    .unwrap_or(base.logging.level),
            },
        }
    }
}
