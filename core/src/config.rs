use std::{error::Error, fmt, path::Path};

use crate::{bridge::DEFAULT_DEBOUNCE, topics, DeviceId, FailurePolicy, NodeConfig, QoS, Timestamp};

pub const CONFIG_FILE_NAME: &str = "node-config.toml";

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Broker url, e.g. `mqtt://localhost:1883`.
    pub broker: String,
    pub device_name: String,
    /// Overrides the id derived from `device_name` and the host name.
    pub device_id: Option<String>,
    pub unique_topics: bool,
    pub subscribe_qos: QoS,
    pub publish_qos: QoS,
    pub publish_retain: bool,
    pub keep_alive_secs: u16,
    pub debounce_ms: u64,
    pub commands: bool,
    pub failure_policy: FailurePolicy,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Pacing of the emulated converter.
    pub sample_interval_us: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: "mqtt://localhost:1883".into(),
            device_name: "pico".into(),
            device_id: None,
            unique_topics: false,
            subscribe_qos: QoS::AtLeastOnce,
            publish_qos: QoS::AtLeastOnce,
            publish_retain: false,
            keep_alive_secs: 60,
            debounce_ms: DEFAULT_DEBOUNCE.as_millis(),
            commands: false,
            failure_policy: FailurePolicy::Abort,
            username: None,
            password: None,
            sample_interval_us: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceIdError {
    TooLong(usize),
    /// Empty, or not usable as a single topic level.
    Invalid(String),
}

impl fmt::Display for DeviceIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceIdError::TooLong(len) => write!(
                f,
                "device id of {len} bytes exceeds {} bytes",
                crate::DEVICE_ID_LEN
            ),
            DeviceIdError::Invalid(id) => {
                write!(f, "device id '{id}' can not be used as a topic level")
            }
        }
    }
}

impl Error for DeviceIdError {}

impl Config {
    /// Load `path`, or the first `node-config.toml` found in the current directory or any
    /// of its ancestors.
    pub fn load(path: Option<&Path>) -> Result<Self, Box<dyn Error>> {
        let paths = match path {
            Some(p) => vec![p.into()],
            None => std::env::current_dir()?
                .ancestors()
                .map(|path| path.join(CONFIG_FILE_NAME))
                .collect(),
        };

        let mut last_error = None;

        for path in paths {
            match std::fs::read_to_string(&path) {
                Ok(config_string) => {
                    log::debug!("Loading configuration from {}", path.display());
                    return Self::parse(&config_string);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => e.into(),
            None => format!("no {CONFIG_FILE_NAME} found").into(),
        })
    }

    pub fn parse(config_string: &str) -> Result<Self, Box<dyn Error>> {
        Ok(toml::from_str(config_string)?)
    }

    /// The configured id, or `<device_name>` followed by four hex digits of a checksum of
    /// `host_name`, so nodes with the same name on different hosts do not collide.
    pub fn device_id(&self, host_name: &str) -> Result<DeviceId, DeviceIdError> {
        let id = match &self.device_id {
            Some(id) => id.clone(),
            None => {
                let mut hasher = adler::Adler32::new();
                hasher.write_slice(host_name.as_bytes());
                let checksum = hasher.checksum();
                let suffix = (checksum >> 16) ^ (checksum & 0xffff);
                format!("{}{suffix:04x}", self.device_name)
            }
        };

        if !topics::is_valid_level(&id) {
            return Err(DeviceIdError::Invalid(id));
        }

        let mut device_id = DeviceId::new();
        device_id
            .push_str(&id)
            .map_err(|_| DeviceIdError::TooLong(id.len()))?;
        Ok(device_id)
    }

    pub fn node_config(&self, device_id: DeviceId) -> NodeConfig {
        NodeConfig {
            unique_topics: self.unique_topics,
            subscribe_qos: self.subscribe_qos,
            publish_qos: self.publish_qos,
            publish_retain: self.publish_retain,
            commands: self.commands,
            debounce: Timestamp::from_millis(self.debounce_ms),
            ..NodeConfig::new(device_id)
        }
    }
}
