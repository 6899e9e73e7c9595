use core::fmt::{self, Write};

use crate::DeviceId;

pub const MAX_TOPIC_LEN: usize = 100;

pub type Topic = heapless::String<MAX_TOPIC_LEN>;

/// Retained announcement carrying the device id. Also the last-will topic.
pub const LIVENESS_TOPIC: &str = "online";
pub const LIVENESS_WILL_PAYLOAD: &str = "0";
pub const UPTIME_TOPIC: &str = "uptime";
pub const LED_STATE_TOPIC: &str = "led/state";

pub const PROBE_PREFIX: &str = "checkForTable/";
pub const TABLES_PREFIX: &str = "tables/";
pub const HEIGHT_SUFFIX: &str = "/height";
pub const SET_HEIGHT_SUFFIX: &str = "/setHeight";

pub const PRINT_COMMAND: &str = "print";
pub const PING_COMMAND: &str = "ping";
pub const EXIT_COMMAND: &str = "exit";
pub const LED_COMMAND: &str = "led";
pub const COMMANDS: [&str; 4] = [PRINT_COMMAND, PING_COMMAND, EXIT_COMMAND, LED_COMMAND];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicTooLong;

impl fmt::Display for TopicTooLong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "topic exceeds {MAX_TOPIC_LEN} bytes")
    }
}

impl core::error::Error for TopicTooLong {}

/// Optional per-device prefix in front of every topic the node uses.
///
/// With a per-device namespace several nodes can share one broker: `ping` becomes
/// `<device-id>/ping`. The choice is made once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNamespace {
    prefix: Option<DeviceId>,
}

impl TopicNamespace {
    pub const fn shared() -> Self {
        Self { prefix: None }
    }

    pub fn per_device(device_id: &DeviceId) -> Self {
        Self {
            prefix: Some(device_id.clone()),
        }
    }

    pub fn is_per_device(&self) -> bool {
        self.prefix.is_some()
    }

    /// Builds a full topic from the formatted suffix.
    pub fn topic(&self, suffix: fmt::Arguments<'_>) -> Result<Topic, TopicTooLong> {
        let mut s = Topic::new();
        if let Some(prefix) = &self.prefix {
            write!(s, "{prefix}/").map_err(|_| TopicTooLong)?;
        }
        s.write_fmt(suffix).map_err(|_| TopicTooLong)?;
        Ok(s)
    }

    /// Removes the namespace prefix. `None` when the topic is outside the namespace.
    pub fn strip<'t>(&self, topic: &'t str) -> Option<&'t str> {
        match &self.prefix {
            None => Some(topic),
            Some(prefix) => topic.strip_prefix(prefix.as_str())?.strip_prefix('/'),
        }
    }
}

pub fn liveness_topic(ns: &TopicNamespace) -> Result<Topic, TopicTooLong> {
    ns.topic(format_args!("{LIVENESS_TOPIC}"))
}

pub fn uptime_topic(ns: &TopicNamespace) -> Result<Topic, TopicTooLong> {
    ns.topic(format_args!("{UPTIME_TOPIC}"))
}

pub fn led_state_topic(ns: &TopicNamespace) -> Result<Topic, TopicTooLong> {
    ns.topic(format_args!("{LED_STATE_TOPIC}"))
}

pub fn probe_topic(ns: &TopicNamespace, device_id: &str) -> Result<Topic, TopicTooLong> {
    ns.topic(format_args!("{PROBE_PREFIX}{device_id}"))
}

pub fn height_topic(ns: &TopicNamespace, table: &str) -> Result<Topic, TopicTooLong> {
    ns.topic(format_args!("{TABLES_PREFIX}{table}{HEIGHT_SUFFIX}"))
}

pub fn set_height_topic(ns: &TopicNamespace, table: &str) -> Result<Topic, TopicTooLong> {
    ns.topic(format_args!("{TABLES_PREFIX}{table}{SET_HEIGHT_SUFFIX}"))
}

pub fn command_topic(ns: &TopicNamespace, command: &str) -> Result<Topic, TopicTooLong> {
    ns.topic(format_args!("{command}"))
}

/// Characters that would change the meaning of a topic level.
pub fn is_valid_level(level: &str) -> bool {
    !level.is_empty() && !level.contains(['/', '+', '#', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceId {
        let mut id = DeviceId::new();
        id.push_str("pico1a2b").unwrap();
        id
    }

    #[test]
    fn shared_namespace_topics() {
        let ns = TopicNamespace::shared();
        assert_eq!(liveness_topic(&ns).unwrap(), "online");
        assert_eq!(probe_topic(&ns, "pico1a2b").unwrap(), "checkForTable/pico1a2b");
        assert_eq!(height_topic(&ns, "table7").unwrap(), "tables/table7/height");
        assert_eq!(set_height_topic(&ns, "table7").unwrap(), "tables/table7/setHeight");
    }

    #[test]
    fn per_device_namespace_topics() {
        let ns = TopicNamespace::per_device(&device());
        assert_eq!(uptime_topic(&ns).unwrap(), "pico1a2b/uptime");
        assert_eq!(led_state_topic(&ns).unwrap(), "pico1a2b/led/state");
        assert_eq!(command_topic(&ns, EXIT_COMMAND).unwrap(), "pico1a2b/exit");
    }

    #[test]
    fn strip_namespace() {
        let ns = TopicNamespace::per_device(&device());
        assert_eq!(ns.strip("pico1a2b/ping"), Some("ping"));
        assert_eq!(ns.strip("pico1a2bping"), None);
        assert_eq!(ns.strip("other/ping"), None);
        assert_eq!(TopicNamespace::shared().strip("ping"), Some("ping"));
    }

    #[test]
    fn overlong_topic_is_rejected() {
        let ns = TopicNamespace::shared();
        let table = "t".repeat(MAX_TOPIC_LEN);
        assert_eq!(height_topic(&ns, &table), Err(TopicTooLong));
    }

    #[test]
    fn topic_levels() {
        assert!(is_valid_level("table7"));
        assert!(!is_valid_level(""));
        assert!(!is_valid_level("a/b"));
        assert!(!is_valid_level("#"));
        assert!(!is_valid_level("+"));
    }
}
