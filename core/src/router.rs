//! Inbound message assembly and topic dispatch.
//!
//! The transport announces a message with its topic and total length first and then hands
//! over the payload in one or more chunks. Only one message is ever assembled at a time:
//! the payload chunks always belong to the most recently announced topic.

use crate::topics::{
    self, Topic, TopicNamespace, EXIT_COMMAND, HEIGHT_SUFFIX, LED_COMMAND, MAX_TOPIC_LEN,
    PING_COMMAND, PRINT_COMMAND, PROBE_PREFIX, TABLES_PREFIX,
};

pub const MAX_PAYLOAD_LEN: usize = 256;

pub type Payload = heapless::Vec<u8, MAX_PAYLOAD_LEN>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: Topic,
    pub payload: Payload,
}

impl InboundMessage {
    pub fn payload_str(&self) -> &str {
        core::str::from_utf8(&self.payload).unwrap_or("<GIBBERISH>")
    }
}

#[derive(Debug)]
enum Assembly {
    Idle,
    Receiving {
        topic: Topic,
        expected: usize,
        payload: Payload,
    },
    /// The announced message does not fit; swallow its chunks.
    Discarding,
}

#[derive(Debug)]
pub struct InboundAssembler {
    state: Assembly,
}

impl InboundAssembler {
    pub const fn new() -> Self {
        Self {
            state: Assembly::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, Assembly::Idle)
    }

    /// A new message on `topic` with `total_len` payload bytes is coming.
    pub fn begin(&mut self, topic: &str, total_len: usize) {
        if let Assembly::Receiving { topic: pending, .. } = &self.state {
            log::warn!("Dropping incomplete message on '{pending}', a new one started");
        }

        if total_len > MAX_PAYLOAD_LEN {
            log::warn!(
                "Dropping message on '{topic}': payload of {total_len} bytes exceeds {MAX_PAYLOAD_LEN}"
            );
            self.state = Assembly::Discarding;
            return;
        }

        let mut t = Topic::new();
        if t.push_str(topic).is_err() {
            log::warn!("Dropping message: topic longer than {MAX_TOPIC_LEN} bytes");
            self.state = Assembly::Discarding;
            return;
        }

        self.state = Assembly::Receiving {
            topic: t,
            expected: total_len,
            payload: Payload::new(),
        };
    }

    /// Feed one payload chunk. Returns the message once it is complete.
    pub fn chunk(&mut self, data: &[u8], last: bool) -> Option<InboundMessage> {
        match &mut self.state {
            Assembly::Idle => {
                log::warn!("Ignoring {} payload bytes without a topic", data.len());
                None
            }
            Assembly::Discarding => {
                if last {
                    self.state = Assembly::Idle;
                }
                None
            }
            Assembly::Receiving {
                expected, payload, ..
            } => {
                let room = *expected - payload.len();
                let take = data.len().min(room);
                if take < data.len() {
                    log::warn!(
                        "Ignoring {} payload bytes past the announced length",
                        data.len() - take
                    );
                }
                // `expected` is at most the capacity, this cannot overflow
                let _ = payload.extend_from_slice(&data[..take]);

                let complete = payload.len() == *expected;
                if !(complete || last) {
                    return None;
                }

                match core::mem::replace(&mut self.state, Assembly::Idle) {
                    Assembly::Receiving { topic, payload, .. } if complete => {
                        Some(InboundMessage { topic, payload })
                    }
                    Assembly::Receiving {
                        topic,
                        payload,
                        expected,
                    } => {
                        log::warn!(
                            "Dropping truncated message on '{topic}': {} of {expected} bytes",
                            payload.len()
                        );
                        None
                    }
                    _ => None,
                }
            }
        }
    }
}

impl Default for InboundAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Where an inbound message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'t> {
    /// A table answered our probe, the payload is its id.
    Probe,
    Print,
    Ping,
    Exit,
    Led,
    /// Height report of the given table.
    TableHeight(&'t str),
    Unknown,
}

/// Classify `topic` by its suffix after the namespace prefix.
pub fn route<'t>(ns: &TopicNamespace, device_id: &str, topic: &'t str) -> Route<'t> {
    let Some(suffix) = ns.strip(topic) else {
        return Route::Unknown;
    };

    match suffix {
        PRINT_COMMAND => Route::Print,
        PING_COMMAND => Route::Ping,
        EXIT_COMMAND => Route::Exit,
        LED_COMMAND => Route::Led,
        _ => {
            if suffix.strip_prefix(PROBE_PREFIX) == Some(device_id) {
                return Route::Probe;
            }

            suffix
                .strip_prefix(TABLES_PREFIX)
                .and_then(|rest| rest.strip_suffix(HEIGHT_SUFFIX))
                .filter(|table| topics::is_valid_level(table))
                .map_or(Route::Unknown, Route::TableHeight)
        }
    }
}
