//! Binding this node to a remote table.
//!
//! After connecting, the node subscribes to its probe topic and waits. A table that wants
//! to be driven by this node publishes its id there; the node then follows that table's
//! height topic and stops listening for probes. An `exit` command unsubscribes everything
//! and disconnects once the broker confirmed all unsubscribes.

use core::fmt;

use crate::{
    node::NodeError,
    topics::{self, Topic, TopicNamespace},
    transport::{AckResult, QoS, Transport},
};

pub const MAX_TABLE_ID_LEN: usize = 32;
/// Probe, table height and the command topics.
pub const MAX_TRACKED_SUBSCRIPTIONS: usize = 8;

pub type TableId = heapless::String<MAX_TABLE_ID_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ProbePublished,
    Bound,
    Unbinding,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableIdError {
    NotUtf8,
    Invalid,
    TooLong,
}

impl fmt::Display for TableIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableIdError::NotUtf8 => write!(f, "table id is not UTF-8"),
            TableIdError::Invalid => write!(f, "table id is empty or not a single topic level"),
            TableIdError::TooLong => write!(f, "table id exceeds {MAX_TABLE_ID_LEN} bytes"),
        }
    }
}

pub fn parse_table_id(payload: &[u8]) -> Result<TableId, TableIdError> {
    let id = core::str::from_utf8(payload).map_err(|_| TableIdError::NotUtf8)?;
    if !topics::is_valid_level(id) {
        return Err(TableIdError::Invalid);
    }

    let mut table = TableId::new();
    table.push_str(id).map_err(|_| TableIdError::TooLong)?;
    Ok(table)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerError {
    /// An acknowledgment arrived for which no request was counted.
    Underflow,
}

/// Running count of broker-confirmed subscriptions and of requests still in flight.
///
/// Acks are matched by count only, never by topic, so they may be delivered in any order
/// relative to the requests that caused them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionLedger {
    active: u32,
    pending_subscribes: u32,
    pending_unsubscribes: u32,
    stop_requested: bool,
    disconnect_issued: bool,
}

impl SubscriptionLedger {
    pub fn active(&self) -> u32 {
        self.active
    }

    pub fn pending_subscribes(&self) -> u32 {
        self.pending_subscribes
    }

    pub fn pending_unsubscribes(&self) -> u32 {
        self.pending_unsubscribes
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn subscribe_requested(&mut self) {
        self.pending_subscribes += 1;
    }

    /// Settle one outstanding subscribe. Only an accepted one becomes active.
    pub fn subscribe_acked(&mut self, accepted: bool) -> Result<(), LedgerError> {
        self.pending_subscribes = self
            .pending_subscribes
            .checked_sub(1)
            .ok_or(LedgerError::Underflow)?;
        if accepted {
            self.active += 1;
        }
        Ok(())
    }

    pub fn unsubscribe_requested(&mut self) {
        self.pending_unsubscribes += 1;
    }

    /// Settle one outstanding unsubscribe. A rejected one is settled too: nothing will
    /// retry it, and the disconnect drops whatever the broker kept.
    pub fn unsubscribe_acked(&mut self, accepted: bool) -> Result<(), LedgerError> {
        self.pending_unsubscribes = self
            .pending_unsubscribes
            .checked_sub(1)
            .ok_or(LedgerError::Underflow)?;
        if accepted {
            // A subscribe rejected after its unsubscribe went out was never counted
            self.active = self.active.saturating_sub(1);
        }
        Ok(())
    }

    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// True exactly once: the first time a stop was requested and no subscribe or
    /// unsubscribe is waiting for the broker anymore.
    pub fn take_disconnect(&mut self) -> bool {
        let drained = self.pending_subscribes == 0 && self.pending_unsubscribes == 0;
        if self.stop_requested && drained && !self.disconnect_issued {
            self.disconnect_issued = true;
            true
        } else {
            false
        }
    }
}

/// A topic this session subscribed to.
#[derive(Debug, Clone)]
struct Subscription {
    topic: Topic,
    /// The broker accepted the subscribe.
    confirmed: bool,
    /// Unsubscribe requested while the subscribe was still unanswered.
    dropped: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub subscribe_qos: QoS,
    /// Also listen for the `print`, `ping`, `exit` and `led` commands.
    pub commands: bool,
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    binding: Option<TableId>,
    ledger: SubscriptionLedger,
    /// In subscribe order, so subscribe acks settle the first unconfirmed entry.
    tracked: heapless::Vec<Subscription, MAX_TRACKED_SUBSCRIPTIONS>,
    probe_topic: Topic,
    settings: SessionSettings,
}

impl Session {
    pub fn new(
        ns: &TopicNamespace,
        device_id: &str,
        settings: SessionSettings,
    ) -> Result<Self, NodeError> {
        Ok(Self {
            state: SessionState::Idle,
            binding: None,
            ledger: SubscriptionLedger::default(),
            tracked: heapless::Vec::new(),
            probe_topic: topics::probe_topic(ns, device_id)?,
            settings,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn binding(&self) -> Option<&str> {
        self.binding.as_deref()
    }

    pub fn ledger(&self) -> &SubscriptionLedger {
        &self.ledger
    }

    /// Topics subscribed, or being subscribed, that have not been unsubscribed.
    pub fn tracked(&self) -> impl Iterator<Item = &str> {
        self.tracked
            .iter()
            .filter(|s| !s.dropped)
            .map(|s| s.topic.as_str())
    }

    /// Start advertising: listen on the probe topic (and the commands).
    pub fn initialize<T: Transport>(
        &mut self,
        ns: &TopicNamespace,
        transport: &mut T,
    ) -> Result<(), NodeError> {
        if self.state != SessionState::Idle {
            log::debug!("Session already initialized ({:?})", self.state);
            return Ok(());
        }

        log::info!("Subscribing to topic {}", self.probe_topic);
        let probe = self.probe_topic.clone();
        self.subscribe(transport, probe)?;

        if self.settings.commands {
            for command in topics::COMMANDS {
                self.subscribe(transport, topics::command_topic(ns, command)?)?;
            }
        }

        self.state = SessionState::ProbePublished;
        Ok(())
    }

    /// A table answered the probe with its id in `payload`.
    pub fn accept_probe<T: Transport>(
        &mut self,
        ns: &TopicNamespace,
        payload: &[u8],
        transport: &mut T,
    ) -> Result<(), NodeError> {
        if self.state != SessionState::ProbePublished {
            log::warn!("Ignoring table probe in state {:?}", self.state);
            return Ok(());
        }

        let table = match parse_table_id(payload) {
            Ok(table) => table,
            Err(e) => {
                log::warn!("Ignoring table probe: {e}");
                return Ok(());
            }
        };

        log::info!("Received table check message: {table}, binding to it");
        let height_topic = topics::height_topic(ns, &table)?;
        self.binding = Some(table);
        self.state = SessionState::Bound;

        log::info!("Subscribing to topic {height_topic}");
        self.subscribe(transport, height_topic)?;

        log::info!("Unsubscribing from topic {}", self.probe_topic);
        let probe = self.probe_topic.clone();
        self.unsubscribe(transport, &probe)
    }

    /// Unsubscribe from everything; disconnect once the broker confirmed it.
    pub fn request_shutdown<T: Transport>(&mut self, transport: &mut T) -> Result<(), NodeError> {
        match self.state {
            SessionState::ProbePublished | SessionState::Bound => {}
            SessionState::Idle => {
                log::warn!("Ignoring exit request before the session started");
                return Ok(());
            }
            SessionState::Unbinding | SessionState::Terminated => {
                log::debug!("Already shutting down");
                return Ok(());
            }
        }

        log::info!("Exit requested, unsubscribing from {} topics", self.tracked().count());
        self.ledger.request_stop();
        self.state = SessionState::Unbinding;

        while let Some(topic) = self
            .tracked
            .iter()
            .rev()
            .find(|s| !s.dropped)
            .map(|s| s.topic.clone())
        {
            self.unsubscribe(transport, &topic)?;
        }

        self.disconnect_if_drained(transport)
    }

    pub fn on_subscribe_ack<T: Transport>(
        &mut self,
        result: AckResult,
        transport: &mut T,
    ) -> Result<(), NodeError> {
        self.ledger.subscribe_acked(result.is_ok())?;
        self.settle_subscribe(result.is_ok());

        let disconnect = self.disconnect_if_drained(transport);
        result.map_err(|e| NodeError::SubscribeRejected(e.0))?;
        disconnect
    }

    pub fn on_unsubscribe_ack<T: Transport>(
        &mut self,
        result: AckResult,
        transport: &mut T,
    ) -> Result<(), NodeError> {
        self.ledger.unsubscribe_acked(result.is_ok())?;

        let disconnect = self.disconnect_if_drained(transport);
        result.map_err(|e| NodeError::UnsubscribeRejected(e.0))?;
        disconnect
    }

    fn subscribe<T: Transport>(&mut self, transport: &mut T, topic: Topic) -> Result<(), NodeError> {
        transport
            .subscribe(&topic, self.settings.subscribe_qos)
            .map_err(|e| {
                log::error!("Could not request subscription to '{topic}': {e:?}");
                NodeError::SubscribeRequest
            })?;
        self.ledger.subscribe_requested();
        self.tracked
            .push(Subscription {
                topic,
                confirmed: false,
                dropped: false,
            })
            .map_err(|_| NodeError::TooManySubscriptions)
    }

    /// The broker answers subscribes in order: the ack belongs to the oldest unconfirmed one.
    fn settle_subscribe(&mut self, accepted: bool) {
        let Some(index) = self.tracked.iter().position(|s| !s.confirmed) else {
            return;
        };

        let subscription = &mut self.tracked[index];
        if accepted && !subscription.dropped {
            subscription.confirmed = true;
        } else {
            if !accepted {
                log::warn!("Subscription to '{}' was rejected", subscription.topic);
            }
            self.tracked.remove(index);
        }
    }

    fn unsubscribe<T: Transport>(&mut self, transport: &mut T, topic: &str) -> Result<(), NodeError> {
        // Forget the topic either way, a failed request is not retried. An unanswered
        // subscribe stays until its ack arrives.
        if let Some(index) = self
            .tracked
            .iter()
            .position(|s| !s.dropped && s.topic == topic)
        {
            if self.tracked[index].confirmed {
                self.tracked.remove(index);
            } else {
                self.tracked[index].dropped = true;
            }
        }

        transport.unsubscribe(topic).map_err(|e| {
            log::error!("Could not request unsubscribe from '{topic}': {e:?}");
            NodeError::UnsubscribeRequest
        })?;
        self.ledger.unsubscribe_requested();
        Ok(())
    }

    fn disconnect_if_drained<T: Transport>(&mut self, transport: &mut T) -> Result<(), NodeError> {
        if !self.ledger.take_disconnect() {
            return Ok(());
        }

        log::info!("All subscriptions stopped, disconnecting");
        self.state = SessionState::Terminated;
        transport.disconnect().map_err(|e| {
            log::error!("Could not request disconnect: {e:?}");
            NodeError::DisconnectRequest
        })
    }
}
