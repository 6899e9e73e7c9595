//! The node context: one owned object holding every piece of application state.
//!
//! All transport notifications and button edges are fed into a [`Node`] one at a time.
//! Nothing in here blocks or waits: every operation runs to completion and queues at most
//! a few transport requests.

use core::fmt::{self, Write};

use crate::{
    bridge::{BridgeOutcome, Debouncer, Millimeters, DEFAULT_DEBOUNCE},
    router::{self, InboundAssembler, InboundMessage, Route},
    sample::SampleReader,
    session::{LedgerError, Session, SessionSettings, SessionState},
    topics::{self, TopicNamespace, TopicTooLong},
    transport::{AckResult, ConnectionStatus, QoS, Transport},
    DeviceId, Timestamp,
};

/// Board facilities the node needs besides the ADC.
pub trait Board {
    /// Time since boot.
    fn uptime(&self) -> Timestamp;

    fn set_led(&mut self, on: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Shutting down: unsubscribing and then disconnecting.
    Terminating,
}

/// What to do with a [`NodeError`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "config",
    derive(serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum FailurePolicy {
    /// Stop the process. The subscription state can not be trusted anymore.
    #[default]
    Abort,
    /// Log and carry on.
    Continue,
}

impl FailurePolicy {
    /// Turn an error into `Ok` when the policy is to carry on.
    pub fn apply(self, result: Result<(), NodeError>) -> Result<(), NodeError> {
        match (self, result) {
            (FailurePolicy::Continue, Err(e)) => {
                log::error!("{e}, continuing");
                Ok(())
            }
            (_, result) => result,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeError {
    /// The connection dropped before it was ever established.
    ConnectFailed,
    /// The transport reported a connection status other than accepted or disconnected.
    UnexpectedStatus(u8),
    SubscribeRejected(u8),
    UnsubscribeRejected(u8),
    /// The broker acknowledged more than was requested.
    LedgerUnderflow,
    SubscribeRequest,
    UnsubscribeRequest,
    DisconnectRequest,
    TooManySubscriptions,
    TopicTooLong,
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::ConnectFailed => write!(f, "failed to connect to the MQTT server"),
            NodeError::UnexpectedStatus(code) => {
                write!(f, "unexpected connection status {code}")
            }
            NodeError::SubscribeRejected(code) => {
                write!(f, "subscribe request failed with code {code:#04x}")
            }
            NodeError::UnsubscribeRejected(code) => {
                write!(f, "unsubscribe request failed with code {code:#04x}")
            }
            NodeError::LedgerUnderflow => {
                write!(f, "acknowledgment without an outstanding request")
            }
            NodeError::SubscribeRequest => write!(f, "could not queue a subscribe request"),
            NodeError::UnsubscribeRequest => write!(f, "could not queue an unsubscribe request"),
            NodeError::DisconnectRequest => write!(f, "could not queue a disconnect request"),
            NodeError::TooManySubscriptions => write!(f, "too many tracked subscriptions"),
            NodeError::TopicTooLong => TopicTooLong.fmt(f),
        }
    }
}

impl core::error::Error for NodeError {}

impl From<TopicTooLong> for NodeError {
    fn from(_: TopicTooLong) -> Self {
        Self::TopicTooLong
    }
}

impl From<LedgerError> for NodeError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::Underflow => Self::LedgerUnderflow,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub device_id: DeviceId,
    /// Prefix every topic with `<device-id>/`.
    pub unique_topics: bool,
    pub subscribe_qos: QoS,
    pub publish_qos: QoS,
    pub publish_retain: bool,
    /// Subscribe to the `print`, `ping`, `exit` and `led` command topics.
    pub commands: bool,
    pub debounce: Timestamp,
}

impl NodeConfig {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            unique_topics: false,
            subscribe_qos: QoS::AtLeastOnce,
            publish_qos: QoS::AtLeastOnce,
            publish_retain: false,
            commands: false,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn namespace(&self) -> TopicNamespace {
        if self.unique_topics {
            TopicNamespace::per_device(&self.device_id)
        } else {
            TopicNamespace::shared()
        }
    }
}

/// QoS of the retained liveness announcement.
const LIVENESS_QOS: QoS = QoS::AtLeastOnce;

pub struct Node<T, B> {
    config: NodeConfig,
    namespace: TopicNamespace,
    transport: T,
    board: B,
    samples: SampleReader,
    connection: ConnectionState,
    ever_connected: bool,
    finished: bool,
    session: Session,
    inbound: InboundAssembler,
    debouncer: Debouncer,
}

impl<T: Transport, B: Board> Node<T, B> {
    pub fn new(
        config: NodeConfig,
        transport: T,
        board: B,
        samples: SampleReader,
    ) -> Result<Self, NodeError> {
        let namespace = config.namespace();
        let session = Session::new(
            &namespace,
            &config.device_id,
            SessionSettings {
                subscribe_qos: config.subscribe_qos,
                commands: config.commands,
            },
        )?;

        Ok(Self {
            debouncer: Debouncer::new(config.debounce),
            config,
            namespace,
            transport,
            board,
            samples,
            connection: ConnectionState::Disconnected,
            ever_connected: false,
            finished: false,
            session,
            inbound: InboundAssembler::new(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    /// The runtime has handed the connect request to the transport.
    pub fn start(&mut self) {
        if self.connection == ConnectionState::Disconnected && !self.finished {
            self.connection = ConnectionState::Connecting;
        }
    }

    /// The connection was established once and is gone again, or it failed for good.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn on_connection_status(&mut self, status: ConnectionStatus) -> Result<(), NodeError> {
        if self.finished {
            log::debug!("Ignoring connection status {status:?} after shutdown");
            return Ok(());
        }

        match status {
            ConnectionStatus::Accepted => {
                log::info!("Connected to the MQTT server");
                let first = !self.ever_connected;
                self.ever_connected = true;
                if self.connection != ConnectionState::Terminating {
                    self.connection = ConnectionState::Connected;
                }

                self.announce();
                if first {
                    self.session.initialize(&self.namespace, &mut self.transport)?;
                }
                Ok(())
            }
            ConnectionStatus::Disconnected => {
                self.finished = true;
                self.connection = ConnectionState::Disconnected;
                if self.ever_connected {
                    log::info!("Disconnected from the MQTT server");
                    Ok(())
                } else {
                    log::error!("Failed to connect to the MQTT server");
                    Err(NodeError::ConnectFailed)
                }
            }
            ConnectionStatus::Refused(code) => {
                log::error!("Unexpected connection status {code}");
                self.finished = true;
                self.connection = ConnectionState::Disconnected;
                Err(NodeError::UnexpectedStatus(code))
            }
        }
    }

    pub fn on_publish_ack(&mut self, result: AckResult) {
        if let Err(e) = result {
            log::error!("Publish request failed with code {:#04x}", e.0);
        }
    }

    pub fn on_subscribe_ack(&mut self, result: AckResult) -> Result<(), NodeError> {
        self.session.on_subscribe_ack(result, &mut self.transport)
    }

    pub fn on_unsubscribe_ack(&mut self, result: AckResult) -> Result<(), NodeError> {
        self.session
            .on_unsubscribe_ack(result, &mut self.transport)
    }

    /// A message on `topic` with `total_len` payload bytes follows.
    pub fn on_topic_begin(&mut self, topic: &str, total_len: usize) {
        self.inbound.begin(topic, total_len);
    }

    pub fn on_payload_chunk(&mut self, data: &[u8], last: bool) -> Result<(), NodeError> {
        match self.inbound.chunk(data, last) {
            Some(message) => self.dispatch(&message),
            None => Ok(()),
        }
    }

    /// A complete message in one piece.
    pub fn on_message(&mut self, topic: &str, payload: &[u8]) -> Result<(), NodeError> {
        self.on_topic_begin(topic, payload.len());
        self.on_payload_chunk(payload, true)
    }

    /// Debounced falling edge of the "send height" button.
    pub fn on_button_edge(&mut self) -> BridgeOutcome {
        if !self.debouncer.accept(self.board.uptime()) {
            return BridgeOutcome::Debounced;
        }

        let Some(table) = self.session.binding() else {
            log::info!("No table connected, ignoring ADC value");
            return BridgeOutcome::Unbound;
        };

        let Some(raw) = self.samples.latest_sample() else {
            log::warn!("No ADC sample captured yet");
            return BridgeOutcome::NoSample;
        };

        let height = Millimeters::from_raw(raw);
        let topic = match topics::set_height_topic(&self.namespace, table) {
            Ok(topic) => topic,
            Err(e) => {
                log::error!("Could not publish height: {e}");
                return BridgeOutcome::PublishFailed;
            }
        };

        log::info!("ADC value {raw} maps to {height}, publishing to {topic}");
        match self.transport.publish(
            &topic,
            height.to_payload().as_bytes(),
            self.config.publish_qos,
            self.config.publish_retain,
        ) {
            Ok(()) => BridgeOutcome::Published(height),
            Err(e) => {
                log::error!("Could not publish height: {e:?}");
                BridgeOutcome::PublishFailed
            }
        }
    }

    fn dispatch(&mut self, message: &InboundMessage) -> Result<(), NodeError> {
        log::info!(
            "Topic: {}, Message: {}",
            message.topic,
            message.payload_str()
        );

        match router::route(&self.namespace, &self.config.device_id, &message.topic) {
            Route::Probe => {
                self.session
                    .accept_probe(&self.namespace, &message.payload, &mut self.transport)
            }
            Route::Print => {
                log::info!("{}", message.payload_str());
                Ok(())
            }
            Route::Ping => {
                self.publish_uptime();
                Ok(())
            }
            Route::Exit => {
                self.session.request_shutdown(&mut self.transport)?;
                if matches!(
                    self.session.state(),
                    SessionState::Unbinding | SessionState::Terminated
                ) {
                    self.connection = ConnectionState::Terminating;
                }
                Ok(())
            }
            Route::Led => {
                self.control_led(&message.payload);
                Ok(())
            }
            Route::TableHeight(table) => {
                if self.session.binding() == Some(table) {
                    log::debug!("Table {table} reports height {}", message.payload_str());
                }
                Ok(())
            }
            Route::Unknown => Ok(()),
        }
    }

    fn announce(&mut self) {
        let device_id = self.config.device_id.clone();
        self.publish(
            topics::liveness_topic(&self.namespace),
            device_id.as_bytes(),
            LIVENESS_QOS,
            true,
        );
    }

    fn publish_uptime(&mut self) {
        // u64::MAX has 20 digits
        let mut seconds = heapless::String::<20>::new();
        let _ = write!(seconds, "{}", self.board.uptime().as_secs());
        let (qos, retain) = (self.config.publish_qos, self.config.publish_retain);
        self.publish(
            topics::uptime_topic(&self.namespace),
            seconds.as_bytes(),
            qos,
            retain,
        );
    }

    fn control_led(&mut self, payload: &[u8]) {
        let on = if payload.eq_ignore_ascii_case(b"on") || payload == b"1" {
            true
        } else if payload.eq_ignore_ascii_case(b"off") || payload == b"0" {
            false
        } else {
            log::warn!(
                "Ignoring led command '{}'",
                core::str::from_utf8(payload).unwrap_or("<GIBBERISH>")
            );
            return;
        };

        self.board.set_led(on);
        let state: &[u8] = if on { b"On" } else { b"Off" };
        let (qos, retain) = (self.config.publish_qos, self.config.publish_retain);
        self.publish(topics::led_state_topic(&self.namespace), state, qos, retain);
    }

    /// Fire and forget: failures are logged, never retried.
    fn publish(
        &mut self,
        topic: Result<topics::Topic, TopicTooLong>,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) {
        let topic = match topic {
            Ok(topic) => topic,
            Err(e) => {
                log::error!("Could not publish: {e}");
                return;
            }
        };

        if let Err(e) = self.transport.publish(&topic, payload, qos, retain) {
            log::error!("Could not publish to {topic}: {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sample::{LatestSampleSlot, SampleBuffer},
        transport::{
            mock::{RecordingTransport, Request},
            AckError,
        },
    };

    #[derive(Default)]
    struct TestBoard {
        millis: u64,
        led: Option<bool>,
    }

    impl Board for TestBoard {
        fn uptime(&self) -> Timestamp {
            Timestamp::from_millis(self.millis)
        }

        fn set_led(&mut self, on: bool) {
            self.led = Some(on);
        }
    }

    const DEVICE: &str = "pico1a2b";
    const PROBE: &str = "checkForTable/pico1a2b";

    fn config() -> NodeConfig {
        let mut id = DeviceId::new();
        id.push_str(DEVICE).unwrap();
        NodeConfig::new(id)
    }

    /// A reader whose slot holds `raw`, or is still empty.
    fn samples(raw: Option<u16>) -> SampleReader {
        let slot: &'static LatestSampleSlot = Box::leak(Box::new(LatestSampleSlot::new()));
        if let Some(raw) = raw {
            // Go through the real interrupt path
            struct Dma;
            impl crate::sample::DmaChannel for Dma {
                type Error = ();
                fn arm(&mut self, _: &'static SampleBuffer) -> Result<(), ()> {
                    Ok(())
                }
                fn clear_interrupt(&mut self) {}
            }
            let buffer: &'static SampleBuffer = Box::leak(Box::new(SampleBuffer::new()));
            buffer.write(buffer.len() - 1, raw);
            let mut pipeline = crate::sample::SamplePipeline::start(Dma, buffer, slot).unwrap();
            pipeline.on_transfer_complete();
        }
        SampleReader::new(slot)
    }

    fn node_with(config: NodeConfig, raw: Option<u16>) -> Node<RecordingTransport, TestBoard> {
        let mut node = Node::new(
            config,
            RecordingTransport::default(),
            TestBoard::default(),
            samples(raw),
        )
        .unwrap();
        node.start();
        node
    }

    fn node(raw: Option<u16>) -> Node<RecordingTransport, TestBoard> {
        node_with(config(), raw)
    }

    /// Connected, probe subscription confirmed.
    fn probing(raw: Option<u16>) -> Node<RecordingTransport, TestBoard> {
        let mut node = node(raw);
        node.on_connection_status(ConnectionStatus::Accepted).unwrap();
        node.on_subscribe_ack(Ok(())).unwrap();
        node
    }

    /// Bound to table7, all acks delivered.
    fn bound(raw: Option<u16>) -> Node<RecordingTransport, TestBoard> {
        let mut node = probing(raw);
        node.on_message(PROBE, b"table7").unwrap();
        node.on_subscribe_ack(Ok(())).unwrap();
        node.on_unsubscribe_ack(Ok(())).unwrap();
        node
    }

    #[test]
    fn connect_announces_and_probes() {
        let mut node = node(None);
        assert_eq!(node.connection(), ConnectionState::Connecting);

        node.on_connection_status(ConnectionStatus::Accepted).unwrap();

        let transport = node.transport();
        assert_eq!(transport.subscribes(), [PROBE]);
        assert_eq!(
            transport.requests[0],
            Request::Publish {
                topic: "online".into(),
                payload: DEVICE.into(),
                qos: QoS::AtLeastOnce,
                retain: true,
            }
        );
        assert_eq!(transport.publishes().len(), 1);
        assert_eq!(node.connection(), ConnectionState::Connected);
        assert_eq!(node.session().state(), SessionState::ProbePublished);
    }

    #[test]
    fn reconnect_only_reannounces() {
        let mut node = probing(None);
        node.on_connection_status(ConnectionStatus::Accepted).unwrap();

        assert_eq!(node.transport().subscribes().len(), 1);
        assert_eq!(node.transport().publishes(), [("online", DEVICE), ("online", DEVICE)]);
    }

    #[test]
    fn probe_binds_to_table() {
        let mut node = probing(None);
        node.on_message(PROBE, b"table7").unwrap();

        assert_eq!(node.session().binding(), Some("table7"));
        assert_eq!(node.session().state(), SessionState::Bound);
        assert_eq!(node.transport().subscribes(), [PROBE, "tables/table7/height"]);
        assert_eq!(node.transport().unsubscribes(), [PROBE]);
    }

    #[test]
    fn probe_for_another_device_is_ignored() {
        let mut node = probing(None);
        node.on_message("checkForTable/pico9999", b"table7").unwrap();
        assert_eq!(node.session().binding(), None);
    }

    #[test]
    fn button_publishes_mapped_height() {
        let mut node = bound(Some(0));
        assert_eq!(node.on_button_edge(), BridgeOutcome::Published(Millimeters(680)));
        assert_eq!(
            node.transport().publishes().last(),
            Some(&("tables/table7/setHeight", "680"))
        );

        let mut node = bound(Some(4095));
        assert_eq!(node.on_button_edge(), BridgeOutcome::Published(Millimeters(1340)));
        assert_eq!(
            node.transport().publishes().last(),
            Some(&("tables/table7/setHeight", "1340"))
        );
    }

    #[test]
    fn same_sample_same_payload() {
        let mut node = bound(Some(1234));
        node.on_button_edge();
        node.board.millis += 1000;
        node.on_button_edge();

        let publishes = node.transport().publishes();
        let heights: Vec<_> = publishes
            .iter()
            .filter(|(topic, _)| *topic == "tables/table7/setHeight")
            .collect();
        assert_eq!(heights.len(), 2);
        assert_eq!(heights[0], heights[1]);
    }

    #[test]
    fn button_without_binding_does_nothing() {
        let mut node = probing(Some(2000));
        let before = node.transport().requests.len();

        assert_eq!(node.on_button_edge(), BridgeOutcome::Unbound);
        assert_eq!(node.transport().requests.len(), before);
    }

    #[test]
    fn button_before_first_fill_does_nothing() {
        let mut node = bound(None);
        let before = node.transport().requests.len();

        assert_eq!(node.on_button_edge(), BridgeOutcome::NoSample);
        assert_eq!(node.transport().requests.len(), before);
    }

    #[test]
    fn button_bounce_publishes_once() {
        let mut node = bound(Some(100));
        assert!(matches!(node.on_button_edge(), BridgeOutcome::Published(_)));
        node.board.millis += 10;
        assert_eq!(node.on_button_edge(), BridgeOutcome::Debounced);
        node.board.millis += 100;
        assert!(matches!(node.on_button_edge(), BridgeOutcome::Published(_)));
    }

    #[test]
    fn failed_height_publish_is_reported_not_retried() {
        let mut node = bound(Some(100));
        node.transport.fail_requests = true;
        assert_eq!(node.on_button_edge(), BridgeOutcome::PublishFailed);
    }

    #[test]
    fn exit_drains_subscriptions_before_disconnect() {
        // Exit arrives while the probe unsubscribe and the height subscribe are in flight
        let mut node = probing(None);
        node.on_message(PROBE, b"table7").unwrap();
        node.on_subscribe_ack(Ok(())).unwrap();
        assert_eq!(node.session().ledger().active(), 2);

        node.on_message("exit", b"").unwrap();
        assert_eq!(
            node.transport().unsubscribes(),
            [PROBE, "tables/table7/height"]
        );
        assert_eq!(node.connection(), ConnectionState::Terminating);
        assert_eq!(node.transport().disconnects(), 0);

        node.on_unsubscribe_ack(Ok(())).unwrap();
        assert_eq!(node.transport().disconnects(), 0);
        node.on_unsubscribe_ack(Ok(())).unwrap();
        assert_eq!(node.transport().disconnects(), 1);
        assert_eq!(node.session().state(), SessionState::Terminated);

        node.on_connection_status(ConnectionStatus::Disconnected).unwrap();
        assert!(node.is_finished());
    }

    #[test]
    fn exit_tolerates_interleaved_acks() {
        let mut node = probing(None);
        node.on_message(PROBE, b"table7").unwrap();

        // Exit before the height subscription was confirmed
        node.on_message("exit", b"").unwrap();
        assert_eq!(node.transport().unsubscribes().len(), 2);

        // The probe unsubscribe empties the ledger, but a subscribe is still outstanding
        node.on_unsubscribe_ack(Ok(())).unwrap();
        assert_eq!(node.transport().disconnects(), 0);
        node.on_subscribe_ack(Ok(())).unwrap();
        assert_eq!(node.transport().disconnects(), 0);
        node.on_unsubscribe_ack(Ok(())).unwrap();
        assert_eq!(node.transport().disconnects(), 1);
    }

    #[test]
    fn exit_with_commands_unsubscribes_everything() {
        let mut config = config();
        config.commands = true;
        let mut node = node_with(config, None);
        node.on_connection_status(ConnectionStatus::Accepted).unwrap();
        for _ in 0..5 {
            node.on_subscribe_ack(Ok(())).unwrap();
        }

        node.on_message("exit", b"").unwrap();
        let mut unsubscribed = node.transport().unsubscribes();
        unsubscribed.sort_unstable();
        assert_eq!(unsubscribed, ["checkForTable/pico1a2b", "exit", "led", "ping", "print"]);

        for _ in 0..5 {
            assert_eq!(node.transport().disconnects(), 0);
            node.on_unsubscribe_ack(Ok(())).unwrap();
        }
        assert_eq!(node.transport().disconnects(), 1);

        // Duplicate exit does nothing
        node.on_message("exit", b"").unwrap();
        assert_eq!(node.transport().disconnects(), 1);
        assert_eq!(node.transport().unsubscribes().len(), 5);
    }

    #[test]
    fn extra_unsubscribe_ack_is_an_error() {
        let mut node = bound(None);
        assert_eq!(node.on_unsubscribe_ack(Ok(())), Err(NodeError::LedgerUnderflow));
        assert_eq!(node.on_subscribe_ack(Ok(())), Err(NodeError::LedgerUnderflow));
    }

    #[test]
    fn rejected_acks_are_errors() {
        let mut node = node(None);
        node.on_connection_status(ConnectionStatus::Accepted).unwrap();
        assert_eq!(
            node.on_subscribe_ack(Err(AckError(0x80))),
            Err(NodeError::SubscribeRejected(0x80))
        );

        let mut node = probing(None);
        node.on_message(PROBE, b"table7").unwrap();
        assert_eq!(
            node.on_unsubscribe_ack(Err(AckError(0x11))),
            Err(NodeError::UnsubscribeRejected(0x11))
        );
    }

    #[test]
    fn continue_after_rejected_subscribe_then_exit() {
        let policy = FailurePolicy::Continue;
        let mut node = node(None);
        node.on_connection_status(ConnectionStatus::Accepted).unwrap();
        policy
            .apply(node.on_subscribe_ack(Err(AckError(0x80))))
            .unwrap();

        // Nothing is subscribed, so there is nothing to wait for
        node.on_message("exit", b"").unwrap();
        assert!(node.transport().unsubscribes().is_empty());
        assert_eq!(node.transport().disconnects(), 1);
        assert_eq!(node.session().state(), SessionState::Terminated);
    }

    #[test]
    fn continue_after_subscribe_rejected_during_exit() {
        let policy = FailurePolicy::Continue;
        let mut node = probing(None);
        node.on_message(PROBE, b"table7").unwrap();
        node.on_message("exit", b"").unwrap();
        assert_eq!(node.transport().unsubscribes(), [PROBE, "tables/table7/height"]);

        node.on_unsubscribe_ack(Ok(())).unwrap();
        policy
            .apply(node.on_subscribe_ack(Err(AckError(0x80))))
            .unwrap();
        // The height unsubscribe is still in flight
        assert_eq!(node.transport().disconnects(), 0);

        assert_eq!(node.on_unsubscribe_ack(Ok(())), Ok(()));
        assert_eq!(node.transport().disconnects(), 1);
        assert_eq!(node.session().ledger().active(), 0);
    }

    #[test]
    fn rejected_unsubscribe_does_not_stall_exit() {
        let mut node = bound(None);
        node.on_message("exit", b"").unwrap();
        assert_eq!(node.transport().disconnects(), 0);

        let result = node.on_unsubscribe_ack(Err(AckError(0x11)));
        assert_eq!(result, Err(NodeError::UnsubscribeRejected(0x11)));
        assert_eq!(FailurePolicy::Continue.apply(result), Ok(()));

        assert_eq!(node.transport().disconnects(), 1);
        assert_eq!(node.session().state(), SessionState::Terminated);
    }

    #[test]
    fn disconnect_before_connect_is_fatal_once() {
        let mut node = node(None);
        let fatal = (0..3)
            .filter(|_| node.on_connection_status(ConnectionStatus::Disconnected).is_err())
            .count();

        assert_eq!(fatal, 1);
        assert!(node.is_finished());
        assert!(node.transport().requests.is_empty());
    }

    #[test]
    fn other_status_is_fatal() {
        let mut node = node(None);
        assert_eq!(
            node.on_connection_status(ConnectionStatus::Refused(5)),
            Err(NodeError::UnexpectedStatus(5))
        );
        assert!(node.is_finished());
    }

    #[test]
    fn disconnect_after_connect_is_normal() {
        let mut node = probing(None);
        assert_eq!(node.on_connection_status(ConnectionStatus::Disconnected), Ok(()));
        assert!(node.is_finished());
        assert_eq!(node.connection(), ConnectionState::Disconnected);
    }

    #[test]
    fn failure_policy() {
        let error = Err(NodeError::SubscribeRejected(0x80));
        assert_eq!(FailurePolicy::Abort.apply(error), error);
        assert_eq!(FailurePolicy::Continue.apply(error), Ok(()));
        assert_eq!(FailurePolicy::Abort.apply(Ok(())), Ok(()));
    }

    #[test]
    fn ping_publishes_uptime() {
        let mut node = probing(None);
        node.board.millis = 42_999;
        node.on_message("ping", b"").unwrap();
        assert_eq!(node.transport().publishes().last(), Some(&("uptime", "42")));
    }

    #[test]
    fn led_command_sets_led_and_reports() {
        let mut node = probing(None);
        node.on_message("led", b"On").unwrap();
        assert_eq!(node.board().led, Some(true));
        assert_eq!(node.transport().publishes().last(), Some(&("led/state", "On")));

        node.on_message("led", b"0").unwrap();
        assert_eq!(node.board().led, Some(false));
        assert_eq!(node.transport().publishes().last(), Some(&("led/state", "Off")));

        let before = node.transport().requests.len();
        node.on_message("led", b"blink").unwrap();
        assert_eq!(node.transport().requests.len(), before);
    }

    #[test]
    fn unknown_topics_change_nothing() {
        let mut node = bound(Some(10));
        let before = node.transport().requests.len();
        let state = node.session().state();

        for topic in ["", "tables/other/height", "tables/table7/height", "nonsense", "print/x"] {
            node.on_message(topic, b"payload").unwrap();
        }
        node.on_message("print", b"just a log line").unwrap();

        assert_eq!(node.transport().requests.len(), before);
        assert_eq!(node.session().state(), state);
        assert_eq!(node.session().binding(), Some("table7"));
    }

    #[test]
    fn chunked_probe_is_reassembled() {
        let mut node = probing(None);
        node.on_topic_begin(PROBE, 6);
        node.on_payload_chunk(b"tab", false).unwrap();
        assert_eq!(node.session().binding(), None);
        node.on_payload_chunk(b"le7", true).unwrap();
        assert_eq!(node.session().binding(), Some("table7"));
    }

    #[test]
    fn per_device_namespace() {
        let mut config = config();
        config.unique_topics = true;
        let mut node = node_with(config, Some(4095));
        node.on_connection_status(ConnectionStatus::Accepted).unwrap();
        node.on_subscribe_ack(Ok(())).unwrap();

        assert_eq!(node.transport().subscribes(), ["pico1a2b/checkForTable/pico1a2b"]);
        assert_eq!(node.transport().publishes(), [("pico1a2b/online", DEVICE)]);

        // Outside the namespace nothing happens
        node.on_message(PROBE, b"table7").unwrap();
        assert_eq!(node.session().binding(), None);

        node.on_message("pico1a2b/checkForTable/pico1a2b", b"table7").unwrap();
        assert_eq!(node.session().binding(), Some("table7"));
        node.on_button_edge();
        assert_eq!(
            node.transport().publishes().last(),
            Some(&("pico1a2b/tables/table7/setHeight", "1340"))
        );
    }
}
