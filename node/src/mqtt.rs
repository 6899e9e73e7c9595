//! Glue between `rumqttc` and the node.

use std::{error::Error, time::Duration};

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, LastWill, MqttOptions,
    Outgoing, Packet, SubscribeReasonCode,
};
use tablelink_core::{
    config::Config,
    topics::{self, TopicNamespace, LIVENESS_WILL_PAYLOAD},
    AckError, AckResult, Board, ConnectionStatus, Node, NodeError, QoS, Transport,
};

/// Return code MQTT 3.1.1 uses for a refused subscription.
const SUBACK_FAILURE: u8 = 0x80;

pub fn options(
    config: &Config,
    device_id: &str,
    ns: &TopicNamespace,
) -> Result<MqttOptions, Box<dyn Error>> {
    let mut options = MqttOptions::parse_url(broker_url(&config.broker, device_id))?;
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.into()));

    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or_default());
    }

    // Tell everyone we are gone when the connection drops without a disconnect
    options.set_last_will(LastWill::new(
        topics::liveness_topic(ns)?.as_str(),
        LIVENESS_WILL_PAYLOAD,
        rumqttc::QoS::AtLeastOnce,
        true,
    ));

    Ok(options)
}

/// The broker url with the device id as client id, unless the url already names one.
fn broker_url(broker: &str, device_id: &str) -> String {
    let query = broker.split_once('?').map(|(_, query)| query);
    let has_client_id = query.is_some_and(|query| {
        query
            .split('&')
            .any(|pair| pair.split('=').next() == Some("client_id"))
    });

    match query {
        _ if has_client_id => {
            log::info!("Using the client id from the broker url instead of '{device_id}'");
            broker.into()
        }
        Some(_) => format!("{broker}&client_id={device_id}"),
        None => format!("{broker}?client_id={device_id}"),
    }
}

/// Queues requests on the `rumqttc` client without waiting. The event loop sends them.
pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

fn qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

impl Transport for MqttTransport {
    type Error = ClientError;

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos_level: QoS,
        retain: bool,
    ) -> Result<(), Self::Error> {
        self.client.try_publish(topic, qos(qos_level), retain, payload)
    }

    fn subscribe(&mut self, topic: &str, qos_level: QoS) -> Result<(), Self::Error> {
        self.client.try_subscribe(topic, qos(qos_level))
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), Self::Error> {
        self.client.try_unsubscribe(topic)
    }

    fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.client.try_disconnect()
    }
}

/// An event loop result as the node sees it.
#[derive(Debug, PartialEq, Eq)]
pub enum Notification<'a> {
    Connection(ConnectionStatus),
    PublishAck,
    SubscribeAck(AckResult),
    UnsubscribeAck,
    Message { topic: &'a str, payload: &'a [u8] },
}

fn return_code(code: &ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

pub fn translate(event: &Result<Event, ConnectionError>) -> Option<Notification<'_>> {
    let notification = match event {
        Ok(Event::Incoming(Packet::ConnAck(ack))) => {
            Notification::Connection(match ack.code {
                ConnectReturnCode::Success => ConnectionStatus::Accepted,
                ref code => ConnectionStatus::Refused(return_code(code)),
            })
        }
        Ok(Event::Incoming(Packet::SubAck(ack))) => {
            // One topic per request, so one return code
            let rejected = ack
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure));
            Notification::SubscribeAck(if rejected {
                Err(AckError(SUBACK_FAILURE))
            } else {
                Ok(())
            })
        }
        Ok(Event::Incoming(Packet::UnsubAck(_))) => Notification::UnsubscribeAck,
        Ok(Event::Incoming(Packet::PubAck(_) | Packet::PubComp(_))) => Notification::PublishAck,
        Ok(Event::Incoming(Packet::Publish(message))) => Notification::Message {
            topic: &message.topic,
            payload: &message.payload,
        },
        Ok(Event::Outgoing(Outgoing::Disconnect)) => {
            Notification::Connection(ConnectionStatus::Disconnected)
        }
        Ok(_) => return None,
        Err(ConnectionError::ConnectionRefused(code)) => {
            Notification::Connection(ConnectionStatus::Refused(return_code(code)))
        }
        Err(_) => Notification::Connection(ConnectionStatus::Disconnected),
    };

    Some(notification)
}

/// Hand one event loop result to the node.
pub fn deliver<T: Transport, B: Board>(
    node: &mut Node<T, B>,
    event: &Result<Event, ConnectionError>,
) -> Result<(), NodeError> {
    if let Err(e) = event {
        log::error!("Mqtt connection error: {e}");
    }

    let Some(notification) = translate(event) else {
        log::trace!("{event:?}");
        return Ok(());
    };

    match notification {
        Notification::Connection(status) => node.on_connection_status(status),
        Notification::PublishAck => {
            node.on_publish_ack(Ok(()));
            Ok(())
        }
        Notification::SubscribeAck(result) => node.on_subscribe_ack(result),
        Notification::UnsubscribeAck => node.on_unsubscribe_ack(Ok(())),
        Notification::Message { topic, payload } => node.on_message(topic, payload),
    }
}
