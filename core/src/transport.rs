use core::fmt;

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "config", derive(serde::Deserialize), serde(try_from = "u8"))]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosError(pub u8);

impl TryFrom<u8> for QoS {
    type Error = QosError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(QosError(other)),
        }
    }
}

impl fmt::Display for QosError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid QoS level {}, expected 0, 1 or 2", self.0)
    }
}

impl core::error::Error for QosError {}

/// Connection notifications as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Accepted,
    Disconnected,
    /// Any other status the broker or transport reported, by its return code.
    Refused(u8),
}

/// A request that was rejected by the broker, with the reason code it reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckError(pub u8);

pub type AckResult = Result<(), AckError>;

/// Request side of a connected publish/subscribe client.
///
/// Every call only queues the request. The outcome is delivered later through the
/// `Node::on_*_ack` notifications and never from within one of these calls, so the node
/// can issue new requests while it handles an acknowledgment.
pub trait Transport {
    type Error: fmt::Debug;

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error>;

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), Self::Error>;

    fn unsubscribe(&mut self, topic: &str) -> Result<(), Self::Error>;

    fn disconnect(&mut self) -> Result<(), Self::Error>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_from_level() {
        assert_eq!(QoS::try_from(0), Ok(QoS::AtMostOnce));
        assert_eq!(QoS::try_from(2), Ok(QoS::ExactlyOnce));
        assert_eq!(QoS::try_from(3), Err(QosError(3)));
    }
}
