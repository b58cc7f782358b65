use bytes::Bytes;

use crate::packet::QoS;

/// An application message as routed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Copy for delivery to a subscriber: never retained, QoS capped.
    pub(crate) fn for_delivery(&self, max_qos: QoS) -> Self {
        Self {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos.min(max_qos),
            retain: false,
        }
    }

    /// Copy for retained replay after SUBSCRIBE.
    pub(crate) fn for_replay(&self, max_qos: QoS) -> Self {
        Self {
            retain: true,
            ..self.for_delivery(max_qos)
        }
    }
}
