use crate::error::{Error, Result};
use crate::messages::ChannelHandle;
use crate::metrics::Metrics;
use crate::orchestrator::peer::PeerHandle;
use crate::types::{ChannelId, EndpointId};
use bytes::BytesMut;
use log::{debug, info, warn};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// MessageLog is the append-only record of messages one endpoint received.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct MessageLog {
    records: Vec<String>,
}

impl MessageLog {
    pub fn records(&self) -> &[String] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// render yields every record terminated by a newline
    pub fn render(&self) -> String {
        self.records.iter().map(|r| format!("{r}\n")).collect()
    }

    fn append(&mut self, record: String) {
        self.records.push(record);
    }
}

/// MessageRouter delivers inbound messages to the logs of their endpoint and
/// forwards outbound text to the channel attached for that endpoint.
pub struct MessageRouter {
    channels: Mutex<HashMap<EndpointId, ChannelHandle>>,
    logs: Mutex<HashMap<EndpointId, MessageLog>>,
    metrics: Arc<Metrics>,
}

impl MessageRouter {
    pub(crate) fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            logs: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// attach binds the receive handler of `handle.endpoint_id` to the channel
    pub(crate) fn attach(&self, handle: ChannelHandle) {
        info!(
            "router attached {} to channel {} '{}'",
            handle.endpoint_id, handle.channel_id, handle.label
        );
        self.channels.lock().insert(handle.endpoint_id, handle);
    }

    pub(crate) fn detach(&self, endpoint_id: EndpointId, channel_id: ChannelId) {
        let mut channels = self.channels.lock();
        if channels
            .get(&endpoint_id)
            .is_some_and(|h| h.channel_id == channel_id)
        {
            debug!("router detached {} from channel {}", endpoint_id, channel_id);
            channels.remove(&endpoint_id);
        }
    }

    /// detach_all forgets every channel, e.g. before a new negotiation round
    pub(crate) fn detach_all(&self) {
        self.channels.lock().clear();
    }

    pub fn channel(&self, endpoint_id: EndpointId) -> Option<ChannelHandle> {
        self.channels.lock().get(&endpoint_id).cloned()
    }

    /// send forwards `text` on the channel of `endpoint_id`; empty text is ignored
    pub(crate) async fn send(
        &self,
        endpoint_id: EndpointId,
        text: &str,
        peer: Option<&PeerHandle>,
    ) -> Result<()> {
        if text.is_empty() {
            info!("router ignores empty message from {}", endpoint_id);
            return Ok(());
        }

        let channel_id = self
            .channel(endpoint_id)
            .map(|h| h.channel_id)
            .ok_or(Error::ChannelNotOpen(None))?;
        let peer = peer.ok_or(Error::ChannelNotOpen(Some(channel_id)))?;
        peer.send_text(channel_id, text.to_owned()).await?;

        self.metrics.record_message_sent_count(
            1,
            &[KeyValue::new("endpoint", endpoint_id.to_string())],
        );
        Ok(())
    }

    /// on_message appends a received message to the log of `endpoint_id`
    pub(crate) fn on_message(
        &self,
        endpoint_id: EndpointId,
        channel_id: ChannelId,
        is_string: bool,
        data: BytesMut,
    ) {
        match self.channel(endpoint_id) {
            Some(handle) if handle.channel_id == channel_id => {}
            _ => {
                warn!(
                    "router drops message for {} on channel {} with no handler attached",
                    endpoint_id, channel_id
                );
                return;
            }
        }

        let text = if is_string {
            match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(err) => {
                    warn!("router got invalid utf-8 text for {}: {}", endpoint_id, err);
                    String::from_utf8_lossy(&data).into_owned()
                }
            }
        } else {
            String::from_utf8_lossy(&data).into_owned()
        };
        debug!("router delivers '{}' to {}", text, endpoint_id);

        self.logs.lock().entry(endpoint_id).or_default().append(text);
        self.metrics.record_message_received_count(
            1,
            &[KeyValue::new("endpoint", endpoint_id.to_string())],
        );
    }

    pub fn log(&self, endpoint_id: EndpointId) -> MessageLog {
        self.logs
            .lock()
            .get(&endpoint_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn new_router() -> MessageRouter {
        MessageRouter::new(Arc::new(Metrics::new(opentelemetry::global::meter(
            "router_test",
        ))))
    }

    fn handle(endpoint_id: EndpointId, channel_id: ChannelId) -> ChannelHandle {
        ChannelHandle {
            endpoint_id,
            channel_id,
            label: "messaging-channel".to_owned(),
            ordered: true,
        }
    }

    #[test]
    fn test_message_log_render() {
        let mut log = MessageLog::default();
        assert_eq!(log.render(), "");
        log.append("HELLO".to_owned());
        log.append("".to_owned());
        log.append("WORLD".to_owned());
        assert_eq!(log.render(), "HELLO\n\nWORLD\n");
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_on_message_requires_attached_channel() {
        let router = new_router();
        router.on_message(EndpointId::Remote, 1, true, BytesMut::from("lost"));
        assert!(router.log(EndpointId::Remote).is_empty());

        router.attach(handle(EndpointId::Remote, 1));
        router.on_message(EndpointId::Remote, 3, true, BytesMut::from("other"));
        router.on_message(EndpointId::Remote, 1, true, BytesMut::from("first"));
        router.on_message(EndpointId::Remote, 1, false, BytesMut::from("second"));
        assert_eq!(
            router.log(EndpointId::Remote).records(),
            &["first".to_owned(), "second".to_owned()]
        );
        assert!(router.log(EndpointId::Local).is_empty());

        router.detach(EndpointId::Remote, 3);
        assert!(router.channel(EndpointId::Remote).is_some());
        router.detach(EndpointId::Remote, 1);
        assert!(router.channel(EndpointId::Remote).is_none());
    }

    #[tokio::test]
    async fn test_send_without_channel() {
        let router = new_router();
        assert!(router.send(EndpointId::Local, "", None).await.is_ok());
        assert!(matches!(
            router.send(EndpointId::Local, "HELLO", None).await,
            Err(Error::ChannelNotOpen(None))
        ));

        router.attach(handle(EndpointId::Local, 1));
        assert!(matches!(
            router.send(EndpointId::Local, "HELLO", None).await,
            Err(Error::ChannelNotOpen(Some(1)))
        ));
    }
}
