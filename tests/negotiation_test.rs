use log::info;
use peerlink::{
    EndpointId, Error, InProcessRelay, NegotiationState, Orchestrator, Relay, RelayInbox,
    SignalMessage,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// importing common module.
mod common;

#[tokio::test]
async fn test_connect_opens_both_channels() -> anyhow::Result<()> {
    common::setup()?;

    let orchestrator = Orchestrator::new(common::session_config(Duration::from_secs(5))?)?;
    assert_eq!(orchestrator.state(), NegotiationState::Idle);
    assert!(!orchestrator.is_connected());

    orchestrator.connect().await?;
    assert_eq!(orchestrator.state(), NegotiationState::Connected);
    assert!(orchestrator.is_connected());

    let local = orchestrator
        .router()
        .channel(EndpointId::Local)
        .ok_or_else(|| anyhow::anyhow!("local channel not attached"))?;
    let remote = orchestrator
        .router()
        .channel(EndpointId::Remote)
        .ok_or_else(|| anyhow::anyhow!("remote channel not attached"))?;
    info!("local {:?}, remote {:?}", local, remote);
    assert_eq!(local.channel_id, remote.channel_id);
    assert_eq!(local.label, peerlink::DEFAULT_LABEL);
    assert_eq!(remote.label, peerlink::DEFAULT_LABEL);
    assert!(local.ordered && remote.ordered);

    orchestrator.close().await;
    Ok(())
}

#[tokio::test]
async fn test_connect_is_guarded() -> anyhow::Result<()> {
    common::setup()?;

    let orchestrator = Orchestrator::new(common::session_config(Duration::from_secs(5))?)?;
    let (first, second) = tokio::join!(orchestrator.connect(), orchestrator.connect());
    assert!(first.is_ok());
    assert!(matches!(second, Err(Error::InvalidState(_))));

    assert!(matches!(
        orchestrator.connect().await,
        Err(Error::InvalidState(_))
    ));
    assert!(orchestrator.is_connected());

    orchestrator.close().await;
    Ok(())
}

#[tokio::test]
async fn test_connectivity_timeout_then_recover() -> anyhow::Result<()> {
    common::setup()?;

    let deliver = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&deliver);
    let relay = InProcessRelay::new().with_candidate_filter(move |_, _| gate.load(Ordering::SeqCst));
    let orchestrator =
        Orchestrator::with_relay(common::session_config(Duration::from_secs(1))?, relay)?;

    match orchestrator.connect().await {
        Err(Error::ConnectivityTimeout(timeout)) => assert_eq!(timeout, Duration::from_secs(1)),
        other => panic!("expected connectivity timeout, got {other:?}"),
    }
    assert_eq!(orchestrator.state(), NegotiationState::Failed);
    assert!(!orchestrator.is_connected());
    assert!(orchestrator.router().channel(EndpointId::Local).is_none());

    deliver.store(true, Ordering::SeqCst);
    orchestrator.connect().await?;
    assert_eq!(orchestrator.state(), NegotiationState::Connected);

    orchestrator.close().await;
    Ok(())
}

#[tokio::test]
async fn test_connect_with_duplicate_candidates() -> anyhow::Result<()> {
    common::setup()?;

    let relay = InProcessRelay::new().with_duplicate_candidates(true);
    let orchestrator =
        Orchestrator::with_relay(common::session_config(Duration::from_secs(5))?, relay)?;
    orchestrator.connect().await?;
    assert!(orchestrator.is_connected());

    orchestrator.close().await;
    Ok(())
}

#[tokio::test]
async fn test_close_and_reconnect() -> anyhow::Result<()> {
    common::setup()?;

    let orchestrator = Orchestrator::new(common::session_config(Duration::from_secs(5))?)?;
    orchestrator.connect().await?;
    orchestrator
        .send_message(EndpointId::Local, "before close")
        .await?;
    common::wait_for_log(&orchestrator, EndpointId::Remote, 1).await;

    orchestrator.close().await;
    assert_eq!(orchestrator.state(), NegotiationState::Closed);
    assert!(!orchestrator.is_connected());
    assert!(matches!(
        orchestrator.send_message(EndpointId::Local, "after close").await,
        Err(Error::ChannelNotOpen(None))
    ));

    orchestrator.connect().await?;
    orchestrator
        .send_message(EndpointId::Local, "after reconnect")
        .await?;
    let log = common::wait_for_log(&orchestrator, EndpointId::Remote, 2).await;
    assert_eq!(
        log.records(),
        &["before close".to_owned(), "after reconnect".to_owned()]
    );

    orchestrator.close().await;
    Ok(())
}

#[tokio::test]
async fn test_dropped_connect_does_not_wedge_pair() -> anyhow::Result<()> {
    common::setup()?;

    let orchestrator = Orchestrator::new(common::session_config(Duration::from_secs(5))?)?;
    let abandoned = tokio::time::timeout(Duration::from_micros(1), orchestrator.connect()).await;
    assert!(abandoned.is_err(), "connect finished within 1µs: {abandoned:?}");
    assert_eq!(orchestrator.state(), NegotiationState::Failed);
    assert!(!orchestrator.is_connected());

    orchestrator.close().await;
    assert_eq!(orchestrator.state(), NegotiationState::Closed);

    orchestrator.connect().await?;
    assert_eq!(orchestrator.state(), NegotiationState::Connected);
    assert!(orchestrator.is_connected());

    orchestrator.close().await;
    Ok(())
}

#[tokio::test]
async fn test_rejected_description_then_recover() -> anyhow::Result<()> {
    common::setup()?;

    let corrupt = Arc::new(AtomicBool::new(true));
    let gate = Arc::clone(&corrupt);
    let relay =
        InProcessRelay::new().with_description_corruption(move |_, _| gate.load(Ordering::SeqCst));
    let orchestrator =
        Orchestrator::with_relay(common::session_config(Duration::from_secs(5))?, relay)?;

    let result = orchestrator.connect().await;
    assert!(
        matches!(result, Err(Error::NegotiationFailed(_))),
        "expected negotiation failure, got {result:?}"
    );
    assert_eq!(orchestrator.state(), NegotiationState::Failed);
    assert!(!orchestrator.is_connected());
    assert!(orchestrator.router().channel(EndpointId::Local).is_none());
    assert!(orchestrator.router().channel(EndpointId::Remote).is_none());

    corrupt.store(false, Ordering::SeqCst);
    orchestrator.connect().await?;
    assert_eq!(orchestrator.state(), NegotiationState::Connected);
    assert!(orchestrator.router().channel(EndpointId::Local).is_some());
    assert!(orchestrator.router().channel(EndpointId::Remote).is_some());

    orchestrator.close().await;
    Ok(())
}

/// CountingRelay forwards to an in-process relay and counts relayed descriptions.
#[derive(Default)]
struct CountingRelay {
    inner: InProcessRelay,
    descriptions: AtomicUsize,
}

impl Relay for CountingRelay {
    fn register(&self, id: EndpointId) -> RelayInbox {
        self.inner.register(id)
    }

    fn unregister(&self, id: EndpointId) {
        self.inner.unregister(id)
    }

    fn send(&self, to: EndpointId, message: SignalMessage) -> peerlink::Result<()> {
        if matches!(message, SignalMessage::Description { .. }) {
            self.descriptions.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.send(to, message)
    }
}

#[tokio::test]
async fn test_connect_through_custom_relay() -> anyhow::Result<()> {
    common::setup()?;

    let relay = Arc::new(CountingRelay::default());
    let orchestrator = Orchestrator::with_shared_relay(
        common::session_config(Duration::from_secs(5))?,
        Arc::clone(&relay) as Arc<dyn Relay>,
    )?;
    orchestrator.connect().await?;
    assert!(orchestrator.is_connected());
    assert_eq!(relay.descriptions.load(Ordering::SeqCst), 2);

    orchestrator.close().await;
    Ok(())
}
