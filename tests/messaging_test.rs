use peerlink::{EndpointId, Error, Orchestrator};
use std::time::Duration;

// importing common module.
mod common;

#[tokio::test]
async fn test_send_before_connect_is_rejected() -> anyhow::Result<()> {
    common::setup()?;

    let orchestrator = Orchestrator::new(common::session_config(Duration::from_secs(5))?)?;
    assert!(matches!(
        orchestrator.send_message(EndpointId::Remote, "HELLO").await,
        Err(Error::ChannelNotOpen(_))
    ));
    assert!(orchestrator.message_log(EndpointId::Local).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_messages_both_ways() -> anyhow::Result<()> {
    common::setup()?;

    let orchestrator = Orchestrator::new(common::session_config(Duration::from_secs(5))?)?;
    orchestrator.connect().await?;

    orchestrator.send_message(EndpointId::Local, "HELLO").await?;
    orchestrator.send_message(EndpointId::Remote, "WORLD").await?;

    let remote_log = common::wait_for_log(&orchestrator, EndpointId::Remote, 1).await;
    let local_log = common::wait_for_log(&orchestrator, EndpointId::Local, 1).await;
    assert_eq!(remote_log.render(), "HELLO\n");
    assert_eq!(local_log.render(), "WORLD\n");

    orchestrator.close().await;
    Ok(())
}

#[tokio::test]
async fn test_message_order_is_preserved() -> anyhow::Result<()> {
    common::setup()?;

    let orchestrator = Orchestrator::new(common::session_config(Duration::from_secs(5))?)?;
    orchestrator.connect().await?;

    let sent: Vec<String> = (0..32).map(|i| format!("message {i}")).collect();
    for text in &sent {
        orchestrator.send_message(EndpointId::Local, text).await?;
    }

    let log = common::wait_for_log(&orchestrator, EndpointId::Remote, sent.len()).await;
    assert_eq!(log.records(), &sent[..]);
    assert!(orchestrator.message_log(EndpointId::Local).is_empty());

    orchestrator.close().await;
    Ok(())
}

#[tokio::test]
async fn test_empty_message_is_noop() -> anyhow::Result<()> {
    common::setup()?;

    let orchestrator = Orchestrator::new(common::session_config(Duration::from_secs(5))?)?;
    orchestrator.connect().await?;

    orchestrator.send_message(EndpointId::Local, "").await?;
    orchestrator.send_message(EndpointId::Local, "marker").await?;

    let log = common::wait_for_log(&orchestrator, EndpointId::Remote, 1).await;
    assert_eq!(log.records(), &["marker".to_owned()]);

    orchestrator.close().await;
    Ok(())
}
