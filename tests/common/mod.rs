use log::info;
use log::LevelFilter::Debug;
use peerlink::{EndpointConfig, EndpointId, MessageLog, Orchestrator, SessionConfig};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

pub fn setup() -> anyhow::Result<()> {
    // several tests share one process, only the first one installs the logger
    let _ = env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} [{}] {} - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                chrono::Local::now().format("%H:%M:%S.%6f"),
                record.args()
            )
        })
        .filter(None, Debug)
        .is_test(true)
        .try_init();

    info!("common setup");

    Ok(())
}

/// session config with fast connectivity checks, suited to the loopback network
pub fn session_config(connectivity_timeout: Duration) -> anyhow::Result<SessionConfig> {
    let endpoint_config = EndpointConfig::new()?.with_check_interval(Duration::from_millis(5));
    Ok(SessionConfig::with_endpoint_config(Arc::new(endpoint_config))
        .with_connectivity_timeout(connectivity_timeout))
}

/// wait_for_log polls until `endpoint_id` received `count` messages or a second passed
pub async fn wait_for_log(
    orchestrator: &Orchestrator,
    endpoint_id: EndpointId,
    count: usize,
) -> MessageLog {
    for _ in 0..100 {
        let log = orchestrator.message_log(endpoint_id);
        if log.len() >= count {
            return log;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    orchestrator.message_log(endpoint_id)
}
