use clap::Parser;
use log::info;
use std::io::Write;
use std::str::FromStr;
use std::time::Duration;

use peerlink::{EndpointId, Orchestrator, SessionConfig};

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(author = "Rusty Rain <y@liu.mx>")]
#[command(version = "0.0.1")]
#[command(about = "Connects two in-process peers and exchanges text messages", long_about = None)]
struct Cli {
    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("INFO"))]
    level: String,
    #[arg(short, long, default_value_t = 10000)]
    timeout_ms: u64,
    #[arg(short, long, default_value_t = format!("HELLO"))]
    message: String,
    #[arg(short, long, default_value_t = 3)]
    count: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.debug {
        let level = log::LevelFilter::from_str(&cli.level)
            .map_err(|err| anyhow::anyhow!("invalid log level '{}': {err}", cli.level))?;
        env_logger::Builder::new()
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
            .filter(None, level)
            .init();
    }

    let config =
        SessionConfig::new()?.with_connectivity_timeout(Duration::from_millis(cli.timeout_ms));
    let orchestrator = Orchestrator::new(config)?;

    orchestrator.connect().await?;
    info!("connected: {}", orchestrator.is_connected());

    for i in 0..cli.count {
        orchestrator
            .send_message(EndpointId::Local, &format!("{} #{i} from local", cli.message))
            .await?;
        orchestrator
            .send_message(EndpointId::Remote, &format!("{} #{i} from remote", cli.message))
            .await?;
    }

    let expected = cli.count;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(cli.timeout_ms);
    while (orchestrator.message_log(EndpointId::Local).len() < expected
        || orchestrator.message_log(EndpointId::Remote).len() < expected)
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for id in [EndpointId::Local, EndpointId::Remote] {
        println!("--- {id} received ---");
        print!("{}", orchestrator.message_log(id).render());
    }

    orchestrator.close().await;
    info!("closed, state {}", orchestrator.state());

    Ok(())
}
