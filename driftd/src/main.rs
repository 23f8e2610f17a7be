use driftd::daemon::{DaemonConfig, DaemonRuntime};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run { config: Option<String> },
    Help,
    Version,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut config = None;
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliMode::Help),
            "--version" | "-V" => return Ok(CliMode::Version),
            "--config" => {
                config = Some(
                    args.next()
                        .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?,
                );
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(CliMode::Run { config })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: driftd [--config PATH]");
            println!("  --config PATH  Cluster configuration file (default: $DRIFT_HOME/config.json)");
            return Ok(());
        }
        CliMode::Version => {
            println!("driftd {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        CliMode::Run { config } => {
            let mut daemon_config = DaemonConfig::from_env()?;
            if let Some(path) = config {
                daemon_config.config_path = path.into();
            }
            daemon_config
        }
    };

    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}
