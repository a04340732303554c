use drivepind::config::DaemonConfig;
use drivepind::daemon::DaemonRuntime;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Check,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--check" => mode = CliMode::Check,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: drivepind [--check]");
        println!("  --check   Only compute the space needed to pin everything");
        return Ok(());
    }

    init_tracing();
    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    let progress = match mode {
        CliMode::Check => daemon.check().await?,
        _ => daemon.run().await?,
    };

    println!("{}", serde_json::to_string_pretty(&progress)?);
    if progress.stage.is_error() {
        anyhow::bail!("pinning failed: {}", progress.stage);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        let mode = parse_cli_mode(vec!["drivepind".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_check() {
        let mode = parse_cli_mode(vec!["drivepind".to_string(), "--check".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Check);
    }

    #[test]
    fn parse_cli_mode_supports_help() {
        let mode = parse_cli_mode(vec!["drivepind".to_string(), "-h".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Help);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_arguments() {
        assert!(parse_cli_mode(vec!["drivepind".to_string(), "--pin".to_string()]).is_err());
    }
}
