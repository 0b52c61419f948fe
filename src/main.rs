use anyhow::{Context, Result};
use clap::Parser;
use quic_pep::cli::{Cli, Commands};
use quic_pep::config::AppConfig;
use quic_pep::{ClientTunnel, PerformanceWatcher, ServerTunnel, Statistics, TunnelHandler};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("QUIC PEP v{}", env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Check { config } => check_config(config)?,
        Commands::Template {
            template_type,
            output,
        } => generate_config_template(template_type, output.as_deref())?,
        Commands::Server { config } => {
            info!("Loading server configuration from: {}", config);
            let server_config = AppConfig::load_server_config(config)?;
            let interval = server_config.performance_interval();
            let root = shutdown_on_ctrl_c();
            let stats = Arc::new(Statistics::new());
            let server =
                ServerTunnel::with_shutdown(server_config, stats.clone(), root.child_token());
            run_tunnel(&server, stats, interval, root).await?;
        }
        Commands::Client { config } => {
            info!("Loading client configuration from: {}", config);
            let client_config = AppConfig::load_client_config(config)?;
            let interval = client_config.performance_interval();
            let root = shutdown_on_ctrl_c();
            let stats = Arc::new(Statistics::new());
            let client = ClientTunnel::new(client_config, stats.clone())?
                .with_shutdown(root.child_token());
            run_tunnel(&client, stats, interval, root).await?;
        }
    }

    Ok(())
}

/// Ctrl+C 时取消根令牌
fn shutdown_on_ctrl_c() -> CancellationToken {
    let root = CancellationToken::new();
    let token = root.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
        token.cancel();
    });
    root
}

/// 运行隧道和性能采样，直到关闭
async fn run_tunnel(
    handler: &dyn TunnelHandler,
    stats: Arc<Statistics>,
    interval: Duration,
    root: CancellationToken,
) -> Result<()> {
    let watcher = PerformanceWatcher::new(stats.clone(), interval);
    let watcher_token = root.child_token();
    let watcher_task = tokio::spawn(async move { watcher.run(watcher_token).await });

    info!("Starting {} tunnel", handler.name());
    let result = handler.start().await;
    root.cancel();
    if let Err(e) = watcher_task.await {
        warn!("Performance watcher task failed: {}", e);
    }

    match serde_json::to_string(&stats.snapshot()) {
        Ok(json) => info!("Final statistics: {}", json),
        Err(e) => warn!("Failed to serialize statistics: {}", e),
    }

    result.with_context(|| format!("{} tunnel failed", handler.name()))
}

/// Generate configuration template
fn generate_config_template(template_type: &str, output: Option<&str>) -> Result<()> {
    let content = match template_type {
        "server" => include_str!("../templates/server.toml"),
        "client" => include_str!("../templates/client.toml"),
        other => anyhow::bail!("Unknown template type: {}", other),
    };

    if let Some(path) = output {
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!("Generated {} configuration template: {}", template_type, path);
    } else {
        println!("{}", content);
    }

    Ok(())
}

/// Check configuration file
fn check_config(path: &str) -> Result<()> {
    println!("Checking configuration file: {}", path);

    match AppConfig::from_file(path)? {
        AppConfig::Server(config) => {
            println!("✓ Server configuration is valid");
            println!("  Listen: {}", config.listen_addr()?);
            println!("  Connection timeout: {:?}", config.connection_timeout());
            println!("  Congestion control: {}", config.quic.congestion);
            match (&config.cert_path, &config.key_path) {
                (Some(cert), Some(key)) => {
                    println!("  Certificate: {}", cert.display());
                    println!("  Private key: {}", key.display());
                }
                _ => println!("  Certificate: self-signed at startup"),
            }
        }
        AppConfig::Client(config) => {
            println!("✓ Client configuration is valid");
            println!("  Listen: {}", config.listen_addr()?);
            println!("  Gateway: {}", config.gateway());
            println!("  Multi-stream: {}", config.multi_stream);
            println!("  Connection retries: {}", config.connection_retries);
            println!("  Congestion control: {}", config.quic.congestion);
        }
    }

    Ok(())
}
