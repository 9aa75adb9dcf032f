use saba_console::config::ConsoleConfig;
use saba_console::{ConsoleBridge, Supervisor};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 단일 스레드 런타임: 핸들러는 협조적으로 번갈아 실행된다
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run());
    // the console reader may still be parked in a blocking stdin read
    runtime.shutdown_background();
    result
}

async fn run() -> anyhow::Result<()> {
    let config = ConsoleConfig::load()?;
    if config.servers.is_empty() {
        anyhow::bail!("No servers configured");
    }

    let supervisor = Supervisor::new();
    config.apply(&supervisor)?;
    supervisor.load_extension(&ConsoleBridge)?;
    tracing::info!("saba-console starting with {} server(s)", config.servers.len());

    // Ctrl+C: graceful stop, a second Ctrl+C terminates
    let signals = supervisor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::info!("Shutdown signal received, stopping servers...");
        let graceful = {
            let supervisor = signals.clone();
            tokio::spawn(async move { supervisor.stop().await })
        };
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Second signal received, terminating servers");
            signals.force_stop().await;
        }
        let _ = graceful.await;
    });

    supervisor.run().await?;
    tracing::info!("saba-console shutting down");
    Ok(())
}
