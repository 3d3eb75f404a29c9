use bazaar_common::tracing::init_tracing_with_default_env_filter;
use bazaar_common::SafeDisplay;
use bazaar_service::config::{make_config_loader, BazaarConfig};
use bazaar_service::ModelBazaar;
use clap::Parser;
use prometheus::Registry;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::task::JoinSet;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "bazaar-service", about = "Model Bazaar control plane")]
struct Args {
    /// Env file loaded before configuration assembly.
    #[arg(long)]
    env: Option<PathBuf>,

    /// Override of the HTTP port.
    #[arg(long)]
    port: Option<u16>,

    /// Skip starting all platform jobs.
    #[arg(long = "skip_all")]
    skip_all: bool,

    /// Skip the LLM cache platform job.
    #[arg(long = "skip_cache")]
    skip_cache: bool,

    /// Skip the LLM dispatch platform job.
    #[arg(long = "skip_dispatch")]
    skip_dispatch: bool,

    /// Skip the telemetry platform job.
    #[arg(long = "skip_telemetry")]
    skip_telemetry: bool,

    /// Print the default configuration and exit.
    #[arg(long)]
    dump_config: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(env_file) = &args.env {
        if let Err(error) = dotenvy::from_path(env_file) {
            eprintln!("failed to load env file {}: {error}", env_file.display());
            return ExitCode::FAILURE;
        }
    }

    let loader = make_config_loader();
    if args.dump_config {
        println!("{}", loader.dump_default());
        return ExitCode::SUCCESS;
    }

    let mut config = match loader.load() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(port) = args.port {
        config.http_port = port;
    }
    config.platform.skip_all |= args.skip_all;
    config.platform.skip_cache |= args.skip_cache;
    config.platform.skip_dispatch |= args.skip_dispatch;
    config.platform.skip_telemetry |= args.skip_telemetry;

    if let Err(errors) = config.validate() {
        for error in errors {
            eprintln!("configuration error: {error}");
        }
        return ExitCode::FAILURE;
    }

    init_tracing_with_default_env_filter(&config.tracing);
    info!("starting with configuration:\n{}", config.to_safe_string());

    let prometheus_registry = bazaar_common::metrics::register_all();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            error!("failed to build runtime: {error}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(async_main(config, prometheus_registry)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("fatal: {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn async_main(config: BazaarConfig, prometheus_registry: Registry) -> anyhow::Result<()> {
    let bazaar = ModelBazaar::new(config, prometheus_registry).await?;

    let mut join_set = JoinSet::new();
    bazaar.run(&mut join_set).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            bazaar.shutdown();
        }
        Some(result) = join_set.join_next() => {
            result??;
        }
    }

    join_set.shutdown().await;
    Ok(())
}
