use std::{net::SocketAddr, path::Path, pin::pin, sync::Arc};

use clap::{Parser, ValueEnum};
use color_eyre::{
    Result,
    eyre::{Context as _, eyre},
};
use conflux::{
    adapters::{FixedSubscriberFactory, HttpBackendFactory, HttpHandler},
    config::{GatewayConfig, GatewayConfigValidator, loader::load_config},
    core::{CombinerRegistry, Context, DefaultFactory, GatewayService, ShadowFactory},
    tracing_setup,
    utils::{GracefulShutdown, ShutdownReason},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "conflux.yaml")]
    config: String,

    /// Log output format
    #[clap(long, value_enum, default_value_t = LogFormat::Json, global = true)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        #[clap(short, long, default_value = "conflux.yaml")]
        config: String,
    },
    /// Validate and assemble every endpoint pipeline without serving
    Check {
        #[clap(short, long, default_value = "conflux.yaml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        #[clap(short, long, default_value = "conflux.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Check { config }) => check_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config, args.log_format).await,
        None => serve(&args.config, args.log_format).await,
    }
}

fn build_gateway(config: GatewayConfig) -> Result<GatewayService> {
    let combiners = Arc::new(CombinerRegistry::new());
    let backends =
        Arc::new(HttpBackendFactory::new().context("Failed to create backend HTTP client")?);
    let factory = ShadowFactory::new(
        DefaultFactory::new(backends, Arc::new(FixedSubscriberFactory)).with_combiners(combiners),
    );
    GatewayService::new(Arc::new(config), &factory).context("Failed to assemble pipelines")
}

async fn load_valid_config(config_path: &str) -> Result<GatewayConfig> {
    let config = load_config(config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    GatewayConfigValidator::validate(&config)
        .map_err(|e| eyre!("Invalid configuration in {config_path}:\n{e}"))?;
    Ok(config)
}

async fn serve(config_path: &str, log_format: LogFormat) -> Result<()> {
    match log_format {
        LogFormat::Json => tracing_setup::init_tracing(),
        LogFormat::Pretty => tracing_setup::init_console_tracing(),
    }
    .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    tracing::info!("Loading configuration from {config_path}");
    let config = load_valid_config(config_path).await?;
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;

    let gateway = Arc::new(build_gateway(config)?);
    for endpoint in gateway.endpoints() {
        tracing::info!(
            "Configured endpoint: {} {} (timeout {:?})",
            endpoint.method,
            endpoint.config.endpoint,
            endpoint.timeout()
        );
    }

    let root = Context::background();
    let app = HttpHandler::new(gateway)
        .with_root_context(root.clone())
        .router();

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        signal_handler_shutdown.run_signal_handler().await;
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Conflux gateway listening on {}", addr);

    let stop_accepting = graceful_shutdown.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        stop_accepting.wait_for_shutdown_signal().await;
    });
    let mut server = pin!(server.into_future());

    tokio::select! {
        result = &mut server => return result.context("Server error"),
        reason = graceful_shutdown.wait_for_shutdown_signal() => {
            tracing::info!("Shutdown signal received: {:?}, draining in-flight requests", reason);
        }
    }

    let drained = graceful_shutdown
        .drain(async {
            if let Err(e) = (&mut server).await {
                tracing::error!("Server error while draining: {}", e);
            }
        })
        .await;
    if drained == ShutdownReason::Force {
        root.cancel();
    }

    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match GatewayConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Default Timeout: {}", humantime::format_duration(config.timeout));
            println!("   • Endpoints: {}", config.endpoints.len());
            println!(
                "   • Backends: {}",
                config.endpoints.iter().map(|e| e.backends.len()).sum::<usize>()
            );
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure all hosts start with http:// or https://");
            println!("   • Endpoint and backend paths must start with '/'");
            println!("   • Durations use units such as 150ms, 2s or 1m");
            println!("   • static.strategy is one of always, success, errored, complete, incomplete");
            std::process::exit(1);
        }
    }
}

/// Assemble every pipeline and print what each endpoint does
async fn check_config_command(config_path: &str) -> Result<()> {
    let config = load_valid_config(config_path).await?;
    let gateway = build_gateway(config)?;

    println!("✅ Assembled {} endpoint pipeline(s)", gateway.endpoints().len());
    for endpoint in gateway.endpoints() {
        let cfg = &endpoint.config;
        let proxy_cfg = cfg.proxy_config();
        let shadows = cfg.backends.iter().filter(|b| b.is_shadow()).count();
        let strategy = if cfg.backends.len() - shadows <= 1 {
            "single"
        } else if proxy_cfg.sequential {
            "sequential merge"
        } else {
            "parallel merge"
        };

        println!();
        println!("   {} {}", endpoint.method, cfg.endpoint);
        println!("     • Timeout: {}", humantime::format_duration(endpoint.timeout()));
        println!("     • Backends: {} ({strategy})", cfg.backends.len() - shadows);
        if shadows > 0 {
            println!("     • Shadow backends: {shadows}");
        }
        if let Some(static_data) = &proxy_cfg.static_data {
            println!(
                "     • Static data: {} key(s), strategy {}",
                static_data.data.len(),
                static_data.strategy
            );
        }
        for backend in &cfg.backends {
            println!(
                "       - {} {} on {:?} (concurrent calls: {})",
                backend.method, backend.url_pattern, backend.hosts, backend.concurrent_calls
            );
        }
    }
    Ok(())
}
