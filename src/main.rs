use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use evallink::config::{ConfigOverrides, SdkConfig};
use evallink::dispatch::Dispatcher;
use evallink::results::{HttpResultSink, ResultSink};

#[derive(Parser)]
#[command(
    name = "evallink",
    about = "Remote test execution for evaluation pipelines",
    version,
    long_about = None
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Platform API key
    #[arg(long, env = "EVALLINK_API_KEY", global = true, hide_env_values = true)]
    api_key: Option<String>,

    /// Base URL of the platform API
    #[arg(long, env = "EVALLINK_BASE_PATH", global = true)]
    base_path: Option<String>,

    /// Environment name reported to the orchestrator (defaults to hostname)
    #[arg(long, env = "EVALLINK_ENVIRONMENT", global = true)]
    environment: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Seconds to wait for in-flight jobs on shutdown
    #[arg(long, default_value = "10", global = true)]
    drain_secs: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the orchestrator and serve the demo registry
    Listen,

    /// Serve control messages over HTTP
    Webhook {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: SocketAddr,
    },

    /// Run the echo interaction locally against a pipeline's test cases
    RunLocal {
        /// Pipeline slug
        #[arg(long)]
        pipeline: String,

        /// Maximum concurrently running cases (0 = unbounded)
        #[arg(long)]
        parallelism: Option<usize>,
    },

    /// Print the environment details this process advertises
    Env,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.log_json);

    let mut config = SdkConfig::from_env();
    config.apply(ConfigOverrides {
        api_key: cli.global.api_key,
        base_path: cli.global.base_path,
        environment_name: cli.global.environment,
    });
    let drain = Duration::from_secs(cli.global.drain_secs);
    let registry = evallink::demo_registry();

    match cli.command {
        Commands::Listen => {
            let sink = http_sink(&config)?;
            let dispatcher = Dispatcher::new(registry, sink);
            let shutdown = shutdown_token();

            tracing::info!(base_path = %config.base_path, "starting listener");
            evallink::link_proto::listen(&config, dispatcher.clone(), shutdown).await?;
            dispatcher.drain(drain).await;
        }
        Commands::Webhook { bind } => {
            let sink = http_sink(&config)?;
            let dispatcher = Dispatcher::new(registry, sink);
            let shutdown = shutdown_token();

            evallink::webhook::serve(bind, dispatcher.clone(), shutdown).await?;
            dispatcher.drain(drain).await;
        }
        Commands::RunLocal {
            pipeline,
            parallelism,
        } => {
            let sink = http_sink(&config)?;
            let result_id =
                evallink::local::run_local(sink, evallink::echo_interaction(), &pipeline, parallelism).await?;
            println!("{result_id}");
        }
        Commands::Env => {
            let details = registry.snapshot();
            println!("{}", serde_json::to_string_pretty(&details)?);
        }
    }

    Ok(())
}

fn http_sink(config: &SdkConfig) -> Result<Arc<dyn ResultSink>> {
    let api_key = config.require_api_key()?;
    Ok(Arc::new(HttpResultSink::new(&config.base_path, api_key)?))
}

/// Token cancelled by the first shutdown signal.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        evallink::shutdown_signal().await;
        trigger.cancel();
    });
    token
}
