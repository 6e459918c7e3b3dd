use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;

use intelhub::config::Config;
use intelhub::gateway::HubHandle;
use intelhub::middleware::auth::TokenVerifier;
use intelhub::state::AppState;

#[derive(Parser)]
#[command(name = "intelhub", version, about = "Real-time topic notification hub")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub (default).
    Serve {
        /// Overrides PORT.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Mint a development credential signed with the configured secret.
    Token {
        #[arg(long)]
        user: String,
        /// Lifetime in seconds.
        #[arg(long, default_value_t = 3600)]
        ttl: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "intelhub=debug,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            print_banner(&config);
            run_server(config).await;
        }
        Command::Token { user, ttl } => {
            let verifier = TokenVerifier::new(&config.jwt_secret);
            match verifier.issue(&user, Duration::from_secs(ttl)) {
                Ok(token) => println!("{token}"),
                Err(e) => {
                    eprintln!("failed to issue token: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}

fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    let hub = &config.hub;

    eprintln!();
    eprintln!("  \x1b[1;36mintelhub\x1b[0m \x1b[2mv{version}\x1b[0m");
    eprintln!();
    eprintln!("  \x1b[2mport\x1b[0m         {}", config.port);
    eprintln!(
        "  \x1b[2mlimits\x1b[0m       {} conn/user, {} topics/session",
        hub.max_connections_per_user, hub.max_topics_per_session
    );
    eprintln!(
        "  \x1b[2mqueue\x1b[0m        {} frames, evict after {} drops",
        hub.queue_capacity, hub.slow_consumer_threshold
    );
    eprintln!(
        "  \x1b[2mheartbeat\x1b[0m    {}s / timeout {}s",
        hub.heartbeat_interval.as_secs(),
        hub.heartbeat_timeout.as_secs()
    );
    eprintln!(
        "  \x1b[2mpublish\x1b[0m      {}",
        if config.publish_key.is_some() { "enabled" } else { "disabled" }
    );

    if config.uses_default_secret() {
        eprintln!();
        eprintln!("  \x1b[33m! using the default JWT secret\x1b[0m");
    }

    eprintln!();
}

async fn run_server(config: Config) {
    let port = config.port;
    let deadline = config.hub.shutdown_deadline;
    let state = AppState::new(config);
    let hub = state.hub.clone();
    let app = intelhub::routes::router(state);

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .expect("failed to bind");

    let actual_port = listener
        .local_addr()
        .expect("failed to get local address")
        .port();
    eprintln!("  \x1b[32m→ listening on 0.0.0.0:{actual_port}\x1b[0m");
    eprintln!();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub, deadline))
        .await
        .expect("server error");
}

/// Resolves once the hub has drained after Ctrl-C or SIGTERM.
async fn shutdown_signal(hub: HubHandle, deadline: Duration) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
    let report = hub.shutdown(deadline).await;
    tracing::info!(evicted = report.evicted, forced = report.forced, "sessions drained");
}
