use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use fws_app_server::AppState;
use fws_app_server::ServerConfig;

/// Local orchestration bridge: drives coding-agent child processes and
/// per-conversation PTYs behind a REST + WebSocket surface.
#[derive(Parser, Debug)]
#[command(name = "fws-app-server", version)]
struct Cli {
    /// Port for the HTTP + WebSocket surface.
    #[arg(long, default_value_t = 12356)]
    port: u16,

    /// Cache root override; defaults to $XDG_CACHE_HOME, else ~/.cache.
    #[arg(long)]
    cache_root: Option<PathBuf>,

    /// Command line for the codex-style child agent.
    #[arg(long, default_value = "codex app-server")]
    codex_cmd: String,

    /// Command line for an ACP extension child; omit to disable.
    #[arg(long)]
    acp_cmd: Option<String>,

    /// Create extension sessions eagerly when settings are saved.
    #[arg(long, default_value_t = false)]
    acp_eager_session_init: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cache_root = cli
        .cache_root
        .unwrap_or_else(fws_store::default_cache_root);
    let install_root = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            tracing::error!("cannot resolve installation root: {e}");
            return ExitCode::from(1);
        }
    };

    let config = ServerConfig {
        cache_root,
        install_root,
        codex_argv: split_cmd(&cli.codex_cmd),
        acp_argv: cli.acp_cmd.as_deref().map(split_cmd),
        acp_eager_session_init: cli.acp_eager_session_init,
    };

    // Fatal init: secret derivation or directory unavailable.
    let state = match AppState::new(config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("fatal init failure: {e}");
            return ExitCode::from(1);
        }
    };

    // Warm up the shared extension child at startup; sessions wait until a
    // conversation needs one.
    if let Some(acp) = state.acp.clone() {
        tokio::spawn(async move {
            if let Err(e) = acp.warm_up().await {
                tracing::warn!("acp warm-up failed: {e}");
            }
        });
    }

    let app = fws_app_server::build_router(state);
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], cli.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            tracing::error!("port {} already in use", cli.port);
            return ExitCode::from(2);
        }
        Err(e) => {
            tracing::error!("bind failed: {e}");
            return ExitCode::from(1);
        }
    };
    tracing::info!("listening on http://{addr}");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    };
    match axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("server error: {e}");
            ExitCode::from(1)
        }
    }
}

fn split_cmd(cmd: &str) -> Vec<String> {
    cmd.split_whitespace().map(|s| s.to_string()).collect()
}
