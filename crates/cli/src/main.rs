use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "adblocks")]
#[command(about = "HipChat image relay", long_about = None)]
struct Cli {
    /// Defaults to `serve` with no flags, which is how FastCGI front ends spawn the binary.
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Serve POST /adblocks/hipchat/message. With no transport flag, uses server.transport from config, else FastCGI on stdin.
    Serve {
        /// Config file path (default: ADBLOCKS_CONFIG_PATH or ~/.adblocks/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[command(flatten)]
        transport: TransportArgs,
    },

    /// List HipChat rooms visible to the configured token (name and id).
    Rooms {
        /// Config file path (default: ADBLOCKS_CONFIG_PATH or ~/.adblocks/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

/// At most one transport flag.
#[derive(Args, Default)]
#[group(multiple = false)]
struct TransportArgs {
    /// Serve as a plain web server, e.g. 0.0.0.0:8000
    #[arg(long, value_name = "ADDR")]
    local: Option<String>,

    /// Serve FastCGI over TCP, e.g. 0.0.0.0:8000
    #[arg(long, value_name = "ADDR")]
    tcp: Option<String>,

    /// Serve FastCGI over a Unix socket, e.g. /tmp/adblocks.sock
    #[arg(long, value_name = "PATH")]
    unix: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    // stdout may carry the FastCGI stream; env_logger writes to stderr.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("adblocks {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Serve { config, transport }) => serve_or_exit(config, transport).await,
        Some(Commands::Rooms { config }) => {
            if let Err(e) = run_rooms(config).await {
                log::error!("rooms failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => serve_or_exit(None, TransportArgs::default()).await,
    }
}

async fn serve_or_exit(config_path: Option<PathBuf>, flags: TransportArgs) {
    if let Err(e) = run_serve(config_path, flags).await {
        log::error!("serve failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_serve(config_path: Option<PathBuf>, flags: TransportArgs) -> anyhow::Result<()> {
    let (config, path) = adblocks_lib::config::load_config(config_path)?;
    log::debug!("loaded config from {}", path.display());
    let from_flags =
        adblocks_lib::config::transport_from_flags(flags.local, flags.tcp, flags.unix)?;
    let transport = adblocks_lib::config::resolve_transport(&config, from_flags);
    adblocks_lib::gateway::run_server(config, transport).await
}

async fn run_rooms(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _) = adblocks_lib::config::load_config(config_path)?;
    let token = adblocks_lib::config::resolve_hipchat_token(&config).ok_or_else(|| {
        anyhow::anyhow!("hipchat token not configured (set hipchat.token or HIPCHAT_TOKEN)")
    })?;
    let http = adblocks_lib::config::build_http_client(&config.http)?;
    let client =
        adblocks_lib::channels::HipChatClient::new(config.hipchat.base_url.clone(), token, http);
    for room in client.list_rooms().await? {
        println!("Name: {}  ID: {}", room.name, room.id);
    }
    Ok(())
}
