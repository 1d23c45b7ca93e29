mod error;

use clap::{Parser, Subcommand};
use error::App;
use std::path::Path;
use tokio::process::Command;
use zbus::{proxy, Connection};

type StdResult<T> = std::result::Result<T, App>;

const DEFAULT_BUS_NAME: &str = "org.relayplay.Player";
const QUIT_TOKEN: &str = "exit";
const DEFAULT_TOKEN: &str = "none";

#[proxy(
    interface = "org.relayplay.Player",
    default_service = "org.relayplay.Player",
    default_path = "/org/relayplay/Player"
)]
trait Player {
    async fn submit(&self, token: &str) -> zbus::Result<()>;
    async fn test_connection(&self) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "rplay", about = "Control the relayplay video player.", version)]
struct Cli {
    #[arg(
        short = 'n',
        long = "name",
        default_value = DEFAULT_BUS_NAME,
        help = "D-Bus name of the player"
    )]
    name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Queue a video for playback")]
    Play(PlayCommand),

    #[command(about = "Queue the player's default video")]
    Default,

    #[command(about = "Stop the player")]
    Exit,

    #[command(about = "Send a raw command token")]
    Send(SendCommand),

    #[command(about = "Check whether the player is running")]
    Status,

    #[command(about = "Start relayplay if it is not running")]
    Start(StartCommand),
}

#[derive(Parser)]
struct PlayCommand {
    #[arg(help = "Path or URI of the video")]
    source: String,
}

#[derive(Parser)]
struct SendCommand {
    #[arg(help = "Token delivered verbatim")]
    token: String,
}

#[derive(Parser)]
struct StartCommand {
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        help = "Arguments passed to relayplay"
    )]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> StdResult<()> {
    let cli = Cli::parse();
    let connection = Connection::session().await?;
    let proxy = PlayerProxy::builder(&connection)
        .destination(cli.name.clone())?
        .build()
        .await?;
    handle_command(cli, &proxy).await
}

async fn handle_command(cli: Cli, proxy: &PlayerProxy<'_>) -> StdResult<()> {
    match cli.command {
        Commands::Play(play_cmd) => {
            let source = resolve_source(&play_cmd.source);
            submit(proxy, &cli.name, &source).await?;
            println!("Queued {source}");
            Ok(())
        }
        Commands::Default => {
            submit(proxy, &cli.name, DEFAULT_TOKEN).await?;
            println!("Queued default video");
            Ok(())
        }
        Commands::Exit => {
            submit(proxy, &cli.name, QUIT_TOKEN).await?;
            println!("relayplay is exiting");
            Ok(())
        }
        Commands::Send(send_cmd) => submit(proxy, &cli.name, &send_cmd.token).await,
        Commands::Status => {
            if is_player_running(proxy).await {
                println!("relayplay is running on {}", cli.name);
            } else {
                println!("relayplay is not running on {}", cli.name);
            }
            Ok(())
        }
        Commands::Start(start_cmd) => start_player(proxy, &cli.name, start_cmd.args).await,
    }
}

async fn submit(proxy: &PlayerProxy<'_>, name: &str, token: &str) -> StdResult<()> {
    if !is_player_running(proxy).await {
        return Err(App::NotRunning(name.to_string()));
    }
    proxy.submit(token).await?;
    Ok(())
}

async fn is_player_running(proxy: &PlayerProxy<'_>) -> bool {
    proxy.test_connection().await.is_ok()
}

/// Existing local paths are made absolute because the player resolves them
/// against its own working directory. Anything else is sent unchanged.
fn resolve_source(source: &str) -> String {
    if source.contains("://") {
        return source.to_string();
    }
    Path::new(source)
        .canonicalize()
        .map_or_else(|_| source.to_string(), |path| path.display().to_string())
}

async fn start_player(proxy: &PlayerProxy<'_>, name: &str, args: Vec<String>) -> StdResult<()> {
    if is_player_running(proxy).await {
        println!("relayplay is already running on {name}");
        return Ok(());
    }

    let current_exe_path = std::env::current_exe()?;
    let exe_dir = current_exe_path.parent().ok_or_else(|| {
        App::InvalidInput("Failed to get the directory of the executable".to_string())
    })?;
    let player_path = exe_dir.join("relayplay");

    if !player_path.exists() {
        return Err(App::InvalidInput(
            "relayplay executable not found in the same directory".to_string(),
        ));
    }

    let mut command = Command::new(player_path);
    if name != DEFAULT_BUS_NAME {
        command.arg("--name").arg(name);
    }
    let child = command.args(args).spawn()?;
    println!("relayplay started, process ID: {:?}", child.id());
    Ok(())
}
