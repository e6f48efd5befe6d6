use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{ArgAction, Parser, Subcommand};
use serde_json::{Value, json};
use spclient::protos::{
    Artist, Capabilities, Device, DeviceInfo, DeviceType, MemberType, PutStateReason, PutStateRequest,
    StorageResolveResponse, Track,
};
use spclient::{AccessTokenSource, FileId, RetryPolicy, SpClient, TrackId};
use uuid::Uuid;

const VOLUME_STEPS: i32 = 64;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing access token; pass --access-token or set SPCLIENT_ACCESS_TOKEN")]
    MissingAccessToken,
    #[error(transparent)]
    Client(#[from] spclient::SpClientError),
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] spclient::IdError),
    #[error("failed rendering JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "spclient", about = "spclient connect-state, storage-resolve and metadata CLI")]
struct Cli {
    /// Service `host[:port]`.
    #[arg(long, env = "SPCLIENT_ADDRESS", default_value = "spclient.wg.spotify.com:443")]
    address: String,

    #[arg(long, env = "SPCLIENT_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    #[arg(long, env = "SPCLIENT_CLIENT_TOKEN", hide_env_values = true, default_value = "")]
    client_token: String,

    /// Defaults to a random id per run.
    #[arg(long, env = "SPCLIENT_DEVICE_ID")]
    device_id: Option<String>,

    #[arg(long, env = "SPCLIENT_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    #[arg(long, env = "SPCLIENT_MAX_ELAPSED_SECS", default_value_t = 60)]
    max_elapsed_secs: u64,

    /// Repeat for more log output (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch metadata for a track URI, base62 id or hex gid.
    Track { track: String },
    /// Resolve a hex file id to CDN URLs.
    Resolve {
        file_id: String,
        #[arg(long)]
        prefetch: bool,
    },
    /// Fetch a track and resolve every audio file it lists.
    Files {
        track: String,
        #[arg(long)]
        prefetch: bool,
    },
    /// Announce this device through connect-state.
    PutState {
        #[arg(long, env = "SPCLIENT_CONNECTION_ID")]
        connection_id: String,
        #[arg(long, default_value = "spclient-cli")]
        name: String,
        #[arg(long, default_value_t = 65_535)]
        volume: u32,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let client = build_client(&cli)?;
    match cli.command {
        Command::Track { track } => {
            let track = client.fetch_track_metadata(&track.parse::<TrackId>()?).await?;
            print_json(&track_summary(&track))
        }
        Command::Resolve { file_id, prefetch } => {
            let resolved = client.resolve_storage(&FileId::from_hex(&file_id)?, prefetch).await?;
            print_json(&storage_summary(&resolved))
        }
        Command::Files { track, prefetch } => run_files(&client, &track, prefetch).await,
        Command::PutState {
            connection_id,
            name,
            volume,
        } => {
            let state = build_put_state(client.device_id(), &name, volume, now_ms());
            client.publish_state(&connection_id, &state).await?;
            tracing::info!(device_id = client.device_id(), "connect state published");
            print_json(&json!({ "device_id": client.device_id(), "published": true }))
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();
}

fn build_client(cli: &Cli) -> Result<SpClient, CliError> {
    let access_token = cli.access_token.clone().ok_or(CliError::MissingAccessToken)?;
    let token_source: Arc<dyn AccessTokenSource> = Arc::new(move || Ok::<_, Infallible>(access_token.clone()));
    let device_id = cli
        .device_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let address = cli.address.clone();

    let client = SpClient::new(&move || address.clone(), token_source, device_id, cli.client_token.clone())?;
    Ok(client.with_retry_policy(retry_policy(cli)))
}

fn retry_policy(cli: &Cli) -> RetryPolicy {
    RetryPolicy {
        max_attempts: Some(cli.max_attempts.max(1)),
        max_elapsed: Some(Duration::from_secs(cli.max_elapsed_secs)),
        ..RetryPolicy::default()
    }
}

async fn run_files(client: &SpClient, track: &str, prefetch: bool) -> Result<(), CliError> {
    let track = client.fetch_track_metadata(&track.parse::<TrackId>()?).await?;
    let mut files = Vec::with_capacity(track.file.len());
    for file in &track.file {
        let file_id = FileId::from(file.file_id());
        let resolved = client.resolve_storage(&file_id, prefetch).await?;
        files.push(json!({
            "format": file.format(),
            "storage": storage_summary(&resolved),
        }));
    }
    print_json(&json!({ "track": track_summary(&track), "files": files }))
}

fn build_put_state(device_id: &str, name: &str, volume: u32, now_ms: u64) -> PutStateRequest {
    let device_info = DeviceInfo {
        can_play: true,
        volume,
        name: name.to_owned(),
        device_id: device_id.to_owned(),
        device_type: DeviceType::Computer as i32,
        device_software_version: env!("CARGO_PKG_VERSION").to_owned(),
        capabilities: Some(Capabilities {
            can_be_player: true,
            gaia_eq_connect_id: true,
            supports_logout: true,
            is_observable: true,
            volume_steps: VOLUME_STEPS,
            supported_types: vec!["audio/track".to_owned(), "audio/episode".to_owned()],
            command_acks: true,
            supports_transfer_command: true,
            supports_command_request: true,
            ..Capabilities::default()
        }),
        ..DeviceInfo::default()
    };

    PutStateRequest {
        member_type: MemberType::ConnectState as i32,
        put_state_reason: PutStateReason::NewDevice as i32,
        client_side_timestamp: now_ms,
        device: Some(Device {
            device_info: Some(device_info),
            player_state: None,
        }),
        ..PutStateRequest::default()
    }
}

fn track_summary(track: &Track) -> Value {
    json!({
        "uri": TrackId::from_gid_slice(track.gid()).ok().map(|id| id.to_uri()),
        "name": track.name(),
        "album": track.album.as_ref().map(|album| album.name()),
        "artists": track.artist.iter().map(Artist::name).collect::<Vec<_>>(),
        "duration_ms": track.duration(),
        "explicit": track.explicit(),
        "files": track
            .file
            .iter()
            .map(|file| json!({
                "file_id": FileId::from(file.file_id()).to_hex(),
                "format": file.format(),
            }))
            .collect::<Vec<_>>(),
    })
}

fn storage_summary(resolved: &StorageResolveResponse) -> Value {
    json!({
        "result": resolved.result(),
        "cdnurl": resolved.cdnurl,
        "fileid": FileId::from(resolved.fileid.as_slice()).to_hex(),
    })
}

fn now_ms() -> u64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    u64::try_from(duration.as_millis()).unwrap_or(0)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;
