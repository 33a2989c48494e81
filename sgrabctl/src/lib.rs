#![allow(clippy::result_large_err)]

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use thiserror::Error;
use tokio::runtime::Builder;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter};

use sgrab_core::{
    load_core_config, CoreConfig, DownloadEvent, DownloadRequest, DownloadStatus, Downloader,
    HttpClient, ManifestLoader, MuxPaths, SelectionPolicy, TrackKind,
};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] sgrab_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine error: {0}")]
    Engine(#[from] sgrab_core::DownloadError),
    #[error("manifest error: {0}")]
    Manifest(#[from] sgrab_core::ManifestError),
    #[error("http error: {0}")]
    Http(#[from] sgrab_core::HttpError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Adaptive-stream download engine", long_about = None)]
pub struct Cli {
    /// Optional core.toml overriding the built-in defaults
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Verbose engine logging
    #[arg(long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download a manifest into a single muxed file
    Download(DownloadArgs),
    /// List the streams a manifest offers without downloading
    Inspect(InspectArgs),
    /// Emit shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    /// HLS (.m3u8) or DASH (.mpd) manifest URL
    #[arg(long)]
    pub url: String,
    /// Output path including extension (.mp4 or .mkv)
    #[arg(long)]
    pub output: PathBuf,
    /// DRM license endpoint
    #[arg(long)]
    pub license_url: Option<String>,
    /// Raw KID:KEY, skipping the license exchange
    #[arg(long)]
    pub key: Option<String>,
    /// best, worst or a height such as 1080p
    #[arg(long, default_value = "best")]
    pub resolution: String,
    /// Audio languages (comma separated, or "all")
    #[arg(long = "audio-lang", value_delimiter = ',')]
    pub audio_languages: Vec<String>,
    /// Subtitle languages (comma separated, or "all")
    #[arg(long = "sub-lang", value_delimiter = ',')]
    pub subtitle_languages: Vec<String>,
    /// Keep Forced/SDH/CC subtitle renditions
    #[arg(long)]
    pub include_special_subs: bool,
    /// Extra header, repeatable ("Name: value")
    #[arg(long = "header")]
    pub headers: Vec<String>,
    /// ffmpeg binary override
    #[arg(long)]
    pub ffmpeg: Option<PathBuf>,
    /// mp4decrypt binary override
    #[arg(long)]
    pub mp4decrypt: Option<PathBuf>,
    /// Keep the per-job temp directory around
    #[arg(long)]
    pub no_cleanup: bool,
    /// Print the final report as JSON instead of the summary
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Manifest URL to probe
    #[arg(long)]
    pub url: String,
    /// Extra header, repeatable ("Name: value")
    #[arg(long = "header")]
    pub headers: Vec<String>,
}

pub fn run(cli: Cli) -> Result<i32> {
    init_tracing(cli.verbose);
    let config = match &cli.config {
        Some(path) => load_core_config(path)?,
        None => CoreConfig::default(),
    };

    let runtime = Builder::new_multi_thread().enable_all().build()?;
    match cli.command {
        Commands::Download(args) => runtime.block_on(download(config, args)),
        Commands::Inspect(args) => runtime.block_on(inspect(config, args)),
        Commands::Completions { shell } => {
            generate(
                shell,
                &mut Cli::command(),
                "sgrabctl",
                &mut std::io::stdout(),
            );
            Ok(0)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_fmt().with_env_filter(filter).try_init();
}

async fn download(mut config: CoreConfig, args: DownloadArgs) -> Result<i32> {
    if args.no_cleanup {
        config.output.cleanup_temp = false;
    }
    if let Some(extension) = args.output.extension().and_then(|ext| ext.to_str()) {
        config.output.extension = extension.to_ascii_lowercase();
    }
    config.validate()?;

    let mux_paths = MuxPaths {
        ffmpeg: args.ffmpeg.unwrap_or_else(|| PathBuf::from("ffmpeg")),
        mp4decrypt: args
            .mp4decrypt
            .unwrap_or_else(|| PathBuf::from("mp4decrypt")),
    };
    let downloader = Downloader::new(config)?.with_mux_paths(mux_paths);

    let mut request = DownloadRequest::new(&args.url, &args.output);
    request.license_url = args.license_url;
    request.raw_key = args.key;
    request.headers = parse_headers(&args.headers)?;
    request.selection = SelectionPolicy {
        resolution: args.resolution,
        audio_languages: args.audio_languages,
        subtitle_languages: args.subtitle_languages,
        include_special_subtitles: args.include_special_subs,
    };

    let mut handle = downloader.start(request);
    while let Some(event) = handle.next_event().await {
        if !args.json {
            render_event(&event);
        }
    }
    let report = handle.wait().await;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).unwrap_or_else(|err| format!(
                "{{\"error\":\"failed to serialize report: {err}\"}}"
            ))
        );
        return Ok(report.exit_code);
    }

    match report.status {
        DownloadStatus::Completed => {
            println!("output:   {}", report.output_path.display());
            println!("size:     {}", format_file_size(report.bytes_total));
            if let Some(duration) = report.duration_s {
                println!("duration: {}", format_duration(duration));
            }
        }
        _ => {
            eprintln!(
                "download {}: {}",
                status_label(report.status),
                report.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    Ok(report.exit_code)
}

async fn inspect(config: CoreConfig, args: InspectArgs) -> Result<i32> {
    let http = HttpClient::new(&config.network)?;
    let loader = ManifestLoader::new(http);
    let headers = parse_headers(&args.headers)?;
    let loaded = loader.load(&args.url, &headers).await?;

    println!("manifest: {:?}", loaded.stream_set.kind);
    println!(
        "{:<10} {:<12} {:>12} {:>10} {:<8} {:<10} {:<9}",
        "kind", "id", "resolution", "kbps", "lang", "codec", "encrypted"
    );
    for rep in &loaded.stream_set.representations {
        let resolution = rep
            .resolution
            .map(|(w, h)| format!("{w}x{h}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:<12} {:>12} {:>10} {:<8} {:<10} {:<9}",
            kind_label(rep.kind),
            rep.id,
            resolution,
            rep.bandwidth / 1000,
            rep.language.as_deref().unwrap_or("-"),
            rep.codec,
            if rep.encrypted { "yes" } else { "no" },
        );
    }
    Ok(0)
}

fn render_event(event: &DownloadEvent) {
    match event {
        DownloadEvent::StatusChanged { status } => {
            println!("status: {}", status_label(*status));
        }
        DownloadEvent::ManifestParsed {
            kind,
            video_tracks,
            audio_tracks,
            subtitle_tracks,
        } => {
            println!(
                "manifest {kind:?}: {video_tracks} video, {audio_tracks} audio, {subtitle_tracks} subtitle"
            );
        }
        DownloadEvent::TracksSelected {
            video,
            audio,
            subtitles,
        } => {
            println!(
                "selected video={video} audio=[{}] subs=[{}]",
                audio.join(","),
                subtitles.join(",")
            );
        }
        DownloadEvent::Fallback { kind, selected } => {
            println!("warning: no {} matched, using {selected}", kind_label(*kind));
        }
        DownloadEvent::Progress { track, snapshot } => {
            print!(
                "\r{track}: {:>5.1}% {:>4}/{} segments {:>10}/s eta {:<8}",
                snapshot.percent,
                snapshot.done,
                snapshot.total_segments,
                format_file_size(snapshot.speed_bps),
                snapshot
                    .eta_s
                    .map(|eta| format_duration(eta as f64))
                    .unwrap_or_else(|| "-".to_string()),
            );
            let _ = std::io::stdout().flush();
        }
        DownloadEvent::TrackDone {
            track,
            bytes_total,
            failed,
        } => {
            println!(
                "\n{track}: done, {} written, {failed} segment(s) missing",
                format_file_size(*bytes_total)
            );
        }
        DownloadEvent::Warning { message } => println!("warning: {message}"),
        DownloadEvent::TrackFailed { track, reason } => {
            println!("\n{track}: failed ({reason})");
        }
        _ => {}
    }
}

fn parse_headers(raw: &[String]) -> Result<HashMap<String, String>> {
    let mut headers = HashMap::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once(':') else {
            return Err(AppError::InvalidArgument(format!(
                "header must be \"Name: value\", got {entry:?}"
            )));
        };
        headers.insert(name.trim().to_string(), value.trim().to_string());
    }
    Ok(headers)
}

fn status_label(status: DownloadStatus) -> &'static str {
    match status {
        DownloadStatus::NotStarted => "not started",
        DownloadStatus::Parsing => "parsing",
        DownloadStatus::Downloading => "downloading",
        DownloadStatus::Completed => "completed",
        DownloadStatus::Failed => "failed",
        DownloadStatus::Cancelled => "cancelled",
    }
}

fn kind_label(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Video => "video",
        TrackKind::Audio => "audio",
        TrackKind::Subtitle => "subtitle",
    }
}

fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

fn format_duration(seconds: f64) -> String {
    let total = seconds.round() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parsing() {
        let headers =
            parse_headers(&["Authorization: Bearer abc".to_string(), "X-A:1".to_string()])
                .unwrap();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer abc");
        assert_eq!(headers.get("X-A").unwrap(), "1");
        assert!(parse_headers(&["no-separator".to_string()]).is_err());
    }

    #[test]
    fn file_sizes_humanized() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(2048), "2.00 KiB");
        assert_eq!(format_file_size(5 * 1024 * 1024), "5.00 MiB");
    }

    #[test]
    fn durations_humanized() {
        assert_eq!(format_duration(65.0), "1:05");
        assert_eq!(format_duration(3725.0), "1:02:05");
    }

    #[test]
    fn cli_parses_download_command() {
        let cli = Cli::try_parse_from([
            "sgrabctl",
            "download",
            "--url",
            "https://host/play.m3u8",
            "--output",
            "out.mp4",
            "--resolution",
            "1080p",
            "--audio-lang",
            "it,en",
        ])
        .unwrap();
        let Commands::Download(args) = cli.command else {
            panic!("expected download command");
        };
        assert_eq!(args.resolution, "1080p");
        assert_eq!(args.audio_languages, vec!["it", "en"]);
    }
}
