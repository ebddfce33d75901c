//! # Slipstream Client
//!
//! ```text
//! slipstream play <file.h264>              Replay in a window
//! slipstream play <file.h264> --headless   Replay straight to KMS
//! slipstream devices                       List V4L2 decoders
//! ```

mod host;
mod replay;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use slipstream_core::config::PipelineConfig;
use slipstream_core::decoder::v4l2;
use slipstream_core::network::{StreamParams, VideoCodec};
use slipstream_core::picture::Colorspace;
use slipstream_core::platform::{DisplayKind, RenderKind};

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "slipstream", version, about = "Low-latency remote rendering client")]
struct Cli {
    /// Pipeline configuration (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging for slipstream modules
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay an Annex B elementary stream through the pipeline
    Play(PlayArgs),
    /// List V4L2 memory-to-memory decoders
    Devices,
}

#[derive(clap::Args, Debug)]
struct PlayArgs {
    /// H.264 or HEVC elementary stream
    file: PathBuf,

    /// Present on the DRM/KMS display instead of a window
    #[arg(long)]
    headless: bool,

    /// Codec, guessed from the file extension when omitted
    #[arg(long, value_parser = parse_codec)]
    codec: Option<VideoCodec>,

    #[arg(long, default_value_t = 1920)]
    width: u32,

    #[arg(long, default_value_t = 1080)]
    height: u32,

    #[arg(long, default_value_t = 60)]
    fps: u32,

    /// Start again from the top when the stream ends
    #[arg(long = "loop")]
    looping: bool,

    /// Full-range YUV
    #[arg(long)]
    full_range: bool,

    /// Decode in software even when a hardware decoder is present
    #[arg(long)]
    software: bool,

    /// Force a render backend (gles, wgpu, drm-direct, blit)
    #[arg(long, value_parser = parse_render)]
    render: Option<RenderKind>,

    /// Print final statistics as JSON
    #[arg(long)]
    stats_json: bool,
}

fn parse_codec(s: &str) -> std::result::Result<VideoCodec, String> {
    match s.to_ascii_lowercase().as_str() {
        "h264" | "avc" => Ok(VideoCodec::H264),
        "hevc" | "h265" => Ok(VideoCodec::Hevc),
        "av1" => Ok(VideoCodec::Av1),
        other => Err(format!("unknown codec '{}'", other)),
    }
}

fn parse_render(s: &str) -> std::result::Result<RenderKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "gles" | "gl" => Ok(RenderKind::Gles),
        "wgpu" => Ok(RenderKind::Wgpu),
        "drm-direct" | "drm" => Ok(RenderKind::DrmDirect),
        "blit" => Ok(RenderKind::Blit),
        other => Err(format!("unknown render backend '{}'", other)),
    }
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    let cli = Cli::parse();

    // target prefixes: "slipstream" also covers slipstream_core
    let directive = if cli.verbose { "slipstream=debug,wgpu=warn" } else { "slipstream=info,wgpu=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Slipstream v{}", slipstream_core::VERSION);

    match cli.command {
        Command::Devices => list_devices(),
        Command::Play(args) => {
            let config = load_config(cli.config.as_deref(), &args)?;
            play(config, args)
        }
    }
}

fn list_devices() -> Result<()> {
    let devices = v4l2::probe_devices();
    if devices.is_empty() {
        tracing::info!("no V4L2 decoders found, software decoding only");
    }
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

/// Config file (or defaults) with CLI flags on top
fn load_config(path: Option<&std::path::Path>, args: &PlayArgs) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if args.software {
        config.hardware_decode = false;
    }
    if args.headless {
        config.display = Some(DisplayKind::Kms);
    }
    if let Some(render) = args.render {
        config.render = Some(render);
    }
    config.validate()?;
    Ok(config)
}

fn play(config: PipelineConfig, args: PlayArgs) -> Result<()> {
    let codec = args
        .codec
        .or_else(|| replay::codec_for(&args.file))
        .context("cannot tell the codec from the file name, pass --codec")?;
    let units = replay::load(&args.file, codec)?;

    let params = StreamParams {
        codec,
        width: args.width,
        height: args.height,
        fps: args.fps,
        yuv444: config.yuv444,
        full_range: args.full_range,
        colorspace: Colorspace::Bt709,
        ..Default::default()
    };
    params.validate()?;

    let options = host::HostOptions { looping: args.looping, stats_json: args.stats_json };
    let link = replay::ReplayLink::new();
    if args.headless {
        host::run_headless(config, params, units, link, options)
    } else {
        host::run_windowed(config, params, units, link, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_play() {
        let cli = Cli::try_parse_from(["slipstream", "-v", "play", "clip.h264", "--headless", "--fps", "30"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Play(args) => {
                assert!(args.headless);
                assert_eq!(args.fps, 30);
                assert_eq!(args.width, 1920);
                let config = load_config(None, &args).unwrap();
                assert_eq!(config.display, Some(DisplayKind::Kms));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_forced_render_conflicting_with_headless_is_rejected() {
        let cli = Cli::try_parse_from(["slipstream", "play", "a.h264", "--headless", "--render", "gles"]).unwrap();
        let Command::Play(args) = cli.command else { panic!("expected play") };
        assert!(load_config(None, &args).is_err());
    }

    #[test]
    fn test_value_parsers() {
        assert_eq!(parse_codec("HEVC"), Ok(VideoCodec::Hevc));
        assert!(parse_codec("vp9").is_err());
        assert_eq!(parse_render("drm-direct"), Ok(RenderKind::DrmDirect));
    }
}
