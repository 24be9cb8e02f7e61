//! `streamcam` command line entry point
//!
//! Replays a packet capture through a full acquisition (reader thread, ring,
//! decode workers) and prints one line per frame.
//!
//! ```text
//! streamcam replay <capture.scap> [--config <config.json>] [--loop]
//! streamcam frames <capture.scap>
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use streamcam_lib::registers::{FIRMWARE_VERSION, MODE_16_CHANNELS, MODE_4_CHANNELS, OUTPUT_MODE};
use streamcam_lib::replay::{replay_frame_infos, ReplayConfig, ReplayTransport};
use streamcam_lib::{
    Acquisition, AcquisitionConfig, AcquisitionError, CmosisDecoder, DataKind, FrameData,
    RegisterFile, Wait,
};

/// How long the capture may stay silent before the replay is considered done.
const IDLE_TIMEOUT: Duration = Duration::from_secs(1);

struct Args {
    command: String,
    capture: PathBuf,
    config: Option<PathBuf>,
    loop_playback: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let usage = "usage: streamcam <replay|frames> <capture.scap> [--config <file>] [--loop]";
    let command = args.next().context(usage)?;
    let capture = PathBuf::from(args.next().context(usage)?);

    let mut config = None;
    let mut loop_playback = false;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(args.next().context("--config needs a file")?)),
            "--loop" => loop_playback = true,
            other => bail!("unknown argument '{other}'\n{usage}"),
        }
    }

    Ok(Args {
        command,
        capture,
        config,
        loop_playback,
    })
}

fn replay(args: &Args) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => AcquisitionConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AcquisitionConfig::from_env(),
    };

    let transport = ReplayTransport::load(
        &args.capture,
        ReplayConfig {
            loop_playback: args.loop_playback,
            ..ReplayConfig::default()
        },
    )?;

    // the stream was shaped by the recorded camera, not by local settings
    let header = transport.header();
    config.packet_size = header.packet_size;
    config.quirks = header.quirks;
    config.max_lines = config.max_lines.max(header.max_lines);

    let registers = Arc::new(RegisterFile::new());
    registers.set(FIRMWARE_VERSION, header.firmware);
    registers.set(
        OUTPUT_MODE,
        if header.outputs == 4 {
            MODE_4_CHANNELS
        } else {
            MODE_16_CHANNELS
        },
    );

    let acquisition = Acquisition::new(
        config,
        Box::new(transport),
        registers,
        Arc::new(CmosisDecoder),
    )?;
    acquisition.start()?;

    loop {
        let (sequence, info) = match acquisition.next_event(Wait::For(IDLE_TIMEOUT)) {
            Ok(event) => event,
            Err(AcquisitionError::Timeout) => break,
            Err(e) => return Err(e.into()),
        };

        let image = match acquisition.get(sequence, DataKind::Image) {
            Ok(FrameData::Image(image)) => {
                let lines = image.change_mask().iter().filter(|&&m| m != 0).count();
                format!("{lines} lines decoded")
            }
            Ok(_) => "no image".to_string(),
            Err(e) => format!("not decoded ({e})"),
        };

        println!(
            "frame {:6}  hw {:8}  {:8} bytes{}  {}",
            sequence,
            info.hw_sequence,
            info.raw_size,
            if info.broken { " (broken)" } else { "" },
            image
        );
    }

    acquisition.stop()?;
    let stats = acquisition.stats()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn frames(args: &Args) -> anyhow::Result<()> {
    for info in replay_frame_infos(&args.capture)? {
        println!("{}", serde_json::to_string(&info)?);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    streamcam_lib::init_logging();
    let args = parse_args()?;
    log::info!("streamcam {} starting", env!("CARGO_PKG_VERSION"));

    match args.command.as_str() {
        "replay" => replay(&args),
        "frames" => frames(&args),
        other => bail!("unknown command '{other}'"),
    }
}
