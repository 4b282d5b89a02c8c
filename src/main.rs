use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use dacl::{
    Config, DaclError, Recorder, SegmentBuffer, Shutdown, TelemetryStore, TriggerCoordinator,
    TriggerWindows, WarningMailbox,
    archive::{AuditLog, FileArchiver, SvgOverlayRenderer},
    buffer::purge_stale_segments,
    can::{CanListener, FrameSource, ReplayFrameSource, listener::bus_source, parse_can_warnings},
    recorder::{CommandEncoder, EncoderCommandBuilder},
    retention::RetentionSweeper,
    trigger::{
        CanWarningDetector, ConsoleDetector, GpioDetector, SysfsButton, TriggerDetector,
    },
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record into the rolling buffer and archive events until interrupted
    Record {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Replay a `candump -l` log instead of opening the CAN interface
        #[arg(short, long)]
        replay: Option<PathBuf>,
    },
    /// Print the resolved configuration as JSON
    ShowConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn prepare_dirs(config: &Config) -> Result<(), DaclError> {
    if config.purge_on_start {
        purge_stale_segments(&config.buffer_dir)?;
    }
    for dir in [&config.buffer_dir, &config.event_dir] {
        fs::create_dir_all(dir).map_err(|e| DaclError::FileOperationError {
            operation: "create_dir".to_string(),
            path: dir.clone(),
            source: e,
        })?;
    }
    Ok(())
}

fn frame_source(
    config: &Config,
    replay: Option<&Path>,
) -> Result<Box<dyn FrameSource + Send>, DaclError> {
    let source: Box<dyn FrameSource + Send> = match replay {
        Some(path) => {
            info!("Replaying CAN traffic from {}", path.display());
            Box::new(ReplayFrameSource::from_candump_file(path)?)
        }
        None => bus_source(&config.can_iface),
    };
    Ok(source)
}

fn record(config: Config, replay: Option<PathBuf>) -> Result<(), DaclError> {
    prepare_dirs(&config)?;

    let shutdown = Shutdown::new();
    let handler_shutdown = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Exiting...");
        handler_shutdown.trigger();
    }) {
        warn!("Could not set Ctrl-C handler: {}", e);
    }

    let telemetry = Arc::new(TelemetryStore::new());
    let mailbox = Arc::new(WarningMailbox::new());
    let buffer = Arc::new(SegmentBuffer::new(
        config.buffer_capacity(),
        config.segment_duration(),
        Some(config.retention_age()),
    ));
    let encoder = CommandEncoder::new(
        EncoderCommandBuilder::new(&config.encoder_program)
            .with_resolution(config.video_width, config.video_height)
            .with_framerate(config.framerate),
    );
    let recorder = Arc::new(Recorder::new(
        buffer.clone(),
        telemetry.clone(),
        Arc::new(encoder),
        &config.buffer_dir,
    ));

    let mut archiver = FileArchiver::new(&config.event_dir, shutdown.clone());
    if config.burn_in_overlay {
        archiver = archiver.with_burn_in(&config.ffmpeg_program);
    }
    let coordinator = Arc::new(TriggerCoordinator::new(
        recorder.clone(),
        telemetry.clone(),
        Arc::new(SvgOverlayRenderer::in_temp_dir(
            config.video_width,
            config.video_height,
        )),
        archiver,
        Arc::new(AuditLog::new(&config.audit_log)),
        TriggerWindows {
            pre: config.pre_window(),
            post: config.post_window(),
            session_timeout: config.session_timeout(),
        },
    ));

    let warnings = parse_can_warnings(&config.warning_ids);
    if warnings.is_empty() {
        warn!("No CAN warning IDs configured, CAN trigger will never fire");
    }
    let mut source = frame_source(&config, replay.as_deref())?;
    let listener = CanListener::new(warnings, telemetry.clone(), mailbox.clone());

    let mut handles = Vec::new();
    {
        let shutdown = shutdown.clone();
        handles.push((
            "can",
            thread::spawn(move || {
                if let Err(e) = listener.run(&mut source, &shutdown) {
                    error!("CAN ingestion stopped: {}", e);
                }
            }),
        ));
    }
    {
        let shutdown = shutdown.clone();
        let recorder = recorder.clone();
        handles.push(("recorder", thread::spawn(move || recorder.run(&shutdown))));
    }
    {
        let shutdown = shutdown.clone();
        let sweeper =
            RetentionSweeper::new(&config.buffer_dir, config.retention_age(), config.sweep_interval())
                .with_buffer(buffer.clone());
        handles.push(("retention", thread::spawn(move || sweeper.run(&shutdown))));
    }

    let detectors: Vec<Box<dyn TriggerDetector>> = vec![
        Box::new(CanWarningDetector::new(mailbox)),
        Box::new(GpioDetector::new(SysfsButton::new(config.button_pin))),
        Box::new(ConsoleDetector::from_stdin()),
    ];
    handles.extend(
        coordinator
            .spawn(detectors, &shutdown)
            .into_iter()
            .map(|handle| ("trigger", handle)),
    );

    info!(
        "Recording {}s segments, {} min buffer ({} segments), press t to trigger and e to exit",
        config.segment_seconds,
        config.buffer_minutes,
        buffer.capacity()
    );

    for (name, handle) in handles {
        if handle.join().is_err() {
            error!("Thread {} panicked", name);
            shutdown.trigger();
        }
    }
    info!("Shutdown complete");
    Ok(())
}

fn show_config(config: &Config) -> Result<(), DaclError> {
    println!("{}", config.to_json()?);
    Ok(())
}

fn main() {
    colog::init();

    let cli = Args::parse();
    let result = match cli.command {
        Commands::Record { config, replay } => {
            Config::load(config.as_deref()).and_then(|config| record(config, replay))
        }
        Commands::ShowConfig { config } => {
            Config::load(config.as_deref()).and_then(|config| show_config(&config))
        }
    };
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}
