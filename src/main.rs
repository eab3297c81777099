// Copyright 2024 WinRun Authors
// SPDX-License-Identifier: Apache-2.0

//! Guest Agent CLI entry point
//!
//! Runs inside the VM: maps the shared frame region, connects the
//! control stream to the host, and runs the capture loop until
//! interrupted or told to shut down.

use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, Command};
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

use winrun_guest_agent::agent::AgentConfig;
use winrun_guest_agent::capture::SyntheticCapture;
use winrun_guest_agent::frame_buffer::AllocationMode;
use winrun_guest_agent::shmem::{SharedMemoryAllocator, SharedMemoryConfig};
use winrun_guest_agent::transport::StreamSink;
use winrun_guest_agent::GuestAgent;

fn main() -> anyhow::Result<()> {
    let matches = Command::new("winrun-guest-agent")
        .version("0.1.0")
        .about("WinRun guest agent for per-window frame transport")
        .arg(
            Arg::new("host")
                .short('H')
                .long("host")
                .value_name("ADDR")
                .default_value("127.0.0.1:7670")
                .help("Host control endpoint (byte stream)"),
        )
        .arg(
            Arg::new("shm-path")
                .short('s')
                .long("shm-path")
                .value_name("PATH")
                .default_value("/dev/shm/winrun-frames")
                .help("Path to the shared frame region"),
        )
        .arg(
            Arg::new("shm-size-mb")
                .long("shm-size-mb")
                .value_name("MB")
                .default_value("256")
                .help("Minimum shared region size in MiB"),
        )
        .arg(
            Arg::new("fps")
                .short('f')
                .long("fps")
                .value_name("FPS")
                .default_value("30")
                .help("Target frames per second"),
        )
        .arg(
            Arg::new("desktop")
                .short('d')
                .long("desktop")
                .action(clap::ArgAction::SetTrue)
                .help("Stream the whole desktop instead of per-window regions"),
        )
        .arg(
            Arg::new("compress")
                .short('c')
                .long("compress")
                .action(clap::ArgAction::SetTrue)
                .help("Compress frame payloads (zstd)"),
        )
        .arg(
            Arg::new("tranche")
                .long("tranche")
                .action(clap::ArgAction::SetTrue)
                .help("Use tranche (bucketed) buffer sizing instead of exact"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new().with_level(log_level).init()?;

    let fps: u32 = matches.get_one::<String>("fps").unwrap().parse()?;
    let shm_size_mb: usize = matches.get_one::<String>("shm-size-mb").unwrap().parse()?;
    let host = matches.get_one::<String>("host").unwrap().clone();

    let shm_config = SharedMemoryConfig {
        path: PathBuf::from(matches.get_one::<String>("shm-path").unwrap()),
        minimum_size: shm_size_mb * 1024 * 1024,
        create: true,
    };
    // Falls back to private buffers when the region cannot be mapped.
    let allocator = SharedMemoryAllocator::initialize(&shm_config).map(Arc::new);

    let mut config = AgentConfig::default();
    config.streamer.target_fps = fps;
    config.streamer.per_window = !matches.get_flag("desktop");
    // Without a host-side read acknowledgement wired up, drain the rings
    // locally so streaming continues past the first slots.
    config.streamer.local_read_advance = true;
    config.compression = matches.get_flag("compress");
    config.allocation_mode = if matches.get_flag("tranche") {
        AllocationMode::Tranche
    } else {
        AllocationMode::Exact
    };

    info!("connecting to host at {host}");
    let stream = TcpStream::connect(&host)?;
    stream.set_nodelay(true).ok();
    // Read timeout keeps the inbound reader responsive to shutdown.
    stream.set_read_timeout(Some(Duration::from_millis(100)))?;
    let inbound = stream.try_clone()?;
    let sink = StreamSink::new(stream);

    // The platform capture backend plugs in here; the synthetic source
    // keeps the transport exercisable on any machine.
    info!("using synthetic capture source (1920x1080)");
    let capture = Box::new(SyntheticCapture::new(1920, 1080));

    let mut agent =
        GuestAgent::new(config, capture, Box::new(sink), allocator).with_inbound(inbound);
    agent.start()?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    info!("guest agent running, press Ctrl+C to stop");
    while running.load(Ordering::SeqCst) && !agent.shutdown_requested() {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("stopping guest agent...");
    agent.stop();
    Ok(())
}
