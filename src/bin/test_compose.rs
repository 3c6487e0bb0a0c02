//! Exercises the composer against the in-memory display backend:
//! bring-up, vsync routing, posting, hot-plug and teardown in sequence.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use overlay_composer::fake::{FakeDisplayDevice, FakeGpuAllocator, Journal, RecordingSink};
use overlay_composer::post::{FrameDescriptor, PixelFormat, PlaneData};
use overlay_composer::vsync::{PresentationMode, Routing};
use overlay_composer::{Composer, ComposerConfig, DisplayMode, Output, Pipe, Rect};

#[derive(Parser, Debug)]
#[command(name = "test_compose")]
#[command(about = "Overlay composer exerciser", long_about = None)]
struct Args {
    /// Enable verbose debug output
    #[arg(short, long)]
    debug: bool,

    /// Optional TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Frames to post per section
    #[arg(long, default_value_t = 3)]
    frames: u32,
}

/// Shaded I420 test pattern; the exact bytes only matter for eyeballing
/// the buffer dump in a debugger.
fn make_planes(width: usize, height: usize) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let mut y = vec![0u8; width * height];
    for (i, px) in y.iter_mut().enumerate() {
        *px = ((i % width) + (i / width)) as u8;
    }
    let u = vec![0x60u8; (width / 2) * (height / 2)];
    let v = vec![0xa0u8; (width / 2) * (height / 2)];
    (y, u, v)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let filter = if args.debug {
        "debug"
    } else {
        "warn,overlay_composer=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = match &args.config {
        Some(path) => ComposerConfig::load_or_default(path),
        None => ComposerConfig::default(),
    };

    println!("=== Overlay Composer Test ===");

    let journal = Journal::new();
    let device = Arc::new(FakeDisplayDevice::new(journal.clone()));
    let gpu = Arc::new(FakeGpuAllocator::new());
    let sink = Arc::new(RecordingSink::new(journal.clone()));

    println!("Bringing up the composer...");
    let composer = Arc::new(Composer::new(
        device.clone(),
        gpu.clone(),
        sink.clone(),
        config,
    )?);
    println!("Composer up!");
    println!("  Topology: {:?}", composer.topology());
    if let Some(mode) = composer.active_mode(Output::PanelA) {
        println!("  Panel: {}", mode);
    }
    println!("  Pool buffers: {}", composer.free_buffers());
    println!(
        "  Shared context: fd {} ({} bytes)",
        composer.shared_fd(),
        composer.shared_size()
    );

    println!("\n--- Test 1: vsync delivery ---");
    composer.vsync_control(true);
    println!("Vsync on, source mask {:#x}", composer.active_vsync_mask());
    for n in 1..=4u64 {
        device.tick(Pipe::A, n * 16_666_667);
    }
    thread::sleep(Duration::from_millis(50));
    println!(
        "Delivered {} events, last timestamp {} ns",
        sink.vsyncs().len(),
        composer.last_vsync_ns()
    );

    println!("\n--- Test 2: posting frames ---");
    let frame = FrameDescriptor {
        format: PixelFormat::I420,
        width: 320,
        height: 240,
        y_stride: 320,
        uv_stride: 192,
        gtt_offset_pages: 0,
    };
    let (y, u, v) = make_planes(320, 240);
    let planes = PlaneData {
        y: &y,
        u: &u,
        v: &v,
    };
    composer.set_overlay_position(Rect::new(40, 80, 320, 240))?;
    for i in 0..args.frames {
        composer.post_frame(&frame, &planes)?;
        if i == 0 {
            let writes = device.register_writes();
            if let Some((mask, ovadd)) = writes.last() {
                println!("First flip: engines {:#x}, OVADD {:#010x}", mask, ovadd);
            }
        }
    }
    println!(
        "Posted {} frames, pool back to {} buffers",
        args.frames,
        composer.free_buffers()
    );

    println!("\n--- Test 3: external display hot-plug ---");
    device.plug_external(vec![
        DisplayMode::new(1920, 1080, 60),
        DisplayMode::new(1280, 720, 60),
    ]);
    composer.handle_hotplug_event(Output::External, true, None)?;
    println!("Plugged: topology {:?}", composer.topology());
    if let Some(mode) = composer.active_mode(Output::External) {
        println!("  External mode: {}", mode);
    }
    composer.set_routing(Routing {
        mode: PresentationMode::Extend,
        ..Routing::default()
    });
    println!("Extend routing, source mask {:#x}", composer.active_vsync_mask());
    composer.post_frame(&frame, &planes)?;
    if let Some((_, ovadd)) = device.register_writes().last() {
        println!("Post after switch: pipe select bits {:#04x}", ovadd & 0xc0);
    }

    println!("\n--- Test 4: dynamic mode switch ---");
    composer.handle_dynamic_mode_set(Output::External, &DisplayMode::new(1280, 720, 60))?;
    if let Some(mode) = composer.active_mode(Output::External) {
        println!("Rebound external at {}", mode);
    }
    composer.post_frame(&frame, &planes)?;

    println!("\n--- Test 5: unplug with acknowledgment ---");
    device.unplug_external();
    let acker = {
        let composer = composer.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            composer.hotplug_ack();
        })
    };
    composer.handle_hotplug_event(Output::External, false, None)?;
    acker
        .join()
        .map_err(|_| anyhow::anyhow!("ack thread panicked"))?;
    composer.set_routing(Routing::default());
    println!("Unplugged: topology {:?}", composer.topology());
    composer.post_frame(&frame, &planes)?;
    println!("Posting back on the panel works");

    println!("\n--- Teardown ---");
    composer.vsync_control(false);
    let before = gpu.outstanding_bytes();
    match Arc::try_unwrap(composer) {
        Ok(composer) => composer.shutdown()?,
        Err(_) => anyhow::bail!("composer still shared at teardown"),
    }
    println!(
        "GPU memory: {} bytes before teardown, {} after",
        before,
        gpu.outstanding_bytes()
    );

    println!("\nDevice journal tail:");
    let entries = journal.entries();
    for entry in entries.iter().rev().take(8).rev() {
        println!("  {}", entry);
    }

    println!("\nTest complete!");
    Ok(())
}
