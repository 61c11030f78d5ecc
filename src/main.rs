/**
 * ============================================================================
 * REWIND CLI
 * ============================================================================
 *
 * Runs replay capture in the background and reads commands from stdin:
 *   save [seconds]     export the trailing window as a clip
 *   duration <seconds> change and persist the default replay duration
 *   status             print capture status as JSON
 *   clips              list saved clips
 *   quit               stop capture and exit (also Ctrl-C)
 *
 * ============================================================================
 */

use rewind::recording::capture::CaptureSource;
use rewind::recording::config::{self, CaptureTimings, ReplayConfig};
use rewind::recording::error::CaptureResult;
use rewind::recording::ffmpeg::{self, FfmpegEncoderFactory, FfmpegRemuxer, FfprobeProbe};
use rewind::recording::library::JsonClipStore;
use rewind::recording::manager::{CaptureManager, CaptureManagerBuilder};
use rewind::recording::storage::{self, StorageLayout};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[cfg(feature = "screen-capture")]
fn capture_source() -> Arc<dyn CaptureSource> {
    Arc::new(rewind::recording::capture::screen::ScapSource::new())
}

#[cfg(not(feature = "screen-capture"))]
fn capture_source() -> Arc<dyn CaptureSource> {
    use rewind::recording::types::VideoSize;
    log::warn!("Built without screen-capture; recording a synthetic test pattern");
    Arc::new(rewind::recording::capture::SyntheticSource::new(VideoSize::new(1280, 720)))
}

#[tokio::main]
async fn main() {
    rewind::init_logging();

    if let Err(e) = run().await {
        log::error!("{}", e);
        eprintln!("rewind: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> CaptureResult<()> {
    let config_path = config::config_path();
    let replay_config = config::load_config(&config_path).unwrap_or_else(|e| {
        log::warn!("Ignoring unreadable config: {}", e);
        ReplayConfig::default()
    });

    // FFmpeg paths must be resolved before any writer is created
    ffmpeg::init_ffmpeg_paths();
    ffmpeg::check_ffmpeg()?;

    let layout = StorageLayout::default_dirs();
    layout.ensure_dirs()?;
    let removed = layout.cleanup_live_segments();
    if removed > 0 {
        log::info!("Removed {} stale live segment(s)", removed);
    }
    if let Some(warning) = storage::low_storage_warning(&layout.clips_dir) {
        eprintln!("warning: {}", warning);
    }

    let manager = CaptureManagerBuilder::new(
        capture_source(),
        Arc::new(FfmpegEncoderFactory),
        Arc::new(FfprobeProbe),
        Arc::new(FfmpegRemuxer),
        layout.clone(),
    )
    .config(replay_config)
    .timings(CaptureTimings::default())
    .catalog(Arc::new(JsonClipStore::new(&layout.data_dir)))
    .build();

    manager.set_interrupt_handler(|e| {
        eprintln!("capture interrupted: {}", e);
    });

    manager.start().await?;
    println!("Recording. Commands: save [seconds], duration <seconds>, status, clips, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                if !handle_command(&manager, &layout, line.trim()).await {
                    break;
                }
            }
        }
    }

    manager.stop().await
}

// Returns false when the user asked to quit
async fn handle_command(manager: &Arc<CaptureManager>, layout: &StorageLayout, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("save") => {
            let saved = match parts.next().map(str::parse::<f64>) {
                Some(Ok(seconds)) => manager.save_replay(seconds, manager.config().container()).await,
                Some(Err(_)) => {
                    eprintln!("usage: save [seconds]");
                    return true;
                }
                None => manager.save_configured_replay().await,
            };
            match saved {
                Ok(clip) => println!("saved {} ({:.1}s)", clip.path.display(), clip.duration_seconds),
                Err(e) if e.is_nothing_captured() => eprintln!("nothing captured yet"),
                Err(e) if e.is_save_in_progress() => eprintln!("a save is already running"),
                Err(e) => eprintln!("save failed: {}", e),
            }
        }
        Some("duration") => {
            let Some(Ok(seconds)) = parts.next().map(str::parse::<f64>) else {
                eprintln!("usage: duration <seconds>");
                return true;
            };
            let mut updated = manager.config();
            updated.replay_duration_seconds = seconds;
            let applied = match manager.update_config(updated.clone()).await {
                Ok(()) => config::save_config(&config::config_path(), &updated),
                Err(e) => Err(e),
            };
            match applied {
                Ok(()) => println!("replay duration set to {:.0}s", seconds),
                Err(e) => eprintln!("{}", e),
            }
        }
        Some("status") => {
            let status = manager.get_status();
            match serde_json::to_string_pretty(&status) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("{}", e),
            }
            println!(
                "clips on disk: {:.1} MB",
                storage::calculate_total_storage(&layout.clips_dir) as f64 / (1024.0 * 1024.0)
            );
        }
        Some("clips") => match manager.clips() {
            Ok(clips) if clips.is_empty() => println!("no clips yet"),
            Ok(clips) => {
                for clip in clips {
                    println!(
                        "{}  {:>6.1}s  {}",
                        clip.created_at.format("%Y-%m-%d %H:%M:%S"),
                        clip.duration_seconds,
                        clip.path.display()
                    );
                }
            }
            Err(e) => eprintln!("{}", e),
        },
        Some("quit") | Some("exit") => return false,
        Some(other) => eprintln!("unknown command: {}", other),
        None => {}
    }
    true
}
