//! zone_witnessd - restricted-zone dwell witness daemon
//!
//! This daemon:
//! 1. Loads configuration (defaults, config file, environment)
//! 2. Opens the evidence store and the episode database
//! 3. Pulls frames from the configured source into the pipeline
//! 4. Captures evidence once per violation episode and persists its metadata
//! 5. Keeps the evidence roots under the byte budget
//! 6. On Ctrl-C, retries pending episodes and runs a final quota pass

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use zone_witness::config::ZoneWitnessConfig;
use zone_witness::detect::{NoPlateRecognizer, ScriptedObjectDetector, StaticZoneDetector};
use zone_witness::{
    BoundingBox, EpisodeEvent, EvidenceStore, FrameOutcome, FrameSource, Pipeline,
    SqliteEpisodeStore, ZoneDetections,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "ZONE_WITNESS_CONFIG")]
    config: Option<String>,
    /// Stop after this many frames.
    #[arg(long)]
    max_frames: Option<u64>,
    /// Process frames as fast as possible instead of at the source frame rate.
    #[arg(long, default_value_t = false)]
    no_pacing: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("ZONE_WITNESS_CONFIG", path);
    }
    let mut cfg = ZoneWitnessConfig::load()?;
    if args.max_frames.is_some() {
        cfg.source.max_frames = args.max_frames;
    }

    let evidence = Arc::new(EvidenceStore::open(cfg.evidence_config())?);
    let persistence = SqliteEpisodeStore::open(&cfg.db_path)?;

    let mut source = FrameSource::new(cfg.source_config())?;
    source.connect()?;

    // No model backends are linked into this build: the demo scene is a box
    // junction in the middle of the frame and one car that keeps stopping on it.
    let (w, h) = (cfg.source.width as i32, cfg.source.height as i32);
    let zone = BoundingBox::new(w / 4, h / 3, w / 2, h / 3);
    let fps = cfg.source.target_fps as usize;
    let objects = ScriptedObjectDetector::stopping_vehicle(zone, fps, fps * 5, fps * 8).repeating();
    let zones = StaticZoneDetector::new(ZoneDetections {
        box_junctions: vec![zone],
        crossings: Vec::new(),
    });
    log::warn!("using scripted demo detectors (no model backend configured)");

    let mut pipeline = Pipeline::new(
        cfg.pipeline_config()?,
        Box::new(objects),
        Box::new(zones),
        Box::new(NoPlateRecognizer),
        Arc::clone(&evidence),
        Box::new(persistence),
    )?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })
        .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
    }

    log::info!("zone_witnessd running. writing to {}", cfg.db_path);
    log::info!(
        "stream_id={}, min_stop={}s, timeout_multiplier={}",
        cfg.stream_id,
        cfg.dwell.min_stop_time_secs,
        cfg.dwell.timeout_multiplier
    );
    log::info!(
        "evidence: images={} clips={} budget={} bytes",
        evidence.images_dir().display(),
        evidence.clips_dir().display(),
        evidence.max_storage_bytes()
    );

    let frame_interval = Duration::from_secs_f64(1.0 / cfg.source.target_fps as f64);
    let mut last_health_log = Instant::now();

    while running.load(Ordering::SeqCst) {
        let started = Instant::now();
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!("source exhausted");
                break;
            }
            Err(e) => {
                log::warn!("frame read failed: {}", e);
                continue;
            }
        };

        let report = pipeline.process_frame(frame);
        if let FrameOutcome::Skipped(reason) = &report.outcome {
            log::debug!("frame skipped: {}", reason);
        }
        for event in &report.events {
            match event {
                EpisodeEvent::Opened(opened) => log::info!(
                    "episode {}: {} {} dwell={:.1}s image={} clip={}",
                    opened.persistence_id,
                    opened.zone_kind,
                    opened.key,
                    opened.dwell.as_secs_f64(),
                    opened.evidence.image.is_some(),
                    opened.evidence.clip.is_some()
                ),
                EpisodeEvent::PersistenceFailed(failure) if failure.escalated => log::error!(
                    "episode for {} not persisted after {} attempts",
                    failure.key,
                    failure.attempts
                ),
                EpisodeEvent::PersistenceFailed(_) => {}
            }
        }
        if let Some(quota) = &report.quota {
            log::debug!(
                "evidence quota: {} / {} bytes, {} deleted",
                quota.total_bytes_after,
                quota.budget_bytes,
                quota.deleted.len()
            );
        }

        if last_health_log.elapsed() >= Duration::from_secs(5) {
            let source_stats = source.stats();
            let stats = pipeline.stats();
            log::info!(
                "source health={} frames={} url={} | episodes={} pending={} dwelling={} skipped={} detection_failures={}",
                source.is_healthy(),
                source_stats.frames_captured,
                source_stats.url,
                stats.episodes_opened,
                stats.episodes_pending,
                stats.active_dwell_records,
                stats.frames_skipped,
                stats.detection_failures
            );
            log::debug!(
                "evidence buffer: {} frames, ~{} KB",
                pipeline.buffer().len(),
                pipeline.buffer().memory_bytes() / 1024
            );
            last_health_log = Instant::now();
        }

        if !args.no_pacing {
            let elapsed = started.elapsed();
            if elapsed < frame_interval {
                std::thread::sleep(frame_interval - elapsed);
            }
        }
    }

    log::info!("shutting down...");
    let quota = pipeline.shutdown()?;
    if quota.over_budget {
        log::warn!(
            "evidence store over budget at shutdown: {} > {} bytes",
            quota.total_bytes_after,
            quota.budget_bytes
        );
    }
    Ok(())
}
