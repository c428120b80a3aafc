use msgpipe::cli::Args;
use msgpipe::config::PipelineConfig;
use msgpipe::core::event_bus::downcast_event;
use msgpipe::core::pipeline::Pipeline;
use msgpipe::core::pipeline_events::{FramePromiseFailedEvent, StoreResetEvent, SubscriptionsPushedEvent};
use msgpipe::entities::{PlayerState, PreloadType, SubscribePayload, Time};
use msgpipe::synthetic::{SyntheticConfig, SyntheticPlayer};

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{Sender, unbounded};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const DEFAULT_TOPICS: &[&str] = &["/pose", "/imu"];

/// Host loop period for `tick()` and bus polling
const TICK_INTERVAL: Duration = Duration::from_millis(5);

fn init_logging(args: &Args) -> anyhow::Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt.clone().unwrap_or_else(|| PathBuf::from("msgpipe.log"));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

/// Resolves the slow panel's frame promises after a fixed delay, in order.
fn spawn_renderer(delay: Duration) -> anyhow::Result<Sender<Sender<anyhow::Result<()>>>> {
    let (tx, rx) = unbounded::<Sender<anyhow::Result<()>>>();
    thread::Builder::new()
        .name("msgpipe-renderer".into())
        .spawn(move || {
            for done in rx.iter() {
                thread::sleep(delay);
                let _ = done.send(Ok(()));
            }
        })
        .context("Failed to spawn renderer thread")?;
    Ok(tx)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    info!("msgpipe starting...");
    debug!("Command-line args: {:?}", args);

    let mut config = PipelineConfig::resolve(args.config.clone())?;
    if let Some(fps) = args.fps {
        config.frame_rate = fps;
    }
    config.validate()?;
    info!("Pipeline config: {:?}", config);

    let pipeline = Pipeline::new(config)?;

    let topics: Vec<String> = if args.topics.is_empty() {
        DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect()
    } else {
        args.topics.clone()
    };

    // Raw panel: every field of every topic, counts messages
    let raw = pipeline.panel("raw");
    raw.set_subscriptions(topics.iter().map(SubscribePayload::topic).collect());
    let messages_seen = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&messages_seen);
    raw.watch(
        |s: &PlayerState| s.active_data.as_ref().map(|d| (d.current_time, d.messages.len())),
        move |frame| {
            if let Some((_, count)) = frame {
                seen.fetch_add(*count, Ordering::Relaxed);
            }
        },
    )?;

    let alerts_seen = Arc::new(AtomicUsize::new(0));
    let alerts = Arc::clone(&alerts_seen);
    raw.watch(
        |s: &PlayerState| s.alerts.clone(),
        move |current| {
            for alert in current {
                warn!("Alert: {}", alert.message);
            }
            alerts.fetch_add(current.len(), Ordering::Relaxed);
        },
    )?;

    // Plot panel: one field, full preload, optionally slow to render
    let plot = Arc::new(pipeline.panel("plot"));
    plot.register_subscription(SubscribePayload::with_fields(topics[0].clone(), ["position"]).preload(PreloadType::Full));
    if args.slow_panel_ms > 0 {
        let renderer = spawn_renderer(Duration::from_millis(args.slow_panel_ms))?;
        let weak = Arc::downgrade(&plot);
        plot.watch(
            |s: &PlayerState| s.current_time(),
            move |_| {
                let Some(panel) = weak.upgrade() else {
                    return;
                };
                let (done_tx, done_rx) = crossbeam_channel::bounded(1);
                panel.register_frame_promise("render", done_rx);
                let _ = renderer.send(done_tx);
            },
        )?;
    }

    let source = SyntheticConfig {
        rate_hz: args.source_rate,
        reorder_every: args.reorder_every,
        topics: topics.clone(),
        ..Default::default()
    };
    source.validate().context("Invalid --source-rate")?;
    let start_time = source.start;
    pipeline.attach(Box::new(SyntheticPlayer::new(source)));

    let started = Instant::now();
    let run_for = Duration::from_secs_f64(args.duration.max(0.0));
    let mut last_seek = Instant::now();
    let mut failures = 0usize;
    let mut pushes = 0usize;
    let mut resets = 0usize;

    while started.elapsed() < run_for {
        pipeline.tick();

        for event in pipeline.event_bus().poll() {
            if let Some(e) = downcast_event::<FramePromiseFailedEvent>(&event) {
                failures += 1;
                warn!("Frame promise failed ({}): {}", e.names.join(", "), e.message);
            } else if downcast_event::<SubscriptionsPushedEvent>(&event).is_some() {
                pushes += 1;
            } else if downcast_event::<StoreResetEvent>(&event).is_some() {
                resets += 1;
            }
        }

        if let Some(every) = args.seek_every {
            if every > 0.0 && last_seek.elapsed() >= Duration::from_secs_f64(every) {
                info!("Seeking to {}", start_time);
                pipeline.seek_playback(start_time)?;
                last_seek = Instant::now();
            }
        }

        thread::sleep(TICK_INTERVAL);
    }

    let frames = pipeline.store().version();
    let final_time = pipeline.current_state().current_time().unwrap_or(Time::ZERO);
    pipeline.detach();

    println!("Ran for {:.2}s", started.elapsed().as_secs_f64());
    println!("Frames committed:     {}", frames);
    println!("Messages delivered:   {}", messages_seen.load(Ordering::Relaxed));
    println!("Alerts:               {}", alerts_seen.load(Ordering::Relaxed));
    println!("Promise failures:     {}", failures);
    println!("Subscription pushes:  {}", pushes);
    println!("Store resets:         {}", resets);
    println!("Final player time:    {}", final_time);
    Ok(())
}
