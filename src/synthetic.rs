//! Synthetic player: a clock-driven source for demos and tests.
//!
//! Runs its own thread. Every `1 / rate_hz` seconds it advances the playhead
//! (when playing) and emits one message per subscribed topic, stamped with the
//! current time. It honours the frame handshake: the next state is emitted
//! only after the previous ack resolved.
//!
//! Control calls from the pipeline arrive over a command channel and are
//! applied between frames.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, select, unbounded};
use indexmap::IndexSet;
use log::{debug, error, trace};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use uuid::Uuid;

use crate::core::player::{Player, PlayerListener};
use crate::entities::{
    ActiveData, GlobalVariables, MessageEvent, PlayerCapability, PlayerPresence, PlayerState, Progress, Range,
    SubscribePayload, Time, Topic,
};

const SCHEMA_NAME: &str = "msgpipe/Sample";

/// Source parameters.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Frames emitted per second of wall time
    pub rate_hz: f64,
    pub start: Time,
    /// Recording length; playback wraps to `start` (as a seek) at the end
    pub duration_secs: f64,
    /// Every Nth frame carries one message stamped half a second in the past
    pub reorder_every: Option<u64>,
    pub topics: Vec<String>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            rate_hz: 30.0,
            start: Time::new(100, 0),
            duration_secs: 60.0,
            reorder_every: None,
            topics: vec!["/pose".into(), "/imu".into(), "/diagnostics".into()],
        }
    }
}

impl SyntheticConfig {
    /// Reject a rate the playback clock cannot run at.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.rate_hz.is_finite() || self.rate_hz <= 0.0 {
            anyhow::bail!("Source rate must be a positive number of Hz, got {}", self.rate_hz);
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Command {
    Subscriptions(Vec<Arc<SubscribePayload>>),
    Globals(Arc<GlobalVariables>),
    Play,
    Pause,
    Seek(Time),
    Speed(f64),
}

/// Playhead and everything that goes into the next `PlayerState`.
#[derive(Debug)]
struct Playhead {
    id: String,
    config: SyntheticConfig,
    current: Time,
    end: Time,
    playing: bool,
    speed: f64,
    seek_token: u64,
    /// Set by a seek; the next frame carries backfill at the new time
    seeked: bool,
    subscribed: IndexSet<String>,
    frame: u64,
    bytes_received: u64,
    globals: Option<Arc<GlobalVariables>>,
}

impl Playhead {
    fn new(id: String, config: SyntheticConfig) -> Self {
        // Negative or non-finite lengths collapse to an empty recording
        let end = config.start.add_secs(config.duration_secs).max(config.start);
        Self {
            id,
            current: config.start,
            end,
            playing: true,
            speed: 1.0,
            seek_token: 1,
            seeked: false,
            subscribed: IndexSet::new(),
            frame: 0,
            bytes_received: 0,
            globals: None,
            config,
        }
    }

    fn apply(&mut self, command: Command) {
        trace!("Synthetic player command: {:?}", command);
        match command {
            Command::Subscriptions(subscriptions) => {
                self.subscribed = subscriptions.iter().map(|s| s.topic.clone()).collect();
            }
            Command::Globals(globals) => self.globals = Some(globals),
            Command::Play => self.playing = true,
            Command::Pause => self.playing = false,
            Command::Seek(time) => self.seek(time),
            Command::Speed(speed) => self.speed = speed.max(0.0),
        }
    }

    fn seek(&mut self, time: Time) {
        self.current = time.clamp(self.config.start, self.end);
        self.seek_token += 1;
        self.seeked = true;
    }

    fn advance(&mut self) {
        if !self.playing {
            return;
        }
        let step = self.speed / self.config.rate_hz;
        let next = self.current.add_secs(step);
        if next > self.end {
            debug!("Synthetic player reached end, wrapping to {}", self.config.start);
            self.seek(self.config.start);
        } else {
            self.current = next;
        }
    }

    fn payload(&self, topic: &str) -> Bytes {
        let robot = self
            .globals
            .as_ref()
            .and_then(|g| g.get("robot"))
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let value = serde_json::json!({
            "topic": topic,
            "seq": self.frame,
            "stamp": self.current.as_secs_f64(),
            "robot": robot,
        });
        Bytes::from(value.to_string())
    }

    fn next_state(&mut self) -> PlayerState {
        let emit = self.playing || self.seeked;
        self.seeked = false;

        let mut messages: Vec<MessageEvent> = Vec::new();
        if emit {
            for topic in &self.subscribed {
                let mut message = MessageEvent::new(topic.clone(), self.current, self.payload(topic));
                message.schema_name = SCHEMA_NAME.to_string();
                messages.push(message);
            }
            if let Some(every) = self.config.reorder_every {
                if every > 0 && self.frame > 0 && self.frame % every == 0 && !messages.is_empty() {
                    let stale = Time::from_secs_f64(self.current.as_secs_f64() - 0.5);
                    let mut message = MessageEvent::new(messages[0].topic.clone(), stale, self.payload(&messages[0].topic));
                    message.schema_name = SCHEMA_NAME.to_string();
                    messages.push(message);
                }
            }
        }
        self.bytes_received += messages.iter().map(|m| m.size_in_bytes as u64).sum::<u64>();
        self.frame += 1;

        let span = self.end.secs_since(self.config.start).max(f64::EPSILON);
        let loaded = (self.current.secs_since(self.config.start) / span).clamp(0.0, 1.0);

        PlayerState {
            player_id: self.id.clone(),
            name: Some("synthetic".to_string()),
            presence: PlayerPresence::Present,
            capabilities: vec![PlayerCapability::PlaybackControl, PlayerCapability::SetSpeed],
            profile: None,
            progress: Progress {
                fully_loaded_fraction_ranges: vec![Range { start: 0.0, end: loaded }],
                ..Default::default()
            },
            active_data: Some(ActiveData {
                messages,
                current_time: self.current,
                start_time: self.config.start,
                end_time: self.end,
                last_seek_time: self.seek_token,
                is_playing: self.playing,
                speed: self.speed,
                topics: self
                    .config
                    .topics
                    .iter()
                    .map(|name| Topic {
                        name: name.clone(),
                        schema_name: Some(SCHEMA_NAME.to_string()),
                    })
                    .collect(),
                total_bytes_received: self.bytes_received,
            }),
            alerts: Vec::new(),
        }
    }
}

fn run(mut playhead: Playhead, listener: PlayerListener, commands: Receiver<Command>, stop: Receiver<()>) {
    let Ok(period) = Duration::try_from_secs_f64(1.0 / playhead.config.rate_hz) else {
        error!("Synthetic player {} has an invalid rate of {} Hz, not starting", playhead.id, playhead.config.rate_hz);
        return;
    };
    loop {
        while let Ok(command) = commands.try_recv() {
            playhead.apply(command);
        }
        playhead.advance();

        let ack = listener(playhead.next_state());
        select! {
            recv(ack) -> result => {
                if let Ok(Err(err)) = result {
                    debug!("Frame ack error: {}", err);
                }
            }
            recv(stop) -> _ => break,
        }

        select! {
            recv(stop) -> _ => break,
            default(period) => {}
        }
    }
    debug!("Synthetic player {} stopped after {} frame(s)", playhead.id, playhead.frame);
}

/// Player that fabricates messages on a fixed clock.
pub struct SyntheticPlayer {
    id: Uuid,
    config: SyntheticConfig,
    commands: Sender<Command>,
    /// Consumed by the thread once the listener arrives
    pending: Option<(Playhead, Receiver<Command>)>,
    stop: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SyntheticPlayer {
    pub fn new(config: SyntheticConfig) -> Self {
        let id = Uuid::new_v4();
        let (commands, command_rx) = unbounded();
        let playhead = Playhead::new(id.to_string(), config.clone());
        Self {
            id,
            config,
            commands,
            pending: Some((playhead, command_rx)),
            stop: None,
            handle: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SyntheticConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn send(&self, command: Command) {
        // Fails only after the thread exited; nothing left to control then.
        let _ = self.commands.send(command);
    }
}

impl Player for SyntheticPlayer {
    fn set_listener(&mut self, listener: PlayerListener) {
        let Some((playhead, command_rx)) = self.pending.take() else {
            debug!("Synthetic player {} already has a listener", self.id);
            return;
        };
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let spawned = thread::Builder::new()
            .name(format!("msgpipe-synthetic-{}", &self.id.to_string()[..8]))
            .spawn(move || run(playhead, listener, command_rx, stop_rx));
        match spawned {
            Ok(handle) => {
                debug!("Synthetic player {} started at {} Hz", self.id, self.config.rate_hz);
                self.stop = Some(stop_tx);
                self.handle = Some(handle);
            }
            Err(err) => log::error!("Failed to spawn synthetic player thread: {}", err),
        }
    }

    fn set_subscriptions(&mut self, subscriptions: Vec<Arc<SubscribePayload>>) {
        self.send(Command::Subscriptions(subscriptions));
    }

    fn set_global_variables(&mut self, variables: Arc<GlobalVariables>) {
        self.send(Command::Globals(variables));
    }

    fn start_playback(&mut self) {
        self.send(Command::Play);
    }

    fn pause_playback(&mut self) {
        self.send(Command::Pause);
    }

    fn seek_playback(&mut self, time: Time) {
        self.send(Command::Seek(time));
    }

    fn set_playback_speed(&mut self, speed: f64) {
        self.send(Command::Speed(speed));
    }

    fn close(&mut self) {
        self.stop = None;
        let Some(handle) = self.handle.take() else {
            return;
        };
        // Closed from inside our own listener call: the loop exits on its own.
        if handle.thread().id() == thread::current().id() {
            return;
        }
        let _ = handle.join();
    }
}

impl Drop for SyntheticPlayer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::core::pipeline::Pipeline;
    use crate::core::player::resolved_ack;
    use std::sync::Mutex;
    use std::time::Instant;

    fn fast() -> SyntheticConfig {
        SyntheticConfig {
            rate_hz: 200.0,
            ..Default::default()
        }
    }

    fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_emits_only_subscribed_topics() {
        let states = Arc::new(Mutex::new(Vec::<PlayerState>::new()));
        let s = Arc::clone(&states);
        let mut player = SyntheticPlayer::new(fast());
        player.set_subscriptions(vec![Arc::new(SubscribePayload::topic("/imu"))]);
        player.set_listener(Arc::new(move |state: PlayerState| {
            s.lock().unwrap().push(state);
            resolved_ack()
        }));

        assert!(wait_for(Duration::from_secs(1), || states.lock().unwrap().len() >= 3));
        player.close();
        assert!(!player.is_running());

        let states = states.lock().unwrap();
        let last = states.last().unwrap();
        assert!(!last.messages().is_empty());
        assert!(last.messages().iter().all(|m| m.topic == "/imu"));
        assert!(states.windows(2).all(|w| w[0].current_time() <= w[1].current_time()));
    }

    #[test]
    fn test_rate_validation() {
        assert!(fast().validate().is_ok());
        for rate_hz in [0.0, -30.0, f64::NAN, f64::INFINITY] {
            assert!(SyntheticConfig { rate_hz, ..fast() }.validate().is_err());
        }
    }

    #[test]
    fn test_negative_duration_seeks_to_start() {
        let mut playhead = Playhead::new(
            "p".into(),
            SyntheticConfig {
                duration_secs: -5.0,
                ..fast()
            },
        );
        playhead.seek(Time::new(130, 0));
        assert_eq!(playhead.current, Time::new(100, 0));
        playhead.advance();
        assert_eq!(playhead.current, Time::new(100, 0));
    }

    #[test]
    fn test_invalid_rate_never_emits() {
        let calls = Arc::new(Mutex::new(0));
        let c = Arc::clone(&calls);
        let mut player = SyntheticPlayer::new(SyntheticConfig { rate_hz: 0.0, ..fast() });
        player.set_listener(Arc::new(move |_state: PlayerState| {
            *c.lock().unwrap() += 1;
            resolved_ack()
        }));
        assert!(wait_for(Duration::from_secs(1), || !player.is_running()));
        assert_eq!(*calls.lock().unwrap(), 0);
        player.close();
    }

    #[test]
    fn test_waits_for_ack() {
        let calls = Arc::new(Mutex::new(0));
        let c = Arc::clone(&calls);
        let (_hold_tx, hold_rx) = crossbeam_channel::bounded(1);
        let mut player = SyntheticPlayer::new(fast());
        player.set_listener(Arc::new(move |_state: PlayerState| {
            *c.lock().unwrap() += 1;
            hold_rx.clone()
        }));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(*calls.lock().unwrap(), 1);
        player.close();
    }

    #[test]
    fn test_seek_bumps_token_through_pipeline() {
        let pipeline = Pipeline::new(PipelineConfig {
            frame_rate: 200.0,
            ..Default::default()
        })
        .unwrap();
        let panel = pipeline.panel("raw");
        panel.register_subscription(SubscribePayload::topic("/pose"));
        pipeline.attach(Box::new(SyntheticPlayer::new(fast())));

        assert!(wait_for(Duration::from_secs(2), || !pipeline.current_state().messages().is_empty()));
        let token = |p: &Pipeline| p.current_state().active_data.as_ref().map(|d| d.last_seek_time);
        let before = token(&pipeline);

        pipeline.seek_playback(Time::new(130, 0)).unwrap();
        assert!(wait_for(Duration::from_secs(2), || token(&pipeline) != before));
        let time = pipeline.current_state().current_time().unwrap();
        assert!(time >= Time::new(130, 0));
        assert!(pipeline.current_state().alerts.is_empty());

        pipeline.detach();
        assert!(!pipeline.has_player());
    }

    #[test]
    fn test_reordered_message_raises_alert() {
        let pipeline = Pipeline::new(PipelineConfig {
            frame_rate: 200.0,
            ..Default::default()
        })
        .unwrap();
        let panel = pipeline.panel("raw");
        panel.register_subscription(SubscribePayload::topic("/pose"));
        let alerts = Arc::new(Mutex::new(0usize));
        let a = Arc::clone(&alerts);
        panel
            .watch(|s: &PlayerState| s.alerts.len(), move |n| *a.lock().unwrap() += *n)
            .unwrap();

        pipeline.attach(Box::new(SyntheticPlayer::new(SyntheticConfig {
            reorder_every: Some(3),
            ..fast()
        })));
        assert!(wait_for(Duration::from_secs(2), || *alerts.lock().unwrap() > 0));
    }
}
