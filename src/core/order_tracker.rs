//! Time-ordering checks for delivered messages.
//!
//! Two problems are detected, both as soft `Warn` alerts:
//! - **Regression**: a message older than the one before it (any topic).
//!   Reported immediately.
//! - **Drift**: a message whose receive time is far from the player clock.
//!   Reported after a grace period, because a seek usually follows and
//!   explains it. One alert per drift episode.
//!
//! A change of `last_seek_time` resets all history; messages in the same
//! frame as the seek are backfill and skip drift checks.

use log::{trace, warn};
use std::time::{Duration, Instant};

use crate::entities::{Alert, PlayerState, Time};

/// Offending messages kept per drift episode (the total count is tracked separately)
const MAX_DRIFT_SAMPLES: usize = 8;

/// Armed drift timer with the messages that triggered it.
#[derive(Debug)]
struct DriftEpisode {
    due: Instant,
    current_time: Time,
    samples: Vec<(String, Time)>,
    count: usize,
}

impl DriftEpisode {
    fn to_alert(&self, threshold: f64) -> Alert {
        let listed = self
            .samples
            .iter()
            .map(|(topic, time)| format!("{} at {}", topic, time))
            .collect::<Vec<_>>()
            .join(", ");
        let more = self.count.saturating_sub(self.samples.len());
        let suffix = if more > 0 { format!(" (+{} more)", more) } else { String::new() };
        Alert::warn(format!(
            "Received {} message(s) more than {}s away from current time {}: {}{}",
            self.count, threshold, self.current_time, listed, suffix
        ))
        .with_tip("Message receive times should stay close to the player's current time.")
    }
}

/// Tracks message ordering across frames of one player attachment.
#[derive(Debug)]
pub struct OrderTracker {
    enabled: bool,
    drift_threshold_secs: f64,
    grace: Duration,
    last_message_time: Option<Time>,
    last_message_topic: Option<String>,
    last_current_time: Option<Time>,
    last_seek_token: Option<u64>,
    drift: Option<DriftEpisode>,
    /// Drift alerts fired by `poll()` and not yet returned from `update()`
    fired: Vec<Alert>,
}

impl Default for OrderTracker {
    fn default() -> Self {
        Self::new(true, 1.0, Duration::from_secs(1))
    }
}

impl OrderTracker {
    pub fn new(enabled: bool, drift_threshold_secs: f64, grace: Duration) -> Self {
        Self {
            enabled,
            drift_threshold_secs,
            grace,
            last_message_time: None,
            last_message_topic: None,
            last_current_time: None,
            last_seek_token: None,
            drift: None,
            fired: Vec::new(),
        }
    }

    /// Validate the messages of a new frame.
    pub fn update(&mut self, state: &PlayerState) -> Vec<Alert> {
        self.update_at(state, Instant::now())
    }

    pub fn update_at(&mut self, state: &PlayerState, now: Instant) -> Vec<Alert> {
        // A timer that expired before this frame arrived has already fired.
        self.poll(now);
        let mut alerts = std::mem::take(&mut self.fired);

        if !self.enabled {
            return alerts;
        }
        let Some(data) = state.active_data.as_ref() else {
            return alerts;
        };

        let did_seek = self.last_seek_token != Some(data.last_seek_time);
        if did_seek {
            self.reset_history();
            self.last_seek_token = Some(data.last_seek_time);
        }

        for message in &data.messages {
            let receive_time = message.receive_time;

            if !did_seek {
                let drift = receive_time.secs_since(data.current_time).abs();
                if drift > self.drift_threshold_secs {
                    self.record_drift(&message.topic, receive_time, data.current_time, now);
                }
            }

            if let (Some(last_time), Some(last_topic)) = (self.last_message_time, self.last_message_topic.as_deref()) {
                if receive_time < last_time {
                    trace!("Order regression on {} ({} < {})", message.topic, receive_time, last_time);
                    alerts.push(Alert::warn(format!(
                        "Processed a message on {} at {} which is earlier than last processed message on {} at {}.",
                        message.topic, receive_time, last_topic, last_time
                    )));
                }
            }

            self.last_message_time = Some(receive_time);
            self.last_message_topic = Some(message.topic.clone());
        }

        self.last_current_time = Some(data.current_time);
        alerts
    }

    /// Fire the drift timer if it is due. Returns true when an alert fired.
    ///
    /// The alert is logged now and returned by the next `update()`.
    pub fn poll(&mut self, now: Instant) -> bool {
        let due = matches!(&self.drift, Some(episode) if now >= episode.due);
        if !due {
            return false;
        }
        let Some(episode) = self.drift.take() else {
            return false;
        };
        let alert = episode.to_alert(self.drift_threshold_secs);
        warn!("{}", alert.message);
        self.fired.push(alert);
        true
    }

    pub fn has_pending_drift(&self) -> bool {
        self.drift.is_some()
    }

    pub fn last_current_time(&self) -> Option<Time> {
        self.last_current_time
    }

    fn record_drift(&mut self, topic: &str, receive_time: Time, current_time: Time, now: Instant) {
        let grace = self.grace;
        let episode = self.drift.get_or_insert_with(|| {
            trace!("Drift detected on {}, waiting {}ms for a seek", topic, grace.as_millis());
            DriftEpisode {
                due: now + grace,
                current_time,
                samples: Vec::new(),
                count: 0,
            }
        });
        episode.count += 1;
        if episode.samples.len() < MAX_DRIFT_SAMPLES {
            episode.samples.push((topic.to_string(), receive_time));
        }
    }

    fn reset_history(&mut self) {
        if self.drift.take().is_some() {
            trace!("Seek cancelled pending drift alert");
        }
        self.last_message_time = None;
        self.last_message_topic = None;
        self.last_current_time = None;
    }
}
