//! Per-user lifecycle timing for diagnostics.
//!
//! Pure bookkeeping: records how long each user's start (Starting → Unlocked)
//! and stop (Stopping → Stopped) episodes take. Finalized episodes land in a
//! bounded ring log; the dump shows both rings plus anything still in flight.

use crate::lifecycle::{LifecycleEventType, UserId, SYSTEM_USER};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How many finalized episodes of each kind are retained.
const EPISODE_LOG_CAPACITY: usize = 10;

/// Timing of one user start episode.
#[derive(Debug, Clone)]
pub struct StartingEpisode {
    pub user_id: UserId,
    pub started_at: Instant,
    pub switched_at: Option<Instant>,
    pub unlocking_at: Option<Instant>,
    pub unlocked_at: Option<Instant>,
}

/// Timing of one user stop episode.
#[derive(Debug, Clone)]
pub struct StoppingEpisode {
    pub user_id: UserId,
    pub stopping_at: Instant,
    pub stopped_at: Option<Instant>,
}

/// Records timing of per-user start/stop episodes.
pub struct UserLifecycleTracker {
    created_at: Instant,
    in_flight_starting: HashMap<UserId, StartingEpisode>,
    in_flight_stopping: HashMap<UserId, StoppingEpisode>,
    finished_starting: VecDeque<StartingEpisode>,
    finished_stopping: VecDeque<StoppingEpisode>,
    /// Elapsed time from tracker creation to the first Unlocked event of a
    /// non-system user.
    first_unlock_duration: Option<Duration>,
}

impl UserLifecycleTracker {
    pub fn new() -> Self {
        Self {
            created_at: Instant::now(),
            in_flight_starting: HashMap::new(),
            in_flight_stopping: HashMap::new(),
            finished_starting: VecDeque::with_capacity(EPISODE_LOG_CAPACITY),
            finished_stopping: VecDeque::with_capacity(EPISODE_LOG_CAPACITY),
            first_unlock_duration: None,
        }
    }

    /// Record a lifecycle event for `user_id` observed at `now`.
    pub fn on_event(&mut self, event: LifecycleEventType, user_id: UserId, now: Instant) {
        match event {
            LifecycleEventType::Starting => {
                if let Some(stale) = self.in_flight_starting.remove(&user_id) {
                    debug!(
                        "user {} started again with a start episode in flight; finalizing stale record",
                        user_id
                    );
                    self.log_starting(stale);
                }
                self.in_flight_starting.insert(
                    user_id,
                    StartingEpisode {
                        user_id,
                        started_at: now,
                        switched_at: None,
                        unlocking_at: None,
                        unlocked_at: None,
                    },
                );
            }
            LifecycleEventType::Switching => {
                match self.in_flight_starting.get_mut(&user_id) {
                    Some(episode) => episode.switched_at = Some(now),
                    None => debug!("switching event for user {} with no start episode", user_id),
                }
            }
            LifecycleEventType::Unlocking => {
                match self.in_flight_starting.get_mut(&user_id) {
                    Some(episode) => episode.unlocking_at = Some(now),
                    None => debug!("unlocking event for user {} with no start episode", user_id),
                }
            }
            LifecycleEventType::Unlocked => {
                if self.first_unlock_duration.is_none() && user_id != SYSTEM_USER {
                    let duration = now.duration_since(self.created_at);
                    info!("time to unlock first user ({}): {:?}", user_id, duration);
                    self.first_unlock_duration = Some(duration);
                }
                match self.in_flight_starting.remove(&user_id) {
                    Some(mut episode) => {
                        episode.unlocked_at = Some(now);
                        self.log_starting(episode);
                    }
                    None => debug!("unlocked event for user {} with no start episode", user_id),
                }
            }
            LifecycleEventType::Stopping => {
                if let Some(stale) = self.in_flight_stopping.remove(&user_id) {
                    debug!(
                        "user {} stopping again with a stop episode in flight; finalizing stale record",
                        user_id
                    );
                    self.log_stopping(stale);
                }
                self.in_flight_stopping.insert(
                    user_id,
                    StoppingEpisode {
                        user_id,
                        stopping_at: now,
                        stopped_at: None,
                    },
                );
            }
            LifecycleEventType::Stopped => {
                match self.in_flight_stopping.remove(&user_id) {
                    Some(mut episode) => {
                        episode.stopped_at = Some(now);
                        self.log_stopping(episode);
                    }
                    None => debug!("stopped event for user {} with no stop episode", user_id),
                }
            }
        }
    }

    /// First-unlock duration, if a non-system user has unlocked yet.
    pub fn first_unlock_duration(&self) -> Option<Duration> {
        self.first_unlock_duration
    }

    fn log_starting(&mut self, episode: StartingEpisode) {
        if self.finished_starting.len() == EPISODE_LOG_CAPACITY {
            self.finished_starting.pop_front();
        }
        self.finished_starting.push_back(episode);
    }

    fn log_stopping(&mut self, episode: StoppingEpisode) {
        if self.finished_stopping.len() == EPISODE_LOG_CAPACITY {
            self.finished_stopping.pop_front();
        }
        self.finished_stopping.push_back(episode);
    }

    /// Append the diagnostic dump to `out`: both ring logs plus any
    /// still-in-flight episodes.
    pub fn dump_into(&self, out: &mut String) {
        let _ = writeln!(out, "User lifecycle metrics:");
        match self.first_unlock_duration {
            Some(d) => {
                let _ = writeln!(out, "  first unlocked user duration: {:?}", d);
            }
            None => {
                let _ = writeln!(out, "  first unlocked user duration: n/a");
            }
        }

        let _ = writeln!(
            out,
            "  finished start episodes ({}):",
            self.finished_starting.len()
        );
        for episode in &self.finished_starting {
            let _ = writeln!(out, "    {}", self.format_starting(episode));
        }
        let _ = writeln!(
            out,
            "  finished stop episodes ({}):",
            self.finished_stopping.len()
        );
        for episode in &self.finished_stopping {
            let _ = writeln!(out, "    {}", self.format_stopping(episode));
        }
        let _ = writeln!(
            out,
            "  in-flight start episodes ({}):",
            self.in_flight_starting.len()
        );
        for episode in self.in_flight_starting.values() {
            let _ = writeln!(out, "    {}", self.format_starting(episode));
        }
        let _ = writeln!(
            out,
            "  in-flight stop episodes ({}):",
            self.in_flight_stopping.len()
        );
        for episode in self.in_flight_stopping.values() {
            let _ = writeln!(out, "    {}", self.format_stopping(episode));
        }
    }

    fn format_starting(&self, episode: &StartingEpisode) -> String {
        let mut line = format!(
            "user {}: starting at {:?}",
            episode.user_id,
            episode.started_at.duration_since(self.created_at)
        );
        if let Some(t) = episode.switched_at {
            let _ = write!(line, ", switching at {:?}", t.duration_since(self.created_at));
        }
        if let Some(t) = episode.unlocking_at {
            let _ = write!(line, ", unlocking at {:?}", t.duration_since(self.created_at));
        }
        if let Some(t) = episode.unlocked_at {
            let _ = write!(
                line,
                ", unlocked at {:?} (took {:?})",
                t.duration_since(self.created_at),
                t.duration_since(episode.started_at)
            );
        }
        line
    }

    fn format_stopping(&self, episode: &StoppingEpisode) -> String {
        let mut line = format!(
            "user {}: stopping at {:?}",
            episode.user_id,
            episode.stopping_at.duration_since(self.created_at)
        );
        if let Some(t) = episode.stopped_at {
            let _ = write!(
                line,
                ", stopped at {:?} (took {:?})",
                t.duration_since(self.created_at),
                t.duration_since(episode.stopping_at)
            );
        }
        line
    }
}

impl Default for UserLifecycleTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> UserLifecycleTracker {
        UserLifecycleTracker::new()
    }

    #[test]
    fn test_full_start_episode_is_finalized_on_unlocked() {
        let mut t = tracker();
        let now = Instant::now();
        t.on_event(LifecycleEventType::Starting, 10, now);
        t.on_event(LifecycleEventType::Switching, 10, now);
        t.on_event(LifecycleEventType::Unlocking, 10, now);
        t.on_event(LifecycleEventType::Unlocked, 10, now);

        assert!(t.in_flight_starting.is_empty());
        assert_eq!(t.finished_starting.len(), 1);
        let episode = &t.finished_starting[0];
        assert_eq!(episode.user_id, 10);
        assert!(episode.switched_at.is_some());
        assert!(episode.unlocking_at.is_some());
        assert!(episode.unlocked_at.is_some());
    }

    #[test]
    fn test_new_starting_finalizes_stale_record_first() {
        let mut t = tracker();
        let now = Instant::now();
        t.on_event(LifecycleEventType::Starting, 10, now);
        // Second Starting without an Unlocked in between.
        t.on_event(LifecycleEventType::Starting, 10, now);

        assert_eq!(t.finished_starting.len(), 1);
        assert!(t.finished_starting[0].unlocked_at.is_none());
        assert!(t.in_flight_starting.contains_key(&10));
    }

    #[test]
    fn test_stop_episode_finalized_on_stopped() {
        let mut t = tracker();
        let now = Instant::now();
        t.on_event(LifecycleEventType::Stopping, 10, now);
        assert_eq!(t.in_flight_stopping.len(), 1);

        t.on_event(LifecycleEventType::Stopped, 10, now);
        assert!(t.in_flight_stopping.is_empty());
        assert_eq!(t.finished_stopping.len(), 1);
        assert!(t.finished_stopping[0].stopped_at.is_some());
    }

    #[test]
    fn test_ring_log_is_bounded() {
        let mut t = tracker();
        let now = Instant::now();
        for user in 0..15 {
            t.on_event(LifecycleEventType::Starting, user, now);
            t.on_event(LifecycleEventType::Unlocked, user, now);
        }

        assert_eq!(t.finished_starting.len(), EPISODE_LOG_CAPACITY);
        // Oldest entries were evicted.
        assert_eq!(t.finished_starting[0].user_id, 5);
        assert_eq!(t.finished_starting[EPISODE_LOG_CAPACITY - 1].user_id, 14);
    }

    #[test]
    fn test_events_without_start_episode_are_ignored() {
        let mut t = tracker();
        let now = Instant::now();
        t.on_event(LifecycleEventType::Unlocking, 10, now);
        t.on_event(LifecycleEventType::Unlocked, 10, now);
        t.on_event(LifecycleEventType::Stopped, 10, now);

        assert!(t.in_flight_starting.is_empty());
        assert!(t.finished_starting.is_empty());
        assert!(t.finished_stopping.is_empty());
    }

    #[test]
    fn test_first_unlock_duration_skips_system_user() {
        let mut t = tracker();
        let now = Instant::now();
        t.on_event(LifecycleEventType::Starting, SYSTEM_USER, now);
        t.on_event(LifecycleEventType::Unlocked, SYSTEM_USER, now);
        assert!(t.first_unlock_duration().is_none());

        t.on_event(LifecycleEventType::Starting, 10, now);
        t.on_event(LifecycleEventType::Unlocked, 10, now);
        assert!(t.first_unlock_duration().is_some());
    }

    #[test]
    fn test_first_unlock_duration_is_not_overwritten() {
        let mut t = tracker();
        let start = Instant::now();
        t.on_event(LifecycleEventType::Starting, 10, start);
        t.on_event(LifecycleEventType::Unlocked, 10, start);
        let first = t.first_unlock_duration().unwrap();

        t.on_event(LifecycleEventType::Starting, 11, start);
        t.on_event(
            LifecycleEventType::Unlocked,
            11,
            start + Duration::from_secs(5),
        );
        assert_eq!(t.first_unlock_duration().unwrap(), first);
    }

    #[test]
    fn test_dump_lists_in_flight_and_finished() {
        let mut t = tracker();
        let now = Instant::now();
        t.on_event(LifecycleEventType::Starting, 10, now);
        t.on_event(LifecycleEventType::Unlocked, 10, now);
        t.on_event(LifecycleEventType::Starting, 11, now);
        t.on_event(LifecycleEventType::Stopping, 12, now);

        let mut out = String::new();
        t.dump_into(&mut out);
        assert!(out.contains("finished start episodes (1)"));
        assert!(out.contains("in-flight start episodes (1)"));
        assert!(out.contains("in-flight stop episodes (1)"));
        assert!(out.contains("user 10"));
    }
}
