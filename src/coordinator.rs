//! Single-threaded cooperative task coordinator (spec §4.1, §5, C13).
//!
//! Unlike the teacher's `tasks.rs` (one OS thread per mesh duty, via
//! `std::thread::spawn`), this gateway runs everything from one `tick()`
//! call: an ISR (or, on the host, a test) only ever sets a boolean "this
//! timer is due" flag, and all actual work happens synchronously inside
//! `tick()`. That keeps the Modbus bus, the upload queue and OTA state
//! machine free of cross-thread synchronization — there is exactly one
//! place in the whole firmware that mutates gateway state.

use std::time::Duration;

/// One scheduled duty. Dispatch order within a single `tick()` is fixed
/// (spec §5): poll, then commands, then upload, then config-sync, then
/// firmware-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerToken {
    Poll,
    CommandPoll,
    Upload,
    ConfigSync,
    FirmwareCheck,
}

const DISPATCH_ORDER: [TimerToken; 5] = [
    TimerToken::Poll,
    TimerToken::CommandPoll,
    TimerToken::Upload,
    TimerToken::ConfigSync,
    TimerToken::FirmwareCheck,
];

/// Everything the coordinator needs to drive one pass over the gateway's
/// duties. Implemented once for real hardware (wiring each method to
/// `acquisition`/`command`/`upload`/`configsync`/`ota`) and once by a
/// scripted fake in tests.
pub trait GatewayHandlers {
    fn run_poll(&mut self);
    fn run_command_poll(&mut self);
    fn run_upload(&mut self);
    fn run_config_sync(&mut self);
    fn run_firmware_check(&mut self);

    /// While a firmware activation is in flight, uploads are skipped this
    /// tick rather than contending with OTA for the transport (spec §5
    /// "firmware activation wins over upload overlap").
    fn firmware_activation_in_progress(&self) -> bool;
}

/// Watchdog bound on a single `tick()` call (spec §5 "<2s").
pub const HANDLER_TIME_BOUND: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
struct Schedule {
    period_ms: u64,
    last_fired_ms: u64,
}

impl Schedule {
    fn new(period_ms: u64) -> Self {
        Self { period_ms, last_fired_ms: 0 }
    }

    fn due(&self, now_ms: u64) -> bool {
        self.period_ms > 0 && now_ms.saturating_sub(self.last_fired_ms) >= self.period_ms
    }

    fn fire(&mut self, now_ms: u64) {
        self.last_fired_ms = now_ms;
    }
}

/// Drives [`GatewayHandlers`] from period-based timer tokens. `tick()` is
/// intentionally not reentrant: a second call while one is in flight is a
/// programming error on a single-threaded executor and is rejected rather
/// than silently interleaved.
pub struct Coordinator {
    schedules: std::collections::HashMap<TimerToken, Schedule>,
    in_tick: bool,
    pub last_tick_elapsed: Option<Duration>,
    pub overrun_count: u64,
}

impl Coordinator {
    pub fn new(
        poll_period_secs: u32,
        command_poll_period_secs: u32,
        upload_period_secs: u32,
        config_sync_period_secs: u32,
        firmware_check_period_secs: u32,
    ) -> Self {
        let mut schedules = std::collections::HashMap::new();
        schedules.insert(TimerToken::Poll, Schedule::new(poll_period_secs as u64 * 1000));
        schedules.insert(TimerToken::CommandPoll, Schedule::new(command_poll_period_secs as u64 * 1000));
        schedules.insert(TimerToken::Upload, Schedule::new(upload_period_secs as u64 * 1000));
        schedules.insert(TimerToken::ConfigSync, Schedule::new(config_sync_period_secs as u64 * 1000));
        schedules.insert(TimerToken::FirmwareCheck, Schedule::new(firmware_check_period_secs as u64 * 1000));
        Self { schedules, in_tick: false, last_tick_elapsed: None, overrun_count: 0 }
    }

    /// Reconfigure a token's period at runtime, e.g. after config-sync
    /// applies a new document (spec §4.8).
    pub fn set_period(&mut self, token: TimerToken, period_secs: u32) {
        if let Some(schedule) = self.schedules.get_mut(&token) {
            schedule.period_ms = period_secs as u64 * 1000;
        }
    }

    /// Returns `false` (and does nothing) if a `tick()` is already in
    /// flight; callers decide how to account for a rejected tick (on
    /// hardware this can't happen since dispatch is synchronous with the
    /// single executor thread, but the guard makes the invariant explicit
    /// and testable).
    pub fn tick(&mut self, now_ms: u64, handlers: &mut dyn GatewayHandlers, elapsed: impl FnOnce() -> Duration) -> bool {
        if self.in_tick {
            return false;
        }
        self.in_tick = true;

        for &token in DISPATCH_ORDER.iter() {
            let due = self.schedules.get(&token).map(|s| s.due(now_ms)).unwrap_or(false);
            if !due {
                continue;
            }
            if token == TimerToken::Upload && handlers.firmware_activation_in_progress() {
                continue;
            }
            match token {
                TimerToken::Poll => handlers.run_poll(),
                TimerToken::CommandPoll => handlers.run_command_poll(),
                TimerToken::Upload => handlers.run_upload(),
                TimerToken::ConfigSync => handlers.run_config_sync(),
                TimerToken::FirmwareCheck => handlers.run_firmware_check(),
            }
            if let Some(schedule) = self.schedules.get_mut(&token) {
                schedule.fire(now_ms);
            }
        }

        let elapsed = elapsed();
        self.last_tick_elapsed = Some(elapsed);
        if elapsed > HANDLER_TIME_BOUND {
            self.overrun_count += 1;
        }

        self.in_tick = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHandlers {
        calls: Vec<&'static str>,
        firmware_in_progress: bool,
    }

    impl GatewayHandlers for RecordingHandlers {
        fn run_poll(&mut self) {
            self.calls.push("poll");
        }
        fn run_command_poll(&mut self) {
            self.calls.push("command");
        }
        fn run_upload(&mut self) {
            self.calls.push("upload");
        }
        fn run_config_sync(&mut self) {
            self.calls.push("config");
        }
        fn run_firmware_check(&mut self) {
            self.calls.push("firmware");
        }
        fn firmware_activation_in_progress(&self) -> bool {
            self.firmware_in_progress
        }
    }

    #[test]
    fn dispatch_order_is_fixed_within_a_tick() {
        let mut coordinator = Coordinator::new(1, 1, 1, 1, 1);
        let mut handlers = RecordingHandlers::default();
        coordinator.tick(1000, &mut handlers, || Duration::from_millis(1));
        assert_eq!(handlers.calls, vec!["poll", "command", "upload", "config", "firmware"]);
    }

    #[test]
    fn only_due_tokens_fire() {
        let mut coordinator = Coordinator::new(10, 10, 10, 10, 10);
        let mut handlers = RecordingHandlers::default();
        // `last_fired_ms` starts at 0, so the first full period elapses at
        // `now_ms == period_ms` — mirroring a real hardware timer, which is
        // armed to fire after counting down one period, not instantly the
        // moment it's registered at boot.
        coordinator.tick(0, &mut handlers, || Duration::from_millis(1));
        assert!(handlers.calls.is_empty(), "nothing has completed a period yet at boot");

        coordinator.tick(5_000, &mut handlers, || Duration::from_millis(1));
        assert!(handlers.calls.is_empty(), "nothing due yet at +5s with 10s periods");

        coordinator.tick(10_000, &mut handlers, || Duration::from_millis(1));
        assert_eq!(handlers.calls, vec!["poll", "command", "upload", "config", "firmware"]);
    }

    #[test]
    fn firmware_activation_blocks_upload_this_tick() {
        let mut coordinator = Coordinator::new(1, 1, 1, 1, 1);
        let mut handlers = RecordingHandlers { firmware_in_progress: true, ..Default::default() };
        coordinator.tick(1000, &mut handlers, || Duration::from_millis(1));
        assert!(!handlers.calls.contains(&"upload"));
        assert!(handlers.calls.contains(&"firmware"));
    }

    #[test]
    fn overrun_is_counted_not_panicked() {
        let mut coordinator = Coordinator::new(1, 1, 1, 1, 1);
        let mut handlers = RecordingHandlers::default();
        coordinator.tick(1000, &mut handlers, || Duration::from_secs(3));
        assert_eq!(coordinator.overrun_count, 1);
    }

    #[test]
    fn period_can_be_reconfigured_at_runtime() {
        let mut coordinator = Coordinator::new(100, 100, 100, 100, 100);
        coordinator.set_period(TimerToken::Poll, 1);
        let mut handlers = RecordingHandlers::default();
        coordinator.tick(1000, &mut handlers, || Duration::from_millis(1));
        assert!(handlers.calls.contains(&"poll"));
    }
}
