use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use crate::gaze::Point;

/// Input driving a gaze session from the page
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Click on a calibration target
    TargetClick { index: usize, at: Point },
    /// Click anywhere, used by free-viewing calibration
    Click(Point),
    Tick,
}

/// Configurable ticker interface
pub trait Ticker {
    fn interval(&self) -> Duration;
}

/// Fixed interval ticker
#[derive(Clone, Copy, Debug)]
pub struct FixedTicker {
    interval: Duration,
}

impl FixedTicker {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Ticker for FixedTicker {
    fn interval(&self) -> Duration {
        self.interval
    }
}

/// Blocking waits the engine needs (model warm-up, calibration settle)
pub trait Pause {
    fn wait(&self, duration: Duration);
}

/// Sleeps the current thread
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadPause;

impl Pause for ThreadPause {
    fn wait(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Returns immediately; for tests and simulations
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPause;

impl Pause for NoPause {
    fn wait(&self, _duration: Duration) {}
}

/// Runner that advances a session one event/tick at a time
pub struct Runner<T: Ticker> {
    events: Receiver<SessionEvent>,
    ticker: T,
}

impl<T: Ticker> Runner<T> {
    pub fn new(events: Receiver<SessionEvent>, ticker: T) -> Self {
        Self { events, ticker }
    }

    /// Blocks up to tick interval and returns the next event, or Tick on timeout
    pub fn step(&self) -> SessionEvent {
        match self.events.recv_timeout(self.ticker.interval()) {
            Ok(ev) => ev,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                SessionEvent::Tick
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn step_returns_tick_on_timeout() {
        let (_tx, rx) = mpsc::channel();
        let runner = Runner::new(rx, FixedTicker::new(Duration::from_millis(1)));

        // With no events available, step should yield Tick
        assert_eq!(runner.step(), SessionEvent::Tick);
    }

    #[test]
    fn step_passes_through_events() {
        let (tx, rx) = mpsc::channel();
        let click = SessionEvent::Click(Point::new(3.0, 4.0));
        tx.send(click.clone()).unwrap();
        let runner = Runner::new(rx, FixedTicker::new(Duration::from_millis(10)));

        assert_eq!(runner.step(), click);
    }

    #[test]
    fn disconnected_source_ticks() {
        let (tx, rx) = mpsc::channel::<SessionEvent>();
        drop(tx);
        let runner = Runner::new(rx, FixedTicker::new(Duration::from_millis(1)));
        assert_eq!(runner.step(), SessionEvent::Tick);
    }
}
