//! Recurring timers driving the worker callbacks.
//!
//! Each timer is one tokio task. The callback runs on the blocking pool; a fire that
//! arrives while the previous callback is still running is dropped, so one handler
//! never runs concurrently with itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::error::{Result, SchedulerError};
use crate::time::TriggerFrequency;

pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Sleep used while a timer is deactivated; commands wake it early
const IDLE_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug)]
enum Command {
    /// Frequency or activity changed; recompute the wait
    Reschedule,
    TriggerNow,
    Shutdown,
}

struct TimerState {
    frequency: TriggerFrequency,
    active: bool,
}

/// Handle to a running timer task
pub struct RepeatTimer {
    name: String,
    state: Arc<Mutex<TimerState>>,
    in_flight: Arc<AtomicBool>,
    commands: UnboundedSender<Command>,
}

impl RepeatTimer {
    /// Spawn the timer task; it starts active
    pub fn spawn(name: &str, frequency: TriggerFrequency, callback: Callback) -> (Self, JoinHandle<()>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let timer = Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(TimerState {
                frequency,
                active: true,
            })),
            in_flight: Arc::new(AtomicBool::new(false)),
            commands,
        };
        let handle = tokio::spawn(run(
            timer.name.clone(),
            timer.state.clone(),
            timer.in_flight.clone(),
            callback,
            receiver,
        ));
        (timer, handle)
    }

    fn lock(&self) -> Result<MutexGuard<'_, TimerState>> {
        self.state.lock().map_err(SchedulerError::poisoned)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SchedulerError::InvalidState(format!("timer {} is shut down", self.name)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn activate(&self) -> Result<()> {
        self.lock()?.active = true;
        log::info!("Timer {} activated", self.name);
        self.send(Command::Reschedule)
    }

    /// Stop further fires; an in-flight callback finishes undisturbed
    pub fn deactivate(&self) -> Result<()> {
        self.lock()?.active = false;
        log::info!("Timer {} deactivated", self.name);
        self.send(Command::Reschedule)
    }

    /// Fire out of schedule; ignored while deactivated or if the callback is already running
    pub fn trigger_now(&self) -> Result<()> {
        self.send(Command::TriggerNow)
    }

    pub fn change_interval(&self, frequency: TriggerFrequency) -> Result<()> {
        log::info!("Timer {} now fires {}", self.name, frequency);
        self.lock()?.frequency = frequency;
        self.send(Command::Reschedule)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }

    pub fn is_active(&self) -> Result<bool> {
        Ok(self.lock()?.active)
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn frequency(&self) -> Result<TriggerFrequency> {
        Ok(self.lock()?.frequency.clone())
    }

    /// Wait until the next scheduled fire; None while deactivated
    pub fn next_run_in(&self, now: DateTime<Utc>) -> Result<Option<Duration>> {
        let state = self.lock()?;
        Ok(state.active.then(|| state.frequency.next_run_in(now)))
    }
}

fn is_active(state: &Mutex<TimerState>) -> bool {
    state.lock().map(|s| s.active).unwrap_or(false)
}

/// Scheduled wait, or None while deactivated
fn next_wait(state: &Mutex<TimerState>) -> Option<Duration> {
    let state = state.lock().ok()?;
    state.active.then(|| state.frequency.next_run_in(Utc::now()))
}

async fn run(
    name: String,
    state: Arc<Mutex<TimerState>>,
    in_flight: Arc<AtomicBool>,
    callback: Callback,
    mut commands: UnboundedReceiver<Command>,
) {
    loop {
        let wait = next_wait(&state);
        tokio::select! {
            _ = tokio::time::sleep(wait.unwrap_or(IDLE_WAIT)) => {
                if wait.is_some() {
                    fire(&name, &in_flight, &callback);
                }
            }
            command = commands.recv() => match command {
                Some(Command::Reschedule) => {}
                Some(Command::TriggerNow) if is_active(&state) => fire(&name, &in_flight, &callback),
                Some(Command::TriggerNow) => log::debug!("Timer {} is deactivated; ignoring trigger", name),
                Some(Command::Shutdown) | None => break,
            },
        }
    }
    log::info!("Timer {} stopped", name);
}

fn fire(name: &str, in_flight: &Arc<AtomicBool>, callback: &Callback) {
    if in_flight.swap(true, Ordering::SeqCst) {
        log::debug!("Timer {} is still running its previous fire; skipping", name);
        return;
    }
    let name = name.to_string();
    let flag = in_flight.clone();
    let callback = callback.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::task::spawn_blocking(move || callback()).await {
            log::error!("Timer {} callback panicked: {}", name, e);
        }
        flag.store(false, Ordering::SeqCst);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, Callback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let callback: Callback = Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    async fn wait_for(count: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if count.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trigger_now_fires_out_of_schedule() {
        let (count, callback) = counter();
        let (timer, handle) = RepeatTimer::spawn("t", TriggerFrequency::every_secs(3600), callback);

        timer.trigger_now().unwrap();
        wait_for(&count, 1).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        timer.shutdown().unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_interval_fires_repeatedly() {
        let (count, callback) = counter();
        let (timer, handle) = RepeatTimer::spawn("t", TriggerFrequency::Every(Duration::from_millis(20)), callback);

        wait_for(&count, 3).await;
        assert!(count.load(Ordering::SeqCst) >= 3);

        timer.shutdown().unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_deactivated_timer_reports_no_next_run() {
        let (_, callback) = counter();
        let (timer, handle) = RepeatTimer::spawn("t", TriggerFrequency::every_secs(60), callback);
        let now = Utc::now();

        assert_eq!(timer.next_run_in(now).unwrap(), Some(Duration::from_secs(60)));
        timer.deactivate().unwrap();
        assert!(!timer.is_active().unwrap());
        assert_eq!(timer.next_run_in(now).unwrap(), None);

        timer.change_interval(TriggerFrequency::every_secs(5)).unwrap();
        timer.activate().unwrap();
        assert_eq!(timer.next_run_in(now).unwrap(), Some(Duration::from_secs(5)));

        timer.shutdown().unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_in_flight_fire_is_not_repeated() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let callback: Callback = Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
        });
        let (timer, handle) = RepeatTimer::spawn("t", TriggerFrequency::every_secs(3600), callback);

        timer.trigger_now().unwrap();
        wait_for(&count, 1).await;
        assert!(timer.is_in_flight());
        timer.trigger_now().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        timer.shutdown().unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_deactivated_timer_ignores_trigger_now() {
        let (count, callback) = counter();
        let (timer, handle) = RepeatTimer::spawn("t", TriggerFrequency::every_secs(3600), callback);

        timer.deactivate().unwrap();
        timer.trigger_now().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        timer.activate().unwrap();
        timer.trigger_now().unwrap();
        wait_for(&count, 1).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        timer.shutdown().unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_commands_after_shutdown_fail() {
        let (_, callback) = counter();
        let (timer, handle) = RepeatTimer::spawn("t", TriggerFrequency::every_secs(60), callback);
        timer.shutdown().unwrap();
        handle.await.unwrap();
        assert!(timer.trigger_now().is_err());
    }
}
