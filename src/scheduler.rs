// Fixed-rate command frame timer
//
// The scheduler does not write to the link itself. It queues TimerTick events
// into the control loop, which samples the motors and writes the frame. Every
// start() bumps the generation so ticks still queued from a previous run can be
// told apart and dropped.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info};

use crate::messages::{CommandFrame, ControlEvent, EventSender};
use crate::motor::{MOTOR_COUNT, MotorModel};

pub struct CommandScheduler {
    period: Duration,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl CommandScheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            generation: 0,
            task: None,
        }
    }

    /// Start ticking. The first tick arrives one period from now.
    /// Does nothing if already running.
    pub fn start(&mut self, events: &EventSender) {
        if self.task.is_some() {
            return;
        }
        self.generation += 1;
        let generation = self.generation;
        let period = self.period;
        let events = events.clone();

        self.task = Some(tokio::spawn(async move {
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if events.send(ControlEvent::TimerTick { generation }).is_err() {
                    break;
                }
            }
        }));
        info!(
            "Command scheduler started ({}ms interval, generation {})",
            period.as_millis(),
            generation
        );
    }

    /// Stop ticking. Safe to call when already stopped.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Command scheduler stopped (generation {})", self.generation);
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// True if a tick of this generation should produce a frame
    pub fn accepts(&self, generation: u64) -> bool {
        self.is_running() && generation == self.generation
    }

    /// Sample commanded PWM in fixed motor order, keyed by each motor's frame key
    pub fn frame(motors: &[MotorModel; MOTOR_COUNT]) -> CommandFrame {
        motors
            .iter()
            .map(|m| (m.keys().frame.as_str(), m.pwm_value()))
            .collect()
    }
}

impl Drop for CommandScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
