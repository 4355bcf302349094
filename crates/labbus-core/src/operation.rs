//! Operation superclass: long-running activities with a start/stop/status
//! contract, plus the stock "toast" operation that shuttles a movable
//! target back and forth until told to stop.

use crate::error::{GpibError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Status bits reported by [`Operation::status`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpStatus(u32);

impl OpStatus {
    pub const IDLE: OpStatus = OpStatus(0);
    pub const BUSY: OpStatus = OpStatus(1 << 0);
    pub const FAULT: OpStatus = OpStatus(1 << 1);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: OpStatus) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A long-running, stoppable activity.
#[async_trait]
pub trait Operation: Send + Sync {
    fn name(&self) -> &str;

    async fn status(&self) -> Result<OpStatus>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

/// Anything that can be sent to an absolute position. The toast operation
/// drives one of these; instrument crates implement it for their motion
/// axes.
#[async_trait]
pub trait Movable: Send + Sync {
    async fn move_absolute(&self, position: f64) -> Result<()>;

    /// True while a commanded move is still in progress.
    async fn is_busy(&self) -> Result<bool>;
}

/// Oscillate a movable target between two positions until stopped.
///
/// Useful for spreading beam exposure across a sample while a measurement
/// runs. The oscillation happens on a background task; `stop` lets the
/// current stroke finish rather than abandoning the axis mid-move.
pub struct ToastOperation {
    name: String,
    target: Arc<dyn Movable>,
    low_position: f64,
    high_position: f64,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    faulted: Arc<AtomicBool>,
    task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ToastOperation {
    pub fn new(
        name: impl Into<String>,
        target: Arc<dyn Movable>,
        low_position: f64,
        high_position: f64,
    ) -> Self {
        Self {
            name: name.into(),
            target,
            low_position,
            high_position,
            poll_interval: Duration::from_millis(10),
            running: Arc::new(AtomicBool::new(false)),
            faulted: Arc::new(AtomicBool::new(false)),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn wait_for_move(
        target: &Arc<dyn Movable>,
        running: &AtomicBool,
        poll_interval: Duration,
    ) -> Result<()> {
        while target.is_busy().await? {
            if !running.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(poll_interval).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Operation for ToastOperation {
    fn name(&self) -> &str {
        &self.name
    }

    async fn status(&self) -> Result<OpStatus> {
        if self.faulted.load(Ordering::SeqCst) {
            Ok(OpStatus::FAULT)
        } else if self.running.load(Ordering::SeqCst) {
            Ok(OpStatus::BUSY)
        } else {
            Ok(OpStatus::IDLE)
        }
    }

    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.faulted.store(false, Ordering::SeqCst);

        let target = Arc::clone(&self.target);
        let running = Arc::clone(&self.running);
        let faulted = Arc::clone(&self.faulted);
        let (low, high) = (self.low_position, self.high_position);
        let poll_interval = self.poll_interval;
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            let mut destination = high;
            while running.load(Ordering::SeqCst) {
                let stroke = async {
                    target.move_absolute(destination).await?;
                    Self::wait_for_move(&target, &running, poll_interval).await
                };
                if let Err(e) = stroke.await {
                    warn!(operation = %name, error = %e, "toast stroke failed");
                    faulted.store(true, Ordering::SeqCst);
                    running.store(false, Ordering::SeqCst);
                    break;
                }
                destination = if destination == high { low } else { high };
            }
        });

        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().await.take() {
            handle.await.map_err(|e| {
                GpibError::hardware_fault(&self.name, format!("toast task panicked: {e}"))
            })?;
        }
        Ok(())
    }
}
