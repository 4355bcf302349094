//! Sample-changer superclass: a fixed vocabulary of changer verbs
//! dispatched to whichever robot implements them.
//!
//! Drivers implement the `do_*` hooks; the provided verb methods handle
//! the bookkeeping that is common to every changer (mirroring requested
//! sample ids/holders into the current fields once a verb succeeds).
//! Hooks a particular robot does not support keep their default bodies,
//! which fail with `NotImplemented`.

use crate::error::{GpibError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

/// Sentinel meaning "no sample is held or mounted".
pub const NO_SAMPLE_ID: i64 = -1;
/// Sentinel holder name meaning "no holder selected".
pub const NO_SAMPLE_HOLDER: &str = "none";

/// Status bits reported by [`SampleChanger::status`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangerStatus(u32);

impl ChangerStatus {
    pub const IDLE: ChangerStatus = ChangerStatus(0);
    pub const FAULT: ChangerStatus = ChangerStatus(1 << 0);
    pub const BUSY: ChangerStatus = ChangerStatus(1 << 1);
    pub const INITIALIZED: ChangerStatus = ChangerStatus(1 << 2);
    pub const SAMPLE_MOUNTED: ChangerStatus = ChangerStatus(1 << 3);
    pub const SAMPLE_GRABBED: ChangerStatus = ChangerStatus(1 << 4);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: ChangerStatus) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ChangerStatus) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ChangerStatus) {
        self.0 &= !other.0;
    }

    pub fn is_idle(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for ChangerStatus {
    type Output = ChangerStatus;

    fn bitor(self, rhs: ChangerStatus) -> ChangerStatus {
        ChangerStatus(self.0 | rhs.0)
    }
}

/// Who is allowed to drive the changer right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ControlMode {
    /// Nobody has claimed control.
    #[default]
    None,
    /// An operator at the hardware has control.
    Local,
    /// This software has control.
    Remote,
}

/// Shared bookkeeping every changer driver carries.
#[derive(Debug, Clone)]
pub struct ChangerState {
    pub requested_sample_id: i64,
    pub current_sample_id: i64,
    pub requested_sample_holder: String,
    pub current_sample_holder: String,
    pub status: ChangerStatus,
    pub control_mode: ControlMode,
}

impl Default for ChangerState {
    fn default() -> Self {
        Self {
            requested_sample_id: NO_SAMPLE_ID,
            current_sample_id: NO_SAMPLE_ID,
            requested_sample_holder: NO_SAMPLE_HOLDER.to_string(),
            current_sample_holder: NO_SAMPLE_HOLDER.to_string(),
            status: ChangerStatus::IDLE,
            control_mode: ControlMode::None,
        }
    }
}

/// The changer verb vocabulary.
#[async_trait]
pub trait SampleChanger: Send + Sync {
    /// Device name used in error messages.
    fn name(&self) -> &str;

    /// The driver's shared state record.
    fn state(&self) -> &Mutex<ChangerState>;

    // Hooks, overridden per robot.

    async fn do_initialize(&self) -> Result<()> {
        Err(GpibError::not_implemented(self.name(), "initialize"))
    }

    async fn do_shutdown(&self) -> Result<()> {
        Err(GpibError::not_implemented(self.name(), "shutdown"))
    }

    async fn do_mount_sample(&self) -> Result<()> {
        Err(GpibError::not_implemented(self.name(), "mount sample"))
    }

    async fn do_unmount_sample(&self) -> Result<()> {
        Err(GpibError::not_implemented(self.name(), "unmount sample"))
    }

    async fn do_grab_sample(&self, sample_id: i64) -> Result<()> {
        let _ = sample_id;
        Err(GpibError::not_implemented(self.name(), "grab sample"))
    }

    async fn do_ungrab_sample(&self) -> Result<()> {
        Err(GpibError::not_implemented(self.name(), "ungrab sample"))
    }

    async fn do_select_sample_holder(&self, holder: &str) -> Result<()> {
        let _ = holder;
        Err(GpibError::not_implemented(self.name(), "select sample holder"))
    }

    async fn do_unselect_sample_holder(&self) -> Result<()> {
        Err(GpibError::not_implemented(
            self.name(),
            "unselect sample holder",
        ))
    }

    async fn do_soft_abort(&self) -> Result<()> {
        Err(GpibError::not_implemented(self.name(), "soft abort"))
    }

    async fn do_immediate_abort(&self) -> Result<()> {
        Err(GpibError::not_implemented(self.name(), "immediate abort"))
    }

    async fn do_idle(&self) -> Result<()> {
        Err(GpibError::not_implemented(self.name(), "idle"))
    }

    async fn do_reset(&self) -> Result<()> {
        Err(GpibError::not_implemented(self.name(), "reset"))
    }

    /// Refresh and return the status bits.
    async fn status(&self) -> Result<ChangerStatus>;

    // Provided verbs with the shared bookkeeping.

    async fn initialize(&self) -> Result<()> {
        self.do_initialize().await?;
        self.state().lock().status.insert(ChangerStatus::INITIALIZED);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.do_shutdown().await
    }

    async fn mount_sample(&self) -> Result<()> {
        self.do_mount_sample().await?;
        self.state().lock().status.insert(ChangerStatus::SAMPLE_MOUNTED);
        Ok(())
    }

    async fn unmount_sample(&self) -> Result<()> {
        self.do_unmount_sample().await?;
        self.state().lock().status.remove(ChangerStatus::SAMPLE_MOUNTED);
        Ok(())
    }

    async fn grab_sample(&self, sample_id: i64) -> Result<()> {
        self.state().lock().requested_sample_id = sample_id;
        self.do_grab_sample(sample_id).await?;
        let mut state = self.state().lock();
        state.current_sample_id = sample_id;
        state.status.insert(ChangerStatus::SAMPLE_GRABBED);
        Ok(())
    }

    async fn ungrab_sample(&self) -> Result<()> {
        self.do_ungrab_sample().await?;
        let mut state = self.state().lock();
        state.current_sample_id = NO_SAMPLE_ID;
        state.status.remove(ChangerStatus::SAMPLE_GRABBED);
        Ok(())
    }

    async fn select_sample_holder(&self, holder: &str) -> Result<()> {
        self.state().lock().requested_sample_holder = holder.to_string();
        self.do_select_sample_holder(holder).await?;
        self.state().lock().current_sample_holder = holder.to_string();
        Ok(())
    }

    async fn unselect_sample_holder(&self) -> Result<()> {
        self.do_unselect_sample_holder().await?;
        self.state().lock().current_sample_holder = NO_SAMPLE_HOLDER.to_string();
        Ok(())
    }

    async fn soft_abort(&self) -> Result<()> {
        self.do_soft_abort().await
    }

    async fn immediate_abort(&self) -> Result<()> {
        self.do_immediate_abort().await
    }

    async fn idle(&self) -> Result<()> {
        self.do_idle().await
    }

    async fn reset(&self) -> Result<()> {
        self.do_reset().await
    }

    /// Snapshot of the shared state record.
    fn snapshot(&self) -> ChangerState {
        self.state().lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GpibErrorKind;

    struct MinimalChanger {
        state: Mutex<ChangerState>,
    }

    #[async_trait]
    impl SampleChanger for MinimalChanger {
        fn name(&self) -> &str {
            "minimal"
        }

        fn state(&self) -> &Mutex<ChangerState> {
            &self.state
        }

        async fn do_grab_sample(&self, _sample_id: i64) -> Result<()> {
            Ok(())
        }

        async fn do_select_sample_holder(&self, _holder: &str) -> Result<()> {
            Ok(())
        }

        async fn status(&self) -> Result<ChangerStatus> {
            Ok(self.state.lock().status)
        }
    }

    #[tokio::test]
    async fn grab_mirrors_requested_into_current() {
        let changer = MinimalChanger {
            state: Mutex::new(ChangerState::default()),
        };

        changer.grab_sample(17).await.unwrap();
        let state = changer.snapshot();
        assert_eq!(state.requested_sample_id, 17);
        assert_eq!(state.current_sample_id, 17);
        assert!(state.status.contains(ChangerStatus::SAMPLE_GRABBED));
    }

    #[tokio::test]
    async fn select_holder_mirrors_name() {
        let changer = MinimalChanger {
            state: Mutex::new(ChangerState::default()),
        };

        changer.select_sample_holder("puck_3").await.unwrap();
        let state = changer.snapshot();
        assert_eq!(state.requested_sample_holder, "puck_3");
        assert_eq!(state.current_sample_holder, "puck_3");
    }

    #[tokio::test]
    async fn unimplemented_verbs_report_not_implemented() {
        let changer = MinimalChanger {
            state: Mutex::new(ChangerState::default()),
        };

        let err = changer.mount_sample().await.unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::NotImplemented);

        // The failed verb must not have touched the status bits.
        assert!(!changer
            .snapshot()
            .status
            .contains(ChangerStatus::SAMPLE_MOUNTED));
    }
}
