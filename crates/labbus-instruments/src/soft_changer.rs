//! Software-simulated sample changer.
//!
//! No hardware: every verb succeeds immediately and mutates the state
//! record. Used for integration tests and for exercising beamline
//! tooling without the robot powered up.

use async_trait::async_trait;
use labbus_core::changer::{ChangerState, ChangerStatus, ControlMode, SampleChanger};
use labbus_core::Result;
use parking_lot::Mutex;

pub struct SoftChanger {
    name: String,
    state: Mutex<ChangerState>,
}

impl SoftChanger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ChangerState::default()),
        }
    }
}

#[async_trait]
impl SampleChanger for SoftChanger {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> &Mutex<ChangerState> {
        &self.state
    }

    async fn do_initialize(&self) -> Result<()> {
        self.state.lock().control_mode = ControlMode::Remote;
        Ok(())
    }

    async fn do_shutdown(&self) -> Result<()> {
        self.state.lock().control_mode = ControlMode::None;
        Ok(())
    }

    async fn do_mount_sample(&self) -> Result<()> {
        Ok(())
    }

    async fn do_unmount_sample(&self) -> Result<()> {
        Ok(())
    }

    async fn do_grab_sample(&self, _sample_id: i64) -> Result<()> {
        Ok(())
    }

    async fn do_ungrab_sample(&self) -> Result<()> {
        Ok(())
    }

    async fn do_select_sample_holder(&self, _holder: &str) -> Result<()> {
        Ok(())
    }

    async fn do_unselect_sample_holder(&self) -> Result<()> {
        Ok(())
    }

    async fn do_soft_abort(&self) -> Result<()> {
        Ok(())
    }

    async fn do_immediate_abort(&self) -> Result<()> {
        Ok(())
    }

    async fn do_idle(&self) -> Result<()> {
        Ok(())
    }

    async fn do_reset(&self) -> Result<()> {
        self.state.lock().status = ChangerStatus::IDLE;
        Ok(())
    }

    async fn status(&self) -> Result<ChangerStatus> {
        Ok(self.state.lock().status)
    }
}
