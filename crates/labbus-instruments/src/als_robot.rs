//! ALS-style beamline sample-changer robot, driven over an RS-232 line.
//!
//! Every command receives a single response line of the form
//!
//! ```text
//! RESULT CURRENT_STATE CONTROL_MODE [return values...]
//! ```
//!
//! The state and control-mode fields are applied to the changer record
//! before the result code is considered, so even a failing command
//! leaves the BUSY/LOCAL bookkeeping accurate. Result codes map onto
//! the shared error taxonomy (`CTRL_REQ_DENIED` means someone at the
//! hutch owns the robot, `HARDWARE_ERROR` is a fault, and so on).

use async_trait::async_trait;
use labbus_core::changer::{ChangerState, ChangerStatus, ControlMode, SampleChanger};
use labbus_core::serial::{
    drain_serial_buffer, read_line, write_line, SerialError, SharedPort,
};
use labbus_core::{GpibError, GpibErrorKind, Result, Termination};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Map one result-code token to an error, or `None` for `SUCCESS`.
fn result_code_error(name: &str, command: &str, code: &str) -> Option<GpibError> {
    let (kind, reason) = match code {
        "SUCCESS" => return None,
        "CTRL_REQ_DENIED" => (
            GpibErrorKind::PermissionDenied,
            "the sample changer is in LOCAL mode",
        ),
        "ACCESS_DENIED" => (
            GpibErrorKind::PermissionDenied,
            "the sample changer is in LOCAL mode",
        ),
        "HARDWARE_ERROR" => (GpibErrorKind::HardwareFault, "a hardware fault occurred"),
        "COMM_ERROR" => (
            GpibErrorKind::InterfaceIo,
            "the controller reported a communication error",
        ),
        "TIMEOUT" => (GpibErrorKind::TimedOut, "the operation timed out"),
        "STATE_INCORRECT" => (
            GpibErrorKind::NotReady,
            "the command is not valid for the controller's current state",
        ),
        "UNKNOWN_COMMAND" => (GpibErrorKind::IllegalArgument, "the command is unknown"),
        "WRONG_ARG_LIST" => (
            GpibErrorKind::IllegalArgument,
            "the command had a wrong argument list",
        ),
        "DATA_ID_UNKNOWN" => (GpibErrorKind::IllegalArgument, "the data id is unknown"),
        "INVALID_DATA" => (GpibErrorKind::IllegalArgument, "the data was invalid"),
        "STOPPED" => (GpibErrorKind::DeviceIo, "the operation was stopped"),
        "UNSPECIFIED_ERR" => (GpibErrorKind::DeviceIo, "an unspecified error occurred"),
        _ => (GpibErrorKind::DeviceIo, "an unrecognized result code came back"),
    };
    Some(GpibError::new(
        name,
        kind,
        format!("command '{command}' failed: {reason} (result code '{code}')"),
    ))
}

/// Driver for the robot.
pub struct AlsRobot {
    name: String,
    port: SharedPort,
    read_timeout: Option<Duration>,
    state: Mutex<ChangerState>,
    interaction_id: AtomicU64,
}

impl AlsRobot {
    pub fn new(name: impl Into<String>, port: SharedPort, read_timeout: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            port,
            read_timeout,
            state: Mutex::new(ChangerState::default()),
            interaction_id: AtomicU64::new(1),
        }
    }

    fn map_serial(&self, e: SerialError) -> GpibError {
        match e {
            SerialError::TimedOut => GpibError::timed_out(&self.name, "serial read timed out"),
            other => GpibError::interface_io(&self.name, other.to_string()),
        }
    }

    fn next_interaction_id(&self) -> u64 {
        self.interaction_id.fetch_add(1, Ordering::Relaxed)
    }

    fn apply_state_token(&self, token: &str) -> Result<()> {
        let mut state = self.state.lock();
        match token {
            "POWERED_UP" => {}
            "INITIALIZING" | "BUSY" => state.status.insert(ChangerStatus::BUSY),
            "READY" => state.status.remove(ChangerStatus::BUSY),
            "MOUNTED" => state.status.insert(ChangerStatus::SAMPLE_MOUNTED),
            "SELECTED" => {}
            other => {
                return Err(GpibError::device_io(
                    &self.name,
                    format!("unrecognized current state '{other}' in robot response"),
                ))
            }
        }
        Ok(())
    }

    fn apply_mode_token(&self, token: &str) -> Result<()> {
        let mut state = self.state.lock();
        match token {
            "LOCAL" => state.control_mode = ControlMode::Local,
            "RELEASED" => state.control_mode = ControlMode::None,
            "REMOTE" => state.control_mode = ControlMode::Remote,
            other => {
                return Err(GpibError::device_io(
                    &self.name,
                    format!("unrecognized control mode '{other}' in robot response"),
                ))
            }
        }
        Ok(())
    }

    /// Send one command and parse the framed response.
    ///
    /// The state and mode fields are applied before the result code is
    /// turned into an error; when the result code itself signals a
    /// failure, that failure wins over any parse trouble in the later
    /// fields.
    pub async fn command(&self, command: &str, want_response: bool) -> Result<Option<String>> {
        let line = {
            let mut guard = self.port.lock().await;
            drain_serial_buffer(guard.get_mut(), 10).await;

            write_line(guard.get_mut(), Termination::CRLF, command)
                .await
                .map_err(|e| self.map_serial(e))?;
            read_line(&mut guard, Termination::CRLF, self.read_timeout)
                .await
                .map_err(|e| self.map_serial(e))?
        };
        debug!(device = %self.name, command, response = %line, "exchange");

        fn next_token(input: &str) -> (Option<&str>, &str) {
            let input = input.trim_start();
            if input.is_empty() {
                return (None, "");
            }
            match input.find(' ') {
                Some(index) => (Some(&input[..index]), &input[index + 1..]),
                None => (Some(input), ""),
            }
        }

        let (result_code, rest) = next_token(&line);
        let result_code = result_code.unwrap_or_default().to_string();
        let (state_token, rest) = next_token(rest);
        let state_token = state_token.map(str::to_string);
        let (mode_token, rest) = next_token(rest);
        let mode_token = mode_token.map(str::to_string);
        let return_values = {
            let values = rest.trim();
            (!values.is_empty()).then(|| values.to_string())
        };

        let state_result = match &state_token {
            Some(token) => self.apply_state_token(token),
            None => Err(GpibError::device_io(
                &self.name,
                format!(
                    "could not find the current state after the result code \
                     '{result_code}' in response '{line}'"
                ),
            )),
        };
        let mode_result = match &mode_token {
            Some(token) => self.apply_mode_token(token),
            None => Err(GpibError::device_io(
                &self.name,
                format!(
                    "could not find the control mode after the current state \
                     in response '{line}'"
                ),
            )),
        };

        if let Some(error) = result_code_error(&self.name, command, &result_code) {
            return Err(error);
        }
        state_result?;
        mode_result?;

        if !want_response {
            return Ok(None);
        }
        match return_values {
            Some(values) => Ok(Some(values)),
            None => Err(GpibError::device_io(
                &self.name,
                format!("could not find the return values in response '{line}'"),
            )),
        }
    }
}

#[async_trait]
impl SampleChanger for AlsRobot {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> &Mutex<ChangerState> {
        &self.state
    }

    async fn do_initialize(&self) -> Result<()> {
        self.command("control_request", false).await?;
        self.command("init", false).await.map(|_| ())
    }

    async fn do_shutdown(&self) -> Result<()> {
        self.command("shutdown", false).await.map(|_| ())
    }

    async fn do_mount_sample(&self) -> Result<()> {
        let (holder, sample_id) = {
            let state = self.state.lock();
            (
                state.requested_sample_holder.clone(),
                state.requested_sample_id,
            )
        };
        let command = format!(
            "run_op {} mount {holder} {sample_id}",
            self.next_interaction_id()
        );
        self.command(&command, false).await.map(|_| ())
    }

    async fn do_unmount_sample(&self) -> Result<()> {
        let command = format!("run_op {} unmount", self.next_interaction_id());
        self.command(&command, false).await.map(|_| ())
    }

    async fn do_select_sample_holder(&self, holder: &str) -> Result<()> {
        let command = format!("run_op {} select {holder}", self.next_interaction_id());
        self.command(&command, false).await.map(|_| ())
    }

    async fn do_unselect_sample_holder(&self) -> Result<()> {
        let command = format!("run_op {} unselect", self.next_interaction_id());
        self.command(&command, false).await.map(|_| ())
    }

    async fn do_soft_abort(&self) -> Result<()> {
        self.command("abort", false).await.map(|_| ())
    }

    async fn do_immediate_abort(&self) -> Result<()> {
        self.command("estop", false).await.map(|_| ())
    }

    async fn do_reset(&self) -> Result<()> {
        self.command("reset", false).await.map(|_| ())
    }

    async fn status(&self) -> Result<ChangerStatus> {
        self.state.lock().status = ChangerStatus::IDLE;

        let command = format!("run_op {} dev_status", self.next_interaction_id());
        let response = self.command(&command, true).await?;

        // The first two return values are the mounted holder and sample.
        if let Some(values) = response {
            let mut fields = values.split_whitespace();
            let holder = fields.next();
            let sample_id = fields.next().and_then(|f| f.parse::<i64>().ok());

            let mut state = self.state.lock();
            if let Some(holder) = holder {
                state.current_sample_holder = holder.to_string();
            }
            if let Some(sample_id) = sample_id {
                state.current_sample_id = sample_id;
            }
        }

        Ok(self.state.lock().status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labbus_core::serial::wrap_shared;
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Simulated robot controller: logs each command line received and
    /// answers every one with the same canned response.
    fn spawn_controller(host: DuplexStream, response: String, log: Arc<Mutex<Vec<String>>>) {
        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(host);
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                log.lock()
                    .push(line.trim_matches(|c| c == '\r' || c == '\n').to_string());
                let _ = write_half
                    .write_all(format!("{response}\r\n").as_bytes())
                    .await;
            }
        });
    }

    fn robot_with_response(response: &str) -> (Arc<AlsRobot>, Arc<Mutex<Vec<String>>>) {
        let (host, device) = tokio::io::duplex(1024);
        let log = Arc::new(Mutex::new(Vec::new()));
        spawn_controller(host, response.to_string(), log.clone());
        let robot = Arc::new(AlsRobot::new(
            "robot1",
            wrap_shared(Box::new(device)),
            Some(Duration::from_millis(500)),
        ));
        (robot, log)
    }

    #[tokio::test]
    async fn success_response_parses_cleanly() {
        let (robot, _log) = robot_with_response("SUCCESS POWERED_UP REMOTE");

        robot.command("reset", false).await.unwrap();

        let state = robot.snapshot();
        assert!(state.status.is_idle());
        assert_eq!(state.control_mode, ControlMode::Remote);
    }

    #[tokio::test]
    async fn hardware_error_still_applies_state_and_mode() {
        let (robot, _log) = robot_with_response("HARDWARE_ERROR BUSY LOCAL");

        let err = robot.command("init", false).await.unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::HardwareFault);

        // The BUSY state and LOCAL mode were recorded before failing.
        let state = robot.snapshot();
        assert!(state.status.contains(ChangerStatus::BUSY));
        assert_eq!(state.control_mode, ControlMode::Local);
    }

    #[tokio::test]
    async fn access_denied_maps_to_permission_denied() {
        let (robot, _log) = robot_with_response("ACCESS_DENIED READY LOCAL");

        let err = robot
            .command("run_op 1 mount p7 3", false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn missing_fields_are_device_errors() {
        let (robot, _log) = robot_with_response("SUCCESS");

        let err = robot.command("reset", false).await.unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::DeviceIo);
        assert!(err.to_string().contains("current state"));
    }

    #[tokio::test]
    async fn return_values_come_back_when_requested() {
        let (robot, _log) = robot_with_response("SUCCESS READY REMOTE puck_4 17 0");

        let values = robot.command("run_op 9 dev_status", true).await.unwrap();
        assert_eq!(values.unwrap(), "puck_4 17 0");
    }

    #[tokio::test]
    async fn mount_formats_the_run_op_command() {
        let (robot, log) = robot_with_response("SUCCESS READY REMOTE");

        robot.state().lock().requested_sample_holder = "puck_2".to_string();
        robot.state().lock().requested_sample_id = 11;
        robot.do_mount_sample().await.unwrap();

        assert_eq!(log.lock().last().unwrap(), "run_op 1 mount puck_2 11");
    }

    #[tokio::test]
    async fn status_refreshes_the_mounted_holder() {
        let (robot, log) = robot_with_response("SUCCESS MOUNTED REMOTE puck_4 17 0");

        let status = robot.status().await.unwrap();
        assert!(status.contains(ChangerStatus::SAMPLE_MOUNTED));

        let state = robot.snapshot();
        assert_eq!(state.current_sample_holder, "puck_4");
        assert_eq!(state.current_sample_id, 17);
        assert!(log.lock().last().unwrap().ends_with("dev_status"));
    }

    #[tokio::test]
    async fn initialize_requests_control_first() {
        let (robot, log) = robot_with_response("SUCCESS READY REMOTE");

        robot.initialize().await.unwrap();
        assert_eq!(
            log.lock().clone(),
            vec!["control_request".to_string(), "init".to_string()]
        );
    }
}
