//! The seam in front of the NI-488.2 / linux-gpib C library.
//!
//! The vendor library reports results through the global `ibsta` /
//! `iberr` / `ibcntl` variables, mutated as a side effect of every call.
//! Implementations of [`Ni488Api`] capture that triple into an
//! [`IbResult`] immediately at the call boundary so the globals never
//! leak into driver logic.

/// `ibsta` bit: the previous call failed.
pub const ERR: i32 = 1 << 15;
/// `ibsta` bit: the previous call timed out.
pub const TIMO: i32 = 1 << 14;
/// `ibsta` bit: END or EOS was seen during a read.
pub const END: i32 = 1 << 13;

/// EOS mode bit: terminate reads when the EOS character arrives.
pub const REOS: u32 = 0x400;
/// EOS mode bit: assert EOI when the EOS character is written.
pub const XEOS: u32 = 0x800;

/// No secondary address.
pub const NO_SAD: i32 = 0;

/// `ibask` configuration options used by this driver.
pub mod option {
    pub const SAD: i32 = 0x02;
    pub const TMO: i32 = 0x03;
    pub const EOT: i32 = 0x04;
    pub const EOS_READ: i32 = 0x0c;
    pub const EOS_WRITE: i32 = 0x0d;
}

/// Snapshot of the vendor status triple after one library call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IbResult {
    pub ibsta: i32,
    pub iberr: i32,
    pub ibcntl: i64,
}

impl IbResult {
    pub fn ok() -> Self {
        Self {
            ibsta: 0,
            iberr: 0,
            ibcntl: 0,
        }
    }

    pub fn is_err(&self) -> bool {
        self.ibsta & ERR != 0
    }
}

/// The subset of the vendor call surface this driver uses.
///
/// All methods are synchronous, mirroring the blocking C library; the
/// bus adapter moves them onto blocking threads. Board-level operations
/// take the board index, device-level operations take the descriptor
/// returned by [`Ni488Api::ibdev`].
pub trait Ni488Api: Send + Sync {
    /// Open a device descriptor for (board, pad, sad) with the given
    /// time-duration code, EOT mode, and EOS word.
    fn ibdev(&self, board: i32, pad: i32, sad: i32, tmo: i32, eot: i32, eos: i32)
        -> (i32, IbResult);

    /// Take a descriptor offline (`v = 0`).
    fn ibonl(&self, ud: i32, v: i32) -> IbResult;

    /// Check whether a listener is present at (pad, sad).
    fn ibln(&self, board: i32, pad: i32, sad: i32) -> (bool, IbResult);

    fn ibrd(&self, ud: i32, max_len: usize) -> (Vec<u8>, IbResult);

    /// Asynchronous read variant.
    fn ibrda(&self, ud: i32, max_len: usize) -> (Vec<u8>, IbResult);

    fn ibwrt(&self, ud: i32, data: &[u8]) -> IbResult;

    /// Asynchronous write variant.
    fn ibwrta(&self, ud: i32, data: &[u8]) -> IbResult;

    /// Selected device clear.
    fn ibclr(&self, ud: i32) -> IbResult;

    /// Pulse IFC on a board.
    fn ibsic(&self, board: i32) -> IbResult;

    /// Go to local.
    fn ibloc(&self, ud: i32) -> IbResult;

    /// Group execute trigger.
    fn ibtrg(&self, ud: i32) -> IbResult;

    /// Serial poll.
    fn ibrsp(&self, ud: i32) -> (u8, IbResult);

    /// Wait for events on a board (mask 0 = return current status).
    fn ibwait(&self, ud: i32, mask: i32) -> IbResult;

    /// Drive the REN line on a board.
    fn ibsre(&self, board: i32, v: i32) -> IbResult;

    /// Query a configuration option.
    fn ibask(&self, ud: i32, option: i32) -> (i32, IbResult);

    /// Board-wide device clear (DCL to all devices).
    fn dev_clear(&self, board: i32) -> IbResult;

    /// Assert local lockout on every device (LLO).
    fn send_llo(&self, board: i32) -> IbResult;
}

/// `iberr` values that carry extra context in rendered messages.
const EDVR: i32 = 0;

const ERROR_TEXT: [&str; 29] = [
    "EDVR - Operating system error",
    "ECIC - Function requires GPIB board to be CIC",
    "ENOL - No listeners on the GPIB bus",
    "EADR - GPIB board not addressed correctly",
    "EARG - Bad argument to function call",
    "ESAC - GPIB board not system controller as required",
    "EABO - I/O operation aborted (timeout)",
    "ENEB - Nonexistent GPIB board",
    "EDMA - DMA hardware error detected",
    "EBTO - DMA hardware microprocessor bus timeout",
    "EOIP - New I/O attempted with old I/O in progress",
    "ECAP - No capability for intended operation",
    "EFSO - File system operation error",
    "EOWN - Shareable board exclusively owned",
    "EBUS - GPIB bus error",
    "ESTB - Serial poll queue overflow",
    "ESRQ - SRQ line stuck on",
    "E??? - Unknown error code 17",
    "E??? - Unknown error code 18",
    "E??? - Unknown error code 19",
    "ETAB - The return buffer is full",
    "ELCK - Board or address is locked",
    "EARM - ibnotify callback failed to rearm",
    "EHDL - Input handle is invalid",
    "E??? - Unknown error code 24",
    "E??? - Unknown error code 25",
    "EWIP - Wait in progress on specified input handle",
    "ERST - The event notification was cancelled due to interface reset",
    "EPWR - The interface has lost power",
];

/// Render the vendor error for one captured status triple.
pub fn error_text(result: &IbResult) -> String {
    if !result.is_err() {
        return "Error flag in 'ibsta' is not set.  Are you sure there was an error?".to_string();
    }

    let iberr = result.iberr;
    if iberr < 0 || iberr as usize >= ERROR_TEXT.len() {
        format!("E??? - Unknown GPIB error code {iberr}")
    } else if iberr == EDVR {
        format!(
            "{}: errno = {}, OS message = '{}'",
            ERROR_TEXT[EDVR as usize],
            result.ibcntl,
            std::io::Error::from_raw_os_error(result.ibcntl as i32)
        )
    } else {
        ERROR_TEXT[iberr as usize].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_abort_code_is_named() {
        let result = IbResult {
            ibsta: ERR | TIMO,
            iberr: 6,
            ibcntl: 0,
        };
        assert!(error_text(&result).starts_with("EABO"));
    }

    #[test]
    fn unknown_codes_fall_through() {
        let result = IbResult {
            ibsta: ERR,
            iberr: 57,
            ibcntl: 0,
        };
        assert_eq!(error_text(&result), "E??? - Unknown GPIB error code 57");
    }

    #[test]
    fn no_error_flag_is_reported_as_such() {
        let result = IbResult::ok();
        assert!(error_text(&result).contains("not set"));
    }
}
