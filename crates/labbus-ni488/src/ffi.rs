//! Bindings to the installed NI-488.2 / linux-gpib C library.
//!
//! Compiled only with the `linux-gpib` feature, since linking requires
//! the vendor stack to be present. The two driver families export the
//! same symbols, so exactly one of them can be linked into a process.
//!
//! Every wrapper captures the `ibsta`/`iberr`/`ibcntl` globals into an
//! [`IbResult`](crate::api::IbResult) immediately after the call; the
//! globals are never read anywhere else.

#![allow(unsafe_code)]

use crate::api::{IbResult, Ni488Api};
use std::os::raw::{c_int, c_long, c_short, c_void};

#[link(name = "gpib")]
extern "C" {
    static ibsta: c_int;
    static iberr: c_int;
    static ibcntl: c_long;

    fn ibdev(board: c_int, pad: c_int, sad: c_int, tmo: c_int, eot: c_int, eos: c_int) -> c_int;
    fn ibonl(ud: c_int, v: c_int) -> c_int;
    fn ibln(ud: c_int, pad: c_int, sad: c_int, found_listener: *mut c_short) -> c_int;
    fn ibrd(ud: c_int, buf: *mut c_void, count: c_long) -> c_int;
    fn ibrda(ud: c_int, buf: *mut c_void, count: c_long) -> c_int;
    fn ibwrt(ud: c_int, buf: *const c_void, count: c_long) -> c_int;
    fn ibwrta(ud: c_int, buf: *const c_void, count: c_long) -> c_int;
    fn ibclr(ud: c_int) -> c_int;
    fn ibsic(ud: c_int) -> c_int;
    fn ibloc(ud: c_int) -> c_int;
    fn ibtrg(ud: c_int) -> c_int;
    fn ibrsp(ud: c_int, spr: *mut u8) -> c_int;
    fn ibwait(ud: c_int, mask: c_int) -> c_int;
    fn ibsre(ud: c_int, v: c_int) -> c_int;
    fn ibask(ud: c_int, option: c_int, value: *mut c_int) -> c_int;
    fn DevClear(board: c_int, address: c_short);
    fn SendLLO(board: c_int);
}

/// Address constant meaning "no device" in the 488.2 board-level calls.
const NOADDR: c_short = -1i16 as c_short;

fn capture() -> IbResult {
    // The globals are only meaningful immediately after a library call
    // made from this thread; callers hold them no longer than that.
    unsafe {
        IbResult {
            ibsta,
            iberr,
            ibcntl: ibcntl as i64,
        }
    }
}

/// The real vendor library.
pub struct LinuxGpib;

impl Ni488Api for LinuxGpib {
    fn ibdev(
        &self,
        board: i32,
        pad: i32,
        sad: i32,
        tmo: i32,
        eot: i32,
        eos: i32,
    ) -> (i32, IbResult) {
        let ud = unsafe { ibdev(board, pad, sad, tmo, eot, eos) };
        (ud, capture())
    }

    fn ibonl(&self, ud: i32, v: i32) -> IbResult {
        unsafe { ibonl(ud, v) };
        capture()
    }

    fn ibln(&self, board: i32, pad: i32, sad: i32) -> (bool, IbResult) {
        let mut found: c_short = 0;
        unsafe { ibln(board, pad, sad, &mut found) };
        (found != 0, capture())
    }

    fn ibrd(&self, ud: i32, max_len: usize) -> (Vec<u8>, IbResult) {
        let mut buf = vec![0u8; max_len];
        unsafe { ibrd(ud, buf.as_mut_ptr().cast(), max_len as c_long) };
        let result = capture();
        buf.truncate(result.ibcntl.max(0) as usize);
        (buf, result)
    }

    fn ibrda(&self, ud: i32, max_len: usize) -> (Vec<u8>, IbResult) {
        let mut buf = vec![0u8; max_len];
        unsafe { ibrda(ud, buf.as_mut_ptr().cast(), max_len as c_long) };
        let result = capture();
        buf.truncate(result.ibcntl.max(0) as usize);
        (buf, result)
    }

    fn ibwrt(&self, ud: i32, data: &[u8]) -> IbResult {
        unsafe { ibwrt(ud, data.as_ptr().cast(), data.len() as c_long) };
        capture()
    }

    fn ibwrta(&self, ud: i32, data: &[u8]) -> IbResult {
        unsafe { ibwrta(ud, data.as_ptr().cast(), data.len() as c_long) };
        capture()
    }

    fn ibclr(&self, ud: i32) -> IbResult {
        unsafe { ibclr(ud) };
        capture()
    }

    fn ibsic(&self, board: i32) -> IbResult {
        unsafe { ibsic(board) };
        capture()
    }

    fn ibloc(&self, ud: i32) -> IbResult {
        unsafe { ibloc(ud) };
        capture()
    }

    fn ibtrg(&self, ud: i32) -> IbResult {
        unsafe { ibtrg(ud) };
        capture()
    }

    fn ibrsp(&self, ud: i32) -> (u8, IbResult) {
        let mut poll_byte: u8 = 0;
        unsafe { ibrsp(ud, &mut poll_byte) };
        (poll_byte, capture())
    }

    fn ibwait(&self, ud: i32, mask: i32) -> IbResult {
        unsafe { ibwait(ud, mask) };
        capture()
    }

    fn ibsre(&self, board: i32, v: i32) -> IbResult {
        unsafe { ibsre(board, v) };
        capture()
    }

    fn ibask(&self, ud: i32, option: i32) -> (i32, IbResult) {
        let mut value: c_int = 0;
        unsafe { ibask(ud, option, &mut value) };
        (value, capture())
    }

    fn dev_clear(&self, board: i32) -> IbResult {
        unsafe { DevClear(board, NOADDR) };
        capture()
    }

    fn send_llo(&self, board: i32) -> IbResult {
        unsafe { SendLLO(board) };
        capture()
    }
}
