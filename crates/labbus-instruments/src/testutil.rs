//! Scripted GPIB bus for driver tests: writes are logged as lines,
//! reads pop from a queue of canned responses.

use async_trait::async_trait;
use labbus_core::{
    AddressState, GpibAddress, GpibBus, GpibError, GpibInterface, GpibSettings, Result,
    TransferFlags,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
pub struct Script {
    pub responses: Mutex<VecDeque<String>>,
    pub sent: Mutex<Vec<String>>,
}

impl Script {
    pub fn push_response(&self, line: &str) {
        self.responses.lock().push_back(line.to_string());
    }

    pub fn sent_lines(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

struct ScriptedBus {
    script: Arc<Script>,
}

#[async_trait]
impl GpibBus for ScriptedBus {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn read(
        &self,
        _address: GpibAddress,
        max_len: usize,
        _flags: TransferFlags,
        _state: &AddressState,
    ) -> Result<Vec<u8>> {
        let line = self.script.responses.lock().pop_front().ok_or_else(|| {
            GpibError::timed_out("scripted", "no scripted response available")
        })?;
        let mut bytes = line.into_bytes();
        bytes.truncate(max_len);
        Ok(bytes)
    }

    async fn write(
        &self,
        _address: GpibAddress,
        data: &[u8],
        _flags: TransferFlags,
        _state: &AddressState,
    ) -> Result<usize> {
        self.script
            .sent
            .lock()
            .push(String::from_utf8_lossy(data).to_string());
        Ok(data.len() + 1)
    }
}

/// A loopback interface whose reads are driven by a script.
pub fn scripted_interface() -> (Arc<GpibInterface>, Arc<Script>) {
    let script = Arc::new(Script::default());
    let interface = Arc::new(GpibInterface::new(
        Box::new(ScriptedBus {
            script: Arc::clone(&script),
        }),
        GpibSettings::default(),
    ));
    (interface, script)
}
