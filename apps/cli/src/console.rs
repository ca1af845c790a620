use std::sync::Mutex;

use grdfu_core::DfuListener;
use tracing::{error, info, warn};

/// Prints session callbacks, one line per progress step.
#[derive(Default)]
pub struct ConsoleListener {
    last: Mutex<Option<(String, u8)>>,
}

impl DfuListener for ConsoleListener {
    fn on_start(&self) {
        info!("DFU started");
    }

    fn on_progress(&self, message: &str, percent: u8) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let step = (message.to_string(), percent);
        if last.as_ref() != Some(&step) {
            info!("{:<28} {:>3}%", message, percent);
            *last = Some(step);
        }
    }

    fn on_complete(&self) {
        info!("DFU completed");
    }

    fn on_error(&self, message: &str) {
        error!("DFU failed: {}", message);
    }

    fn on_cancelled(&self, percent: u8) {
        warn!(percent, "DFU cancelled");
    }
}
