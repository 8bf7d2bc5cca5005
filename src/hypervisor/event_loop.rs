//! libvirt's default event loop.
//!
//! libvirt only delivers domain events while someone runs its event loop.
//! The implementation must be registered before the first connection is
//! opened, and is then driven by one dedicated thread for the lifetime of
//! the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use super::ffi::VirtApi;
use crate::error::{Error, Result};

/// Pause after a failed iteration so a broken loop does not spin.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

static REGISTERED: OnceLock<std::result::Result<(), String>> = OnceLock::new();
static RUNNING: AtomicBool = AtomicBool::new(false);

/// Register the default event loop implementation (once per process).
pub(crate) fn ensure_registered(api: &'static VirtApi) -> Result<()> {
    REGISTERED
        .get_or_init(|| {
            // SAFETY: no arguments; libvirt is loaded.
            if unsafe { (api.event_register_default_impl)() } < 0 {
                let (_, message) = api.last_error();
                return Err(message);
            }
            tracing::debug!("registered libvirt default event loop");
            Ok(())
        })
        .clone()
        .map_err(|reason| Error::hypervisor("register event loop", reason))
}

/// Start the dispatch thread unless it is already running.
pub(crate) fn ensure_running(api: &'static VirtApi) -> Result<()> {
    ensure_registered(api)?;

    if RUNNING.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    thread::Builder::new()
        .name("libvirt-events".into())
        .spawn(move || run(api))
        .map(|_| ())
        .map_err(|e| {
            RUNNING.store(false, Ordering::SeqCst);
            Error::hypervisor("start event loop", e.to_string())
        })
}

fn run(api: &'static VirtApi) {
    tracing::debug!("libvirt event loop started");
    loop {
        // SAFETY: the default implementation was registered above.
        if unsafe { (api.event_run_default_impl)() } < 0 {
            let (_, message) = api.last_error();
            tracing::error!(error = %message, "libvirt event loop iteration failed");
            thread::sleep(ERROR_BACKOFF);
        }
    }
}
