//! Cooperative cancellation, wired to SIGINT for the CLI.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use once_cell::sync::OnceCell;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::debug;

/// Shared flag, cheap to clone, once set it stays set
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

static INTERRUPT: OnceCell<Cancellation> = OnceCell::new();

extern "C" fn on_interrupt(_: nix::libc::c_int) {
    // only an atomic store, nothing here may allocate or lock
    if let Some(cancellation) = INTERRUPT.get() {
        cancellation.cancel();
    }
}

/// Route SIGINT into a `Cancellation` instead of terminating the process.
///
/// Installing twice returns the same flag.
pub fn install_interrupt_handler() -> Result<Cancellation, nix::Error> {
    let cancellation = INTERRUPT.get_or_init(Cancellation::new).clone();
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    // SAFETY: the handler only performs an atomic store on an initialized static
    unsafe { sigaction(Signal::SIGINT, &action) }?;
    debug!("Installed interrupt handler");

    Ok(cancellation)
}
