//! COM apartment and Media Foundation startup.
//!
//! COM is entered per thread through a thread-local guard; `MFStartup` runs
//! once per process behind an [`InitOnce`].

use vidcap_core::{CaptureError, InitOnce};
use windows::Win32::Media::MediaFoundation::{MFStartup, MFSTARTUP_FULL, MF_VERSION};
use windows::Win32::System::Com::{
    CoInitializeEx, CoUninitialize, COINIT_APARTMENTTHREADED, COINIT_DISABLE_OLE1DDE,
};

static MF_RUNTIME: InitOnce = InitOnce::new();

struct Apartment {
    entered: bool,
}

impl Apartment {
    fn enter() -> Self {
        let hr = unsafe { CoInitializeEx(None, COINIT_APARTMENTTHREADED | COINIT_DISABLE_OLE1DDE) };
        if hr.is_err() {
            // RPC_E_CHANGED_MODE: the thread already joined another apartment.
            tracing::debug!("CoInitializeEx: {:?}", hr);
        }
        Self { entered: hr.is_ok() }
    }
}

impl Drop for Apartment {
    fn drop(&mut self) {
        if self.entered {
            unsafe { CoUninitialize() };
        }
    }
}

thread_local! {
    static APARTMENT: Apartment = Apartment::enter();
}

/// Make sure the calling thread is inside a COM apartment.
pub fn ensure_com() {
    APARTMENT.with(|_| {});
}

/// Enter COM on this thread and start Media Foundation once per process.
pub fn ensure_started() -> Result<(), CaptureError> {
    ensure_com();
    MF_RUNTIME.get_or_init(|| {
        unsafe { MFStartup(MF_VERSION, MFSTARTUP_FULL) }.map_err(|e| {
            CaptureError::SubsystemUnavailable { reason: format!("MFStartup: {e}") }
        })?;
        tracing::info!("Media Foundation started");
        Ok(())
    })
}

/// `Send` wrapper for Media Foundation objects.
///
/// MF objects are free-threaded; the engine and reader are only touched from
/// the owning session and from MF's own work-queue threads.
pub struct Mta<T>(pub T);

unsafe impl<T> Send for Mta<T> {}
unsafe impl<T> Sync for Mta<T> {}

impl<T> std::ops::Deref for Mta<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}
