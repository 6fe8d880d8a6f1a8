//! HRESULT classification.
//!
//! Kept free of the `windows` crate so the mapping is testable on every host.

use vidcap_core::CaptureError;

const fn hresult(code: u32) -> i32 {
    code as i32
}

/// `HRESULT_FROM_WIN32(code)`.
const fn from_win32(code: u32) -> i32 {
    hresult(0x8007_0000 | (code & 0xFFFF))
}

pub const E_ACCESSDENIED: i32 = hresult(0x8007_0005);
pub const ERROR_SHARING_VIOLATION: i32 = from_win32(32);
pub const ERROR_BUSY: i32 = from_win32(170);
pub const ERROR_DEVICE_NOT_CONNECTED: i32 = from_win32(1167);
pub const ERROR_DEVICE_IN_USE: i32 = from_win32(2404);
pub const MF_E_NO_MORE_TYPES: i32 = hresult(0xC00D_36B9);
pub const MF_E_INVALIDSTREAMNUMBER: i32 = hresult(0xC00D_36B3);
pub const MF_E_HW_MFT_FAILED_START_STREAMING: i32 = hresult(0xC00D_3704);
pub const MF_E_VIDEO_RECORDING_DEVICE_INVALIDATED: i32 = hresult(0xC00D_ABE0);
pub const MF_E_VIDEO_RECORDING_DEVICE_PREEMPTED: i32 = hresult(0xC00D_ABE1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Another client holds the device, access is denied, or it went away.
    Busy,
    /// End of a media-type enumeration.
    Exhausted,
    Other,
}

pub fn classify(code: i32) -> StatusClass {
    match code {
        E_ACCESSDENIED
        | ERROR_SHARING_VIOLATION
        | ERROR_BUSY
        | ERROR_DEVICE_NOT_CONNECTED
        | ERROR_DEVICE_IN_USE
        | MF_E_HW_MFT_FAILED_START_STREAMING
        | MF_E_VIDEO_RECORDING_DEVICE_INVALIDATED
        | MF_E_VIDEO_RECORDING_DEVICE_PREEMPTED => StatusClass::Busy,
        MF_E_NO_MORE_TYPES | MF_E_INVALIDSTREAMNUMBER => StatusClass::Exhausted,
        _ => StatusClass::Other,
    }
}

/// Map a failed HRESULT from `operation` to a [`CaptureError`].
pub fn capture_error(operation: &str, code: i32, message: &str) -> CaptureError {
    let reason = if message.is_empty() {
        format!("HRESULT 0x{:08X}", code as u32)
    } else {
        format!("{message} (HRESULT 0x{:08X})", code as u32)
    };
    match classify(code) {
        StatusClass::Busy => CaptureError::DeviceBusyOrUnavailable {
            reason: format!("{operation}: {reason}"),
        },
        StatusClass::Exhausted | StatusClass::Other => CaptureError::backend(operation, reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn win32_codes_are_wrapped() {
        assert_eq!(ERROR_SHARING_VIOLATION as u32, 0x8007_0020);
        assert_eq!(ERROR_DEVICE_IN_USE as u32, 0x8007_0964);
    }

    #[test]
    fn busy_family_is_retryable() {
        for code in [E_ACCESSDENIED, ERROR_SHARING_VIOLATION, MF_E_HW_MFT_FAILED_START_STREAMING] {
            let err = capture_error("StartPreview", code, "device in use");
            assert!(err.is_retryable(), "{err}");
        }
    }

    #[test]
    fn other_codes_map_to_backend() {
        let err = capture_error("MFCreateSourceReaderFromMediaSource", 0x8000_4005_u32 as i32, "");
        assert_eq!(
            err,
            CaptureError::Backend {
                operation: "MFCreateSourceReaderFromMediaSource".into(),
                reason: "HRESULT 0x80004005".into(),
            }
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn enumeration_end_is_classified() {
        assert_eq!(classify(MF_E_NO_MORE_TYPES), StatusClass::Exhausted);
        assert_eq!(classify(0), StatusClass::Other);
    }
}
