//! vidcap-core: device enumeration, format matching and the capture session
//! state machine, independent of any OS capture stack.
//!
//! ```text
//! DeviceManager::list_devices → Device (generation-stamped)
//!   │  list_formats (FormatFilter applied)
//!   ▼
//! FormatDescription ── find_format ──▶ CaptureSession::start
//!   │                                    │ CapturePlatform::open_engine
//!   │                                    ▼
//!   │                     CaptureEngine: resolve → configure → arm
//!   ▼                                    │ SampleSink / EngineEventSink
//! frame callback ◀────── EventDispatcher ◀┘
//! ```
//!
//! Native back ends implement [`CapturePlatform`]; [`sim::SimulatedPlatform`]
//! is an in-process one for tests and demos.

pub mod config;
mod dispatch;
pub mod errors;
pub mod manager;
pub mod matcher;
pub mod platform;
pub mod session;
pub mod sim;
pub mod types;

pub use config::{FormatFilter, SessionConfig, VidcapConfig};
pub use errors::{CaptureError, ConfigError};
pub use manager::DeviceManager;
pub use matcher::{find_format, position_of};
pub use platform::{
    CaptureEngine, CapturePlatform, DeviceRecord, EngineEvent, EngineEventSink, EngineSinks,
    InitOnce, SampleSink, StreamSelection,
};
pub use session::CaptureSession;
pub use types::*;
