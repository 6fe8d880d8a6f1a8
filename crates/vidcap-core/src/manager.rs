use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::FormatFilter;
use crate::errors::CaptureError;
use crate::platform::CapturePlatform;
use crate::types::{Device, FormatDescription};

// Process-wide so handles from two managers can never collide.
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Enumerates capture devices and their formats.
///
/// Every call to [`DeviceManager::list_devices`] starts a new generation;
/// handles from earlier generations are rejected with
/// [`CaptureError::StaleDevice`].
pub struct DeviceManager {
    platform: Arc<dyn CapturePlatform>,
    filter: FormatFilter,
    generation: u64,
    devices: Vec<Device>,
}

impl DeviceManager {
    pub fn new(platform: Arc<dyn CapturePlatform>, filter: FormatFilter) -> Self {
        Self { platform, filter, generation: 0, devices: Vec::new() }
    }

    pub fn platform(&self) -> Arc<dyn CapturePlatform> {
        self.platform.clone()
    }

    pub fn filter(&self) -> &FormatFilter {
        &self.filter
    }

    pub fn set_filter(&mut self, filter: FormatFilter) {
        self.filter = filter;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Devices from the latest enumeration.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn list_devices(&mut self) -> Result<Vec<Device>, CaptureError> {
        self.generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        self.devices.clear();

        self.platform.initialize()?;
        let records = self.platform.enumerate()?;

        let generation = self.generation;
        self.devices = records
            .into_iter()
            .enumerate()
            .map(|(i, r)| Device::new(i as u32, r.name, r.id, generation))
            .collect();

        info!(
            platform = self.platform.name(),
            count = self.devices.len(),
            generation,
            "Enumerated capture devices"
        );
        Ok(self.devices.clone())
    }

    /// Advertised formats of `device`'s first stream, filtered.
    pub fn list_formats(&self, device: &Device) -> Result<Vec<FormatDescription>, CaptureError> {
        let device = self.validate(device)?;
        let native = self.platform.native_formats(&device.id)?;
        let total = native.len();
        let formats = self.filter.apply(native);
        debug!(device = %device, total, kept = formats.len(), "Enumerated formats");
        Ok(formats)
    }

    /// Re-enumerate and return the current handle for the same physical device.
    pub fn reacquire(&mut self, device: &Device) -> Result<Device, CaptureError> {
        self.list_devices()?;
        self.find_device(&device.id)
            .cloned()
            .ok_or_else(|| CaptureError::DeviceNotFound { id: device.id.clone() })
    }

    pub fn find_device(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn device_by_index(&self, index: u32) -> Option<&Device> {
        self.devices.get(index as usize)
    }

    /// Check that `device` belongs to the current enumeration.
    pub fn validate<'a>(&'a self, device: &Device) -> Result<&'a Device, CaptureError> {
        if device.generation != self.generation {
            return Err(CaptureError::StaleDevice {
                handle: device.generation,
                current: self.generation,
            });
        }
        self.devices
            .get(device.index as usize)
            .filter(|current| current.id == device.id)
            .ok_or_else(|| CaptureError::DeviceNotFound { id: device.id.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimulatedPlatform};
    use crate::types::PixelFormat;

    fn platform() -> Arc<SimulatedPlatform> {
        Arc::new(
            SimulatedPlatform::new()
                .with_device(SimDevice::new("cam-a", "Camera A").with_formats(vec![
                    FormatDescription::new(640, 480, 30, PixelFormat::Nv12),
                    FormatDescription::new(1920, 1080, 30, PixelFormat::Yuy2),
                    FormatDescription::new(1280, 720, 15, PixelFormat::Mjpeg),
                ]))
                .with_device(SimDevice::new("cam-b", "Camera B")),
        )
    }

    #[test]
    fn lists_devices_in_platform_order() {
        let mut manager = DeviceManager::new(platform(), FormatFilter::default());
        let devices = manager.list_devices().unwrap();
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["Camera A", "Camera B"]);
        assert_eq!(devices[1].index, 1);
        assert_eq!(manager.device_by_index(0).unwrap().id, "cam-a");
        assert!(manager.find_device("cam-c").is_none());
    }

    #[test]
    fn initializes_subsystem_once() {
        let platform = platform();
        let mut manager = DeviceManager::new(platform.clone(), FormatFilter::default());
        manager.list_devices().unwrap();
        manager.list_devices().unwrap();
        assert_eq!(platform.startup_count(), 1);
    }

    #[test]
    fn filter_is_applied_in_order() {
        let mut manager = DeviceManager::new(platform(), FormatFilter::default());
        let devices = manager.list_devices().unwrap();
        assert_eq!(manager.list_formats(&devices[0]).unwrap().len(), 3);

        manager.set_filter(FormatFilter::legacy());
        assert_eq!(
            manager.list_formats(&devices[0]).unwrap(),
            vec![
                FormatDescription::new(640, 480, 30, PixelFormat::Nv12),
                FormatDescription::new(1280, 720, 15, PixelFormat::Mjpeg),
            ]
        );
    }

    #[test]
    fn handles_go_stale_after_reenumeration() {
        let mut manager = DeviceManager::new(platform(), FormatFilter::default());
        let old = manager.list_devices().unwrap();
        let fresh = manager.list_devices().unwrap();

        let err = manager.list_formats(&old[0]).unwrap_err();
        assert!(matches!(err, CaptureError::StaleDevice { .. }));
        assert!(manager.list_formats(&fresh[0]).is_ok());
    }

    #[test]
    fn handles_from_another_manager_are_stale() {
        let platform = platform();
        let mut first = DeviceManager::new(platform.clone(), FormatFilter::default());
        let mut second = DeviceManager::new(platform, FormatFilter::default());
        let devices = first.list_devices().unwrap();
        second.list_devices().unwrap();
        assert!(matches!(
            second.validate(&devices[0]),
            Err(CaptureError::StaleDevice { .. })
        ));
    }

    #[test]
    fn reacquire_follows_the_device_id() {
        let platform = platform();
        let mut manager = DeviceManager::new(platform.clone(), FormatFilter::default());
        let devices = manager.list_devices().unwrap();

        platform.remove_device("cam-a");
        let err = manager.reacquire(&devices[0]).unwrap_err();
        assert_eq!(err, CaptureError::DeviceNotFound { id: "cam-a".into() });

        let b = manager.reacquire(&devices[1]).unwrap();
        assert_eq!(b.id, "cam-b");
        assert_eq!(b.index, 0);
        assert_eq!(b.generation(), manager.generation());
    }

    #[test]
    fn device_without_streams_reports_no_streams() {
        let platform = Arc::new(
            SimulatedPlatform::new()
                .with_device(SimDevice::new("ir", "IR Sensor").without_streams()),
        );
        let mut manager = DeviceManager::new(platform, FormatFilter::default());
        let devices = manager.list_devices().unwrap();
        assert_eq!(manager.list_formats(&devices[0]), Err(CaptureError::NoStreams));
    }

    #[test]
    fn unavailable_subsystem_is_reported() {
        let platform = Arc::new(SimulatedPlatform::unavailable("MFStartup failed"));
        let mut manager = DeviceManager::new(platform, FormatFilter::default());
        assert!(matches!(
            manager.list_devices(),
            Err(CaptureError::SubsystemUnavailable { .. })
        ));
        assert!(manager.devices().is_empty());
    }
}
