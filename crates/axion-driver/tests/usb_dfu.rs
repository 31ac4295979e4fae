//! Firmware-download orchestration at open: detach from application mode,
//! flash in DFU mode, and come back up running the new image.

mod util;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axion_api::{ClosingMode, DriverOptions, Result};
use axion_driver::chip::{Chip, CsrLayout};
use axion_driver::driver::Driver;
use axion_driver::memory::dram::NullDramAllocator;
use axion_driver::memory::host::HostAllocator;
use axion_driver::registry::PackageRegistry;
use axion_driver::time::MonotonicTimeStamper;
use axion_driver::usb::device::{DeviceDescriptor, DfuDevice, RawUsbDevice, UsbDeviceFactory};
use axion_driver::usb::{UsbOptions, UsbTransport};
use util::{FakeUsbDevice, fill_buffer, standalone_package};

/// One fake device in DFU mode; records the downloaded image.
struct FakeDfuDevice {
    downloaded: Arc<Mutex<Vec<u8>>>,
}

impl DfuDevice for FakeDfuDevice {
    fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: 0x1A2B,
            product_id: 0x0001,
        }
    }

    fn claim_interface(&self, _interface: i32) -> Result<()> {
        Ok(())
    }

    fn download_firmware(&self, image: &[u8]) -> Result<()> {
        *self.downloaded.lock().unwrap() = image.to_vec();
        Ok(())
    }

    fn close(&self, _reset: bool) -> Result<()> {
        Ok(())
    }
}

/// Factory modelling the mode flips a DFU cycle goes through:
/// application -> (detach+reset) -> DFU -> (flash+reset) -> application.
struct DfuCyclingFactory {
    device: Arc<FakeUsbDevice>,
    downloaded: Arc<Mutex<Vec<u8>>>,
    opens: AtomicUsize,
}

impl UsbDeviceFactory for DfuCyclingFactory {
    fn open(&self) -> Result<RawUsbDevice> {
        let open_number = self.opens.fetch_add(1, Ordering::SeqCst);
        match open_number {
            // First open: still running the old application image.
            0 => Ok(RawUsbDevice::Application(
                Arc::clone(&self.device) as Arc<dyn axion_driver::usb::device::UsbDevice>
            )),
            // After the detach-reset: DFU mode.
            1 => Ok(RawUsbDevice::Dfu(Box::new(FakeDfuDevice {
                downloaded: Arc::clone(&self.downloaded),
            }))),
            // After the flash-reset: the fresh application image.
            _ => Ok(RawUsbDevice::Application(
                Arc::clone(&self.device) as Arc<dyn axion_driver::usb::device::UsbDevice>
            )),
        }
    }
}

#[test]
fn always_dfu_flashes_and_reopens_in_application_mode() {
    util::init_logging();
    let device = FakeUsbDevice::new();
    let downloaded = Arc::new(Mutex::new(Vec::new()));
    let firmware = vec![0xF1, 0xF2, 0xF3, 0xF4];

    let factory = Box::new(DfuCyclingFactory {
        device: Arc::clone(&device),
        downloaded: Arc::clone(&downloaded),
        opens: AtomicUsize::new(0),
    });

    let driver_options = DriverOptions::default();
    let transport = UsbTransport::new(
        CsrLayout::a1(),
        factory,
        Arc::new(NullDramAllocator::new()),
        UsbOptions {
            usb_always_dfu: true,
            usb_firmware_image: firmware.clone(),
            ..UsbOptions::default()
        },
        &driver_options,
        MonotonicTimeStamper::new(),
    );
    let registry = PackageRegistry::new(Some(Chip::A1), HostAllocator::new(4096));
    let driver = Driver::new(transport, registry, &driver_options, MonotonicTimeStamper::new());

    driver.open(false, false).unwrap();
    assert_eq!(*downloaded.lock().unwrap(), firmware);

    // The flashed device serves inference as usual.
    let package = driver
        .register_executable_serialized(&standalone_package(64, 64, 1, 1000))
        .unwrap();
    let request = driver.create_request(&package);
    let input = driver.make_buffer(64);
    fill_buffer(&input, 0x10);
    request.add_input("in", input).unwrap();
    request.add_output("out", driver.make_buffer(64)).unwrap();
    driver.execute(request).unwrap();

    driver.close(ClosingMode::Graceful).unwrap();
}
