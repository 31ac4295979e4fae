//! Hang detection, recovery, and the fatal-error latch.

mod util;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::time::Duration;

use axion_api::{ClosingMode, Error, ExecutionContext, LabeledContext, Telemeter};
use util::{TestDriverConfig, fill_buffer, make_usb_driver, standalone_package, wait_for};

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RecordingTelemeter {
    watchdog_timeouts: AtomicUsize,
}

impl Telemeter for RecordingTelemeter {
    fn log_watchdog_timeout(&self, _context: &dyn ExecutionContext) {
        self.watchdog_timeouts.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn watchdog_expiry_resets_the_device_and_recovers() {
    util::init_logging();
    let mut config = TestDriverConfig::default();
    config.driver_options.watchdog_timeout_ns = 100_000_000; // 100 ms
    let (driver, device) = make_usb_driver(config);

    let telemeter = Arc::new(RecordingTelemeter::default());
    driver.set_telemeter(Arc::clone(&telemeter) as Arc<dyn Telemeter>);

    device.set_hang(true);
    driver.open(false, false).unwrap();
    let package = driver
        .register_executable_serialized(&standalone_package(64, 64, 1, 1000))
        .unwrap();
    package.set_execution_context(Box::new(LabeledContext("camera-pipeline".to_string())));

    let request = driver.create_request(&package);
    let input = driver.make_buffer(64);
    fill_buffer(&input, 0x11);
    request.add_input("in", input).unwrap();
    request.add_output("out", driver.make_buffer(64)).unwrap();

    let (sender, receiver) = mpsc::channel();
    driver
        .submit(
            request,
            Box::new(move |_id, status| {
                sender.send(status).unwrap();
            }),
        )
        .unwrap();

    // The device never completes; the watchdog fires, telemetry records
    // the hung context, and the in-flight request fails with Cancelled.
    let status = receiver.recv_timeout(TIMEOUT).unwrap();
    assert!(matches!(status, Err(Error::Cancelled(_))));
    assert_eq!(telemeter.watchdog_timeouts.load(Ordering::SeqCst), 1);

    // The recovery path reopens the driver.
    assert!(wait_for(|| driver.is_open(), TIMEOUT));

    // A healthy device serves new work after recovery.
    device.set_hang(false);
    let request = driver.create_request(&package);
    let input = driver.make_buffer(64);
    fill_buffer(&input, 0x22);
    request.add_input("in", input).unwrap();
    request.add_output("out", driver.make_buffer(64)).unwrap();
    driver.execute(request).unwrap();

    driver.close(ClosingMode::Graceful).unwrap();
}

#[test]
fn fatal_error_latches_and_fails_subsequent_submits() {
    util::init_logging();
    let (driver, device) = make_usb_driver(TestDriverConfig::default());

    let fatal_count = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&fatal_count);
    driver.set_fatal_error_callback(Box::new(move |_error| {
        observed.fetch_add(1, Ordering::SeqCst);
    }));

    driver.open(false, false).unwrap();
    let package = driver
        .register_executable_serialized(&standalone_package(64, 64, 1, 1000))
        .unwrap();

    // Wait for the worker to install its interrupt reader, then raise a
    // fatal HIB error through the interrupt endpoint.
    assert!(wait_for(|| device.has_interrupt_reader(), TIMEOUT));
    let layout = axion_driver::chip::CsrLayout::a1();
    device.preload_csr(layout.hib.hib_error_status, 0xDEAD);
    device.send_interrupt(1);

    assert!(wait_for(|| driver.is_error(), TIMEOUT));
    assert_eq!(fatal_count.load(Ordering::SeqCst), 1);

    // Raising the line again must not re-fire the callback.
    assert!(wait_for(|| device.has_interrupt_reader(), TIMEOUT));
    device.send_interrupt(1);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fatal_count.load(Ordering::SeqCst), 1);

    // Every submission now fails with Unavailable.
    let request = driver.create_request(&package);
    request.add_input("in", driver.make_buffer(64)).unwrap();
    request.add_output("out", driver.make_buffer(64)).unwrap();
    let result = driver.submit(request, Box::new(|_, _| panic!("must not run")));
    assert!(matches!(result, Err(Error::Unavailable(_))));

    driver.close(ClosingMode::Graceful).unwrap();
}
