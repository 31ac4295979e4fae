//! Parameter-caching behavior: one caching run per token residency, and
//! re-caching after the device context is torn down.

mod util;

use std::time::Duration;

use axion_api::ClosingMode;
use util::{TestDriverConfig, fill_buffer, make_usb_driver, parameter_caching_package};

#[test]
fn caching_runs_once_until_context_is_lost() {
    util::init_logging();
    let (driver, device) = make_usb_driver(TestDriverConfig::default());
    driver.open(false, false).unwrap();

    let package = driver
        .register_executable_serialized(&parameter_caching_package(64, 64, 0x1234, 1000))
        .unwrap();
    assert!(package.parameter_caching_enabled());

    let run = |driver: &axion_driver::Driver| {
        let request = driver.create_request(&package);
        let input = driver.make_buffer(64);
        fill_buffer(&input, 0x33);
        request.add_input("in", input).unwrap();
        request.add_output("out", driver.make_buffer(64)).unwrap();
        driver.execute(request).unwrap();
    };

    // First submit issues the caching run, then the inference.
    run(&driver);
    assert_eq!(device.pc_executions(), 1);
    assert_eq!(device.executions(), 2);

    // The cache is valid: only the inference runs.
    run(&driver);
    assert_eq!(device.pc_executions(), 1);
    assert_eq!(device.executions(), 3);

    // A close wipes device memory; reopening must re-cache.
    driver.close(ClosingMode::Graceful).unwrap();
    driver.open(false, false).unwrap();
    assert!(util::wait_for(
        || device.executions() == 3,
        Duration::from_secs(1)
    ));

    run(&driver);
    assert_eq!(device.pc_executions(), 2);
    assert_eq!(device.executions(), 5);

    driver.close(ClosingMode::Graceful).unwrap();
}

#[test]
fn unregister_is_refused_while_in_flight() {
    util::init_logging();
    let (driver, device) = make_usb_driver(TestDriverConfig::default());
    device.set_manual_execution(true);
    driver.open(false, false).unwrap();

    let package = driver
        .register_executable_serialized(&parameter_caching_package(64, 64, 0x77, 1000))
        .unwrap();
    let request = driver.create_request(&package);
    let input = driver.make_buffer(64);
    fill_buffer(&input, 1);
    request.add_input("in", input).unwrap();
    request.add_output("out", driver.make_buffer(64)).unwrap();

    let (sender, receiver) = std::sync::mpsc::channel();
    driver
        .submit(
            request,
            Box::new(move |_id, status| {
                sender.send(status).unwrap();
            }),
        )
        .unwrap();

    // The request is in flight; unregistering must be rejected.
    assert!(driver.unregister_executable(&package).is_err());

    // Let the caching run and the inference finish.
    assert!(util::wait_for(
        || device.pending_execution_count() > 0,
        Duration::from_secs(5)
    ));
    device.release_execution();
    assert!(util::wait_for(
        || device.pending_execution_count() > 0,
        Duration::from_secs(5)
    ));
    device.release_execution();
    receiver
        .recv_timeout(Duration::from_secs(10))
        .unwrap()
        .unwrap();

    driver.unregister_executable(&package).unwrap();
    driver.close(ClosingMode::Graceful).unwrap();
}
