//! End-to-end inference over the USB transport against the software
//! device model.

mod util;

use std::sync::mpsc;
use std::time::Duration;

use axion_api::{ClosingMode, Result, TimingEventKind};
use util::{
    TestDriverConfig, device_transform, fill_buffer, make_usb_driver, read_buffer,
    standalone_package,
};

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn single_buffer_inference() {
    util::init_logging();
    let (driver, device) = make_usb_driver(TestDriverConfig::default());
    driver.open(false, false).unwrap();

    let package = driver
        .register_executable_serialized(&standalone_package(3072, 2048, 1, 1000))
        .unwrap();

    let input = driver.make_buffer(3072);
    fill_buffer(&input, 0xAA);
    let output = driver.make_buffer(2048);

    let request = driver.create_request(&package);
    request.add_input("in", input.clone()).unwrap();
    request.add_output("out", output.clone()).unwrap();

    let (sender, receiver) = mpsc::channel();
    driver
        .submit(
            request.clone(),
            Box::new(move |id, status| {
                sender.send((id, status)).unwrap();
            }),
        )
        .unwrap();

    let (id, status) = receiver.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(id, request.id());
    status.unwrap();

    // The callback fires exactly once.
    assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err());

    let expected = device_transform(&vec![0xAA; 3072], 2048);
    assert_eq!(read_buffer(&output), expected);

    // The instruction stream the device saw carries the patched input
    // address at bit offset 128.
    let payloads = device.instruction_payloads();
    assert_eq!(payloads.len(), 1);
    let patched = u32::from_le_bytes(payloads[0][16..20].try_into().unwrap());
    assert_eq!(patched, input.ptr() as u32);

    let timing = request.timing().unwrap();
    assert!(timing.created_ns <= timing.submitted_ns);
    assert!(timing.submitted_ns <= timing.completed_ns);

    driver.close(ClosingMode::Graceful).unwrap();
}

#[test]
fn blocking_execute_returns_final_status() {
    util::init_logging();
    let (driver, _device) = make_usb_driver(TestDriverConfig::default());
    driver.open(false, false).unwrap();

    let package = driver
        .register_executable_serialized(&standalone_package(64, 64, 1, 1000))
        .unwrap();

    let input = driver.make_buffer(64);
    fill_buffer(&input, 0x42);
    let output = driver.make_buffer(64);

    let request = driver.create_request(&package);
    request.add_input("in", input).unwrap();
    request.add_output("out", output.clone()).unwrap();
    driver.execute(request).unwrap();

    assert_eq!(read_buffer(&output), device_transform(&[0x42; 64], 64));
    driver.close(ClosingMode::Graceful).unwrap();
}

#[test]
fn batched_inference_pads_the_final_sub_request() {
    util::init_logging();
    let (driver, device) = make_usb_driver(TestDriverConfig::default());
    driver.open(false, false).unwrap();

    // Hardware batch of 4; a 6-element request becomes two sub-requests,
    // the second padded with two no-op slots.
    let package = driver
        .register_executable_serialized(&standalone_package(64, 64, 4, 1000))
        .unwrap();
    let request = driver.create_request(&package);

    let inputs: Vec<_> = (0..6)
        .map(|index| {
            let buffer = driver.make_buffer(64);
            fill_buffer(&buffer, index as u8 + 1);
            buffer
        })
        .collect();
    let outputs: Vec<_> = (0..6).map(|_| driver.make_buffer(64)).collect();
    for index in 0..6 {
        request.add_input("in", inputs[index].clone()).unwrap();
        request.add_output("out", outputs[index].clone()).unwrap();
    }

    let (sender, receiver) = mpsc::channel();
    driver
        .submit(
            request.clone(),
            Box::new(move |_id, status: Result<()>| {
                sender.send(status).unwrap();
            }),
        )
        .unwrap();
    receiver.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err());

    assert_eq!(device.executions(), 2);
    for index in 0..6 {
        let expected: Vec<u8> = vec![(index as u8 + 1) ^ 0x5A; 64];
        assert_eq!(read_buffer(&outputs[index]), expected, "batch element {index}");
    }

    // Two inference sub-requests: two submission and two completion
    // events.
    let timing = request.timing().unwrap();
    let submitted = timing
        .detail_events
        .iter()
        .filter(|event| event.event_kind == TimingEventKind::Submitted)
        .count();
    let completed = timing
        .detail_events
        .iter()
        .filter(|event| event.event_kind == TimingEventKind::Completed)
        .count();
    assert_eq!(submitted, 2);
    assert_eq!(completed, 2);

    driver.close(ClosingMode::Graceful).unwrap();
}

#[test]
fn validation_failures_reject_before_enqueue() {
    util::init_logging();
    let (driver, device) = make_usb_driver(TestDriverConfig::default());
    driver.open(false, false).unwrap();
    let package = driver
        .register_executable_serialized(&standalone_package(64, 64, 1, 1000))
        .unwrap();

    // Wrong input size.
    let request = driver.create_request(&package);
    request.add_input("in", driver.make_buffer(32)).unwrap();
    request.add_output("out", driver.make_buffer(64)).unwrap();
    let result = driver.submit(request, Box::new(|_, _| panic!("must not run")));
    assert!(result.is_err());

    // Missing output layer.
    let request = driver.create_request(&package);
    request.add_input("in", driver.make_buffer(64)).unwrap();
    let result = driver.submit(request, Box::new(|_, _| panic!("must not run")));
    assert!(result.is_err());

    assert_eq!(device.executions(), 0);
    driver.close(ClosingMode::Graceful).unwrap();
}
