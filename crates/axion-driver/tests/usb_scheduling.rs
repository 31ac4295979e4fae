//! Priority scheduling and cancellation over the USB transport.

mod util;

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axion_api::{ClosingMode, Error, Result};
use axion_driver::request::Request;
use util::{TestDriverConfig, fill_buffer, make_usb_driver, standalone_package, wait_for};

const TIMEOUT: Duration = Duration::from_secs(10);

/// One million estimated cycles per inference and a one-nanosecond work
/// cap: the budget admits new work only when the scheduler is empty.
fn tight_budget_config() -> TestDriverConfig {
    let mut config = TestDriverConfig::default();
    config.driver_options.max_scheduled_work_ns = 1;
    config
}

fn make_request(
    driver: &axion_driver::Driver,
    package: &Arc<axion_driver::PackageReference>,
    priority: u32,
    fill: u8,
) -> Arc<Request> {
    let request = driver.create_request(package);
    let input = driver.make_buffer(64);
    fill_buffer(&input, fill);
    request.add_input("in", input).unwrap();
    request.add_output("out", driver.make_buffer(64)).unwrap();
    request.set_priority(priority).unwrap();
    request
}

#[test]
fn p0_preempts_queued_lower_priorities() {
    util::init_logging();
    let (driver, device) = make_usb_driver(tight_budget_config());
    device.set_manual_execution(true);
    driver.open(false, false).unwrap();
    let package = driver
        .register_executable_serialized(&standalone_package(64, 64, 1, 1_000_000))
        .unwrap();

    let completions: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let (sender, receiver) = mpsc::channel();
    let mut submit = |request: &Arc<Request>| {
        let completions = Arc::clone(&completions);
        let sender = sender.clone();
        driver
            .submit(
                Arc::clone(request),
                Box::new(move |id, status: Result<()>| {
                    status.unwrap();
                    completions.lock().unwrap().push(id);
                    sender.send(()).unwrap();
                }),
            )
            .unwrap();
    };

    // Three P2 requests: the first is admitted (empty scheduler), the
    // rest queue behind the budget.
    let request_a = make_request(&driver, &package, 2, 1);
    let request_b = make_request(&driver, &package, 2, 2);
    let request_c = make_request(&driver, &package, 2, 3);
    submit(&request_a);
    submit(&request_b);
    submit(&request_c);

    // A P0 request bypasses the queues entirely.
    let request_p0 = make_request(&driver, &package, 0, 4);
    submit(&request_p0);

    // Drive the device one execution at a time.
    for _ in 0..4 {
        assert!(wait_for(
            || device.pending_execution_count() > 0,
            TIMEOUT
        ));
        device.release_execution();
        receiver.recv_timeout(TIMEOUT).unwrap();
    }

    // The P0 request ran right after the already-started P2; the queued
    // P2s followed in FIFO order.
    let order = completions.lock().unwrap().clone();
    assert_eq!(
        order,
        vec![
            request_a.id(),
            request_p0.id(),
            request_b.id(),
            request_c.id()
        ]
    );

    // Priority monotonicity on the wire: the P0 submission timestamp
    // precedes the lower-priority request scheduled after it.
    let p0_timing = request_p0.timing().unwrap();
    let b_timing = request_b.timing().unwrap();
    assert!(p0_timing.submitted_ns <= b_timing.submitted_ns);

    driver.close(ClosingMode::Graceful).unwrap();
}

#[test]
fn cancel_all_fails_pending_requests_and_keeps_the_driver_open() {
    util::init_logging();
    let (driver, device) = make_usb_driver(tight_budget_config());
    device.set_manual_execution(true);
    driver.open(false, false).unwrap();
    let package = driver
        .register_executable_serialized(&standalone_package(64, 64, 1, 1_000_000))
        .unwrap();

    // A P0 blocker keeps the device busy so nothing else is scheduled.
    let blocker = make_request(&driver, &package, 0, 9);
    let (blocker_sender, blocker_receiver) = mpsc::channel();
    driver
        .submit(
            blocker,
            Box::new(move |_id, status| {
                blocker_sender.send(status).unwrap();
            }),
        )
        .unwrap();

    let (sender, receiver) = mpsc::channel();
    for fill in 0..4u8 {
        let request = make_request(&driver, &package, 1, fill);
        let sender = sender.clone();
        driver
            .submit(
                request,
                Box::new(move |id, status| {
                    sender.send((id, status)).unwrap();
                }),
            )
            .unwrap();
    }

    driver.cancel_all_requests().unwrap();

    // All four queued requests fail with Cancelled.
    for _ in 0..4 {
        let (_, status) = receiver.recv_timeout(TIMEOUT).unwrap();
        assert!(matches!(status, Err(Error::Cancelled(_))));
    }
    assert!(driver.is_open());

    // The blocker was already on the device and completes normally.
    assert!(wait_for(|| device.pending_execution_count() > 0, TIMEOUT));
    device.release_execution();
    blocker_receiver
        .recv_timeout(TIMEOUT)
        .unwrap()
        .unwrap();

    driver.close(ClosingMode::Graceful).unwrap();
}

#[test]
fn latency_tolerance_rejects_work_that_cannot_finish_in_time() {
    util::init_logging();
    let (driver, _device) = make_usb_driver(TestDriverConfig::default());
    driver.open(false, false).unwrap();

    // 500 MHz and 5e9 cycles estimate: about ten seconds of work against
    // a 100 ms tolerance.
    let package = driver
        .register_executable_serialized(&standalone_package(64, 64, 1, 5_000_000_000))
        .unwrap();
    package.set_latency_tolerance(100).unwrap();

    let request = make_request(&driver, &package, 0, 1);
    let result = driver.submit(request, Box::new(|_, _| panic!("must not run")));
    assert!(matches!(result, Err(Error::DeadlineExceeded(_))));

    // Latency tolerance only applies to P0 requests.
    let request = make_request(&driver, &package, 1, 2);
    let result = driver.submit(request, Box::new(|_, _| panic!("must not run")));
    assert!(matches!(result, Err(Error::InvalidArgument(_))));

    driver.close(ClosingMode::Graceful).unwrap();
}

#[test]
fn cancelling_one_request_leaves_the_rest_running() {
    util::init_logging();
    let (driver, device) = make_usb_driver(tight_budget_config());
    device.set_manual_execution(true);
    driver.open(false, false).unwrap();
    let package = driver
        .register_executable_serialized(&standalone_package(64, 64, 1, 1_000_000))
        .unwrap();

    let busy = make_request(&driver, &package, 0, 1);
    let (busy_sender, busy_receiver) = mpsc::channel();
    driver
        .submit(
            busy,
            Box::new(move |_id, status| {
                busy_sender.send(status).unwrap();
            }),
        )
        .unwrap();

    let queued_victim = make_request(&driver, &package, 1, 2);
    let queued_survivor = make_request(&driver, &package, 1, 3);
    let (sender, receiver) = mpsc::channel();
    for request in [&queued_victim, &queued_survivor] {
        let sender = sender.clone();
        driver
            .submit(
                Arc::clone(request),
                Box::new(move |id, status| {
                    sender.send((id, status)).unwrap();
                }),
            )
            .unwrap();
    }

    driver.cancel(&queued_victim).unwrap();
    let (cancelled_id, cancelled_status) = receiver.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(cancelled_id, queued_victim.id());
    assert!(matches!(cancelled_status, Err(Error::Cancelled(_))));

    // Drain the device: the busy request, then the survivor.
    for _ in 0..2 {
        assert!(wait_for(
            || device.pending_execution_count() > 0,
            TIMEOUT
        ));
        device.release_execution();
    }
    busy_receiver.recv_timeout(TIMEOUT).unwrap().unwrap();
    let (survivor_id, survivor_status) = receiver.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(survivor_id, queued_survivor.id());
    survivor_status.unwrap();

    driver.close(ClosingMode::Graceful).unwrap();
}
