//! Worker-pool behavior: admission caps, queue order, early replies,
//! shutdown, and the full dispatch loop.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use kiln_dispatch::loopback;
use kiln_dispatch::service::{Rpc, Service};
use kiln_dispatch::transport::{ReplySink, ServerRpc};
use kiln_dispatch::{Dispatch, ServiceManager, ServiceManagerConfig};
use kiln_wire::{Opcode, RequestHeader, ResponseHeader, ServiceType, Status};

const MASTER: u16 = ServiceType::Master as u16;

fn ping_request(tag: u8) -> Vec<u8> {
    let mut request = Vec::new();
    RequestHeader::new(Opcode::Ping, ServiceType::Master).encode(&mut request);
    request.push(tag);
    request
}

fn collecting_sink(replies: &Arc<Mutex<Vec<Vec<u8>>>>) -> ReplySink {
    let replies = Arc::clone(replies);
    Box::new(move |reply| replies.lock().push(reply))
}

fn poll_until(
    manager: &mut ServiceManager,
    deadline: Duration,
    mut done: impl FnMut(&ServiceManager) -> bool,
) {
    let stop = Instant::now() + deadline;
    while !done(manager) {
        manager.poll();
        assert!(Instant::now() < stop, "timed out waiting for the pool");
        thread::yield_now();
    }
}

/// Echoes the request body (everything after the common header) plus a
/// status header.
struct Echo;

impl Service for Echo {
    fn handle(&self, rpc: &mut Rpc<'_>) {
        let body = rpc.request()[4..].to_vec();
        ResponseHeader { status: Status::Ok }.encode(rpc.reply_mut());
        rpc.reply_mut().extend_from_slice(&body);
    }
}

#[test]
fn replies_flow_back_through_poll() {
    let mut manager = ServiceManager::new(ServiceManagerConfig::default());
    manager.add_service(MASTER, Arc::new(Echo), 2);

    let replies = Arc::new(Mutex::new(Vec::new()));
    for tag in [1u8, 2, 3] {
        manager.handle_rpc(ServerRpc::new(ping_request(tag), collecting_sink(&replies)));
    }
    poll_until(&mut manager, Duration::from_secs(5), |_| {
        replies.lock().len() == 3
    });

    let mut tags: Vec<u8> = replies.lock().iter().map(|reply| reply[4]).collect();
    tags.sort_unstable();
    assert_eq!(tags, vec![1, 2, 3]);

    poll_until(&mut manager, Duration::from_secs(5), |manager| manager.idle());
}

/// Records execution order and blocks until the gate opens.
struct Gated {
    gate: Arc<AtomicBool>,
    order: Arc<Mutex<Vec<u8>>>,
    started: Arc<AtomicUsize>,
}

impl Service for Gated {
    fn handle(&self, rpc: &mut Rpc<'_>) {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.order.lock().push(rpc.request()[4]);
        while !self.gate.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        ResponseHeader { status: Status::Ok }.encode(rpc.reply_mut());
    }
}

#[test]
fn admission_cap_queues_in_arrival_order() {
    let gate = Arc::new(AtomicBool::new(false));
    let order = Arc::new(Mutex::new(Vec::new()));
    let started = Arc::new(AtomicUsize::new(0));
    let service = Arc::new(Gated {
        gate: Arc::clone(&gate),
        order: Arc::clone(&order),
        started: Arc::clone(&started),
    });

    let mut manager = ServiceManager::new(ServiceManagerConfig::default());
    manager.add_service(MASTER, service, 1);

    let replies = Arc::new(Mutex::new(Vec::new()));
    for tag in [10u8, 20, 30] {
        manager.handle_rpc(ServerRpc::new(ping_request(tag), collecting_sink(&replies)));
    }

    // With a cap of one, only the first request may be executing no matter
    // how often dispatch polls.
    let settle = Instant::now() + Duration::from_millis(20);
    while Instant::now() < settle {
        manager.poll();
    }
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert!(replies.lock().is_empty());

    gate.store(true, Ordering::SeqCst);
    poll_until(&mut manager, Duration::from_secs(5), |_| {
        replies.lock().len() == 3
    });
    assert_eq!(order.lock().as_slice(), &[10, 20, 30]);
}

#[test]
fn header_errors_are_answered_on_the_dispatch_thread() {
    let mut manager = ServiceManager::new(ServiceManagerConfig::default());
    manager.add_service(MASTER, Arc::new(Echo), 1);

    let replies = Arc::new(Mutex::new(Vec::new()));
    manager.handle_rpc(ServerRpc::new(vec![0x01], collecting_sink(&replies)));
    manager.handle_rpc(ServerRpc::new(
        {
            let mut request = Vec::new();
            RequestHeader::new(Opcode::Ping, ServiceType::Backup).encode(&mut request);
            request
        },
        collecting_sink(&replies),
    ));

    // No poll needed: both replies are produced synchronously.
    let replies = replies.lock();
    assert_eq!(replies.len(), 2);
    assert_eq!(
        ResponseHeader::decode(&replies[0]).unwrap().status,
        Status::MessageTooShort
    );
    assert_eq!(
        ResponseHeader::decode(&replies[1]).unwrap().status,
        Status::ServiceNotAvailable
    );
}

/// Sends its reply early, then lingers in the postprocessing window until
/// released.
struct Postprocessor {
    release: Arc<AtomicBool>,
    postprocessing_done: Arc<AtomicBool>,
}

impl Service for Postprocessor {
    fn handle(&self, rpc: &mut Rpc<'_>) {
        ResponseHeader { status: Status::Ok }.encode(rpc.reply_mut());
        rpc.send_reply();
        while !self.release.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        self.postprocessing_done.store(true, Ordering::SeqCst);
    }
}

#[test]
fn early_reply_is_sent_while_worker_postprocesses() {
    let release = Arc::new(AtomicBool::new(false));
    let postprocessing_done = Arc::new(AtomicBool::new(false));
    let service = Arc::new(Postprocessor {
        release: Arc::clone(&release),
        postprocessing_done: Arc::clone(&postprocessing_done),
    });

    let mut manager = ServiceManager::new(ServiceManagerConfig::default());
    manager.add_service(MASTER, service, 1);

    let replies = Arc::new(Mutex::new(Vec::new()));
    manager.handle_rpc(ServerRpc::new(ping_request(0), collecting_sink(&replies)));

    poll_until(&mut manager, Duration::from_secs(5), |_| {
        !replies.lock().is_empty()
    });
    // The reply came back while the handler is still parked in its
    // postprocessing loop.
    assert!(!postprocessing_done.load(Ordering::SeqCst));
    assert!(!manager.idle());

    release.store(true, Ordering::SeqCst);
    poll_until(&mut manager, Duration::from_secs(5), |manager| manager.idle());
    assert!(postprocessing_done.load(Ordering::SeqCst));
}

struct Panicky;

impl Service for Panicky {
    fn handle(&self, _rpc: &mut Rpc<'_>) {
        panic!("handler blew up");
    }
}

#[test]
fn panicking_handler_becomes_an_internal_reply() {
    let mut manager = ServiceManager::new(ServiceManagerConfig::default());
    manager.add_service(MASTER, Arc::new(Panicky), 1);

    let replies = Arc::new(Mutex::new(Vec::new()));
    manager.handle_rpc(ServerRpc::new(ping_request(0), collecting_sink(&replies)));
    poll_until(&mut manager, Duration::from_secs(5), |_| {
        !replies.lock().is_empty()
    });
    assert_eq!(
        ResponseHeader::decode(&replies.lock()[0]).unwrap().status,
        Status::Internal
    );

    // The worker survives and serves the next request.
    poll_until(&mut manager, Duration::from_secs(5), |manager| manager.idle());
}

#[test]
fn shutdown_drains_and_joins() {
    let mut manager = ServiceManager::new(ServiceManagerConfig {
        poll_window: Duration::from_micros(50),
    });
    manager.add_service(MASTER, Arc::new(Echo), 4);

    let replies = Arc::new(Mutex::new(Vec::new()));
    for tag in 0..8u8 {
        manager.handle_rpc(ServerRpc::new(ping_request(tag), collecting_sink(&replies)));
    }
    manager.shutdown();
    assert_eq!(replies.lock().len(), 8);
    assert!(manager.idle());
}

#[test]
fn dispatch_loop_serves_a_loopback_transport() {
    let (transport, connector) = loopback::pair("loop:host=master");
    let mut manager = ServiceManager::new(ServiceManagerConfig::default());
    manager.add_service(MASTER, Arc::new(Echo), 2);
    let mut dispatch = Dispatch::new(manager);
    dispatch.add_transport(Box::new(transport));

    let shutdown = Arc::new(AtomicBool::new(false));
    let dispatch_shutdown = Arc::clone(&shutdown);
    let dispatch_thread = thread::spawn(move || dispatch.run(&dispatch_shutdown));

    let session = connector.session();
    let reply = session.send(ping_request(42)).wait().unwrap();
    assert_eq!(ResponseHeader::decode(&reply).unwrap().status, Status::Ok);
    assert_eq!(reply[4], 42);

    shutdown.store(true, Ordering::SeqCst);
    dispatch_thread.join().unwrap();
}
