mod common;

use std::thread;
use std::time::Duration;

use crossbeam::channel::bounded;
use downlink::downlink::client::Client;
use downlink::downlink::server::{Server, ServerOpts};
use downlink::packet::{assemble, Packet, TYPE_BANDWIDTH, TYPE_COEFFICIENTS, TYPE_RATIO};
use downlink::pipeline::{Pipeline, PipelineOpts};
use downlink::queue::SharedQueue;
use downlink::transform::SoftAccelerator;

use common::{init_tracing, staged};

fn opts() -> ServerOpts {
    ServerOpts::builder()
        .read_timeout(Duration::from_millis(20))
        .poll_interval(Duration::from_millis(1))
        .build()
}

fn client(addr: std::net::SocketAddr) -> Client {
    Client::connect(addr)
        .unwrap()
        .with_timeout(Duration::from_millis(200))
        .unwrap()
}

#[test]
fn store_then_request() {
    init_tracing();
    let queue = SharedQueue::new(8);
    let mut server = Server::bind("127.0.0.1:0", queue.clone(), opts()).unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, shutdown) = bounded::<()>(1);
    let handle = thread::spawn(move || server.serve(&shutdown).unwrap());

    let mut client = client(addr);
    let packet = Packet::from_bytes(hex::decode("52000002abcd").unwrap()).unwrap();
    client.store(&packet).unwrap();
    assert_eq!(queue.len(), 1);

    let got = client.request().unwrap().unwrap();
    assert_eq!(hex::encode(got.as_bytes()), "52000002abcd");
    assert_eq!(queue.len(), 0);

    // empty queue: nothing comes back
    assert!(client.request().unwrap().is_none());
    assert_eq!(queue.len(), 0);

    drop(client);
    stop.send(()).unwrap();
    let served = handle.join().unwrap();
    assert_eq!(served.len(), 1);
    assert_eq!(served[0].stats.stored, 1);
    assert_eq!(served[0].stats.sent, 1);
    assert_eq!(served[0].stats.empty, 1);
}

#[test]
fn capture_and_downlink_concurrently() {
    init_tracing();
    let queue = SharedQueue::new(64);
    let pipeline = Pipeline::new(
        staged(14),
        SoftAccelerator::default().with_retained(8),
        PipelineOpts::builder().total_blocks(14).build(),
    )
    .unwrap();

    let telemetry = assemble(&[4], TYPE_RATIO).unwrap();
    let mut server = Server::bind("127.0.0.1:0", queue.clone(), opts())
        .unwrap()
        .with_telemetry(Some(telemetry.clone()));
    let addr = server.local_addr().unwrap();
    let (stop, shutdown) = bounded::<()>(1);
    let serving = thread::spawn(move || server.serve(&shutdown).unwrap());
    let capture = pipeline.spawn(queue.clone(), None).unwrap();

    let mut client = client(addr);
    assert_eq!(client.receive().unwrap(), Some(telemetry));

    let report = capture.join().unwrap().unwrap();
    assert_eq!(report.queued, 14);

    let mut packets = Vec::new();
    while let Some(packet) = client.request().unwrap() {
        packets.push(packet);
    }
    assert_eq!(packets.len(), 14);
    for (i, packet) in packets.iter().enumerate() {
        assert_eq!(packet.packet_type(), TYPE_COEFFICIENTS);
        // 8 coefficients of 2 bytes
        assert_eq!(packet.payload().len(), 16);
        assert_eq!(packet.payload()[0], i as u8, "block {i}");
    }

    drop(client);
    stop.send(()).unwrap();
    serving.join().unwrap();
}

#[test]
fn store_rejected_when_queue_full() {
    init_tracing();
    let queue = SharedQueue::new(1);
    let mut server = Server::bind("127.0.0.1:0", queue.clone(), opts()).unwrap();
    let addr = server.local_addr().unwrap();
    let (stop, shutdown) = bounded::<()>(1);
    let handle = thread::spawn(move || server.serve(&shutdown).unwrap());

    let mut client = client(addr);
    let packet = assemble(&[1, 2], TYPE_COEFFICIENTS).unwrap();
    client.store(&packet).unwrap();
    let zult = client.store(&packet);
    assert!(matches!(zult, Err(downlink::Error::Timeout(_))), "got {zult:?}");
    assert_eq!(queue.len(), 1);

    // connection is still usable
    assert_eq!(client.request().unwrap(), Some(packet));

    drop(client);
    stop.send(()).unwrap();
    let served = handle.join().unwrap();
    assert_eq!(served[0].errors, 1);
}

#[test]
fn telemetry_from_capture_sent_on_connect() {
    init_tracing();
    let queue = SharedQueue::new(16);
    let mut pipeline = Pipeline::new(
        staged(7),
        SoftAccelerator::default(),
        PipelineOpts::builder().total_blocks(7).build(),
    )
    .unwrap();
    let report = pipeline.run(&queue, None).unwrap();

    let mut server = Server::bind("127.0.0.1:0", queue.clone(), opts())
        .unwrap()
        .with_telemetry(report.telemetry_packets().unwrap());
    let addr = server.local_addr().unwrap();
    let (stop, shutdown) = bounded::<()>(1);
    let handle = thread::spawn(move || server.serve(&shutdown).unwrap());

    let mut client = client(addr);
    let ratio = client.receive().unwrap().unwrap();
    assert_eq!(ratio.packet_type(), TYPE_RATIO);
    assert_eq!(ratio, report.telemetry.ratio_packet().unwrap());
    let bandwidth = client.receive().unwrap().unwrap();
    assert_eq!(bandwidth.packet_type(), TYPE_BANDWIDTH);
    assert_eq!(bandwidth, report.telemetry.bandwidth_packet().unwrap());

    // coefficient packets follow only on request
    assert!(client.receive().unwrap().is_none());
    assert_eq!(client.request().unwrap().unwrap().packet_type(), TYPE_COEFFICIENTS);
    assert_eq!(queue.len(), 6);

    drop(client);
    stop.send(()).unwrap();
    let served = handle.join().unwrap();
    assert_eq!(served[0].stats.sent, 3);
}
