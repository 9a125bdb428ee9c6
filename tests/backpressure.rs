//! Continuous polling under downstream backpressure: a full parser queue
//! blocks the submission side, which stops the poll loop from racing ahead;
//! cancellation still gets the loop out within one timeout period.

mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use acqsrv::config::spec::{PollMode, ReadBlock};
use acqsrv::core::dispatch::spawn_dispatcher;
use acqsrv::core::events::pipeline;
use acqsrv::core::poller::{spawn_poller, PollerCtx};
use acqsrv::core::Connection;

use support::{device, tcp_connection, uint16_param, UpstreamDevice};

#[tokio::test]
async fn test_full_parser_queue_throttles_continuous_polling() {
    let upstream = UpstreamDevice::start().await;
    upstream.set_register(0, 1);

    let dev = Arc::new(device(
        "d1",
        PollMode::Continuous,
        ReadBlock { start: 0, count: 1 },
        vec![uint16_param("p", 0, false)],
    ));
    let spec = Arc::new(tcp_connection("c1", upstream.port(), vec![]));

    let connection = Arc::new(Connection::new(spec.clone()));
    let shutdown = CancellationToken::new();
    let (dispatcher, dispatcher_task) = spawn_dispatcher(connection, shutdown.clone());

    // Parser queue of one, and nobody consuming it: the consumer is stalled
    let (tx, rx) = pipeline(1, 4);

    let poller_task = spawn_poller(PollerCtx {
        connection: spec,
        device: dev,
        dispatcher,
        acquired_tx: tx.acquired.clone(),
        slave: None,
        shutdown: shutdown.clone(),
    })
    .expect("continuous mode spawns a task");

    // One read fills the queue, the second read's submission blocks; after
    // that the loop cannot progress
    tokio::time::sleep(Duration::from_millis(400)).await;
    let settled = upstream.request_count();
    assert!(
        (1..=2).contains(&settled),
        "expected the loop to stall after at most two reads, saw {settled}"
    );

    // Still stalled: no further reads arrive while the consumer is stuck
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(upstream.request_count(), settled);

    // Cancellation frees the blocked submission; the loop exits well within
    // one connection timeout
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), poller_task)
        .await
        .expect("poller did not exit within the timeout budget")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), dispatcher_task)
        .await
        .expect("dispatcher did not exit")
        .unwrap();

    drop(rx);
}

#[tokio::test]
async fn test_periodic_ticks_coalesce_while_read_in_flight() {
    let upstream = UpstreamDevice::start().await;
    upstream.set_register(0, 1);
    // Each response takes three poll intervals
    upstream.set_delay(Duration::from_millis(600));

    let dev = Arc::new(device(
        "d1",
        PollMode::Periodic,
        ReadBlock { start: 0, count: 1 },
        vec![uint16_param("p", 0, false)],
    ));
    let mut conn = tcp_connection("c1", upstream.port(), vec![]);
    conn.poll_interval = Duration::from_millis(200);
    let spec = Arc::new(conn);

    let connection = Arc::new(Connection::new(spec.clone()));
    let shutdown = CancellationToken::new();
    let (dispatcher, _dispatcher_task) = spawn_dispatcher(connection, shutdown.clone());

    let (tx, mut rx) = pipeline(16, 16);
    let _poller = spawn_poller(PollerCtx {
        connection: spec,
        device: dev,
        dispatcher,
        acquired_tx: tx.acquired.clone(),
        slave: None,
        shutdown: shutdown.clone(),
    });

    // Drain acquisitions so the pipeline never blocks here
    tokio::spawn(async move { while rx.acquired.recv().await.is_some() {} });

    // ~1.6 s of wall clock at a 200 ms interval is eight ticks; with 600 ms
    // responses and tick coalescing only two or three reads can complete
    tokio::time::sleep(Duration::from_millis(1700)).await;
    let count = upstream.request_count();
    assert!(
        (2..=3).contains(&count),
        "late ticks must be dropped, not queued; saw {count} reads"
    );

    shutdown.cancel();
}
