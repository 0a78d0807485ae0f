//! Dispatch pipeline: broker deliveries → jobs → parallel fan-out.
//!
//! One ingestion stage pulls deliveries in broker order and parses their
//! routing header. Valid deliveries become [`Job`]s on a bounded queue that
//! `workers` dispatch tasks drain; each task broadcasts through the registry
//! and then acknowledges the delivery. Invalid deliveries are rejected
//! without requeue and never reach the registry.
//!
//! ```text
//! deliveries ─▶ ingestion ─▶ [job queue] ─▶ worker × N ─▶ Registry::broadcast
//!                  │                            │
//!                  └── reject (no requeue)      └── ack
//! ```
//!
//! Delivery order is kept through ingestion only; with more than one worker
//! connections may observe messages out of broker order.

use crate::error::{GatewayError, Result};
use crate::header::{parse_headers, GroupId, RoutingMode};
use crate::registry::Registry;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use lapin::types::FieldTable;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Settles a broker delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    /// Acknowledge the delivery; the broker discards it.
    async fn ack(&self) -> Result<()>;

    /// Reject the delivery without requeue.
    async fn reject(&self) -> Result<()>;
}

/// A broker delivery as seen by the ingestion stage.
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub headers: Option<FieldTable>,
    pub payload: Bytes,
    pub acker: Box<dyn Acknowledger>,
}

/// Ready-to-send unit of work.
pub struct Job {
    pub targets: Vec<GroupId>,
    pub payload: Bytes,
    pub delivery_tag: u64,
    acker: Box<dyn Acknowledger>,
}

impl Job {
    /// Resolve the routing header of `msg`.
    ///
    /// On an unusable header the message is handed back with the reason.
    pub fn from_inbound(
        msg: InboundMessage,
        mode: RoutingMode,
    ) -> std::result::Result<Job, (InboundMessage, String)> {
        match parse_headers(msg.headers.as_ref(), mode).into_targets() {
            Ok(targets) => Ok(Job {
                targets,
                payload: msg.payload,
                delivery_tag: msg.delivery_tag,
                acker: msg.acker,
            }),
            Err(reason) => Err((msg, reason)),
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of parallel dispatch workers.
    pub workers: usize,
    /// Capacity of the internal job queue.
    pub queue_capacity: usize,
    /// Which routing header to read.
    pub routing_mode: RoutingMode,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            routing_mode: RoutingMode::UserIds,
        }
    }
}

/// Totals reported when the pipeline stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Deliveries pulled from the broker.
    pub received: u64,
    /// Deliveries rejected at ingestion.
    pub rejected: u64,
    /// Jobs broadcast and acknowledged by the workers.
    pub dispatched: u64,
}

/// Moves deliveries from the broker stream into the registry.
pub struct Dispatcher {
    registry: Arc<Registry>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, config: DispatchConfig) -> Self {
        Self { registry, config }
    }

    /// Run until shutdown is signalled or the delivery stream ends.
    ///
    /// On exit the job queue is closed and every queued job is broadcast and
    /// acknowledged before this returns.
    pub async fn run<S>(
        &self,
        mut deliveries: S,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<DispatchStats>
    where
        S: Stream<Item = Result<InboundMessage>> + Unpin + Send,
    {
        let workers = self.config.workers.max(1);
        let (job_tx, job_rx) = mpsc::channel::<Job>(self.config.queue_capacity.max(1));
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut tasks = JoinSet::new();
        for worker_id in 0..workers {
            tasks.spawn(dispatch_worker(
                worker_id,
                Arc::clone(&self.registry),
                Arc::clone(&job_rx),
            ));
        }
        info!("Dispatch pipeline running with {} workers", workers);

        let mut stats = DispatchStats::default();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Ingestion received shutdown signal");
                    break;
                }

                next = deliveries.next() => {
                    let msg = match next {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            error!("Delivery stream failed: {}", e);
                            break;
                        }
                        None => {
                            warn!("Delivery stream ended");
                            break;
                        }
                    };

                    stats.received += 1;
                    counter!("gateway_deliveries_total").increment(1);

                    match Job::from_inbound(msg, self.config.routing_mode) {
                        Ok(job) => {
                            debug!(
                                "Queued delivery {} for {} groups",
                                job.delivery_tag,
                                job.targets.len()
                            );
                            if let Err(mpsc::error::SendError(job)) = job_tx.send(job).await {
                                error!(
                                    "All dispatch workers stopped; delivery {} left unacked",
                                    job.delivery_tag
                                );
                                break;
                            }
                        }
                        Err((msg, reason)) => {
                            stats.rejected += 1;
                            counter!("gateway_deliveries_rejected_total").increment(1);
                            warn!("Rejecting delivery {}: {}", msg.delivery_tag, reason);
                            if let Err(e) = msg.acker.reject().await {
                                warn!("Failed to reject delivery {}: {}", msg.delivery_tag, e);
                            }
                        }
                    }
                }
            }
        }

        // Closing the queue lets workers drain what is left and exit.
        drop(job_tx);
        info!("Draining dispatch workers");

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(count) => stats.dispatched += count,
                Err(e) => {
                    error!("Dispatch worker failed: {}", e);
                    failure = Some(GatewayError::Join(e));
                }
            }
        }

        info!(
            "Dispatch pipeline stopped: {} received, {} rejected, {} dispatched",
            stats.received, stats.rejected, stats.dispatched
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }
}

/// Drain jobs until the queue is closed and empty.
async fn dispatch_worker(
    worker_id: usize,
    registry: Arc<Registry>,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
) -> u64 {
    let mut processed = 0;

    loop {
        let job = jobs.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        let report = registry.broadcast(&job.targets, &job.payload).await;
        debug!(
            "Worker {} delivered {} to {} connections ({} dropped)",
            worker_id, job.delivery_tag, report.delivered, report.dropped
        );

        if let Err(e) = job.acker.ack().await {
            counter!("gateway_ack_failures_total").increment(1);
            warn!("Failed to ack delivery {}: {}", job.delivery_tag, e);
        }
        counter!("gateway_jobs_dispatched_total").increment(1);
        processed += 1;
    }

    debug!("Worker {} finished after {} jobs", worker_id, processed);
    processed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{next_connection_id, Connection, ConnectionId};
    use crate::registry::tests::{MockConnection, RecordingBinder};
    use crate::registry::UnbindPolicy;
    use lapin::types::{AMQPValue, LongString, ShortString};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Semaphore;

    type AckLog = Arc<StdMutex<Vec<(u64, &'static str)>>>;

    struct MockAcker {
        tag: u64,
        log: AckLog,
    }

    #[async_trait]
    impl Acknowledger for MockAcker {
        async fn ack(&self) -> Result<()> {
            self.log.lock().unwrap().push((self.tag, "ack"));
            Ok(())
        }

        async fn reject(&self) -> Result<()> {
            self.log.lock().unwrap().push((self.tag, "reject"));
            Ok(())
        }
    }

    /// Connection whose writes wait for a permit.
    struct GatedConnection {
        id: ConnectionId,
        gate: Arc<Semaphore>,
        sent: AtomicUsize,
    }

    #[async_trait]
    impl Connection for GatedConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }

        async fn send(&self, _payload: &Bytes) -> Result<()> {
            self.gate.acquire().await.unwrap().forget();
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) {}

        fn is_open(&self) -> bool {
            true
        }
    }

    fn message(tag: u64, user_ids: Option<&str>, log: &AckLog) -> InboundMessage {
        let headers = user_ids.map(|value| {
            let mut table = FieldTable::default();
            table.insert(
                ShortString::from("UserIDs"),
                AMQPValue::LongString(LongString::from(value)),
            );
            table
        });
        InboundMessage {
            delivery_tag: tag,
            headers,
            payload: Bytes::from(format!("message {}", tag)),
            acker: Box::new(MockAcker {
                tag,
                log: log.clone(),
            }),
        }
    }

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new(
            Arc::new(RecordingBinder::default()),
            UnbindPolicy::Lazy,
        ))
    }

    fn config(workers: usize) -> DispatchConfig {
        DispatchConfig {
            workers,
            queue_capacity: 64,
            routing_mode: RoutingMode::UserIds,
        }
    }

    fn sorted(log: &AckLog) -> Vec<(u64, &'static str)> {
        let mut entries = log.lock().unwrap().clone();
        entries.sort();
        entries
    }

    #[tokio::test]
    async fn test_job_targets_follow_header_order() {
        let log = AckLog::default();
        let job = Job::from_inbound(message(1, Some("3,7,42"), &log), RoutingMode::UserIds)
            .ok()
            .unwrap();
        assert_eq!(
            job.targets,
            vec![GroupId::Id(3), GroupId::Id(7), GroupId::Id(42)]
        );
    }

    #[tokio::test]
    async fn test_fans_out_to_every_target_group() {
        let registry = registry();
        let conns: Vec<_> = (0..3).map(|_| MockConnection::new()).collect();
        for (conn, id) in conns.iter().zip([3u64, 7, 42]) {
            registry.add_connection(GroupId::Id(id), conn.clone()).await;
        }

        let log = AckLog::default();
        let deliveries = futures::stream::iter(vec![Ok(message(1, Some("3,7,42"), &log))]);
        let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let stats = Dispatcher::new(registry, config(2))
            .run(deliveries, shutdown_rx)
            .await
            .unwrap();

        assert_eq!(
            stats,
            DispatchStats {
                received: 1,
                rejected: 0,
                dispatched: 1
            }
        );
        for conn in &conns {
            assert_eq!(conn.received(), vec![Bytes::from("message 1")]);
        }
        assert_eq!(sorted(&log), vec![(1, "ack")]);
    }

    #[tokio::test]
    async fn test_poison_messages_are_rejected() {
        let registry = registry();
        let conn = MockConnection::new();
        registry.add_connection(GroupId::Id(3), conn.clone()).await;

        let log = AckLog::default();
        let deliveries = futures::stream::iter(vec![
            Ok(message(1, Some("3"), &log)),
            Ok(message(2, Some("3,x,9"), &log)),
            Ok(message(3, None, &log)),
            Ok(message(4, Some("3"), &log)),
        ]);
        let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let stats = Dispatcher::new(registry, config(1))
            .run(deliveries, shutdown_rx)
            .await
            .unwrap();

        assert_eq!(
            stats,
            DispatchStats {
                received: 4,
                rejected: 2,
                dispatched: 2
            }
        );
        assert_eq!(
            sorted(&log),
            vec![(1, "ack"), (2, "reject"), (3, "reject"), (4, "ack")]
        );
        assert_eq!(
            conn.received(),
            vec![Bytes::from("message 1"), Bytes::from("message 4")]
        );
    }

    #[tokio::test]
    async fn test_unknown_group_is_still_acked() {
        let log = AckLog::default();
        let deliveries = futures::stream::iter(vec![Ok(message(9, Some("404"), &log))]);
        let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let stats = Dispatcher::new(registry(), config(1))
            .run(deliveries, shutdown_rx)
            .await
            .unwrap();

        assert_eq!(stats.dispatched, 1);
        assert_eq!(sorted(&log), vec![(9, "ack")]);
    }

    #[tokio::test]
    async fn test_parallel_workers_deliver_everything() {
        let registry = registry();
        let conn = MockConnection::new();
        registry.add_connection(GroupId::Id(1), conn.clone()).await;

        let log = AckLog::default();
        let deliveries = futures::stream::iter(
            (1..=20)
                .map(|tag| Ok(message(tag, Some("1"), &log)))
                .collect::<Vec<_>>(),
        );
        let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let stats = Dispatcher::new(registry, config(4))
            .run(deliveries, shutdown_rx)
            .await
            .unwrap();

        assert_eq!(stats.dispatched, 20);
        assert_eq!(conn.received().len(), 20);
        assert_eq!(log.lock().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_jobs() {
        const QUEUED: usize = 5;

        let registry = registry();
        let gate = Arc::new(Semaphore::new(0));
        let conn = Arc::new(GatedConnection {
            id: next_connection_id(),
            gate: gate.clone(),
            sent: AtomicUsize::new(0),
        });
        registry.add_connection(GroupId::Id(1), conn.clone()).await;

        let log = AckLog::default();
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let deliveries = futures::stream::iter(
            (1..=QUEUED as u64)
                .map(|tag| Ok(message(tag, Some("1"), &log)))
                .collect::<Vec<_>>(),
        )
        .chain(futures::stream::pending())
        .inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let dispatcher = Dispatcher::new(registry, config(1));
        let handle = tokio::spawn(async move { dispatcher.run(deliveries, shutdown_rx).await });

        // The single worker is parked on the first write; the rest queue up.
        while pulled.load(Ordering::SeqCst) < QUEUED {
            tokio::task::yield_now().await;
        }
        shutdown_tx.send(()).await.unwrap();
        gate.add_permits(QUEUED);

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.dispatched, QUEUED as u64);
        assert_eq!(conn.sent.load(Ordering::SeqCst), QUEUED);
        assert_eq!(
            sorted(&log),
            (1..=QUEUED as u64).map(|tag| (tag, "ack")).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_stream_error_stops_ingestion() {
        let log = AckLog::default();
        let deliveries = futures::stream::iter(vec![
            Ok(message(1, Some("1"), &log)),
            Err(GatewayError::ConnectionClosed),
            Ok(message(2, Some("1"), &log)),
        ]);
        let (_shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let stats = Dispatcher::new(registry(), config(1))
            .run(deliveries, shutdown_rx)
            .await
            .unwrap();

        assert_eq!(stats.received, 1);
        assert_eq!(sorted(&log), vec![(1, "ack")]);
    }
}
