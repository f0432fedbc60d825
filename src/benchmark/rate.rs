//! Open-loop rate benchmark.
//!
//! Sending and receiving are decoupled. Send workers each own a fixed team
//! of connections and push one batch per member on every tick; a dispatch
//! task per connection counts echoes that match the payload. A member whose
//! backlog has reached [`defaults::BACKPRESSURE_BATCHES`] batches is skipped
//! until replies catch up.
//!
//! When the duration elapses the done signal fires: send workers stop at
//! their next tick or limiter wait, the receive handler stops counting, and
//! dispatch tasks are aborted once every worker has returned. Replies still
//! in flight at that point are never counted.

use super::{begin_sampling, resolve_subject, BenchError, BenchmarkConfig};
use crate::{
    cli::BenchMode,
    defaults,
    metrics::{per_second, SessionCounters},
    monitor::PidResolver,
    pool::ConnectionPool,
    rate::{done_signal, DoneSignal, Limiter, Pacer},
    results::{RateSummary, Report, ReportDetails},
    ws::{build_batch, encode, Batch, Connection, MessageHandler, MessageKind},
};
use anyhow::{Context, Result};
use rand::RngCore;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Counts replies that carry exactly the payload that was sent.
struct EchoMatcher {
    payload: Arc<[u8]>,
    counters: Arc<SessionCounters>,
    done: DoneSignal,
}

impl MessageHandler for EchoMatcher {
    fn on_message(&self, conn: &Connection, kind: MessageKind, payload: &[u8]) {
        if self.done.is_done() {
            return;
        }
        if kind == MessageKind::Binary && payload == &self.payload[..] {
            conn.record_received(1);
            self.counters.record_recv(1, payload.len() as u64);
        }
    }
}

/// Whether `conn` may take another batch of `count` messages.
pub(crate) fn has_capacity(conn: &Connection, count: u64) -> bool {
    conn.outstanding() + count < count * defaults::BACKPRESSURE_BATCHES
}

async fn drive_team(
    team: Vec<Arc<Connection>>,
    batch: Batch,
    limiter: Limiter,
    counters: Arc<SessionCounters>,
    mut done: DoneSignal,
) {
    let count = batch.count() as u64;
    let mut pacer = Pacer::new(batch.tick_rate());

    loop {
        let ticked = tokio::select! {
            _ = done.wait() => false,
            _ = pacer.tick() => true,
        };
        if !ticked {
            return;
        }

        for conn in &team {
            if done.is_done() {
                return;
            }
            if !has_capacity(conn, count) {
                continue;
            }
            if !limiter.acquire(batch.count() as u32, &mut done).await {
                return;
            }
            match tokio::time::timeout(defaults::WRITE_TIMEOUT, conn.write(batch.bytes())).await {
                Ok(Ok(())) => {
                    conn.record_sent(count);
                    counters.record_send(count, batch.payload_bytes());
                }
                Ok(Err(e)) => debug!("Batch write on connection {} failed: {}", conn.id(), e),
                Err(_) => debug!("Batch write on connection {} timed out", conn.id()),
            }
        }
    }
}

/// Open-loop session: fixed-rate batched sends for a fixed duration.
pub struct RateBenchmark {
    config: BenchmarkConfig,
    pool: ConnectionPool,
    resolver: Box<dyn PidResolver>,
}

impl RateBenchmark {
    pub fn new(config: BenchmarkConfig, pool: ConnectionPool) -> Self {
        let resolver = config.resolver();
        Self {
            config,
            pool,
            resolver,
        }
    }

    pub fn with_resolver(mut self, resolver: Box<dyn PidResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Build the batch for the configured payload and rate.
    fn batch(&self, payload: &[u8]) -> Result<Batch, BenchError> {
        let frame = encode(MessageKind::Binary, payload);
        let max_bytes = if frame.len() > defaults::BATCH_MAX_BYTES {
            warn!(
                "Frame of {} bytes exceeds the {} byte batch ceiling; sending one frame per batch",
                frame.len(),
                defaults::BATCH_MAX_BYTES
            );
            frame.len()
        } else {
            defaults::BATCH_MAX_BYTES
        };
        Ok(build_batch(&frame, self.config.send_rate, max_bytes)?)
    }

    pub async fn run(self) -> Result<Report> {
        if self.pool.is_empty() {
            return Err(BenchError::NoConnections.into());
        }
        let config = &self.config;
        let run_id = Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now();
        let connections = self.pool.len();
        let concurrency = config.effective_concurrency(connections);

        let mut payload = vec![0u8; config.payload];
        rand::thread_rng().fill_bytes(&mut payload);
        let batch = self.batch(&payload)?;
        let (pid, mut sampler) = resolve_subject(config, self.resolver.as_ref())?;
        info!(
            "Rate batch: {} messages, {} bytes, {} ticks/s",
            batch.count(),
            batch.len(),
            batch.tick_rate()
        );

        let counters = Arc::new(SessionCounters::new());
        let (trigger, done) = done_signal();
        let handler: Arc<dyn MessageHandler> = Arc::new(EchoMatcher {
            payload: payload.into(),
            counters: Arc::clone(&counters),
            done: done.clone(),
        });
        let dispatchers: Vec<_> = self
            .pool
            .connections()
            .iter()
            .map(|conn| conn.dispatch(Arc::clone(&handler)))
            .collect();

        begin_sampling(sampler.as_mut(), config.sample_interval).await?;

        info!("Rate for {:?} ...", config.duration);
        let limiter = Limiter::new(config.limit);
        let start = Instant::now();
        let mut workers = JoinSet::new();
        for team in self.pool.teams(concurrency) {
            workers.spawn(drive_team(
                team,
                batch.clone(),
                limiter.clone(),
                Arc::clone(&counters),
                done.clone(),
            ));
        }

        let duration = config.duration;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trigger.fire();
        });

        while let Some(joined) = workers.join_next().await {
            joined.context("Rate worker panicked")?;
        }
        let elapsed = start.elapsed();
        let _ = timer.await;
        for dispatcher in dispatchers {
            dispatcher.abort();
        }

        let snapshot = counters.snapshot();
        info!(
            "Rate for {:?} done: {} sent, {} received",
            config.duration, snapshot.send_count, snapshot.recv_count
        );
        let resources = sampler.stop().await;

        Ok(Report {
            run_id,
            framework: config.framework.clone(),
            mode: BenchMode::Rate,
            host: config.primary_host().to_string(),
            started_at,
            connections,
            concurrency,
            payload: config.payload,
            total: snapshot.send_count,
            elapsed_ns: u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
            server_pid: pid,
            resources,
            details: ReportDetails::Rate(RateSummary {
                duration_ns: u64::try_from(config.duration.as_nanos()).unwrap_or(u64::MAX),
                send_rate: config.send_rate,
                limit: config.limit,
                batch_count: batch.count(),
                batch_bytes: batch.len(),
                tick_rate: batch.tick_rate(),
                counters: snapshot,
                send_per_sec: per_second(snapshot.send_count, elapsed),
                recv_per_sec: per_second(snapshot.recv_count, elapsed),
            }),
        })
    }
}
