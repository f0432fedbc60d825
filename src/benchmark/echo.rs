//! Closed-loop echo benchmark.
//!
//! Every call walks `checkout -> send -> await reply -> verify -> return`.
//! Calls are handed out from one shared counter, so the workers together
//! issue exactly the requested number no matter how they interleave.

use super::{begin_sampling, resolve_subject, BenchError, BenchmarkConfig};
use crate::{
    cli::BenchMode,
    defaults,
    metrics::{CallStats, Calculator},
    monitor::PidResolver,
    pool::{BufferPool, CheckoutQueue, ConnectionPool},
    rate::Limiter,
    results::{EchoSummary, Report, ReportDetails},
    ws::{encode, CallError, Connection, Frame, MessageKind},
};
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info};
use uuid::Uuid;

/// One pre-generated payload and its encoded frame
struct Variant {
    payload: Vec<u8>,
    frame: Frame,
}

/// State shared by every worker of one session
struct Shared {
    queue: CheckoutQueue,
    variants: Vec<Variant>,
    buffers: BufferPool,
    limiter: Limiter,
    call_timeout: Duration,
}

impl Shared {
    fn new(pool: &ConnectionPool, config: &BenchmarkConfig, concurrency: usize) -> Self {
        let count = defaults::PAYLOAD_VARIANTS
            .min(defaults::PAYLOAD_VARIANT_BUDGET / config.payload.max(1))
            .max(1);
        let mut rng = rand::thread_rng();
        let variants = (0..count)
            .map(|_| {
                let mut payload = vec![0u8; config.payload];
                rng.fill_bytes(&mut payload);
                let frame = encode(MessageKind::Binary, &payload);
                Variant { payload, frame }
            })
            .collect();

        Self {
            queue: pool.checkout_queue(config.overlap),
            variants,
            buffers: BufferPool::new(concurrency, config.payload),
            limiter: Limiter::new(config.limit),
            call_timeout: config.call_timeout,
        }
    }

    /// Run `total` calls over `concurrency` workers and merge their tallies.
    async fn drive(self: &Arc<Self>, concurrency: usize, total: u64) -> Result<CallStats> {
        let issued = Arc::new(AtomicU64::new(0));
        let per_worker = (total as usize / concurrency.max(1)) + 1;

        let mut workers = JoinSet::new();
        for _ in 0..concurrency {
            let shared = Arc::clone(self);
            let issued = Arc::clone(&issued);
            workers.spawn(async move { shared.worker(&issued, total, per_worker).await });
        }

        let mut stats = CallStats::new(total as usize)?;
        while let Some(joined) = workers.join_next().await {
            stats.merge(joined.context("Echo worker panicked")??)?;
        }
        Ok(stats)
    }

    async fn worker(&self, issued: &AtomicU64, total: u64, capacity: usize) -> Result<CallStats> {
        let mut stats = CallStats::new(capacity)?;
        let mut rng = StdRng::from_entropy();

        while issued.fetch_add(1, Ordering::Relaxed) < total {
            let conn = self.queue.checkout().await?;
            let mut buf = self.buffers.get();

            // A reply left over from a timed-out call must not be taken for
            // this one; drain it outside the measured window.
            if let Err(e) = settle(&conn, &mut buf, self.call_timeout).await {
                debug!("Connection {} not ready: {}", conn.id(), e);
                stats.record_failure();
                continue;
            }
            self.limiter.wait(1).await;

            let variant = &self.variants[rng.gen_range(0..self.variants.len())];
            let start = Instant::now();
            let outcome = call(&conn, variant, &mut buf, self.call_timeout).await;
            let elapsed = start.elapsed();

            match outcome {
                Ok(()) => stats.record_success(elapsed)?,
                Err(e) => {
                    debug!("Call on connection {} failed: {}", conn.id(), e);
                    stats.record_failure();
                }
            }
        }
        Ok(stats)
    }
}

/// Discard replies owed to earlier abandoned calls on `conn`.
async fn settle(conn: &Connection, buf: &mut Vec<u8>, timeout: Duration) -> Result<(), CallError> {
    let discarded = tokio::time::timeout(timeout, conn.discard_stale(buf))
        .await
        .map_err(|_| CallError::Timeout)??;
    if discarded > 0 {
        debug!("Discarded {} stale replies on connection {}", discarded, conn.id());
    }
    Ok(())
}

/// One verified round trip
async fn call(
    conn: &Connection,
    variant: &Variant,
    buf: &mut Vec<u8>,
    timeout: Duration,
) -> Result<(), CallError> {
    let kind = tokio::time::timeout(timeout, conn.round_trip(variant.frame.as_bytes(), buf))
        .await
        .map_err(|_| CallError::Timeout)??;

    if kind != MessageKind::Binary {
        return Err(CallError::UnexpectedKind(kind));
    }
    if buf.as_slice() != variant.payload.as_slice() {
        return Err(CallError::PayloadMismatch {
            expected: variant.payload.len(),
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Closed-loop session: a fixed number of verified round trips.
pub struct EchoBenchmark {
    config: BenchmarkConfig,
    pool: ConnectionPool,
    resolver: Box<dyn PidResolver>,
}

impl EchoBenchmark {
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

    pub async fn run(self) -> Result<Report> {
        if self.pool.is_empty() {
            return Err(BenchError::NoConnections.into());
        }
        let config = &self.config;
        let run_id = Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now();
        let connections = self.pool.len();
        let concurrency = config.effective_concurrency(connections);
        let warmup = config.warmup_for(connections);

        let (pid, mut sampler) = resolve_subject(config, self.resolver.as_ref())?;
        let shared = Arc::new(Shared::new(&self.pool, config, concurrency));

        info!("Echo warmup for {} calls ...", warmup);
        let warm = shared.drive(concurrency, warmup).await?;
        info!(
            "Echo warmup for {} calls done ({} failed)",
            warmup, warm.failed
        );

        begin_sampling(sampler.as_mut(), config.sample_interval).await?;

        info!("Echo for {} calls ...", config.total);
        let start = Instant::now();
        let stats = shared.drive(concurrency, config.total).await?;
        let elapsed = start.elapsed();
        info!(
            "Echo for {} calls done: {} succeeded, {} failed",
            config.total, stats.success, stats.failed
        );

        let resources = sampler.stop().await;
        let calculator = Calculator::new(stats, elapsed, &config.percentiles);

        Ok(Report {
            run_id,
            framework: config.framework.clone(),
            mode: BenchMode::Echo,
            host: config.primary_host().to_string(),
            started_at,
            connections,
            concurrency,
            payload: config.payload,
            total: config.total,
            elapsed_ns: calculator.elapsed_ns,
            server_pid: pid,
            resources,
            details: ReportDetails::Echo(EchoSummary::new(calculator, warmup)),
        })
    }
}
