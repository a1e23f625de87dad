//! Concurrent fusion runtime
//!
//! The runtime is a handful of threads around one [`FusionContext`]:
//!
//! - ingestion (owned by the transport): decodes samples and posts them to the GPS and IMU
//!   mailboxes, capturing the reference fix on the first valid GPS sample;
//! - the filter loop: drains the sensor mailboxes, steps the [`FusionFilter`] and posts the
//!   estimate;
//! - the publish loop: once a reference exists, drains the estimate mailbox, translates it and
//!   hands the result to an [`EstimateSink`].
//!
//! Locks are held per mailbox and only for copies, never across a computation or a blocking
//! call. Both loops wake on absolute deadlines and exit at their wake point once the shared
//! [`ShutdownSignal`] is triggered.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::config::{ConfigError, FusionConfig};
use crate::fusion::{EstimateSnapshot, FusionFilter};
use crate::kalman::FilterError;
use crate::measurements::{GpsFix, is_valid_fix};
use crate::messages::{GpsSample, ImuSample};
use crate::navigation::{NavigationSolution, Translator};
use crate::shared::{Mailbox, ReferenceFix};
use crate::ticker::{ShutdownSignal, Ticker};

/// Failure of an output channel.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to encode estimate: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error("failed to spawn loop thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Destination of the published navigation solutions.
pub trait EstimateSink: Send {
    fn publish(&mut self, solution: &NavigationSolution) -> Result<(), SinkError>;
}

impl<F> EstimateSink for F
where
    F: FnMut(&NavigationSolution) -> Result<(), SinkError> + Send,
{
    fn publish(&mut self, solution: &NavigationSolution) -> Result<(), SinkError> {
        self(solution)
    }
}

/// Everything the ingestion threads and both loops share.
#[derive(Debug, Default)]
pub struct FusionContext {
    pub gps: Mailbox<GpsSample>,
    pub imu: Mailbox<ImuSample>,
    pub estimate: Mailbox<EstimateSnapshot>,
    pub reference: ReferenceFix,
    pub shutdown: ShutdownSignal,
    min_fix_type: i32,
}

impl FusionContext {
    pub fn new(min_fix_type: i32) -> Self {
        FusionContext {
            min_fix_type,
            ..FusionContext::default()
        }
    }

    /// Accept a decoded GPS sample. Invalid samples are dropped and leave the mailbox as is.
    ///
    /// # Returns
    /// Whether the sample was posted.
    pub fn ingest_gps(&self, sample: GpsSample) -> bool {
        if !is_valid_fix(&sample, self.min_fix_type) {
            log::warn!(
                "discarding GPS sample (complete: {}, fix type: {:?})",
                sample.is_complete(),
                sample.fix_type
            );
            return false;
        }
        self.reference.capture(GpsFix::from_sample(&sample));
        self.gps.post(sample);
        true
    }

    /// Accept a decoded IMU sample. Non-finite samples are dropped.
    pub fn ingest_imu(&self, sample: ImuSample) -> bool {
        if !sample.is_complete() {
            log::warn!("discarding non-finite IMU sample");
            return false;
        }
        self.imu.post(sample);
        true
    }

    /// Decode and accept a GPS payload; malformed payloads are logged and dropped.
    pub fn ingest_gps_payload(&self, payload: &[u8]) -> bool {
        match GpsSample::from_json(payload) {
            Ok(sample) => self.ingest_gps(sample),
            Err(e) => {
                log::warn!("discarding GPS payload: {e}");
                false
            }
        }
    }

    /// Decode and accept an IMU payload; malformed payloads are logged and dropped.
    pub fn ingest_imu_payload(&self, payload: &[u8]) -> bool {
        match ImuSample::from_json(payload) {
            Ok(sample) => self.ingest_imu(sample),
            Err(e) => {
                log::warn!("discarding IMU payload: {e}");
                false
            }
        }
    }
}

/// One filter-loop tick: drain, step, post.
pub fn filter_tick(context: &FusionContext, filter: &mut FusionFilter) -> EstimateSnapshot {
    let gps = context.gps.take();
    let imu = context.imu.take();
    let snapshot = filter.step(&gps, &imu, context.reference.get());
    context.estimate.post(snapshot);
    let report = filter.last_report();
    log::debug!(
        "filter tick: imu {}, gps {}, state {:?}",
        report.used_imu,
        report.corrected,
        snapshot.state.as_slice()
    );
    snapshot
}

/// One publish-loop tick. Returns the published solution, or `None` while there is no
/// reference fix or no estimate yet.
pub fn publish_tick<S: EstimateSink + ?Sized>(
    context: &FusionContext,
    translator: &Translator,
    sink: &mut S,
) -> Option<NavigationSolution> {
    let reference = context.reference.get()?;
    let estimate = context.estimate.take().value?;
    let solution = translator.translate(&estimate, reference);
    if let Err(e) = sink.publish(&solution) {
        log::error!("failed to publish estimate: {e}");
    }
    Some(solution)
}

/// Start the filter loop on its own thread. The handle yields the number of ticks run.
pub fn spawn_filter_loop(
    context: Arc<FusionContext>,
    mut filter: FusionFilter,
    period: Duration,
) -> io::Result<JoinHandle<u64>> {
    thread::Builder::new()
        .name("sailtrack-filter".into())
        .spawn(move || {
            log::info!("filter loop started, period {period:?}");
            let ticks = Ticker::new(period).run(&context.shutdown, |_| {
                filter_tick(&context, &mut filter);
            });
            log::info!("filter loop stopped after {ticks} ticks");
            ticks
        })
}

/// Start the publish loop on its own thread. The handle yields the number of ticks run.
pub fn spawn_publish_loop<S>(
    context: Arc<FusionContext>,
    translator: Translator,
    mut sink: S,
    period: Duration,
) -> io::Result<JoinHandle<u64>>
where
    S: EstimateSink + 'static,
{
    thread::Builder::new()
        .name("sailtrack-publish".into())
        .spawn(move || {
            log::info!("publish loop started, period {period:?}");
            let ticks = Ticker::new(period).run(&context.shutdown, |_| {
                publish_tick(&context, &translator, &mut sink);
            });
            log::info!("publish loop stopped after {ticks} ticks");
            ticks
        })
}

/// Running filter and publish loops.
#[derive(Debug)]
pub struct FusionRuntime {
    context: Arc<FusionContext>,
    filter_loop: JoinHandle<u64>,
    publish_loop: JoinHandle<u64>,
}

impl FusionRuntime {
    /// Validate `config`, build the filter and start both loops.
    pub fn start<S>(config: &FusionConfig, sink: S) -> Result<Self, RuntimeError>
    where
        S: EstimateSink + 'static,
    {
        config.validate()?;
        let context = Arc::new(FusionContext::new(config.filter.min_fix_type));
        let filter = FusionFilter::from_config(&config.filter)?;
        let filter_loop =
            spawn_filter_loop(Arc::clone(&context), filter, config.filter.sample_time())?;
        let publish_loop = match spawn_publish_loop(
            Arc::clone(&context),
            Translator::from_config(&config.publish),
            sink,
            config.publish.interval(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                context.shutdown.trigger();
                let _ = filter_loop.join();
                return Err(e.into());
            }
        };
        Ok(FusionRuntime {
            context,
            filter_loop,
            publish_loop,
        })
    }

    /// Shared context for the ingestion side.
    pub fn context(&self) -> &Arc<FusionContext> {
        &self.context
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.context.shutdown.clone()
    }

    /// Trigger shutdown and wait for both loops. Returns their tick counts.
    pub fn shutdown(self) -> (u64, u64) {
        self.context.shutdown.trigger();
        self.join()
    }

    /// Wait for both loops to exit, returning their tick counts. A panicked loop counts zero.
    pub fn join(self) -> (u64, u64) {
        let filter_ticks = self.filter_loop.join().unwrap_or_else(|_| {
            log::error!("filter loop panicked");
            0
        });
        let publish_ticks = self.publish_loop.join().unwrap_or_else(|_| {
            log::error!("publish loop panicked");
            0
        });
        (filter_ticks, publish_ticks)
    }
}
