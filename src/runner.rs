//! Calibration runner.
//!
//! The [`Bench`] owns the three instrument connections for the whole run.
//! [`calibrate`] opens it, runs the sweep, and restores every instrument to
//! its idle state on the way out, whether the run succeeded or not.

use crate::aggregate::{aggregate, SampleRow};
use crate::config::Settings;
use crate::error::AppResult;
use crate::instrument::reference::ReferenceMeter;
use crate::instrument::scanner::ScannerMeter;
use crate::instrument::source::{CurrentSource, Polarity};
use crate::instrument::InstrumentChannel;
use crate::measurement::{MeasurementSpec, RangeRequest};
use crate::range::RangePolicy;
use crate::sampler::{SyncSample, SynchronizedSampler};
use crate::storage::{format_decimal, format_optional, ResultTable, RowSink};
use crate::sweep::Sweep;
use tracing::{error, info, warn};

/// The instruments of one run.
pub struct Bench {
    pub source: CurrentSource,
    pub reference: ReferenceMeter,
    pub scanner: ScannerMeter,
}

fn reference_meter(settings: &Settings, channel: InstrumentChannel) -> ReferenceMeter {
    let m = &settings.measurement;
    ReferenceMeter::new(channel, m.reference_function, settings.reference.nplc_max)
        .with_auto_zero(m.auto_zero)
        .with_display_off(m.display_off)
}

fn scanner_meter(settings: &Settings, channel: InstrumentChannel) -> ScannerMeter {
    let m = &settings.measurement;
    ScannerMeter::new(channel, settings.scanner.nplc_max)
        .with_auto_zero(m.auto_zero)
        .with_display_off(m.display_off)
}

impl Bench {
    /// Wrap connected channels, configured from `settings`.
    pub fn from_channels(
        settings: &Settings,
        source: InstrumentChannel,
        reference: InstrumentChannel,
        scanner: InstrumentChannel,
    ) -> Self {
        Self {
            source: CurrentSource::new(source),
            reference: reference_meter(settings, reference),
            scanner: scanner_meter(settings, scanner),
        }
    }

    /// Open all three transports. Channels opened before a failure are
    /// closed again.
    pub async fn connect(settings: &Settings) -> AppResult<Self> {
        info!("Opening current source");
        let mut source = InstrumentChannel::open("source", &settings.source.transport).await?;

        info!("Opening reference meter");
        let reference_transport = settings.meter_transport(&settings.reference);
        let mut reference = match InstrumentChannel::open("reference", &reference_transport).await
        {
            Ok(channel) => channel,
            Err(e) => {
                source.close().await;
                return Err(e);
            }
        };

        info!("Opening scanner meter");
        let scanner_transport = settings.meter_transport(&settings.scanner);
        let scanner = match InstrumentChannel::open("scanner", &scanner_transport).await {
            Ok(channel) => channel,
            Err(e) => {
                source.close().await;
                reference.close().await;
                return Err(e);
            }
        };

        Ok(Self::from_channels(settings, source, reference, scanner))
    }

    /// Identity checks and base configuration, in bench order.
    pub async fn initialise(&mut self, settings: &Settings) -> AppResult<()> {
        self.source
            .init(&settings.source.expected_identity)
            .await?;
        self.reference
            .init(&settings.reference.expected_identity)
            .await?;
        self.scanner
            .init(
                &settings.scanner.expected_identity,
                &settings.measurement.channels,
            )
            .await?;
        info!("Init OK");
        Ok(())
    }

    /// Idle every instrument and close its transport.
    ///
    /// All three are attempted even if one fails; the first failure is
    /// returned.
    pub async fn release(&mut self) -> AppResult<()> {
        let results = [
            self.source.idle().await,
            self.reference.idle().await,
            self.scanner.idle().await,
        ];
        self.source.close().await;
        self.reference.close().await;
        self.scanner.close().await;

        let mut first = None;
        for result in results {
            if let Err(e) = result {
                warn!("Idle restore failed: {}", e);
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Sweep loop over an initialised bench.
pub struct CalibrationRunner<'a> {
    bench: &'a mut Bench,
    settings: &'a Settings,
    policy: RangePolicy,
    previous: Option<f64>,
}

impl<'a> CalibrationRunner<'a> {
    pub fn new(bench: &'a mut Bench, settings: &'a Settings) -> Self {
        Self {
            bench,
            settings,
            policy: settings.reference_range_policy(),
            previous: None,
        }
    }

    /// Visit every stimulus in sweep order and hand each row to `sink`.
    pub async fn run(&mut self, sweep: &Sweep, sink: &mut dyn RowSink) -> AppResult<usize> {
        info!("Measuring over {} values", sweep.len());
        self.bench.source.output_on().await?;
        // constant-current mode needs a moment to engage
        tokio::time::sleep(self.settings.output_on_settle()).await;

        let total = sweep.len();
        for (index, value) in sweep.iter().enumerate() {
            info!("{:3}/{:3}: {}", index, total, format_decimal(value));
            self.apply_stimulus(value).await?;
            let row = self.measure_row(index, value).await?;
            sink.write_row(&row).await?;
        }
        Ok(total)
    }

    /// Program a signed stimulus.
    ///
    /// The polarity relay switches on the first value and on every sign
    /// change; that costs the extra polarity settle before the magnitude is
    /// applied.
    pub async fn apply_stimulus(&mut self, value: f64) -> AppResult<()> {
        let polarity = Polarity::of(value);
        let switch = self
            .previous
            .map_or(true, |previous| Polarity::of(previous) != polarity);

        let source = &mut self.bench.source;
        if switch {
            source.set_polarity(polarity).await?;
            tokio::time::sleep(self.settings.polarity_settle()).await;
        }
        source.set_magnitude(value).await?;
        source.check_errors("stimulus").await?;
        tokio::time::sleep(self.settings.settle()).await;

        self.previous = Some(value);
        Ok(())
    }

    /// Sample every configured channel at the current stimulus.
    pub async fn measure_row(&mut self, index: usize, value: f64) -> AppResult<SampleRow> {
        let request = self.policy.request_for(value);
        let mut sampler = SynchronizedSampler::new(
            &mut self.bench.reference,
            &mut self.bench.scanner,
            self.settings.measurement.nplc,
        );
        let samples = sampler
            .sample_level(&self.settings.measurement.channels, request)
            .await?;
        Ok(aggregate(index, value, &samples))
    }
}

/// Initialise the bench, run the sweep into the output table.
///
/// The table is only created once every instrument passed its checks, so a
/// failed initialisation leaves no file behind.
pub async fn calibrate_on(
    bench: &mut Bench,
    settings: &Settings,
    sweep: &Sweep,
) -> AppResult<usize> {
    bench.initialise(settings).await?;
    let mut table = ResultTable::create(&settings.output.path, &settings.measurement.channels)?;
    let rows = CalibrationRunner::new(bench, settings)
        .run(sweep, &mut table)
        .await?;
    table.finish().await?;
    Ok(rows)
}

/// Full run: connect, calibrate, release.
pub async fn calibrate(settings: &Settings, sweep: &Sweep) -> AppResult<usize> {
    let mut bench = Bench::connect(settings).await?;
    let outcome = calibrate_on(&mut bench, settings, sweep).await;
    if let Err(e) = &outcome {
        error!("Run aborted: {}", e);
    }
    let released = bench.release().await;
    let rows = outcome?;
    released?;
    Ok(rows)
}

/// Repeated front-panel samples against the reference at fixed ranges.
///
/// Each iteration reuses the ranges the previous one reported. Both readings
/// and their difference are logged.
pub async fn sync_check(
    reference: &mut ReferenceMeter,
    scanner: &mut ScannerMeter,
    nplc: u32,
    count: usize,
    range: f64,
) -> AppResult<Vec<SyncSample>> {
    let mut sampler = SynchronizedSampler::new(reference, scanner, nplc);
    let mut reference_range = range;
    let mut target_range = range;
    let mut samples = Vec::with_capacity(count);

    for _ in 0..count {
        let sample = sampler
            .sample(
                RangeRequest::Fixed(reference_range),
                MeasurementSpec::front_panel(RangeRequest::Fixed(target_range)),
            )
            .await?;
        reference_range = sample.reference.range();
        target_range = sample.target.range();

        let difference = match (sample.reference.value(), sample.target.value()) {
            (Some(a), Some(b)) => Some(a - b),
            _ => None,
        };
        info!(
            "{} {} {} {} dV={}",
            format_optional(sample.reference.value()),
            reference_range,
            format_optional(sample.target.value()),
            target_range,
            format_optional(difference)
        );
        samples.push(sample);
    }
    Ok(samples)
}

/// Open both meters, run [`sync_check`], and release them again.
pub async fn run_sync_check(settings: &Settings, count: usize, range: f64) -> AppResult<usize> {
    let reference_channel =
        InstrumentChannel::open("reference", &settings.meter_transport(&settings.reference))
            .await?;
    let scanner_channel =
        match InstrumentChannel::open("scanner", &settings.meter_transport(&settings.scanner))
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                let mut reference_channel = reference_channel;
                reference_channel.close().await;
                return Err(e);
            }
        };
    let mut reference = reference_meter(settings, reference_channel);
    let mut scanner = scanner_meter(settings, scanner_channel);

    let outcome = async {
        reference
            .init(&settings.reference.expected_identity)
            .await?;
        scanner
            .init(&settings.scanner.expected_identity, &[])
            .await?;
        sync_check(
            &mut reference,
            &mut scanner,
            settings.measurement.nplc,
            count,
            range,
        )
        .await
    }
    .await;

    let idle = [reference.idle().await, scanner.idle().await];
    reference.close().await;
    scanner.close().await;

    let samples = outcome?;
    for result in idle {
        result?;
    }
    Ok(samples.len())
}
