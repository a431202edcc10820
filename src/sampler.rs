//! Synchronized sampling of the reference meter and the scanner.
//!
//! Both meters are armed first, then fired back to back, then fetched
//! reference first. The only synchronisation is the short gap between the two
//! trigger writes; there is no shared hardware trigger.

use crate::error::AppResult;
use crate::instrument::reference::ReferenceMeter;
use crate::instrument::scanner::ScannerMeter;
use crate::measurement::{MeasurementResult, MeasurementSpec, RangeRequest};
use tokio::time::Instant;
use tracing::debug;

/// Reference and target readings of one synchronized acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSample {
    /// Scanner channel the target reading came from
    pub channel: u16,
    pub reference: MeasurementResult,
    pub target: MeasurementResult,
}

/// Ranges both meters settled on during an autorange probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbedRanges {
    pub reference: f64,
    pub target: f64,
}

/// Borrows both meters for the duration of a row.
pub struct SynchronizedSampler<'a> {
    reference: &'a mut ReferenceMeter,
    scanner: &'a mut ScannerMeter,
    nplc: u32,
}

impl<'a> SynchronizedSampler<'a> {
    pub fn new(reference: &'a mut ReferenceMeter, scanner: &'a mut ScannerMeter, nplc: u32) -> Self {
        Self {
            reference,
            scanner,
            nplc,
        }
    }

    /// One synchronized acquisition: arm both, fire both, fetch both.
    pub async fn sample(
        &mut self,
        reference: RangeRequest,
        target: MeasurementSpec,
    ) -> AppResult<SyncSample> {
        let reference_token = self.reference.arm(reference, self.nplc).await?;
        let target_token = self.scanner.arm(target, self.nplc).await?;

        let fired = Instant::now();
        self.reference.fire(reference_token).await?;
        self.scanner.fire(target_token).await?;
        debug!("trigger gap {:?}", fired.elapsed());

        let reference = self.reference.fetch().await?;
        let target_result = self.scanner.fetch(target).await?;
        Ok(SyncSample {
            channel: target.channel,
            reference,
            target: target_result,
        })
    }

    /// Let the meters pick their ranges at the fast aperture.
    ///
    /// With a fixed reference request only the scanner is probed and the
    /// requested reference range is passed through unchanged. With an auto
    /// request both meters are probed together.
    pub async fn probe(&mut self, channel: u16, reference: RangeRequest) -> AppResult<ProbedRanges> {
        let spec = MeasurementSpec::new(channel, RangeRequest::Auto);
        match reference {
            RangeRequest::Fixed(range) => {
                let token = self.scanner.arm(spec, self.nplc).await?;
                self.scanner.fire(token).await?;
                let target = self.scanner.fetch(spec).await?;
                Ok(ProbedRanges {
                    reference: range,
                    target: target.range(),
                })
            }
            RangeRequest::Auto => {
                let sample = self.sample(RangeRequest::Auto, spec).await?;
                Ok(ProbedRanges {
                    reference: sample.reference.range(),
                    target: sample.target.range(),
                })
            }
        }
    }

    /// Sample every channel for one stimulus level.
    ///
    /// Ranges are discovered once, on the first channel, and then used fixed
    /// for every channel so all reference readings of the level share one
    /// range.
    pub async fn sample_level(
        &mut self,
        channels: &[u16],
        reference: RangeRequest,
    ) -> AppResult<Vec<SyncSample>> {
        let Some(&first) = channels.first() else {
            return Ok(Vec::new());
        };

        let ranges = self.probe(first, reference).await?;
        debug!(
            "probed ranges: reference {} target {}",
            ranges.reference, ranges.target
        );

        let mut samples = Vec::with_capacity(channels.len());
        for &channel in channels {
            let sample = self
                .sample(
                    RangeRequest::Fixed(ranges.reference),
                    MeasurementSpec::new(channel, RangeRequest::Fixed(ranges.target)),
                )
                .await?;
            samples.push(sample);
        }
        Ok(samples)
    }
}
