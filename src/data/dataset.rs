//! Burn Dataset implementation for synthetic MAS spectra
//!
//! Samples are never stored: every request draws a fresh isotropic spectrum
//! and its MAS stack, so the supply is infinite.

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::isotropic::LineshapeSampler;
use super::lineshape::{render_peaks, smooth_ends, Peak, PeakSet};
use super::mas::MasSynthesizer;
use super::params::DataPars;
use crate::{IsoNetError, Result};

/// Fresh samples drawn after a generation failure before the error is surfaced
pub const MAX_SAMPLE_REDRAWS: usize = 16;

/// One training pair
#[derive(Debug, Clone)]
pub struct SpectrumSample {
    /// MAS stack, row-major `[nw, channels, td]`
    pub input: Vec<f32>,
    /// Clean isotropic spectrum `[td]`
    pub target: Vec<f32>,
    /// Spinning rate of each input row
    pub rates: Vec<f64>,
    pub nw: usize,
    pub channels: usize,
    pub td: usize,
}

/// Lay out a MAS stack as `[nw, channels, td]` following the channel encoding of `pars`
///
/// Shared by training-time assembly and inference-time preparation so both
/// feed the network the same representation.
pub fn encode_stack(
    real: &[Vec<f32>],
    imag: Option<&[Vec<f32>]>,
    rates: &[f64],
    pars: &DataPars,
) -> Result<Vec<f32>> {
    let nw = real.len();
    if rates.len() != nw {
        return Err(IsoNetError::ShapeMismatch {
            parameter: "rates".to_string(),
            expected: vec![nw],
            found: vec![rates.len()],
        });
    }
    let td = real.first().map(|r| r.len()).unwrap_or(0);
    if let Some(row) = real.iter().find(|r| r.len() != td) {
        return Err(IsoNetError::ShapeMismatch {
            parameter: "real".to_string(),
            expected: vec![td],
            found: vec![row.len()],
        });
    }
    if pars.encode_imag {
        match imag {
            Some(imag) if imag.len() == nw && imag.iter().all(|r| r.len() == td) => {}
            Some(imag) => {
                return Err(IsoNetError::ShapeMismatch {
                    parameter: "imag".to_string(),
                    expected: vec![nw, td],
                    found: vec![imag.len(), imag.first().map(|r| r.len()).unwrap_or(0)],
                })
            }
            None => {
                return Err(IsoNetError::Config(
                    "encode_imag is set but no imaginary part was provided".to_string(),
                ))
            }
        }
    }

    let mut out = Vec::with_capacity(nw * pars.channels() * td);
    for (i, row) in real.iter().enumerate() {
        out.extend_from_slice(row);
        if pars.encode_imag {
            if let Some(imag) = imag {
                out.extend_from_slice(&imag[i]);
            }
        }
        if pars.encode_wr {
            let wr = pars.encode_rate(rates[i]);
            out.extend(std::iter::repeat(wr).take(td));
        }
    }
    Ok(out)
}

/// Composes the lineshape sampler and MAS synthesizer into training pairs
///
/// Inputs follow `params_x`, targets are rendered from the same peaks with
/// the rendering options of `params_y`.
#[derive(Debug, Clone)]
pub struct SampleGenerator {
    params_x: DataPars,
    params_y: DataPars,
    sampler: LineshapeSampler,
    synth: MasSynthesizer,
}

impl SampleGenerator {
    pub fn new(params_x: DataPars, params_y: DataPars) -> Result<Self> {
        params_x.validate()?;
        params_y.validate()?;
        if params_x.iso_pars.td != params_y.iso_pars.td {
            return Err(IsoNetError::Config(format!(
                "iso_pars.td differs between input ({}) and target ({}) parameters",
                params_x.iso_pars.td, params_y.iso_pars.td
            )));
        }
        if params_x.iso_pars.fs != params_y.iso_pars.fs {
            return Err(IsoNetError::Config(format!(
                "iso_pars.Fs differs between input ({}) and target ({}) parameters",
                params_x.iso_pars.fs, params_y.iso_pars.fs
            )));
        }

        Ok(SampleGenerator {
            sampler: LineshapeSampler::new(params_x.iso_pars.clone())?,
            synth: MasSynthesizer::new(&params_x)?,
            params_x,
            params_y,
        })
    }

    /// Same parameters for inputs and targets
    pub fn symmetric(params: DataPars) -> Result<Self> {
        Self::new(params.clone(), params)
    }

    pub fn nw(&self) -> usize {
        self.params_x.mas_pars.nw
    }

    pub fn channels(&self) -> usize {
        self.params_x.channels()
    }

    pub fn td(&self) -> usize {
        self.params_x.iso_pars.td
    }

    /// Render the target spectrum for a peak set
    pub fn render_target(&self, peaks: &PeakSet) -> Vec<f32> {
        let y = &self.params_y;
        let lines: Vec<_> = peaks
            .iter()
            .map(|p| Peak {
                phase: y.iso_pars.phase,
                ..*p
            })
            .collect();
        let mut target = render_peaks(lines.iter(), y.iso_pars.td, y.iso_pars.fs, y.iso_pars.norm_height).real;

        if y.positive_iso {
            target.iter_mut().for_each(|v| *v = v.max(0.0));
        }
        smooth_ends(&mut target, y.smooth_end_len);

        let max = target.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        if max > 0.0 {
            let factor = 1.0 / (y.iso_spec_norm as f32 * max);
            target.iter_mut().for_each(|v| *v *= factor);
        }
        target
    }

    /// Draw a single sample, surfacing generation errors
    pub fn try_sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<SpectrumSample> {
        let iso = self.sampler.generate(rng)?;
        let stack = self.synth.generate(&iso, rng);

        let x = &self.params_x;
        let mut real: Vec<Vec<f32>> = Vec::with_capacity(stack.len());
        let mut imag: Vec<Vec<f32>> = Vec::with_capacity(stack.len());
        for spec in stack.spectra {
            let mut r = spec.real;
            let mut i = spec.imag;
            smooth_ends(&mut r, x.smooth_end_len);
            smooth_ends(&mut i, x.smooth_end_len);
            real.push(r);
            imag.push(i);
        }
        let rates: Vec<f64> = stack.conditions.iter().map(|c| c.rate).collect();
        let input = encode_stack(&real, Some(&imag), &rates, x)?;

        Ok(SpectrumSample {
            input,
            target: self.render_target(&iso.peaks),
            rates,
            nw: self.nw(),
            channels: self.channels(),
            td: self.td(),
        })
    }

    /// Draw a sample, redrawing from scratch after generation failures
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<SpectrumSample> {
        let mut last_err = None;
        for attempt in 0..MAX_SAMPLE_REDRAWS {
            match self.try_sample(rng) {
                Ok(sample) => return Ok(sample),
                Err(e @ IsoNetError::Generation { .. }) => {
                    log::warn!("Sample generation failed (attempt {}): {}", attempt + 1, e);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| IsoNetError::Generation {
            attempts: MAX_SAMPLE_REDRAWS,
            message: "no sample could be generated".to_string(),
        }))
    }

    /// Endless stream of samples driven by `rng`
    pub fn iter<R: Rng>(&self, rng: R) -> Samples<'_, R> {
        Samples { generator: self, rng }
    }
}

/// Infinite sample iterator, see [`SampleGenerator::iter`]
pub struct Samples<'a, R> {
    generator: &'a SampleGenerator,
    rng: R,
}

impl<R: Rng> Iterator for Samples<'_, R> {
    type Item = Result<SpectrumSample>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.generator.sample(&mut self.rng))
    }
}

/// Burn dataset view over the generator with a nominal epoch length
pub struct SyntheticDataset {
    generator: Arc<SampleGenerator>,
    len: usize,
    seed: Option<u64>,
    draws: AtomicU64,
}

impl SyntheticDataset {
    pub fn new(generator: Arc<SampleGenerator>, len: usize) -> Self {
        SyntheticDataset {
            generator,
            len,
            seed: None,
            draws: AtomicU64::new(0),
        }
    }

    /// Derive every sample's RNG from `seed` and a running draw counter
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => {
                let draw = self.draws.fetch_add(1, Ordering::Relaxed);
                StdRng::seed_from_u64(seed.wrapping_add(draw.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
            }
            None => StdRng::from_rng(&mut rand::rng()),
        }
    }
}

impl Dataset<SpectrumSample> for SyntheticDataset {
    /// Draw a fresh sample for any index below `len`
    ///
    /// Generation failures are redrawn on a new RNG stream until a sample
    /// succeeds; the loader reads `None` as the end of the epoch.
    fn get(&self, index: usize) -> Option<SpectrumSample> {
        if index >= self.len {
            return None;
        }
        let mut round = 0;
        loop {
            let mut rng = self.rng();
            match self.generator.sample(&mut rng) {
                Ok(sample) => return Some(sample),
                Err(e @ IsoNetError::Generation { .. }) => {
                    round += 1;
                    log::error!(
                        "Sample {} still failing after {} redraws, switching RNG stream: {}",
                        index,
                        round * MAX_SAMPLE_REDRAWS,
                        e
                    );
                }
                Err(e) => {
                    // Encoding errors are shape bugs, validated configs never produce them
                    log::error!("Cannot assemble sample {}: {}", index, e);
                    return None;
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Batch of spectra for training
#[derive(Debug, Clone)]
pub struct SpectrumBatch<B: Backend> {
    /// MAS stacks: [batch, nw, channels, td]
    pub inputs: Tensor<B, 4>,
    /// Isotropic targets: [batch, td]
    pub targets: Tensor<B, 2>,
}

/// Batcher for creating training batches
#[derive(Clone)]
pub struct SpectrumBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> SpectrumBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        SpectrumBatcher { device }
    }
}

impl<B: Backend> Batcher<B, SpectrumSample, SpectrumBatch<B>> for SpectrumBatcher<B> {
    fn batch(&self, items: Vec<SpectrumSample>, _device: &B::Device) -> SpectrumBatch<B> {
        let batch_size = items.len();
        let (nw, channels, td) = items
            .first()
            .map(|s| (s.nw, s.channels, s.td))
            .unwrap_or((0, 0, 0));

        let mut input_data = Vec::with_capacity(batch_size * nw * channels * td);
        let mut target_data = Vec::with_capacity(batch_size * td);
        for sample in &items {
            input_data.extend_from_slice(&sample.input);
            target_data.extend_from_slice(&sample.target);
        }

        let inputs = Tensor::<B, 1>::from_floats(input_data.as_slice(), &self.device)
            .reshape([batch_size, nw, channels, td]);
        let targets = Tensor::<B, 1>::from_floats(target_data.as_slice(), &self.device)
            .reshape([batch_size, td]);

        SpectrumBatch { inputs, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_sample_layout() {
        let pars = DataPars::default();
        let generator = SampleGenerator::symmetric(pars.clone()).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let sample = generator.sample(&mut rng).unwrap();

        let td = pars.iso_pars.td;
        assert_eq!(sample.input.len(), pars.mas_pars.nw * pars.channels() * td);
        assert_eq!(sample.target.len(), td);

        // Rate channel is constant within a row and matches the encoding
        for (row, w) in sample.rates.iter().enumerate() {
            let start = (row * pars.channels() + 1) * td;
            let channel = &sample.input[start..start + td];
            assert!(channel.iter().all(|v| *v == pars.encode_rate(*w)));
        }
    }

    #[test]
    fn test_target_normalized_positive_and_smoothed() {
        let pars = DataPars::default();
        let generator = SampleGenerator::symmetric(pars.clone()).unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        for sample in generator.iter(&mut rng).take(20) {
            let sample = sample.unwrap();
            let max = sample.target.iter().fold(0.0f32, |m, v| m.max(*v));
            assert!((max - 1.0 / pars.iso_spec_norm as f32).abs() < 1e-5);
            assert!(sample.target.iter().all(|v| *v >= 0.0));
            assert_eq!(sample.target[0], 0.0);
            assert_eq!(sample.target[pars.iso_pars.td - 1], 0.0);
        }
    }

    #[test]
    fn test_imaginary_channel() {
        let pars = DataPars {
            encode_imag: true,
            encode_wr: false,
            ..DataPars::default()
        };
        let generator = SampleGenerator::symmetric(pars.clone()).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let sample = generator.sample(&mut rng).unwrap();
        assert_eq!(sample.channels, 2);
        assert_eq!(sample.input.len(), pars.mas_pars.nw * 2 * pars.iso_pars.td);
    }

    #[test]
    fn test_mismatched_axes_rejected() {
        let x = DataPars::default();
        let mut y = DataPars::default();
        y.iso_pars.td = 256;
        assert!(matches!(SampleGenerator::new(x, y), Err(IsoNetError::Config(_))));
    }

    #[test]
    fn test_encode_stack_rejects_ragged_rows() {
        let pars = DataPars::default();
        let real = vec![vec![0.0; 8], vec![0.0; 7]];
        let err = encode_stack(&real, None, &[5e4, 6e4], &pars).unwrap_err();
        assert!(matches!(err, IsoNetError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_seeded_dataset_draws_fresh_samples() {
        let generator = Arc::new(SampleGenerator::symmetric(DataPars::default()).unwrap());
        let dataset = SyntheticDataset::new(generator, 4).with_seed(10);
        let a = dataset.get(0).unwrap();
        let b = dataset.get(0).unwrap();
        assert_eq!(dataset.len(), 4);
        assert_ne!(a.target, b.target);
    }

    #[test]
    fn test_failed_draws_are_redrawn_not_dropped() {
        // Three peaks never fit at exactly the spread, so about a third of the draws fail
        let mut pars = DataPars::default();
        pars.iso_pars.nmin = 1;
        pars.iso_pars.nmax = 3;
        pars.iso_pars.freq_range = [1_000.0, 1_200.0];
        pars.iso_pars.spread = 100.0;
        let generator = Arc::new(SampleGenerator::symmetric(pars).unwrap());

        let mut rng = StdRng::seed_from_u64(5);
        let failures = (0..30)
            .filter(|_| matches!(generator.try_sample(&mut rng), Err(IsoNetError::Generation { .. })))
            .count();
        assert!(failures > 0);

        let dataset = SyntheticDataset::new(generator, 24).with_seed(2);
        for index in 0..dataset.len() {
            let sample = dataset.get(index).unwrap();
            assert!(sample.target.iter().all(|v| v.is_finite()));
        }
        assert!(dataset.get(dataset.len()).is_none());
    }

    #[test]
    fn test_batcher_shapes() {
        let pars = DataPars::default();
        let generator = SampleGenerator::symmetric(pars.clone()).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let items: Vec<_> = generator
            .iter(&mut rng)
            .take(3)
            .collect::<Result<Vec<_>>>()
            .unwrap();

        let device = Default::default();
        let batcher = SpectrumBatcher::<TestBackend>::new(device);
        let batch = batcher.batch(items, &Default::default());
        assert_eq!(
            batch.inputs.dims(),
            [3, pars.mas_pars.nw, pars.channels(), pars.iso_pars.td]
        );
        assert_eq!(batch.targets.dims(), [3, pars.iso_pars.td]);
    }
}
