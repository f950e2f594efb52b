use std::ops::Deref;

use ark_ec::CurveGroup;
use itertools::Itertools;
use parking_lot::MappedRwLockReadGuard;
use zkaccel_device_common::{
    common::{BackendKind, DeviceContext},
    copy::MemCopyD2H,
    d_buffer::{DeviceBuffer, DeviceBufferView, DeviceRepr},
    stream::{KernelContext, Pending, Stream},
};

use crate::{
    config::{self, MAX_PRECOMPUTE_FACTOR, MAX_WINDOW_BITS},
    error::MsmError,
    pippenger::{ark_msm, bucket_msm, expand_bases},
};

/// How an MSM call executes.
#[derive(Debug, Clone)]
pub struct MsmConfig<'s> {
    /// Queue the work on this stream. Without one, the call runs on a transient stream.
    pub stream: Option<&'s Stream>,
    /// Return as soon as the work is queued. Requires `stream`.
    pub is_async: bool,
    /// Number of independent MSMs in one call.
    pub batch_size: usize,
    /// Factor the bases were expanded with by [precompute_bases].
    pub precompute_factor: usize,
    /// Bucket window in bits, 0 for automatic.
    pub window_bits: usize,
}

impl Default for MsmConfig<'_> {
    fn default() -> Self {
        Self {
            stream: None,
            is_async: false,
            batch_size: 1,
            precompute_factor: 1,
            window_bits: config::msm_window_bits(),
        }
    }
}

impl<'s> MsmConfig<'s> {
    pub fn on_stream(stream: &'s Stream) -> Self {
        Self {
            stream: Some(stream),
            ..Default::default()
        }
    }

    pub fn with_async(mut self, is_async: bool) -> Self {
        self.is_async = is_async;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_precompute_factor(mut self, factor: usize) -> Self {
        self.precompute_factor = factor;
        self
    }

    fn validate(&self) -> Result<(), MsmError> {
        if self.batch_size == 0 {
            return Err(MsmError::InvalidConfig("batch_size must be at least 1".into()));
        }
        if !(1..=MAX_PRECOMPUTE_FACTOR).contains(&self.precompute_factor) {
            return Err(MsmError::InvalidConfig(format!(
                "precompute_factor must be 1-{MAX_PRECOMPUTE_FACTOR}, got {}",
                self.precompute_factor
            )));
        }
        if self.window_bits > MAX_WINDOW_BITS {
            return Err(MsmError::InvalidConfig(format!(
                "window_bits must be at most {MAX_WINDOW_BITS}, got {}",
                self.window_bits
            )));
        }
        if self.is_async && self.stream.is_none() {
            return Err(MsmError::InvalidConfig(
                "asynchronous MSM requires a stream".into(),
            ));
        }
        Ok(())
    }
}

/// Scalars or points for an MSM, resident on the host or on the device.
pub enum MsmInput<'a, T: DeviceRepr> {
    Host(&'a [T]),
    Device(&'a DeviceBuffer<T>),
}

impl<T: DeviceRepr> MsmInput<'_, T> {
    pub fn len(&self) -> usize {
        match self {
            MsmInput::Host(slice) => slice.len(),
            MsmInput::Device(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Host data is copied at enqueue time, device data is borrowed for the kernel.
    fn stage(&self, stream: &Stream) -> Result<Staged<T>, MsmError> {
        Ok(match self {
            MsmInput::Host(slice) => Staged::Host(slice.to_vec()),
            MsmInput::Device(buf) => Staged::Device(buf.view(stream)?),
        })
    }
}

impl<'a, T: DeviceRepr> From<&'a [T]> for MsmInput<'a, T> {
    fn from(slice: &'a [T]) -> Self {
        MsmInput::Host(slice)
    }
}

impl<'a, T: DeviceRepr> From<&'a Vec<T>> for MsmInput<'a, T> {
    fn from(vec: &'a Vec<T>) -> Self {
        MsmInput::Host(vec)
    }
}

impl<'a, T: DeviceRepr> From<&'a DeviceBuffer<T>> for MsmInput<'a, T> {
    fn from(buf: &'a DeviceBuffer<T>) -> Self {
        MsmInput::Device(buf)
    }
}

enum Staged<T> {
    Host(Vec<T>),
    Device(DeviceBufferView<T>),
}

enum StagedRef<'a, T> {
    Host(&'a [T]),
    Device(MappedRwLockReadGuard<'a, [T]>),
}

impl<T> Staged<T> {
    fn get<'a>(&'a self, kernel: &'a KernelContext) -> StagedRef<'a, T> {
        match self {
            Staged::Host(vec) => StagedRef::Host(vec),
            Staged::Device(view) => StagedRef::Device(view.read(kernel)),
        }
    }
}

impl<T> Deref for StagedRef<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match self {
            StagedRef::Host(slice) => slice,
            StagedRef::Device(guard) => guard,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MsmShape {
    /// Terms per instance.
    n: usize,
    batch_size: usize,
    factor: usize,
    shared_points: bool,
}

fn msm_shape(
    num_scalars: usize,
    num_points: usize,
    num_out: usize,
    cfg: &MsmConfig,
) -> Result<MsmShape, MsmError> {
    let mismatch = || MsmError::SizeMismatch {
        scalars: num_scalars,
        points: num_points,
        batch_size: cfg.batch_size,
        precompute_factor: cfg.precompute_factor,
    };
    let batch_size = cfg.batch_size;
    let factor = cfg.precompute_factor;
    if num_scalars == 0 || num_scalars % batch_size != 0 {
        return Err(mismatch());
    }
    let n = num_scalars / batch_size;
    let shared_points = if num_points == n * factor {
        true
    } else if num_points == num_scalars * factor {
        false
    } else {
        return Err(mismatch());
    };
    if num_out != batch_size {
        return Err(MsmError::OutputSizeMismatch {
            expected: batch_size,
            actual: num_out,
        });
    }
    Ok(MsmShape {
        n,
        batch_size,
        factor,
        shared_points,
    })
}

fn run_instances<G: CurveGroup>(
    kind: BackendKind,
    scalars: &[G::ScalarField],
    points: &[G::Affine],
    shape: MsmShape,
    window_bits: usize,
) -> Vec<G> {
    let MsmShape {
        n,
        batch_size,
        factor,
        shared_points,
    } = shape;
    debug_assert_eq!(scalars.len(), n * batch_size);
    scalars
        .chunks(n)
        .enumerate()
        .map(|(b, instance)| {
            let bases = if shared_points {
                points
            } else {
                &points[b * n * factor..(b + 1) * n * factor]
            };
            match kind {
                BackendKind::Cpu => ark_msm::<G>(instance, bases, factor),
                BackendKind::Accelerator => bucket_msm::<G>(instance, bases, factor, window_bits),
            }
        })
        .collect_vec()
}

/// Computes `sum_i scalars[i] * points[i]` for each of `cfg.batch_size` instances into `out`.
///
/// `points` is shared across instances when it holds `n * precompute_factor` bases, otherwise
/// it must hold `batch_size * n * precompute_factor`. With `cfg.is_async` the call returns once
/// the work is queued and `out` is only readable after `cfg.stream` is synchronized.
#[tracing::instrument(
    level = "debug",
    skip_all,
    fields(device = %ctx.device(), n = scalars.len(), batch = cfg.batch_size)
)]
pub fn msm<'a, G: CurveGroup>(
    ctx: &DeviceContext,
    scalars: MsmInput<'a, G::ScalarField>,
    points: MsmInput<'a, G::Affine>,
    cfg: &MsmConfig,
    out: &mut DeviceBuffer<G>,
) -> Result<(), MsmError> {
    cfg.validate()?;
    let shape = msm_shape(scalars.len(), points.len(), out.len(), cfg)?;

    let transient;
    let stream = match cfg.stream {
        Some(stream) => stream,
        None => {
            transient = ctx.create_stream()?;
            &transient
        }
    };
    enqueue_msm(ctx, scalars, points, cfg, shape, stream, out)?;

    if !cfg.is_async {
        stream.synchronize()?;
    }
    Ok(())
}

fn enqueue_msm<G: CurveGroup>(
    ctx: &DeviceContext,
    scalars: MsmInput<'_, G::ScalarField>,
    points: MsmInput<'_, G::Affine>,
    cfg: &MsmConfig,
    shape: MsmShape,
    stream: &Stream,
    out: &mut DeviceBuffer<G>,
) -> Result<u64, MsmError> {
    ctx.check_stream(stream)?;
    let scalars = scalars.stage(stream)?;
    let points = points.stage(stream)?;
    let out_view = out.view_mut(stream)?;
    let kind = ctx.kind();
    let window_bits = cfg.window_bits;
    let ticket = stream.enqueue("msm", move |kernel| {
        let results = run_instances::<G>(
            kind,
            &scalars.get(kernel),
            &points.get(kernel),
            shape,
            window_bits,
        );
        out_view.write(kernel).copy_from_slice(&results);
        Ok(())
    })?;
    Ok(ticket)
}

/// Synchronous MSM returning the results on the host.
pub fn msm_host<G: CurveGroup>(
    ctx: &DeviceContext,
    scalars: &[G::ScalarField],
    points: &[G::Affine],
    cfg: &MsmConfig,
) -> Result<Vec<G>, MsmError> {
    let cfg = MsmConfig {
        is_async: false,
        ..cfg.clone()
    };
    cfg.validate()?;
    let mut out = DeviceBuffer::<G>::with_capacity(ctx, cfg.batch_size)?;
    msm(ctx, scalars.into(), points.into(), &cfg, &mut out)?;
    Ok(out.to_host()?)
}

/// Handle to an MSM queued on a stream.
#[must_use = "the MSM result is only available through wait()"]
pub struct MsmHandle<'s, G: CurveGroup> {
    out: Pending<'s, DeviceBuffer<G>>,
}

impl<'s, G: CurveGroup> MsmHandle<'s, G> {
    pub fn is_ready(&self) -> bool {
        self.out.is_ready()
    }

    /// Blocks until the MSM has run and returns one result per instance.
    pub fn wait(self) -> Result<Vec<G>, MsmError> {
        let out = self.out.wait()?;
        Ok(out.to_host()?)
    }

    /// Waits for a single-instance MSM.
    pub fn wait_one(self) -> Result<G, MsmError> {
        self.wait()?
            .into_iter()
            .exactly_one()
            .map_err(|rest| MsmError::OutputSizeMismatch {
                expected: 1,
                actual: rest.count(),
            })
    }
}

/// Queues an MSM on `stream` and returns without waiting for it.
pub fn msm_async<'s, 'a, G: CurveGroup>(
    ctx: &DeviceContext,
    scalars: MsmInput<'a, G::ScalarField>,
    points: MsmInput<'a, G::Affine>,
    cfg: &MsmConfig,
    stream: &'s Stream,
) -> Result<MsmHandle<'s, G>, MsmError> {
    let cfg = MsmConfig {
        stream: Some(stream),
        is_async: true,
        ..cfg.clone()
    };
    cfg.validate()?;
    let mut out = DeviceBuffer::<G>::with_capacity(ctx, cfg.batch_size)?;
    let shape = msm_shape(scalars.len(), points.len(), out.len(), &cfg)?;
    let ticket = enqueue_msm(ctx, scalars, points, &cfg, shape, stream, &mut out)?;
    Ok(MsmHandle {
        out: stream.pending(ticket, out),
    })
}

/// Uploads `points` expanded by `factor` into device memory for repeated MSMs.
///
/// Bases are laid out as `factor` blocks of `points.len()` entries; pass the same factor as
/// [MsmConfig::precompute_factor] when using them.
#[tracing::instrument(level = "debug", skip_all, fields(n = points.len(), factor))]
pub fn precompute_bases<G: CurveGroup>(
    ctx: &DeviceContext,
    points: MsmInput<'_, G::Affine>,
    factor: usize,
    stream: Option<&Stream>,
) -> Result<DeviceBuffer<G::Affine>, MsmError> {
    if !(1..=MAX_PRECOMPUTE_FACTOR).contains(&factor) {
        return Err(MsmError::InvalidConfig(format!(
            "precompute_factor must be 1-{MAX_PRECOMPUTE_FACTOR}, got {factor}"
        )));
    }
    if points.is_empty() {
        return Err(MsmError::SizeMismatch {
            scalars: 0,
            points: 0,
            batch_size: 1,
            precompute_factor: factor,
        });
    }

    let transient;
    let stream = match stream {
        Some(stream) => {
            ctx.check_stream(stream)?;
            stream
        }
        None => {
            transient = ctx.create_stream()?;
            &transient
        }
    };

    tracing::debug!(
        "Precomputing bases: {} points x factor {} = {} total",
        points.len(),
        factor,
        points.len() * factor
    );
    let mut expanded = DeviceBuffer::<G::Affine>::with_capacity(ctx, points.len() * factor)?;
    let source = points.stage(stream)?;
    let out_view = expanded.view_mut(stream)?;
    stream.enqueue("precompute_bases", move |kernel| {
        let bases = expand_bases::<G>(&source.get(kernel), factor);
        out_view.write(kernel).copy_from_slice(&bases);
        Ok(())
    })?;
    stream.synchronize()?;
    Ok(expanded)
}
