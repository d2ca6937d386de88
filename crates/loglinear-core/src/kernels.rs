//! Dense numeric kernels used by `ConcatVector`.
//!
//! Each kernel has a scalar reference implementation. The unrolled paths are
//! feature-gated (`unrolled-kernels`) and threshold-gated, and are selected
//! through an explicit [`KernelBackend`] rather than any global switch.

/// Minimum overlap length before the unrolled dot product is attempted.
pub const UNROLLED_DOT_MIN_LEN: usize = 32;

/// Equivalence epsilon for optimized-vs-reference numerical checks.
pub const KERNEL_EQUIVALENCE_EPSILON: f64 = 1e-9;

/// Backend selector for dense kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelBackend {
    /// Always use the scalar reference implementation.
    Scalar,
    /// Use the optimized implementation when compiled in and above threshold.
    #[default]
    Auto,
    /// Prefer the optimized implementation even below thresholds.
    #[cfg(feature = "unrolled-kernels")]
    UnrolledPreferred,
}

/// Dot product over the overlapping prefix of two dense slices.
pub fn dense_dot(a: &[f64], b: &[f64]) -> f64 {
    dense_dot_with_backend(a, b, KernelBackend::Auto)
}

/// Dot product over the overlapping prefix with explicit backend selection.
pub fn dense_dot_with_backend(a: &[f64], b: &[f64], backend: KernelBackend) -> f64 {
    let len = a.len().min(b.len());
    let (a, b) = (&a[..len], &b[..len]);

    match backend {
        KernelBackend::Scalar => dense_dot_scalar(a, b),
        KernelBackend::Auto => {
            #[cfg(feature = "unrolled-kernels")]
            {
                if len >= UNROLLED_DOT_MIN_LEN {
                    return dense_dot_unrolled(a, b);
                }
            }
            dense_dot_scalar(a, b)
        }
        #[cfg(feature = "unrolled-kernels")]
        KernelBackend::UnrolledPreferred => dense_dot_unrolled(a, b),
    }
}

/// Scalar reference dot product. Assumes equal lengths.
pub fn dense_dot_scalar(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `target[i] += source[i] * scale` over the overlapping prefix.
pub fn dense_axpy(target: &mut [f64], source: &[f64], scale: f64) {
    for (t, s) in target.iter_mut().zip(source) {
        *t += s * scale;
    }
}

#[cfg(feature = "unrolled-kernels")]
fn dense_dot_unrolled(a: &[f64], b: &[f64]) -> f64 {
    let mut lanes = [0.0_f64; 4];
    let chunks_a = a.chunks_exact(4);
    let chunks_b = b.chunks_exact(4);
    let tail_a = chunks_a.remainder();
    let tail_b = chunks_b.remainder();
    for (ca, cb) in chunks_a.zip(chunks_b) {
        lanes[0] += ca[0] * cb[0];
        lanes[1] += ca[1] * cb[1];
        lanes[2] += ca[2] * cb[2];
        lanes[3] += ca[3] * cb[3];
    }
    let mut sum = (lanes[0] + lanes[1]) + (lanes[2] + lanes[3]);
    for (x, y) in tail_a.iter().zip(tail_b) {
        sum += x * y;
    }
    sum
}
