//! Dense Tensors
//!
//! A minimal row-major tensor used by every layer in the crate. Activations
//! flow through the model as 2-D matrices of shape `[batch * seq_len, width]`:
//! every layer except attention treats positions independently, so folding
//! the batch and time axes into one row axis lets a single matmul cover the
//! whole batch. Attention recovers the `(batch, time)` structure itself from
//! the sequence length it is given.
//!
//! ## Example
//!
//! ```rust
//! use puck::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let c = a.matmul(&b);
//! assert_eq!(c.shape, vec![2, 2]);
//! assert_eq!(c.data, vec![4.0, 5.0, 10.0, 11.0]);
//! ```
//!
//! ## Parallelism
//!
//! Large matrix products are split into blocks of output rows and computed
//! with Rayon. Element-wise operations on large buffers use parallel
//! iterators. Small inputs stay sequential to avoid scheduling overhead.

use rayon::prelude::*;

/// Work threshold (m * n * k) above which matmul runs in parallel.
const PARALLEL_MATMUL_WORK: usize = 1_000;

/// Element threshold above which element-wise operations run in parallel.
const PARALLEL_ELEMENTS: usize = 4_096;

/// A multi-dimensional array of `f32` values in row-major order.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all elements
    pub data: Vec<f32>,
    /// Dimensions of the tensor
    pub shape: Vec<usize>,
}

impl Tensor {
    /// Create a tensor from flat data and a shape.
    ///
    /// # Panics
    ///
    /// Panics if the product of the shape does not equal the data length.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected
        );
        Self { data, shape }
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Create a tensor filled with `value`.
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of rows of a 2-D tensor.
    pub fn rows(&self) -> usize {
        debug_assert_eq!(self.shape.len(), 2, "rows() on non-matrix {:?}", self.shape);
        self.shape[0]
    }

    /// Number of columns of a 2-D tensor.
    pub fn cols(&self) -> usize {
        debug_assert_eq!(self.shape.len(), 2, "cols() on non-matrix {:?}", self.shape);
        self.shape[1]
    }

    /// Borrow row `i` of a 2-D tensor.
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.cols();
        &self.data[i * cols..(i + 1) * cols]
    }

    /// Mutably borrow row `i` of a 2-D tensor.
    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        let cols = self.cols();
        &mut self.data[i * cols..(i + 1) * cols]
    }

    /// True when every element is finite (no NaN or infinity).
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Sum of squared elements.
    pub fn sum_squares(&self) -> f32 {
        if self.data.len() >= PARALLEL_ELEMENTS {
            self.data.par_iter().map(|&v| v * v).sum()
        } else {
            self.data.iter().map(|&v| v * v).sum()
        }
    }

    /// Matrix product of two 2-D tensors: `[m, k] @ [k, n] -> [m, n]`.
    ///
    /// # Panics
    ///
    /// Panics if either operand is not 2-D or the inner dimensions differ.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert!(
            self.shape.len() == 2 && other.shape.len() == 2,
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[0],
            "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
            self.shape[0], self.shape[1], other.shape[0], other.shape[1]
        );

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        if m * n * k >= PARALLEL_MATMUL_WORK {
            return self.matmul_blocked(other, m, n, k);
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            let out_row = &mut result[i * n..(i + 1) * n];
            for l in 0..k {
                axpy(self.data[i * k + l], &other.data[l * n..(l + 1) * n], out_row);
            }
        }
        Tensor::new(result, vec![m, n])
    }

    /// Cache-blocked matmul, parallel over blocks of output rows.
    fn matmul_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK: usize = 8;

        let mut result = vec![0.0; m * n];
        result
            .par_chunks_mut(BLOCK * n)
            .enumerate()
            .for_each(|(block_i, out_block)| {
                let i_start = block_i * BLOCK;
                let i_end = (i_start + BLOCK).min(m);

                for j_start in (0..n).step_by(BLOCK) {
                    let j_end = (j_start + BLOCK).min(n);
                    for k_start in (0..k).step_by(BLOCK) {
                        let k_end = (k_start + BLOCK).min(k);
                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for l in k_start..k_end {
                                axpy(
                                    self.data[i * k + l],
                                    &other.data[l * n + j_start..l * n + j_end],
                                    &mut out_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Transpose of a 2-D tensor.
    pub fn transpose(&self) -> Tensor {
        let rows = self.rows();
        let cols = self.cols();
        let mut result = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = self.data[i * cols + j];
            }
        }
        Tensor::new(result, vec![cols, rows])
    }

    /// Element-wise sum of two tensors with identical shapes.
    pub fn add(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape, other.shape, "Shapes must match for add");
        let data = if self.data.len() >= PARALLEL_ELEMENTS {
            self.data
                .par_iter()
                .zip(&other.data)
                .map(|(a, b)| a + b)
                .collect()
        } else {
            self.data.iter().zip(&other.data).map(|(a, b)| a + b).collect()
        };
        Tensor::new(data, self.shape.clone())
    }

    /// Accumulate `other` into `self` element-wise.
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(self.shape, other.shape, "Shapes must match for add_assign");
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
    }

    /// Add a `[cols]` vector to every row of a 2-D tensor (bias broadcast).
    pub fn add_row(&self, row: &Tensor) -> Tensor {
        let cols = self.cols();
        assert_eq!(row.data.len(), cols, "Bias length must match column count");
        let mut out = self.clone();
        out.data
            .par_chunks_mut(cols)
            .for_each(|r| r.iter_mut().zip(&row.data).for_each(|(a, b)| *a += b));
        out
    }

    /// Column sums of a 2-D tensor, returned as a `[cols]` vector.
    pub fn sum_rows(&self) -> Tensor {
        let cols = self.cols();
        let mut sums = vec![0.0; cols];
        for r in self.data.chunks(cols) {
            for (s, v) in sums.iter_mut().zip(r) {
                *s += v;
            }
        }
        Tensor::new(sums, vec![cols])
    }

    /// Multiply every element by a scalar.
    pub fn scale(&self, factor: f32) -> Tensor {
        let data = self.data.iter().map(|&v| v * factor).collect();
        Tensor::new(data, self.shape.clone())
    }

    /// Copy columns `start..end` of a 2-D tensor into a new `[rows, end - start]` tensor.
    pub fn slice_cols(&self, start: usize, end: usize) -> Tensor {
        let rows = self.rows();
        let width = end - start;
        let mut data = Vec::with_capacity(rows * width);
        for i in 0..rows {
            data.extend_from_slice(&self.row(i)[start..end]);
        }
        Tensor::new(data, vec![rows, width])
    }

    /// Copy rows `start..end` of a 2-D tensor.
    pub fn slice_rows(&self, start: usize, end: usize) -> Tensor {
        let cols = self.cols();
        Tensor::new(
            self.data[start * cols..end * cols].to_vec(),
            vec![end - start, cols],
        )
    }

    /// Stack 2-D tensors with equal column counts along the row axis.
    pub fn concat_rows(parts: &[Tensor]) -> Tensor {
        assert!(!parts.is_empty(), "concat_rows needs at least one tensor");
        let cols = parts[0].cols();
        let mut data = Vec::with_capacity(parts.iter().map(Tensor::len).sum());
        for part in parts {
            assert_eq!(part.cols(), cols, "Column counts must match for concat_rows");
            data.extend_from_slice(&part.data);
        }
        let rows = parts.iter().map(Tensor::rows).sum();
        Tensor::new(data, vec![rows, cols])
    }

    /// Concatenate 2-D tensors with equal row counts along the column axis.
    pub fn concat_cols(parts: &[Tensor]) -> Tensor {
        assert!(!parts.is_empty(), "concat_cols needs at least one tensor");
        let rows = parts[0].rows();
        let width: usize = parts.iter().map(Tensor::cols).sum();
        let mut data = Vec::with_capacity(rows * width);
        for i in 0..rows {
            for part in parts {
                assert_eq!(part.rows(), rows, "Row counts must match for concat_cols");
                data.extend_from_slice(part.row(i));
            }
        }
        Tensor::new(data, vec![rows, width])
    }
}

/// `out[j] += a * b[j]`, written so LLVM can vectorize it.
#[inline(always)]
fn axpy(a: f32, b: &[f32], out: &mut [f32]) {
    for (o, &bv) in out.iter_mut().zip(b) {
        *o += a * bv;
    }
}

/// Numerically stable in-place softmax of one row.
///
/// Entries equal to negative infinity receive exactly zero probability. The
/// row must contain at least one finite value.
pub fn softmax_in_place(row: &mut [f32]) {
    let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in row.iter_mut() {
        *v /= sum;
    }
}
