//! A Tensor with autograd capabilities.

use ndarray::{s, Array, Array3, ArrayD, Axis, Dimension, Ix2, Ix3, IxDyn};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use std::cell::{Ref, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Total wall time spent inside `matmul`, for the training report.
pub static MATMUL_TIME_NS: AtomicU64 = AtomicU64::new(0);

type BackwardOp = Rc<dyn Fn(&Tensor)>;

/// Holds the actual tensor data, its gradient, and graph information.
#[derive(Default)]
pub struct TensorData {
    pub data: ArrayD<f32>,
    pub grad: Option<Tensor>,
    backward: Option<BackwardOp>,
    prev: Vec<Tensor>,
}

impl fmt::Debug for TensorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorData")
            .field("data", &self.data)
            .field("grad", &self.grad)
            .field("backward", &self.backward.as_ref().map(|_| "BackwardOp"))
            .field("prev", &self.prev.len())
            .finish()
    }
}

/// The public Tensor struct, which is a smart pointer to the underlying data.
/// Cloning a Tensor is cheap as it only copies the Rc pointer.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub inner: Rc<RefCell<TensorData>>,
}

// Identity semantics so tensors can live in the topological-sort HashSet.
impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Tensor {}
impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.inner.as_ptr()).hash(state);
    }
}

impl Tensor {
    /// Creates a new leaf tensor from raw data and a shape.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let data = Array::from_shape_vec(IxDyn(&shape), data)
            .unwrap_or_else(|e| panic!("Data size does not match shape {:?}: {}", shape, e));
        Self::from_data(data)
    }

    /// Creates a leaf tensor from an existing ndarray::ArrayD.
    pub fn from_data(data: ArrayD<f32>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(TensorData {
                data,
                ..Default::default()
            })),
        }
    }

    /// Creates a leaf tensor from an array of any fixed dimensionality.
    pub fn from_array<D: Dimension>(data: Array<f32, D>) -> Self {
        Self::from_data(data.into_dyn())
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::from_data(Array::zeros(IxDyn(&shape)))
    }

    pub fn ones(shape: Vec<usize>) -> Self {
        Self::from_data(Array::ones(IxDyn(&shape)))
    }

    pub fn ones_like(tensor: &Tensor) -> Self {
        Self::from_data(Array::ones(tensor.shape()))
    }

    /// Small uniform weights in `[-scale, scale)` drawn from the caller's generator.
    pub fn rand<R: Rng + ?Sized>(shape: Vec<usize>, scale: f32, rng: &mut R) -> Self {
        let num_elements: usize = shape.iter().product();
        let dist = Uniform::new(-scale, scale);
        let data_vec: Vec<f32> = (0..num_elements).map(|_| dist.sample(rng)).collect();
        Self::new(data_vec, shape)
    }

    // --- Accessors ---
    pub fn shape(&self) -> Vec<usize> {
        self.inner.borrow().data.shape().to_vec()
    }
    pub fn data(&self) -> Ref<'_, ArrayD<f32>> {
        Ref::map(self.inner.borrow(), |d| &d.data)
    }
    /// Value of a single-element tensor such as a loss.
    pub fn item(&self) -> f32 {
        let data = self.data();
        assert_eq!(data.len(), 1, "item() needs a single-element tensor, got {:?}", data.shape());
        data.iter().copied().next().unwrap_or(f32::NAN)
    }
    pub fn grad(&self) -> Option<Tensor> {
        self.inner.borrow().grad.clone()
    }
    pub fn set_grad(&self, grad: Tensor) {
        self.inner.borrow_mut().grad = Some(grad);
    }
    /// Replaces the data of a leaf tensor (parameter loading, optimizer updates).
    pub fn set_data(&self, data: ArrayD<f32>) {
        self.inner.borrow_mut().data = data;
    }
    fn add_grad(&self, grad: Tensor) {
        let mut inner = self.inner.borrow_mut();
        if let Some(existing_grad) = inner.grad.take() {
            let new_grad_data = &*existing_grad.data() + &*grad.data();
            inner.grad = Some(Tensor::from_data(new_grad_data));
        } else {
            inner.grad = Some(grad);
        }
    }

    /// Records `prev` and the backward closure on a freshly computed output.
    fn with_graph(self, prev: Vec<Tensor>, backward: impl Fn(&Tensor) + 'static) -> Tensor {
        {
            let mut inner = self.inner.borrow_mut();
            inner.prev = prev;
            inner.backward = Some(Rc::new(backward));
        }
        self
    }

    // --- Autograd and Optimizer Methods ---

    /// Kicks off backpropagation from this tensor.
    pub fn backward(&self) {
        let mut topo: Vec<Tensor> = Vec::new();
        let mut visited: HashSet<Tensor> = HashSet::new();
        fn build_topo(node: &Tensor, visited: &mut HashSet<Tensor>, topo: &mut Vec<Tensor>) {
            if visited.insert(node.clone()) {
                for child in &node.inner.borrow().prev {
                    build_topo(child, visited, topo);
                }
                topo.push(node.clone());
            }
        }
        build_topo(self, &mut visited, &mut topo);

        self.set_grad(Tensor::ones_like(self));

        // Intermediate nodes drop their edges once processed, which breaks Rc cycles.
        // Leaf nodes keep their gradients.
        for node in topo.iter().rev() {
            let backward_fn = node.inner.borrow().backward.clone();
            if let Some(backward_fn) = backward_fn {
                if let Some(grad) = node.grad() {
                    backward_fn(&grad);
                }
                let mut inner = node.inner.borrow_mut();
                inner.prev.clear();
                inner.backward = None;
                inner.grad = None;
            }
        }
    }

    pub fn zero_grad(&self) {
        self.inner.borrow_mut().grad = None;
    }

    /// Plain gradient-descent update: `data -= lr * grad`.
    pub fn update(&self, lr: f32) {
        let grad_opt = self.inner.borrow().grad.clone();
        if let Some(grad) = grad_opt {
            let update_data = &*grad.data() * lr;
            let mut inner = self.inner.borrow_mut();
            inner.data = &inner.data - &update_data;
        }
    }

    /// A copy of the data outside the graph.
    pub fn detach(&self) -> Tensor {
        Tensor::from_data(self.data().clone())
    }

    // --- Graph-aware Operations ---

    pub fn relu(&self) -> Tensor {
        let out_data = self.data().mapv(|x| x.max(0.0));
        let self_clone = self.clone();
        Tensor::from_data(out_data).with_graph(vec![self.clone()], move |grad| {
            let relu_grad = self_clone.data().mapv(|x| if x > 0.0 { 1.0 } else { 0.0 });
            self_clone.add_grad(Tensor::from_data(&*grad.data() * &relu_grad));
        })
    }

    /// Tanh-approximated GELU.
    pub fn gelu(&self) -> Tensor {
        const C: f32 = 0.797_884_6; // sqrt(2 / pi)
        let out_data = self
            .data()
            .mapv(|x| 0.5 * x * (1.0 + (C * (x + 0.044715 * x * x * x)).tanh()));
        let self_clone = self.clone();
        Tensor::from_data(out_data).with_graph(vec![self.clone()], move |grad| {
            let local = self_clone.data().mapv(|x| {
                let inner = C * (x + 0.044715 * x * x * x);
                let t = inner.tanh();
                let d_inner = C * (1.0 + 3.0 * 0.044715 * x * x);
                0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * d_inner
            });
            self_clone.add_grad(Tensor::from_data(&*grad.data() * &local));
        })
    }

    pub fn exp(&self) -> Tensor {
        let out_data = self.data().mapv(f32::exp);
        let self_clone = self.clone();
        let out = Tensor::from_data(out_data);
        let out_weak = Rc::downgrade(&out.inner);
        out.with_graph(vec![self.clone()], move |grad| {
            // d(exp(x))/dx = exp(x)
            if let Some(out_rc) = out_weak.upgrade() {
                let out_tensor = Tensor { inner: out_rc };
                self_clone.add_grad(Tensor::from_data(&*grad.data() * &*out_tensor.data()));
            }
        })
    }

    pub fn sqrt(&self) -> Tensor {
        let out_data = self.data().mapv(f32::sqrt);
        let self_clone = self.clone();
        let out = Tensor::from_data(out_data);
        let out_weak = Rc::downgrade(&out.inner);
        out.with_graph(vec![self.clone()], move |grad| {
            if let Some(out_rc) = out_weak.upgrade() {
                let out_tensor = Tensor { inner: out_rc };
                let grad_data = &*grad.data() / &(&*out_tensor.data() * 2.0);
                self_clone.add_grad(Tensor::from_data(grad_data));
            }
        })
    }

    /// Element-wise square.
    pub fn square(&self) -> Tensor {
        self * self
    }

    /// Sums all elements, returning a `[1]` tensor.
    pub fn sum(&self) -> Tensor {
        let out_data = self.data().sum();
        let self_clone = self.clone();
        let self_shape = self.shape();
        Tensor::new(vec![out_data], vec![1]).with_graph(vec![self.clone()], move |grad| {
            let grad_val = grad.item();
            self_clone.add_grad(Tensor::from_data(Array::from_elem(
                IxDyn(&self_shape),
                grad_val,
            )));
        })
    }

    pub fn sum_axis(&self, axis: usize, keep_dims: bool) -> Tensor {
        let ax = Axis(axis);
        let out_data = if keep_dims {
            self.data().sum_axis(ax).insert_axis(ax)
        } else {
            self.data().sum_axis(ax)
        };
        let self_clone = self.clone();
        let self_shape = self.shape();
        Tensor::from_data(out_data).with_graph(vec![self.clone()], move |grad| {
            let grad_data = if keep_dims {
                grad.data().clone()
            } else {
                grad.data().clone().insert_axis(ax)
            };
            let broadcasted = grad_data
                .broadcast(IxDyn(&self_shape))
                .unwrap_or_else(|| panic!("Cannot broadcast grad to {:?}", self_shape))
                .to_owned();
            self_clone.add_grad(Tensor::from_data(broadcasted));
        })
    }

    pub fn mean_axis(&self, axis: usize, keep_dims: bool) -> Tensor {
        let n = self.shape()[axis] as f32;
        self.sum_axis(axis, keep_dims) / n
    }

    pub fn mean(&self) -> Tensor {
        let n = self.data().len() as f32;
        self.sum() / n
    }

    pub fn var_axis(&self, axis: usize, keep_dims: bool) -> Tensor {
        let mean = self.mean_axis(axis, true);
        let centered = self - &mean;
        (&centered * &centered).mean_axis(axis, keep_dims)
    }

    /// Matrix multiplication for 2D×2D, batched 3D×3D and 3D×2D operands.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        let self_shape = self.shape();
        let other_shape = other.shape();

        let start = std::time::Instant::now();
        let out_data = if self_shape.len() == 2 && other_shape.len() == 2 {
            let a = self.data().clone().into_dimensionality::<Ix2>().unwrap();
            let b = other.data().clone().into_dimensionality::<Ix2>().unwrap();
            a.dot(&b).into_dyn()
        } else if self_shape.len() == 3 && other_shape.len() == 3 {
            let batch_size = self_shape[0];
            assert_eq!(batch_size, other_shape[0], "Batch dimensions must match for batched matmul: {:?} and {:?}", self_shape, other_shape);
            assert_eq!(self_shape[2], other_shape[1], "Incompatible dimensions for batched matmul: {:?} and {:?}", self_shape, other_shape);

            let a = self.data().clone().into_dimensionality::<Ix3>().unwrap();
            let b = other.data().clone().into_dimensionality::<Ix3>().unwrap();
            let mut out = Array3::<f32>::zeros((batch_size, self_shape[1], other_shape[2]));
            for i in 0..batch_size {
                out.slice_mut(s![i, .., ..])
                    .assign(&a.slice(s![i, .., ..]).dot(&b.slice(s![i, .., ..])));
            }
            out.into_dyn()
        } else if self_shape.len() == 3 && other_shape.len() == 2 {
            let (batch_size, m, k) = (self_shape[0], self_shape[1], self_shape[2]);
            let n = other_shape[1];
            assert_eq!(k, other_shape[0], "Incompatible dimensions for 3D x 2D matmul: {:?} and {:?}", self_shape, other_shape);

            let a = self
                .data()
                .as_standard_layout()
                .into_owned()
                .into_shape((batch_size * m, k))
                .unwrap();
            let b = other.data().clone().into_dimensionality::<Ix2>().unwrap();
            a.dot(&b).into_shape((batch_size, m, n)).unwrap().into_dyn()
        } else {
            panic!("Matmul not implemented for shapes {:?} and {:?}", self_shape, other_shape);
        };
        MATMUL_TIME_NS.fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);

        let self_clone = self.clone();
        let other_clone = other.clone();
        let (lhs_rank, rhs_rank) = (self_shape.len(), other_shape.len());
        Tensor::from_data(out_data).with_graph(vec![self.clone(), other.clone()], move |grad| {
            match (lhs_rank, rhs_rank) {
                (2, 2) => {
                    self_clone.add_grad(grad.matmul(&other_clone.transpose(0, 1)));
                    other_clone.add_grad(self_clone.transpose(0, 1).matmul(grad));
                }
                (3, 3) => {
                    self_clone.add_grad(grad.matmul(&other_clone.transpose(1, 2)));
                    other_clone.add_grad(self_clone.transpose(1, 2).matmul(grad));
                }
                _ => {
                    self_clone.add_grad(grad.matmul(&other_clone.transpose(0, 1)));
                    let s = self_clone.shape();
                    let g = grad.shape();
                    let lhs_2d = self_clone.reshape(vec![s[0] * s[1], s[2]]);
                    let grad_2d = grad.reshape(vec![g[0] * g[1], g[2]]);
                    other_clone.add_grad(lhs_2d.transpose(0, 1).matmul(&grad_2d));
                }
            }
        })
    }

    /// Reshapes the tensor, copying into standard layout when needed.
    pub fn reshape(&self, new_shape: Vec<usize>) -> Tensor {
        let original_shape = self.shape();
        let reshaped_data = self
            .data()
            .as_standard_layout()
            .into_owned()
            .into_shape(IxDyn(&new_shape))
            .unwrap_or_else(|e| {
                panic!(
                    "Failed to reshape tensor from {:?} to {:?}: {}",
                    original_shape, new_shape, e
                )
            });
        let self_clone = self.clone();
        Tensor::from_data(reshaped_data).with_graph(vec![self.clone()], move |grad| {
            let grad_reshaped = grad
                .data()
                .as_standard_layout()
                .into_owned()
                .into_shape(IxDyn(&original_shape))
                .unwrap();
            self_clone.add_grad(Tensor::from_data(grad_reshaped));
        })
    }

    /// Swaps two axes of the tensor.
    pub fn transpose(&self, axis1: usize, axis2: usize) -> Tensor {
        let out_data = {
            let data_ref = self.data();
            let mut view = data_ref.view();
            view.swap_axes(axis1, axis2);
            view.to_owned()
        };
        let self_clone = self.clone();
        Tensor::from_data(out_data).with_graph(vec![self.clone()], move |grad| {
            let grad_data_ref = grad.data();
            let mut grad_view = grad_data_ref.view();
            grad_view.swap_axes(axis1, axis2);
            self_clone.add_grad(Tensor::from_data(grad_view.to_owned()));
        })
    }

    /// Softmax along `axis`, shifted by the row max for stability.
    pub fn softmax(&self, axis: usize) -> Tensor {
        let ax = Axis(axis);
        let max = self
            .data()
            .map_axis(ax, |view| view.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b)))
            .insert_axis(ax);
        let shifted = self - &Tensor::from_data(max);
        let exp_x = shifted.exp();
        let sum_exp_x = exp_x.sum_axis(axis, true);
        &exp_x / &sum_exp_x
    }
}

// --- Operator Overloads ---

/// Sums a broadcast gradient back down to the shape of the operand it flows into.
fn sum_grad_to_shape(grad_data: ArrayD<f32>, target_shape: &[usize]) -> ArrayD<f32> {
    let grad_shape = grad_data.shape().to_vec();
    if grad_shape == target_shape {
        return grad_data;
    }

    let grad_ndim = grad_shape.len();
    let target_ndim = target_shape.len();
    let offset = grad_ndim - target_ndim;

    // Prepended axes, then axes where the target had extent 1.
    let mut axes_to_sum: Vec<usize> = (0..offset).collect();
    for (i, &dim) in target_shape.iter().enumerate() {
        if dim == 1 && grad_shape[i + offset] > 1 {
            axes_to_sum.push(i + offset);
        }
    }

    let mut summed_grad = grad_data;
    for &axis in axes_to_sum.iter().rev() {
        summed_grad = summed_grad.sum_axis(Axis(axis));
    }

    let summed_shape = summed_grad.shape().to_vec();
    summed_grad
        .as_standard_layout()
        .into_owned()
        .into_shape(IxDyn(target_shape))
        .unwrap_or_else(|e| {
            panic!(
                "Failed to reshape summed grad from {:?} to {:?}: {}",
                summed_shape, target_shape, e
            )
        })
}

impl Add for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: &Tensor) -> Self::Output {
        let out_data = &*self.data() + &*rhs.data();
        let (lhs, rhs_c) = (self.clone(), rhs.clone());
        Tensor::from_data(out_data).with_graph(vec![self.clone(), rhs.clone()], move |grad| {
            lhs.add_grad(Tensor::from_data(sum_grad_to_shape(grad.data().clone(), &lhs.shape())));
            rhs_c.add_grad(Tensor::from_data(sum_grad_to_shape(grad.data().clone(), &rhs_c.shape())));
        })
    }
}
impl<'a> Add<&'a Tensor> for Tensor { type Output = Tensor; fn add(self, rhs: &'a Tensor) -> Tensor { &self + rhs } }
impl Add<f32> for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: f32) -> Self::Output {
        let out_data = &*self.data() + rhs;
        let lhs = self.clone();
        Tensor::from_data(out_data).with_graph(vec![self.clone()], move |grad| {
            lhs.add_grad(grad.detach());
        })
    }
}
impl Add<f32> for Tensor { type Output = Tensor; fn add(self, rhs: f32) -> Tensor { &self + rhs } }

impl Sub for &Tensor {
    type Output = Tensor;
    fn sub(self, rhs: &Tensor) -> Self::Output {
        let out_data = &*self.data() - &*rhs.data();
        let (lhs, rhs_c) = (self.clone(), rhs.clone());
        Tensor::from_data(out_data).with_graph(vec![self.clone(), rhs.clone()], move |grad| {
            lhs.add_grad(Tensor::from_data(sum_grad_to_shape(grad.data().clone(), &lhs.shape())));
            let neg_grad = &*grad.data() * -1.0;
            rhs_c.add_grad(Tensor::from_data(sum_grad_to_shape(neg_grad, &rhs_c.shape())));
        })
    }
}
impl<'a> Sub<&'a Tensor> for Tensor { type Output = Tensor; fn sub(self, rhs: &'a Tensor) -> Tensor { &self - rhs } }

impl Mul for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: &Tensor) -> Self::Output {
        let out_data = &*self.data() * &*rhs.data();
        let (lhs, rhs_c) = (self.clone(), rhs.clone());
        Tensor::from_data(out_data).with_graph(vec![self.clone(), rhs.clone()], move |grad| {
            // Both products are computed before either add_grad, since lhs and rhs may alias.
            let grad_lhs = &*grad.data() * &*rhs_c.data();
            let grad_rhs = &*grad.data() * &*lhs.data();
            lhs.add_grad(Tensor::from_data(sum_grad_to_shape(grad_lhs, &lhs.shape())));
            rhs_c.add_grad(Tensor::from_data(sum_grad_to_shape(grad_rhs, &rhs_c.shape())));
        })
    }
}
impl<'a> Mul<&'a Tensor> for Tensor { type Output = Tensor; fn mul(self, rhs: &'a Tensor) -> Tensor { &self * rhs } }
impl Mul<f32> for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: f32) -> Self::Output {
        let out_data = &*self.data() * rhs;
        let lhs = self.clone();
        Tensor::from_data(out_data).with_graph(vec![self.clone()], move |grad| {
            lhs.add_grad(Tensor::from_data(&*grad.data() * rhs));
        })
    }
}
impl Mul<f32> for Tensor { type Output = Tensor; fn mul(self, rhs: f32) -> Tensor { &self * rhs } }

impl Div for &Tensor {
    type Output = Tensor;
    fn div(self, rhs: &Tensor) -> Self::Output {
        let out_data = &*self.data() / &*rhs.data();
        let (lhs, rhs_c) = (self.clone(), rhs.clone());
        Tensor::from_data(out_data).with_graph(vec![self.clone(), rhs.clone()], move |grad| {
            let grad_lhs = &*grad.data() / &*rhs_c.data();
            let grad_rhs = {
                let r = rhs_c.data();
                &*grad.data() * &(-&*lhs.data() / &(&*r * &*r))
            };
            lhs.add_grad(Tensor::from_data(sum_grad_to_shape(grad_lhs, &lhs.shape())));
            rhs_c.add_grad(Tensor::from_data(sum_grad_to_shape(grad_rhs, &rhs_c.shape())));
        })
    }
}
impl<'a> Div<&'a Tensor> for Tensor { type Output = Tensor; fn div(self, rhs: &'a Tensor) -> Tensor { &self / rhs } }
impl Div<f32> for &Tensor {
    type Output = Tensor;
    fn div(self, rhs: f32) -> Self::Output {
        let out_data = &*self.data() / rhs;
        let lhs = self.clone();
        Tensor::from_data(out_data).with_graph(vec![self.clone()], move |grad| {
            lhs.add_grad(Tensor::from_data(&*grad.data() / rhs));
        })
    }
}
impl Div<f32> for Tensor { type Output = Tensor; fn div(self, rhs: f32) -> Tensor { &self / rhs } }

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape: {:?})\n{}", self.shape(), self.data())
    }
}
