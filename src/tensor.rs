//! Matrix valued nodes which form a computation graph
use std::{
    cell::{Ref, RefCell},
    collections::{HashMap, HashSet, hash_map::Entry},
    rc::Rc,
};

use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use thiserror::Error;

use crate::backprop_fns::{self, BackpropFunc};

type SharedNode = Rc<RefCell<InnerNode>>;

/// Errors raised while building or differentiating a computation graph
#[derive(Debug, Error, PartialEq)]
pub enum TensorError {
    #[error("Shape mismatch in {op}: {left:?} and {right:?}")]
    ShapeMismatch {
        op: &'static str,
        left: (usize, usize),
        right: (usize, usize),
    },
    #[error("Expected a 1x1 tensor, got shape {shape:?}")]
    NotScalar { shape: (usize, usize) },
    #[error("Labels must be non-negative and every row must sum to 1")]
    InvalidLabels,
    #[error("Cannot shape {len} values into {rows}x{cols}")]
    DataLength { rows: usize, cols: usize, len: usize },
    #[error("Tensors need at least one row and one column")]
    EmptyShape,
    #[error("Failed to initialize parameter: {0}")]
    Init(String),
}

/// Newtype representing a shared node in a computation graph
#[derive(Debug, Clone)]
pub struct Tensor(pub(crate) SharedNode);

impl Tensor {
    /// Create a new tensor which is not derived from any other tensors
    pub fn constant(data: Array2<f32>) -> Self {
        Self(Rc::new(RefCell::new(InnerNode::new(data, None))))
    }

    /// Create a constant from row-major data
    pub fn from_shape_vec(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self, TensorError> {
        let len = data.len();
        let data = Array2::from_shape_vec((rows, cols), data)
            .map_err(|_| TensorError::DataLength { rows, cols, len })?;
        Ok(Self::constant(data))
    }

    /// Create a tensor derived from an operation on `children` (i.e. not a leaf node)
    pub(crate) fn new_derived(
        data: Array2<f32>,
        backprop_fn: BackpropFunc,
        children: &[&Tensor],
    ) -> Self {
        debug_assert_eq!(backprop_fn.n_operands(), children.len());
        let mut inner = InnerNode::new(data, Some(backprop_fn));
        inner.children = children.iter().map(|c| c.0.clone()).collect();
        Self(Rc::new(RefCell::new(inner)))
    }

    pub fn data(&self) -> Array2<f32> {
        self.0.borrow().data.clone()
    }

    pub(crate) fn data_ref(&self) -> Ref<'_, Array2<f32>> {
        Ref::map(self.0.borrow(), |inner| &inner.data)
    }

    pub fn shape(&self) -> (usize, usize) {
        self.0.borrow().data.dim()
    }

    fn id(&self) -> u64 {
        self.0.borrow().id
    }

    fn backward_inner(&self, backprop_order: &mut Vec<Tensor>, visited: &mut HashSet<u64>) {
        for c in self.0.borrow().children.iter() {
            if visited.contains(&c.borrow().id) {
                continue;
            }
            visited.insert(c.borrow().id);
            let node = Tensor(c.clone());
            node.backward_inner(backprop_order, visited);
        }
        backprop_order.push(self.clone());
    }
}

// Operations on tensors, shapes are checked eagerly
impl Tensor {
    /// `features (b x d)` against `weights (1 x d)`, producing one score per row `(b x 1)`
    pub fn dot_product(&self, weights: &Tensor) -> Result<Tensor, TensorError> {
        let (_, d) = self.shape();
        let (rows, wd) = weights.shape();
        if rows != 1 || d != wd {
            return Err(self.mismatch("dot_product", weights));
        }
        let data = self.data_ref().dot(&weights.data_ref().t());
        Ok(Tensor::new_derived(data, BackpropFunc::DotProduct, &[self, weights]))
    }

    /// `features (b x i)` times `weights (i x o)`
    pub fn linear(&self, weights: &Tensor) -> Result<Tensor, TensorError> {
        if self.shape().1 != weights.shape().0 {
            return Err(self.mismatch("linear", weights));
        }
        let data = self.data_ref().dot(&*weights.data_ref());
        Ok(Tensor::new_derived(data, BackpropFunc::Linear, &[self, weights]))
    }

    /// Adds a `(1 x f)` bias to every row of `features (b x f)`
    pub fn add_bias(&self, bias: &Tensor) -> Result<Tensor, TensorError> {
        let (rows, f) = bias.shape();
        if rows != 1 || self.shape().1 != f {
            return Err(self.mismatch("add_bias", bias));
        }
        let data = &*self.data_ref() + &*bias.data_ref();
        Ok(Tensor::new_derived(data, BackpropFunc::AddBias, &[self, bias]))
    }

    /// Element-wise sum of two tensors of the same shape
    pub fn add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        if self.shape() != other.shape() {
            return Err(self.mismatch("add", other));
        }
        let data = &*self.data_ref() + &*other.data_ref();
        Ok(Tensor::new_derived(data, BackpropFunc::Add, &[self, other]))
    }

    pub fn relu(&self) -> Tensor {
        let data = self.data_ref().mapv(|v| v.max(0.0));
        Tensor::new_derived(data, BackpropFunc::ReLU, &[self])
    }

    fn mismatch(&self, op: &'static str, other: &Tensor) -> TensorError {
        TensorError::ShapeMismatch {
            op,
            left: self.shape(),
            right: other.shape(),
        }
    }
}

/// A trainable tensor owned by a model
#[derive(Debug, Clone)]
pub struct Parameter(Tensor);

impl Parameter {
    /// Glorot-uniform initialized parameter of shape `(rows x cols)`
    pub fn new<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Result<Self, TensorError> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::EmptyShape);
        }
        let limit = (3.0 / ((rows + cols) as f32 / 2.0)).sqrt();
        let uniform =
            Uniform::new(-limit, limit).map_err(|e| TensorError::Init(e.to_string()))?;
        let data = Array2::from_shape_simple_fn((rows, cols), || uniform.sample(&mut *rng));
        Ok(Self(Tensor::constant(data)))
    }

    pub fn from_data(data: Array2<f32>) -> Result<Self, TensorError> {
        if data.is_empty() {
            return Err(TensorError::EmptyShape);
        }
        Ok(Self(Tensor::constant(data)))
    }

    pub fn data(&self) -> Array2<f32> {
        self.0.data()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.0.shape()
    }

    /// The graph node to feed into operations
    pub fn as_tensor(&self) -> &Tensor {
        &self.0
    }

    /// `param <- param + multiplier * direction`
    // Strictly, &mut isn't needed since the node is behind a shared mutable type,
    // but it indicates that the parameter should be exclusively mutable
    pub fn update(&mut self, direction: &Array2<f32>, multiplier: f32) -> Result<(), TensorError> {
        if direction.dim() != self.shape() {
            return Err(TensorError::ShapeMismatch {
                op: "update",
                left: self.shape(),
                right: direction.dim(),
            });
        }
        self.0.0.borrow_mut().data.scaled_add(multiplier, direction);
        Ok(())
    }

    fn id(&self) -> u64 {
        self.0.id()
    }
}

/// Reads the single number held by a `1 x 1` tensor
pub fn as_scalar(tensor: &Tensor) -> Result<f32, TensorError> {
    let data = tensor.data_ref();
    match data.dim() {
        (1, 1) => Ok(data[[0, 0]]),
        shape => Err(TensorError::NotScalar { shape }),
    }
}

/// Gradients of a scalar `loss` with respect to each of `params`, in order.
///
/// Parameters which `loss` does not depend on receive a zero gradient.
pub fn gradients(loss: &Tensor, params: &[Parameter]) -> Result<Vec<Array2<f32>>, TensorError> {
    let shape = loss.shape();
    if shape != (1, 1) {
        return Err(TensorError::NotScalar { shape });
    }

    let mut backprop_order = vec![];
    let mut visited: HashSet<u64> = HashSet::new();
    // visit in post order
    loss.backward_inner(&mut backprop_order, &mut visited);

    // d loss / d loss = 1
    let mut grads: HashMap<u64, Array2<f32>> = HashMap::new();
    grads.insert(loss.id(), Array2::ones((1, 1)));

    // reversed to start from the root
    for node in backprop_order.into_iter().rev() {
        let inner = node.0.borrow();
        let Some(backprop_fn) = inner.backprop_fn else {
            continue;
        };
        // a derived node's gradient is final once all its parents were visited
        let Some(grad) = grads.remove(&inner.id) else {
            continue;
        };
        let children = inner.children.iter().map(|c| c.borrow()).collect::<Vec<_>>();
        let inputs = children.iter().map(|c| &c.data).collect::<Vec<_>>();
        let input_grads = backprop_fns::input_gradients(backprop_fn, &inputs, &grad);
        for (child, child_grad) in children.iter().zip(input_grads) {
            match grads.entry(child.id) {
                Entry::Occupied(mut acc) => *acc.get_mut() += &child_grad,
                Entry::Vacant(slot) => {
                    slot.insert(child_grad);
                }
            }
        }
    }

    Ok(params
        .iter()
        .map(|p| {
            grads
                .remove(&p.id())
                .unwrap_or_else(|| Array2::zeros(p.shape()))
        })
        .collect())
}

#[derive(Debug)]
pub(crate) struct InnerNode {
    pub(crate) data: Array2<f32>,
    /// List of the node inputs in the forward pass
    /// These nodes are "children" in the backwards pass
    children: Vec<SharedNode>,
    /// Unique identifier for the node
    id: u64,
    /// The function which created this node from its children
    /// `None` when the node is a leaf
    pub(crate) backprop_fn: Option<BackpropFunc>,
}

impl InnerNode {
    fn new(data: Array2<f32>, backprop_fn: Option<BackpropFunc>) -> Self {
        Self {
            data,
            children: vec![],
            id: generate_random_id(),
            backprop_fn,
        }
    }
}

fn generate_random_id() -> u64 {
    let mut rng = rand::rng();
    rng.random() // generates a random u64
}

#[cfg(test)]
pub mod tests {
    use ndarray::array;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    #[macro_export]
    macro_rules! assert_eq_float {
        ($a:expr, $b:expr) => {
            assert!((($a) - ($b)).abs() < 1e-5, "{} != {}", $a, $b);
        };
    }

    fn param(data: Array2<f32>) -> Parameter {
        Parameter::from_data(data).unwrap()
    }

    #[test]
    fn test_linear() {
        let x = Tensor::constant(array![[1.0, 2.0]]);
        let w = param(array![[1.0, 0.0, 2.0], [3.0, 1.0, -1.0]]);
        let out = x.linear(w.as_tensor()).unwrap();
        assert_eq!(out.data(), array![[7.0, 2.0, 0.0]]);
    }

    #[test]
    fn test_linear_shape_mismatch() {
        let x = Tensor::constant(array![[1.0, 2.0, 3.0]]);
        let w = param(array![[1.0], [2.0]]);
        let err = x.linear(w.as_tensor()).unwrap_err();
        assert_eq!(
            err,
            TensorError::ShapeMismatch {
                op: "linear",
                left: (1, 3),
                right: (2, 1)
            }
        );
    }

    #[test]
    fn test_dot_product() {
        let x = Tensor::constant(array![[1.0, 2.0], [-1.0, 0.5]]);
        let w = param(array![[2.0, 3.0]]);
        let out = x.dot_product(w.as_tensor()).unwrap();
        assert_eq!(out.data(), array![[8.0], [-0.5]]);
    }

    #[test]
    fn test_add_bias_broadcasts_rows() {
        let x = Tensor::constant(array![[1.0, 2.0], [3.0, 4.0]]);
        let b = param(array![[10.0, 20.0]]);
        let out = x.add_bias(b.as_tensor()).unwrap();
        assert_eq!(out.data(), array![[11.0, 22.0], [13.0, 24.0]]);
        assert!(x.add_bias(&x).is_err());
    }

    #[test]
    fn test_relu() {
        let x = Tensor::constant(array![[-1.0, 0.0, 2.0]]);
        assert_eq!(x.relu().data(), array![[0.0, 0.0, 2.0]]);
    }

    #[test]
    fn test_from_shape_vec() {
        let t = Tensor::from_shape_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(t.data(), array![[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(
            Tensor::from_shape_vec(2, 3, vec![1.0; 5]).unwrap_err(),
            TensorError::DataLength {
                rows: 2,
                cols: 3,
                len: 5
            }
        );
    }

    #[test]
    fn test_as_scalar() {
        assert_eq!(as_scalar(&Tensor::constant(array![[3.5]])), Ok(3.5));
        assert_eq!(
            as_scalar(&Tensor::constant(array![[1.0, 2.0]])),
            Err(TensorError::NotScalar { shape: (1, 2) })
        );
    }

    #[test]
    fn test_gradients_through_linear_and_bias() {
        // loss = sum(x @ w + b) expressed via a dot product with ones
        let x = Tensor::constant(array![[1.0, 2.0]]);
        let w = param(array![[1.0], [1.0]]);
        let b = param(array![[0.5]]);
        let out = x.linear(w.as_tensor()).unwrap().add_bias(b.as_tensor()).unwrap();
        let grads = gradients(&out, &[w.clone(), b.clone()]).unwrap();
        // d out / d w = x^T, d out / d b = 1
        assert_eq!(grads[0], array![[1.0], [2.0]]);
        assert_eq!(grads[1], array![[1.0]]);
    }

    #[test]
    fn test_gradients_accumulate_over_shared_nodes() {
        let x = Tensor::constant(array![[3.0]]);
        let w = param(array![[2.0]]);
        let h = x.linear(w.as_tensor()).unwrap();
        // out = h + h = 2 * x * w
        let out = h.add(&h).unwrap();
        let grads = gradients(&out, &[w]).unwrap();
        assert_eq!(grads[0], array![[6.0]]);
    }

    #[test]
    fn test_gradients_relu_blocks_negative() {
        let x = Tensor::constant(array![[1.0, -1.0]]);
        let w = param(array![[1.0, 1.0]]);
        let ones = param(array![[1.0], [1.0]]);
        let h = x.add_bias(w.as_tensor()).unwrap().relu();
        // h = [2, 0]
        let out = h.linear(ones.as_tensor()).unwrap();
        let grads = gradients(&out, &[w]).unwrap();
        assert_eq!(grads[0], array![[1.0, 0.0]]);
    }

    #[test]
    fn test_gradients_unused_parameter_is_zero() {
        let x = Tensor::constant(array![[1.0]]);
        let w = param(array![[2.0]]);
        let unused = param(array![[1.0, 1.0, 1.0]]);
        let out = x.linear(w.as_tensor()).unwrap();
        let grads = gradients(&out, &[w, unused]).unwrap();
        assert_eq!(grads[1], Array2::<f32>::zeros((1, 3)));
    }

    #[test]
    fn test_gradients_require_scalar_loss() {
        let x = Tensor::constant(array![[1.0, 2.0]]);
        let w = param(array![[1.0, 1.0]]);
        let out = x.add_bias(w.as_tensor()).unwrap();
        assert_eq!(
            gradients(&out, &[w]),
            Err(TensorError::NotScalar { shape: (1, 2) })
        );
    }

    #[test]
    fn test_parameter_update() {
        let mut w = param(array![[1.0, 2.0]]);
        w.update(&array![[1.0, -1.0]], -0.5).unwrap();
        assert_eq!(w.data(), array![[0.5, 2.5]]);

        let err = w.update(&array![[1.0], [1.0]], 1.0).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { op: "update", .. }));
        // a rejected update leaves the parameter untouched
        assert_eq!(w.data(), array![[0.5, 2.5]]);
    }

    #[test]
    fn test_parameter_init_is_bounded() {
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let w = Parameter::new(4, 2, &mut rng).unwrap();
        let limit = (3.0f32 / 3.0).sqrt();
        assert_eq!(w.shape(), (4, 2));
        assert!(w.data().iter().all(|v| v.abs() <= limit));
        assert_eq!(
            Parameter::new(0, 2, &mut rng).unwrap_err(),
            TensorError::EmptyShape
        );
    }
}
