//! Reverse-mode tape over dense matrices.
//!
//! Every backward rule is expressed with tape operations, so gradients are
//! themselves differentiable. That is what makes double backpropagation
//! (Hessian-vector products) possible without materialising a Hessian.
//!
//! Shapes are always 2-D; vectors are `(p, 1)` columns and scalars `(1, 1)`.
//!
//! # Panics
//!
//! Arithmetic between vars panics on shape mismatch or when the vars live on
//! different tapes, the same way `ndarray` panics on incompatible operands.
//! Public entry points that take user data (losses, `hvp`) validate shapes and
//! return errors instead.

use ndarray::{Array2, Axis};
use std::cell::RefCell;
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};
use std::rc::Rc;

use crate::error::{Result, XaiError};

#[derive(Debug, Clone, Copy)]
enum Op {
    Leaf,
    Add(usize, usize),
    Sub(usize, usize),
    Mul(usize, usize),
    Scale(usize, f64),
    MatMul(usize, usize),
    Transpose(usize),
    Exp(usize),
    Ln(usize),
    Recip(usize),
    SumAll(usize),
    SumRows(usize),
    SumCols(usize),
    BroadcastCols(usize),
    BroadcastRows(usize),
    Expand(usize),
}

impl Op {
    fn parents(self) -> [Option<usize>; 2] {
        match self {
            Op::Leaf => [None, None],
            Op::Add(a, b) | Op::Sub(a, b) | Op::Mul(a, b) | Op::MatMul(a, b) => {
                [Some(a), Some(b)]
            }
            Op::Scale(a, _)
            | Op::Transpose(a)
            | Op::Exp(a)
            | Op::Ln(a)
            | Op::Recip(a)
            | Op::SumAll(a)
            | Op::SumRows(a)
            | Op::SumCols(a)
            | Op::BroadcastCols(a)
            | Op::BroadcastRows(a)
            | Op::Expand(a) => [Some(a), None],
        }
    }
}

struct Node {
    value: Array2<f64>,
    op: Op,
}

/// Recording of every operation performed on its vars.
#[derive(Clone, Default)]
pub struct Tape {
    nodes: Rc<RefCell<Vec<Node>>>,
}

/// Handle to a node on a [`Tape`].
#[derive(Clone)]
pub struct Var {
    tape: Tape,
    id: usize,
}

impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Var")
            .field("id", &self.id)
            .field("shape", &self.shape())
            .finish()
    }
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded nodes.
    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every node recorded after `len`.
    ///
    /// Vars pointing past `len` become dangling and must not be used again.
    pub fn truncate(&self, len: usize) {
        self.nodes.borrow_mut().truncate(len);
    }

    /// A leaf that gradients can be taken against.
    pub fn leaf(&self, value: Array2<f64>) -> Var {
        self.push(value, Op::Leaf)
    }

    /// A leaf used as a constant; identical to [`Tape::leaf`] but reads better
    /// at call sites that never differentiate against it.
    pub fn constant(&self, value: Array2<f64>) -> Var {
        self.push(value, Op::Leaf)
    }

    /// Column vector leaf `(p, 1)`.
    pub fn column(&self, values: &[f64]) -> Var {
        let value = Array2::from_shape_vec((values.len(), 1), values.to_vec())
            .unwrap_or_else(|_| Array2::zeros((0, 1)));
        self.leaf(value)
    }

    fn push(&self, value: Array2<f64>, op: Op) -> Var {
        let mut nodes = self.nodes.borrow_mut();
        nodes.push(Node { value, op });
        Var {
            tape: self.clone(),
            id: nodes.len() - 1,
        }
    }

    fn var(&self, id: usize) -> Var {
        Var {
            tape: self.clone(),
            id,
        }
    }

    fn op(&self, id: usize) -> Op {
        self.nodes.borrow()[id].op
    }

    fn shape_of(&self, id: usize) -> (usize, usize) {
        self.nodes.borrow()[id].value.dim()
    }

    fn same_tape(&self, other: &Tape) -> bool {
        Rc::ptr_eq(&self.nodes, &other.nodes)
    }

    fn unary(&self, a: &Var, op: Op, f: impl FnOnce(&Array2<f64>) -> Array2<f64>) -> Var {
        assert!(self.same_tape(&a.tape), "var belongs to a different tape");
        let value = {
            let nodes = self.nodes.borrow();
            f(&nodes[a.id].value)
        };
        self.push(value, op)
    }

    fn binary(
        &self,
        a: &Var,
        b: &Var,
        op: Op,
        f: impl FnOnce(&Array2<f64>, &Array2<f64>) -> Array2<f64>,
    ) -> Var {
        assert!(
            self.same_tape(&a.tape) && self.same_tape(&b.tape),
            "vars belong to different tapes"
        );
        let value = {
            let nodes = self.nodes.borrow();
            f(&nodes[a.id].value, &nodes[b.id].value)
        };
        self.push(value, op)
    }

    /// Gradients of the scalar `output` with respect to each var in `wrt`.
    ///
    /// The returned vars are connected to the graph, so they can be
    /// differentiated again. Vars that `output` does not depend on get a zero
    /// gradient of matching shape.
    pub fn grad(&self, output: &Var, wrt: &[Var]) -> Result<Vec<Var>> {
        if !self.same_tape(&output.tape) || wrt.iter().any(|w| !self.same_tape(&w.tape)) {
            return Err(XaiError::autograd("vars belong to different tapes"));
        }
        if output.shape() != (1, 1) {
            return Err(XaiError::autograd(format!(
                "gradient requires a scalar output, got shape {:?}",
                output.shape()
            )));
        }

        let len = output.id + 1;

        // Only propagate into nodes that lie on a path to one of the targets.
        let mut needed = vec![false; len];
        for w in wrt {
            if w.id < len {
                needed[w.id] = true;
            }
        }
        for id in 0..len {
            if needed[id] {
                continue;
            }
            needed[id] = self
                .op(id)
                .parents()
                .iter()
                .flatten()
                .any(|&p| needed[p]);
        }

        let mut adjoints: Vec<Option<Var>> = vec![None; len];
        adjoints[output.id] = Some(self.constant(Array2::ones((1, 1))));

        for id in (0..len).rev() {
            if !needed[id] {
                continue;
            }
            let Some(g) = adjoints[id].clone() else {
                continue;
            };
            for (parent, contribution) in self.backward(id, &g) {
                if !needed[parent] {
                    continue;
                }
                adjoints[parent] = Some(match adjoints[parent].take() {
                    Some(prev) => &prev + &contribution,
                    None => contribution,
                });
            }
        }

        Ok(wrt
            .iter()
            .map(|w| {
                adjoints
                    .get(w.id)
                    .cloned()
                    .flatten()
                    .unwrap_or_else(|| self.constant(Array2::zeros(w.shape())))
            })
            .collect())
    }

    fn backward(&self, id: usize, g: &Var) -> Vec<(usize, Var)> {
        match self.op(id) {
            Op::Leaf => Vec::new(),
            Op::Add(a, b) => vec![(a, g.clone()), (b, g.clone())],
            Op::Sub(a, b) => vec![(a, g.clone()), (b, -g)],
            Op::Mul(a, b) => vec![(a, g * &self.var(b)), (b, g * &self.var(a))],
            Op::Scale(a, c) => vec![(a, g.scale(c))],
            Op::MatMul(a, b) => vec![
                (a, g.matmul(&self.var(b).t())),
                (b, self.var(a).t().matmul(g)),
            ],
            Op::Transpose(a) => vec![(a, g.t())],
            Op::Exp(a) => vec![(a, g * &self.var(id))],
            Op::Ln(a) => vec![(a, g * &self.var(a).recip())],
            Op::Recip(a) => {
                let out = self.var(id);
                vec![(a, -(g * &(&out * &out)))]
            }
            Op::SumAll(a) => vec![(a, g.expand(self.shape_of(a)))],
            Op::SumRows(a) => vec![(a, g.broadcast_cols(self.shape_of(a).1))],
            Op::SumCols(a) => vec![(a, g.broadcast_rows(self.shape_of(a).0))],
            Op::BroadcastCols(a) => vec![(a, g.sum_rows())],
            Op::BroadcastRows(a) => vec![(a, g.sum_cols())],
            Op::Expand(a) => vec![(a, g.sum())],
        }
    }
}

impl Var {
    pub fn tape(&self) -> &Tape {
        &self.tape
    }

    pub fn value(&self) -> Array2<f64> {
        self.tape.nodes.borrow()[self.id].value.clone()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.tape.shape_of(self.id)
    }

    /// Value of a `(1, 1)` var.
    pub fn scalar(&self) -> f64 {
        self.tape.nodes.borrow()[self.id].value[[0, 0]]
    }

    /// A new leaf holding this var's value, cut from the graph.
    pub fn detach(&self) -> Var {
        self.tape.leaf(self.value())
    }

    pub fn scale(&self, c: f64) -> Var {
        self.tape.unary(self, Op::Scale(self.id, c), |a| a * c)
    }

    pub fn matmul(&self, other: &Var) -> Var {
        let (n, k) = self.shape();
        let (k2, m) = other.shape();
        assert_eq!(k, k2, "matmul shape mismatch: ({n}, {k}) x ({k2}, {m})");
        self.tape
            .binary(self, other, Op::MatMul(self.id, other.id), |a, b| a.dot(b))
    }

    pub fn t(&self) -> Var {
        self.tape
            .unary(self, Op::Transpose(self.id), |a| a.t().to_owned())
    }

    pub fn exp(&self) -> Var {
        self.tape.unary(self, Op::Exp(self.id), |a| a.mapv(f64::exp))
    }

    pub fn ln(&self) -> Var {
        self.tape.unary(self, Op::Ln(self.id), |a| a.mapv(f64::ln))
    }

    pub fn recip(&self) -> Var {
        self.tape.unary(self, Op::Recip(self.id), |a| a.mapv(f64::recip))
    }

    /// Sum of all entries, `(1, 1)`.
    pub fn sum(&self) -> Var {
        self.tape.unary(self, Op::SumAll(self.id), |a| {
            Array2::from_elem((1, 1), a.sum())
        })
    }

    /// Row sums, `(n, m) -> (n, 1)`.
    pub fn sum_rows(&self) -> Var {
        self.tape.unary(self, Op::SumRows(self.id), |a| {
            a.sum_axis(Axis(1)).insert_axis(Axis(1))
        })
    }

    /// Column sums, `(n, m) -> (1, m)`.
    pub fn sum_cols(&self) -> Var {
        self.tape.unary(self, Op::SumCols(self.id), |a| {
            a.sum_axis(Axis(0)).insert_axis(Axis(0))
        })
    }

    /// Repeat a `(n, 1)` column `m` times, `(n, 1) -> (n, m)`.
    pub fn broadcast_cols(&self, m: usize) -> Var {
        let (n, one) = self.shape();
        assert_eq!(one, 1, "broadcast_cols expects a column, got ({n}, {one})");
        self.tape.unary(self, Op::BroadcastCols(self.id), |a| {
            Array2::from_shape_fn((n, m), |(i, _)| a[[i, 0]])
        })
    }

    /// Repeat a `(1, m)` row `n` times, `(1, m) -> (n, m)`.
    pub fn broadcast_rows(&self, n: usize) -> Var {
        let (one, m) = self.shape();
        assert_eq!(one, 1, "broadcast_rows expects a row, got ({one}, {m})");
        self.tape.unary(self, Op::BroadcastRows(self.id), |a| {
            Array2::from_shape_fn((n, m), |(_, j)| a[[0, j]])
        })
    }

    /// Fill `shape` with the value of a `(1, 1)` var.
    pub fn expand(&self, shape: (usize, usize)) -> Var {
        assert_eq!(self.shape(), (1, 1), "expand expects a scalar");
        self.tape.unary(self, Op::Expand(self.id), |a| {
            Array2::from_elem(shape, a[[0, 0]])
        })
    }
}

fn check_same_shape(a: &Var, b: &Var, what: &str) {
    assert_eq!(
        a.shape(),
        b.shape(),
        "{what} shape mismatch: {:?} vs {:?}",
        a.shape(),
        b.shape()
    );
}

impl Add for &Var {
    type Output = Var;

    fn add(self, rhs: &Var) -> Var {
        check_same_shape(self, rhs, "add");
        self.tape
            .binary(self, rhs, Op::Add(self.id, rhs.id), |a, b| a + b)
    }
}

impl Sub for &Var {
    type Output = Var;

    fn sub(self, rhs: &Var) -> Var {
        check_same_shape(self, rhs, "sub");
        self.tape
            .binary(self, rhs, Op::Sub(self.id, rhs.id), |a, b| a - b)
    }
}

impl Mul for &Var {
    type Output = Var;

    fn mul(self, rhs: &Var) -> Var {
        check_same_shape(self, rhs, "mul");
        self.tape
            .binary(self, rhs, Op::Mul(self.id, rhs.id), |a, b| a * b)
    }
}

impl Neg for &Var {
    type Output = Var;

    fn neg(self) -> Var {
        self.scale(-1.0)
    }
}

impl Neg for Var {
    type Output = Var;

    fn neg(self) -> Var {
        self.scale(-1.0)
    }
}
