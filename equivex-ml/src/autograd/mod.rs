//! Tape-based reverse-mode autodiff with second-order support.
//!
//! The tape is small on purpose: it only has to cover last-layer losses,
//! SimplEx pre-weights and linear concept probes. Its one unusual property is
//! that backward rules are recorded as tape ops, so `grad` of a `grad` works.

pub mod hvp;
pub mod loss;
pub mod optim;
pub mod tape;

pub use hvp::{flatten_vars, hessian_vector_product};
pub use loss::{cross_entropy, quadratic_form, softmax_rows};
pub use optim::Adam;
pub use tape::{Tape, Var};
