//! Forward-hook capture of layer activations.
//!
//! A model owns a [`HookRegistry`]. [`ActivationCapture::attach`] registers a
//! capture for one named layer and hands back the capture object, which owns
//! the buffer the activation is written into. Every forward pass through the
//! layer overwrites the buffer with the flattened, detached output.
//!
//! Callers must detach captures they no longer need: a live capture keeps
//! receiving activations from every later forward pass, including passes made
//! by unrelated code that reuses the model. [`ActivationCapture::detach`] does
//! this explicitly and dropping the capture does the same.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use ndarray::{Array2, Array4};

use crate::error::{Result, XaiError};
use crate::model::Classifier;
use crate::tensor::flatten_batch;

/// Output of a group-equivariant layer: the plain tensor plus the order of
/// the group its channels are indexed by.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometricTensor {
    pub tensor: Array4<f64>,
    pub group_order: usize,
}

/// Value flowing between layers.
#[derive(Debug, Clone, PartialEq)]
pub enum Activation {
    Dense(Array2<f64>),
    Spatial(Array4<f64>),
    Geometric(GeometricTensor),
}

impl Activation {
    /// Unwrap structured outputs and flatten to `(batch, features)`.
    pub fn flatten(&self) -> Array2<f64> {
        match self {
            Activation::Dense(x) => x.clone(),
            Activation::Spatial(x) => flatten_batch(x),
            Activation::Geometric(g) => flatten_batch(&g.tensor),
        }
    }

    pub fn batch_size(&self) -> usize {
        match self {
            Activation::Dense(x) => x.nrows(),
            Activation::Spatial(x) => x.dim().0,
            Activation::Geometric(g) => g.tensor.dim().0,
        }
    }
}

type Buffer = RefCell<Option<Array2<f64>>>;

struct Slot {
    id: u64,
    layer: String,
    buffer: Weak<Buffer>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: Cell<u64>,
    slots: RefCell<Vec<Slot>>,
}

/// Per-model table of live captures.
#[derive(Default)]
pub struct HookRegistry {
    inner: Rc<RegistryInner>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, layer: &str) -> (u64, Rc<Buffer>) {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        let buffer = Rc::new(RefCell::new(None));
        self.inner.slots.borrow_mut().push(Slot {
            id,
            layer: layer.to_string(),
            buffer: Rc::downgrade(&buffer),
        });
        (id, buffer)
    }

    /// Offer a layer output to every capture attached to `layer`.
    pub fn record(&self, layer: &str, output: &Activation) {
        let mut slots = self.inner.slots.borrow_mut();
        slots.retain(|slot| slot.buffer.strong_count() > 0);
        let mut flat: Option<Array2<f64>> = None;
        for slot in slots.iter().filter(|s| s.layer == layer) {
            if let Some(buffer) = slot.buffer.upgrade() {
                let value = flat.get_or_insert_with(|| output.flatten()).clone();
                *buffer.borrow_mut() = Some(value);
            }
        }
    }

    /// Number of captures still attached.
    pub fn active(&self) -> usize {
        self.inner
            .slots
            .borrow()
            .iter()
            .filter(|s| s.buffer.strong_count() > 0)
            .count()
    }

    pub fn is_capturing(&self, layer: &str) -> bool {
        self.inner
            .slots
            .borrow()
            .iter()
            .any(|s| s.layer == layer && s.buffer.strong_count() > 0)
    }
}

fn remove_slot(registry: &Weak<RegistryInner>, id: u64) {
    if let Some(inner) = registry.upgrade() {
        inner.slots.borrow_mut().retain(|slot| slot.id != id);
    }
}

/// Capture of one layer's activations, returned by [`ActivationCapture::attach`].
pub struct ActivationCapture {
    id: u64,
    layer: String,
    buffer: Rc<Buffer>,
    registry: Weak<RegistryInner>,
    attached: bool,
}

impl ActivationCapture {
    /// Start capturing the output of `layer` on every forward pass of `model`.
    pub fn attach<M: Classifier + ?Sized>(model: &M, layer: &str) -> Result<Self> {
        model.named_layer(layer)?;
        let registry = model.hooks();
        let (id, buffer) = registry.register(layer);
        tracing::debug!(layer, id, "attached activation capture");
        Ok(Self {
            id,
            layer: layer.to_string(),
            buffer,
            registry: Rc::downgrade(&registry.inner),
            attached: true,
        })
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn is_attached(&self) -> bool {
        self.attached && self.registry.strong_count() > 0
    }

    /// Activation recorded by the latest forward pass.
    pub fn latest(&self) -> Result<Array2<f64>> {
        self.buffer.borrow().clone().ok_or_else(|| {
            XaiError::hook(format!(
                "no forward pass recorded for layer {}",
                self.layer
            ))
        })
    }

    /// Run `model` on `x` and return the activation it produced at this layer.
    pub fn capture<M: Classifier + ?Sized>(&self, model: &M, x: &Array4<f64>) -> Result<Array2<f64>> {
        if !self.is_attached() {
            return Err(XaiError::hook(format!(
                "capture for layer {} is detached",
                self.layer
            )));
        }
        self.clear();
        model.forward(x)?;
        self.latest()
    }

    pub fn clear(&self) {
        *self.buffer.borrow_mut() = None;
    }

    /// Stop capturing. Later forward passes no longer touch this buffer.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.attached {
            remove_slot(&self.registry, self.id);
            self.attached = false;
            tracing::debug!(layer = %self.layer, id = self.id, "detached activation capture");
        }
    }
}

impl Drop for ActivationCapture {
    fn drop(&mut self) {
        self.release();
    }
}
