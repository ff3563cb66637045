//! KV cache for autoregressive decoding.
//!
//! - [`KvCache`]: one append-only key/value store per decoder layer.
//! - [`LayerCaches`]: the ordered set of per-layer caches owned by a model,
//!   reset in bulk between generation sessions.
//!
//! Tensors use the `[batch, num_heads, seq, head_dim]` layout, so the
//! sequence axis is [`SEQ_DIM`].

use candle_core::Tensor;

use crate::error::{Error, Result};

/// Axis along which cached keys and values grow.
pub const SEQ_DIM: usize = 2;

// ─── Per-layer cache ────────────────────────────────────────────────────────

/// KV cache for a single decoder layer (concat-based).
#[derive(Debug, Clone, Default)]
pub enum KvCache {
    /// Nothing cached yet.
    #[default]
    Empty,
    /// Keys and values share every dimension except possibly batch/heads/
    /// head_dim of the caller's choosing; their sequence lengths are equal.
    Populated { keys: Tensor, values: Tensor },
}

impl KvCache {
    pub fn new() -> Self {
        Self::Empty
    }

    /// Append `new_keys`/`new_values` along the sequence axis and return the
    /// full accumulated keys and values.
    ///
    /// An empty cache adopts the inputs as-is. Keys and values must have the
    /// same shape, and must match the cached prefix on every axis but
    /// [`SEQ_DIM`].
    pub fn update(&mut self, new_keys: &Tensor, new_values: &Tensor) -> Result<(Tensor, Tensor)> {
        if new_keys.dims() != new_values.dims() {
            return Err(Error::precondition(format!(
                "KV cache update: keys {:?} and values {:?} differ in shape",
                new_keys.dims(),
                new_values.dims()
            )));
        }
        if new_keys.dtype() != new_values.dtype() {
            return Err(Error::precondition(format!(
                "KV cache update: keys are {:?} but values are {:?}",
                new_keys.dtype(),
                new_values.dtype()
            )));
        }
        if !new_keys.device().same_device(new_values.device()) {
            return Err(Error::precondition(
                "KV cache update: keys and values live on different devices",
            ));
        }
        if new_keys.rank() <= SEQ_DIM {
            return Err(Error::precondition(format!(
                "KV cache update: expected rank > {}, got {:?}",
                SEQ_DIM,
                new_keys.dims()
            )));
        }

        let (keys, values) = match self {
            KvCache::Empty => (new_keys.clone(), new_values.clone()),
            KvCache::Populated { keys, values } => {
                check_prefix_compatible(keys, new_keys)?;
                (
                    Tensor::cat(&[&*keys, new_keys], SEQ_DIM)?,
                    Tensor::cat(&[&*values, new_values], SEQ_DIM)?,
                )
            }
        };

        *self = KvCache::Populated {
            keys: keys.clone(),
            values: values.clone(),
        };
        Ok((keys, values))
    }

    /// Number of cached positions, or 0 when empty.
    pub fn sequence_length(&self) -> usize {
        match self {
            KvCache::Empty => 0,
            KvCache::Populated { keys, .. } => keys.dims()[SEQ_DIM],
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, KvCache::Empty)
    }

    pub fn keys(&self) -> Option<&Tensor> {
        match self {
            KvCache::Empty => None,
            KvCache::Populated { keys, .. } => Some(keys),
        }
    }

    pub fn values(&self) -> Option<&Tensor> {
        match self {
            KvCache::Empty => None,
            KvCache::Populated { values, .. } => Some(values),
        }
    }

    /// Drop both tensors. Safe on an already-empty cache.
    pub fn reset(&mut self) {
        *self = KvCache::Empty;
    }
}

fn check_prefix_compatible(cached: &Tensor, incoming: &Tensor) -> Result<()> {
    if cached.dtype() != incoming.dtype() {
        return Err(Error::precondition(format!(
            "KV cache update: incoming {:?} does not match cached {:?}",
            incoming.dtype(),
            cached.dtype()
        )));
    }
    if !cached.device().same_device(incoming.device()) {
        return Err(Error::precondition(
            "KV cache update: incoming tensors are on a different device than the cache",
        ));
    }
    let a = cached.dims();
    let b = incoming.dims();
    let compatible = a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .enumerate()
            .all(|(axis, (x, y))| axis == SEQ_DIM || x == y);
    if compatible {
        Ok(())
    } else {
        Err(Error::precondition(format!(
            "KV cache update: incoming {:?} does not extend cached {:?}",
            b, a
        )))
    }
}

// ─── Layer cache set ────────────────────────────────────────────────────────

/// One [`KvCache`] per decoder layer; index `i` is always layer `i`.
#[derive(Debug, Clone)]
pub struct LayerCaches {
    layers: Vec<KvCache>,
}

impl LayerCaches {
    /// Create `num_layers` empty caches.
    pub fn new(num_layers: usize) -> Self {
        Self {
            layers: (0..num_layers).map(|_| KvCache::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Cache for decoder layer `index`.
    ///
    /// # Panics
    ///
    /// Panics when `index >= self.len()`; a layer index outside the model is
    /// a programming error.
    pub fn at(&mut self, index: usize) -> &mut KvCache {
        let len = self.layers.len();
        self.layers
            .get_mut(index)
            .unwrap_or_else(|| panic!("layer index {index} out of range for {len} layers"))
    }

    pub fn get(&self, index: usize) -> Option<&KvCache> {
        self.layers.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, KvCache> {
        self.layers.iter()
    }

    /// Layers in decoder order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, KvCache> {
        self.layers.iter_mut()
    }

    /// The sequence length shared by every layer, or `None` when layers
    /// disagree. An empty set reports `Some(0)`.
    pub fn sequence_length(&self) -> Option<usize> {
        let mut lengths = self.layers.iter().map(KvCache::sequence_length);
        let first = lengths.next().unwrap_or(0);
        lengths.all(|len| len == first).then_some(first)
    }

    /// Reset every layer without reallocating the collection.
    pub fn reset_all(&mut self) {
        for cache in self.layers.iter_mut() {
            cache.reset();
        }
    }
}
