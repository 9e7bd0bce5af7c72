use std::collections::{BTreeMap, btree_map};

use ndarray::{ArrayD, IxDyn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{ModelErr, Result};

/// A dense, arbitrary rank tensor of parameters.
pub type Tensor = ArrayD<f32>;

/// A named collection of tensors holding the weights of a model.
///
/// This is the unit exchanged between the aggregator and the clients. Keys are
/// kept ordered so every holder of a map iterates it in the same order, which the
/// wire format relies on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterMap {
    tensors: BTreeMap<String, Tensor>,
}

impl ParameterMap {
    /// Creates a new empty `ParameterMap`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a tensor under `key`.
    ///
    /// # Arguments
    /// * `key` - The layer or parameter name.
    /// * `tensor` - The tensor to store.
    ///
    /// # Returns
    /// The tensor previously stored under `key`, if any.
    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(key.into(), tensor)
    }

    /// Inserts a tensor built from a flat buffer and a shape.
    ///
    /// # Arguments
    /// * `key` - The layer or parameter name.
    /// * `shape` - The dimensions of the tensor.
    /// * `data` - The row-major values, must hold exactly `shape.iter().product()` items.
    ///
    /// # Returns
    /// A `ShapeMismatch` error if the buffer doesn't fit the shape.
    pub fn insert_flat(&mut self, key: impl Into<String>, shape: &[usize], data: Vec<f32>) -> Result<()> {
        let key = key.into();
        let len = data.len();

        let tensor = ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| ModelErr::ShapeMismatch {
            key: key.clone(),
            got: vec![len],
            expected: shape.to_vec(),
        })?;

        self.tensors.insert(key, tensor);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Tensor> {
        self.tensors.iter()
    }

    /// Returns the total amount of scalar parameters across all tensors.
    pub fn num_params(&self) -> usize {
        self.tensors.values().map(|t| t.len()).sum()
    }

    /// Creates a map with the same keys and shapes as this one, filled with zeros.
    pub fn zeros_like(&self) -> Self {
        let tensors = self
            .tensors
            .iter()
            .map(|(key, t)| (key.clone(), Tensor::zeros(t.raw_dim())))
            .collect();

        Self { tensors }
    }

    /// Checks that `other` has exactly the same key set and per key shapes as `self`.
    ///
    /// # Arguments
    /// * `other` - The map to compare against.
    ///
    /// # Returns
    /// A `ParameterMismatch` error if the key sets differ or a `ShapeMismatch` error
    /// if any shared key holds tensors of different shapes.
    pub fn check_layout(&self, other: &Self) -> Result<()> {
        let missing: Vec<String> = self
            .tensors
            .keys()
            .filter(|key| !other.tensors.contains_key(*key))
            .cloned()
            .collect();

        let unexpected: Vec<String> = other
            .tensors
            .keys()
            .filter(|key| !self.tensors.contains_key(*key))
            .cloned()
            .collect();

        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(ModelErr::ParameterMismatch {
                missing,
                unexpected,
            });
        }

        for (key, tensor) in &self.tensors {
            let theirs = &other.tensors[key];

            if tensor.shape() != theirs.shape() {
                return Err(ModelErr::ShapeMismatch {
                    key: key.clone(),
                    got: theirs.shape().to_vec(),
                    expected: tensor.shape().to_vec(),
                });
            }
        }

        Ok(())
    }

    /// Adds every tensor of `other` elementwise into this map.
    ///
    /// # Arguments
    /// * `other` - A map with the same layout as `self`.
    ///
    /// # Returns
    /// A layout error if `other` doesn't match, in which case `self` is left untouched.
    pub fn accumulate(&mut self, other: &Self) -> Result<()> {
        self.check_layout(other)?;

        self.tensors.par_iter_mut().for_each(|(key, tensor)| {
            if let Some(src) = other.tensors.get(key) {
                *tensor += src;
            }
        });

        Ok(())
    }

    /// Multiplies every parameter by `factor`.
    pub fn scale(&mut self, factor: f32) {
        self.tensors
            .par_iter_mut()
            .for_each(|(_, tensor)| tensor.mapv_inplace(|x| x * factor));
    }

    /// Computes the unweighted elementwise mean of a set of maps.
    ///
    /// # Arguments
    /// * `maps` - The maps to reduce, all of them must share the same layout.
    ///
    /// # Returns
    /// The mean map, `EmptyReduction` if `maps` yields nothing or a layout error.
    pub fn mean<'a, I>(maps: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a ParameterMap>,
    {
        let mut maps = maps.into_iter();
        let mut sum = maps.next().ok_or(ModelErr::EmptyReduction)?.clone();
        let mut count = 1;

        for map in maps {
            sum.accumulate(map)?;
            count += 1;
        }

        sum.scale(1.0 / count as f32);
        Ok(sum)
    }
}

impl FromIterator<(String, Tensor)> for ParameterMap {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ParameterMap {
    type Item = (&'a String, &'a Tensor);
    type IntoIter = btree_map::Iter<'a, String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.iter()
    }
}
