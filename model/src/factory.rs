use log::debug;
use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};

use crate::{ModelErr, ParameterMap, Result};

/// How the weights of a layer are initialized. Biases always start at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitSpec {
    Const { value: f32 },
    Uniform { low: f32, high: f32 },
    Normal { mean: f32, std_dev: f32 },
    #[default]
    XavierUniform,
    Kaiming,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    /// `(inputs, outputs)` of the layer.
    pub dim: (usize, usize),
    #[serde(default)]
    pub init: InitSpec,
}

/// The architecture of the global model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    /// A stack of fully connected layers.
    ///
    /// Layer `i` produces the keys `layer{i}.weight`, shaped `(outputs, inputs)`,
    /// and `layer{i}.bias`, shaped `(outputs,)`.
    Dense { layers: Vec<LayerSpec> },
}

impl ModelSpec {
    /// Checks that the spec describes a buildable model.
    pub fn validate(&self) -> Result<()> {
        match self {
            ModelSpec::Dense { layers } => {
                if layers.is_empty() {
                    return Err(ModelErr::InvalidSpec("a dense model needs at least one layer".into()));
                }

                for (i, layer) in layers.iter().enumerate() {
                    let (n_in, n_out) = layer.dim;
                    if n_in == 0 || n_out == 0 {
                        let text = format!("layer {i} has an empty dimension {:?}", layer.dim);
                        return Err(ModelErr::InvalidSpec(text));
                    }
                }

                for (i, pair) in layers.windows(2).enumerate() {
                    if pair[0].dim.1 != pair[1].dim.0 {
                        let text = format!(
                            "layer {i} outputs {} values but layer {} takes {}",
                            pair[0].dim.1,
                            i + 1,
                            pair[1].dim.0
                        );
                        return Err(ModelErr::InvalidSpec(text));
                    }
                }

                Ok(())
            }
        }
    }
}

/// Produces the initial parameter map of a model.
pub trait ModelFactory {
    /// Builds a freshly initialized parameter map for `spec`.
    ///
    /// # Arguments
    /// * `spec` - The architecture to build.
    ///
    /// # Returns
    /// The initial parameters or an `InvalidSpec` error.
    fn build_model(&mut self, spec: &ModelSpec) -> Result<ParameterMap>;
}

/// Builds dense models sampling the weights from a random number generator.
pub struct DenseFactory<R: Rng> {
    rng: R,
}

impl<R: Rng> DenseFactory<R> {
    /// Creates a new `DenseFactory`.
    ///
    /// # Arguments
    /// * `rng` - The random number generator used to sample the weights.
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    fn init_weights(&mut self, layer: &LayerSpec) -> Result<Array2<f32>> {
        let (n_in, n_out) = layer.dim;
        let shape = (n_out, n_in);

        let weights = match layer.init {
            InitSpec::Const { value } => Array2::from_elem(shape, value),
            InitSpec::Uniform { low, high } => {
                let dist = Uniform::new(low, high).map_err(invalid)?;
                self.sample(shape, dist)
            }
            InitSpec::Normal { mean, std_dev } => {
                let dist = Normal::new(mean, std_dev).map_err(invalid)?;
                self.sample(shape, dist)
            }
            InitSpec::XavierUniform => {
                let range = (6. / (n_in + n_out) as f32).sqrt();
                let dist = Uniform::new(-range, range).map_err(invalid)?;
                self.sample(shape, dist)
            }
            InitSpec::Kaiming => {
                let std_dev = (2. / n_in as f32).sqrt();
                let dist = Normal::new(0., std_dev).map_err(invalid)?;
                self.sample(shape, dist)
            }
        };

        Ok(weights)
    }

    fn sample<D: Distribution<f32>>(&mut self, shape: (usize, usize), dist: D) -> Array2<f32> {
        Array2::from_shape_simple_fn(shape, || dist.sample(&mut self.rng))
    }
}

impl DenseFactory<StdRng> {
    /// Creates a `DenseFactory` with a seeded generator, or an entropy seeded one if
    /// `seed` is `None`.
    pub fn seeded(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self::new(rng)
    }
}

impl<R: Rng> ModelFactory for DenseFactory<R> {
    fn build_model(&mut self, spec: &ModelSpec) -> Result<ParameterMap> {
        spec.validate()?;

        let ModelSpec::Dense { layers } = spec;
        let mut params = ParameterMap::new();

        for (i, layer) in layers.iter().enumerate() {
            let weights = self.init_weights(layer)?;
            let bias = Array1::<f32>::zeros(layer.dim.1);

            params.insert(format!("layer{i}.weight"), weights.into_dyn());
            params.insert(format!("layer{i}.bias"), bias.into_dyn());
        }

        debug!(layers = layers.len(), params = params.num_params(); "dense model built");
        Ok(params)
    }
}

fn invalid<E: ToString>(err: E) -> ModelErr {
    ModelErr::InvalidSpec(err.to_string())
}
