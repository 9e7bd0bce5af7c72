use ndarray::{Array1, Array2, ArrayView2, Axis, Ix1, Ix2};
use rand::{SeedableRng, rngs::StdRng};

use super::{EvalMetrics, TrainMetrics, Trainer};
use crate::{ModelErr, ParameterMap, Result, dataset::Dataset};

const WEIGHT: &str = "layer0.weight";
const BIAS: &str = "layer0.bias";

/// Mini-batch gradient descent over a single dense layer with mean squared error.
///
/// The layer reads `layer0.weight`, shaped `(outputs, inputs)`, and `layer0.bias`.
pub struct LinearTrainer {
    train: Dataset,
    test: Dataset,
    learning_rate: f32,
    batch_size: usize,
    rng: StdRng,
}

impl LinearTrainer {
    /// Creates a new `LinearTrainer`.
    ///
    /// # Arguments
    /// * `train` - The partition used for training.
    /// * `test` - The partition used for evaluation.
    /// * `learning_rate` - The length of the steps taken on every batch.
    /// * `batch_size` - The amount of samples per step.
    /// * `seed` - Seeds the shuffling of the training partition.
    pub fn new(
        train: Dataset,
        test: Dataset,
        learning_rate: f32,
        batch_size: usize,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            train,
            test,
            learning_rate,
            batch_size: batch_size.max(1),
            rng,
        }
    }

    /// Creates a `LinearTrainer` that only evaluates on `test`.
    pub fn evaluator(test: Dataset) -> Self {
        let train = Dataset::empty(test.x_size(), test.y_size());
        Self::new(train, test, 0.0, 1, Some(0))
    }

    fn unpack(params: &ParameterMap) -> Result<(Array2<f32>, Array1<f32>)> {
        let (Some(w), Some(b)) = (params.get(WEIGHT), params.get(BIAS)) else {
            let missing = [WEIGHT, BIAS]
                .into_iter()
                .filter(|key| params.get(key).is_none())
                .map(String::from)
                .collect();

            return Err(ModelErr::ParameterMismatch {
                missing,
                unexpected: Vec::new(),
            });
        };

        let w = w
            .clone()
            .into_dimensionality::<Ix2>()
            .map_err(|_| shape_err(WEIGHT, params, &[b.len(), 0]))?;
        let b = b
            .clone()
            .into_dimensionality::<Ix1>()
            .map_err(|_| shape_err(BIAS, params, &[w.nrows()]))?;

        if w.nrows() != b.len() {
            return Err(shape_err(BIAS, params, &[w.nrows()]));
        }

        Ok((w, b))
    }

    fn check_dataset(w: &Array2<f32>, ds: &Dataset) -> Result<()> {
        if ds.x_size() != w.ncols() || ds.y_size() != w.nrows() {
            let text = format!(
                "samples of {}x{} don't fit a layer of {}x{}",
                ds.x_size(),
                ds.y_size(),
                w.ncols(),
                w.nrows()
            );
            return Err(ModelErr::Dataset(text));
        }

        Ok(())
    }
}

impl Trainer for LinearTrainer {
    fn train_one_round(
        &mut self,
        params: &ParameterMap,
        epochs: usize,
    ) -> Result<(ParameterMap, TrainMetrics)> {
        let (mut w, mut b) = Self::unpack(params)?;
        Self::check_dataset(&w, &self.train)?;

        if self.train.is_empty() {
            return Err(ModelErr::Dataset("the training partition is empty".into()));
        }

        let mut loss = 0.0;
        let lr = self.learning_rate;

        for _ in 0..epochs.max(1) {
            self.train.shuffle(&mut self.rng);
            let mut total = 0.0;

            for (x, y) in self.train.batches(self.batch_size) {
                let n = x.nrows() as f32;
                let err = predict(&w, &b, x) - y;
                total += err.mapv(|e| e * e).sum();

                let grad_w = err.t().dot(&x) * (2.0 / n);
                let grad_b = err.sum_axis(Axis(0)) * (2.0 / n);

                w.scaled_add(-lr, &grad_w);
                b.scaled_add(-lr, &grad_b);
            }

            loss = total / (self.train.len() * self.train.y_size()) as f32;
        }

        let accuracy = accuracy(&predict(&w, &b, self.train.x()), self.train.y());

        let mut updated = ParameterMap::new();
        updated.insert(WEIGHT, w.into_dyn());
        updated.insert(BIAS, b.into_dyn());

        let metrics = TrainMetrics {
            loss,
            accuracy: Some(accuracy),
            samples: self.train.len(),
        };

        Ok((updated, metrics))
    }

    fn evaluate(&mut self, params: &ParameterMap) -> Result<EvalMetrics> {
        let (w, b) = Self::unpack(params)?;
        Self::check_dataset(&w, &self.test)?;

        if self.test.is_empty() {
            return Err(ModelErr::Dataset("the test partition is empty".into()));
        }

        let pred = predict(&w, &b, self.test.x());
        let err = &pred - &self.test.y();
        let loss = err.mapv(|e| e * e).mean().unwrap_or(0.0);

        Ok(EvalMetrics {
            accuracy: accuracy(&pred, self.test.y()),
            loss,
        })
    }
}

fn predict(w: &Array2<f32>, b: &Array1<f32>, x: ArrayView2<f32>) -> Array2<f32> {
    x.dot(&w.t()) + b
}

/// Single output models are scored by rounding, wider ones by argmax.
fn accuracy(pred: &Array2<f32>, y: ArrayView2<f32>) -> f32 {
    let hits = pred
        .rows()
        .into_iter()
        .zip(y.rows())
        .filter(|(p, t)| {
            if p.len() == 1 {
                p[0].round() == t[0].round()
            } else {
                argmax(p.iter()) == argmax(t.iter())
            }
        })
        .count();

    hits as f32 / pred.nrows().max(1) as f32
}

fn argmax<'a>(values: impl Iterator<Item = &'a f32>) -> usize {
    values
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

fn shape_err(key: &str, params: &ParameterMap, expected: &[usize]) -> ModelErr {
    ModelErr::ShapeMismatch {
        key: key.to_string(),
        got: params.get(key).map(|t| t.shape().to_vec()).unwrap_or_default(),
        expected: expected.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array1, Array2};

    use super::*;

    // y = 2x + 1
    fn line(rows: usize) -> Dataset {
        let data: Vec<f32> = (0..rows)
            .flat_map(|i| {
                let x = i as f32 / rows as f32;
                [x, 2.0 * x + 1.0]
            })
            .collect();

        Dataset::from_flat(&data, 1, 1).unwrap()
    }

    fn zeros() -> ParameterMap {
        let mut params = ParameterMap::new();
        params.insert(WEIGHT, Array2::<f32>::zeros((1, 1)).into_dyn());
        params.insert(BIAS, Array1::<f32>::zeros(1).into_dyn());
        params
    }

    #[test]
    fn test_training_lowers_loss() {
        let mut trainer = LinearTrainer::new(line(64), line(16), 0.1, 8, Some(1));
        let params = zeros();

        let before = trainer.evaluate(&params).unwrap();
        let (trained, metrics) = trainer.train_one_round(&params, 20).unwrap();
        let after = trainer.evaluate(&trained).unwrap();

        assert!(after.loss < before.loss);
        assert_eq!(metrics.samples, 64);
        assert!(params.check_layout(&trained).is_ok());
    }

    #[test]
    fn test_training_does_not_touch_input() {
        let mut trainer = LinearTrainer::new(line(8), line(4), 0.1, 4, Some(1));
        let params = zeros();
        trainer.train_one_round(&params, 1).unwrap();
        assert_eq!(params, zeros());
    }

    #[test]
    fn test_missing_layer_is_a_mismatch() {
        let mut trainer = LinearTrainer::new(line(8), line(4), 0.1, 4, Some(1));
        let mut params = ParameterMap::new();
        params.insert(WEIGHT, Array2::<f32>::zeros((1, 1)).into_dyn());

        let res = trainer.train_one_round(&params, 1);
        assert!(matches!(res, Err(ModelErr::ParameterMismatch { .. })));
    }

    #[test]
    fn test_evaluator_refuses_to_train() {
        let mut evaluator = LinearTrainer::evaluator(line(4));

        assert!(evaluator.evaluate(&zeros()).is_ok());
        assert!(matches!(
            evaluator.train_one_round(&zeros(), 1),
            Err(ModelErr::Dataset(_))
        ));
    }

    #[test]
    fn test_argmax_accuracy() {
        let pred = Array2::from_shape_vec((2, 3), vec![0.1, 0.8, 0.1, 0.9, 0.0, 0.1]).unwrap();
        let y = Array2::from_shape_vec((2, 3), vec![0.0, 1.0, 0.0, 0.0, 0.0, 1.0]).unwrap();
        assert_eq!(accuracy(&pred, y.view()), 0.5);
    }
}
