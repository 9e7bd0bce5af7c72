use std::{fs, path::PathBuf};

use ndarray::{Array2, ArrayView2, Axis, s};
use rand::{Rng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

use crate::{ModelErr, Result};

/// An in memory supervised dataset, one sample per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    x: Array2<f32>,
    y: Array2<f32>,
}

impl Dataset {
    /// Creates a new `Dataset`.
    ///
    /// # Arguments
    /// * `x` - The features, shaped `(samples, x_size)`.
    /// * `y` - The labels, shaped `(samples, y_size)`.
    ///
    /// # Returns
    /// A `Dataset` error if both matrices don't have the same amount of rows.
    pub fn new(x: Array2<f32>, y: Array2<f32>) -> Result<Self> {
        if x.nrows() != y.nrows() {
            let text = format!("{} feature rows but {} label rows", x.nrows(), y.nrows());
            return Err(ModelErr::Dataset(text));
        }

        Ok(Self { x, y })
    }

    /// Creates a `Dataset` with no samples.
    pub fn empty(x_size: usize, y_size: usize) -> Self {
        Self {
            x: Array2::zeros((0, x_size)),
            y: Array2::zeros((0, y_size)),
        }
    }

    /// Creates a new `Dataset` from a flat buffer of rows.
    ///
    /// Each row holds `x_size` features followed by `y_size` labels.
    ///
    /// # Arguments
    /// * `data` - The row-major samples.
    /// * `x_size` - The amount of features per sample.
    /// * `y_size` - The amount of labels per sample.
    pub fn from_flat(data: &[f32], x_size: usize, y_size: usize) -> Result<Self> {
        let row = x_size + y_size;
        if x_size == 0 || y_size == 0 || data.len() % row != 0 {
            let text = format!(
                "{} values can't be split in rows of {x_size} features and {y_size} labels",
                data.len()
            );
            return Err(ModelErr::Dataset(text));
        }

        let rows = data.len() / row;
        let full = ArrayView2::from_shape((rows, row), data)
            .map_err(|e| ModelErr::Dataset(e.to_string()))?;

        let x = full.slice(s![.., ..x_size]).to_owned();
        let y = full.slice(s![.., x_size..]).to_owned();
        Self::new(x, y)
    }

    /// Parses a comma separated file where each line is a sample.
    ///
    /// # Arguments
    /// * `text` - The whole file contents.
    /// * `x_size` - The amount of features per sample.
    /// * `y_size` - The amount of labels per sample.
    /// * `has_header` - Whether the first line must be skipped.
    pub fn from_csv(text: &str, x_size: usize, y_size: usize, has_header: bool) -> Result<Self> {
        let mut data = Vec::new();
        let skip = usize::from(has_header);

        for (i, line) in text.lines().enumerate().skip(skip) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let before = data.len();
            for field in line.split(',') {
                let value = field.trim().parse::<f32>().map_err(|e| {
                    ModelErr::Dataset(format!("line {}: {field:?} is not a number: {e}", i + 1))
                })?;
                data.push(value);
            }

            let width = data.len() - before;
            if width != x_size + y_size {
                let text = format!(
                    "line {}: expected {} fields, found {width}",
                    i + 1,
                    x_size + y_size
                );
                return Err(ModelErr::Dataset(text));
            }
        }

        Self::from_flat(&data, x_size, y_size)
    }

    pub fn len(&self) -> usize {
        self.x.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn x_size(&self) -> usize {
        self.x.ncols()
    }

    pub fn y_size(&self) -> usize {
        self.y.ncols()
    }

    pub fn x(&self) -> ArrayView2<'_, f32> {
        self.x.view()
    }

    pub fn y(&self) -> ArrayView2<'_, f32> {
        self.y.view()
    }

    /// Takes the `index`-th of `count` contiguous shards of this dataset.
    ///
    /// Every shard holds `len / count` samples, the last one also gets the remainder.
    ///
    /// # Arguments
    /// * `index` - The zero based shard index.
    /// * `count` - The total amount of shards.
    pub fn partition(&self, index: usize, count: usize) -> Result<Self> {
        if count == 0 || index >= count {
            let text = format!("can't take shard {index} out of {count}");
            return Err(ModelErr::Dataset(text));
        }

        let size = self.len() / count;
        let start = index * size;
        let end = if index + 1 == count {
            self.len()
        } else {
            start + size
        };

        Ok(Self {
            x: self.x.slice(s![start..end, ..]).to_owned(),
            y: self.y.slice(s![start..end, ..]).to_owned(),
        })
    }

    /// Splits the dataset in two, the first part holding `ratio` of the samples.
    pub fn split(&self, ratio: f32) -> (Self, Self) {
        let ratio = ratio.clamp(0.0, 1.0);
        let cut = ((self.len() as f32) * ratio).round() as usize;

        let head = Self {
            x: self.x.slice(s![..cut, ..]).to_owned(),
            y: self.y.slice(s![..cut, ..]).to_owned(),
        };

        let tail = Self {
            x: self.x.slice(s![cut.., ..]).to_owned(),
            y: self.y.slice(s![cut.., ..]).to_owned(),
        };

        (head, tail)
    }

    /// Shuffles the samples in place, keeping every feature row with its labels.
    pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);

        self.x = self.x.select(Axis(0), &order);
        self.y = self.y.select(Axis(0), &order);
    }

    /// Iterates over the dataset in batches of at most `batch_size` samples.
    pub fn batches(
        &self,
        batch_size: usize,
    ) -> impl Iterator<Item = (ArrayView2<'_, f32>, ArrayView2<'_, f32>)> {
        let batch_size = batch_size.max(1);

        self.x
            .axis_chunks_iter(Axis(0), batch_size)
            .zip(self.y.axis_chunks_iter(Axis(0), batch_size))
    }
}

/// Where a client gets its training samples from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetSource {
    Inline {
        x_size: usize,
        y_size: usize,
        data: Vec<f32>,
    },
    Csv {
        path: PathBuf,
        x_size: usize,
        y_size: usize,
        #[serde(default)]
        has_header: bool,
    },
}

impl DatasetSource {
    /// Materializes the dataset described by this source.
    pub fn load(&self) -> Result<Dataset> {
        match self {
            DatasetSource::Inline {
                x_size,
                y_size,
                data,
            } => Dataset::from_flat(data, *x_size, *y_size),
            DatasetSource::Csv {
                path,
                x_size,
                y_size,
                has_header,
            } => {
                let text = fs::read_to_string(path)
                    .map_err(|e| ModelErr::Dataset(format!("{}: {e}", path.display())))?;

                Dataset::from_csv(&text, *x_size, *y_size, *has_header)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn sample(rows: usize) -> Dataset {
        let data: Vec<f32> = (0..rows).flat_map(|i| [i as f32, i as f32 * 2.0]).collect();
        Dataset::from_flat(&data, 1, 1).unwrap()
    }

    #[test]
    fn test_partition_gives_remainder_to_last_shard() {
        let ds = sample(10);

        let sizes: Vec<usize> = (0..3).map(|i| ds.partition(i, 3).unwrap().len()).collect();
        assert_eq!(sizes, vec![3, 3, 4]);

        let last = ds.partition(2, 3).unwrap();
        assert_eq!(last.x()[[0, 0]], 6.0);
    }

    #[test]
    fn test_partition_out_of_range_fails() {
        let ds = sample(4);
        assert!(ds.partition(3, 3).is_err());
        assert!(ds.partition(0, 0).is_err());
    }

    #[test]
    fn test_from_csv_skips_header_and_blank_lines() {
        let text = "a,b,y\n1,2,3\n\n4,5,6\n";
        let ds = Dataset::from_csv(text, 2, 1, true).unwrap();

        assert_eq!(ds.len(), 2);
        assert_eq!(ds.y()[[1, 0]], 6.0);
    }

    #[test]
    fn test_from_csv_rejects_wrong_width() {
        let text = "1,2,3\n4,5\n";
        assert!(Dataset::from_csv(text, 2, 1, false).is_err());
    }

    #[test]
    fn test_shuffle_keeps_rows_paired() {
        let mut ds = sample(16);
        let mut rng = StdRng::seed_from_u64(7);
        ds.shuffle(&mut rng);

        for (x, y) in ds.x().rows().into_iter().zip(ds.y().rows()) {
            assert_eq!(x[0] * 2.0, y[0]);
        }
    }

    #[test]
    fn test_batches_cover_all_samples() {
        let ds = sample(7);
        let sizes: Vec<usize> = ds.batches(3).map(|(x, _)| x.nrows()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
    }
}
