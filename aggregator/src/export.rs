use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use log::info;
use model::ParameterMap;

use crate::Result;

/// Persists the global model.
pub trait ModelExporter: Send + Sync {
    /// Persists `params` as the checkpoint of `round`.
    fn checkpoint(&mut self, round: usize, params: &ParameterMap) -> Result<()>;

    /// Persists `params` as the outcome of the experiment.
    fn export_final(&mut self, params: &ParameterMap) -> Result<()>;
}

/// Writes the global model as JSON files into a directory.
#[derive(Debug, Clone)]
pub struct JsonExporter {
    dir: PathBuf,
}

impl JsonExporter {
    /// Creates a new `JsonExporter`, creating `dir` if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn write(&self, name: &str, params: &ParameterMap) -> Result<PathBuf> {
        let path = self.dir.join(name);
        let mut out = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(&mut out, params)?;
        out.flush()?;
        Ok(path)
    }
}

impl ModelExporter for JsonExporter {
    fn checkpoint(&mut self, round: usize, params: &ParameterMap) -> Result<()> {
        let path = self.write(&format!("checkpoint_round_{round}.json"), params)?;
        info!(round = round; "checkpoint written to {}", path.display());
        Ok(())
    }

    fn export_final(&mut self, params: &ParameterMap) -> Result<()> {
        let path = self.write("final_model.json", params)?;
        info!("final model written to {}", path.display());
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExporter;

impl ModelExporter for NoopExporter {
    fn checkpoint(&mut self, _round: usize, _params: &ParameterMap) -> Result<()> {
        Ok(())
    }

    fn export_final(&mut self, _params: &ParameterMap) -> Result<()> {
        Ok(())
    }
}
