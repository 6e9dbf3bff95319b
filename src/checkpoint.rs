//! Saving and loading model parameters with bincode.

use crate::config::MaeConfig;
use crate::error::{MaeError, Result};
use crate::models::mae::MaskedAutoencoder;
use crate::models::ReconstructionModel;
use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

/// The run config plus every parameter, in `parameters()` order.
#[derive(Serialize, Deserialize)]
struct Checkpoint {
    config: MaeConfig,
    params: Vec<ArrayD<f32>>,
}

fn io_error(context: String) -> impl FnOnce(std::io::Error) -> MaeError {
    move |source| MaeError::Io { context, source }
}

/// Serializes through a buffer and flushes it, so late write failures surface as errors.
fn write_checkpoint<W: Write>(sink: W, checkpoint: &Checkpoint, context: String) -> Result<()> {
    let mut writer = BufWriter::new(sink);
    bincode::serialize_into(&mut writer, checkpoint)?;
    writer.flush().map_err(io_error(context))
}

pub fn save_checkpoint(
    model: &MaskedAutoencoder,
    config: &MaeConfig,
    path: impl AsRef<Path>,
) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(io_error(format!("creating {}", parent.display())))?;
    }

    let checkpoint = Checkpoint {
        config: config.clone(),
        params: ReconstructionModel::parameters(model)
            .iter()
            .map(|p| p.data().clone())
            .collect(),
    };

    let file = File::create(path).map_err(io_error(format!("creating {}", path.display())))?;
    write_checkpoint(file, &checkpoint, format!("writing {}", path.display()))?;
    info!(path = %path.display(), "checkpoint saved");
    Ok(())
}

/// Rebuilds the model described by the stored config and copies the stored parameters in.
pub fn load_checkpoint(path: impl AsRef<Path>) -> Result<(MaskedAutoencoder, MaeConfig)> {
    let path = path.as_ref();
    let file = File::open(path).map_err(io_error(format!("opening {}", path.display())))?;
    let loaded: Checkpoint = bincode::deserialize_from(BufReader::new(file))?;
    loaded.config.validate()?;

    let mut rng = StdRng::seed_from_u64(loaded.config.seed);
    let model = MaskedAutoencoder::new(&loaded.config.model_config(), &mut rng)?;
    let model_params = ReconstructionModel::parameters(&model);

    if loaded.params.len() != model_params.len() {
        return Err(MaeError::shape(
            "checkpoint parameter count",
            model_params.len(),
            loaded.params.len(),
        ));
    }
    for (p, data) in model_params.iter().zip(loaded.params) {
        if p.shape() != data.shape() {
            return Err(MaeError::shape("checkpoint parameter", p.shape(), data.shape()));
        }
        p.set_data(data);
    }

    info!(path = %path.display(), "checkpoint loaded");
    Ok((model, loaded.config))
}
