//! Trains a small masked autoencoder on synthetic images.
//!
//! ```bash
//! cargo run --release --example masked_reconstruction -- --epochs 3 --mask-ratio 0.75
//! RUST_LOG=debug cargo run --example masked_reconstruction -- --config run.json --save-path models/mae.bin
//! ```

use rand::rngs::StdRng;
use rand::SeedableRng;
use rusty_mae::checkpoint::{load_checkpoint, save_checkpoint};
use rusty_mae::config::{MaeConfig, OptimizerKind};
use rusty_mae::data::{synthetic_dataset, ChannelStats, ImageBatchLoader};
use rusty_mae::loss::masked_mse;
use rusty_mae::models::mae::MaskedAutoencoder;
use rusty_mae::models::ReconstructionModel;
use rusty_mae::optimizer::{Adam, Optimizer, SGD};
use rusty_mae::pipeline::MaskedReconstruction;
use rusty_mae::tensor::MATMUL_TIME_NS;
use rusty_mae::Result;
use std::env;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::time::Instant;
use sysinfo::{ProcessExt, System, SystemExt};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const NUM_IMAGES: usize = 256;

fn get_arg_value(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == key)
        .and_then(|pos| args.get(pos + 1).cloned())
}

fn parse_arg<T: FromStr>(args: &[String], key: &str) -> Option<T> {
    let raw = get_arg_value(args, key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(flag = key, value = %raw, "ignoring unparsable flag");
            None
        }
    }
}

fn report_memory_usage(system: &mut System, stage: &str) {
    if let Ok(pid) = sysinfo::get_current_pid() {
        system.refresh_process(pid);
        if let Some(process) = system.process(pid) {
            let memory_mb = process.memory() as f64 / (1024.0 * 1024.0);
            info!(stage, memory_mb = %format!("{memory_mb:.2}"), "memory usage");
        }
    }
}

fn load_config(args: &[String]) -> Result<MaeConfig> {
    let mut config = match get_arg_value(args, "--config") {
        Some(path) => MaeConfig::from_json_file(path)?,
        None => MaeConfig::default(),
    };
    if let Some(v) = parse_arg(args, "--epochs") {
        config.epochs = v;
    }
    if let Some(v) = parse_arg(args, "--batch-size") {
        config.batch_size = v;
    }
    if let Some(v) = parse_arg(args, "--mask-ratio") {
        config.mask_ratio = v;
    }
    if let Some(v) = parse_arg(args, "--learning-rate") {
        config.learning_rate = v;
    }
    if let Some(v) = parse_arg(args, "--seed") {
        config.seed = v;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: &[String]) -> Result<()> {
    info!("[Step 1: Configuration]");
    let (model, config) = match get_arg_value(args, "--load-path") {
        Some(path) => {
            info!(path = %path, "continuing from checkpoint");
            let (model, config) = load_checkpoint(&path)?;
            (model, config)
        }
        None => {
            let config = load_config(args)?;
            let mut rng = StdRng::seed_from_u64(config.seed);
            (MaskedAutoencoder::new(&config.model_config(), &mut rng)?, config)
        }
    };
    info!(
        image_size = config.image_size,
        patch_size = config.patch_size,
        num_patches = config.num_patches(),
        mask_ratio = config.mask_ratio,
        epochs = config.epochs,
        batch_size = config.batch_size,
        "configuration"
    );

    info!("[Step 2: Data]");
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
    let dataset = synthetic_dataset(NUM_IMAGES, config.channels, config.image_size, &mut rng)?;
    let (train, valid) = dataset.split(0.9);
    let stats = ChannelStats::from_dataset(&train);
    let train = train.normalized(&stats)?;
    let valid = valid.map(|v| v.normalized(&stats)).transpose()?;
    info!(train = train.len(), valid = valid.as_ref().map_or(0, |v| v.len()), "synthetic dataset ready");

    info!("[Step 3: Optimizer]");
    let params = ReconstructionModel::parameters(&model);
    let mut optimizer: Box<dyn Optimizer> = match (config.optimizer, config.clip_norm) {
        (OptimizerKind::Sgd, Some(c)) => Box::new(SGD::new(params, config.learning_rate).with_clip_norm(c)),
        (OptimizerKind::Sgd, None) => Box::new(SGD::new(params, config.learning_rate)),
        (OptimizerKind::Adam, Some(c)) => Box::new(Adam::new(params, config.learning_rate).with_clip_norm(c)),
        (OptimizerKind::Adam, None) => Box::new(Adam::new(params, config.learning_rate)),
    };

    info!("[Step 4: Training]");
    let pipeline = MaskedReconstruction::new(config.codec()?, config.masking_policy()?);
    let mut system = System::new_all();
    report_memory_usage(&mut system, "before training");
    MATMUL_TIME_NS.store(0, Ordering::Relaxed);

    let training_start = Instant::now();
    for epoch in 0..config.epochs {
        let loader = ImageBatchLoader::shuffled(&train, config.batch_size, &mut rng);
        match pipeline.train_epoch(&model, optimizer.as_mut(), loader, &mut rng)? {
            Some(loss) => info!(epoch = epoch + 1, epochs = config.epochs, loss, "epoch finished"),
            None => warn!(epoch = epoch + 1, "epoch produced no batches"),
        }
        report_memory_usage(&mut system, &format!("end of epoch {}", epoch + 1));
    }
    let training_time = training_start.elapsed();
    let matmul_s = MATMUL_TIME_NS.load(Ordering::Relaxed) as f64 / 1e9;
    info!(
        seconds = training_time.as_secs_f64(),
        matmul_seconds = matmul_s,
        matmul_share = %format!("{:.1}%", 100.0 * matmul_s / training_time.as_secs_f64().max(1e-9)),
        "training finished"
    );

    info!("[Step 5: Evaluation]");
    if let Some(valid) = &valid {
        let mut eval_rng = StdRng::seed_from_u64(config.seed.wrapping_add(2));
        let loader = ImageBatchLoader::new(valid, config.batch_size);
        match pipeline.evaluate(&model, loader, &mut eval_rng)? {
            Some(loss) => info!(loss, "validation masked loss"),
            None => warn!("validation set smaller than one batch"),
        }

        if let Some(batch) = ImageBatchLoader::new(valid, config.batch_size.min(valid.len())).next() {
            let output = pipeline.forward(&model, batch.view(), &mut eval_rng)?;
            let reconstructed = output.reconstruction_array()?;
            let visible = output.masking.mask.mapv(|m| 1.0 - m);
            let hidden_err = masked_mse(output.patches.view(), reconstructed.view(), output.masking.mask.view()).ok();
            let visible_err = masked_mse(output.patches.view(), reconstructed.view(), visible.view()).ok();
            info!(?hidden_err, ?visible_err, "patch error on one validation batch");

            let mut vis = pipeline.visualize(&output)?;
            stats.denormalize(vis.original.view_mut())?;
            stats.denormalize(vis.pasted.view_mut())?;
            let pixel_mae = (&vis.pasted - &vis.original).mapv(f32::abs).mean().unwrap_or(0.0);
            info!(
                images = vis.original.dim().0,
                pixel_mae = %format!("{pixel_mae:.4}"),
                "decoded visualization batch"
            );
        }
    }

    if let Some(path) = get_arg_value(args, "--save-path") {
        info!("[Step 6: Saving Model]");
        save_checkpoint(&model, &config, &path)?;
    }

    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
