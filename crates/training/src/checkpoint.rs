use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors::load as load_safetensors, Device, Var};
use hex::encode as hex_encode;
use model::{AttributeAdversary, ExpressionBackbone};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
    config::Attribute,
    optimizer::{GradientScaler, GradientScalerState, OptimizerState, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerState},
    TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const BACKBONE_FILENAME: &str = "backbone.safetensors";
pub const ADVERSARY_FILENAME: &str = "adversary.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const SCALER_FILENAME: &str = "scaler.json";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Written after every epoch.
    Latest,
    /// Written when validation accuracy passes the improvement guard.
    Best,
}

impl CheckpointKind {
    pub fn prefix(self) -> &'static str {
        match self {
            CheckpointKind::Latest => "latest",
            CheckpointKind::Best => "best",
        }
    }

    /// e.g. `latest_epoch_0003_acc_0.5125`
    pub fn directory_name(self, epoch: usize, accuracy: f64) -> String {
        format!("{}_epoch_{:04}_acc_{:.4}", self.prefix(), epoch, accuracy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub kind: CheckpointKind,
    pub attribute: Attribute,
    pub epoch: usize,
    pub val_accuracy: f64,
    pub best_accuracy: f64,
    pub backbone: FileRecord,
    pub adversary: FileRecord,
    pub optimizer: FileRecord,
    pub scheduler: FileRecord,
    pub scaler: FileRecord,
}

pub struct SaveRequest<'a> {
    pub base_dir: &'a Path,
    pub kind: CheckpointKind,
    pub attribute: Attribute,
    pub epoch: usize,
    pub val_accuracy: f64,
    pub best_accuracy: f64,
    pub backbone: &'a ExpressionBackbone,
    pub adversary: &'a AttributeAdversary,
    pub optimizer: &'a TrainerOptimizer,
    pub scheduler: &'a dyn LRScheduler,
    pub scaler: &'a GradientScaler,
    /// Upper bound on retained checkpoints of the same kind.
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    pub optimizer_state: OptimizerState,
    pub scheduler_state: SchedulerState,
    pub scaler_state: GradientScalerState,
    pub backbone_weights_path: PathBuf,
    pub adversary_weights_path: PathBuf,
}

/// Outcome of a non-strict weight restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeightReport {
    pub loaded: Vec<String>,
    /// Model variables absent from the file; they keep their current values.
    pub missing: Vec<String>,
    /// File entries with no matching variable; ignored.
    pub unexpected: Vec<String>,
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(request.base_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            request.base_dir.display()
        ))
    })?;

    let checkpoint_dir = request
        .base_dir
        .join(request.kind.directory_name(request.epoch, request.val_accuracy));
    if checkpoint_dir.exists() {
        fs::remove_dir_all(&checkpoint_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to remove existing checkpoint directory {}: {err}",
                checkpoint_dir.display()
            ))
        })?;
    }
    fs::create_dir(&checkpoint_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            checkpoint_dir.display()
        ))
    })?;

    let backbone_path = checkpoint_dir.join(BACKBONE_FILENAME);
    request
        .backbone
        .save(&backbone_path)
        .map_err(|err| weights_error(&backbone_path, err))?;
    let backbone = file_record(&backbone_path)?;

    let adversary_path = checkpoint_dir.join(ADVERSARY_FILENAME);
    request
        .adversary
        .save(&adversary_path)
        .map_err(|err| weights_error(&adversary_path, err))?;
    let adversary = file_record(&adversary_path)?;

    let optimizer_path = checkpoint_dir.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, &request.optimizer.state()?)?;
    let optimizer = file_record(&optimizer_path)?;

    let scheduler_path = checkpoint_dir.join(SCHEDULER_FILENAME);
    write_json(&scheduler_path, &request.scheduler.state())?;
    let scheduler = file_record(&scheduler_path)?;

    let scaler_path = checkpoint_dir.join(SCALER_FILENAME);
    write_json(&scaler_path, &request.scaler.state())?;
    let scaler = file_record(&scaler_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        kind: request.kind,
        attribute: request.attribute,
        epoch: request.epoch,
        val_accuracy: request.val_accuracy,
        best_accuracy: request.best_accuracy,
        backbone,
        adversary,
        optimizer,
        scheduler,
        scaler,
    };
    write_json(&checkpoint_dir.join(MANIFEST_FILENAME), &manifest)?;

    prune_checkpoints(request.base_dir, request.kind, request.max_keep)?;

    Ok(CheckpointDescriptor {
        directory: checkpoint_dir,
        manifest,
    })
}

/// Most recent checkpoint of `kind` under `base_dir`, by epoch.
pub fn latest_checkpoint(
    base_dir: &Path,
    kind: CheckpointKind,
) -> Result<Option<CheckpointDescriptor>, TrainingError> {
    let mut newest: Option<CheckpointDescriptor> = None;
    for directory in checkpoint_directories(base_dir, kind)? {
        let manifest = load_manifest(&directory)?;
        if newest
            .as_ref()
            .map_or(true, |current| manifest.epoch >= current.manifest.epoch)
        {
            newest = Some(CheckpointDescriptor {
                directory,
                manifest,
            });
        }
    }
    Ok(newest)
}

pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome, TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    let backbone_weights_path = validated_path(directory, &manifest.backbone)?;
    let adversary_weights_path = validated_path(directory, &manifest.adversary)?;
    let optimizer_state: OptimizerState =
        read_json(&validated_path(directory, &manifest.optimizer)?)?;
    let scheduler_state: SchedulerState =
        read_json(&validated_path(directory, &manifest.scheduler)?)?;
    let scaler_state: GradientScalerState =
        read_json(&validated_path(directory, &manifest.scaler)?)?;

    Ok(LoadOutcome {
        manifest,
        optimizer_state,
        scheduler_state,
        scaler_state,
        backbone_weights_path,
        adversary_weights_path,
    })
}

/// Accepts a checkpoint directory or a bare `.safetensors` file and returns the
/// backbone weights file to restore from.
pub fn resolve_backbone_weights(path: &Path) -> Result<PathBuf, TrainingError> {
    if path.is_dir() {
        let manifest = load_manifest(path)?;
        ensure_version_supported(manifest.version)?;
        return validated_path(path, &manifest.backbone);
    }
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    Err(TrainingError::initialization(format!(
        "checkpoint {} does not exist",
        path.display()
    )))
}

/// Copies matching tensors from `weights_path` into `variables`. Entries may be
/// stored with or without `prefix`. Missing and unexpected names are reported,
/// a shape mismatch is an error.
pub fn apply_weights(
    variables: &[(String, Var)],
    prefix: &str,
    weights_path: &Path,
    device: &Device,
) -> Result<WeightReport, TrainingError> {
    let mut tensors: HashMap<String, _> = load_safetensors(weights_path, device)
        .map_err(|err| weights_error(weights_path, err))?;
    let mut report = WeightReport::default();

    for (name, var) in variables {
        let bare = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(name.as_str());
        let Some(tensor) = tensors.remove(name).or_else(|| tensors.remove(bare)) else {
            report.missing.push(name.clone());
            continue;
        };

        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::runtime(format!(
                "checkpoint tensor '{}' has shape {:?}, model expects {:?}",
                name,
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let tensor = tensor
            .to_dtype(var.as_tensor().dtype())
            .map_err(|err| weights_error(weights_path, err))?;
        var.set(&tensor)
            .map_err(|err| weights_error(weights_path, err))?;
        report.loaded.push(name.clone());
    }

    report.unexpected = tensors.into_keys().collect();
    report.unexpected.sort();

    if !report.missing.is_empty() {
        warn!(
            path = %weights_path.display(),
            missing = ?report.missing,
            "checkpoint is missing variables; keeping initialised values"
        );
    }
    if !report.unexpected.is_empty() {
        warn!(
            path = %weights_path.display(),
            unexpected = ?report.unexpected,
            "checkpoint has unexpected variables; ignoring them"
        );
    }
    debug!(loaded = report.loaded.len(), "restored weights");

    Ok(report)
}

pub fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn validated_path(directory: &Path, record: &FileRecord) -> Result<PathBuf, TrainingError> {
    let path = directory.join(&record.filename);
    if sha256_file(&path)? != record.sha256 {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(path)
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn checkpoint_directories(base: &Path, kind: CheckpointKind) -> Result<Vec<PathBuf>, TrainingError> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    let prefix = format!("{}_epoch_", kind.prefix());
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn prune_checkpoints(
    base: &Path,
    kind: CheckpointKind,
    max_keep: Option<usize>,
) -> Result<(), TrainingError> {
    let Some(limit) = max_keep.filter(|limit| *limit > 0) else {
        return Ok(());
    };
    let mut dirs = checkpoint_directories(base, kind)?;
    while dirs.len() > limit {
        let victim = dirs.remove(0);
        debug!(path = %victim.display(), "pruning checkpoint");
        fs::remove_dir_all(&victim).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to prune checkpoint {}: {err}",
                victim.display()
            ))
        })?;
    }
    Ok(())
}

fn weights_error(path: &Path, err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(format!("weights file {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Tensor};

    #[test]
    fn directory_names_carry_epoch_and_accuracy() {
        assert_eq!(
            CheckpointKind::Latest.directory_name(3, 0.51249),
            "latest_epoch_0003_acc_0.5125"
        );
        assert_eq!(
            CheckpointKind::Best.directory_name(12, 1.0),
            "best_epoch_0012_acc_1.0000"
        );
    }

    #[test]
    fn apply_weights_is_non_strict_but_checks_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let device = Device::Cpu;

        let mut stored = HashMap::new();
        stored.insert("net.a".to_string(), Tensor::ones(2, DType::F32, &device).unwrap());
        stored.insert("b".to_string(), Tensor::full(3f32, 3, &device).unwrap());
        stored.insert("net.extra".to_string(), Tensor::zeros(1, DType::F32, &device).unwrap());
        candle_core::safetensors::save(&stored, &path).unwrap();

        let a = Var::zeros(2, DType::F32, &device).unwrap();
        let b = Var::zeros(3, DType::F32, &device).unwrap();
        let c = Var::zeros(4, DType::F32, &device).unwrap();
        let variables = vec![
            ("net.a".to_string(), a.clone()),
            ("net.b".to_string(), b.clone()),
            ("net.c".to_string(), c.clone()),
        ];

        let report = apply_weights(&variables, "net", &path, &device).unwrap();
        assert_eq!(report.loaded, vec!["net.a", "net.b"]);
        assert_eq!(report.missing, vec!["net.c"]);
        assert_eq!(report.unexpected, vec!["net.extra"]);
        assert_eq!(a.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0, 1.0]);
        assert_eq!(b.as_tensor().to_vec1::<f32>().unwrap(), vec![3.0; 3]);
        assert_eq!(c.as_tensor().to_vec1::<f32>().unwrap(), vec![0.0; 4]);

        let wrong = vec![("net.a".to_string(), Var::zeros(5, DType::F32, &device).unwrap())];
        assert!(apply_weights(&wrong, "net", &path, &device).is_err());
    }

    #[test]
    fn missing_checkpoint_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(resolve_backbone_weights(&dir.path().join("absent")).is_err());
        assert!(latest_checkpoint(dir.path(), CheckpointKind::Latest)
            .unwrap()
            .is_none());
    }
}
