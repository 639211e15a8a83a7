use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;
use tracing::{info, warn};

use crate::{
    config::LoggingConfig,
    metrics::{EpochReport, PhaseMetrics},
    TrainingError,
};

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            tensorboard_dir: config.tensorboard.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }
}

/// Per-epoch run log: tracing lines plus optional TensorBoard scalars.
pub struct RunLogger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl RunLogger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = if let Some(dir) = settings.tensorboard_dir.as_ref() {
            Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?)
        } else {
            None
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    pub fn tensorboard_path(&self) -> Option<&Path> {
        self.tensorboard.as_ref().map(|writer| writer.path.as_path())
    }

    pub fn log_train(&mut self, epoch: usize, learning_rate: f64, metrics: &PhaseMetrics) {
        if self.settings.enable_stdout {
            info!(
                "[Epoch {}] Training accuracy: {:.4}. Loss: {:.3}. LR {:.6}",
                epoch, metrics.accuracy, metrics.loss, learning_rate
            );
        }
        self.scalars(
            epoch,
            &[
                ("train/loss", metrics.loss),
                ("train/accuracy", metrics.accuracy),
                ("train/learning_rate", learning_rate),
            ],
        );
    }

    pub fn log_validation(&mut self, epoch: usize, metrics: &PhaseMetrics) {
        if self.settings.enable_stdout {
            info!(
                "[Epoch {}] Validation accuracy:{:.4}. Loss:{:.3}",
                epoch,
                metrics.rounded_accuracy(),
                metrics.loss
            );
        }
        self.scalars(
            epoch,
            &[
                ("val/loss", metrics.loss),
                ("val/accuracy", metrics.rounded_accuracy()),
            ],
        );
    }

    pub fn log_best(&mut self, report: &EpochReport) {
        if self.settings.enable_stdout {
            info!("best_acc:{}", report.best_accuracy);
        }
        self.scalars(report.epoch, &[("val/best_accuracy", report.best_accuracy)]);
    }

    pub fn log_checkpoint(&mut self, directory: &Path) {
        if self.settings.enable_stdout {
            info!("Model saved to {}", directory.display());
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                warn!(error = %err, "tensorboard flush failed");
            }
        }
    }

    fn scalars(&mut self, epoch: usize, values: &[(&str, f64)]) {
        let Some(writer) = self.tensorboard.as_mut() else {
            return;
        };
        for (tag, value) in values {
            if let Err(err) = writer.write_scalar(tag, epoch as i64, *value) {
                warn!(tag = %tag, error = %err, "dropping tensorboard scalar");
            }
        }
    }
}

struct TensorBoardWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: current_wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        self.write_event(&Event {
            wall_time: current_wall_time(),
            step,
            file_version: None,
            summary: Some(summary),
        })
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
