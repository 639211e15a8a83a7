#![allow(dead_code)]

use std::{fs, path::Path};

use anyhow::Result;
use candle_core::Device;
use image::{Rgb, RgbImage};
use training::{
    config::{
        CheckpointConfig, DataConfig, LoggingConfig, ModelConfig, OptimizerConfig, RuntimeConfig,
        SchedulerConfig,
    },
    Attribute, Precision, Trainer, TrainingConfig,
};

pub const IMAGE_SIZE: usize = 16;

/// (identifier, emotion 1..=7, age 0..=4, gender 0..=2)
pub const RECORDS: [(&str, i64, i64, i64); 10] = [
    ("train_00001.jpg", 1, 0, 0),
    ("train_00002.jpg", 4, 1, 1),
    ("train_00003.jpg", 7, 2, 2),
    ("train_00004.jpg", 3, 3, 0),
    ("train_00005.jpg", 5, 4, 1),
    ("train_00006.jpg", 2, 2, 1),
    ("test_0001.jpg", 6, 0, 0),
    ("test_0002.jpg", 1, 1, 1),
    ("test_0003.jpg", 4, 4, 0),
    ("test_0004.jpg", 2, 3, 1),
];

/// Writes a RAF-DB shaped tree: three manifests plus one aligned JPEG per row.
pub fn write_dataset(root: &Path) -> Result<()> {
    let image_dir = root.join("Image").join("aligned");
    fs::create_dir_all(&image_dir)?;

    let mut emotion = String::new();
    let mut age = String::new();
    let mut gender = String::new();
    for (position, (identifier, emotion_label, age_label, gender_label)) in
        RECORDS.iter().enumerate()
    {
        emotion.push_str(&format!("{identifier} {emotion_label}\n"));
        age.push_str(&format!("{identifier}\t{age_label}\n"));
        gender.push_str(&format!("{identifier}\t{gender_label}\n"));

        let stem = identifier.trim_end_matches(".jpg");
        let shade = (position * 23) as u8;
        let image = RgbImage::from_fn(20, 24, |x, y| {
            Rgb([shade.wrapping_add((x * 9) as u8), (y * 10) as u8, 255 - shade])
        });
        image.save(image_dir.join(format!("{stem}_aligned.jpg")))?;
    }

    // Rows outside the train/test prefixes have no image and must be skipped.
    for stray in ["val_0001.jpg", "extra_0009.jpg"] {
        emotion.push_str(&format!("{stray} 3\n"));
        age.push_str(&format!("{stray}\t1\n"));
        gender.push_str(&format!("{stray}\t0\n"));
    }

    for (dir, contents) in [
        ("EmoLabel", emotion),
        ("AgeLabel", age),
        ("GenderLabel", gender),
    ] {
        fs::create_dir_all(root.join(dir))?;
        fs::write(root.join(dir).join("list_patition_label.txt"), contents)?;
    }
    Ok(())
}

pub fn tiny_config(root: &Path, output: &Path, attribute: Attribute) -> TrainingConfig {
    TrainingConfig {
        data: DataConfig {
            root: root.to_path_buf(),
            attribute,
            batch_size: 2,
            val_batch_size: 2,
            num_workers: 0,
            prefetch_factor: 2,
            image_size: IMAGE_SIZE,
        },
        model: ModelConfig {
            stem_channels: 4,
            feature_channels: 8,
            head_channels: 8,
        },
        optimizer: OptimizerConfig::default(),
        scheduler: SchedulerConfig::default(),
        runtime: RuntimeConfig {
            epochs: 1,
            seed: 7,
            precision: Precision::Fp32,
            checkpoint: CheckpointConfig {
                directory: output.to_path_buf(),
                ..CheckpointConfig::default()
            },
            logging: LoggingConfig {
                enable_stdout: false,
                ..LoggingConfig::default()
            },
        },
    }
}

pub fn cpu_trainer(config: TrainingConfig) -> Result<Trainer> {
    Ok(Trainer::with_device(config, Device::Cpu)?)
}
