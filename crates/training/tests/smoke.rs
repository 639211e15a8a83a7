mod common;

use std::fs;

use anyhow::Result;
use tempfile::tempdir;
use training::{
    checkpoint::{self, CheckpointKind},
    Attribute, Precision,
};

use common::{cpu_trainer, tiny_config, write_dataset};

#[test]
fn smoke_training_writes_latest_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let root = dir.path().join("raf-basic");
    let output = dir.path().join("models");
    write_dataset(&root)?;

    let mut config = tiny_config(&root, &output, Attribute::Gender);
    config.runtime.logging.tensorboard = Some(dir.path().join("runs"));
    let mut trainer = cpu_trainer(config)?;

    // One gender row carries the "unsure" sentinel and is dropped.
    assert_eq!(trainer.train_batches().len(), 5);
    assert_eq!(trainer.val_batches().len(), 4);

    let summary = trainer.run()?;
    assert!(!summary.stopped_early);
    assert_eq!(summary.epochs.len(), 1);

    let report = &summary.epochs[0];
    assert_eq!(report.epoch, 1);
    assert!((0.0..=1.0).contains(&report.train.accuracy));
    assert!((0.0..=1.0).contains(&report.val_accuracy));
    assert!(report.train.loss.is_finite());
    assert_eq!(report.train.samples, 5);
    assert_eq!(report.train.batches, 3);

    let latest: Vec<_> = fs::read_dir(&output)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("latest_"))
        .collect();
    assert_eq!(latest.len(), 1);
    assert!(latest[0].starts_with("latest_epoch_0001_acc_"));

    let found = checkpoint::latest_checkpoint(&output, CheckpointKind::Latest)?
        .expect("latest checkpoint");
    assert_eq!(found.manifest.epoch, 1);
    assert_eq!(found.manifest.attribute, Attribute::Gender);
    assert_eq!(Some(found.directory.clone()), summary.latest_checkpoint);
    assert!(checkpoint::latest_checkpoint(&output, CheckpointKind::Best)?.is_none());

    let event_files = fs::read_dir(dir.path().join("runs"))?.count();
    assert_eq!(event_files, 1);
    Ok(())
}

#[test]
fn smoke_mixed_precision_with_workers() -> Result<()> {
    let dir = tempdir()?;
    let root = dir.path().join("raf-basic");
    let output = dir.path().join("models");
    write_dataset(&root)?;

    let mut config = tiny_config(&root, &output, Attribute::Age);
    config.data.num_workers = 2;
    config.runtime.precision = Precision::Mixed;
    let mut trainer = cpu_trainer(config)?;

    let summary = trainer.run()?;
    let report = &summary.epochs[0];
    assert_eq!(report.train.samples, 6);
    assert_eq!(report.validation.samples, 4);
    assert!((0.0..=1.0).contains(&report.validation.accuracy));
    Ok(())
}

#[test]
fn resume_continues_from_the_saved_epoch() -> Result<()> {
    let dir = tempdir()?;
    let root = dir.path().join("raf-basic");
    let output = dir.path().join("models");
    write_dataset(&root)?;

    let mut first = cpu_trainer(tiny_config(&root, &output, Attribute::Emotion))?;
    let first_summary = first.run()?;
    let steps_after_first = first.optimizer().step_count();
    let resume_dir = first_summary.latest_checkpoint.expect("latest checkpoint");

    let mut config = tiny_config(&root, &output, Attribute::Emotion);
    config.runtime.epochs = 2;
    config.runtime.checkpoint.resume_from = Some(resume_dir);
    let mut second = cpu_trainer(config)?;
    let summary = second.run()?;

    assert_eq!(summary.epochs.len(), 1);
    assert_eq!(summary.epochs[0].epoch, 2);
    assert!(summary.best_accuracy >= first_summary.best_accuracy);
    assert_eq!(
        second.optimizer().step_count(),
        steps_after_first + second.train_batches().num_batches()
    );

    let gamma = second.config().scheduler.gamma;
    let expected_lr = second.config().optimizer.effective_learning_rate() * gamma;
    assert!((summary.epochs[0].learning_rate - expected_lr).abs() < 1e-12);
    Ok(())
}

#[test]
fn resume_rejects_a_different_attribute() -> Result<()> {
    let dir = tempdir()?;
    let root = dir.path().join("raf-basic");
    let output = dir.path().join("models");
    write_dataset(&root)?;

    let summary = cpu_trainer(tiny_config(&root, &output, Attribute::Gender))?.run()?;

    let mut config = tiny_config(&root, &output, Attribute::Age);
    config.runtime.epochs = 2;
    config.runtime.checkpoint.resume_from = summary.latest_checkpoint;
    let err = cpu_trainer(config)?.run().unwrap_err();
    assert!(err.to_string().contains("attribute"));
    Ok(())
}

#[test]
fn shutdown_request_stops_before_the_next_epoch() -> Result<()> {
    let dir = tempdir()?;
    let root = dir.path().join("raf-basic");
    let output = dir.path().join("models");
    write_dataset(&root)?;

    let mut config = tiny_config(&root, &output, Attribute::Gender);
    config.runtime.epochs = 3;
    let mut trainer = cpu_trainer(config)?;

    let mut polls = 0;
    let summary = trainer.run_with_shutdown(|| {
        polls += 1;
        polls > 1
    })?;
    assert!(summary.stopped_early);
    assert_eq!(summary.epochs.len(), 1);
    Ok(())
}
