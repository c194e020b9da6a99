use std::fs;
use std::io::Write;
use std::path::Path;

use ecg_train::{TrainConfig, Trainer};

const SIGNAL_LEN: usize = 64;
const TRAIN_RECORDS: usize = 16;
const VAL_RECORDS: usize = 8;
const BATCH_SIZE: usize = 4;

fn write_signal(path: &Path, seed: usize) {
    let mut file = fs::File::create(path).unwrap();
    for i in 0..SIGNAL_LEN {
        let sample = ((seed * 31 + i) % 97) as f32 / 97.0 - 0.5;
        file.write_all(&sample.to_le_bytes()).unwrap();
    }
}

fn write_manifest(dir: &Path, name: &str, prefix: &str, count: usize) {
    let labels = ["NSR", "AF", "PVC"];
    let mut entries = Vec::new();
    for i in 0..count {
        let file = format!("{prefix}{i:03}.f32");
        write_signal(&dir.join(&file), i);
        entries.push(serde_json::json!({
            "signal": file,
            "label": labels[i % labels.len()],
        }));
    }
    fs::write(dir.join(name), serde_json::to_string(&entries).unwrap()).unwrap();
}

fn fixture_config(root: &Path, epochs: usize) -> TrainConfig {
    let data = root.join("data");
    fs::create_dir_all(&data).unwrap();
    fs::write(
        data.join("mapping.json"),
        r#"{"NSR": 0, "AF": 1, "PVC": 2}"#,
    )
    .unwrap();
    write_manifest(&data, "train.json", "tr", TRAIN_RECORDS);
    write_manifest(&data, "val.json", "va", VAL_RECORDS);

    let value = serde_json::json!({
        "exp_name": "smoke",
        "exp_dir": root.join("experiments"),
        "device": "cpu",
        "lr": 1e-3,
        "epochs": epochs,
        "batch_size": BATCH_SIZE,
        "num_workers": 2,
        "train_json": data.join("train.json"),
        "val_json": data.join("val.json"),
        "mapping_json": data.join("mapping.json"),
        "signal_len": SIGNAL_LEN,
        "base_channels": 4,
        "num_blocks": 2,
        "dropout": 0.0,
        "seed": 7,
        "log_every": 2,
    });
    serde_json::from_value(value).unwrap()
}

#[test]
fn fresh_run_trains_checkpoints_and_logs() {
    let tmp = tempfile::tempdir().unwrap();
    let config = fixture_config(tmp.path(), 2);
    let mut trainer = Trainer::new(config).unwrap();
    assert_eq!(trainer.training_epoch(), 0);
    assert_eq!(trainer.total_iter(), 0);

    trainer.run().unwrap();

    let batches_per_epoch = TRAIN_RECORDS / BATCH_SIZE;
    assert_eq!(trainer.training_epoch(), 2);
    assert_eq!(trainer.total_iter(), 2 * batches_per_epoch);

    let ckpt_dir = trainer.checkpoint_dir();
    assert!(ckpt_dir.join("00000000.ckpt").is_file());
    assert!(ckpt_dir.join("00000001.ckpt").is_file());

    let events: Vec<_> = fs::read_dir(trainer.log_dir())
        .unwrap()
        .map(|entry| entry.unwrap())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("events.out.tfevents.")
        })
        .collect();
    assert_eq!(events.len(), 1);
    assert!(events[0].metadata().unwrap().len() > 0);
}

#[test]
fn single_train_epoch_advances_iteration_counter() {
    let tmp = tempfile::tempdir().unwrap();
    let config = fixture_config(tmp.path(), 1);
    let mut trainer = Trainer::new(config).unwrap();

    let summary = trainer.train_epoch().unwrap();
    assert_eq!(trainer.total_iter(), TRAIN_RECORDS / BATCH_SIZE);
    assert_eq!(summary.examples, TRAIN_RECORDS);
    assert!(summary.mean_loss.is_finite());

    let val = trainer.validate().unwrap();
    assert_eq!(val.examples, VAL_RECORDS);
}

#[test]
fn resume_continues_from_next_epoch() {
    let tmp = tempfile::tempdir().unwrap();
    let config = fixture_config(tmp.path(), 2);
    let mut first = Trainer::new(config.clone()).unwrap();
    first.run().unwrap();
    let resume_path = first.checkpoint_dir().join("00000001.ckpt");
    assert!(resume_path.is_file());
    drop(first);

    let mut resumed_config = config;
    resumed_config.epochs = 3;
    resumed_config.model_path = Some(resume_path);
    let mut resumed = Trainer::new(resumed_config).unwrap();

    let batches_per_epoch = TRAIN_RECORDS / BATCH_SIZE;
    assert_eq!(resumed.training_epoch(), 2);
    assert_eq!(resumed.total_iter(), 2 * batches_per_epoch);

    resumed.run().unwrap();
    assert_eq!(resumed.training_epoch(), 3);
    assert_eq!(resumed.total_iter(), 3 * batches_per_epoch);
    assert!(resumed.checkpoint_dir().join("00000002.ckpt").is_file());
}

#[test]
fn unreadable_signal_aborts_the_run_before_any_checkpoint() {
    let tmp = tempfile::tempdir().unwrap();
    let config = fixture_config(tmp.path(), 1);
    let mut trainer = Trainer::new(config).unwrap();

    fs::remove_file(tmp.path().join("data").join("tr005.f32")).unwrap();

    assert!(trainer.run().is_err());
    let checkpoints = fs::read_dir(trainer.checkpoint_dir()).unwrap().count();
    assert_eq!(checkpoints, 0);
}
