use std::sync::{Arc, Mutex};

use burn::backend::{Autodiff, NdArray};
use critical_core::{CsvSink, MemorySink, MetricLogger, Result, TriggerMode};
use critical_dataset::{
    eval_pipeline, train_pipeline, BatchLoader, CifarDataset, LabeledImage, LoaderConfig,
    PipelineHandle, TransformKind,
};
use critical_training::{
    CifarClassifier, DeficitRemoval, EpochContext, ResNetConfig, Trainer, TrainerConfig,
    TrainingCallback,
};
use image::{Rgb, RgbImage};

type TestBackend = Autodiff<NdArray>;

/// Four images, two per class: dark for class 0, bright for class 1.
fn synthetic_images() -> Vec<LabeledImage> {
    (0..4)
        .map(|i| {
            let label = i % 2;
            let base = if label == 0 { 30 } else { 220 };
            let image = RgbImage::from_fn(32, 32, |x, y| {
                let v = base + ((x + y + i as u32) % 8) as u8;
                Rgb([v, v / 2, 255 - v])
            });
            LabeledImage { image, label }
        })
        .collect()
}

fn config(max_epochs: usize) -> TrainerConfig {
    TrainerConfig {
        max_epochs,
        start_epoch: 0,
        start_step: 0,
        learning_rate: 0.1,
        lr_decay: 0.97,
        momentum: 0.9,
        weight_decay: 5e-4,
        show_progress: false,
    }
}

fn loaders(train: &Arc<CifarDataset>) -> (BatchLoader, BatchLoader) {
    let val = Arc::new(CifarDataset::new(synthetic_images(), eval_pipeline()));
    let train = BatchLoader::new(Arc::clone(train), LoaderConfig::new(2, true, 0, 17)).unwrap();
    let val = BatchLoader::new(val, LoaderConfig::new(2, false, 2, 17)).unwrap();
    (train, val)
}

fn small_classifier() -> CifarClassifier<TestBackend> {
    let device = Default::default();
    CifarClassifier::new(ResNetConfig::new().with_base_width(8).init(&device).unwrap())
}

fn fc_weights(model: &CifarClassifier<TestBackend>) -> Vec<f32> {
    model
        .model
        .fc
        .weight
        .val()
        .into_data()
        .to_vec::<f32>()
        .unwrap()
}

/// Records whether the blur step is live at the start of each epoch.
struct BlurWatcher {
    pipeline: PipelineHandle,
    seen: Arc<Mutex<Vec<bool>>>,
}

impl TrainingCallback for BlurWatcher {
    fn name(&self) -> &str {
        "blur-watcher"
    }

    fn on_train_epoch_start(&mut self, _ctx: &EpochContext) -> Result<Option<String>> {
        let blurred = self.pipeline.snapshot().contains(TransformKind::BlurResample);
        self.seen.lock().unwrap().push(blurred);
        Ok(None)
    }
}

#[test]
fn deficit_at_epoch_zero_single_epoch_run() {
    let train_ds = Arc::new(CifarDataset::new(synthetic_images(), train_pipeline()));
    let (train, val) = loaders(&train_ds);

    let memory = MemorySink::new();
    let logger = MetricLogger::new().with_sink(memory.clone());
    let hook = DeficitRemoval::new(0, TriggerMode::Exact, train_ds.pipeline().clone());

    let model = small_classifier();
    let before = fc_weights(&model);

    let mut trainer =
        Trainer::<TestBackend>::new(config(1), Default::default(), logger).with_callback(hook);
    let report = trainer.fit(model, &train, &val).unwrap();

    // (a) the hook fired at epoch 0 and its notice was recorded
    assert_eq!(
        report.notices,
        vec![(0, "Removed blur-resample transform at epoch 0.".to_string())]
    );
    assert_eq!(train_ds.pipeline().generation(), 1);
    assert!(!train_ds
        .pipeline()
        .snapshot()
        .contains(TransformKind::BlurResample));

    // (b) the optimizer changed the parameters
    let after = fc_weights(&report.model);
    assert_eq!(before.len(), after.len());
    assert!(before.iter().zip(&after).any(|(a, b)| (a - b).abs() > 1e-7));
    assert_eq!(report.global_step, 2);

    // (c) two metrics per training batch, two per validation batch
    let records = memory.records();
    for step in 0..2 {
        let names: Vec<_> = records
            .iter()
            .filter(|r| r.step == step && r.name.starts_with("train_") && !r.name.ends_with("_epoch"))
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["train_loss", "train_acc"]);
    }
    assert_eq!(memory.count("train_loss"), 2);
    assert_eq!(memory.count("train_acc"), 2);
    assert_eq!(memory.count("val_loss"), 2);
    assert_eq!(memory.count("val_acc"), 2);

    assert_eq!(report.history.num_epochs(), 1);
    assert_eq!(report.history.learning_rate, vec![0.1]);
}

#[test]
fn blur_stays_until_deficit_epoch() {
    let train_ds = Arc::new(CifarDataset::new(synthetic_images(), train_pipeline()));
    let (train, val) = loaders(&train_ds);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let watcher = BlurWatcher {
        pipeline: train_ds.pipeline().clone(),
        seen: Arc::clone(&seen),
    };
    let hook = DeficitRemoval::new(1, TriggerMode::Exact, train_ds.pipeline().clone());

    let log_dir = tempfile::tempdir().unwrap();
    let csv = CsvSink::create(log_dir.path(), "deficit1").unwrap();
    let metrics_path = csv.log_dir().join(CsvSink::METRICS_FILE);
    let logger = MetricLogger::new().with_sink(csv);

    let mut trainer = Trainer::<TestBackend>::new(config(3), Default::default(), logger)
        .with_callback(hook)
        .with_callback(watcher);
    let report = trainer.fit(small_classifier(), &train, &val).unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![true, false, false]);
    assert_eq!(report.notices.len(), 1);
    assert_eq!(report.notices[0].0, 1);

    let lrs = &report.history.learning_rate;
    assert_eq!(lrs.len(), 3);
    assert!((lrs[2] - 0.1 * 0.97 * 0.97).abs() < 1e-12);

    // header + 3 epochs * (2 train batches * 2 + 2 val batches * 2 + 5 aggregates)
    let csv = std::fs::read_to_string(metrics_path).unwrap();
    assert_eq!(csv.lines().count(), 1 + 3 * 13);
    assert!(csv.lines().any(|l| l.starts_with("2,6,val_acc_epoch,")));
}

#[test]
fn resumed_run_removes_deficit_at_first_epoch() {
    let train_ds = Arc::new(CifarDataset::new(synthetic_images(), train_pipeline()));
    let (train, val) = loaders(&train_ds);

    let memory = MemorySink::new();
    let logger = MetricLogger::new().with_sink(memory.clone());
    let hook = DeficitRemoval::new(1, TriggerMode::AtOrAfter, train_ds.pipeline().clone());

    let mut config = config(3);
    config.start_epoch = 2;
    config.start_step = 4;
    let mut trainer =
        Trainer::<TestBackend>::new(config, Default::default(), logger).with_callback(hook);
    let report = trainer.fit(small_classifier(), &train, &val).unwrap();

    assert_eq!(
        report.notices,
        vec![(
            2,
            "Removed blur-resample transform at epoch 2 (deficit epoch 1).".to_string()
        )]
    );
    assert_eq!(train_ds.pipeline().generation(), 1);

    assert_eq!(report.history.epochs, vec![2]);
    let lrs = &report.history.learning_rate;
    assert_eq!(lrs.len(), 1);
    assert!((lrs[0] - 0.1 * 0.97 * 0.97).abs() < 1e-12);

    let records = memory.records();
    assert_eq!(records[0].name, "train_loss");
    assert_eq!(records[0].step, 4);
    assert_eq!(records[0].epoch, 2);
    assert_eq!(report.global_step, 6);
}
