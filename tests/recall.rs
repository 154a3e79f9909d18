use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use assert_fs::TempDir;
use rstest::*;
use wildreid::ReidError;
use wildreid::catalog::Catalog;
use wildreid::config::{ConfDir, IndexOptions, PipelineOptions, Settings};
use wildreid::extract::{Extractors, PrecomputedExtractor};
use wildreid::pipeline::{BuildReport, TrainingPipeline};
use wildreid::recall::{LazyRecallEngine, RecallEngine, RecallSource};
use wildreid::retrain::{Rebuilder, RecallRunRecord, RetrainController};
use wildreid::store::{FeatureRecord, FeatureStore};
use wildreid::utils::read_json;

/// 单位圆上角度为 deg 的向量
fn angle(deg: f32) -> Vec<f32> {
    let r = deg.to_radians();
    vec![r.cos(), r.sin()]
}

/// 深度特征与纹理特征都使用同一个角度，融合后的余弦相似度即为夹角的余弦
struct Fixture {
    dir: TempDir,
    settings: Settings,
    deep: FeatureStore,
    pattern: FeatureStore,
}

impl Fixture {
    /// members 为 (类别, 文件名, 角度)，放在裁剪图目录下；incoming 为目录外的待检索图片
    fn new(members: &[(&str, &str, f32)], incoming: &[(&str, f32)]) -> Result<Self> {
        let dir = TempDir::new()?;
        let conf_dir = ConfDir::new(dir.path().join("conf"));
        let mut deep = FeatureStore::new("deep");
        let mut pattern = FeatureStore::new("pattern");

        for (class, name, deg) in members {
            let path = conf_dir.crops().join(class).join(format!("{name}.jpg"));
            fs::create_dir_all(path.parent().unwrap())?;
            fs::write(&path, name.as_bytes())?;
            deep.push(FeatureRecord::new(&path, *class), &angle(*deg))?;
            pattern.push(FeatureRecord::new(&path, *class), &angle(*deg))?;
        }
        for (name, deg) in incoming {
            let path = dir.path().join("incoming").join(format!("{name}.jpg"));
            fs::create_dir_all(path.parent().unwrap())?;
            fs::write(&path, name.as_bytes())?;
            deep.push(FeatureRecord::new(&path, "unknown"), &angle(*deg))?;
            pattern.push(FeatureRecord::new(&path, "unknown"), &angle(*deg))?;
        }

        Ok(Self { dir, settings: Settings::new(conf_dir), deep, pattern })
    }

    fn extractors(&self) -> Extractors {
        Extractors::new(
            Box::new(PrecomputedExtractor::new("deep", self.deep.clone())),
            Box::new(PrecomputedExtractor::new("pattern", self.pattern.clone())),
        )
    }

    fn build(&self) -> Result<BuildReport> {
        let mut pipeline =
            TrainingPipeline::new(self.settings.clone(), PipelineOptions::default(), self.extractors());
        pipeline.rebuild()
    }

    fn engine(&self) -> Result<RecallEngine> {
        Ok(RecallEngine::open(self.settings.clone(), self.extractors())?)
    }

    fn conf_dir(&self) -> &ConfDir {
        &self.settings.conf_dir
    }

    fn crop(&self, class: &str, name: &str) -> PathBuf {
        self.conf_dir().crops().join(class).join(format!("{name}.jpg"))
    }

    fn incoming(&self, name: &str) -> PathBuf {
        self.dir.path().join("incoming").join(format!("{name}.jpg"))
    }
}

#[derive(Default)]
struct CountingRebuilder {
    calls: usize,
}

impl Rebuilder for CountingRebuilder {
    fn rebuild(&mut self) -> Result<BuildReport> {
        self.calls += 1;
        Ok(BuildReport::default())
    }
}

/// 两个类别各 5 张，从 a0 检索时前 5 名中有 2 张 A
const SPARSE: &[(&str, &str, f32)] = &[
    ("A", "a0", 0.0),
    ("A", "a1", 10.0),
    ("A", "a2", 80.0),
    ("A", "a3", 85.0),
    ("A", "a4", 90.0),
    ("B", "b0", 20.0),
    ("B", "b1", 30.0),
    ("B", "b2", 40.0),
    ("B", "b3", 170.0),
    ("B", "b4", 175.0),
];

/// 从 a0 检索时前 5 名中有 3 张 A
const DENSE: &[(&str, &str, f32)] = &[
    ("A", "a0", 0.0),
    ("A", "a1", 10.0),
    ("A", "a2", 40.0),
    ("A", "a3", 85.0),
    ("A", "a4", 90.0),
    ("B", "b0", 20.0),
    ("B", "b1", 30.0),
    ("B", "b2", 80.0),
    ("B", "b3", 170.0),
    ("B", "b4", 175.0),
];

#[rstest]
#[case::low_recall_triggers(SPARSE, 0.4, true)]
#[case::high_recall_skips(DENSE, 0.6, false)]
fn retrain_follows_recall_threshold(
    #[case] members: &[(&str, &str, f32)],
    #[case] expected_recall: f32,
    #[case] triggered: bool,
) -> Result<()> {
    let fixture = Fixture::new(members, &[])?;
    fixture.build()?;

    let mut controller = RetrainController::new(
        fixture.engine()?,
        CountingRebuilder::default(),
        0.5,
        fixture.conf_dir().run_log(),
    );
    let outcome = controller.run(&fixture.crop("A", "a0"))?;

    assert_eq!(outcome.recall, expected_recall);
    assert_eq!(outcome.triggered_retrain, triggered);
    assert_eq!(controller.rebuilder().calls, usize::from(triggered));
    assert_eq!(outcome.report.is_some(), triggered);

    let recall_outcome = outcome.recall_outcome.unwrap();
    assert_eq!(recall_outcome.gallery.len(), 5);
    assert_eq!(recall_outcome.best.unwrap().key, "a0");

    let log: Vec<RecallRunRecord> = read_json(fixture.conf_dir().run_log())?;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].recall, expected_recall);
    assert_eq!(log[0].triggered_retrain, triggered);
    Ok(())
}

#[test]
fn failed_identify_counts_as_zero_recall() -> Result<()> {
    let fixture = Fixture::new(SPARSE, &[])?;
    fixture.build()?;

    let mut controller = RetrainController::new(
        fixture.engine()?,
        CountingRebuilder::default(),
        0.5,
        fixture.conf_dir().run_log(),
    );
    // 特征库中没有这张图片，提取失败
    let missing = fixture.dir.path().join("missing.jpg");
    fs::write(&missing, b"missing")?;
    let outcome = controller.run(&missing)?;

    assert!(outcome.recall_outcome.is_none());
    assert_eq!(outcome.recall, 0.0);
    assert!(outcome.triggered_retrain);
    assert_eq!(controller.rebuilder().calls, 1);
    Ok(())
}

#[test]
fn enrollment_is_idempotent() -> Result<()> {
    let fixture = Fixture::new(SPARSE, &[("n1", 3.0)])?;
    fixture.build()?;
    let query = fixture.incoming("n1");

    let mut engine = fixture.engine()?;
    let first = engine.identify(&query)?;
    let entry = first.enrolled.expect("new image should be enrolled");
    assert_eq!(entry.class_label, "A");
    assert_eq!(entry.id, "A_11");
    assert_eq!(Path::new(&entry.image_path), fixture.crop("A", "n1"));
    assert!(fixture.crop("A", "n1").exists());
    assert_eq!(engine.catalog().len(), 11);

    let second = engine.identify(&query)?;
    assert!(second.enrolled.is_none());
    assert_eq!(engine.catalog().len(), 11);

    // 重新加载后依然能通过来源路径识别
    let engine = fixture.engine()?;
    assert!(engine.check_membership(&query));
    assert!(engine.check_membership(&fixture.crop("A", "n1")));
    assert_eq!(engine.catalog().ntotal(), 11);
    Ok(())
}

#[test]
fn duplicate_content_is_not_enrolled_twice() -> Result<()> {
    let fixture = Fixture::new(SPARSE, &[("n1", 3.0)])?;
    fixture.build()?;

    let mut engine = fixture.engine()?;
    // 先检索一次，让检索集合缓存下来
    engine.identify(&fixture.crop("A", "a0"))?;
    let outcome = engine.identify(&fixture.incoming("n1"))?;
    assert!(outcome.enrolled.is_some());
    assert_eq!(outcome.best.unwrap().key, "n1");
    assert_eq!(engine.catalog().len(), 11);

    // 其他目录下内容相同的拷贝
    let copy = fixture.dir.path().join("other").join("n1.jpg");
    fs::create_dir_all(copy.parent().unwrap())?;
    fs::copy(fixture.incoming("n1"), &copy)?;

    let err = engine.enroll(&copy).unwrap_err();
    assert!(matches!(err, ReidError::AlreadyEnrolled(_)));
    let outcome = engine.identify(&copy)?;
    assert!(outcome.enrolled.is_none());
    assert_eq!(engine.catalog().len(), 11);

    let mut paths =
        engine.catalog().entries().iter().map(|e| e.image_path.clone()).collect::<Vec<_>>();
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 11);
    Ok(())
}

#[test]
fn missing_catalog_is_built_by_retrain() -> Result<()> {
    let fixture = Fixture::new(SPARSE, &[])?;
    let pipeline =
        TrainingPipeline::new(fixture.settings.clone(), PipelineOptions::default(), fixture.extractors());
    let engine = LazyRecallEngine::new(fixture.settings.clone(), fixture.extractors());

    let mut controller =
        RetrainController::new(engine, pipeline, 0.5, fixture.conf_dir().run_log());
    let outcome = controller.run(&fixture.crop("A", "a0"))?;

    assert!(outcome.recall_outcome.is_none());
    assert_eq!(outcome.recall, 0.0);
    assert!(outcome.triggered_retrain);
    assert_eq!(outcome.report.unwrap().aligned, 10);
    assert!(fixture.conf_dir().index().exists());

    let engine = controller.source().engine().expect("engine should be open after rebuild");
    assert_eq!(engine.catalog().len(), 10);
    Ok(())
}

#[test]
fn enroll_twice_is_rejected() -> Result<()> {
    let fixture = Fixture::new(SPARSE, &[("n1", 95.0)])?;
    fixture.build()?;
    let query = fixture.incoming("n1");

    let mut engine = fixture.engine()?;
    engine.enroll(&query)?;
    let err = engine.enroll(&query).unwrap_err();
    assert!(matches!(err, ReidError::AlreadyEnrolled(_)));
    Ok(())
}

#[test]
fn empty_catalog_cannot_enroll() -> Result<()> {
    let fixture = Fixture::new(&[], &[("n1", 5.0)])?;
    let conf_dir = fixture.conf_dir();
    Catalog::create(conf_dir, 4, &IndexOptions::default())?.persist()?;
    FeatureStore::new("deep").save(conf_dir.deep_store())?;
    FeatureStore::new("pattern").save(conf_dir.pattern_store())?;

    let mut engine = fixture.engine()?;
    let err = engine.identify(&fixture.incoming("n1")).unwrap_err();
    assert!(matches!(err, ReidError::EmptyCatalog));
    assert_eq!(engine.catalog().len(), 0);
    Ok(())
}

#[test]
fn equal_scores_keep_gallery_order() -> Result<()> {
    let members = [("A", "a0", 0.0), ("A", "a1", 50.0), ("A", "a2", 50.0), ("B", "b0", 100.0)];
    let fixture = Fixture::new(&members, &[])?;
    fixture.build()?;

    let mut engine = fixture.engine()?;
    let outcome = engine.identify(&fixture.crop("A", "a0"))?;
    let keys = outcome.gallery.iter().map(|m| m.key.as_str()).collect::<Vec<_>>();
    assert_eq!(keys, vec!["a0", "a1", "a2", "b0"]);
    let ranks = outcome.gallery.iter().map(|m| m.rank).collect::<Vec<_>>();
    assert_eq!(ranks, vec![1, 2, 3, 4]);
    assert_eq!(outcome.metrics.same_class_in_top_k, 3);
    assert_eq!(outcome.metrics.recall, 1.0);
    assert_eq!(outcome.metrics.precision, 0.75);
    Ok(())
}

#[test]
fn build_drops_unaligned_crops() -> Result<()> {
    let mut fixture = Fixture::new(SPARSE, &[])?;
    // b4 只有深度特征
    let mut pattern = FeatureStore::new("pattern");
    for (i, record) in fixture.pattern.records().iter().enumerate() {
        if record.key != "b4" {
            pattern.push(record.clone(), fixture.pattern.vector(i))?;
        }
    }
    fixture.pattern = pattern;

    let report = fixture.build()?;
    assert_eq!(report.scanned, 10);
    assert_eq!(report.skipped_pattern, 1);
    assert_eq!(report.aligned, 9);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.classes, 2);
    assert_eq!(report.dimension, 4);

    let catalog = Catalog::open(fixture.conf_dir())?;
    assert_eq!(catalog.len(), 9);
    assert!(!catalog.contains_path(&fixture.crop("B", "b4").to_string_lossy()));
    assert_eq!(catalog.entries()[0].id, "A_1");
    assert_eq!(catalog.entries()[5].id, "B_1");
    Ok(())
}
