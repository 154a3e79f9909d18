use std::sync::LazyLock;

use prometheus::*;

/// 检索次数，按结果分类：matched / enrolled / error
pub static IDENTIFY_COUNT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!("wildreid_identify_count", "count of the identify requests", &["outcome"])
        .unwrap()
});

pub static IDENTIFY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!("wildreid_identify_duration", "duration of the per-image identify in seconds")
        .unwrap()
});

pub static RECALL_SCORE: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "wildreid_recall_score",
        "recall of the per-image identify",
        (0..=10).map(|x| x as f64 / 10.0).collect()
    )
    .unwrap()
});

pub static RETRAIN_COUNT: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("wildreid_retrain_count", "count of the triggered full retrains").unwrap()
});

/// 记录一次检索的结果与耗时
pub fn observe_identify(outcome: &'static str, duration: f32) {
    IDENTIFY_COUNT.with_label_values(&[outcome]).inc();
    IDENTIFY_DURATION.observe(duration as f64);
}

/// 以 Prometheus 文本格式导出全部指标
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    encoder.encode_to_string(&gather()).unwrap_or_default()
}
