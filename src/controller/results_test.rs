use super::*;
use crate::controller::clock::SystemClock;
use crate::controller::lifecycle::ExperimentLifecycleService;
use crate::controller::metrics_reader::MockMetricsReader;
use crate::controller::repository::InMemoryRepository;
use crate::model::{CreateExperiment, ResultErrorKind};
use crate::server::metrics::create_metrics;

struct Fixture {
    repo: Arc<dyn ExperimentRepository>,
    lifecycle: ExperimentLifecycleService,
    reader: Arc<MockMetricsReader>,
    env: Uuid,
}

impl Fixture {
    fn new(reader: MockMetricsReader) -> Self {
        let repo: Arc<dyn ExperimentRepository> = Arc::new(InMemoryRepository::new());
        Self {
            lifecycle: ExperimentLifecycleService::new(repo.clone(), Arc::new(SystemClock), None),
            repo,
            reader: Arc::new(reader),
            env: Uuid::new_v4(),
        }
    }

    fn aggregator(&self, timeout: Duration) -> ResultsAggregator {
        ResultsAggregator::new(self.repo.clone(), self.reader.clone(), timeout, None)
    }

    /// Experiment with one stopped iteration
    async fn finished_iteration(&self, name: &str) -> IterationRef {
        let exp = self
            .lifecycle
            .create_experiment(
                self.env,
                CreateExperiment {
                    name: name.to_string(),
                    feature_flag_key: "checkout-button".to_string(),
                    baseline_variant: Some("blue".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let it = self.lifecycle.start_iteration(self.env, exp.id).await.unwrap();
        self.lifecycle
            .stop_iteration(self.env, exp.id, it.id)
            .await
            .unwrap();
        IterationRef::new(exp.id, it.id)
    }
}

fn counts(variant: &str, exposures: u64, conversions: u64) -> VariantCounts {
    VariantCounts {
        variant: variant.to_string(),
        exposures,
        conversions,
    }
}

#[tokio::test]
async fn test_missing_middle_entry_is_not_found_others_have_data() {
    let fx = Fixture::new(MockMetricsReader::new());
    let first = fx.finished_iteration("first").await;
    let third = fx.finished_iteration("third").await;
    fx.reader
        .set_counts(first.iteration_id, vec![counts("blue", 100, 10)]);
    fx.reader
        .set_counts(third.iteration_id, vec![counts("green", 50, 5)]);

    let missing = IterationRef::new(first.experiment_id, Uuid::new_v4());
    let results = fx
        .aggregator(Duration::from_secs(1))
        .get_iteration_results(fx.env, &[first, missing, third])
        .await;

    assert_eq!(results.len(), 3);
    assert!(results[0].data().is_some());
    assert_eq!(
        results[1].error().map(|e| e.kind),
        Some(ResultErrorKind::NotFound)
    );
    assert_eq!(results[1].iteration_id, missing.iteration_id);
    assert!(results[2].data().is_some());
}

#[tokio::test]
async fn test_cross_environment_pair_is_not_found() {
    let fx = Fixture::new(MockMetricsReader::new());
    let pair = fx.finished_iteration("exp").await;
    fx.reader
        .set_counts(pair.iteration_id, vec![counts("blue", 100, 10)]);

    let results = fx
        .aggregator(Duration::from_secs(1))
        .get_iteration_results(Uuid::new_v4(), &[pair])
        .await;

    assert_eq!(
        results[0].error().map(|e| e.kind),
        Some(ResultErrorKind::NotFound)
    );
}

#[tokio::test]
async fn test_iteration_of_other_experiment_is_not_found() {
    let fx = Fixture::new(MockMetricsReader::new());
    let a = fx.finished_iteration("a").await;
    let b = fx.finished_iteration("b").await;
    fx.reader.set_counts(b.iteration_id, vec![counts("blue", 1, 1)]);

    let results = fx
        .aggregator(Duration::from_secs(1))
        .get_iteration_results(fx.env, &[IterationRef::new(a.experiment_id, b.iteration_id)])
        .await;

    assert_eq!(
        results[0].error().map(|e| e.kind),
        Some(ResultErrorKind::NotFound)
    );
}

#[tokio::test]
async fn test_reader_failure_is_unavailable_for_that_entry_only() {
    let fx = Fixture::new(MockMetricsReader::new());
    let ok = fx.finished_iteration("ok").await;
    let broken = fx.finished_iteration("broken").await;
    fx.reader.set_counts(ok.iteration_id, vec![counts("blue", 10, 1)]);
    fx.reader.fail_for(broken.iteration_id);

    let results = fx
        .aggregator(Duration::from_secs(1))
        .get_iteration_results(fx.env, &[broken, ok])
        .await;

    assert_eq!(
        results[0].error().map(|e| e.kind),
        Some(ResultErrorKind::Unavailable)
    );
    assert!(results[1].data().is_some());
}

#[tokio::test]
async fn test_slow_reader_times_out_as_unavailable() {
    let fx = Fixture::new(MockMetricsReader::new().with_delay(Duration::from_millis(500)));
    let pair = fx.finished_iteration("slow").await;
    fx.reader.set_counts(pair.iteration_id, vec![counts("blue", 10, 1)]);

    let results = fx
        .aggregator(Duration::from_millis(20))
        .get_iteration_results(fx.env, &[pair])
        .await;

    let err = results[0].error().expect("timeout should be an entry error");
    assert_eq!(err.kind, ResultErrorKind::Unavailable);
    assert!(err.message.contains("timed out"));
}

#[tokio::test]
async fn test_valid_iteration_without_counts_is_no_data() {
    let fx = Fixture::new(MockMetricsReader::new());
    let pair = fx.finished_iteration("quiet").await;

    let results = fx
        .aggregator(Duration::from_secs(1))
        .get_iteration_results(fx.env, &[pair])
        .await;

    assert_eq!(results[0].outcome, IterationOutcome::NoData);
}

#[tokio::test]
async fn test_data_rows_sorted_with_rates_and_baseline() {
    let fx = Fixture::new(MockMetricsReader::new());
    let pair = fx.finished_iteration("rows").await;
    fx.reader.set_counts(
        pair.iteration_id,
        vec![
            counts("green", 200, 30),
            counts("blue", 100, 10),
            counts("red", 0, 0),
            counts("blue", 100, 10),
        ],
    );

    let results = fx
        .aggregator(Duration::from_secs(1))
        .get_iteration_results(fx.env, &[pair])
        .await;
    let data = results[0].data().expect("data");

    let names: Vec<&str> = data.variants.iter().map(|v| v.variant.as_str()).collect();
    assert_eq!(names, vec!["blue", "green", "red"]);

    assert_eq!(data.variants[0].exposures, 200);
    assert!(data.variants[0].is_baseline);
    assert!((data.variants[0].conversion_rate - 0.1).abs() < 1e-9);
    assert!(!data.variants[1].is_baseline);
    assert!((data.variants[1].conversion_rate - 0.15).abs() < 1e-9);
    assert_eq!(data.variants[2].conversion_rate, 0.0);

    assert_eq!(data.total_exposures, 400);
    assert_eq!(data.total_conversions, 50);
    assert!(data.is_finished);
    assert!(data.stopped_at.is_some());
}

#[tokio::test]
async fn test_active_iteration_is_not_finished() {
    let fx = Fixture::new(MockMetricsReader::new());
    let exp = fx
        .lifecycle
        .create_experiment(
            fx.env,
            CreateExperiment {
                name: "live".to_string(),
                feature_flag_key: "flag".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let it = fx.lifecycle.start_iteration(fx.env, exp.id).await.unwrap();
    fx.reader.set_counts(it.id, vec![counts("blue", 5, 1)]);

    let results = fx
        .aggregator(Duration::from_secs(1))
        .get_iteration_results(fx.env, &[IterationRef::new(exp.id, it.id)])
        .await;
    let data = results[0].data().expect("data");

    assert!(!data.is_finished);
    assert!(data.stopped_at.is_none());
    assert!(data.variants.iter().all(|v| !v.is_baseline));
}

#[tokio::test]
async fn test_order_preserved_under_concurrent_fetch() {
    let fx = Fixture::new(MockMetricsReader::new().with_delay(Duration::from_millis(10)));
    let mut pairs = Vec::new();
    for i in 0..6 {
        let pair = fx.finished_iteration(&format!("exp-{}", i)).await;
        fx.reader
            .set_counts(pair.iteration_id, vec![counts("blue", i + 1, 0)]);
        pairs.push(pair);
    }
    pairs.reverse();

    let results = fx
        .aggregator(Duration::from_secs(1))
        .get_iteration_results(fx.env, &pairs)
        .await;

    assert_eq!(results.len(), pairs.len());
    for (pair, result) in pairs.iter().zip(&results) {
        assert_eq!(result.experiment_id, pair.experiment_id);
        assert_eq!(result.iteration_id, pair.iteration_id);
    }
    let exposures: Vec<u64> = results
        .iter()
        .map(|r| r.data().unwrap().total_exposures)
        .collect();
    assert_eq!(exposures, vec![6, 5, 4, 3, 2, 1]);
}

#[tokio::test]
async fn test_empty_batch_returns_empty() {
    let fx = Fixture::new(MockMetricsReader::new());
    let results = fx
        .aggregator(Duration::from_secs(1))
        .get_iteration_results(fx.env, &[])
        .await;
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_entry_outcomes_are_counted() {
    let fx = Fixture::new(MockMetricsReader::new());
    let pair = fx.finished_iteration("counted").await;
    let metrics = create_metrics().unwrap();
    let aggregator = ResultsAggregator::new(
        fx.repo.clone(),
        fx.reader.clone(),
        Duration::from_secs(1),
        Some(metrics.clone()),
    );

    aggregator
        .get_iteration_results(
            fx.env,
            &[pair, IterationRef::new(Uuid::new_v4(), Uuid::new_v4())],
        )
        .await;

    let text = metrics.encode().unwrap();
    assert!(text.contains(r#"kokeilu_iteration_results_total{outcome="no_data"} 1"#));
    assert!(text.contains(r#"kokeilu_iteration_results_total{outcome="not_found"} 1"#));
}
