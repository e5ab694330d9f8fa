//! Lifecycle events and counters emitted while a run moves through the
//! engine. Log output is captured as JSON lines and inspected by `event`.

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use claimscope_core::obs::{emit_run_finalize_error, emit_run_reclaimed, RunSpan};
use claimscope_core::{
    ClaimRecord, ClaimSettings, EngineConfig, Executor, ExecutorConfig, Harness, HarnessContext,
    HarnessDescriptor, HarnessError, HarnessOutput, HarnessRegistry, Invocation, ModelConfig,
    Provider, RunScheduler, RunStore, UnitOutcome, Worker, METRICS,
};
use claimscope_state::{MemoryCasStore, MemoryRunStore};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn events(&self) -> Vec<serde_json::Value> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    fn named(&self, event: &str) -> Vec<serde_json::Value> {
        self.events()
            .into_iter()
            .filter(|e| e["fields"]["event"] == event)
            .collect()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn capture() -> (Captured, tracing::subscriber::DefaultGuard) {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_max_level(tracing::Level::DEBUG)
        .with_current_span(true)
        .with_writer(captured.clone())
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (captured, guard)
}

struct AllPass(HarnessDescriptor);

#[async_trait]
impl Harness for AllPass {
    fn descriptor(&self) -> &HarnessDescriptor {
        &self.0
    }

    async fn run(&self, _: &Invocation, ctx: &HarnessContext) -> Result<HarnessOutput, HarnessError> {
        ctx.set_total(4);
        for i in 0..4 {
            ctx.record_unit(UnitOutcome {
                id: format!("case-{i}"),
                passed: Some(true),
                ..Default::default()
            })?;
        }
        Ok(HarnessOutput::default())
    }
}

#[tokio::test]
async fn a_reproduced_run_emits_its_lifecycle() {
    let (captured, _guard) = capture();
    let before_submitted = METRICS.runs_submitted();
    let before_completed = METRICS.runs_completed();

    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let config = EngineConfig::default();
    let mut registry = HarnessRegistry::new();
    registry.register(
        "coding",
        "humaneval",
        Arc::new(AllPass(HarnessDescriptor::new("humaneval", "humaneval-runner"))),
    );
    let executor = Arc::new(Executor::new(
        Arc::new(registry),
        Arc::new(MemoryCasStore::new()),
        ExecutorConfig::from(&config),
    ));
    let scheduler = RunScheduler::new(store.clone(), config.clone());
    let worker = Worker::new("obs-worker", store, executor, config);

    scheduler
        .add_claim(ClaimRecord {
            claim_id: "he-obs".into(),
            model: "model-a".to_string(),
            domain: "coding".to_string(),
            task: "HumanEval".to_string(),
            metric: "pass@1".to_string(),
            settings: ClaimSettings::default(),
            reference_score: Some(0.9),
            source_url: None,
            confidence: 0.9,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    let model = ModelConfig {
        provider: Provider::OpenAi,
        name: "model-a".to_string(),
        api_key_ref: None,
        price_input_per_mtok: None,
        price_output_per_mtok: None,
    };
    let run_id = scheduler.submit_run(&"he-obs".into(), model.clone(), 0.5).await.unwrap();
    scheduler.submit_run(&"he-obs".into(), model, 0.5).await.unwrap();
    worker.try_once(&CancellationToken::new()).await.unwrap();

    let submitted = captured.named("run.submitted");
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[0]["fields"]["created"], true);
    assert_eq!(submitted[1]["fields"]["created"], false);

    let leased = captured.named("run.leased");
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0]["fields"]["owner"], "obs-worker");

    let verdict = captured.named("verdict.classified");
    assert_eq!(verdict.len(), 1);
    assert_eq!(verdict[0]["fields"]["run_id"], run_id.as_str());

    let finished = captured.named("run.finished");
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0]["fields"]["status"], "succeeded");
    assert_eq!(finished[0]["span"]["run_id"], run_id.as_str());

    assert_eq!(captured.named("trace.recorded").len(), 1);

    // Counters are process-wide; other tests may bump them concurrently.
    assert!(METRICS.runs_submitted() > before_submitted);
    assert!(METRICS.runs_completed() > before_completed);
}

#[test]
fn warnings_carry_the_error_text() {
    let (captured, _guard) = capture();
    let _span = RunSpan::enter("run-err", "claim-err");
    emit_run_finalize_error("run-err", &"store unavailable");
    emit_run_reclaimed("run-err", 3, false);

    let errors = captured.named("run.finalize_error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["level"], "WARN");
    assert_eq!(errors[0]["fields"]["error"], "store unavailable");
    assert_eq!(errors[0]["span"]["claim_id"], "claim-err");

    let reclaimed = captured.named("run.reclaimed");
    assert_eq!(reclaimed[0]["fields"]["requeued"], false);
}
