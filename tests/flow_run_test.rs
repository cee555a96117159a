//! フロー実行の統合テスト
//!
//! 受信者データソースからレポート作成までを、モックのメッセージ送信と
//! 言語モデルを使って通しで確認します。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use flow_tester::config::action::{ActionPayload, ActionSource, ToolKind};
use flow_tester::config::catalog::FlowCatalog;
use flow_tester::config::flow::{DocumentFormat, FlowDefinition};
use flow_tester::config::settings::Settings;
use flow_tester::engine::{FlowRunner, RecipientState, RunError, StepStatus};
use flow_tester::error::{DataSourceError, ProviderError};
use flow_tester::generate::FlowGenerator;
use flow_tester::interpreter::StepInterpreter;
use flow_tester::messaging::{Conversation, Delivery, Messenger, Receipt};
use flow_tester::provider::LanguageModel;
use flow_tester::recipients::{JsonFileSource, Recipient, RecipientSource};
use flow_tester::report::{JsonFileSink, ReportSink, RecipientVerdict, RunStatus};

// ============================================================================
// モック
// ============================================================================

/// 送信内容を記録し、本文ごとに用意した応答を返すメッセージ送信
#[derive(Default)]
struct MockMessenger {
    script: Mutex<HashMap<String, Vec<Delivery>>>,
    sent: Mutex<Vec<(String, String)>>,
}

impl MockMessenger {
    fn with_script(script: Vec<(&str, Vec<Delivery>)>) -> Self {
        Self {
            script: Mutex::new(
                script
                    .into_iter()
                    .map(|(body, deliveries)| (body.to_string(), deliveries))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    fn sent_to(&self, recipient: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to == recipient)
            .map(|(_, what)| what.clone())
            .collect()
    }

    fn record(&self, to: Conversation<'_>, what: String) -> Delivery {
        self.sent
            .lock()
            .unwrap()
            .push((to.recipient.id.clone(), what.clone()));
        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(&what)
            .filter(|queue| !queue.is_empty())
            .map(|queue| queue.remove(0));
        scripted.unwrap_or_else(Delivery::succeeded)
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn send_text(&self, to: Conversation<'_>, body: &str) -> Delivery {
        self.record(to, body.to_string())
    }

    async fn send_location(&self, to: Conversation<'_>, latitude: f64, longitude: f64) -> Delivery {
        self.record(to, format!("location:{latitude},{longitude}"))
    }

    async fn send_image(&self, to: Conversation<'_>, image: &Path, _caption: &str) -> Delivery {
        self.record(to, format!("image:{}", file_name(image)));
        Delivery::Succeeded(Receipt::default().with_flag("image_extracted"))
    }

    async fn send_voice(&self, to: Conversation<'_>, voice: &Path) -> Delivery {
        self.record(to, format!("voice:{}", file_name(voice)));
        Delivery::Succeeded(Receipt::default().with_flag("voice_transcribed"))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// 固定の受信者を返すデータソース
struct FixedRecipients(Vec<Recipient>);

#[async_trait]
impl RecipientSource for FixedRecipients {
    async fn resolve(&self, _flow: &FlowDefinition) -> Result<Vec<Recipient>, DataSourceError> {
        Ok(self.0.clone())
    }
}

/// 常に同じテキストを返し、呼び出し回数を数える言語モデル
struct CountingModel {
    output: String,
    calls: AtomicUsize,
}

impl CountingModel {
    fn new(output: &str) -> Self {
        Self {
            output: output.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for CountingModel {
    async fn extract(&self, _system: &str, _prompt: &str) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }

    fn name(&self) -> &str {
        "counting"
    }
}

// ============================================================================
// ヘルパー
// ============================================================================

fn settings(base: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.execution.execution_delay_secs = 0;
    settings.execution.step_delay_ms = 0;
    settings.execution.max_retries = 3;
    settings.paths.base_path = base.to_path_buf();
    settings.paths.flows_directory = base.join("flows");
    settings.paths.media_directory = base.join("media");
    settings.paths.results_directory = base.join("results");
    settings.paths.default_employee_data = base.join("data").join("employees.json");
    settings
}

fn recipients(ids: &[&str]) -> Arc<FixedRecipients> {
    Arc::new(FixedRecipients(ids.iter().map(|id| Recipient::new(*id)).collect()))
}

fn text_flow(trigger: &str, bodies: &[&str]) -> FlowDefinition {
    FlowDefinition::new(
        trigger,
        "",
        bodies
            .iter()
            .map(|body| format!("User sends a message '{body}'")),
    )
}

fn runner(
    base: &Path,
    messenger: Arc<MockMessenger>,
    source: Arc<dyn RecipientSource>,
) -> FlowRunner {
    FlowRunner::new(settings(base), StepInterpreter::rules_only(), messenger, source)
}

// ============================================================================
// テスト
// ============================================================================

#[tokio::test]
async fn test_all_steps_succeed_for_every_recipient() {
    let dir = tempfile::tempdir().unwrap();
    let messenger = Arc::new(MockMessenger::default());
    let flow = text_flow("odometer", &["odometer", "confirm", "done"]);

    let report = runner(dir.path(), messenger.clone(), recipients(&["1", "2"]))
        .run(&flow)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.summary.recipients, 2);
    assert_eq!(report.summary.passed, 2);
    assert_eq!(report.summary.total_steps, 6);
    assert_eq!(report.summary.succeeded_steps, 6);
    assert_eq!(report.summary.retries, 0);
    assert!(report.is_success());
    for recipient in &report.recipients {
        assert_eq!(recipient.state, RecipientState::Succeeded);
        assert_eq!(
            recipient.steps.iter().map(|s| s.ordinal).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    // 複数受信者のときは会話リセットが先に送られる
    assert_eq!(
        messenger.sent_to("1"),
        vec!["Stop", "odometer", "confirm", "done"]
    );
}

#[tokio::test]
async fn test_transient_failures_are_retried_within_the_step() {
    let dir = tempfile::tempdir().unwrap();
    let messenger = Arc::new(MockMessenger::with_script(vec![(
        "two",
        vec![
            Delivery::Transient("503".to_string()),
            Delivery::Transient("429".to_string()),
        ],
    )]));
    let flow = text_flow("t", &["one", "two", "three", "four"]);

    let report = runner(dir.path(), messenger.clone(), recipients(&["1"]))
        .run(&flow)
        .await
        .unwrap();

    let steps = &report.recipients[0].steps;
    assert!(steps.iter().all(|s| s.status == StepStatus::Succeeded));
    assert_eq!(steps[1].attempt_count, 3);
    assert_eq!(
        steps[1]
            .attempts
            .iter()
            .map(|a| a.status)
            .collect::<Vec<_>>(),
        vec![StepStatus::Retried, StepStatus::Retried, StepStatus::Succeeded]
    );
    for index in [0, 2, 3] {
        assert_eq!(steps[index].attempt_count, 1);
    }
    assert_eq!(report.summary.retries, 2);
    assert_eq!(
        messenger.sent_to("1"),
        vec!["one", "two", "two", "two", "three", "four"]
    );
}

#[tokio::test]
async fn test_permanent_failure_skips_unreachable_steps() {
    let dir = tempfile::tempdir().unwrap();
    let messenger = Arc::new(MockMessenger::with_script(vec![(
        "three",
        vec![Delivery::Permanent("400 invalid recipient".to_string())],
    )]));
    let flow = FlowDefinition::from_json(
        r#"{
            "trigger": "expense",
            "flow_steps": [
                "User sends a message 'one'",
                "User sends a message 'two'",
                "User sends a message 'three'",
                "User sends a message 'four'",
                "User sends a message 'five'"
            ],
            "success_criteria": {"min_steps_completed": 4}
        }"#,
    )
    .unwrap();

    let report = runner(dir.path(), messenger.clone(), recipients(&["1"]))
        .run(&flow)
        .await
        .unwrap();

    let recipient = &report.recipients[0];
    let statuses: Vec<StepStatus> = recipient.steps.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Succeeded,
            StepStatus::Succeeded,
            StepStatus::Failed,
            StepStatus::Skipped,
            StepStatus::Skipped
        ]
    );
    assert_eq!(recipient.state, RecipientState::Failed);
    assert_eq!(recipient.verdict, RecipientVerdict::Failed);
    assert_eq!(recipient.steps[2].attempt_count, 1);
    assert_eq!(messenger.sent_to("1"), vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_malformed_model_output_fails_only_that_step() {
    let dir = tempfile::tempdir().unwrap();
    let messenger = Arc::new(MockMessenger::default());
    let model = Arc::new(CountingModel::new("this is not json"));
    let interpreter = StepInterpreter::with_model(model.clone(), 1);
    let flow = FlowDefinition::new(
        "t",
        "",
        [
            "User sends a message 'hello'",
            "User wanders around the office for a while",
            "User sends a message 'bye'",
        ],
    );

    let runner = FlowRunner::new(
        settings(dir.path()),
        interpreter,
        messenger.clone(),
        recipients(&["1"]),
    );

    let plan = runner.plan(&flow).await;
    assert_eq!(model.calls(), 2);
    assert!(!plan[1].is_valid());
    assert_eq!(plan[1].tool(), ToolKind::Text);
    assert_eq!(plan[1].source(), ActionSource::Fallback);
    assert_eq!(
        plan[1].payload(),
        &ActionPayload::Text {
            body: "User wanders around the office for a while".to_string()
        }
    );

    let report = runner.run(&flow).await.unwrap();
    let steps = &report.recipients[0].steps;
    assert_eq!(steps[0].status, StepStatus::Succeeded);
    assert_eq!(steps[1].status, StepStatus::Failed);
    assert_eq!(steps[1].attempt_count, 0);
    assert!(steps[1].error.as_deref().unwrap().contains("解釈できません"));
    assert_eq!(steps[2].status, StepStatus::Succeeded);
    assert_eq!(messenger.sent_to("1"), vec!["hello", "bye"]);
}

#[tokio::test]
async fn test_rule_matches_never_call_the_model() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(CountingModel::new("{}"));
    let runner = FlowRunner::new(
        settings(dir.path()),
        StepInterpreter::with_model(model.clone(), 1),
        Arc::new(MockMessenger::default()),
        recipients(&["1"]),
    );
    let flow = FlowDefinition::new(
        "t",
        "",
        [
            "User sends a message 'odometer'",
            "User sends location latitude: 16.5423, longitude: 81.4969",
            "User uploads an image 'receipt.jpg' as proof",
        ],
    );

    let plan = runner.plan(&flow).await;

    assert_eq!(model.calls(), 0);
    assert!(plan.iter().all(|a| a.source() == ActionSource::Rule));
    assert_eq!(
        plan.iter().map(|a| a.tool()).collect::<Vec<_>>(),
        vec![ToolKind::Text, ToolKind::Location, ToolKind::Image]
    );
}

#[tokio::test]
async fn test_media_steps_realize_required_flags() {
    let dir = tempfile::tempdir().unwrap();
    let media = dir.path().join("media");
    std::fs::create_dir_all(&media).unwrap();
    std::fs::write(media.join("receipt.jpg"), [0xFF, 0xD8, 0xFF, 0xE0]).unwrap();

    let messenger = Arc::new(MockMessenger::default());
    let flow = FlowDefinition::from_json(
        r#"{
            "trigger": "expense",
            "flow_steps": [
                "User sends a message 'expense'",
                "User uploads an image 'receipt.jpg' as proof of the expense",
                "User uploads an image 'missing.jpg' as proof of the expense"
            ],
            "validation_rules": {"required_media": ["image"]},
            "success_criteria": {"min_steps_completed": 2, "required_flags": ["image_extracted"]}
        }"#,
    )
    .unwrap();

    let report = runner(dir.path(), messenger.clone(), recipients(&["1"]))
        .run(&flow)
        .await
        .unwrap();

    let recipient = &report.recipients[0];
    assert_eq!(recipient.verdict, RecipientVerdict::Passed);
    assert!(recipient.steps[1].flags.contains("image_extracted"));
    // 見つからないメディアは送信前に恒久的な失敗になる
    assert_eq!(recipient.steps[2].status, StepStatus::Failed);
    assert_eq!(recipient.steps[2].attempt_count, 1);
    assert_eq!(messenger.sent_to("1"), vec!["expense", "image:receipt.jpg"]);
}

#[tokio::test]
async fn test_unsendable_required_media_skips_remaining_steps() {
    let dir = tempfile::tempdir().unwrap();
    let messenger = Arc::new(MockMessenger::default());
    let flow = FlowDefinition::from_json(
        r#"{
            "trigger": "expense",
            "flow_steps": [
                "User sends a message 'expense'",
                "User uploads an image 'missing.jpg' as proof of the expense",
                "User sends a message 'confirm'",
                "User sends a message 'done'"
            ],
            "validation_rules": {"required_media": ["image"]},
            "success_criteria": {"min_steps_completed": 1}
        }"#,
    )
    .unwrap();

    let report = runner(dir.path(), messenger.clone(), recipients(&["1"]))
        .run(&flow)
        .await
        .unwrap();

    let recipient = &report.recipients[0];
    assert_eq!(
        recipient.steps.iter().map(|s| s.status).collect::<Vec<_>>(),
        vec![
            StepStatus::Succeeded,
            StepStatus::Failed,
            StepStatus::Skipped,
            StepStatus::Skipped
        ]
    );
    assert_eq!(recipient.verdict, RecipientVerdict::Failed);
    assert_eq!(messenger.sent_to("1"), vec!["expense"]);
}

#[tokio::test]
async fn test_cancel_before_run_aborts_every_recipient() {
    let dir = tempfile::tempdir().unwrap();
    let messenger = Arc::new(MockMessenger::default());
    let runner = runner(dir.path(), messenger.clone(), recipients(&["1", "2", "3"]));
    runner.handle().cancel();

    let report = runner.run(&text_flow("t", &["a", "b"])).await.unwrap();

    assert_eq!(report.status, RunStatus::Aborted);
    assert_eq!(report.summary.aborted, 3);
    assert_eq!(report.summary.skipped_steps, 6);
    assert!(report
        .recipients
        .iter()
        .all(|r| r.verdict == RecipientVerdict::Aborted));
    assert!(messenger.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_recipient_list_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let result = runner(
        dir.path(),
        Arc::new(MockMessenger::default()),
        recipients(&[]),
    )
    .run(&text_flow("t", &["a"]))
    .await;

    assert!(matches!(result, Err(RunError::NoRecipients(trigger)) if trigger == "t"));
}

#[tokio::test]
async fn test_json_file_source_and_report_sink() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(
        data.join("field_team.json"),
        r#"[
            {"Employee Phone": "919700000001", "Employee Name": "Asha"},
            {"Employee Phone": "919700000002", "Employee Name": "Ravi"},
            {"Employee Phone": "919700000003", "Employee Name": "Meena"}
        ]"#,
    )
    .unwrap();

    let settings = settings(dir.path());
    let flow = FlowDefinition::from_json(
        r#"{
            "trigger": "odometer",
            "description": "Run this for 2 users",
            "data_source": "data/field_team.json",
            "flow_steps": ["User sends a message 'odometer'"]
        }"#,
    )
    .unwrap();

    let runner = FlowRunner::new(
        settings.clone(),
        StepInterpreter::rules_only(),
        Arc::new(MockMessenger::default()),
        Arc::new(JsonFileSource::new(settings.clone())),
    );
    let report = runner.run(&flow).await.unwrap();

    assert_eq!(
        report
            .recipients
            .iter()
            .map(|r| r.recipient.display_name())
            .collect::<Vec<_>>(),
        vec!["Asha", "Ravi"]
    );

    let path: PathBuf = JsonFileSink::new(settings.report_directory())
        .persist(&report)
        .await
        .unwrap();
    assert!(path.starts_with(dir.path().join("results").join("reports")));
    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(saved["summary"]["passed"], 2);
}

#[tokio::test]
async fn test_missing_data_source_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path());
    let runner = FlowRunner::new(
        settings.clone(),
        StepInterpreter::rules_only(),
        Arc::new(MockMessenger::default()),
        Arc::new(JsonFileSource::new(settings)),
    );

    let result = runner.run(&text_flow("t", &["a"])).await;

    assert!(matches!(result, Err(RunError::DataSource(_))));
}

#[tokio::test]
async fn test_missing_named_data_source_is_fatal_even_with_default_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("data")).unwrap();
    std::fs::write(
        dir.path().join("data").join("employees.json"),
        r#"[{"phone": "DEFAULT-1"}, {"phone": "DEFAULT-2"}]"#,
    )
    .unwrap();
    let settings = settings(dir.path());
    let messenger = Arc::new(MockMessenger::default());
    let runner = FlowRunner::new(
        settings.clone(),
        StepInterpreter::rules_only(),
        messenger.clone(),
        Arc::new(JsonFileSource::new(settings.clone())),
    );
    let flow = text_flow("t", &["a"]).with_data_source("data/field_team_typo.json");

    let result = runner.run(&flow).await;

    assert!(matches!(
        result,
        Err(RunError::DataSource(DataSourceError::NotFound(path))) if path.ends_with("field_team_typo.json")
    ));
    assert!(messenger.sent_to("DEFAULT-1").is_empty());
    assert!(!FlowCatalog::check_requirements(&flow, &settings).is_valid());
}

#[tokio::test]
async fn test_generated_flow_runs_like_a_catalog_flow() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(CountingModel::new(
        "Step2: User sends a message 'expense'\n\
         Bot: Please upload the receipt\n\
         Step3: User sends a message 'confirm'",
    ));
    let flow = FlowGenerator::new(Some(model.clone()))
        .generate("expense", "Step1: User asks for an expense report")
        .await;
    assert_eq!(model.calls(), 1);
    assert_eq!(flow.steps().len(), 3);

    let messenger = Arc::new(MockMessenger::default());
    let report = runner(dir.path(), messenger.clone(), recipients(&["1"]))
        .run(&flow)
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.trigger, "expense");
    assert_eq!(messenger.sent_to("1"), vec!["Stop", "expense", "confirm"]);
}

#[test]
fn test_saved_flow_loads_back_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = FlowCatalog::new(dir.path());
    let flow = text_flow("round_trip", &["hello", "bye"])
        .with_data_source("data/employees.json")
        .with_media_path("media/images");

    for format in [DocumentFormat::Json, DocumentFormat::Toml] {
        let path = catalog.save(&flow, format).unwrap();
        assert_eq!(FlowCatalog::load(&path).unwrap(), flow);
    }
    assert_eq!(catalog.find("round_trip").unwrap(), flow);
}

#[tokio::test]
async fn test_step_timeout_is_reported() {
    struct SlowMessenger;

    #[async_trait]
    impl Messenger for SlowMessenger {
        async fn send_text(&self, _to: Conversation<'_>, _body: &str) -> Delivery {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Delivery::succeeded()
        }
        async fn send_location(&self, _to: Conversation<'_>, _lat: f64, _lon: f64) -> Delivery {
            Delivery::succeeded()
        }
        async fn send_image(&self, _to: Conversation<'_>, _image: &Path, _caption: &str) -> Delivery {
            Delivery::succeeded()
        }
        async fn send_voice(&self, _to: Conversation<'_>, _voice: &Path) -> Delivery {
            Delivery::succeeded()
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let flow = FlowDefinition::from_json(
        r#"{"trigger": "t", "flow_steps": ["User sends a message 'a'"], "timeout_seconds": 1, "retry_count": 0}"#,
    )
    .unwrap();
    let runner = FlowRunner::new(
        settings(dir.path()),
        StepInterpreter::rules_only(),
        Arc::new(SlowMessenger),
        recipients(&["1"]),
    );

    let report = runner.run(&flow).await.unwrap();

    let step = &report.recipients[0].steps[0];
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.error.as_deref().unwrap().contains("タイムアウト"));
}
