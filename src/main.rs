use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};

use flow_tester::config::catalog::FlowCatalog;
use flow_tester::config::flow::{DocumentFormat, FlowDefinition};
use flow_tester::config::settings::Settings;
use flow_tester::engine::FlowRunner;
use flow_tester::generate::FlowGenerator;
use flow_tester::interpreter::StepInterpreter;
use flow_tester::messaging::WebhookMessenger;
use flow_tester::provider::{self, create_provider};
use flow_tester::recipients::JsonFileSource;
use flow_tester::report::{JsonFileSink, ReportSink};
use flow_tester::telemetry;

type CliResult<T> = Result<T, Box<dyn Error>>;

const DEFAULT_CONFIG: &str = "flow-tester.toml";

#[derive(Parser, Debug)]
#[command(name = "flow-tester", version, about = "Scripted conversation tests for a messaging bot")]
struct Cli {
    /// Path to a TOML settings file (default: ./flow-tester.toml when present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the flow definitions in the flows directory
    List,
    /// Show the steps and criteria of one flow
    Show {
        /// Trigger name of the flow
        trigger: String,
    },
    /// Load a flow file and check its prerequisites
    Validate {
        /// Path to a .json or .toml flow file
        path: PathBuf,
    },
    /// Run a flow against its recipients and write a report
    Run {
        /// Trigger name of the flow
        trigger: String,

        /// Maximum number of recipients processed at once
        #[arg(long, value_name = "N")]
        workers: Option<usize>,

        /// Interpret the steps without sending anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Generate a flow definition from a free-text description
    Generate {
        /// Trigger name for the generated flow
        #[arg(long)]
        trigger: String,

        /// Description of the conversation with the bot
        #[arg(long)]
        prompt: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Json)]
        format: Format,

        /// Save the flow into the flows directory instead of printing it
        #[arg(long)]
        save: bool,

        /// Run the generated flow right away and write a report
        #[arg(long)]
        run: bool,

        /// Maximum number of recipients processed at once (with --run)
        #[arg(long, value_name = "N", requires = "run")]
        workers: Option<usize>,
    },
}

/// `generate` の出力先
struct GenerateOutput {
    format: DocumentFormat,
    save: bool,
    run: bool,
    workers: Option<usize>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Json,
    Toml,
}

impl From<Format> for DocumentFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Json => DocumentFormat::Json,
            Format::Toml => DocumentFormat::Toml,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = cli
        .config
        .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG)).filter(|path| path.exists()));
    let settings = match Settings::load(config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let _guard = match telemetry::init(&settings.log_level, &settings.log_directory()) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("ログディレクトリを作成できません: {e}");
            None
        }
    };
    settings.log_load_warnings();

    let result = match cli.command {
        Commands::List => cmd_list(&settings),
        Commands::Show { trigger } => cmd_show(&settings, &trigger),
        Commands::Validate { path } => cmd_validate(&settings, path),
        Commands::Run {
            trigger,
            workers,
            dry_run,
        } => cmd_run(&settings, &trigger, workers, dry_run).await,
        Commands::Generate {
            trigger,
            prompt,
            format,
            save,
            run,
            workers,
        } => {
            let output = GenerateOutput {
                format: format.into(),
                save,
                run,
                workers,
            };
            cmd_generate(&settings, &trigger, &prompt, output).await
        }
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "コマンドが失敗しました");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_list(settings: &Settings) -> CliResult<bool> {
    let catalog = FlowCatalog::new(&settings.paths.flows_directory);
    let mut found = 0;
    for discovered in catalog.discover() {
        found += 1;
        match discovered.result {
            Ok(flow) => println!(
                "{:<24} {:>3} steps  {}",
                flow.trigger(),
                flow.steps().len(),
                flow.description()
            ),
            Err(e) => println!("{:<24} invalid  {e}", discovered.path.display()),
        }
    }
    if found == 0 {
        println!("No flows in {}", catalog.directory().display());
    }
    Ok(true)
}

fn cmd_show(settings: &Settings, trigger: &str) -> CliResult<bool> {
    let catalog = FlowCatalog::new(&settings.paths.flows_directory);
    let Some(flow) = catalog.find(trigger) else {
        eprintln!("Flow '{trigger}' not found in {}", catalog.directory().display());
        return Ok(false);
    };
    print_flow(&flow);
    Ok(print_requirements(&flow, settings))
}

fn cmd_validate(settings: &Settings, path: PathBuf) -> CliResult<bool> {
    let flow = FlowCatalog::load(&path)?;
    println!("{} is a valid flow definition", path.display());
    print_flow(&flow);
    Ok(print_requirements(&flow, settings))
}

async fn cmd_run(
    settings: &Settings,
    trigger: &str,
    workers: Option<usize>,
    dry_run: bool,
) -> CliResult<bool> {
    let catalog = FlowCatalog::new(&settings.paths.flows_directory);
    let Some(flow) = catalog.find(trigger) else {
        eprintln!("Flow '{trigger}' not found in {}", catalog.directory().display());
        return Ok(false);
    };
    run_flow(settings, &flow, workers, dry_run).await
}

/// 前提条件を確認してフローを実行し、レポートを保存する
async fn run_flow(
    settings: &Settings,
    flow: &FlowDefinition,
    workers: Option<usize>,
    dry_run: bool,
) -> CliResult<bool> {
    if !print_requirements(flow, settings) {
        return Ok(false);
    }
    provider::check_available(&settings.llm).await?;

    let interpreter = match create_provider(&settings.llm)? {
        Some(model) => StepInterpreter::with_model(model, settings.execution.interpreter_retries),
        None => StepInterpreter::rules_only(),
    };
    let mut runner = FlowRunner::new(
        settings.clone(),
        interpreter,
        Arc::new(WebhookMessenger::new(settings.messaging.clone())?),
        Arc::new(JsonFileSource::new(settings.clone())),
    );
    if let Some(workers) = workers {
        runner = runner.with_worker_limit(workers);
    }

    if dry_run {
        for action in runner.plan(flow).await {
            let payload = serde_json::to_string(action.payload())?;
            let marker = if action.is_valid() { " " } else { "!" };
            println!("{marker} step {:>2} [{:?}] {payload}", action.ordinal(), action.source());
        }
        return Ok(true);
    }

    let handle = runner.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("中断要求を受け付けました。実行中のステップの完了を待ちます");
            handle.cancel();
        }
    });

    let report = runner.run(flow).await?;
    let path = JsonFileSink::new(settings.report_directory())
        .persist(&report)
        .await?;

    for line in report.summary_lines() {
        println!("{line}");
    }
    println!("Report: {}", path.display());
    Ok(report.is_success())
}

async fn cmd_generate(
    settings: &Settings,
    trigger: &str,
    prompt: &str,
    output: GenerateOutput,
) -> CliResult<bool> {
    provider::check_available(&settings.llm).await?;
    let generator = FlowGenerator::new(create_provider(&settings.llm)?);
    let flow = generator.generate(trigger, prompt).await;

    if output.save {
        let path = FlowCatalog::new(&settings.paths.flows_directory).save(&flow, output.format)?;
        info!(path = %path.display(), "生成したフローを保存しました");
        println!("Saved {}", path.display());
    }

    if output.run {
        print_flow(&flow);
        run_flow(settings, &flow, output.workers, false).await
    } else {
        if !output.save {
            println!("{}", flow.serialize(output.format)?);
        }
        Ok(true)
    }
}

fn print_flow(flow: &FlowDefinition) {
    println!("Trigger: {}", flow.trigger());
    if !flow.description().is_empty() {
        println!("Description: {}", flow.description());
    }
    println!(
        "Recipients: {}  Minimum steps: {}",
        flow.expected_recipients(),
        flow.min_steps_required()
    );
    for step in flow.steps() {
        println!("  {:>2}. {}", step.ordinal(), step.text());
    }
}

/// 前提条件を表示し、実行可能かどうかを返す
fn print_requirements(flow: &FlowDefinition, settings: &Settings) -> bool {
    let report = FlowCatalog::check_requirements(flow, settings);
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    for error in &report.errors {
        println!("error: {error}");
    }
    report.is_valid()
}
