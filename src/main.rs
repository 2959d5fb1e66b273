use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod backend;
mod config;
mod context;
mod extraction;
mod judge;
mod metrics;
mod models;
mod output;
mod prompts;
mod runner;
mod scoring;
mod statistics;
mod store;
mod verdict;

use crate::backend::BackendKind;
use crate::config::Config;
use crate::context::EvalContext;
use crate::metrics::MetricKind;
use crate::models::GenerationParameters;
use crate::output::{OutputFormat, print_report};
use crate::prompts::Rubric;
use crate::runner::Runner;
use crate::store::JsonFileStore;

/// LLM judge evaluation CLI - generate, score and rejudge model outputs
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format: plain or json
    #[arg(short, long, global = true, default_value = "plain")]
    output: OutputFormat,

    /// Verbose output - debug logging for every backend request
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct SamplingArgs {
    #[arg(long)]
    temperature: Option<f64>,

    #[arg(long)]
    top_p: Option<f64>,

    #[arg(long)]
    top_k: Option<u32>,

    #[arg(long)]
    max_new_tokens: Option<u32>,
}

impl SamplingArgs {
    fn into_parameters(self) -> GenerationParameters {
        GenerationParameters {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            max_new_tokens: self.max_new_tokens,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate text from one backend
    Generate {
        #[arg(value_enum)]
        backend: BackendKind,
        model: String,
        prompt: String,

        /// Print fragments as they arrive
        #[arg(long)]
        stream: bool,

        #[command(flatten)]
        sampling: SamplingArgs,
    },
    /// Score a candidate against a reference with the judge model
    Judge {
        candidate: String,
        reference: String,

        #[arg(long, value_enum)]
        backend: Option<BackendKind>,

        #[arg(long)]
        model: Option<String>,

        #[arg(long, value_enum)]
        rubric: Option<Rubric>,

        /// Also fetch per-dimension score-digit distributions (vllm only)
        #[arg(long)]
        distributions: bool,
    },
    /// Compute reference-based metrics
    Metrics {
        candidate: String,
        reference: String,

        #[arg(long = "metric", value_enum, value_delimiter = ',',
              default_values_t = vec![MetricKind::Bleu, MetricKind::Rouge, MetricKind::Cosine])]
        metrics: Vec<MetricKind>,
    },
    /// Label a claim as supported, refuted or not enough info
    Verify {
        claim: String,
        evidence: String,

        #[arg(long, value_enum)]
        backend: Option<BackendKind>,

        #[arg(long)]
        model: Option<String>,
    },
    /// Re-score stored generations and persist the judgements
    Rejudge {
        /// JSON store holding generations and judgements
        #[arg(long)]
        store: PathBuf,

        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<u64>,

        #[arg(long)]
        reference: String,

        #[arg(long, value_enum)]
        backend: Option<BackendKind>,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        prompt_version: Option<String>,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = Config::load(args.config.as_deref())?;
    let runner = Runner::new(EvalContext::new(config));

    match args.command {
        Command::Generate {
            backend,
            model,
            prompt,
            stream,
            sampling,
        } => {
            let params = sampling.into_parameters();
            if stream {
                let mut fragments = runner.stream(backend, &model, &prompt, &params).await?;
                let mut stdout = std::io::stdout();
                while let Some(fragment) = fragments.next().await {
                    write!(stdout, "{}", fragment?)?;
                    stdout.flush()?;
                }
                writeln!(stdout)?;
            } else {
                let result = runner.generate(backend, &model, &prompt, &params).await?;
                print_report(&result, args.output);
            }
        }
        Command::Judge {
            candidate,
            reference,
            backend,
            model,
            rubric,
            distributions,
        } => {
            let judge = runner.judge_model(backend, model.as_deref());
            let report = runner
                .judge(&candidate, &reference, &judge, rubric, distributions)
                .await?;
            print_report(&report, args.output);
        }
        Command::Metrics {
            candidate,
            reference,
            metrics,
        } => {
            let report = runner.metrics(&metrics, &candidate, &reference).await;
            print_report(&report, args.output);
        }
        Command::Verify {
            claim,
            evidence,
            backend,
            model,
        } => {
            let judge = runner.judge_model(backend, model.as_deref());
            let verdict = runner.verify(&claim, &evidence, &judge).await?;
            print_report(&verdict, args.output);
        }
        Command::Rejudge {
            store,
            ids,
            reference,
            backend,
            model,
            prompt_version,
        } => {
            let store = JsonFileStore::open(&store)?;
            let judge = runner.judge_model(backend, model.as_deref());
            let report = runner
                .rejudge(&store, &ids, &reference, &judge, prompt_version.as_deref())
                .await?;
            print_report(&report, args.output);
        }
    }

    Ok(())
}
