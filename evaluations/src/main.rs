mod args;
mod datasets;
mod report;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use common::utils::config::{get_config, AppConfig, EmbeddingBackend};
use session::{metrics::best_over_golds, RagSession};

use crate::{
    args::Config,
    datasets::{load_samples, EvalSample},
    report::{recall_at_k, EvalReport, SampleReport},
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = Config::parse();
    let samples = load_samples(&config.dataset_file, config.limit)?;
    let started_at = Utc::now();
    let run_id = Uuid::new_v4().to_string();
    info!(
        run_id = %run_id,
        samples = samples.len(),
        concurrency = config.concurrency,
        "starting evaluation run"
    );

    // One session per sample, each with its own working directory; the
    // semaphore bounds how many are in flight. Sessions share no state, so
    // no cross-task locking is needed.
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut handles = Vec::with_capacity(samples.len());
    for (idx, sample) in samples.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let app_config = sample_config(&config, idx)?;
        let top_k = config.top_k;
        handles.push(tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .context("evaluation semaphore closed")?;
            Ok::<SampleReport, anyhow::Error>(evaluate_sample(idx, sample, app_config, top_k).await)
        }));
    }

    // Aggregation is ordered by input index regardless of completion order.
    let mut sample_reports = Vec::with_capacity(handles.len());
    for handle in handles {
        sample_reports.push(handle.await.context("evaluation task panicked")??);
    }

    let llm_name = config
        .llm_name
        .clone()
        .unwrap_or_else(|| AppConfig::default().llm_name);
    let embedding_backend = if config.hashed_embeddings {
        "hashed".to_string()
    } else {
        "openai".to_string()
    };
    let eval_report = EvalReport::new(
        run_id,
        started_at,
        llm_name,
        embedding_backend,
        config.top_k,
        sample_reports,
    );
    eval_report.write(&config.report)?;

    println!(
        "evaluated {} samples ({} failed): EM {:.3}, F1 {:.3}, recall@{} {:.3}",
        eval_report.samples.len(),
        eval_report.failed_samples,
        eval_report.mean_exact_match,
        eval_report.mean_f1,
        eval_report.top_k,
        eval_report.mean_recall_at_k,
    );
    println!("report written to {}", config.report.display());
    Ok(())
}

/// Per-sample configuration: an isolated working directory under the run's
/// save_dir, plus CLI overrides on top of the layered config.
fn sample_config(config: &Config, idx: usize) -> Result<AppConfig> {
    let mut app_config = get_config().context("loading configuration")?;
    app_config.save_dir = format!("{}/sample_{idx:04}", config.save_dir);
    if let Some(llm_name) = &config.llm_name {
        app_config.llm_name = llm_name.clone();
    }
    if let Some(llm_base_url) = &config.llm_base_url {
        app_config.llm_base_url = llm_base_url.clone();
    }
    if let Some(embedding_name) = &config.embedding_name {
        app_config.embedding_name = embedding_name.clone();
    }
    if config.hashed_embeddings {
        app_config.embedding_backend = EmbeddingBackend::Hashed;
    }
    Ok(app_config)
}

/// Runs one full index + rag_qa cycle. Failures become a report entry, never
/// a batch abort.
async fn evaluate_sample(
    idx: usize,
    sample: EvalSample,
    config: AppConfig,
    top_k: usize,
) -> SampleReport {
    match run_sample(&sample, config, top_k).await {
        Ok((answer, exact_match, f1, recall)) => SampleReport {
            idx,
            question: sample.question,
            answer: Some(answer),
            exact_match,
            f1,
            recall_at_k: recall,
            error: None,
        },
        Err(err) => {
            warn!(idx, error = %format!("{err:#}"), "sample evaluation failed");
            SampleReport {
                idx,
                question: sample.question,
                answer: None,
                exact_match: 0.0,
                f1: 0.0,
                recall_at_k: 0.0,
                error: Some(format!("{err:#}")),
            }
        }
    }
}

async fn run_sample(
    sample: &EvalSample,
    config: AppConfig,
    top_k: usize,
) -> Result<(String, f64, f64, f64)> {
    let mut session = RagSession::open(config).await?;
    if !sample.paragraphs.is_empty() {
        session.index(&sample.paragraphs).await?;
    }

    let queries = vec![sample.question.clone()];
    let gold_docs = vec![sample.paragraphs.clone()];
    let gold_answers = vec![sample.answers.clone()];
    let output = session
        .rag_qa(&queries, Some(&gold_docs), Some(&gold_answers))
        .await?;

    let solution = output
        .solutions
        .into_iter()
        .next()
        .context("rag_qa returned no solution")?;
    let answer = solution.answer.clone().unwrap_or_default();
    let (exact_match, f1) = best_over_golds(&sample.answers, &answer);
    let recall = recall_at_k(&sample.paragraphs, &solution.docs, top_k);
    Ok((answer, exact_match, f1, recall))
}
