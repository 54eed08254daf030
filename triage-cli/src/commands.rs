//! CLI subcommand handlers.

use anyhow::Context;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use triage_core::analysis::AnalysisEngine;
use triage_core::config::TriageConfig;
use triage_core::error::SchedulerError;
use triage_core::evidence::{DirectorySource, IncidentSource};
use triage_core::feedback::FeedbackRecorder;
use triage_core::processor::IncidentProcessor;
use triage_core::providers::create_provider;
use triage_core::scheduler::{ProcessorFactory, TriageScheduler, shutdown_signal};
use triage_core::store::StateStore;
use triage_core::types::{Incident, RetrievedFeedback};

use crate::{Commands, ConfigAction};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config: TriageConfig) -> anyhow::Result<()> {
    // Nothing works without the store, so failing to open it ends the process.
    let store = Arc::new(
        StateStore::open(&config.database.path)
            .with_context(|| format!("cannot open incident store {}", config.database.path.display()))?,
    );

    match command {
        Commands::Run { once } => handle_run(once, store, config).await,
        Commands::Analyze { incident_id } => {
            let processor = build_processor(store, &config)?;
            let result = processor.analyze_one(&incident_id).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Ingest { hours } => {
            handle_ingest(hours.unwrap_or(config.scheduler.lookback_hours), store, &config).await
        }
        Commands::Incidents {
            status,
            unreviewed,
            limit,
        } => {
            let incidents = store
                .run_blocking(move |store| {
                    if unreviewed {
                        store.analyzed_without_feedback(limit)
                    } else {
                        store.list_incidents(status)
                    }
                })
                .await?;
            if incidents.is_empty() {
                println!("No incidents.");
            }
            for incident in incidents.iter().take(limit) {
                println!("{}", incident_row(incident));
            }
            Ok(())
        }
        Commands::Show { incident_id } => handle_show(&incident_id, store).await,
        Commands::Feedback {
            incident_id,
            verdict,
            comment,
            relevance,
        } => {
            let recorded = FeedbackRecorder::new(store)
                .record_for_latest(&incident_id, verdict, &comment, relevance)
                .await?;
            println!(
                "Recorded feedback #{} for {}: {} -> {} (status now {})",
                recorded.feedback_id,
                recorded.incident_id,
                recorded.original_verdict,
                recorded.corrected_verdict,
                recorded.status
            );
            Ok(())
        }
        Commands::History { limit } => {
            let history = store
                .run_blocking(move |store| store.feedback_history(limit))
                .await?;
            if history.is_empty() {
                println!("No analyst feedback recorded yet.");
            }
            for item in &history {
                println!("{}", history_row(item));
            }
            Ok(())
        }
        Commands::Stats => {
            let (stats, feedback, pending) = store
                .run_blocking(|store| {
                    Ok((
                        store.aggregate_stats()?,
                        store.feedback_stats()?,
                        store.count_pending()?,
                    ))
                })
                .await?;
            println!("Incidents:      {}", stats.total_incidents());
            for (status, count) in &stats.incidents_by_status {
                println!("  {status:<12}  {count}");
            }
            println!("Pending:        {pending}");
            println!("Analyses:       {}", stats.total_analyses);
            println!(
                "Feedback:       {} ({} corrections)",
                feedback.total_feedback, feedback.corrections
            );
            println!("Accuracy:       {:.1}%", stats.accuracy * 100.0);
            println!("Mean relevance: {:.2}", stats.mean_relevance);
            Ok(())
        }
        Commands::Cleanup { days } => {
            let days = days.unwrap_or(config.scheduler.retention_days);
            let age = chrono::Duration::days(days as i64);
            let purged = store
                .run_blocking(move |store| store.purge_older_than(age))
                .await?;
            println!("Purged {purged} older than {days} days.");
            Ok(())
        }
        Commands::Config { action } => handle_config(action, None),
    }
}

/// Construct the processor from configuration. Used directly by one-shot
/// commands and as the scheduler's lazy factory.
fn build_processor(
    store: Arc<StateStore>,
    config: &TriageConfig,
) -> Result<IncidentProcessor, SchedulerError> {
    let provider = create_provider(&config.llm).map_err(|e| SchedulerError::Initialization {
        message: e.to_string(),
    })?;
    let engine = AnalysisEngine::from_config(Arc::clone(&store), provider, config).map_err(|e| {
        SchedulerError::Initialization {
            message: e.to_string(),
        }
    })?;
    let mut processor = IncidentProcessor::new(store, engine);
    if let Some(dir) = &config.evidence.incidents_dir {
        processor = processor.with_source(Arc::new(DirectorySource::new(dir.clone())));
    }
    Ok(processor)
}

async fn handle_run(once: bool, store: Arc<StateStore>, config: TriageConfig) -> anyhow::Result<()> {
    let factory_config = config.clone();
    let factory: ProcessorFactory =
        Arc::new(move |store: Arc<StateStore>| build_processor(store, &factory_config));
    let mut scheduler = TriageScheduler::new(config.scheduler.clone(), store, factory)?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    if once {
        let report = scheduler.run_once(&cancel).await?;
        println!(
            "Cycle {}: {} attempted, {} succeeded, {} failed, {} skipped, {} ingested in {:.1}s",
            report.cycle_id,
            report.attempted,
            report.succeeded,
            report.failed,
            report.skipped,
            report.ingested,
            report.duration.as_secs_f64()
        );
        return Ok(());
    }

    scheduler.run(cancel).await;
    Ok(())
}

async fn handle_ingest(hours: u64, store: Arc<StateStore>, config: &TriageConfig) -> anyhow::Result<()> {
    let dir = config
        .evidence
        .incidents_dir
        .clone()
        .context("evidence.incidents_dir is not configured")?;
    let source = DirectorySource::new(dir);
    let since = Utc::now() - chrono::Duration::hours(hours as i64);
    let incidents = source.fetch_recent(since).await?;
    let found = incidents.len();

    let inserted = store
        .run_blocking(move |store| {
            let mut inserted = 0;
            for incident in &incidents {
                if store.put_incident(incident)? {
                    inserted += 1;
                }
            }
            Ok(inserted)
        })
        .await?;
    println!(
        "Ingested {inserted} new incident(s) from {} ({} already known).",
        source.describe(),
        found - inserted
    );
    Ok(())
}

async fn handle_show(incident_id: &str, store: Arc<StateStore>) -> anyhow::Result<()> {
    let id = incident_id.to_string();
    let (incident, analysis) = store
        .run_blocking(move |store| Ok((store.get_incident(&id)?, store.latest_analysis(&id)?)))
        .await?;
    let incident = incident.with_context(|| format!("incident {incident_id} not found"))?;

    println!("Incident:   {}", incident.incident_id);
    println!("Status:     {}", incident.status);
    println!("Created:    {}", incident.created_at.to_rfc3339());
    println!("User:       {}", incident.user_email.as_deref().unwrap_or("unknown"));
    match (&incident.file_name, incident.file_size) {
        (Some(name), Some(size)) => println!("File:       {name} ({size} bytes)"),
        (Some(name), None) => println!("File:       {name}"),
        _ => println!("File:       none"),
    }

    match analysis {
        None => println!("\nNot analysed yet."),
        Some(analysis) => {
            println!("\nAnalysis #{} at {}", analysis.id, analysis.created_at.to_rfc3339());
            println!("Verdict:    {}", analysis.verdict);
            println!("Confidence: {:.0}%", analysis.confidence * 100.0);
            println!("Took:       {:.1}s", analysis.processing_time_secs);
            println!("Reasoning:\n{}", analysis.reasoning);
        }
    }
    Ok(())
}

pub fn handle_config(action: ConfigAction, explicit: Option<&Path>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = triage_core::config::load_config(explicit)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigAction::Init => {
            let path = triage_core::config::user_config_path()
                .context("no home directory to place the config file in")?;
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let toml_str = toml::to_string_pretty(&TriageConfig::default())?;
            std::fs::write(&path, toml_str)?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
        ConfigAction::Path => {
            match triage_core::config::user_config_path() {
                Some(path) => println!("{}", path.display()),
                None => println!("No user configuration directory on this platform."),
            }
            Ok(())
        }
    }
}

fn incident_row(incident: &Incident) -> String {
    format!(
        "{:<24} {:<9} {}  {}",
        incident.incident_id,
        incident.status,
        incident.created_at.format("%Y-%m-%d %H:%M"),
        incident.file_name.as_deref().unwrap_or("-")
    )
}

fn history_row(item: &RetrievedFeedback) -> String {
    let fb = &item.feedback;
    let marker = if fb.is_correction() { "corrected" } else { "confirmed" };
    format!(
        "#{:<5} {:<20} {} -> {} [{marker}, relevance {:.1}] {}",
        fb.id,
        fb.incident_id,
        fb.original_verdict,
        fb.corrected_verdict,
        fb.relevance_score.value(),
        single_line(&fb.analyst_comment, 60)
    )
}

/// First line of `text`, cut to `max` characters.
fn single_line(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > max {
        let cut: String = line.chars().take(max).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use triage_core::types::{Feedback, RelevanceScore, Verdict};

    #[test]
    fn test_single_line() {
        assert_eq!(single_line("short", 10), "short");
        assert_eq!(single_line("first\nsecond", 10), "first");
        assert_eq!(single_line("abcdefghij", 4), "abcd...");
        assert_eq!(single_line("", 4), "");
    }

    #[test]
    fn test_incident_row() {
        let incident = Incident::new("INC-42", serde_json::json!({}))
            .with_created_at(Utc.with_ymd_and_hms(2026, 5, 4, 9, 30, 0).unwrap());
        let row = incident_row(&incident);
        assert!(row.starts_with("INC-42"));
        assert!(row.contains("pending"));
        assert!(row.contains("2026-05-04 09:30"));
        assert!(row.ends_with('-'));
    }

    #[test]
    fn test_history_row_marks_corrections() {
        let item = RetrievedFeedback {
            feedback: Feedback {
                id: 7,
                incident_id: "INC-7".into(),
                analysis_id: 3,
                original_verdict: Verdict::TruePositive,
                corrected_verdict: Verdict::FalsePositive,
                analyst_comment: "Test fixture data".into(),
                relevance_score: RelevanceScore::HIGH,
                created_at: Utc::now(),
            },
            file_name: None,
            file_type: None,
            original_reasoning: None,
        };
        let row = history_row(&item);
        assert!(row.contains("TRUE_POSITIVE -> FALSE_POSITIVE"));
        assert!(row.contains("corrected"));
        assert!(row.contains("Test fixture data"));
    }

    #[test]
    fn test_missing_api_key_is_initialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("t.db")).unwrap());
        let mut config = TriageConfig::default();
        config.llm.api_key_env = "DLP_TRIAGE_TEST_KEY_THAT_IS_NEVER_SET".into();
        let err = build_processor(store, &config).err().unwrap();
        assert!(matches!(err, SchedulerError::Initialization { .. }));
    }
}
