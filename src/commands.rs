/// Subcommand handlers
///
/// Reports go to stdout (plain text or JSON); logging goes to stderr and the
/// log file. Handlers return `DipwatchResult<()>`; `main` maps errors to
/// exit codes.
use crate::arguments::{tie_break_name, Cli, Command, SignalArgs};
use crate::config::Config;
use crate::errors::{DipwatchError, DipwatchResult};
use crate::export::{self, ExportFormat};
use crate::logger::{self, LogTag};
use crate::prune::{self, PruneReport, RetentionPolicy};
use crate::scheduler::{self, now_ms, SchedulerSettings, ShutdownSignal};
use crate::signals::{record_signal, run_detection, DetectorSettings};
use crate::storage::types::{EvaluationRecord, EvaluationStatus, NewSignal};
use crate::storage::Database;
use crate::triggers::{
    build_summary, list_evaluations, run_analysis, token_detail, AnalyzerSettings,
    EvaluationFilter,
};
use colored::Colorize;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn fmt_ts(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn fmt_opt_pct(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:+.2}%", v))
        .unwrap_or_else(|| "-".to_string())
}

fn print_json<T: Serialize>(value: &T) -> DipwatchResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Execute the parsed command against the resolved config
pub async fn dispatch(cli: &Cli, config: Config) -> DipwatchResult<()> {
    let db_path = cli.db_path(&config);

    match &cli.command {
        Command::Init => cmd_init(&db_path),
        Command::Evaluate { limit } => cmd_evaluate(&db_path, &config, *limit),
        Command::Run { interval, cycles } => cmd_run(&db_path, &config, *interval, *cycles).await,
        Command::Detect => cmd_detect(&db_path, &config),
        Command::Signal(args) => cmd_signal(&db_path, &config, args),
        Command::Prune { dry_run, vacuum } => cmd_prune(&db_path, &config, *dry_run, *vacuum),
        Command::Status { json } => cmd_status(&db_path, &config, *json),
        Command::List {
            status,
            outcome,
            limit,
            json,
        } => {
            let filter = EvaluationFilter {
                status: *status,
                outcome: *outcome,
                limit: Some(*limit),
                ..Default::default()
            };
            cmd_list(&db_path, &filter, *json)
        }
        Command::Show { token } => cmd_show(&db_path, token),
        Command::Export {
            format,
            out,
            status,
        } => cmd_export(&db_path, *format, out.clone(), *status),
        Command::Doctor { json } => cmd_doctor(&db_path, *json),
    }
}

// =============================================================================
// WRITE COMMANDS
// =============================================================================

pub fn cmd_init(db_path: &Path) -> DipwatchResult<()> {
    Database::create(db_path)?;
    println!("Initialized {}", db_path.display());
    Ok(())
}

pub fn cmd_evaluate(db_path: &Path, config: &Config, limit: Option<usize>) -> DipwatchResult<()> {
    let db = Database::open(db_path)?;
    let mut settings = AnalyzerSettings::from_config(&config.trigger);
    settings.max_examined = limit;

    let stats = run_analysis(&db, now_ms(), &settings)?;
    println!(
        "Examined {}: {} done, {} no data, {} still pending, {} failed",
        stats.examined, stats.done, stats.no_data, stats.still_pending, stats.failed
    );
    Ok(())
}

pub async fn cmd_run(
    db_path: &Path,
    config: &Config,
    interval: Option<u64>,
    cycles: Option<u64>,
) -> DipwatchResult<()> {
    let db = Database::open(db_path)?;
    let mut settings = SchedulerSettings::from_config(config);
    if let Some(secs) = interval {
        settings.interval = Duration::from_secs(secs);
    }
    settings.max_cycles = cycles;

    let shutdown = ShutdownSignal::new();
    scheduler::spawn_signal_listener(shutdown.clone());

    let counters = scheduler::run_loop(db, settings, shutdown).await?;
    println!(
        "Stopped after {} cycles ({} failed): {} signals, {} done, {} no data, {} rows pruned",
        counters.cycles,
        counters.failed_cycles,
        counters.signals_recorded,
        counters.evaluations_done,
        counters.evaluations_no_data,
        counters.rows_pruned
    );
    Ok(())
}

pub fn cmd_detect(db_path: &Path, config: &Config) -> DipwatchResult<()> {
    let db = Database::open(db_path)?;
    if !config.detector.enabled {
        logger::warning(LogTag::Detector, "detector.enabled = false, running anyway");
    }
    let settings = DetectorSettings::from_config(&config.detector, &config.trigger);
    let stats = run_detection(&db, now_ms(), &settings)?;
    println!(
        "Scanned {} pairs: {} signals recorded, {} skipped, {} already active, {} failed",
        stats.pairs_scanned, stats.signals_recorded, stats.skipped, stats.already_active, stats.failed
    );
    Ok(())
}

pub fn cmd_signal(db_path: &Path, config: &Config, args: &SignalArgs) -> DipwatchResult<()> {
    let db = Database::open(db_path)?;
    let now = now_ms();

    let mut params = config.trigger.signal_params();
    if let Some(tp1) = args.tp1 {
        params.tp1_pct = tp1;
    }
    if let Some(sl) = args.sl {
        params.sl_pct = sl;
    }
    if let Some(secs) = args.lookahead_secs {
        params.lookahead_ms = (secs as i64).saturating_mul(1000);
    }
    if let Some(tf) = args.timeframe {
        params.timeframe = tf;
    }

    let signal = NewSignal {
        pair_address: args.pair.clone(),
        entry_ts: args.ts.unwrap_or(now),
        entry_price: args.price,
        params,
        ath_price: None,
        drop_from_ath: None,
    };
    let id = record_signal(&db, &signal, now)?;
    println!(
        "Recorded signal #{} for {} at {} (tp1 {}%, sl {}%, window ends {})",
        id,
        signal.pair_address,
        signal.entry_price,
        params.tp1_pct,
        params.sl_pct,
        fmt_ts(signal.entry_ts.saturating_add(params.lookahead_ms))
    );
    Ok(())
}

pub fn cmd_prune(db_path: &Path, config: &Config, dry_run: bool, vacuum: bool) -> DipwatchResult<()> {
    let db = Database::open(db_path)?;
    let policy = RetentionPolicy::from_config(&config.retention);
    let report = prune::prune(&db, &policy, now_ms(), dry_run, vacuum || config.retention.vacuum)?;
    print_prune_report(&report);
    Ok(())
}

fn print_prune_report(report: &PruneReport) {
    let (title, counts) = if report.dry_run {
        ("Would delete (dry run)", report.planned)
    } else {
        ("Deleted", report.deleted)
    };
    println!("{}", title.bold());
    println!("  evaluations  {}", counts.evaluations);
    println!("  signals      {}", counts.signals);
    println!("  price bars   {}", counts.price_bars);
    println!("  pairs        {}", counts.pairs);
    println!("  tokens       {}", counts.tokens);
    if report.vacuumed {
        println!("  (vacuumed)");
    }
}

// =============================================================================
// READ COMMANDS
// =============================================================================

pub fn cmd_status(db_path: &Path, config: &Config, json: bool) -> DipwatchResult<()> {
    let db = Database::open(db_path)?;
    let summary = build_summary(&db)?;
    let app_status = db.get_app_status()?;

    if json {
        #[derive(Serialize)]
        struct StatusOutput<'a> {
            summary: &'a crate::triggers::TriggerSummary,
            app_status: &'a Option<crate::storage::app_status::AppStatus>,
        }
        return print_json(&StatusOutput {
            summary: &summary,
            app_status: &app_status,
        });
    }

    println!("{}", "Trigger evaluations".bold());
    println!(
        "  signals {}  pending {}  done {}  no data {}",
        summary.total_signals, summary.pending, summary.done, summary.no_data
    );
    println!(
        "  TP1 first {} ({:.1}%)  SL first {} ({:.1}%)  neither {}",
        summary.tp1_first,
        summary.tp1_hit_rate * 100.0,
        summary.sl_first,
        summary.sl_first_rate * 100.0,
        summary.neither
    );
    println!(
        "  break-even after TP1 {:.1}%  post-TP1 max avg {}  median {}",
        summary.breakeven_after_tp1_rate * 100.0,
        fmt_opt_pct(summary.post_tp1_max_pct_avg),
        fmt_opt_pct(summary.post_tp1_max_pct_median)
    );
    println!(
        "  params: tp1 {}%  sl {}%  lookahead {}s  {}  tie-break {}",
        config.trigger.tp1_pct,
        config.trigger.sl_pct,
        config.trigger.lookahead_secs,
        config.trigger.timeframe,
        tie_break_name(config.trigger.tie_break)
    );

    if !summary.top_post_tp1.is_empty() {
        println!("\n{}", "Top post-TP1 runs".bold());
        for top in &summary.top_post_tp1 {
            println!(
                "  #{:<6} {:<46} entry {:<12} post-TP1 {}  {}",
                top.signal_id,
                top.pair_address,
                top.entry_price,
                fmt_opt_pct(Some(top.post_tp1_max_pct)).green(),
                top.url.as_deref().unwrap_or("")
            );
        }
    }

    println!("\n{}", "Scheduler".bold());
    match app_status {
        None => println!("  never ran"),
        Some(status) => {
            println!(
                "  last cycle started {}  finished {}",
                status.last_cycle_started_at_ms.map(fmt_ts).unwrap_or_else(|| "-".into()),
                status.last_cycle_finished_at_ms.map(fmt_ts).unwrap_or_else(|| "-".into())
            );
            println!(
                "  cycles {} (failed {})  signals {}  done {}  no data {}  pruned {}",
                status.counters.cycles,
                status.counters.failed_cycles,
                status.counters.signals_recorded,
                status.counters.evaluations_done,
                status.counters.evaluations_no_data,
                status.counters.rows_pruned
            );
            if let Some(error) = &status.last_error {
                println!(
                    "  last error at {}: {}",
                    status.last_error_at_ms.map(fmt_ts).unwrap_or_else(|| "-".into()),
                    error.red()
                );
            }
        }
    }
    Ok(())
}

fn print_record(r: &EvaluationRecord) {
    let status = match r.status {
        EvaluationStatus::Pending => r.status.as_str().yellow(),
        EvaluationStatus::Done => r.status.as_str().green(),
        EvaluationStatus::NoData => r.status.as_str().dimmed(),
    };
    println!(
        "#{:<6} {:<46} {:<8} {:<8} {:<10} entry {:<12} {}  mfe {}  mae {}  post-TP1 {}",
        r.signal_id,
        r.pair_address,
        r.base_symbol.as_deref().unwrap_or("-"),
        status,
        r.outcome.map(|o| o.as_str()).unwrap_or("-"),
        r.entry_price,
        fmt_ts(r.entry_ts),
        fmt_opt_pct(r.mfe_pct),
        fmt_opt_pct(r.mae_pct),
        fmt_opt_pct(r.post_tp1_max_pct)
    );
    if let Some(hits) = fmt_hits(r) {
        println!("        {}", hits);
    }
}

/// "TP1 1.4 @ <time>  SL 0.5 @ <time>" for whichever thresholds were hit
fn fmt_hits(r: &EvaluationRecord) -> Option<String> {
    let hit = |label: &str, ts: Option<i64>, price: Option<f64>| {
        ts.map(|ts| {
            let price = price.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
            format!("{} {} @ {}", label, price, fmt_ts(ts))
        })
    };
    let parts: Vec<String> = [
        hit("TP1", r.tp1_hit_ts, r.tp1_price),
        hit("SL", r.sl_hit_ts, r.sl_price),
    ]
    .into_iter()
    .flatten()
    .collect();
    (!parts.is_empty()).then(|| parts.join("  "))
}

pub fn cmd_list(db_path: &Path, filter: &EvaluationFilter, json: bool) -> DipwatchResult<()> {
    let db = Database::open(db_path)?;
    let records = list_evaluations(&db, filter)?;
    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No evaluations");
    }
    for record in &records {
        print_record(record);
    }
    Ok(())
}

pub fn cmd_show(db_path: &Path, token: &str) -> DipwatchResult<()> {
    let db = Database::open(db_path)?;
    let detail = token_detail(&db, token)?;

    if detail.pairs.is_empty() {
        println!("No pairs with base token {}", token);
        return Ok(());
    }

    for t in &detail.tokens {
        println!(
            "{} {} ({}) on {}",
            "Token".bold(),
            t.symbol,
            t.name.as_deref().unwrap_or("-"),
            t.chain_id
        );
    }
    println!("\n{}", "Pairs".bold());
    for p in &detail.pairs {
        println!(
            "  {} {} created {} {}",
            p.pair_address,
            p.dex_id,
            fmt_ts(p.created_at_ms),
            p.url.as_deref().unwrap_or("")
        );
    }
    println!("\n{}", "Evaluations".bold());
    if detail.evaluations.is_empty() {
        println!("  none");
    }
    for record in &detail.evaluations {
        print_record(record);
    }
    Ok(())
}

pub fn cmd_export(
    db_path: &Path,
    format: ExportFormat,
    out: Option<PathBuf>,
    status: Option<EvaluationStatus>,
) -> DipwatchResult<()> {
    let db = Database::open(db_path)?;
    let out = out.unwrap_or_else(|| export::default_export_path(format));
    let filter = EvaluationFilter {
        status,
        ..Default::default()
    };
    let count = export::export_to_file(&db, &filter, format, &out)?;
    println!("Exported {} records to {}", count, out.display());
    Ok(())
}

pub fn cmd_doctor(db_path: &Path, json: bool) -> DipwatchResult<()> {
    let db = Database::open_unverified(db_path)?;
    let report = db.run_doctor(now_ms())?;

    if json {
        print_json(&report)?;
    } else {
        println!("{}", "Schema".bold());
        if report.schema_problems.is_empty() {
            println!("  {}", "ok".green());
        }
        for problem in &report.schema_problems {
            println!("  {}", problem.red());
        }

        println!("\n{}", "Rows".bold());
        for (table, count) in &report.row_counts {
            println!("  {:<22} {}", table, count);
        }

        println!("\n{}", "Invariants".bold());
        println!("  signals without evaluation   {}", report.signals_without_evaluation);
        println!("  evaluations without signal   {}", report.evaluations_without_signal);
        println!("  status/outcome mismatches    {}", report.status_outcome_mismatches);
        println!("  bars of unknown pairs        {}", report.orphan_bars);
        println!("  overdue PENDING evaluations  {}", report.overdue_pending);
    }

    if report.is_healthy() {
        Ok(())
    } else {
        Err(DipwatchError::SchemaIntegrity(format!(
            "doctor found problems in {}",
            db_path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::get_evaluation;

    fn temp_db() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dipwatch.db");
        (dir, path)
    }

    #[test]
    fn test_commands_refuse_missing_database() {
        let (_dir, path) = temp_db();
        let config = Config::default();
        let err = cmd_evaluate(&path, &config, None).unwrap_err();
        assert!(matches!(err, DipwatchError::Config(_)));
        assert!(cmd_status(&path, &config, false).is_err());
        assert!(cmd_doctor(&path, false).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_init_signal_evaluate_flow() {
        let (_dir, path) = temp_db();
        let config = Config::default();
        cmd_init(&path).unwrap();

        let args = SignalArgs {
            pair: "PAIR".to_string(),
            price: 1.0,
            ts: Some(1_000),
            tp1: Some(10.0),
            sl: Some(5.0),
            lookahead_secs: Some(60),
            timeframe: None,
        };
        cmd_signal(&path, &config, &args).unwrap();
        // Second signal while the first is pending is rejected
        let err = cmd_signal(&path, &config, &args).unwrap_err();
        assert!(matches!(err, DipwatchError::DuplicateActiveSignal { .. }));

        // Window long elapsed with no bars -> NO_DATA
        cmd_evaluate(&path, &config, None).unwrap();
        let db = Database::open(&path).unwrap();
        let evaluation = get_evaluation(&db, 1).unwrap().unwrap();
        assert_eq!(evaluation.status, EvaluationStatus::NoData);

        cmd_doctor(&path, false).unwrap();
        cmd_prune(&path, &config, true, false).unwrap();
        cmd_list(&path, &EvaluationFilter::default(), true).unwrap();
        cmd_list(&path, &EvaluationFilter::default(), false).unwrap();
    }
}
