//! Trigger evaluation: the analyzer that resolves PENDING evaluations and the
//! read-side reports built on its results.

pub mod analyzer;
pub mod report;

pub use analyzer::{
    evaluate_signal, pending_page, run_analysis, scan_bars, AnalysisRunStats, AnalyzerSettings,
    EvaluationStep, TriggerMetrics, Verdict,
};
pub use report::{
    build_summary, get_evaluation, list_evaluations, token_detail, EvaluationFilter,
    TokenTriggerDetail, TriggerSummary,
};
