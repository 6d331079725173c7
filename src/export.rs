/// Evaluation record export (JSON or CSV)
///
/// Records come from `triggers::list_evaluations`, so the same filters apply
/// as for `dipwatch list`. CSV cells for missing values are left empty.
use crate::errors::DipwatchResult;
use crate::logger::{self, LogTag};
use crate::storage::types::EvaluationRecord;
use crate::storage::Database;
use crate::triggers::{list_evaluations, EvaluationFilter};
use csv::WriterBuilder;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

const CSV_HEADERS: &[&str] = &[
    "signal_id",
    "pair_address",
    "base_symbol",
    "entry_ts",
    "entry_price",
    "tp1_pct",
    "sl_pct",
    "lookahead_ms",
    "timeframe",
    "drop_from_ath",
    "status",
    "outcome",
    "evaluated_at",
    "tp1_hit_ts",
    "sl_hit_ts",
    "tp1_price",
    "sl_price",
    "mfe_pct",
    "mae_pct",
    "post_tp1_max_pct",
    "max_price",
    "min_price",
    "bars_scanned",
    "breakeven_after_tp1",
    "no_data_reason",
];

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

fn csv_row(r: &EvaluationRecord) -> Vec<String> {
    vec![
        r.signal_id.to_string(),
        r.pair_address.clone(),
        opt(&r.base_symbol),
        r.entry_ts.to_string(),
        r.entry_price.to_string(),
        r.tp1_pct.to_string(),
        r.sl_pct.to_string(),
        r.lookahead_ms.to_string(),
        r.timeframe.as_str().to_string(),
        opt(&r.drop_from_ath),
        r.status.as_str().to_string(),
        r.outcome.map(|o| o.as_str().to_string()).unwrap_or_default(),
        opt(&r.evaluated_at),
        opt(&r.tp1_hit_ts),
        opt(&r.sl_hit_ts),
        opt(&r.tp1_price),
        opt(&r.sl_price),
        opt(&r.mfe_pct),
        opt(&r.mae_pct),
        opt(&r.post_tp1_max_pct),
        opt(&r.max_price),
        opt(&r.min_price),
        r.bars_scanned.to_string(),
        opt(&r.breakeven_after_tp1),
        opt(&r.no_data_reason),
    ]
}

/// Write `records` to `writer` in the given format
pub fn write_records<W: Write>(
    records: &[EvaluationRecord],
    format: ExportFormat,
    mut writer: W,
) -> DipwatchResult<()> {
    match format {
        ExportFormat::Json => {
            serde_json::to_writer_pretty(&mut writer, records)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        ExportFormat::Csv => {
            let mut w = WriterBuilder::new().has_headers(false).from_writer(writer);
            w.write_record(CSV_HEADERS)?;
            for record in records {
                w.write_record(csv_row(record))?;
            }
            w.flush()?;
        }
    }
    Ok(())
}

/// `<exports dir>/evaluations_<YYYYmmdd_HHMMSS>.<ext>`
pub fn default_export_path(format: ExportFormat) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    crate::paths::get_exports_directory().join(format!(
        "evaluations_{}.{}",
        stamp,
        format.extension()
    ))
}

/// Export filtered evaluation records to `out`. Returns the record count.
pub fn export_to_file(
    db: &Database,
    filter: &EvaluationFilter,
    format: ExportFormat,
    out: &Path,
) -> DipwatchResult<usize> {
    let records = list_evaluations(db, filter)?;
    crate::paths::ensure_parent_dir(out)?;
    let file = File::create(out)?;
    write_records(&records, format, BufWriter::new(file))?;

    logger::info(
        LogTag::Export,
        &format!(
            "Exported {} evaluation records to {}",
            records.len(),
            out.display()
        ),
    );
    Ok(records.len())
}
