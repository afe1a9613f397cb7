use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use regsteer_proto::{Handle, LogKind, LogRecord, ParamEntry};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ParamRow {
    pub handle: i32,
    pub label: String,
    pub kind: &'static str,
    pub steerable: bool,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl ParamRow {
    pub fn new(handle: Handle, entry: &ParamEntry) -> Self {
        use regsteer_proto::Labeled;

        let bounds = entry.bounds();
        Self {
            handle: handle.get(),
            label: entry.label().to_string(),
            kind: entry.kind().as_str(),
            steerable: entry.steerable(),
            value: entry.value().to_string(),
            min: bounds.min,
            max: bounds.max,
        }
    }
}

#[derive(Serialize)]
struct ParamsOutput<'a> {
    sim: String,
    seq_num: i64,
    params: &'a [ParamRow],
}

pub fn print_params(sim: &str, seq_num: i64, rows: &[ParamRow], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&ParamsOutput {
            sim: sim.to_string(),
            seq_num,
            params: rows,
        }),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["HANDLE", "LABEL", "TYPE", "STEERABLE", "VALUE", "RANGE"]);
            for row in rows {
                table.add_row(vec![
                    row.handle.to_string(),
                    row.label.clone(),
                    row.kind.to_string(),
                    if row.steerable { "yes" } else { "no" }.to_string(),
                    row.value.clone(),
                    range_text(row.min, row.max),
                ]);
            }
            println!("{sim} at step {seq_num}");
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("{sim} at step {seq_num}");
            for row in rows {
                println!(
                    "  {:>5}  {:<20} {:<6} {}{}",
                    row.handle,
                    row.label,
                    row.kind,
                    row.value,
                    if row.steerable { "  (steerable)" } else { "" }
                );
            }
        }
    }
}

#[derive(Serialize)]
struct LogRow<'a> {
    key: u64,
    #[serde(flatten)]
    kind: &'a LogKind,
    params: usize,
}

pub fn print_log(records: &[&LogRecord], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let rows: Vec<_> = records
                .iter()
                .map(|r| LogRow {
                    key: r.key,
                    kind: &r.kind,
                    params: r.params.len(),
                })
                .collect();
            print_json(&rows);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KEY", "EVENT", "PARAMS"]);
            for record in records {
                table.add_row(vec![
                    record.key.to_string(),
                    describe(&record.kind),
                    record.params.len().to_string(),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for record in records {
                println!("  #{:<6} {}", record.key, describe(&record.kind));
            }
        }
    }
}

#[derive(Serialize)]
struct HistoryOutput<'a> {
    label: &'a str,
    values: &'a [String],
}

pub fn print_history(label: &str, values: &[String], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&HistoryOutput { label, values }),
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("{label}: {}", values.join(", "));
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn describe(kind: &LogKind) -> String {
    match kind {
        LogKind::Checkpoint { chk_handle, tag } => format!("checkpoint {chk_handle} '{tag}'"),
        LogKind::ParamSnapshot { seq_num } => format!("parameters at step {seq_num}"),
    }
}

fn range_text(min: Option<f64>, max: Option<f64>) -> String {
    match (min, max) {
        (None, None) => String::new(),
        (min, max) => format!(
            "[{}, {}]",
            min.map_or("-inf".to_string(), |v| v.to_string()),
            max.map_or("inf".to_string(), |v| v.to_string())
        ),
    }
}

#[cfg(test)]
mod tests {
    use regsteer_proto::{Bounds, ParamType};

    use super::*;

    #[test]
    fn param_row_from_entry() {
        let entry = ParamEntry::new("TEMP", true, ParamType::Float)
            .unwrap()
            .with_bounds(Bounds {
                min: Some(0.0),
                max: None,
            })
            .unwrap();
        let row = ParamRow::new(Handle::new(3), &entry);
        assert_eq!(row.handle, 3);
        assert_eq!(row.kind, "float");
        assert_eq!(range_text(row.min, row.max), "[0, inf]");
    }

    #[test]
    fn json_row_omits_missing_bounds() {
        let entry = ParamEntry::new("N", false, ParamType::Int).unwrap();
        let json = serde_json::to_string(&ParamRow::new(Handle::new(0), &entry)).unwrap();
        assert!(!json.contains("min"));
        assert!(json.contains(r#""steerable":false"#));
    }

    #[test]
    fn log_events_described() {
        assert_eq!(
            describe(&LogKind::Checkpoint {
                chk_handle: Handle::new(2000),
                tag: "run-1".into()
            }),
            "checkpoint 2000 'run-1'"
        );
        assert_eq!(
            describe(&LogKind::ParamSnapshot { seq_num: 9 }),
            "parameters at step 9"
        );
    }
}
