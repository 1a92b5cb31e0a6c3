//! File analysis tool: type-specific structural analysis of the one
//! externally-staged file. The original content is always embedded in the
//! result so the model can read it alongside the statistics.

use serde_json::{Map, Value};

use super::{StagedFile, ToolOutput, ToolRuntime};

const LONG_LINE_THRESHOLD: usize = 120;

const CODE_EXTENSIONS: &[&str] = &[
    "js", "jsx", "ts", "tsx", "py", "rs", "go", "java", "c", "cpp", "h", "hpp", "rb", "php",
    "sh", "swift", "kt",
];

pub fn run<'a>(runtime: &'a ToolRuntime, params: &'a Map<String, Value>) -> ToolOutput<'a> {
    Box::pin(async move {
        let instruction = params
            .get("instruction")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let Some(file) = runtime.staged_file.as_ref() else {
            return Err(
                "No file is currently staged for analysis. Ask the user to upload one first."
                    .to_string(),
            );
        };

        Ok(analyze(file, instruction))
    })
}

pub fn analyze(file: &StagedFile, instruction: &str) -> String {
    let summary = match file.extension.as_str() {
        "json" => analyze_json(&file.content),
        "csv" => analyze_csv(&file.content),
        "pdf" => analyze_text("PDF (extracted text)", &file.content),
        ext if CODE_EXTENSIONS.contains(&ext) => analyze_code(ext, &file.content),
        _ => analyze_text("text", &file.content),
    };

    let mut out = format!("File analysis: {}\n", file.name);
    if !instruction.trim().is_empty() {
        out.push_str(&format!("Instruction: {}\n", instruction.trim()));
    }
    out.push('\n');
    out.push_str(&summary);
    out.push_str("\n\n--- File content ---\n");
    out.push_str(&file.content);
    out
}

fn analyze_json(content: &str) -> String {
    match serde_json::from_str::<Value>(content) {
        Ok(value) => {
            let mut out = String::from("Type: JSON (valid)\n");
            match &value {
                Value::Object(map) => {
                    out.push_str(&format!("Root: object with {} keys\n", map.len()));
                    let keys: Vec<&str> = map.keys().map(String::as_str).take(20).collect();
                    out.push_str(&format!("Top-level keys: {}\n", keys.join(", ")));
                }
                Value::Array(items) => {
                    out.push_str(&format!("Root: array with {} elements\n", items.len()));
                }
                other => {
                    out.push_str(&format!("Root: scalar ({})\n", type_name(other)));
                }
            }
            out.push_str(&format!("Max nesting depth: {}", depth(&value)));
            out
        }
        Err(e) => format!("Type: JSON (INVALID)\nParse error: {}", e),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
        _ => 1,
    }
}

fn analyze_csv(content: &str) -> String {
    let mut lines = content.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return "Type: CSV\nEmpty file".to_string();
    };

    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let rows: Vec<Vec<&str>> = lines
        .map(|l| l.split(',').map(str::trim).collect())
        .collect();

    let mut out = format!(
        "Type: CSV\nRows: {} (plus header)\nColumns: {}\n",
        rows.len(),
        columns.len()
    );

    for (i, name) in columns.iter().enumerate() {
        let values: Vec<&str> = rows
            .iter()
            .filter_map(|r| r.get(i).copied())
            .filter(|v| !v.is_empty())
            .collect();
        let numbers: Vec<f64> = values.iter().filter_map(|v| v.parse().ok()).collect();

        if !values.is_empty() && numbers.len() == values.len() {
            let min = numbers.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
            out.push_str(&format!(
                "- {}: numeric ({} values, min {}, max {}, mean {:.2})\n",
                name,
                numbers.len(),
                min,
                max,
                mean
            ));
        } else {
            out.push_str(&format!("- {}: text ({} values)\n", name, values.len()));
        }
    }
    out.trim_end().to_string()
}

fn analyze_code(ext: &str, content: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let words = content.split_whitespace().count();

    let mut observations = Vec::new();

    let debug_prints = lines
        .iter()
        .filter(|l| {
            l.contains("console.log") || l.contains("print(") || l.contains("println!")
        })
        .count();
    if debug_prints > 0 {
        observations.push(format!("{} line(s) with debug print statements", debug_prints));
    }

    if matches!(ext, "js" | "jsx" | "ts" | "tsx" | "php") {
        let loose = lines
            .iter()
            .filter(|l| (l.contains("==") && !l.contains("===")) || (l.contains("!=") && !l.contains("!==")))
            .count();
        if loose > 0 {
            observations.push(format!("{} line(s) using loose equality (== / !=)", loose));
        }
    }

    let long_lines = lines.iter().filter(|l| l.len() > LONG_LINE_THRESHOLD).count();
    if long_lines > 0 {
        observations.push(format!(
            "{} line(s) longer than {} characters",
            long_lines, LONG_LINE_THRESHOLD
        ));
    }

    let todos = lines
        .iter()
        .filter(|l| l.contains("TODO") || l.contains("FIXME"))
        .count();
    if todos > 0 {
        observations.push(format!("{} TODO/FIXME marker(s)", todos));
    }

    let mut out = format!(
        "Type: code ({})\nLines: {}\nWords: {}\n",
        ext,
        lines.len(),
        words
    );
    if observations.is_empty() {
        out.push_str("Observations: none");
    } else {
        out.push_str("Observations:\n");
        for obs in observations {
            out.push_str(&format!("- {}\n", obs));
        }
    }
    out.trim_end().to_string()
}

fn analyze_text(kind: &str, content: &str) -> String {
    format!(
        "Type: {}\nLines: {}\nWords: {}\nCharacters: {}",
        kind,
        content.lines().count(),
        content.split_whitespace().count(),
        content.chars().count()
    )
}
