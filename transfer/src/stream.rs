//! Streaming one measurement between backends: paged SELECTs on the source,
//! re-rendered as line protocol, delivered through the destination's
//! compressed write path.

use backend::{HttpClient, Series, WriteOutcome};
use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::debug;

use crate::TransferError;

/// Copy one measurement's rows from `src` to `dst` in `batch`-sized pages.
///
/// `min_ts` restricts the copy to rows at or after the given nanosecond
/// timestamp. `moved` accumulates rows across the whole operator; once it
/// crosses a non-zero `limit` the copy stops early and reports itself
/// incomplete so the caller knows not to delete the source.
pub(crate) async fn copy_series(
    src: &HttpClient,
    dst: &HttpClient,
    db: &str,
    meas: &str,
    batch: usize,
    min_ts: Option<i64>,
    moved: &AtomicU64,
    limit: u64,
) -> Result<(u64, bool), TransferError> {
    let tag_keys: HashSet<String> = src.show_tag_keys(db, meas).await?.into_iter().collect();
    let field_types: HashMap<String, String> =
        src.show_field_keys(db, meas).await?.into_iter().collect();

    let where_clause = match min_ts {
        Some(ts) => format!(" where time >= {ts}"),
        None => String::new(),
    };

    let mut offset = 0usize;
    let mut rows = 0u64;
    loop {
        if limit > 0 && moved.load(Ordering::Relaxed) >= limit {
            debug!(%db, %meas, rows, "row limit reached, leaving copy incomplete");
            return Ok((rows, false));
        }

        let q = format!("select * from \"{meas}\"{where_clause} limit {batch} offset {offset}");
        let Some(series) = src.fetch_series(db, &q).await? else {
            break;
        };
        let page = series.values.len();
        if page == 0 {
            break;
        }

        let lines = render_lines(meas, &series, &tag_keys, &field_types);
        if !lines.is_empty() {
            let compressed = backend::compress(&lines)?;
            match dst.write_compressed(db, "", compressed).await {
                WriteOutcome::Accepted => {}
                outcome => return Err(TransferError::WriteRejected(outcome)),
            }
        }

        moved.fetch_add(page as u64, Ordering::Relaxed);
        rows += page as u64;
        offset += page;
        if page < batch {
            break;
        }
    }
    Ok((rows, true))
}

/// Re-render a JSON result series as line protocol. Columns named in
/// `tag_keys` become tags, the rest become fields formatted per
/// `field_types`; rows without any renderable field are skipped.
pub(crate) fn render_lines(
    meas: &str,
    series: &Series,
    tag_keys: &HashSet<String>,
    field_types: &HashMap<String, String>,
) -> Vec<u8> {
    let time_idx = series.columns.iter().position(|c| c == "time");
    let mut out = Vec::new();

    for row in &series.values {
        let mut line = escape_measurement(meas);

        for (i, col) in series.columns.iter().enumerate() {
            if Some(i) == time_idx || !tag_keys.contains(col) {
                continue;
            }
            let Some(value) = row.get(i) else { continue };
            if value.is_null() {
                continue;
            }
            let text = match value.as_str() {
                Some(s) => s.to_string(),
                None => value.to_string(),
            };
            line.push(',');
            line.push_str(&escape_tag(col));
            line.push('=');
            line.push_str(&escape_tag(&text));
        }

        let mut first_field = true;
        for (i, col) in series.columns.iter().enumerate() {
            if Some(i) == time_idx || tag_keys.contains(col.as_str()) {
                continue;
            }
            let Some(value) = row.get(i) else { continue };
            if value.is_null() {
                continue;
            }
            let rendered = match field_types.get(col).map(String::as_str) {
                Some("integer") => match value.as_i64() {
                    Some(v) => format!("{v}i"),
                    None => format!("{}i", value.as_f64().unwrap_or_default() as i64),
                },
                Some("boolean") => value.as_bool().unwrap_or_default().to_string(),
                Some("string") => quote_string_field(value),
                // Floats and unknown types keep their JSON rendering.
                _ => match value.as_str() {
                    Some(_) => quote_string_field(value),
                    None => value.to_string(),
                },
            };
            line.push(if first_field { ' ' } else { ',' });
            first_field = false;
            line.push_str(&escape_tag(col));
            line.push('=');
            line.push_str(&rendered);
        }
        if first_field {
            // No fields survived; an empty field set is not a valid line.
            continue;
        }

        if let Some(ts) = time_idx.and_then(|i| row.get(i)).and_then(|v| v.as_i64()) {
            line.push(' ');
            line.push_str(&ts.to_string());
        }
        line.push('\n');
        out.extend_from_slice(line.as_bytes());
    }
    out
}

fn escape_measurement(meas: &str) -> String {
    meas.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_tag(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn quote_string_field(value: &serde_json::Value) -> String {
    let s = value.as_str().unwrap_or_default();
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn series(columns: &[&str], values: Vec<Vec<serde_json::Value>>) -> Series {
        Series {
            name: "cpu".to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            values,
        }
    }

    fn keys(keys: &[&str]) -> HashSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn types(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_tags_and_typed_fields() {
        let s = series(
            &["time", "host", "usage", "count", "up", "note"],
            vec![vec![
                json!(1_000_000_000i64),
                json!("h1"),
                json!(0.64),
                json!(42),
                json!(true),
                json!("ok"),
            ]],
        );
        let out = render_lines(
            "cpu",
            &s,
            &keys(&["host"]),
            &types(&[
                ("usage", "float"),
                ("count", "integer"),
                ("up", "boolean"),
                ("note", "string"),
            ]),
        );
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "cpu,host=h1 usage=0.64,count=42i,up=true,note=\"ok\" 1000000000\n"
        );
    }

    #[test]
    fn skips_null_values_and_fieldless_rows() {
        let s = series(
            &["time", "host", "usage"],
            vec![
                vec![json!(1i64), json!("h1"), json!(serde_json::Value::Null)],
                vec![json!(2i64), json!("h2"), json!(1.5)],
            ],
        );
        let out = render_lines("cpu", &s, &keys(&["host"]), &types(&[("usage", "float")]));
        assert_eq!(String::from_utf8(out).unwrap(), "cpu,host=h2 usage=1.5 2\n");
    }

    #[test]
    fn escapes_special_characters() {
        let s = series(
            &["time", "data center", "v"],
            vec![vec![json!(5i64), json!("us west,1"), json!(1.0)]],
        );
        let out = render_lines(
            "my meas",
            &s,
            &keys(&["data center"]),
            &types(&[("v", "float")]),
        );
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "my\\ meas,data\\ center=us\\ west\\,1 v=1.0 5\n"
        );
    }

    #[test]
    fn string_fields_are_quoted_and_escaped() {
        let s = series(
            &["time", "msg"],
            vec![vec![json!(7i64), json!(r#"say "hi" \now"#)]],
        );
        let out = render_lines("log", &s, &keys(&[]), &types(&[("msg", "string")]));
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "log msg=\"say \\\"hi\\\" \\\\now\" 7\n"
        );
    }
}
