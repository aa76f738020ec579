//! Reader and writer for TFS tables (`@` headers, `*` column names, `$` column types, rows).

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TfsError {
    #[error("column `{name}` has {found} rows, expected {expected}")]
    Length {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("duplicate column `{0}`")]
    DuplicateColumn(String),
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Float(f64),
    Int(i64),
    Str(String),
}

impl HeaderValue {
    fn type_tag(&self) -> &'static str {
        match self {
            HeaderValue::Float(_) => "%le",
            HeaderValue::Int(_) => "%d",
            HeaderValue::Str(_) => "%s",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HeaderValue::Float(v) => Some(*v),
            HeaderValue::Int(v) => Some(*v as f64),
            HeaderValue::Str(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Str(Vec<String>),
    Float(Vec<f64>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Str(v) => v.len(),
            Column::Float(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn type_tag(&self) -> &'static str {
        match self {
            Column::Str(_) => "%s",
            Column::Float(_) => "%le",
        }
    }

    fn cell(&self, row: usize) -> String {
        match self {
            Column::Str(v) => format!("\"{}\"", v[row]),
            Column::Float(v) => format_float(v[row]),
        }
    }

    fn select(&self, rows: &[usize]) -> Column {
        match self {
            Column::Str(v) => Column::Str(rows.iter().map(|&i| v[i].clone()).collect()),
            Column::Float(v) => Column::Float(rows.iter().map(|&i| v[i]).collect()),
        }
    }
}

fn format_float(v: f64) -> String {
    // shortest representation that parses back to the same value
    format!("{v:e}")
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TfsTable {
    headers: Vec<(String, HeaderValue)>,
    columns: Vec<(String, Column)>,
}

impl TfsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a header, replacing an existing one of the same name.
    pub fn set_header(&mut self, name: &str, value: HeaderValue) {
        match self.headers.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn headers(&self) -> &[(String, HeaderValue)] {
        &self.headers
    }

    pub fn push_column(&mut self, name: &str, column: Column) -> Result<(), TfsError> {
        if self.column(name).is_some() {
            return Err(TfsError::DuplicateColumn(name.to_string()));
        }
        if let Some((_, first)) = self.columns.first() {
            if first.len() != column.len() {
                return Err(TfsError::Length {
                    name: name.to_string(),
                    expected: first.len(),
                    found: column.len(),
                });
            }
        }
        self.columns.push((name.to_string(), column));
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn n_rows(&self) -> usize {
        self.columns.first().map_or(0, |(_, c)| c.len())
    }

    /// Rows whose value in the string column `key` satisfies `keep`. Headers are kept.
    pub fn filter_rows(&self, key: &str, keep: impl Fn(&str) -> bool) -> Option<TfsTable> {
        let Column::Str(keys) = self.column(key)? else {
            return None;
        };
        let rows: Vec<usize> = keys
            .iter()
            .enumerate()
            .filter(|(_, k)| keep(k))
            .map(|(i, _)| i)
            .collect();
        Some(TfsTable {
            headers: self.headers.clone(),
            columns: self
                .columns
                .iter()
                .map(|(n, c)| (n.clone(), c.select(&rows)))
                .collect(),
        })
    }

    /// Removes float columns that are zero in every row.
    pub fn drop_all_zero_columns(&mut self) -> Vec<String> {
        let mut dropped = Vec::new();
        self.columns.retain(|(name, column)| {
            let zero = matches!(column, Column::Float(v) if v.iter().all(|x| *x == 0.0));
            if zero {
                dropped.push(name.clone());
            }
            !zero
        });
        dropped
    }

    pub fn to_tfs_string(&self) -> String {
        let mut out = String::new();
        let name_width = self.headers.iter().map(|(n, _)| n.len()).max().unwrap_or(0);
        for (name, value) in &self.headers {
            let text = match value {
                HeaderValue::Float(v) => format_float(*v),
                HeaderValue::Int(v) => v.to_string(),
                HeaderValue::Str(s) => format!("\"{s}\""),
            };
            let _ = writeln!(out, "@ {name:<name_width$} {:<4} {text}", value.type_tag());
        }

        let n_rows = self.n_rows();
        let cells: Vec<Vec<String>> = self
            .columns
            .iter()
            .map(|(_, c)| (0..n_rows).map(|r| c.cell(r)).collect())
            .collect();
        let widths: Vec<usize> = self
            .columns
            .iter()
            .zip(&cells)
            .map(|((name, _), col)| col.iter().map(String::len).chain([name.len(), 4]).max().unwrap_or(4))
            .collect();

        out.push('*');
        for ((name, _), w) in self.columns.iter().zip(&widths) {
            let _ = write!(out, " {name:>w$}");
        }
        out.push('\n');
        out.push('$');
        for ((_, column), w) in self.columns.iter().zip(&widths) {
            let _ = write!(out, " {:>w$}", column.type_tag());
        }
        out.push('\n');
        for row in 0..n_rows {
            out.push(' ');
            for (col, w) in cells.iter().zip(&widths) {
                let _ = write!(out, " {:>w$}", col[row]);
            }
            out.push('\n');
        }
        out
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_tfs_string())
    }

    pub fn parse(text: &str) -> Result<Self, TfsError> {
        let mut table = TfsTable::new();
        let mut names: Option<Vec<String>> = None;
        let mut types: Option<Vec<String>> = None;
        let mut rows: Vec<Vec<String>> = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let parse_err = |message: String| TfsError::Parse {
                line: line_no,
                message,
            };
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('@') {
                let tokens = tokenize(rest).map_err(parse_err)?;
                let [name, tag, value] = tokens.as_slice() else {
                    return Err(parse_err(format!("malformed header `{line}`")));
                };
                let value = match tag.as_str() {
                    "%le" | "%lf" => HeaderValue::Float(
                        value
                            .parse()
                            .map_err(|_| parse_err(format!("invalid float `{value}`")))?,
                    ),
                    "%d" => HeaderValue::Int(
                        value
                            .parse()
                            .map_err(|_| parse_err(format!("invalid integer `{value}`")))?,
                    ),
                    _ => HeaderValue::Str(value.clone()),
                };
                table.set_header(name, value);
            } else if let Some(rest) = line.strip_prefix('*') {
                names = Some(tokenize(rest).map_err(parse_err)?);
            } else if let Some(rest) = line.strip_prefix('$') {
                types = Some(tokenize(rest).map_err(parse_err)?);
            } else {
                let cells = tokenize(line).map_err(parse_err)?;
                let expected = names.as_ref().map_or(0, Vec::len);
                if names.is_none() || types.is_none() {
                    return Err(parse_err("row before column definitions".to_string()));
                }
                if cells.len() != expected {
                    return Err(parse_err(format!("expected {expected} cells, found {}", cells.len())));
                }
                rows.push(cells);
            }
        }

        let (Some(names), Some(types)) = (names, types) else {
            return Ok(table);
        };
        if names.len() != types.len() {
            return Err(TfsError::Parse {
                line: 0,
                message: "column names and types differ in length".to_string(),
            });
        }
        for (c, (name, tag)) in names.iter().zip(&types).enumerate() {
            let column = match tag.as_str() {
                "%le" | "%lf" | "%d" => Column::Float(
                    rows.iter()
                        .map(|r| {
                            r[c].parse().map_err(|_| TfsError::Parse {
                                line: 0,
                                message: format!("invalid number `{}` in column {name}", r[c]),
                            })
                        })
                        .collect::<Result<_, _>>()?,
                ),
                _ => Column::Str(rows.iter().map(|r| r[c].clone()).collect()),
            };
            table.push_column(name, column)?;
        }
        Ok(table)
    }

    pub fn read(path: &Path) -> Result<Self, crate::PrepError> {
        Ok(Self::parse(&fs::read_to_string(path)?)?)
    }
}

/// Whitespace-separated tokens; double quotes group and are removed.
fn tokenize(text: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut token = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some(ch) => token.push(ch),
                    None => return Err("unterminated string".to_string()),
                }
            }
            tokens.push(token);
        } else {
            let mut token = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                token.push(ch);
                chars.next();
            }
            tokens.push(token);
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TfsTable {
        let mut t = TfsTable::new();
        t.set_header("Q1", HeaderValue::Float(62.28));
        t.set_header("TITLE", HeaderValue::Str("lhc b1".into()));
        t.set_header("NTURNS", HeaderValue::Int(10));
        t.push_column("NAME", Column::Str(vec!["BPM.1".into(), "MQ.1".into(), "IP1".into()]))
            .unwrap();
        t.push_column("S", Column::Float(vec![0.0, 1.5, 26658.8832]))
            .unwrap();
        t.push_column("K2L", Column::Float(vec![0.0, 0.0, 0.0])).unwrap();
        t
    }

    #[test]
    fn text_layout() {
        let text = table().to_tfs_string();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("@ Q1"));
        assert!(lines[0].contains("%le"));
        assert!(lines[1].ends_with("\"lhc b1\""));
        assert!(lines[3].starts_with('*'));
        assert!(lines[4].starts_with('$'));
        assert_eq!(lines.len(), 3 + 2 + 3);
    }

    #[test]
    fn parse_reads_what_write_produces() {
        let t = table();
        let back = TfsTable::parse(&t.to_tfs_string()).unwrap();
        assert_eq!(back, t);
        assert_eq!(back.header("Q1").and_then(HeaderValue::as_f64), Some(62.28));
    }

    #[test]
    fn filtering_and_zero_columns() {
        let mut t = table();
        let bpms = t.filter_rows("NAME", |n| n.starts_with("BPM")).unwrap();
        assert_eq!(bpms.n_rows(), 1);
        assert_eq!(bpms.header("Q1"), t.header("Q1"));
        assert_eq!(t.drop_all_zero_columns(), vec!["K2L".to_string()]);
        assert_eq!(t.column_names().collect::<Vec<_>>(), ["NAME", "S"]);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut t = table();
        assert!(matches!(
            t.push_column("X", Column::Float(vec![1.0])),
            Err(TfsError::Length { expected: 3, found: 1, .. })
        ));
    }

    #[test]
    fn malformed_rows_report_line() {
        let text = "* NAME S\n$ %s %le\n \"A\" 1.0 2.0\n";
        match TfsTable::parse(text) {
            Err(TfsError::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected {other:?}"),
        }
    }
}
