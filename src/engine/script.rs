//! Interpreter for a small MAD-X flavoured command language.
//!
//! Supported statements (terminated by `;`, comments start with `!` or `//`):
//! - `name = expr;` and `name := expr;` (optionally prefixed by `const`/`real`),
//! - element classes `name: class, attr = value, attr := expr;`,
//! - `name: sequence, l = expr, refer = centre|entry|exit;` ... `endsequence;`
//!   with placed elements `name: class, at = expr, ...;`,
//! - `call, file = "path";`, `seqedit, sequence = name;`, `flatten;`, `cycle, start = name;`,
//!   `endedit;`, `beam, sequence = name, ...;`, `print, text = "...";`,
//! - `use`, `option`, `title`, `set`, `select`, `value`, `show`, `return` are accepted and ignored.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{BeamParameters, Engine, EngineError, EngineSettings, Transcript};
use crate::expr::Expr;
use crate::knobs::{Knob, KnobGraph};
use crate::line::{Element, ElementKind, Line, Multipole, Param};

const MAX_CALL_DEPTH: usize = 32;
const DRIFT_TOLERANCE: f64 = 1e-9;
const OVERLAP_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BaseClass {
    Drift,
    Marker,
    Monitor,
    Instrument,
    Placeholder,
    Kicker,
    Collimator,
    Quadrupole,
    Sextupole,
    Sbend,
    Rbend,
    Multipole,
}

impl BaseClass {
    fn from_keyword(keyword: &str) -> Option<Self> {
        Some(match keyword {
            "drift" => BaseClass::Drift,
            "marker" => BaseClass::Marker,
            "monitor" | "hmonitor" | "vmonitor" => BaseClass::Monitor,
            "instrument" => BaseClass::Instrument,
            "placeholder" | "octupole" | "solenoid" | "rfcavity" => BaseClass::Placeholder,
            "kicker" | "hkicker" | "vkicker" | "tkicker" => BaseClass::Kicker,
            "collimator" | "rcollimator" | "ecollimator" => BaseClass::Collimator,
            "quadrupole" => BaseClass::Quadrupole,
            "sextupole" => BaseClass::Sextupole,
            "sbend" => BaseClass::Sbend,
            "rbend" => BaseClass::Rbend,
            "multipole" => BaseClass::Multipole,
            _ => return None,
        })
    }

    fn is_magnet(self) -> bool {
        matches!(
            self,
            BaseClass::Quadrupole
                | BaseClass::Sextupole
                | BaseClass::Sbend
                | BaseClass::Rbend
                | BaseClass::Multipole
        )
    }
}

#[derive(Debug, Clone)]
struct Attr {
    expr: Expr,
    deferred: bool,
    /// Value at definition time.
    value: f64,
}

#[derive(Debug, Clone)]
struct ElementDef {
    base: BaseClass,
    keyword: String,
    attrs: BTreeMap<String, Attr>,
}

impl ElementDef {
    fn value(&self, key: &str) -> f64 {
        self.attrs.get(key).map_or(0.0, |a| a.value)
    }

    /// Integrated strength `attr * factor`, deferred when the attribute is.
    fn param(&self, key: &str, factor: f64) -> Param {
        match self.attrs.get(key) {
            None => Param::literal(0.0),
            Some(attr) if attr.deferred => {
                Param::deferred(attr.expr.clone().scaled(factor), attr.value * factor)
            }
            Some(attr) => Param::literal(attr.value * factor),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refer {
    Centre,
    Entry,
    Exit,
}

#[derive(Debug, Clone)]
struct SeqEntry {
    name: String,
    def: ElementDef,
    /// Entry position.
    s: f64,
}

#[derive(Debug, Clone)]
struct Sequence {
    name: String,
    length: f64,
    refer: Refer,
    entries: Vec<SeqEntry>,
}

#[derive(Debug)]
struct Statement {
    text: String,
    line: usize,
}

#[derive(Debug)]
struct RawAttr {
    key: String,
    value: Option<String>,
    deferred: bool,
}

/// Splits source text into `;`-terminated statements, dropping comments.
fn split_statements(source: &str) -> Vec<Statement> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut start_line = 1;
    let mut line = 1;
    let mut quote: Option<char> = None;
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            current.push(c);
            if c == q {
                quote = None;
            }
            if c == '\n' {
                line += 1;
            }
            continue;
        }
        match c {
            '!' => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        line += 1;
                        current.push(' ');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'/') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        line += 1;
                        current.push(' ');
                        break;
                    }
                }
            }
            ';' => {
                let text = current.trim();
                if !text.is_empty() {
                    out.push(Statement {
                        text: text.to_string(),
                        line: start_line,
                    });
                }
                current.clear();
            }
            '"' | '\'' => {
                if current.trim().is_empty() {
                    start_line = line;
                }
                quote = Some(c);
                current.push(c);
            }
            '\n' => {
                line += 1;
                current.push(' ');
            }
            _ => {
                if current.trim().is_empty() && !c.is_whitespace() {
                    start_line = line;
                }
                current.push(c);
            }
        }
    }
    let text = current.trim();
    if !text.is_empty() {
        out.push(Statement {
            text: text.to_string(),
            line: start_line,
        });
    }
    out
}

/// Splits on `sep` outside parentheses, braces and quotes.
fn split_top(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '"' | '\'' => quote = Some(c),
                '(' | '{' => depth += 1,
                ')' | '}' => depth -= 1,
                c if c == sep && depth == 0 => {
                    parts.push(&text[start..i]);
                    start = i + c.len_utf8();
                }
                _ => {}
            },
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Position of a label colon (a `:` not followed by `=`) outside quotes.
fn label_colon(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate() {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b':' if bytes.get(i + 1) != Some(&b'=') => return Some(i),
                _ => {}
            },
        }
    }
    None
}

fn parse_attr(part: &str) -> RawAttr {
    let part = part.trim();
    if let Some(pos) = part.find(":=") {
        RawAttr {
            key: part[..pos].trim().to_ascii_lowercase(),
            value: Some(part[pos + 2..].trim().to_string()),
            deferred: true,
        }
    } else if let Some(pos) = part.find('=') {
        RawAttr {
            key: part[..pos].trim().to_ascii_lowercase(),
            value: Some(part[pos + 1..].trim().to_string()),
            deferred: false,
        }
    } else {
        RawAttr {
            key: part.to_ascii_lowercase(),
            value: None,
            deferred: false,
        }
    }
}

fn unquote(value: &str) -> &str {
    let v = value.trim();
    if v.len() >= 2
        && ((v.starts_with('"') && v.ends_with('"')) || (v.starts_with('\'') && v.ends_with('\'')))
    {
        &v[1..v.len() - 1]
    } else {
        v
    }
}

/// Knob name of an assignment target, dropping declaration prefixes.
fn assignment_target(lhs: &str) -> Option<String> {
    let name = lhs.split_whitespace().last()?.to_ascii_lowercase();
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$'));
    valid.then_some(name)
}

/// In-process engine interpreting the command language above.
pub struct ScriptEngine {
    workdir: PathBuf,
    knobs: KnobGraph,
    classes: HashMap<String, ElementDef>,
    sequences: BTreeMap<String, Sequence>,
    beams: BTreeMap<String, BeamParameters>,
    building: Option<Sequence>,
    edit: Option<String>,
    transcript: Transcript,
    depth: usize,
}

impl ScriptEngine {
    /// Engine working in `workdir`; transcripts are written there per `settings`.
    pub fn new(workdir: &Path, settings: &EngineSettings) -> Result<Self, EngineError> {
        let transcript = Transcript::open(workdir, settings)?;
        Ok(Self::with_transcript(workdir, transcript))
    }

    pub fn with_transcript(workdir: &Path, transcript: Transcript) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            knobs: KnobGraph::new(),
            classes: HashMap::new(),
            sequences: BTreeMap::new(),
            beams: BTreeMap::new(),
            building: None,
            edit: None,
            transcript,
            depth: 0,
        }
    }

    pub fn knobs(&self) -> &KnobGraph {
        &self.knobs
    }

    pub fn sequence_names(&self) -> impl Iterator<Item = &str> {
        self.sequences.keys().map(String::as_str)
    }

    pub fn beam_for(&self, sequence: &str) -> Option<&BeamParameters> {
        self.beams.get(sequence)
    }

    /// Executes source text as if it were a called file.
    pub fn input(&mut self, source: &str) -> Result<(), EngineError> {
        self.transcript.command(source.trim().trim_end_matches(';'))?;
        self.execute_source(source, "<input>")
    }

    fn execute_source(&mut self, source: &str, file: &str) -> Result<(), EngineError> {
        for statement in split_statements(source) {
            self.execute(&statement.text).map_err(|err| match err {
                EngineError::Rejected { command, message } => EngineError::Parse {
                    file: file.to_string(),
                    line: statement.line,
                    message: format!("`{command}`: {message}"),
                },
                other => other,
            })?;
        }
        Ok(())
    }

    fn call_file(&mut self, file: &Path) -> Result<(), EngineError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(EngineError::rejected("call", "call nesting too deep"));
        }
        let path = self.workdir.join(file);
        let source = fs::read_to_string(&path).map_err(|err| {
            EngineError::rejected("call", format!("cannot read {}: {err}", path.display()))
        })?;
        self.transcript
            .output(&format!("reading {}", file.display()))?;
        self.depth += 1;
        let result = self.execute_source(&source, &file.display().to_string());
        self.depth -= 1;
        result
    }

    fn execute(&mut self, text: &str) -> Result<(), EngineError> {
        let parts = split_top(text, ',');
        let head = parts[0].trim();

        if let Some(colon) = label_colon(head) {
            let label = head[..colon].trim().to_ascii_lowercase();
            let class = head[colon + 1..].trim().to_ascii_lowercase();
            let attrs: Vec<RawAttr> = parts[1..].iter().map(|p| parse_attr(p)).collect();
            return self.labeled(&label, &class, attrs);
        }

        if parts.len() == 1 {
            if let Some(pos) = head.find(":=") {
                return self.assign(&head[..pos], &head[pos + 2..], true);
            }
            if let Some(pos) = head.find('=') {
                return self.assign(&head[..pos], &head[pos + 1..], false);
            }
        }

        let command = head.to_ascii_lowercase();
        let attrs: Vec<RawAttr> = parts[1..].iter().map(|p| parse_attr(p)).collect();
        self.command(&command, &attrs)
    }

    fn assign(&mut self, lhs: &str, rhs: &str, deferred: bool) -> Result<(), EngineError> {
        let name = assignment_target(lhs)
            .ok_or_else(|| EngineError::rejected(lhs.trim(), "invalid assignment target"))?;
        let expr = Expr::parse(rhs.trim()).map_err(|err| EngineError::rejected(&name, err.to_string()))?;
        let knob = if deferred {
            Knob::Expr(expr)
        } else {
            Knob::Literal(self.eval_now(&name, &expr)?)
        };
        self.knobs
            .define(&name, knob)
            .map_err(|err| EngineError::rejected(&name, err.to_string()))
    }

    /// Immediate evaluation; undefined variables count as zero.
    fn eval_now(&mut self, context: &str, expr: &Expr) -> Result<f64, EngineError> {
        for var in expr.variables() {
            if !self.knobs.contains(&var) {
                self.transcript.output(&format!(
                    "warning: `{var}` is undefined in `{context}`, using 0"
                ))?;
            }
        }
        let knobs = &self.knobs;
        expr.eval(&|name: &str| Some(knobs.value(name).unwrap_or(0.0)))
            .map_err(|err| EngineError::rejected(context, err.to_string()))
    }

    fn attr_expr(&mut self, context: &str, raw: &RawAttr) -> Result<Option<Attr>, EngineError> {
        let Some(text) = raw.value.as_deref() else {
            return Ok(None);
        };
        let Ok(expr) = Expr::parse(text) else {
            debug!(target: "engine", context, key = %raw.key, "ignoring non-numeric attribute");
            return Ok(None);
        };
        if raw.deferred {
            for var in expr.variables() {
                if !self.knobs.contains(&var) {
                    self.knobs
                        .define(&var, Knob::Literal(0.0))
                        .map_err(|err| EngineError::rejected(context, err.to_string()))?;
                }
            }
        }
        let value = self.eval_now(context, &expr)?;
        Ok(Some(Attr {
            expr,
            deferred: raw.deferred,
            value,
        }))
    }

    fn class_def(&self, class: &str) -> Option<ElementDef> {
        if let Some(def) = self.classes.get(class) {
            return Some(def.clone());
        }
        BaseClass::from_keyword(class).map(|base| ElementDef {
            base,
            keyword: class.to_string(),
            attrs: BTreeMap::new(),
        })
    }

    fn labeled(&mut self, label: &str, class: &str, attrs: Vec<RawAttr>) -> Result<(), EngineError> {
        if class == "sequence" {
            return self.begin_sequence(label, &attrs);
        }
        let mut def = self
            .class_def(class)
            .ok_or_else(|| EngineError::rejected(label, format!("unknown element class `{class}`")))?;
        let mut at = None;
        for raw in &attrs {
            let Some(attr) = self.attr_expr(label, raw)? else {
                continue;
            };
            if raw.key == "at" {
                at = Some(attr.value);
            } else {
                def.attrs.insert(raw.key.clone(), attr);
            }
        }

        match (self.building.as_mut(), at) {
            (Some(sequence), Some(at)) => {
                if sequence.entries.iter().any(|e| e.name == label) {
                    return Err(EngineError::rejected(
                        label,
                        format!("element is placed twice in sequence `{}`", sequence.name),
                    ));
                }
                let length = def.value("l");
                let s = match sequence.refer {
                    Refer::Centre => at - length / 2.0,
                    Refer::Entry => at,
                    Refer::Exit => at - length,
                };
                sequence.entries.push(SeqEntry {
                    name: label.to_string(),
                    def,
                    s,
                });
                Ok(())
            }
            (Some(sequence), None) => Err(EngineError::rejected(
                label,
                format!("element in sequence `{}` needs an `at` position", sequence.name),
            )),
            (None, Some(_)) => Err(EngineError::rejected(label, "`at` given outside a sequence")),
            (None, None) => {
                self.classes.insert(label.to_string(), def);
                Ok(())
            }
        }
    }

    fn begin_sequence(&mut self, name: &str, attrs: &[RawAttr]) -> Result<(), EngineError> {
        if let Some(open) = &self.building {
            return Err(EngineError::rejected(
                name,
                format!("sequence `{}` is still open", open.name),
            ));
        }
        let mut length = None;
        let mut refer = Refer::Centre;
        for raw in attrs {
            match raw.key.as_str() {
                "l" => length = self.attr_expr(name, raw)?.map(|a| a.value),
                "refer" => {
                    refer = match raw.value.as_deref().map(|v| unquote(v).to_ascii_lowercase()) {
                        Some(v) if v == "centre" || v == "center" => Refer::Centre,
                        Some(v) if v == "entry" => Refer::Entry,
                        Some(v) if v == "exit" => Refer::Exit,
                        other => {
                            return Err(EngineError::rejected(
                                name,
                                format!("invalid refer value {other:?}"),
                            ))
                        }
                    }
                }
                _ => {}
            }
        }
        let length = length.ok_or_else(|| EngineError::rejected(name, "sequence needs a length `l`"))?;
        self.building = Some(Sequence {
            name: name.to_string(),
            length,
            refer,
            entries: Vec::new(),
        });
        Ok(())
    }

    fn end_sequence(&mut self) -> Result<(), EngineError> {
        let mut sequence = self
            .building
            .take()
            .ok_or_else(|| EngineError::rejected("endsequence", "no sequence is open"))?;
        sequence
            .entries
            .sort_by(|a, b| a.s.total_cmp(&b.s));
        self.transcript.output(&format!(
            "sequence {} defined: {} elements, length {} m",
            sequence.name,
            sequence.entries.len(),
            sequence.length
        ))?;
        self.sequences.insert(sequence.name.clone(), sequence);
        Ok(())
    }

    fn command(&mut self, command: &str, attrs: &[RawAttr]) -> Result<(), EngineError> {
        let attr = |key: &str| {
            attrs
                .iter()
                .find(|a| a.key == key)
                .and_then(|a| a.value.as_deref())
                .map(unquote)
        };
        match command {
            "endsequence" => self.end_sequence(),
            "call" => {
                let file = attr("file").ok_or_else(|| EngineError::rejected("call", "missing `file`"))?;
                let file = PathBuf::from(file);
                self.do_call(&file)
            }
            "seqedit" => {
                let sequence = attr("sequence")
                    .ok_or_else(|| EngineError::rejected("seqedit", "missing `sequence`"))?
                    .to_ascii_lowercase();
                self.do_seqedit(&sequence)
            }
            "flatten" => self.do_flatten(),
            "cycle" => {
                let start = attr("start")
                    .ok_or_else(|| EngineError::rejected("cycle", "missing `start`"))?
                    .to_ascii_lowercase();
                self.do_cycle(&start)
            }
            "endedit" => self.do_endedit(),
            "beam" => {
                let mut params = BeamParameters {
                    sequence: String::new(),
                    bv: 1,
                    energy: 0.0,
                    particle: "proton".to_string(),
                    npart: 0.0,
                    kbunch: 1,
                };
                for raw in attrs {
                    let Some(value) = raw.value.as_deref() else {
                        continue;
                    };
                    match raw.key.as_str() {
                        "sequence" => params.sequence = unquote(value).to_ascii_lowercase(),
                        "particle" => params.particle = unquote(value).to_ascii_lowercase(),
                        key @ ("bv" | "energy" | "npart" | "kbunch") => {
                            let expr = Expr::parse(value)
                                .map_err(|err| EngineError::rejected("beam", err.to_string()))?;
                            let v = self.eval_now("beam", &expr)?;
                            match key {
                                "bv" => params.bv = v as i8,
                                "energy" => params.energy = v,
                                "npart" => params.npart = v,
                                _ => params.kbunch = v as u32,
                            }
                        }
                        _ => {}
                    }
                }
                self.do_beam(&params)
            }
            "print" => {
                let text = attr("text").unwrap_or_default().to_string();
                self.transcript.output(&text)
            }
            "use" | "option" | "title" | "set" | "select" | "value" | "show" | "return" => {
                debug!(target: "engine", command, "ignored");
                Ok(())
            }
            other => Err(EngineError::rejected(other, "unknown command")),
        }
    }

    fn do_call(&mut self, file: &Path) -> Result<(), EngineError> {
        if let Some(edit) = &self.edit {
            return Err(EngineError::rejected(
                "call",
                format!("sequence edit of `{edit}` is still open"),
            ));
        }
        self.call_file(file)
    }

    fn do_seqedit(&mut self, sequence: &str) -> Result<(), EngineError> {
        if let Some(edit) = &self.edit {
            return Err(EngineError::rejected(
                "seqedit",
                format!("sequence edit of `{edit}` is already open"),
            ));
        }
        if !self.sequences.contains_key(sequence) {
            return Err(EngineError::rejected(
                "seqedit",
                format!("unknown sequence `{sequence}`"),
            ));
        }
        self.edit = Some(sequence.to_string());
        Ok(())
    }

    fn edited(&mut self, command: &str) -> Result<&mut Sequence, EngineError> {
        let name = self
            .edit
            .as_deref()
            .ok_or_else(|| EngineError::rejected(command, "no sequence edit is open"))?;
        self.sequences
            .get_mut(name)
            .ok_or_else(|| EngineError::rejected(command, format!("unknown sequence `{name}`")))
    }

    fn do_flatten(&mut self) -> Result<(), EngineError> {
        let sequence = self.edited("flatten")?;
        let message = format!("flattened {} ({} elements)", sequence.name, sequence.entries.len());
        self.transcript.output(&message)
    }

    fn do_cycle(&mut self, start: &str) -> Result<(), EngineError> {
        let sequence = self.edited("cycle")?;
        let idx = sequence
            .entries
            .iter()
            .position(|e| e.name == start)
            .ok_or_else(|| {
                EngineError::rejected(
                    "cycle",
                    format!("element `{start}` is not in sequence `{}`", sequence.name),
                )
            })?;
        let shift = sequence.entries[idx].s;
        let length = sequence.length;
        for (i, entry) in sequence.entries.iter_mut().enumerate() {
            entry.s = if i >= idx {
                entry.s - shift
            } else {
                entry.s - shift + length
            };
        }
        sequence.entries.rotate_left(idx);
        let message = format!("{} now starts at {start}", sequence.name);
        self.transcript.output(&message)
    }

    fn do_endedit(&mut self) -> Result<(), EngineError> {
        match self.edit.take() {
            Some(name) => self.transcript.output(&format!("sequence edit of {name} closed")),
            None => Err(EngineError::rejected("endedit", "no sequence edit is open")),
        }
    }

    fn do_beam(&mut self, params: &BeamParameters) -> Result<(), EngineError> {
        if let Some(edit) = &self.edit {
            return Err(EngineError::rejected(
                "beam",
                format!("sequence edit of `{edit}` is still open"),
            ));
        }
        if params.sequence.is_empty() {
            return Err(EngineError::rejected("beam", "missing `sequence`"));
        }
        if !(params.energy > 0.0) {
            return Err(EngineError::rejected("beam", "energy must be positive"));
        }
        if params.bv != 1 && params.bv != -1 {
            return Err(EngineError::rejected("beam", "bv must be 1 or -1"));
        }
        self.transcript.output(&format!(
            "beam declared for {} (bv = {}, energy = {} GeV)",
            params.sequence, params.bv, params.energy
        ))?;
        self.beams.insert(params.sequence.clone(), params.clone());
        Ok(())
    }

    fn build_element(&self, entry: &SeqEntry) -> Element {
        let def = &entry.def;
        let length = def.value("l");
        let kind = if def.base.is_magnet() {
            let m = match def.base {
                BaseClass::Quadrupole => Multipole {
                    k1l: def.param("k1", length),
                    k1sl: def.param("k1s", length),
                    ..Multipole::default()
                },
                BaseClass::Sextupole => Multipole {
                    k2l: def.param("k2", length),
                    ..Multipole::default()
                },
                BaseClass::Sbend | BaseClass::Rbend => Multipole {
                    k0l: def.param("angle", 1.0),
                    k1l: def.param("k1", length),
                    ..Multipole::default()
                },
                _ => Multipole {
                    k0l: def.param("k0l", 1.0),
                    k1l: def.param("k1l", 1.0),
                    k1sl: def.param("k1sl", 1.0),
                    k2l: def.param("k2l", 1.0),
                },
            };
            ElementKind::Magnet(m)
        } else if length > 0.0 {
            ElementKind::Drift
        } else {
            ElementKind::Marker
        };
        Element {
            name: entry.name.clone(),
            keyword: def.keyword.clone(),
            length,
            kind,
        }
    }
}

impl Engine for ScriptEngine {
    fn call(&mut self, file: &Path) -> Result<(), EngineError> {
        self.transcript
            .command(&format!("call, file=\"{}\"", file.display()))?;
        self.do_call(file)
    }

    fn seqedit(&mut self, sequence: &str) -> Result<(), EngineError> {
        let sequence = sequence.to_ascii_lowercase();
        self.transcript
            .command(&format!("seqedit, sequence={sequence}"))?;
        self.do_seqedit(&sequence)
    }

    fn flatten(&mut self) -> Result<(), EngineError> {
        self.transcript.command("flatten")?;
        self.do_flatten()
    }

    fn cycle(&mut self, start: &str) -> Result<(), EngineError> {
        let start = start.to_ascii_lowercase();
        self.transcript.command(&format!("cycle, start={start}"))?;
        self.do_cycle(&start)
    }

    fn endedit(&mut self) -> Result<(), EngineError> {
        self.transcript.command("endedit")?;
        self.do_endedit()
    }

    fn beam(&mut self, params: &BeamParameters) -> Result<(), EngineError> {
        self.transcript.command(&params.command())?;
        self.do_beam(params)
    }

    fn sequence_to_line(&mut self, sequence: &str) -> Result<Line, EngineError> {
        const COMMAND: &str = "sequence_to_line";
        let name = sequence.to_ascii_lowercase();
        if let Some(edit) = &self.edit {
            return Err(EngineError::rejected(
                COMMAND,
                format!("sequence edit of `{edit}` is still open"),
            ));
        }
        let seq = self
            .sequences
            .get(&name)
            .ok_or_else(|| EngineError::rejected(COMMAND, format!("unknown sequence `{name}`")))?;
        if !self.beams.contains_key(&name) {
            return Err(EngineError::rejected(
                COMMAND,
                format!("no beam declared for sequence `{name}`"),
            ));
        }

        let mut elements = Vec::with_capacity(2 * seq.entries.len() + 1);
        let mut cursor = 0.0;
        let mut drifts = 0usize;
        for entry in &seq.entries {
            let gap = entry.s - cursor;
            if gap < -OVERLAP_TOLERANCE {
                return Err(EngineError::rejected(
                    COMMAND,
                    format!("element `{}` overlaps its predecessor by {} m", entry.name, -gap),
                ));
            }
            if gap > DRIFT_TOLERANCE {
                elements.push(Element::drift(format!("drift_{drifts}"), gap));
                drifts += 1;
            }
            let element = self.build_element(entry);
            cursor = entry.s.max(cursor) + element.length;
            elements.push(element);
        }
        let tail = seq.length - cursor;
        if tail > DRIFT_TOLERANCE {
            elements.push(Element::drift(format!("drift_{drifts}"), tail));
        }

        let line = Line::new(name.clone(), elements, self.knobs.clone())
            .map_err(|err| EngineError::rejected(COMMAND, err.to_string()))?;
        self.transcript.output(&format!(
            "extracted {name}: {} elements, {} knobs",
            line.len(),
            line.knobs().len()
        ))?;
        Ok(line)
    }

    fn exit(&mut self) -> Result<(), EngineError> {
        self.transcript.command("exit")?;
        self.transcript.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optics::{twiss, TwissOptions};

    const RING: &str = r#"
        ! two-cell test ring
        kqf := kqf0 + dk;   // deferred
        kqf0 = 0.0125 * 2;
        mq: quadrupole, l = 2.0;
        mqf: mq, k1 := kqf / 2;
        mqd: mq, k1 := -kqf / 2;
        ring: sequence, l = 80.0, refer = centre;
          start.ring: marker, at = 0;
          qf.1: mqf, at = 1.0;
          bpm.1: monitor, at = 10.0;
          qd.1: mqd, at = 21.0;
          qf.2: mqf, at = 41.0;
          qd.2: mqd, at = 61.0;
        endsequence;
    "#;

    fn engine() -> ScriptEngine {
        let mut engine = ScriptEngine::with_transcript(Path::new("."), Transcript::disabled());
        engine.input(RING).unwrap();
        engine
    }

    fn beam(engine: &mut ScriptEngine) {
        engine
            .beam(&BeamParameters {
                sequence: "ring".into(),
                bv: 1,
                energy: 450.0,
                particle: "proton".into(),
                npart: 1e11,
                kbunch: 1,
            })
            .unwrap();
    }

    #[test]
    fn statements_skip_comments_and_track_lines() {
        let stmts = split_statements("a = 1; ! note; b = 2\nc := a;\n// x = 3;\nd = 'x;y';");
        let texts: Vec<_> = stmts.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["a = 1", "c := a", "d = 'x;y'"]);
        assert_eq!(stmts[1].line, 2);
    }

    #[test]
    fn extraction_keeps_deferred_strengths() {
        let mut engine = engine();
        beam(&mut engine);
        let line = engine.sequence_to_line("ring").unwrap();
        let names: Vec<_> = line.element_names().collect();
        assert_eq!(
            names,
            vec![
                "start.ring", "qf.1", "drift_0", "bpm.1", "drift_1", "qd.1", "drift_2", "qf.2",
                "drift_3", "qd.2", "drift_4"
            ]
        );
        assert!((line.length() - 80.0).abs() < 1e-12);
        let k1l = &line.element("qf.1").unwrap().multipole().unwrap().k1l;
        assert!((k1l.value - 0.025).abs() < 1e-15);
        assert!(k1l.expr.is_some());

        let mut edit = line.clone();
        let mut e = edit.edit_knobs(["dk"]).unwrap();
        e.set("dk", 0.001).unwrap();
        e.commit().unwrap();
        let k = edit.element("qd.2").unwrap().multipole().unwrap().k1l.value;
        assert!((k + 0.026).abs() < 1e-15);
        assert!(twiss(&line, &TwissOptions::default()).is_ok());
    }

    #[test]
    fn extraction_requires_beam() {
        let mut engine = engine();
        let err = engine.sequence_to_line("ring").unwrap_err();
        assert!(err.to_string().contains("no beam declared"));
    }

    #[test]
    fn cycle_rotates_positions() {
        let mut engine = engine();
        engine.seqedit("ring").unwrap();
        engine.flatten().unwrap();
        engine.cycle("QD.1").unwrap();
        engine.endedit().unwrap();
        beam(&mut engine);
        let line = engine.sequence_to_line("ring").unwrap();
        assert_eq!(line.elements()[0].name, "qd.1");
        let s = line.s_positions();
        let idx = line.element_names().position(|n| n == "start.ring").unwrap();
        assert!((s[idx] - 60.0).abs() < 1e-12);
        assert!((line.length() - 80.0).abs() < 1e-12);
    }

    #[test]
    fn beam_and_call_refused_inside_edit() {
        let mut engine = engine();
        engine.seqedit("ring").unwrap();
        let err = engine
            .beam(&BeamParameters {
                sequence: "ring".into(),
                bv: 1,
                energy: 450.0,
                particle: "proton".into(),
                npart: 1e11,
                kbunch: 1,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Rejected { .. }));
        assert!(engine.call(Path::new("missing.madx")).is_err());
        assert!(engine.sequence_to_line("ring").is_err());
        engine.endedit().unwrap();
    }

    #[test]
    fn unknown_cycle_start_is_rejected() {
        let mut engine = engine();
        engine.seqedit("ring").unwrap();
        let err = engine.cycle("nowhere").unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn parse_errors_carry_location() {
        let mut engine = ScriptEngine::with_transcript(Path::new("."), Transcript::disabled());
        let err = engine.input("a = 1;\nb: frobnicator, l = 1;").unwrap_err();
        match err {
            EngineError::Parse { line, message, .. } => {
                assert_eq!(line, 2);
                assert!(message.contains("frobnicator"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn call_reads_relative_to_workdir_and_writes_transcripts() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ring.madx"), RING).unwrap();
        let mut engine = ScriptEngine::new(dir.path(), &EngineSettings::default()).unwrap();
        engine.call(Path::new("ring.madx")).unwrap();
        engine.exit().unwrap();
        assert!(engine.sequence_names().any(|n| n == "ring"));
        let commands = fs::read_to_string(dir.path().join("madx_commands.madx")).unwrap();
        assert!(commands.starts_with("call, file=\"ring.madx\";"));
        let output = fs::read_to_string(dir.path().join("madx_output.log")).unwrap();
        assert!(output.contains("sequence ring defined"));
    }

    #[test]
    fn undefined_immediate_variables_are_zero() {
        let mut engine = ScriptEngine::with_transcript(Path::new("."), Transcript::disabled());
        engine.input("x = y + 2;").unwrap();
        assert_eq!(engine.knobs().value("x"), Some(2.0));
    }
}
