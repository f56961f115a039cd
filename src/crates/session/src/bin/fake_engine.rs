//! Interactive engine double used by the integration tests.
//!
//! Understands a small netlist subset (`parameters`, instances, analyses), the
//! `scl*` command family, and appends plots as JSON lines to the `-raw` file.
//!
//! Environment switches:
//! - `FAKE_ENGINE_SILENT=1`: never show a prompt.
//! - `FAKE_ENGINE_IGNORE_QUIT=1`: ignore `(sclQuit)`.
//! - `FAKE_ENGINE_CHATTY=1`: print a parser warning ahead of every attribute value.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use spectre_session::sexpr::{self, Expr};
use spectre_session::{PlotRecord, ResultTable, DEFAULT_ATTRIBUTE};

const ANALYSIS_TYPES: &[&str] = &["dc", "ac", "tran", "noise", "op", "xf", "sp"];

/// Attribute name to value.
type Attributes = BTreeMap<String, String>;
/// Parameter name to its attributes.
type Parameters = BTreeMap<String, Attributes>;

#[derive(Debug, Default)]
struct EngineArgs {
    netlist: Option<PathBuf>,
    raw: Option<PathBuf>,
    log: Option<PathBuf>,
    includes: Vec<PathBuf>,
}

impl EngineArgs {
    fn parse(mut args: impl Iterator<Item = String>) -> Self {
        let mut parsed = EngineArgs::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-raw" => parsed.raw = args.next().map(PathBuf::from),
                "=log" | "+log" => parsed.log = args.next().map(PathBuf::from),
                "-format" => {
                    args.next();
                }
                _ if arg.starts_with("-I") => parsed.includes.push(PathBuf::from(&arg[2..])),
                _ if arg.starts_with(['-', '+', '=']) => {}
                _ => {
                    if parsed.netlist.is_none() {
                        parsed.netlist = Some(PathBuf::from(arg));
                    }
                }
            }
        }
        parsed
    }
}

#[derive(Debug, Clone)]
enum Owner {
    Circuit,
    Analysis(String),
    Instance(String),
}

#[derive(Debug, Clone)]
enum Value {
    T,
    Nil,
    Scalar(String),
    Owner(Owner),
    Parameter(Owner, String),
    Listing(Expr),
    /// Diagnostic printed as-is, with neither `t` nor `nil` after it.
    Raw(String),
}

#[derive(Debug)]
struct Component {
    name: String,
    kind: String,
    parameters: Parameters,
}

#[derive(Default)]
struct Engine {
    parameters: Parameters,
    instances: Vec<Component>,
    analyses: Vec<Component>,
    nets: Vec<String>,
    raw: Option<PathBuf>,
    log: Option<File>,
    runs: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = EngineArgs::parse(std::env::args().skip(1));

    if flag("FAKE_ENGINE_SILENT") {
        println!("fake engine starting without prompt");
        loop {
            thread::sleep(Duration::from_secs(1));
        }
    }

    let netlist = args.netlist.clone().ok_or("no netlist given")?;
    let source = fs::read_to_string(&netlist)?;
    let mut engine = Engine::from_netlist(&source);
    engine.raw = args.raw.clone();
    if let Some(path) = &args.log {
        engine.log = Some(OpenOptions::new().create(true).append(true).open(path)?);
    }
    engine.log_line(&format!(
        "loaded {} with {} include dirs",
        netlist.display(),
        args.includes.len()
    ));

    print!("fake engine ready: {}", netlist.display());
    prompt()?;

    let ignore_quit = flag("FAKE_ENGINE_IGNORE_QUIT");
    let chatty = flag("FAKE_ENGINE_CHATTY");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            prompt()?;
            continue;
        }

        let exprs = match sexpr::parse(line) {
            Ok(exprs) => exprs,
            Err(err) => {
                print!("ERROR: {err}\nnil");
                prompt()?;
                continue;
            }
        };

        if exprs.iter().any(|expr| is_call(expr, "fakeCrash")) {
            std::process::exit(3);
        }
        if exprs.iter().any(|expr| is_call(expr, "sclQuit")) {
            if ignore_quit {
                engine.log_line("ignoring quit");
                continue;
            }
            engine.log_line("quit");
            return Ok(());
        }

        if chatty && exprs.iter().any(|expr| is_call(expr, "sclGetAttribute")) {
            println!("WARNING: expected `)` near \"W");
        }
        let mut reply = Value::Nil;
        for expr in &exprs {
            reply = engine.eval(expr);
        }
        print!("{}", render(&reply));
        prompt()?;
    }
    Ok(())
}

fn flag(name: &str) -> bool {
    std::env::var(name).map(|value| value == "1").unwrap_or(false)
}

fn prompt() -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(b"\n> ")?;
    stdout.flush()
}

fn is_call(expr: &Expr, name: &str) -> bool {
    matches!(expr.as_list(), Some([Expr::Atom(head), ..]) if head == name)
}

fn render(value: &Value) -> String {
    match value {
        Value::T => "t".to_string(),
        Value::Nil => "nil".to_string(),
        Value::Scalar(scalar) if scalar.parse::<f64>().is_ok() => scalar.clone(),
        Value::Scalar(scalar) => sexpr::quote(scalar),
        Value::Owner(_) | Value::Parameter(..) => "<object>".to_string(),
        Value::Listing(Expr::List(items)) if items.is_empty() => "nil".to_string(),
        Value::Listing(expr) => expr.to_string(),
        Value::Raw(message) => message.clone(),
    }
}

fn text(value: &str) -> Expr {
    Expr::Str(value.to_string())
}

fn assignments<'a>(words: impl Iterator<Item = &'a str>) -> Parameters {
    words
        .filter_map(|word| {
            let (name, value) = word.split_once('=')?;
            let attrs = Attributes::from([(DEFAULT_ATTRIBUTE.to_string(), value.to_string())]);
            Some((name.to_string(), attrs))
        })
        .collect()
}

fn value_of(attrs: &Attributes) -> &str {
    attrs.get(DEFAULT_ATTRIBUTE).map_or("", String::as_str)
}

fn listing(components: &[Component]) -> Expr {
    Expr::List(
        components
            .iter()
            .map(|component| Expr::List(vec![text(&component.name), text(&component.kind)]))
            .collect(),
    )
}

impl Engine {
    fn from_netlist(source: &str) -> Self {
        let mut engine = Engine::default();
        for line in source.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") || line.starts_with('*') {
                continue;
            }
            let mut words = line.split_whitespace();
            let Some(first) = words.next() else { continue };
            match first {
                "simulator" | "include" => {}
                "parameters" => engine.parameters.extend(assignments(words)),
                _ => engine.add_statement(first, line, words),
            }
        }
        engine
    }

    fn add_statement<'a>(
        &mut self,
        name: &str,
        line: &'a str,
        mut words: impl Iterator<Item = &'a str>,
    ) {
        if let (Some(open), Some(close)) = (line.find('('), line.find(')')) {
            for net in line[open + 1..close].split_whitespace() {
                if !self.nets.iter().any(|known| known == net) {
                    self.nets.push(net.to_string());
                }
            }
            let mut rest = line[close + 1..].split_whitespace();
            let master = rest.next().unwrap_or("unknown").to_string();
            self.instances.push(Component {
                name: name.to_string(),
                kind: master,
                parameters: assignments(rest),
            });
            return;
        }

        if let Some(kind) = words.next().filter(|kind| ANALYSIS_TYPES.contains(kind)) {
            self.analyses.push(Component {
                name: name.to_string(),
                kind: kind.to_string(),
                parameters: assignments(words),
            });
        }
    }

    fn log_line(&mut self, message: &str) {
        if let Some(log) = self.log.as_mut() {
            let _ = writeln!(log, "{message}");
            let _ = log.flush();
        }
    }

    fn analysis(&self, name: &str) -> Option<&Component> {
        self.analyses.iter().find(|analysis| analysis.name == name)
    }

    fn parameters(&self, owner: &Owner) -> Option<&Parameters> {
        let (components, name) = match owner {
            Owner::Circuit => return Some(&self.parameters),
            Owner::Analysis(name) => (&self.analyses, name),
            Owner::Instance(name) => (&self.instances, name),
        };
        components
            .iter()
            .find(|component| &component.name == name)
            .map(|component| &component.parameters)
    }

    fn parameters_mut(&mut self, owner: &Owner) -> Option<&mut Parameters> {
        let (components, name) = match owner {
            Owner::Circuit => return Some(&mut self.parameters),
            Owner::Analysis(name) => (&mut self.analyses, name),
            Owner::Instance(name) => (&mut self.instances, name),
        };
        components
            .iter_mut()
            .find(|component| &component.name == name)
            .map(|component| &mut component.parameters)
    }

    fn attributes(&self, owner: &Owner, parameter: &str) -> Option<&Attributes> {
        self.parameters(owner)?.get(parameter)
    }

    fn eval(&mut self, expr: &Expr) -> Value {
        let items = match expr {
            Expr::Atom(atom) if atom == "t" => return Value::T,
            Expr::Atom(atom) if atom == "nil" => return Value::Nil,
            Expr::Atom(scalar) | Expr::Str(scalar) => return Value::Scalar(scalar.clone()),
            Expr::List(items) => items,
        };
        let Some((Expr::Atom(head), rest)) = items.split_first() else {
            return Value::Nil;
        };
        let args: Vec<Value> = rest.iter().map(|arg| self.eval(arg)).collect();
        let scalar = |idx: usize| match args.get(idx) {
            Some(Value::Scalar(value)) => Some(value.clone()),
            _ => None,
        };

        match head.as_str() {
            "sclGetCircuit" => Value::Owner(Owner::Circuit),
            "sclGetAnalysis" => self.owner(scalar(0).map(Owner::Analysis)),
            "sclGetInstance" => self.owner(scalar(0).map(Owner::Instance)),
            "sclGetParameter" => match (args.first(), scalar(1)) {
                (Some(Value::Owner(owner)), Some(name))
                    if self.attributes(owner, &name).is_some() =>
                {
                    Value::Parameter(owner.clone(), name)
                }
                _ => Value::Nil,
            },
            "sclGetAttribute" => match (args.first(), scalar(1)) {
                (Some(Value::Parameter(owner, name)), Some(attr)) => self
                    .attributes(owner, name)
                    .and_then(|attrs| attrs.get(&attr))
                    .map(|value| Value::Scalar(value.clone()))
                    .unwrap_or(Value::Nil),
                _ => Value::Nil,
            },
            "sclSetAttribute" => match (args.first(), scalar(1), scalar(2)) {
                (Some(Value::Parameter(owner, name)), Some(attr), Some(value)) => {
                    match self.parameters_mut(owner).and_then(|set| set.get_mut(name)) {
                        Some(attrs) if attrs.contains_key(&attr) => {
                            attrs.insert(attr, value);
                            Value::T
                        }
                        Some(_) => Value::Raw(format!(
                            "ERROR (SCL-12): no such attribute {}",
                            sexpr::quote(&attr)
                        )),
                        None => Value::Nil,
                    }
                }
                _ => Value::Nil,
            },
            "sclListAttribute" => match args.first() {
                Some(Value::Parameter(owner, name)) => self
                    .attributes(owner, name)
                    .map(|attrs| {
                        Value::Listing(Expr::List(
                            attrs
                                .iter()
                                .map(|(attr, value)| Expr::List(vec![text(attr), text(value)]))
                                .collect(),
                        ))
                    })
                    .unwrap_or(Value::Nil),
                _ => Value::Nil,
            },
            "sclListParameter" => match args.first() {
                Some(Value::Owner(owner)) => self
                    .parameters(owner)
                    .map(|set| {
                        Value::Listing(Expr::List(
                            set.iter()
                                .map(|(name, attrs)| {
                                    Expr::List(vec![text(name), text(value_of(attrs))])
                                })
                                .collect(),
                        ))
                    })
                    .unwrap_or(Value::Nil),
                _ => Value::Nil,
            },
            "sclListAnalysis" => Value::Listing(listing(&self.analyses)),
            "sclListInstance" => Value::Listing(listing(&self.instances)),
            "sclListNet" => {
                Value::Listing(Expr::List(self.nets.iter().map(|net| text(net)).collect()))
            }
            "sclCreateAnalysis" => match (scalar(0), scalar(1)) {
                (Some(name), Some(kind)) if self.analysis(&name).is_none() => {
                    self.analyses.push(Component {
                        name,
                        kind,
                        parameters: Parameters::new(),
                    });
                    Value::T
                }
                _ => Value::Nil,
            },
            "sclRun" => {
                let names: Vec<String> = self.analyses.iter().map(|a| a.name.clone()).collect();
                self.run(&names)
            }
            "sclRunAnalysis" => match args.first() {
                Some(Value::Owner(Owner::Analysis(name))) => {
                    let names = vec![name.clone()];
                    self.run(&names)
                }
                _ => Value::Nil,
            },
            other => {
                println!("ERROR: unknown function {other}");
                Value::Nil
            }
        }
    }

    fn owner(&self, owner: Option<Owner>) -> Value {
        match owner {
            Some(owner) if self.parameters(&owner).is_some() => Value::Owner(owner),
            _ => Value::Nil,
        }
    }

    fn run(&mut self, names: &[String]) -> Value {
        let Some(raw) = self.raw.clone() else {
            return Value::Nil;
        };
        self.runs += 1;
        let scale = self
            .parameters
            .values()
            .filter_map(|attrs| value_of(attrs).parse::<f64>().ok())
            .sum::<f64>()
            + self.runs as f64;

        let Ok(mut out) = OpenOptions::new().create(true).append(true).open(&raw) else {
            return Value::Nil;
        };
        for name in names {
            let Some(analysis) = self.analysis(name) else {
                continue;
            };
            let axis = match analysis.kind.as_str() {
                "tran" => "time",
                "ac" | "noise" | "sp" | "xf" => "freq",
                _ => "sweep",
            };
            let record = PlotRecord {
                plotname: name.clone(),
                table: ResultTable {
                    variables: vec![axis.to_string(), "out".to_string()],
                    values: (0..3)
                        .map(|step| vec![step as f64, scale * (step + 1) as f64])
                        .collect(),
                },
            };
            let Ok(line) = serde_json::to_string(&record) else {
                return Value::Nil;
            };
            if writeln!(out, "{line}").is_err() {
                return Value::Nil;
            }
        }
        self.log_line(&format!("run {} analyses", names.len()));
        Value::T
    }
}
