//! Stand-in for the external toolchain, used by the integration tests.
//!
//! `padserve-test-worker --persistent` speaks the framed worker protocol on
//! stdio. Any other first argument runs one command and exits:
//!
//! - `compile-whole --out <file> [--source-map] <source>`
//! - `resolve` (run inside a workspace root; appends a line to
//!   `resolve.runs` there on every run)
//! - `sleep <ms>`, `echo <args..>`, `fail <code> <message>`, `pwd`
//!
//! Snippets can steer the worker: `__crash_worker__` makes it exit in the
//! middle of a request, `__slow_worker__` delays the answer by two seconds,
//! `__slow_compile__` makes `compile-whole` take three seconds,
//! `compile_error` fails compiles and `@@` fails formatting.

use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        eprintln!("usage: padserve-test-worker <command> [args..]");
        return ExitCode::from(2);
    };

    match command.as_str() {
        "--persistent" => persistent(),
        "compile-whole" => compile_whole(rest),
        "resolve" => resolve(),
        "sleep" => {
            let ms = rest.first().and_then(|ms| ms.parse().ok()).unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            ExitCode::SUCCESS
        }
        "echo" => {
            println!("{}", rest.join(" "));
            ExitCode::SUCCESS
        }
        "fail" => {
            let code = rest.first().and_then(|c| c.parse().ok()).unwrap_or(1);
            eprintln!("{}", rest.get(1).map(String::as_str).unwrap_or("failed"));
            ExitCode::from(code)
        }
        "pwd" => {
            let cwd = std::env::current_dir().map(|p| p.display().to_string());
            println!("{}", cwd.unwrap_or_default());
            ExitCode::SUCCESS
        }
        other => {
            eprintln!("unknown command: {other}");
            ExitCode::from(2)
        }
    }
}

// ---- persistent worker ------------------------------------------------------

fn persistent() -> ExitCode {
    eprintln!("padserve-test-worker {} ready", std::process::id());

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    loop {
        let request = match read_frame(&mut reader) {
            Ok(Some(request)) => request,
            Ok(None) => return ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("bad frame: {e}");
                return ExitCode::from(4);
            }
        };

        let id = request["id"].as_u64().unwrap_or(0);
        let arguments: Vec<String> = request["arguments"]
            .as_array()
            .map(|args| {
                args.iter()
                    .filter_map(|a| a.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let (exit_code, output) = handle(&arguments);
        let response = json!({ "id": id, "exitCode": exit_code, "output": output });
        if write_frame(&mut writer, &response).is_err() {
            return ExitCode::from(5);
        }
    }
}

fn read_frame(reader: &mut impl BufRead) -> io::Result<Option<Value>> {
    let mut content_length = None;
    let mut started = false;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            if started {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "eof in header"));
            }
            return Ok(None);
        }
        started = true;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length:") {
            content_length = value.trim().parse::<usize>().ok();
        }
    }

    let len = content_length
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no Content-Length"))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_frame(writer: &mut impl Write, value: &Value) -> io::Result<()> {
    let body = value.to_string();
    write!(writer, "Content-Length: {}\r\n\r\n{}", body.len(), body)?;
    writer.flush()
}

struct ToolArgs {
    verb: String,
    offset: Option<usize>,
    out: Option<String>,
    source_path: String,
}

fn parse_tool_args(arguments: &[String]) -> Option<ToolArgs> {
    let (verb, rest) = arguments.split_first()?;
    let mut offset = None;
    let mut out = None;
    let mut positional = Vec::new();
    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--root" => {
                iter.next();
            }
            "--offset" => offset = iter.next().and_then(|o| o.parse().ok()),
            "--out" => out = iter.next().cloned(),
            _ => positional.push(arg.clone()),
        }
    }
    Some(ToolArgs {
        verb: verb.clone(),
        offset,
        out,
        source_path: positional.pop()?,
    })
}

fn handle(arguments: &[String]) -> (i32, String) {
    let Some(args) = parse_tool_args(arguments) else {
        return (2, "missing arguments".to_string());
    };
    let source = match std::fs::read_to_string(&args.source_path) {
        Ok(source) => source,
        Err(e) => return (2, format!("cannot read {}: {e}", args.source_path)),
    };

    if source.contains("__crash_worker__") {
        eprintln!("crashing on request");
        std::process::exit(3);
    }
    if source.contains("__slow_worker__") {
        std::thread::sleep(Duration::from_secs(2));
    }

    match args.verb.as_str() {
        "analyze" => (0, analyze(&source, &args.source_path).to_string()),
        "complete" => {
            let offset = args.offset.unwrap_or(0);
            let value = json!({
                "replacementOffset": offset,
                "replacementLength": 0,
                "completions": [
                    { "completion": "print", "kind": "FUNCTION", "relevance": 1000 },
                    { "completion": "parse", "kind": "FUNCTION", "relevance": 900 }
                ]
            });
            (0, value.to_string())
        }
        "fixes" => (0, json!({ "fixes": [] }).to_string()),
        "assists" => (0, json!({ "assists": [] }).to_string()),
        "document" => {
            let value = json!({ "info": { "description": "print(Object? object) -> void" } });
            (0, value.to_string())
        }
        "format" => {
            if source.contains("@@") {
                return (1, "Could not format because the source could not be parsed".to_string());
            }
            let formatted = format_source(&source);
            let offset = args.offset.map(|o| o.min(formatted.chars().count()));
            (0, json!({ "newString": formatted, "offset": offset }).to_string())
        }
        "compile-modular" => {
            if source.contains("compile_error") {
                return (1, "Error: compile_error is not defined".to_string());
            }
            let Some(out) = args.out else {
                return (2, "missing --out".to_string());
            };
            let compiled = format!("// modular\n{}", render_output(&source));
            if let Err(e) = std::fs::write(Path::new(&out).join("main.js"), compiled) {
                return (2, e.to_string());
            }
            (0, json!({ "modulesBaseUrl": "/modules/" }).to_string())
        }
        other => (2, format!("unknown verb {other}")),
    }
}

/// Flags statement lines ending in `)` that are followed by a closing brace.
fn analyze(source: &str, source_path: &str) -> Value {
    let mut issues = Vec::new();
    let lines: Vec<&str> = source.split('\n').collect();
    let mut offset = 0usize;
    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim_end();
        let next_closes = lines
            .get(index + 1)
            .is_some_and(|next| next.trim_start().starts_with('}'));
        if trimmed.ends_with(')') && next_closes {
            let char_start = offset + trimmed.chars().count() - 1;
            issues.push(json!({
                "kind": "error",
                "line": index + 1,
                "message": "Expected to find ';'.",
                "sourceName": source_path,
                "hasFixes": true,
                "charStart": char_start,
                "charLength": 1
            }));
        }
        offset += line.chars().count() + 1;
    }
    json!({ "issues": issues, "packageImports": [] })
}

fn format_source(source: &str) -> String {
    let mut formatted: String = source
        .lines()
        .map(|line| format!("{}\n", line.trim_end()))
        .collect();
    if formatted.is_empty() {
        formatted.push('\n');
    }
    formatted
}

fn render_output(source: &str) -> String {
    let mut out = String::from("(function () {\n");
    for line in source.lines() {
        out.push_str("  // ");
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("})();\n");
    out
}

// ---- one-shot commands --------------------------------------------------------

fn compile_whole(args: &[String]) -> ExitCode {
    let mut out = None;
    let mut source_map = false;
    let mut positional = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--out" => out = iter.next().cloned(),
            "--source-map" => source_map = true,
            _ => positional.push(arg.clone()),
        }
    }
    let (Some(out), Some(source_path)) = (out, positional.pop()) else {
        eprintln!("usage: compile-whole --out <file> [--source-map] <source>");
        return ExitCode::from(2);
    };

    let source = match std::fs::read_to_string(&source_path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("cannot read {source_path}: {e}");
            return ExitCode::from(2);
        }
    };
    if source.contains("__slow_compile__") {
        std::thread::sleep(Duration::from_secs(3));
    }
    if source.contains("compile_error") {
        println!("Compiling {source_path}");
        eprintln!("Error: compile_error is not defined");
        return ExitCode::from(1);
    }

    if let Err(e) = std::fs::write(&out, render_output(&source)) {
        eprintln!("cannot write {out}: {e}");
        return ExitCode::from(2);
    }
    if source_map {
        let map = json!({ "version": 3, "file": "main.js", "sources": [source_path], "mappings": "" });
        if let Err(e) = std::fs::write(format!("{out}.map"), map.to_string()) {
            eprintln!("cannot write source map: {e}");
            return ExitCode::from(2);
        }
    }
    ExitCode::SUCCESS
}

fn resolve() -> ExitCode {
    let logged = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open("resolve.runs")
        .and_then(|mut runs| writeln!(runs, "{}", std::process::id()));
    if let Err(e) = logged {
        eprintln!("cannot record run: {e}");
        return ExitCode::from(73);
    }

    let manifest = match std::fs::read_to_string("manifest.toml") {
        Ok(manifest) => manifest,
        Err(e) => {
            eprintln!("no manifest.toml in the current directory: {e}");
            return ExitCode::from(66);
        }
    };
    if manifest.contains("does_not_exist") {
        println!("Resolving dependencies...");
        eprintln!("Because padserve_sample depends on does_not_exist any which doesn't exist, version solving failed.");
        return ExitCode::from(65);
    }

    let mut lock = String::from("# resolved by padserve-test-worker\n");
    let mut in_dependencies = false;
    for line in manifest.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_dependencies = line == "[dependencies]";
            continue;
        }
        if in_dependencies && !line.is_empty() {
            lock.push_str(line);
            lock.push('\n');
        }
    }
    if let Err(e) = std::fs::write("manifest.lock", lock) {
        eprintln!("cannot write manifest.lock: {e}");
        return ExitCode::from(73);
    }
    println!("Got dependencies!");
    ExitCode::SUCCESS
}
