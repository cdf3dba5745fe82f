//! entdb-schema: schema management CLI (`snapshot`/`check`/`diff`/
//! `validate`), grounded on `dbaas/entdb_server/tools/schema_cli.py`'s
//! `argparse` subcommands. Unlike the original, which imports a live
//! Python module to obtain the current registry, this binary always
//! reads registries from JSON files (`Registry::from_value` on the
//! `to_canonical_json` shape) since there is no dynamic module loading
//! in Rust.

use std::process::ExitCode;

use entdb::compat::check_compatibility;
use entdb::registry::Registry;

fn usage() -> String {
    "usage:\n  \
     entdb-schema snapshot --file <schema.json> [--output <out.json>]\n  \
     entdb-schema check --file <schema.json> --baseline <baseline.json>\n  \
     entdb-schema diff --old <old.json> --new <new.json> [--format text|json]\n  \
     entdb-schema validate --file <schema.json>"
        .to_string()
}

fn load_registry(path: &str) -> Result<Registry, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("reading {path}: {e}"))?;
    let mut value: serde_json::Value = serde_json::from_str(&text).map_err(|e| format!("parsing {path}: {e}"))?;
    if let Some(schema) = value.get("schema").cloned() {
        value = schema;
    }
    Registry::from_value(&value).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", usage());
        return ExitCode::FAILURE;
    };

    let flags = parse_flags(&args[1..]);

    match command.as_str() {
        "snapshot" => cmd_snapshot(&flags),
        "check" => cmd_check(&flags),
        "diff" => cmd_diff(&flags),
        "validate" => cmd_validate(&flags),
        other => {
            eprintln!("entdb-schema: unknown command '{other}'\n{}", usage());
            ExitCode::FAILURE
        }
    }
}

fn parse_flags(rest: &[String]) -> std::collections::HashMap<String, String> {
    let mut flags = std::collections::HashMap::new();
    let mut it = rest.iter();
    while let Some(arg) = it.next() {
        if let Some(name) = arg.strip_prefix("--") {
            if let Some(value) = it.next() {
                flags.insert(name.to_string(), value.clone());
            }
        }
    }
    flags
}

fn cmd_snapshot(flags: &std::collections::HashMap<String, String>) -> ExitCode {
    let Some(file) = flags.get("file") else {
        eprintln!("snapshot requires --file");
        return ExitCode::FAILURE;
    };
    let registry = match load_registry(file) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let fingerprint = registry.freeze().unwrap_or_else(|_| registry.fingerprint().unwrap_or("unfrozen").to_string());
    let output = serde_json::json!({
        "version": 1,
        "fingerprint": fingerprint,
        "schema": registry.canonical_json(),
    });
    let rendered = serde_json::to_string_pretty(&output).unwrap();
    if let Some(out_path) = flags.get("output") {
        if let Err(e) = std::fs::write(out_path, &rendered) {
            eprintln!("writing {out_path}: {e}");
            return ExitCode::FAILURE;
        }
        eprintln!("schema exported to {out_path}");
    } else {
        println!("{rendered}");
    }
    ExitCode::SUCCESS
}

fn cmd_check(flags: &std::collections::HashMap<String, String>) -> ExitCode {
    let (Some(file), Some(baseline)) = (flags.get("file"), flags.get("baseline")) else {
        eprintln!("check requires --file and --baseline");
        return ExitCode::FAILURE;
    };
    let current = match load_registry(file) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let base = match load_registry(baseline) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let _ = current.freeze();
    let _ = base.freeze();

    let changes = check_compatibility(&base, &current);
    let issues: Vec<String> = changes.iter().filter(|c| c.is_breaking()).map(|c| c.to_string()).collect();

    if issues.is_empty() {
        println!("schema is compatible with baseline");
        ExitCode::SUCCESS
    } else {
        println!("schema compatibility check FAILED with {} breaking change(s):", issues.len());
        for issue in &issues {
            println!("  - {issue}");
        }
        ExitCode::FAILURE
    }
}

fn cmd_diff(flags: &std::collections::HashMap<String, String>) -> ExitCode {
    let (Some(old_path), Some(new_path)) = (flags.get("old"), flags.get("new")) else {
        eprintln!("diff requires --old and --new");
        return ExitCode::FAILURE;
    };
    let old = match load_registry(old_path) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let new = match load_registry(new_path) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let changes = check_compatibility(&old, &new);
    let format = flags.get("format").map(String::as_str).unwrap_or("text");

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&changes).unwrap());
    } else if changes.is_empty() {
        println!("no changes detected");
    } else {
        println!("found {} change(s):", changes.len());
        for change in &changes {
            println!("  {change}");
        }
    }

    if changes.iter().any(|c| c.is_breaking()) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn cmd_validate(flags: &std::collections::HashMap<String, String>) -> ExitCode {
    let Some(file) = flags.get("file") else {
        eprintln!("validate requires --file");
        return ExitCode::FAILURE;
    };
    let registry = match load_registry(file) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let errors = registry.validate_all();
    if errors.is_empty() {
        println!("schema is valid");
        ExitCode::SUCCESS
    } else {
        println!("schema validation failed with {} error(s):", errors.len());
        for error in &errors {
            println!("  - {error}");
        }
        ExitCode::FAILURE
    }
}
