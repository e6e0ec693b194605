use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use identity_reconciliation::{
    account_schema, load_population_csv, Collaborators, PassReport, ReconcileConfig,
    ReconciliationEngine, SqliteStore,
};

const USAGE: &str = "Usage:
  identity-reconcile import <csv> --db <path>
  identity-reconcile import-accounts <csv> --db <path>
  identity-reconcile run --db <path> --config <toml>
  identity-reconcile orphans --db <path> --config <toml>
  identity-reconcile cases --db <path>
  identity-reconcile decide --db <path> <form_name> <decision> <reviewer>
  identity-reconcile schema";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };
    let rest = &args[1..];

    match command.as_str() {
        "import" => run_import(rest),
        "import-accounts" => run_import_accounts(rest),
        "run" => run_pass(rest),
        "orphans" => run_orphan_pass(rest),
        "cases" => run_cases(rest),
        "decide" => run_decide(rest),
        "schema" => run_schema(),
        "help" | "--help" | "-h" => {
            println!("{USAGE}");
            Ok(())
        }
        other => bail!("unknown command '{other}'\n{USAGE}"),
    }
}

/// Split `--flag value` pairs from positional arguments
fn parse_args(args: &[String]) -> Result<(Vec<String>, Vec<(String, String)>)> {
    let mut positional = Vec::new();
    let mut flags = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(flag) = arg.strip_prefix("--") {
            let value = iter
                .next()
                .ok_or_else(|| anyhow!("--{flag} needs a value"))?;
            flags.push((flag.to_string(), value.clone()));
        } else {
            positional.push(arg.clone());
        }
    }
    Ok((positional, flags))
}

fn flag(flags: &[(String, String)], name: &str) -> Result<PathBuf> {
    flags
        .iter()
        .find(|(f, _)| f == name)
        .map(|(_, v)| PathBuf::from(v))
        .ok_or_else(|| anyhow!("missing --{name}\n{USAGE}"))
}

fn open_store(flags: &[(String, String)]) -> Result<SqliteStore> {
    let db_path = flag(flags, "db")?;
    SqliteStore::open(&db_path)
}

fn run_import(args: &[String]) -> Result<()> {
    let (positional, flags) = parse_args(args)?;
    let csv_path = positional
        .first()
        .ok_or_else(|| anyhow!("missing CSV path\n{USAGE}"))?;
    let store = open_store(&flags)?;

    println!("📂 Loading {}...", csv_path);
    let records = load_population_csv(Path::new(csv_path))?;
    println!("✓ Loaded {} records from CSV", records.len());

    let stats = store.import_population(&records)?;
    println!("✓ Inserted: {}", stats.inserted);
    println!("✓ Updated: {}", stats.updated);
    println!("✓ Unchanged: {}", stats.unchanged);

    Ok(())
}

fn run_import_accounts(args: &[String]) -> Result<()> {
    let (positional, flags) = parse_args(args)?;
    let csv_path = positional
        .first()
        .ok_or_else(|| anyhow!("missing CSV path\n{USAGE}"))?;
    let store = open_store(&flags)?;

    println!("📂 Loading {}...", csv_path);
    let accounts = load_population_csv(Path::new(csv_path))?;
    println!("✓ Loaded {} accounts from CSV", accounts.len());

    let stats = store.import_accounts(&accounts)?;
    println!("✓ Inserted: {}", stats.inserted);
    println!("✓ Updated: {}", stats.updated);
    println!("✓ Unchanged: {}", stats.unchanged);

    Ok(())
}

fn run_pass(args: &[String]) -> Result<()> {
    let (_, flags) = parse_args(args)?;
    let store = open_store(&flags)?;
    let config = ReconcileConfig::from_file(flag(&flags, "config")?)?;
    let engine = ReconciliationEngine::new(config)?;

    let report = engine.run_pass(Collaborators::single(&store))?;
    store
        .save_outputs(&report.accounts)
        .context("Failed to save reconciled accounts")?;

    println!("{}", report.summary());
    if report.stats.bootstrap {
        println!("✓ First run: {} records taken as-is", report.accounts.len());
    }
    print_pending(&report);

    Ok(())
}

fn run_orphan_pass(args: &[String]) -> Result<()> {
    let (_, flags) = parse_args(args)?;
    let store = open_store(&flags)?;
    let config = ReconcileConfig::from_file(flag(&flags, "config")?)?;
    let engine = ReconciliationEngine::new(config)?;

    let report = engine.run_orphan_pass(Collaborators::single(&store), &store)?;
    store
        .save_orphan_outputs(&report.accounts)
        .context("Failed to save orphan accounts")?;

    println!("{}", report.summary());
    println!(
        "✓ {} confirmed orphan, {} without a similar identity",
        report.stats.orphans_confirmed, report.stats.skipped
    );
    print_pending(&report);

    Ok(())
}

fn print_pending(report: &PassReport) {
    for review in &report.outstanding {
        println!("  ⏳ {} [{}] ({})", review.form_name, review.state, review.case_ref);
    }
    for error in &report.errors {
        println!("  ⚠️  {error}");
    }
}

fn run_cases(args: &[String]) -> Result<()> {
    let (_, flags) = parse_args(args)?;
    let store = open_store(&flags)?;

    let cases = store.list_cases()?;
    if cases.is_empty() {
        println!("No review cases.");
        return Ok(());
    }

    for case in cases {
        println!("{} [{}] ({})", case.form_name, case.state, case.case_ref);
        for candidate in &case.candidates {
            println!("  - {} ({})", candidate.name(), candidate.key);
        }
        if let (Some(decision), Some(reviewer)) = (&case.decision, &case.decided_by) {
            println!("  decided: {} by {}", decision.encode(), reviewer);
        }
    }

    Ok(())
}

fn run_decide(args: &[String]) -> Result<()> {
    let (positional, flags) = parse_args(args)?;
    let [form_name, decision, reviewer] = positional.as_slice() else {
        bail!("decide needs <form_name> <decision> <reviewer>\n{USAGE}");
    };
    let store = open_store(&flags)?;

    store.decide(form_name, decision, reviewer)?;
    println!("✓ Recorded decision for {form_name}");

    Ok(())
}

fn run_schema() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&account_schema())?);
    Ok(())
}
