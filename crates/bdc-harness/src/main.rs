#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use bdc_cache::CacheConfig;
use bdc_harness::{
    Acquire, PurgeTiming, Release, Scenario, run_matrix, run_scenario, sample_report,
};
use std::env;
use std::fs;
use std::path::Path;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("matrix") => {
            let report = run_matrix()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.all_passed() {
                bail!("scenario matrix reported failures");
            }
            Ok(())
        }
        Some("scenario") => run_one(&args[1..]),
        Some("report") => report(&args[1..]),
        Some("default-config") => {
            println!("{}", serde_json::to_string_pretty(&CacheConfig::default())?);
            Ok(())
        }
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn run_one(args: &[String]) -> Result<()> {
    if args.len() < 2 {
        bail!(
            "usage: bdc-harness scenario <get|get_modified|read> <release|release_modified|sync> [--waiter] [--purge-after]"
        );
    }
    let acquire = match args[0].as_str() {
        "get" => Acquire::Get,
        "get_modified" => Acquire::GetModified,
        "read" => Acquire::Read,
        other => bail!("unknown acquire step: {other}"),
    };
    let release = match args[1].as_str() {
        "release" => Release::Release,
        "release_modified" => Release::ReleaseModified,
        "sync" => Release::Sync,
        other => bail!("unknown release step: {other}"),
    };
    let flags = &args[2..];
    let scenario = Scenario {
        acquire,
        release,
        with_waiter: flags.iter().any(|f| f == "--waiter"),
        purge: if flags.iter().any(|f| f == "--purge-after") {
            PurgeTiming::AfterRelease
        } else {
            PurgeTiming::WhileHeld
        },
    };
    let report = run_scenario(scenario)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn report(args: &[String]) -> Result<()> {
    let config = match args.first() {
        Some(path) => {
            let path = Path::new(path);
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str::<CacheConfig>(&text)
                .with_context(|| format!("invalid cache config in {}", path.display()))?
        }
        None => CacheConfig::default(),
    };
    let blocks = match args.get(1) {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("invalid block count: {raw}"))?,
        None => 16,
    };
    let report = sample_report(config, blocks)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_usage() {
    println!("bdc-harness — buffer cache scenarios and pool reports");
    println!();
    println!("USAGE:");
    println!("  bdc-harness matrix");
    println!("  bdc-harness scenario <acquire> <release> [--waiter] [--purge-after]");
    println!("  bdc-harness report [config.json] [blocks]");
    println!("  bdc-harness default-config");
}
