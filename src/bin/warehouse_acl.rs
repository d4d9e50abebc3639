use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt};
use warehouse_acl::Warehouse;
use warehouse_acl::api::{legacy_routes, shipping_routes};
use warehouse_acl::changes::warehouse_plan;
use warehouse_acl::config::AclConfig;
use warehouse_acl::migration::Plan;
use warehouse_acl::permission::Action;

fn main() {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    let rest = &args[2..];
    match args[1].as_str() {
        "plan" => cmd_plan(rest),
        "deploy" => cmd_deploy(rest),
        "revert" => cmd_revert(rest),
        "verify" => cmd_verify(rest),
        "check" => cmd_check(rest),
        "routes" => cmd_routes(rest),
        "snapshot" => cmd_snapshot(rest),
        other => {
            print_usage();
            Err(format!("unknown top-level command: {other}"))
        }
    }
}

fn cmd_plan(args: &[String]) -> Result<(), String> {
    let plan = load_plan()?;
    let (db, _) = open_state(args)?;
    let status = db.status(&plan).map_err(|e| format!("status: {e}"))?;
    for entry in status {
        let state = match (&entry.deployed, entry.drifted) {
            (Some(_), true) => "drifted",
            (Some(_), false) => "deployed",
            (None, _) => "pending",
        };
        println!("{}\t{}\t{}", state, entry.change_id, entry.note);
    }
    Ok(())
}

fn cmd_deploy(args: &[String]) -> Result<(), String> {
    let plan = load_plan()?;
    let (db, state) = open_state(args)?;
    match parse_flag_value(args, "--change") {
        Some(id) => {
            let applied = db.deploy(&plan, &id).map_err(|e| format!("deploy {id}: {e}"))?;
            println!("{}\t{id}", if applied { "deployed" } else { "skipped" });
        }
        None => {
            let report = db.deploy_all(&plan).map_err(|e| format!("deploy: {e}"))?;
            for (id, took) in &report.applied {
                println!("deployed\t{id}\t{}us", took.as_micros());
            }
            for id in &report.skipped {
                println!("skipped\t{id}");
            }
        }
    }
    save_state(&db, state.as_deref())
}

fn cmd_revert(args: &[String]) -> Result<(), String> {
    let plan = load_plan()?;
    let (db, state) = open_state(args)?;
    let state = state.ok_or("--state is required")?;
    match parse_flag_value(args, "--change") {
        Some(id) => {
            db.revert(&plan, &id).map_err(|e| format!("revert {id}: {e}"))?;
            println!("reverted\t{id}");
        }
        None => {
            for id in db.revert_all(&plan).map_err(|e| format!("revert: {e}"))? {
                println!("reverted\t{id}");
            }
        }
    }
    save_state(&db, Some(state.as_path()))
}

fn cmd_verify(args: &[String]) -> Result<(), String> {
    let plan = load_plan()?;
    let (db, _) = open_state(args)?;
    let mut failed = 0usize;
    for record in db.deployed_changes() {
        let ok = db
            .verify(&plan, &record.change_id)
            .map_err(|e| format!("verify {}: {e}", record.change_id))?;
        if !ok {
            failed += 1;
        }
        println!("{}\t{}", if ok { "ok" } else { "failed" }, record.change_id);
    }
    if failed == 0 {
        Ok(())
    } else {
        Err(format!("{failed} change(s) failed verification"))
    }
}

fn cmd_check(args: &[String]) -> Result<(), String> {
    let principal = parse_flag_value(args, "--principal").ok_or("--principal is required")?;
    let securable = parse_flag_value(args, "--securable").ok_or("--securable is required")?;
    let action = parse_flag_value(args, "--action").ok_or("--action is required")?;
    let action = Action::parse(&action).map_err(|e| e.to_string())?;
    let column = parse_flag_value(args, "--column");
    let db = open_deployed(args)?;
    let allowed = db
        .can(&principal, &securable, action, column.as_deref())
        .map_err(|e| format!("check: {e}"))?;
    println!(
        "{}\t{principal}\t{action}\t{securable}{}",
        if allowed { "allow" } else { "deny" },
        column.map(|c| format!("({c})")).unwrap_or_default()
    );
    Ok(())
}

fn cmd_routes(args: &[String]) -> Result<(), String> {
    let db = open_deployed(args)?;
    let mut routes = shipping_routes();
    if args.iter().any(|a| a == "--legacy") {
        routes.extend(legacy_routes());
    }
    let findings = db.audit_routes(&routes);
    for route in &routes {
        if !findings.iter().any(|f| f.path == route.path) {
            println!("ok\t{}\t{}\t{}", route.method, route.path, route.principal);
        }
    }
    for finding in &findings {
        println!(
            "mismatch\t{}\t{}\t{}\tmissing={}\tunexpected={}{}",
            finding.method,
            finding.path,
            finding.principal,
            finding.missing.join(","),
            finding.unexpected.join(","),
            finding
                .error
                .as_ref()
                .map(|e| format!("\terror={e}"))
                .unwrap_or_default()
        );
    }
    if findings.is_empty() {
        Ok(())
    } else {
        Err(format!("{} route(s) disagree with grants", findings.len()))
    }
}

fn cmd_snapshot(args: &[String]) -> Result<(), String> {
    let db = open_deployed(args)?;
    let bytes = db.export_json().map_err(|e| format!("export: {e}"))?;
    match parse_flag_value(args, "--out") {
        Some(out) => {
            std::fs::write(&out, bytes).map_err(|e| format!("write {out}: {e}"))?;
            println!("ok\t{out}");
        }
        None => println!("{}", String::from_utf8_lossy(&bytes)),
    }
    Ok(())
}

fn load_plan() -> Result<Plan, String> {
    warehouse_plan().map_err(|e| format!("plan: {e}"))
}

fn parse_config(args: &[String]) -> Result<AclConfig, String> {
    let mut config = match parse_flag_value(args, "--config") {
        Some(path) => AclConfig::from_json_file(Path::new(&path))
            .map_err(|e| format!("config {path}: {e}"))?,
        None => AclConfig::default(),
    };
    if args.iter().any(|a| a == "--strict") {
        config.owners_bypass = false;
    }
    Ok(config)
}

/// Opens the warehouse stored at `--state`, or an empty one when the flag is
/// absent or the file does not exist yet.
fn open_state(args: &[String]) -> Result<(Warehouse, Option<PathBuf>), String> {
    let config = parse_config(args)?;
    let state = parse_flag_value(args, "--state").map(PathBuf::from);
    let db = match &state {
        Some(path) if path.exists() => Warehouse::load_snapshot(config, path)
            .map_err(|e| format!("load {}: {e}", path.display()))?,
        _ => Warehouse::with_config(config).map_err(|e| format!("config: {e}"))?,
    };
    Ok((db, state))
}

/// Without `--state` the full plan is deployed into a scratch warehouse.
fn open_deployed(args: &[String]) -> Result<Warehouse, String> {
    let (db, state) = open_state(args)?;
    if state.is_none() {
        db.deploy_all(&load_plan()?)
            .map_err(|e| format!("deploy: {e}"))?;
    }
    Ok(db)
}

fn save_state(db: &Warehouse, state: Option<&Path>) -> Result<(), String> {
    let Some(path) = state else {
        return Ok(());
    };
    db.save_snapshot(path)
        .map_err(|e| format!("save {}: {e}", path.display()))
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|idx| args.get(idx + 1).cloned())
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  warehouse-acl plan [--state <file>] [--config <file>]");
    eprintln!("  warehouse-acl deploy [--change <id>] [--state <file>] [--config <file>]");
    eprintln!("  warehouse-acl revert [--change <id>] --state <file> [--config <file>]");
    eprintln!("  warehouse-acl verify [--state <file>] [--config <file>]");
    eprintln!(
        "  warehouse-acl check --principal <role> --securable <schema.table> --action <action> [--column <name>] [--state <file>] [--strict]"
    );
    eprintln!("  warehouse-acl routes [--legacy] [--state <file>] [--config <file>] [--strict]");
    eprintln!("  warehouse-acl snapshot [--out <file>] [--state <file>] [--config <file>]");
}
