//! `tether` - mutation-safety control plane CLI
//!
//! Exit codes: 0 committed or clean, 1 rejected by validation, 2 rolled
//! back, 3 operator escalated, 4 usage or infrastructure error.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use serde::Serialize;
use tether_core::{
    ApplyOptions, ApplyOrchestrator, AuditError, AuditLog, CommandHost, Disposition, GuardConfig,
    LogNotifier, MutationAttempt, MutationPipeline, Notifier, UpgradeOrchestrator, Watchdog,
    WatchdogAction, WebhookNotifier,
};
use tether_store::{LiveDocument, SnapshotStore};
use tether_validate::{SemanticValidator, ValidationReport};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const EXIT_REJECTED: u8 = 1;
const EXIT_FATAL: u8 = 3;
const EXIT_FAILURE: u8 = 4;

fn cli() -> Command {
    Command::new("tether")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Validated, health-checked changes to a live agent host")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .default_value("tether.toml")
                .value_parser(value_parser!(PathBuf))
                .help("Configuration file (missing file means defaults)"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Print results as JSON"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines on stderr"),
        )
        .subcommand(
            Command::new("check")
                .about("Validate a document or patch without writing anything")
                .arg(input_arg())
                .arg(
                    Arg::new("patch")
                        .long("patch")
                        .action(ArgAction::SetTrue)
                        .help("Treat input as a patch and validate the merged result"),
                ),
        )
        .subcommand(
            Command::new("apply")
                .about("Apply a patch to the live document")
                .arg(input_arg())
                .arg(no_restart_arg()),
        )
        .subcommand(
            Command::new("rollback")
                .about("Restore the latest snapshot onto the live document")
                .arg(no_restart_arg()),
        )
        .subcommand(
            Command::new("diff")
                .about("Show changes since the latest snapshot")
                .arg(
                    Arg::new("tree")
                        .long("tree")
                        .action(ArgAction::SetTrue)
                        .help("Compare the plugin tree instead of the document"),
                ),
        )
        .subcommand(
            Command::new("upgrade")
                .about("Install a staged plugin tree")
                .arg(
                    Arg::new("staging")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Directory holding the new files"),
                )
                .arg(no_restart_arg())
                .arg(
                    Arg::new("check")
                        .long("check")
                        .action(ArgAction::SetTrue)
                        .help("Only resolve descriptors; write nothing"),
                ),
        )
        .subcommand(
            Command::new("snapshot")
                .about("Take an out-of-band snapshot")
                .arg(
                    Arg::new("tree")
                        .long("tree")
                        .action(ArgAction::SetTrue)
                        .help("Snapshot the plugin tree instead of the document"),
                ),
        )
        .subcommand(Command::new("snapshots").about("List document snapshots, oldest first"))
        .subcommand(
            Command::new("watchdog")
                .about("Ambient liveness monitor")
                .subcommand_required(true)
                .subcommand(Command::new("run").about("Tick on the configured interval until Ctrl-C"))
                .subcommand(Command::new("tick").about("Run a single tick and exit")),
        )
        .subcommand(
            Command::new("audit")
                .about("Audit journal")
                .subcommand_required(true)
                .subcommand(Command::new("verify").about("Check the journal hash chain")),
        )
}

fn input_arg() -> Arg {
    Arg::new("input")
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("File to read, or - for stdin")
}

fn no_restart_arg() -> Arg {
    Arg::new("no-restart")
        .long("no-restart")
        .action(ArgAction::SetTrue)
        .help("Do not reload the host or wait for health")
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("log-json"));

    match run(&matches).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = std::env::var("TETHER_LOG")
        .ok()
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

async fn run(matches: &ArgMatches) -> Result<u8> {
    let config_path = matches
        .get_one::<PathBuf>("config")
        .context("missing --config")?;
    let config = GuardConfig::load_or_default(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate()?;
    let ctx = Context {
        config,
        json: matches.get_flag("json"),
    };

    match matches.subcommand() {
        Some(("check", args)) => {
            let text = read_input(input(args)?)?;
            let apply = ctx.apply_orchestrator()?;
            let report = if args.get_flag("patch") {
                apply.check_patch(&text)?
            } else {
                apply.check_document(&text)?
            };
            ctx.print_report(&report)?;
            Ok(if report.has_errors() { EXIT_REJECTED } else { 0 })
        }
        Some(("apply", args)) => {
            let text = read_input(input(args)?)?;
            let attempt = ctx
                .apply_orchestrator()?
                .apply(&text, options(args))
                .await?;
            ctx.print_attempt(&attempt)
        }
        Some(("rollback", args)) => {
            let attempt = ctx.apply_orchestrator()?.rollback(options(args)).await?;
            ctx.print_attempt(&attempt)
        }
        Some(("diff", args)) => {
            if args.get_flag("tree") {
                let drift = ctx.upgrade_orchestrator()?.diff()?;
                if ctx.json {
                    print_json(&drift)?;
                } else {
                    print!("{drift}");
                }
            } else {
                let changes = ctx.apply_orchestrator()?.diff()?;
                if ctx.json {
                    print_json(&changes)?;
                } else {
                    for change in &changes {
                        println!("{change}");
                    }
                }
            }
            Ok(0)
        }
        Some(("upgrade", args)) => {
            let staging = args
                .get_one::<PathBuf>("staging")
                .context("missing staging directory")?;
            let upgrade = ctx.upgrade_orchestrator()?;
            if args.get_flag("check") {
                let report = upgrade.check(staging)?;
                ctx.print_report(&report)?;
                return Ok(if report.has_errors() { EXIT_REJECTED } else { 0 });
            }
            let attempt = upgrade.upgrade(staging, options(args)).await?;
            ctx.print_attempt(&attempt)
        }
        Some(("snapshot", args)) => {
            let pipeline = ctx.pipeline()?;
            if args.get_flag("tree") {
                let tree = pipeline.snapshot_tree(&ctx.config.paths.plugin_dir).await?;
                println!("{} ({} files)", tree.id, tree.manifest.len());
            } else {
                let info = pipeline.snapshot_document(&ctx.live()).await?;
                println!("{} ({} bytes)", info.id, info.size);
            }
            Ok(0)
        }
        Some(("snapshots", _)) => {
            let store = ctx.store()?;
            let snapshots = store.list()?;
            if ctx.json {
                print_json(&snapshots)?;
            } else {
                let latest = store.latest()?.map(|s| s.id);
                for info in &snapshots {
                    let marker = if Some(&info.id) == latest.as_ref() { " (latest)" } else { "" };
                    println!("{}  {:>8} bytes{marker}", info.id, info.size);
                }
            }
            Ok(0)
        }
        Some(("watchdog", args)) => match args.subcommand() {
            Some(("run", _)) => {
                let mut watchdog = ctx.watchdog()?;
                watchdog
                    .run(async {
                        if let Err(e) = tokio::signal::ctrl_c().await {
                            tracing::error!(error = %e, "cannot listen for Ctrl-C");
                        }
                    })
                    .await?;
                Ok(0)
            }
            Some(("tick", _)) => {
                let report = ctx.watchdog()?.tick().await?;
                if ctx.json {
                    print_json(&report)?;
                } else {
                    println!(
                        "healthy={} failures={} action={}{}",
                        report.healthy(),
                        report.consecutive_failures,
                        report.action.as_str(),
                        if report.deferred { " (deferred)" } else { "" }
                    );
                    for error in &report.errors {
                        println!("  {error}");
                    }
                }
                Ok(if report.action == WatchdogAction::Escalate { EXIT_FATAL } else { 0 })
            }
            _ => unreachable!("subcommand_required"),
        },
        Some(("audit", args)) => match args.subcommand() {
            Some(("verify", _)) => match AuditLog::verify(&ctx.config.paths.audit_log) {
                Ok(records) => {
                    println!("{records} record(s), chain intact");
                    Ok(0)
                }
                Err(e @ AuditError::Broken { .. }) => {
                    println!("{e}");
                    Ok(EXIT_REJECTED)
                }
                Err(e) => Err(e.into()),
            },
            _ => unreachable!("subcommand_required"),
        },
        _ => unreachable!("subcommand_required"),
    }
}

fn input(args: &ArgMatches) -> Result<&Path> {
    args.get_one::<PathBuf>("input")
        .map(PathBuf::as_path)
        .context("missing input")
}

fn options(args: &ArgMatches) -> ApplyOptions {
    if args.get_flag("no-restart") {
        ApplyOptions::without_restart()
    } else {
        ApplyOptions::default()
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("reading stdin")?;
        Ok(text)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Components built from the loaded configuration
struct Context {
    config: GuardConfig,
    json: bool,
}

impl Context {
    fn store(&self) -> Result<SnapshotStore> {
        Ok(SnapshotStore::open(&self.config.paths.snapshot_dir)?)
    }

    fn live(&self) -> LiveDocument {
        LiveDocument::new(&self.config.paths.live_document)
    }

    fn host(&self) -> Result<Arc<CommandHost>> {
        Ok(Arc::new(CommandHost::new(self.config.host.clone())?))
    }

    fn notifier(&self) -> Result<Arc<dyn Notifier>> {
        let notifier: Arc<dyn Notifier> = match &self.config.notify.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
            None => Arc::new(LogNotifier),
        };
        Ok(notifier)
    }

    fn audit(&self) -> Result<Arc<AuditLog>> {
        Ok(Arc::new(AuditLog::open(&self.config.paths.audit_log)?))
    }

    fn pipeline(&self) -> Result<Arc<MutationPipeline>> {
        Ok(Arc::new(
            MutationPipeline::new(self.store()?, self.host()?)
                .with_notifier(self.notifier()?)
                .with_audit(self.audit()?)
                .with_health(self.config.health.clone())
                .with_lock_stale_after(self.config.lock.stale_after()),
        ))
    }

    fn apply_orchestrator(&self) -> Result<ApplyOrchestrator> {
        Ok(ApplyOrchestrator::new(
            self.pipeline()?,
            self.live(),
            SemanticValidator::new(self.config.validation.policy.clone())?,
        ))
    }

    fn upgrade_orchestrator(&self) -> Result<UpgradeOrchestrator> {
        Ok(UpgradeOrchestrator::new(
            self.pipeline()?,
            &self.config.paths.plugin_dir,
            self.config.validation.upgrade.descriptor_name.clone(),
        ))
    }

    fn watchdog(&self) -> Result<Watchdog> {
        Ok(
            Watchdog::new(self.host()?, self.store()?, self.live(), &self.config.watchdog)
                .with_notifier(self.notifier()?)
                .with_audit(self.audit()?)
                .with_state_file(&self.config.watchdog.state_file)
                .with_lock_stale_after(self.config.lock.stale_after()),
        )
    }

    fn print_report(&self, report: &ValidationReport) -> Result<()> {
        if self.json {
            print_json(report)
        } else {
            println!("{report}");
            Ok(())
        }
    }

    fn print_attempt(&self, attempt: &MutationAttempt) -> Result<u8> {
        if self.json {
            print_json(attempt)?;
        } else {
            println!("attempt {} ({})", attempt.id, attempt.kind.as_str());
            if let Some(snapshot) = &attempt.snapshot {
                println!("  snapshot: {snapshot}");
            }
            for finding in &attempt.findings {
                println!("  {finding}");
            }
            for window in &attempt.health_windows {
                println!(
                    "  {:?} health window: {} poll(s), {}",
                    window.kind,
                    window.polls,
                    if window.confirmed { "healthy" } else { "not healthy" }
                );
            }
            for note in &attempt.notes {
                println!("  note: {note}");
            }
            if let Some(disposition) = attempt.disposition {
                println!(
                    "{disposition:?}{}",
                    if attempt.is_committed() && !attempt.health_verified {
                        " (health not verified)"
                    } else {
                        ""
                    }
                );
            }
        }
        if let Some(e) = attempt.operator_error() {
            tracing::error!(error = %e, "operator action required");
            eprintln!("error: {e}");
        }
        let code = attempt
            .disposition
            .map_or(i32::from(EXIT_FAILURE), Disposition::exit_code);
        Ok(u8::try_from(code).unwrap_or(EXIT_FAILURE))
    }
}
