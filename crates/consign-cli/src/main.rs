use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};

use consign::barcode::{self, Barcode, DEFAULT_TRANSPORT};
use consign::engine::{self, Reporter, RuntimeOptions, StatusReport};
use consign::manifest::{JsonManifestTemplate, ManifestTemplate, TsvManifestTemplate};
use consign::sequence::{FileSequence, SequenceCounter};
use consign_config::{CONFIG_FILE, CarrierAccount, Config, find_config, load_config_from_file};
use consign_types::{EventType, Shipment};

#[derive(Parser, Debug)]
#[command(name = "consign", version)]
#[command(about = "Offline carrier references, label barcodes and batch manifests")]
struct Cli {
    /// Path to the config file (default: nearest .consign.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Carrier account to use (optional when only one is configured)
    #[arg(long, global = true)]
    account: Option<String>,

    /// Directory for counters, entries and logs (overrides [state].dir)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Treat job locks older than this as abandoned (e.g. 30m)
    #[arg(long, global = true)]
    lock_timeout: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Allocate references for the shipments in a JSON file and queue them.
    Assemble {
        /// JSON array of shipments
        shipments: PathBuf,

        /// Skip writing label files.
        #[arg(long)]
        no_labels: bool,
    },
    /// Send every draft entry of the account as one manifest.
    Send {
        #[arg(long, value_enum, default_value_t = TemplateKind::Json)]
        template: TemplateKind,
    },
    /// Show queued and sent entries for the account.
    Status,
    /// Show the reference a counter value maps to.
    Reference {
        /// Counter value (default: the next value of the shared counter)
        #[arg(long)]
        value: Option<u64>,
    },
    /// Encode a label barcode.
    Barcode {
        /// Origin (warehouse) postal code
        #[arg(long)]
        from: String,
        /// Destination postal code
        #[arg(long)]
        to: String,
        #[arg(long)]
        reference: String,
        #[arg(long, default_value_t = DEFAULT_TRANSPORT)]
        transport: u8,
    },
    /// Check the check digit of a rendered barcode.
    Verify { barcode: String },
    /// List configured carrier accounts.
    Accounts,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TemplateKind {
    Json,
    Tsv,
}

impl TemplateKind {
    fn template(self) -> Arc<dyn ManifestTemplate> {
        match self {
            TemplateKind::Json => Arc::new(JsonManifestTemplate),
            TemplateKind::Tsv => Arc::new(TsvManifestTemplate),
        }
    }
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

/// Loaded config plus the directory relative paths resolve against.
struct Loaded {
    config: Config,
    base: PathBuf,
}

fn load(cli: &Cli) -> Result<Loaded> {
    let cwd = env::current_dir().context("failed to read current directory")?;
    let path = match &cli.config {
        Some(path) => {
            if !path.exists() {
                bail!("config file not found: {}", path.display());
            }
            Some(path.clone())
        }
        None => find_config(&cwd),
    };

    match path {
        Some(path) => {
            let config = load_config_from_file(&path)?;
            let base = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or(cwd);
            Ok(Loaded { config, base })
        }
        None => Ok(Loaded {
            config: Config::new(),
            base: cwd,
        }),
    }
}

fn select_account(cli: &Cli, config: &Config) -> Result<CarrierAccount> {
    if let Some(name) = &cli.account {
        return Ok(config.account(name)?);
    }
    let names: Vec<&str> = config.account_names().collect();
    match names.as_slice() {
        [] => bail!("no carrier accounts configured (add [accounts.<name>] to {CONFIG_FILE})"),
        [only] => Ok(config.account(only)?),
        _ => bail!(
            "several carrier accounts configured ({}); pass --account",
            names.join(", ")
        ),
    }
}

fn runtime_options(cli: &Cli, loaded: &Loaded) -> Result<RuntimeOptions> {
    let mut opts = RuntimeOptions::from_config(&loaded.config, &loaded.base);
    if let Some(dir) = &cli.state_dir {
        opts.state_dir = dir.clone();
    }
    if let Some(timeout) = &cli.lock_timeout {
        opts.lock_timeout = parse_duration(timeout)?;
    }
    Ok(opts)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut reporter = CliReporter;

    match &cli.cmd {
        Commands::Barcode {
            from,
            to,
            reference,
            transport,
        } => {
            let barcode = Barcode::encode(from, to, reference, *transport)?;
            print_barcode(&barcode);
            return Ok(());
        }
        Commands::Verify { barcode } => return run_verify(barcode),
        _ => {}
    }

    let loaded = load(&cli)?;
    if let Commands::Accounts = cli.cmd {
        return run_accounts(&loaded.config);
    }

    let account = select_account(&cli, &loaded.config)?;
    let opts = runtime_options(&cli, &loaded)?;

    match &cli.cmd {
        Commands::Assemble {
            shipments,
            no_labels,
        } => {
            let shipments = read_shipments(shipments)?;
            let opts = RuntimeOptions {
                write_labels: !no_labels,
                ..opts
            };
            let report = engine::run_assemble(&account, &shipments, &opts, &mut reporter)?;
            print_assemble(&account, &report, &opts);
        }
        Commands::Send { template } => {
            let result =
                engine::run_send(&account, template.template(), &opts, &mut reporter)?;
            println!("account: {}", account.name());
            if result.is_noop() {
                println!("nothing to send");
            } else {
                println!("batch: {}", result.batch_id);
                println!("entries: {}", result.done_entries.len());
                println!(
                    "attachment: {}",
                    result.attachment.as_deref().unwrap_or_default()
                );
                println!("recipients: {}", result.recipients.join(", "));
            }
        }
        Commands::Status => {
            let report = engine::run_status(account.name(), &opts)?;
            print_status(&report);
        }
        Commands::Reference { value } => {
            run_reference(&account, &opts, *value)?;
        }
        Commands::Barcode { .. } | Commands::Verify { .. } | Commands::Accounts => {}
    }

    Ok(())
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

fn read_shipments(path: &Path) -> Result<Vec<Shipment>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read shipments file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse shipments file {}", path.display()))
}

fn print_barcode(barcode: &Barcode) {
    println!("barcode: {barcode}");
    println!("compact: {}", barcode.compact());
}

fn run_verify(input: &str) -> Result<()> {
    let parsed = Barcode::parse(input.trim())?;
    let expected = barcode::check_digit(parsed.from_prefix(), parsed.reference())?;
    if expected != parsed.check() {
        bail!(
            "invalid check digit in '{}': expected {expected}, found {}",
            input.trim(),
            parsed.check()
        );
    }
    println!("valid: {parsed}");
    Ok(())
}

fn run_accounts(config: &Config) -> Result<()> {
    for name in config.account_names() {
        match config.account(name) {
            Ok(account) => {
                let relay = match account.relay() {
                    Some(_) => "relay",
                    None => "no relay",
                };
                let mode = if account.is_offline() { "offline" } else { "online" };
                println!("{name}: {} ({mode}, {relay})", account.range());
            }
            Err(err) => println!("{name}: invalid ({err})"),
        }
    }
    Ok(())
}

fn run_reference(account: &CarrierAccount, opts: &RuntimeOptions, value: Option<u64>) -> Result<()> {
    let value = match value {
        Some(value) => value,
        None => {
            let counter = FileSequence::new(&opts.state_dir);
            let current = counter.current(account.sequence_id())?;
            println!("counter: {current}");
            current
                .checked_add(1)
                .context("sequence counter is exhausted")?
        }
    };
    let reference = barcode::allocate(&account.range(), value)?;
    println!("range: {}", account.range());
    println!("value: {value}");
    println!("reference: {reference}");
    Ok(())
}

fn print_assemble(account: &CarrierAccount, report: &engine::AssembleReport, opts: &RuntimeOptions) {
    let plan = &report.plan;
    println!("account: {}", account.name());
    println!("queued: {}", plan.entries.len());
    println!("rejected: {}", plan.issues.len());
    println!();

    for entry in &plan.entries {
        println!("{}: {}", entry.shipment, entry.vals.tracking_ref);
        for barcode in &entry.vals.barcodes {
            println!("  {barcode}");
        }
    }
    for issue in &plan.issues {
        println!("{}: rejected ({}: {})", issue.shipment, issue.kind, issue.message);
    }

    if !report.label_files.is_empty() {
        println!();
        println!(
            "labels: {} file(s) in {}",
            report.label_files.len(),
            opts.state_dir.join(engine::LABELS_DIR).display()
        );
    }
}

fn print_status(report: &StatusReport) {
    println!("account: {}", report.account);
    println!("draft entries: {}", report.drafts.len());
    println!("draft packages: {}", report.draft_packages());
    println!("done entries: {}", report.done);
    println!("receipts: {}", report.receipts);

    match &report.last_transmission {
        None => println!("last transmission: none"),
        Some(event) => {
            let at = event.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            match &event.event_type {
                EventType::TransmitSucceeded { batch_id, .. } => {
                    println!("last transmission: sent {batch_id} at {at}")
                }
                EventType::TransmitFailed { batch_id, message } => {
                    println!("last transmission: failed {batch_id} at {at} ({message})")
                }
                other => println!("last transmission: {other:?} at {at}"),
            }
        }
    }

    match &report.lock {
        None => println!("lock: free"),
        Some(info) => println!(
            "lock: held by pid {} on {} ({})",
            info.pid,
            info.hostname,
            info.holder.as_deref().unwrap_or("unlabelled")
        ),
    }

    if !report.drafts.is_empty() {
        println!();
        for entry in &report.drafts {
            println!("{}: {}", entry.shipment, entry.vals.tracking_ref);
        }
    }
}
