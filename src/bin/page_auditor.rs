//! Page auditor CLI.
//!
//! Two run modes over the same audit loop:
//!   - `diagnose`: load pages from the local filesystem over `file://` and
//!     write `debug_<page>.png` screenshots, for finding broken pages before
//!     anything is served.
//!   - `verify`: load pages from a running HTTP server and capture one
//!     screenshot per page.
//!
//! Usage examples:
//!   $ cargo run --bin page-auditor -- diagnose --root ./site
//!   $ cargo run --bin page-auditor -- verify --origin http://localhost:8080 \
//!       --pages index.html,about.html --output-dir shots

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use page_auditor::audit::{AuditSummary, PageAuditor};
use page_auditor::config::{AuditConfig, AuditConfigOverrides, Verbosity};
use page_auditor::runtime::ChromiumoxideRuntime;
use page_auditor::target::{AddressBase, Target};

#[derive(Parser)]
#[command(
    name = "page-auditor",
    author,
    version,
    about = "Screenshot static pages and report their console/page errors"
)]
struct Cli {
    /// Increase diagnostic verbosity (overrides AUDITOR_VERBOSE).
    #[arg(long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Audit pages from the local filesystem over file:// URLs.
    Diagnose(DiagnoseArgs),
    /// Audit pages served from an HTTP origin.
    Verify(VerifyArgs),
}

#[derive(Args)]
struct DiagnoseArgs {
    /// Directory the page files live in.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Prefix for screenshot file names [default: debug_].
    #[arg(long)]
    prefix: Option<String>,

    /// Pages to audit, in order.
    #[arg(long, value_delimiter = ',', default_values_t = [
        "index.html".to_string(),
        "about.html".to_string(),
    ])]
    pages: Vec<String>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct VerifyArgs {
    /// HTTP origin the pages are served from.
    #[arg(long, default_value = "http://localhost:8080")]
    origin: String,

    /// Prefix for screenshot file names [default: none].
    #[arg(long)]
    prefix: Option<String>,

    /// Pages to audit, in order.
    #[arg(long, value_delimiter = ',', default_values_t = [
        "index.html".to_string(),
        "about.html".to_string(),
        "programs.html".to_string(),
        "projects.html".to_string(),
        "healing-circles.html".to_string(),
        "media.html".to_string(),
    ])]
    pages: Vec<String>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct CommonArgs {
    /// Directory screenshots are written to (created if missing).
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Show the launched browser window instead of running headless.
    #[arg(long)]
    show_browser: bool,

    /// Quiet window in milliseconds that declares the network idle.
    #[arg(long)]
    quiet_window_ms: Option<u64>,

    /// Hard deadline in milliseconds for reaching network idle.
    #[arg(long)]
    idle_timeout_ms: Option<u64>,
}

/// Per-mode behavior layered over the shared audit configuration.
struct ModeDefaults {
    /// Prefix applied when neither `--prefix` nor the environment set one.
    prefix: &'static str,
    /// Whether per-target banner lines are printed.
    banner: bool,
}

const DIAGNOSE_DEFAULTS: ModeDefaults = ModeDefaults {
    prefix: "debug_",
    banner: true,
};

const VERIFY_DEFAULTS: ModeDefaults = ModeDefaults {
    prefix: "",
    banner: false,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_env_logger();

    let cli = Cli::parse();
    let verbose = verbosity_override(cli.verbose);

    let summary = match cli.command {
        Command::Diagnose(args) => {
            let base = AddressBase::LocalDir(args.root.clone());
            run_audit(
                base,
                &args.pages,
                args.prefix,
                DIAGNOSE_DEFAULTS,
                args.common,
                verbose,
            )
            .await?
        }
        Command::Verify(args) => {
            let base = AddressBase::HttpOrigin(args.origin.clone());
            run_audit(
                base,
                &args.pages,
                args.prefix,
                VERIFY_DEFAULTS,
                args.common,
                verbose,
            )
            .await?
        }
    };

    info!(
        "Audit complete: {} captured, {} failed",
        summary.captured(),
        summary.failed()
    );
    Ok(())
}

async fn run_audit(
    base: AddressBase,
    pages: &[String],
    prefix_flag: Option<String>,
    mode: ModeDefaults,
    common: CommonArgs,
    verbose: Option<Verbosity>,
) -> Result<AuditSummary> {
    let config = AuditConfig::from_env()
        .context("failed to read auditor configuration from the environment")?;
    let config = config.with_overrides(AuditConfigOverrides {
        output_dir: common.output_dir,
        screenshot_prefix: prefix_override(prefix_flag, &config.screenshot_prefix, mode.prefix),
        headless: common.show_browser.then_some(false),
        quiet_window_ms: common.quiet_window_ms,
        idle_timeout_ms: common.idle_timeout_ms,
        banner: Some(mode.banner),
        verbose,
        ..AuditConfigOverrides::default()
    });

    let targets = Target::resolve_all(pages, &base, &config.screenshot_prefix)
        .context("failed to resolve target pages")?;

    let auditor = PageAuditor::new(ChromiumoxideRuntime::new(), config);
    auditor.run(&targets).await.context("audit run failed")
}

/// Screenshot prefix precedence: explicit `--prefix` flag, then
/// `AUDITOR_SCREENSHOT_PREFIX` from the environment, then the mode default.
fn prefix_override(
    flag: Option<String>,
    env_prefix: &str,
    mode_default: &str,
) -> Option<String> {
    match flag {
        Some(value) => Some(value),
        None if env_prefix.is_empty() => Some(mode_default.to_string()),
        None => None,
    }
}

/// `--verbose` only overrides `AUDITOR_VERBOSE` when actually passed.
fn verbosity_override(count: u8) -> Option<Verbosity> {
    (count > 0).then_some(Verbosity::Detailed)
}

fn init_env_logger() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp_secs()
    .try_init();
}
