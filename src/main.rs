mod app;
mod collectors;
mod config;
mod models;
mod util;

use anyhow::{Context, Result};
use app::{App, RunOptions, RunOutcome};
use clap::Parser;
use collectors::catalog::CatalogFetcher;
use config::Config;
use std::path::{Path, PathBuf};
use util::logging::{self, LogFormat};
use util::mailer::SmtpMailer;
use util::render::Renderer;
use util::state_store;

#[derive(Parser, Debug)]
#[command(name = "freenow", about = "Email newly free Epic Games Store promotions", version)]
struct Cli {
    /// Read settings from this TOML file instead of the default location
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the state file path (STATE_FILE)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Fetch and render, print the email to stdout; never send or write state
    #[arg(long)]
    dry_run: bool,

    /// Ignore MIN_HOURS_BETWEEN_RUNS for this invocation
    #[arg(long)]
    force: bool,

    /// Print the effective configuration (secrets masked) and exit
    #[arg(long)]
    print_config: bool,

    /// Print what the state file currently records and exit
    #[arg(long)]
    show_state: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // A missing .env is the normal case.
    let _ = dotenvy::dotenv();
    logging::init(LogFormat::from_env());

    let mut cfg = Config::load(cli.config.as_deref())?;
    if let Some(path) = cli.state_file {
        cfg.state.path = path;
    }

    if cli.print_config {
        return run_print_config(&cfg, cli.config.as_deref());
    }
    if cli.show_state {
        return run_show_state(&cfg);
    }

    let opts = RunOptions { force: cli.force, dry_run: cli.dry_run };
    let code = run_job(&cfg, opts)?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn run_job(cfg: &Config, opts: RunOptions) -> Result<i32> {
    let tz       = cfg.catalog.tz()?;
    let fetcher  = CatalogFetcher::new(&cfg.catalog, tz).context("building HTTP client")?;
    let mailer   = SmtpMailer::new(cfg.smtp.clone());
    let renderer = Renderer::new()?;

    let outcome = App::new(cfg, &fetcher, &mailer, &renderer).run_once(chrono::Utc::now(), opts);
    match &outcome {
        RunOutcome::Skipped | RunOutcome::FetchFailed => {}
        RunOutcome::Completed { fetched, new, delivered } => {
            tracing::info!(fetched, new, delivered, "run complete");
        }
        RunOutcome::DryRun { fetched, email } => match email {
            Some(email) => {
                println!("Subject: {}", email.subject);
                println!("Preheader: {}", email.preheader);
                println!();
                println!("{}", email.html);
            }
            None => println!("Nothing new among {} free promotion(s).", fetched),
        },
    }
    Ok(outcome.exit_code())
}

fn run_print_config(cfg: &Config, explicit: Option<&Path>) -> Result<()> {
    let mask = |s: &str| if s.is_empty() { "(not set)" } else { "(set)" };
    let file = explicit.map(Path::to_path_buf)
        .or_else(Config::config_path)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "(unknown)".to_string());
    let c = &cfg.catalog;
    let s = &cfg.smtp;
    println!("Config file: {}", file);
    println!();
    println!("[catalog]");
    println!("  locale       = {}", c.locale);
    println!("  country      = {}", c.country);
    println!("  timezone     = {}", c.timezone);
    println!("  timeout_secs = {}", c.timeout_secs);
    println!("  attempts     = {}", c.attempts);
    println!("  backoff_secs = {}", c.backoff_secs);
    for url in c.endpoints() {
        println!("  endpoint     = {}", url);
    }
    println!();
    println!("[schedule]");
    println!("  min_hours_between_runs = {}", cfg.schedule.min_hours_between_runs);
    println!();
    println!("[smtp]");
    println!("  host     = {}", if s.host.is_empty() { "(not set)" } else { s.host.as_str() });
    println!("  port     = {}", s.port);
    println!("  user     = {}", mask(&s.user));
    println!("  password = {}", mask(&s.password));
    println!("  from     = {}", s.sender());
    println!("  to       = {}", if s.to.is_empty() { "(none)".to_string() } else { s.to.join(", ") });
    println!("  enabled  = {}", s.is_configured());
    println!();
    println!("[state]");
    println!("  path = {}", cfg.state.path.display());
    Ok(())
}

fn run_show_state(cfg: &Config) -> Result<()> {
    let state = state_store::load(&cfg.state.path);
    println!("State file:   {}", cfg.state.path.display());
    println!("Last success: {}", state.last_success_iso.as_deref().unwrap_or("never"));
    let notified: Vec<&String> = state.notified.iter()
        .filter(|(_, sent)| **sent)
        .map(|(key, _)| key)
        .collect();
    if notified.is_empty() {
        println!("Notified:     (none)");
        return Ok(());
    }
    println!("Notified ({}):", notified.len());
    for key in notified {
        println!("  {}", key);
    }
    Ok(())
}
