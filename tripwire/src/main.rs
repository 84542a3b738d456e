// tripwire/src/main.rs
//
// Tripwire: server-authoritative anti-cheat daemon
//
// Two operational modes:
//   serve   — TCP ingress for game clients, /metrics, sweep timers (production)
//   replay  — dry-run the scoring policy over captured reports (tuning/research)
//
// Usage:
//   TRIPWIRE_SECRET=... tripwire serve --config tripwire.json
//   tripwire replay --path captured.jsonl

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tripwire::collab::{JsonlDatastore, NullGameState};
use tripwire::config::Config;
use tripwire::events::{ActionKind, Decision};
use tripwire::replay::DryRun;
use tripwire::server::Server;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "tripwire",
    about   = "Server-authoritative anti-cheat: signed report channels and trust scoring",
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    #[arg(long, global = true, help = "JSON config file (defaults when omitted)")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "TRIPWIRE_SECRET", hide_env_values = true,
          help = "Report-signing secret")]
    secret: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept game clients and enforce policy.
    Serve,
    /// Score captured reports offline; nothing is enforced.
    Replay {
        #[arg(long, help = "JSONL file of captured reports")]
        path: PathBuf,
    },
}

// ── Terminal output ───────────────────────────────────────────────────────────

fn print_banner() {
    println!("\x1b[1m");
    println!("  ████████╗██████╗ ██╗██████╗ ██╗    ██╗██╗██████╗ ███████╗");
    println!("  ╚══██╔══╝██╔══██╗██║██╔══██╗██║    ██║██║██╔══██╗██╔════╝");
    println!("     ██║   ██████╔╝██║██████╔╝██║ █╗ ██║██║██████╔╝█████╗  ");
    println!("     ██║   ██╔══██╗██║██╔═══╝ ██║███╗██║██║██╔══██╗██╔══╝  ");
    println!("     ██║   ██║  ██║██║██║     ╚███╔███╔╝██║██║  ██║███████╗");
    println!("     ╚═╝   ╚═╝  ╚═╝╚═╝╚═╝      ╚══╝╚══╝ ╚═╝╚═╝  ╚═╝╚══════╝");
    println!("\x1b[0m");
    println!("  \x1b[90mServer-authoritative anti-cheat | signed reports + trust scoring\x1b[0m");
    println!("  \x1b[90mgithub.com/m0rs3c0d3/tripwire\x1b[0m\n");
}

fn print_alert(decision: &Decision) {
    let (color, icon) = match decision.action {
        ActionKind::Ban    => ("\x1b[91;1m", "🔴"),
        ActionKind::Kick   => ("\x1b[93;1m", "🟡"),
        ActionKind::Warn   => ("\x1b[96m",   "🔵"),
        ActionKind::Allow | ActionKind::Ignore => ("\x1b[92m", "🟢"),
    };
    let reset = "\x1b[0m";
    let source = decision.event.as_ref()
        .map(|e| if e.source.server_validated { "server" } else { "client" })
        .unwrap_or("-");

    println!("\n{}{} {} → player {}{}", color, icon, decision.action, decision.player_id, reset);
    println!("  Type    : {}{}{} \x1b[90m[{}]{}", color, decision.detection_type, reset, source, reset);
    println!("  Severity: {:.1}  trust={:.1}  warnings={}", decision.severity, decision.trust_score, decision.warning_count);
    println!("  Reason  : {}", decision.reason);
}

async fn print_stats_loop(server: Arc<Server>, start: Instant) {
    loop {
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
        let elapsed = start.elapsed().as_secs_f64();
        let frames  = server.metrics.frames.load(std::sync::atomic::Ordering::Relaxed);
        println!(
            "\n\x1b[1m── stats  uptime={:.0}s  frames={}  fps={:.1}  sessions={}  bans={}  warn={}  kick={}  ban={} ──\x1b[0m",
            elapsed, frames, frames as f64 / elapsed,
            server.sessions.len(), server.bans.len(),
            server.dispatcher.executed(ActionKind::Warn),
            server.dispatcher.executed(ActionKind::Kick),
            server.dispatcher.executed(ActionKind::Ban),
        );
    }
}

// ── Modes ─────────────────────────────────────────────────────────────────────

async fn serve(config: Config, secret: Option<String>) -> Result<()> {
    let listen = config.server.listen;
    let metrics_addr = config.server.metrics;
    let datastore = JsonlDatastore::new(&config.persistence.output_dir)?;

    println!("  Mode: \x1b[91;1mSERVE\x1b[0m  |  {}", listen);
    println!("  Output: \x1b[90m{}\x1b[0m\n", datastore.dir().display());

    let server = Server::build(
        config,
        secret.as_deref().map(str::as_bytes),
        Some(Arc::new(NullGameState)),
        Arc::new(datastore),
    )?;
    if !server.tokens.is_enabled() {
        warn!("Report signing disabled: every client report will be refused");
    }
    if let Err(e) = server.warm_bans().await {
        warn!("Ban cache warm-up failed: {:#}", e);
    }

    let _timers = server.spawn_background();
    if let Some(addr) = metrics_addr {
        let metrics = Arc::clone(&server.metrics);
        tokio::spawn(async move {
            if let Err(e) = tripwire::metrics::serve(metrics, addr).await {
                error!("/metrics endpoint failed: {}", e);
            }
        });
    }
    tokio::spawn(print_stats_loop(Arc::clone(&server), Instant::now()));

    let listener = TcpListener::bind(listen).await
        .with_context(|| format!("binding {}", listen))?;
    println!("  Press Ctrl+C to stop.\n");

    tokio::select! {
        res = Arc::clone(&server).serve(listener) => res?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    let flushed = server.persist.flush().await;
    info!("Flushed {} pending writes", flushed);
    Ok(())
}

async fn replay(config: Config, path: PathBuf) -> Result<()> {
    println!("  Mode: \x1b[93mREPLAY\x1b[0m  |  {}\n", path.display());
    let content = tokio::fs::read_to_string(&path).await
        .with_context(|| format!("reading {}", path.display()))?;

    let mut run = DryRun::new(&config)?;
    for line in content.lines() {
        if let Some(decision) = run.apply_line(line) {
            if decision.action >= ActionKind::Warn {
                print_alert(&decision);
            }
        }
    }

    let s = &run.summary;
    println!(
        "\n\x1b[1m── replay  records={}  skipped={}  allow={}  ignore={}  warn={}  kick={}  ban={}  removed_players={} ──\x1b[0m",
        s.records, s.skipped,
        s.count(ActionKind::Allow), s.count(ActionKind::Ignore),
        s.count(ActionKind::Warn), s.count(ActionKind::Kick), s.count(ActionKind::Ban),
        s.removed.len(),
    );
    Ok(())
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env()
            .add_directive("tripwire=info".parse()?))
        .compact().init();

    let cli    = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    print_banner();

    match cli.command {
        Command::Serve          => serve(config, cli.secret).await,
        Command::Replay { path } => replay(config, path).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_and_config_accepted_after_subcommand() {
        let cli = Cli::try_parse_from(["tripwire", "serve", "--secret", "s3cr3t", "--config", "t.json"]).unwrap();
        assert_eq!(cli.secret.as_deref(), Some("s3cr3t"));
        assert_eq!(cli.config, Some(PathBuf::from("t.json")));
        assert!(matches!(cli.command, Command::Serve));

        let cli = Cli::try_parse_from(["tripwire", "--secret", "s3cr3t", "replay", "--path", "r.jsonl"]).unwrap();
        assert!(matches!(cli.command, Command::Replay { .. }));
    }
}
