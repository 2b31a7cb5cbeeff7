//! `kindred-cli` – Kindred Command Line Interface
//!
//! This binary is the entry point for the Kindred companion.  It:
//!
//! 1. Checks for `~/.kindred/config.toml`; runs a **First-Run Wizard** when
//!    the file is absent (or on `kindred setup`).
//! 2. Opens the durable memory, loads the persona and wires the runtime.
//! 3. Either drops the user into an **interactive chat REPL** (`kindred chat`,
//!    the default) or serves the HTTP/WebSocket API (`kindred serve`).
//! 4. Intercepts **Ctrl-C** so open sessions are closed cleanly.

mod app;
mod config;
mod repl;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Parser, Subcommand};
use colored::Colorize;
use kindred_runtime::spawn_event_scheduler;
use kindred_server::CompanionServer;
use kindred_types::SessionId;
use tracing::{error, warn};

use crate::config::{AiProvider, Config};

#[derive(Parser, Debug)]
#[command(name = "kindred", version, about = "A companion that remembers and feels")]
struct Cli {
    /// Directory for the database (overrides the config file).
    #[arg(long, global = true, env = "KINDRED_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Chat in the terminal (default).
    Chat {
        /// Session to open.
        #[arg(long, short, default_value = "default")]
        session: String,
    },
    /// Serve the HTTP and WebSocket API.
    Serve {
        #[arg(long, short, env = "KINDRED_PORT")]
        port: Option<u16>,
        /// Address to bind. The API has no authentication.
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,
    },
    /// List models offered by the configured server.
    Models,
    /// Re-run the first-run wizard.
    Setup,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _telemetry = kindred_runtime::init_tracing("kindred");

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => Arc::new(rt),
        Err(e) => {
            eprintln!("{}: {}", "Cannot start async runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let command = cli.command.unwrap_or(Command::Chat {
        session: "default".to_string(),
    });
    if matches!(command, Command::Chat { .. } | Command::Setup) {
        print_banner();
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let mut cfg = match (&command, config::load()) {
        (Command::Setup, loaded) => run_first_run_wizard(loaded.ok().flatten().unwrap_or_default()),
        (_, Ok(Some(cfg))) => cfg,
        (Command::Chat { .. }, Ok(None)) => run_first_run_wizard(Config::default()),
        (_, Ok(None)) => {
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        (_, Err(e)) => {
            println!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(dir) = cli.data_dir {
        cfg.data_dir = Some(dir);
    }

    match command {
        Command::Setup => ExitCode::SUCCESS,
        Command::Models => {
            let driver = kindred_runtime::LlmDriver::new(&cfg.base_url, &cfg.model)
                .with_api_key(cfg.api_key());
            match rt.block_on(driver.list_models()) {
                Ok(models) => {
                    for m in models {
                        println!("{m}");
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{}: {}", "Cannot list models".red(), e);
                    ExitCode::FAILURE
                }
            }
        }
        Command::Serve { port, host } => serve(&rt, &cfg, port.unwrap_or(cfg.port), host),
        Command::Chat { session } => chat(rt, &cfg, &session),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Modes
// ─────────────────────────────────────────────────────────────────────────────

fn chat(rt: Arc<tokio::runtime::Runtime>, cfg: &Config, session: &str) -> ExitCode {
    let session = match SessionId::parse(session) {
        Ok(sid) => sid,
        Err(e) => {
            eprintln!("{}: {}", "Invalid session id".red(), e);
            return ExitCode::FAILURE;
        }
    };
    let companion = match app::boot(cfg) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "Boot failed".red(), e);
            return ExitCode::FAILURE;
        }
    };
    println!(
        "  Memory at {}",
        companion.db_path.display().to_string().bold()
    );

    // ── Model discovery ───────────────────────────────────────────────────
    print!("  Checking {} at {} … ", cfg.provider, cfg.base_url.dimmed());
    match rt.block_on(companion.driver.list_models()) {
        Ok(models) => {
            println!("{} ({} model(s) available)", "online".green(), models.len());
            if !models.is_empty() && !models.iter().any(|m| m == &cfg.model) {
                println!(
                    "  {} '{}' is not listed by the server.",
                    "Warning:".yellow(),
                    cfg.model.bold()
                );
            }
        }
        Err(_) => {
            println!("{}", "offline".yellow());
            println!(
                "  {}",
                "Replies will fall back until the model server is reachable.".dimmed()
            );
        }
    }

    let scheduler = {
        let _enter = rt.enter();
        spawn_event_scheduler(Arc::clone(&companion.orchestrator), cfg.event_interval())
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – finishing up …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    println!();
    println!(
        "  Talking to {}. Type {} for a list of commands.\n",
        companion.orchestrator.persona().name.bold().magenta(),
        "/help".bold().cyan()
    );

    let repl = repl::Repl::new(
        Arc::clone(&rt),
        Arc::clone(&companion.orchestrator),
        Arc::clone(&companion.driver),
        session,
    );
    let result = repl.run(shutdown);

    if let Some(handle) = scheduler {
        handle.abort();
    }
    rt.block_on(companion.orchestrator.shutdown());
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "terminal error");
            ExitCode::FAILURE
        }
    }
}

fn serve(rt: &tokio::runtime::Runtime, cfg: &Config, port: u16, host: IpAddr) -> ExitCode {
    let companion = match app::boot(cfg) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "Boot failed".red(), e);
            return ExitCode::FAILURE;
        }
    };
    let orchestrator = Arc::clone(&companion.orchestrator);
    let result = rt.block_on(async move {
        let scheduler = spawn_event_scheduler(Arc::clone(&orchestrator), cfg.event_interval());
        let server = CompanionServer::new(Arc::clone(&orchestrator), companion.bus.clone())
            .with_host(host)
            .with_port(port);
        let result = server
            .run_until(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
        if let Some(handle) = scheduler {
            handle.abort();
        }
        orchestrator.shutdown().await;
        result
    });
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server stopped");
            eprintln!("{}: {}", "Server error".red(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard(mut cfg: Config) -> Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║       Kindred First-Run Wizard       ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();

    // AI provider
    println!("  Which model server would you like to use?");
    println!("    1) Local AI via Ollama  (default, offline-first)");
    println!("    2) Cloud AI via OpenAI");
    println!("    3) Another OpenAI-compatible server");
    let choice = prompt_line("  Enter choice [1]: ", "1");
    let provider = match choice.trim() {
        "2" => AiProvider::OpenAI,
        "3" => AiProvider::Custom,
        other => AiProvider::parse(other).unwrap_or(AiProvider::Ollama),
    };
    if provider != cfg.provider {
        cfg.base_url = provider.default_base_url().to_string();
    }
    cfg.provider = provider;

    cfg.base_url = prompt_line(&format!("  Server URL [{}]: ", cfg.base_url), &cfg.base_url);

    loop {
        let model = prompt_line(&format!("  Model [{}]: ", cfg.model), &cfg.model);
        match config::validate_model_name(&model) {
            Ok(()) => {
                cfg.model = model;
                break;
            }
            Err(e) => println!("  {}", e.to_string().red()),
        }
    }

    if cfg.provider != AiProvider::Ollama {
        let key = prompt_line("  API key (leave empty to skip): ", "");
        if !key.is_empty() {
            cfg.api_key = key;
        }
    }

    let port_str = prompt_line(&format!("  HTTP port for `kindred serve` [{}]: ", cfg.port), &cfg.port.to_string());
    if let Ok(p) = port_str.trim().parse::<u16>() {
        cfg.port = p;
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    config::apply_env_overrides(&mut cfg);
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   __ __ _           __              __"#.bold().magenta());
    println!("{}", r#"  / //_/(_)__  ___  / /_______ ____/ /"#.bold().magenta());
    println!("{}", r#" / ,<  / / _ \/ _ \/ __/ __/ -_) _  / "#.bold().magenta());
    println!("{}", r#"/_/|_|/_/_//_/\_,_/\__/_/  \__/\_,_/  "#.bold().magenta());
    println!();
    println!("  {} {}",
        "Kindred".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  A companion that remembers");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
