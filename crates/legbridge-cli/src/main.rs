//! `legbridge` – operator console for the tele-operation safety supervisor.
//!
//! 1. Loads `~/.legbridge/config.toml`, running a **First-Run Wizard** when
//!    the file is absent.
//! 2. Builds a [`Session`] against the simulated robot.
//! 3. Drops the operator into an **interactive REPL**.
//! 4. Intercepts **Ctrl-C**: the session is stopped and released before the
//!    process exits.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use legbridge_hal::SimRobot;
use legbridge_runtime::{Session, telemetry};
use legbridge_types::LifecycleState;
use zeroize::Zeroizing;

fn main() {
    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    // User-facing output stays on println!; tracing carries the safety log.
    let _telemetry = telemetry::init_tracing("legbridge", &cfg.log_level);

    for problem in cfg.validate() {
        println!("  {} {}", "Warning:".yellow(), problem);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    let robot = Arc::new(SimRobot::new().with_nickname(cfg.robot_host.clone()));
    let session = match Session::new(robot, cfg.session.clone()) {
        Ok(session) => session,
        Err(e) => {
            println!("{}: {}", "Invalid session config".red(), e);
            println!("  {}", e.suggested_fix().dimmed());
            std::process::exit(1);
        }
    };
    info!(session_id = %session.id(), robot = %cfg.robot_host, "Session ready (simulated robot)");

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    let handle = runtime.handle().clone();
    let ctrlc_session = session.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping the robot …".yellow().bold());
        shutdown_flag.store(true, Ordering::SeqCst);

        if handle.block_on(ctrlc_session.state()) != LifecycleState::Disconnected {
            match handle.block_on(ctrlc_session.disconnect()) {
                Ok(()) => println!("{}", "  ✓ Motion stopped, lease released.".green()),
                Err(e) => println!("  {} {}", "✗".red(), e),
            }
        }
        println!("{}", "  ✓ Exiting legbridge.".green());
        std::process::exit(130);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will not release the robot");
    }

    println!();
    println!(
        "  Robot {} (simulated). Type {} for a list of commands.\n",
        cfg.robot_host.bold(),
        "/help".bold().cyan()
    );

    repl::run(runtime.handle(), &session, shutdown);
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║      legbridge First-Run Wizard      ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up legbridge.\n");

    let mut cfg = config::Config::default();

    cfg.robot_host = prompt_line(
        &format!("  Robot host [{}]: ", cfg.robot_host),
        &cfg.robot_host,
    );
    cfg.robot_username = prompt_line("  Robot username []: ", "");
    cfg.robot_password = Zeroizing::new(prompt_line("  Robot password []: ", ""));

    let level = prompt_line(&format!("  Log level [{}]: ", cfg.log_level), &cfg.log_level);
    cfg.log_level = level.to_ascii_lowercase();

    config::apply_env_overrides(&mut cfg);
    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   __          ___      _    __        "#.bold().cyan());
    println!("{}", r#"  / /__ ___ _ / _ )____(_)__/ /__ ____ "#.bold().cyan());
    println!("{}", r#" / / -_) _ `// _  / __/ / _  / _ `/ -_)"#.bold().cyan());
    println!("{}", r#"/_/\__/\_, //____/_/ /_/\_,_/\_, /\__/ "#.bold().cyan());
    println!("{}", r#"      /___/                 /___/      "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "legbridge".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Tele-operation safety supervisor for legged robots");
    println!();
}

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
