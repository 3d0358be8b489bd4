//! REPL – the operator console.
//!
//! Supported slash-commands:
//!   /connect, /disconnect          – acquire / release lease and e-stop
//!   /power on|off, /stand, /sit    – one-shot robot commands
//!   /walk vx vy yaw [secs] [gait]  – hold a velocity, refreshed every 100 ms
//!   /pose height roll pitch yaw    – set the body pose
//!   /anim <kind> [amp] [speed]     – start an animation; `/anim stop` ends it
//!   /stop                          – zero all motion
//!   /estop, /estop release         – software emergency stop
//!   /status, /diagnose             – session state and health checks
//!   /help, /quit | /exit

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use legbridge_kernel::VelocityRequest;
use legbridge_runtime::{CheckStatus, Session};
use legbridge_types::{
    AnimationKind, AnimationParams, BridgeError, EventPayload, LifecycleState, LocomotionHint,
    PoseDelta,
};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;

/// Re-submission period of `/walk`, well inside the command expiry window.
const WALK_REFRESH: Duration = Duration::from_millis(100);
const MAX_WALK_SECS: f64 = 30.0;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect,
    Disconnect,
    Power(bool),
    Stand,
    Sit,
    Walk { request: VelocityRequest, secs: f64 },
    Pose(PoseDelta),
    Animate(AnimationKind, AnimationParams),
    StopAnimation,
    Stop,
    Estop,
    ReleaseEstop,
    Status,
    Diagnose,
    Help,
    Quit,
}

/// Parse one input line.  Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let cmd = match (head, args.as_slice()) {
        ("/connect", []) => Command::Connect,
        ("/disconnect", []) => Command::Disconnect,
        ("/power", ["on"]) => Command::Power(true),
        ("/power", ["off"]) => Command::Power(false),
        ("/stand", []) => Command::Stand,
        ("/sit", []) => Command::Sit,
        ("/walk", [vx, vy, yaw, rest @ ..]) if rest.len() <= 2 => {
            let mut request = VelocityRequest::new(number(vx)?, number(vy)?, number(yaw)?);
            let secs = match rest.first() {
                Some(s) => number(s)?,
                None => 1.0,
            };
            if !(secs > 0.0 && secs <= MAX_WALK_SECS) {
                return Err(format!("walk duration must be in (0, {MAX_WALK_SECS}] seconds"));
            }
            if let Some(code) = rest.get(1) {
                let code: u8 = code
                    .parse()
                    .map_err(|_| format!("'{code}' is not a gait code"))?;
                let hint = LocomotionHint::from_code(code)
                    .ok_or_else(|| format!("unknown gait code {code}"))?;
                request = request.with_hint(hint);
            }
            Command::Walk { request, secs }
        }
        ("/pose", [h, r, p, y]) => {
            Command::Pose(PoseDelta::new(number(h)?, number(r)?, number(p)?, number(y)?))
        }
        ("/anim", ["stop"]) => Command::StopAnimation,
        ("/anim", [kind, rest @ ..]) if rest.len() <= 2 => {
            let kind: AnimationKind = kind.parse().map_err(|e: BridgeError| e.to_string())?;
            let mut params = AnimationParams::default();
            if let Some(amp) = rest.first() {
                params.amplitude = number(amp)?;
            }
            if let Some(speed) = rest.get(1) {
                params.speed = number(speed)?;
            }
            Command::Animate(kind, params)
        }
        ("/stop", []) => Command::Stop,
        ("/estop", []) => Command::Estop,
        ("/estop", ["release"]) => Command::ReleaseEstop,
        ("/status", []) => Command::Status,
        ("/diagnose", []) => Command::Diagnose,
        ("/help", []) => Command::Help,
        ("/quit" | "/exit", []) => Command::Quit,
        (other, _) => return Err(format!("Unknown or malformed command '{other}'")),
    };
    Ok(Some(cmd))
}

fn number(raw: &str) -> Result<f64, String> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("'{raw}' is not a number"))
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(runtime: &Handle, session: &Session, shutdown: Arc<AtomicBool>) {
    spawn_event_printer(runtime, session);
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "legbridge>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let cmd = match parse(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(e) => {
                println!("{} Type {} for available commands.", e.red(), "/help".bold());
                continue;
            }
        };
        if cmd == Command::Quit {
            shutdown.store(true, Ordering::SeqCst);
            break;
        }
        runtime.block_on(execute(session, cmd));
    }

    // Leaving the console always leaves the robot stopped and released.
    if runtime.block_on(session.state()) != LifecycleState::Disconnected {
        report("disconnect", runtime.block_on(session.disconnect()));
    }
    println!("{}", "Goodbye.".green());
}

async fn execute(session: &Session, cmd: Command) {
    match cmd {
        Command::Connect => report("connect", session.connect().await),
        Command::Disconnect => report("disconnect", session.disconnect().await),
        Command::Power(true) => report("power on", session.power_on().await),
        Command::Power(false) => report("power off", session.power_off().await),
        Command::Stand => report("stand", session.stand().await),
        Command::Sit => report("sit", session.sit().await),
        Command::Walk { request, secs } => walk(session, request, secs).await,
        Command::Pose(pose) => report("pose", session.submit_pose(pose).await.map(|_| ())),
        Command::Animate(kind, params) => {
            report(kind.as_str(), session.start_animation(kind, params).await)
        }
        Command::StopAnimation => match session.stop_animation().await {
            Ok(Some(kind)) => println!("  {} {} stopped", "✓".green().bold(), kind),
            Ok(None) => println!("  {}", "no animation running".dimmed()),
            Err(e) => print_error(&e),
        },
        Command::Stop => report("stop", session.stop_motion().await),
        Command::Estop => report("emergency stop", session.emergency_stop().await),
        Command::ReleaseEstop => report("e-stop release", session.release_estop().await),
        Command::Status => print_status(session).await,
        Command::Diagnose => print_diagnosis(session).await,
        Command::Help => cmd_help(),
        Command::Quit => {}
    }
}

/// Key-hold walking: re-submit until `secs` elapse, then go quiet and let the
/// watchdog bring the robot to rest.
async fn walk(session: &Session, request: VelocityRequest, secs: f64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(secs);
    let mut ticker = tokio::time::interval(WALK_REFRESH);
    let mut sent = 0u32;
    while tokio::time::Instant::now() < deadline {
        ticker.tick().await;
        match session.submit_velocity(request).await {
            Ok(cmd) if sent == 0 => {
                let v = cmd.velocity();
                println!(
                    "  {} walking vx={:.2} vy={:.2} yaw={:.2} for {secs:.1}s",
                    "▶".green(),
                    v.vx,
                    v.vy,
                    v.yaw_rate
                );
                sent += 1;
            }
            Ok(_) => sent += 1,
            Err(e) => {
                print_error(&e);
                return;
            }
        }
    }
    println!("  {} released after {sent} submissions", "■".yellow());
}

fn report(what: &str, result: Result<(), BridgeError>) {
    match result {
        Ok(()) => println!("  {} {}", "✓".green().bold(), what),
        Err(e) => print_error(&e),
    }
}

fn print_error(e: &BridgeError) {
    println!("  {} {}", "✗".red().bold(), e.to_string().red());
    println!("    {}", e.suggested_fix().dimmed());
}

async fn print_status(session: &Session) {
    let status = session.get_status().await;
    println!("{}", "Session Status".bold().underline());
    println!("  Session   : {}", status.session_id.to_string().dimmed());
    println!("  Lifecycle : {}", status.lifecycle_state.to_string().yellow());
    println!("  Lease     : {:?}", status.lease_status);
    println!("  E-Stop    : {:?}", status.estop_status);
    println!("  Powered   : {}  Standing: {}", status.powered, status.standing);
    println!("  Motion    : {}", if status.motion_active { "active" } else { "idle" });
    if let Some(kind) = status.animation {
        println!("  Animation : {}", kind.to_string().cyan());
    }
    if let Some(robot) = &status.robot {
        println!(
            "  Robot     : {} ({}) battery {:.0}%",
            robot.nickname, robot.serial_number, robot.battery_percent
        );
    }
    if let Some(fault) = &status.last_fault {
        println!("  Last fault: {}", fault.red());
    }
}

async fn print_diagnosis(session: &Session) {
    let report = session.diagnose().await;
    println!("{}", "Diagnostics".bold().underline());
    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "🟢".green(),
            CheckStatus::Warn => "🟡".yellow(),
            CheckStatus::Fail => "🔴".red(),
        };
        println!("  {} {:<16} {}", marker, check.name.bold(), check.detail);
        if let Some(fix) = &check.fix {
            println!("     {}", fix.dimmed());
        }
    }
    let summary = if report.healthy {
        report.summary.green()
    } else {
        report.summary.red()
    };
    println!("  {}", summary);
}

/// Surface safety events as they happen, between prompts.
fn spawn_event_printer(runtime: &Handle, session: &Session) {
    let mut events = session.subscribe();
    runtime.spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match event.payload {
                    EventPayload::WatchdogStop { reason } => {
                        println!("\n  {} watchdog stop ({:?})", "■".yellow(), reason)
                    }
                    EventPayload::KeepaliveFailure { channel, consecutive, error } => println!(
                        "\n  {} {} keepalive failed ({} in a row): {}",
                        "⚠".yellow(),
                        channel,
                        consecutive,
                        error.dimmed()
                    ),
                    EventPayload::SessionFaulted { cause } => {
                        println!("\n  {} session faulted: {}", "✗".red().bold(), cause.red())
                    }
                    EventPayload::LifecycleChanged { .. } | EventPayload::EmergencyStop { .. } => {}
                },
                Err(RecvError::Lagged(n)) => {
                    println!("\n  {} {} events dropped", "⚠".yellow(), n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn cmd_help() {
    println!();
    println!("{}", "legbridge Commands".bold().underline());
    println!("  {}        – acquire lease and e-stop", "/connect".bold().cyan());
    println!("  {}     – stop, release and disconnect", "/disconnect".bold().cyan());
    println!("  {}   – power the motors", "/power on|off".bold().cyan());
    println!("  {}     – stand up / sit down", "/stand  /sit".bold().cyan());
    println!(
        "  {} – walk (m/s, rad/s) for secs, optional gait code",
        "/walk vx vy yaw [secs] [gait]".bold().cyan()
    );
    println!("  {}  – body pose (m, rad)", "/pose h roll pitch yaw".bold().cyan());
    println!(
        "  {}  – start bounce|sway|twist|swagger|tail_wag, or stop",
        "/anim <kind> [amp] [speed] | /anim stop".bold().cyan()
    );
    println!("  {}           – zero all motion", "/stop".bold().cyan());
    println!("  {} – software emergency stop", "/estop [release]".bold().cyan());
    println!("  {}  – session state and health", "/status  /diagnose".bold().cyan());
    println!("  {}    – stop, disconnect and exit", "/quit  /exit".bold().cyan());
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_line_is_not_a_command() {
        assert_eq!(parse("   \n"), Ok(None));
    }

    #[test]
    fn walk_defaults_to_one_second() {
        let cmd = parse("/walk 0.3 0 -0.1").unwrap().unwrap();
        assert_eq!(
            cmd,
            Command::Walk {
                request: VelocityRequest::new(0.3, 0.0, -0.1),
                secs: 1.0
            }
        );
    }

    #[test]
    fn walk_rejects_bad_duration_and_gait() {
        assert!(parse("/walk 0.3 0 0 0").is_err());
        assert!(parse("/walk 0.3 0 0 60").is_err());
        assert!(parse("/walk 0.3 0 0 2 250").is_err());
        assert!(parse("/walk 0.3 nan 0").is_err());
    }

    #[test]
    fn pose_needs_four_numbers() {
        assert_eq!(
            parse("/pose 0.05 0 0.1 0").unwrap(),
            Some(Command::Pose(PoseDelta::new(0.05, 0.0, 0.1, 0.0)))
        );
        assert!(parse("/pose 0.05 0 0.1").is_err());
    }

    #[test]
    fn animation_commands_parse() {
        assert_eq!(parse("/anim stop").unwrap(), Some(Command::StopAnimation));
        match parse("/anim tail-wag 0.5 3").unwrap() {
            Some(Command::Animate(kind, params)) => {
                assert_eq!(kind, AnimationKind::TailWag);
                assert_eq!(params.amplitude, 0.5);
                assert_eq!(params.speed, 3.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse("/anim moonwalk").is_err());
    }

    #[test]
    fn estop_and_power_variants() {
        assert_eq!(parse("/estop").unwrap(), Some(Command::Estop));
        assert_eq!(parse("/estop release").unwrap(), Some(Command::ReleaseEstop));
        assert_eq!(parse("/power off").unwrap(), Some(Command::Power(false)));
        assert!(parse("/power sideways").is_err());
        assert_eq!(parse("/exit").unwrap(), Some(Command::Quit));
    }

    #[tokio::test(start_paused = true)]
    async fn walk_keeps_the_robot_moving_then_the_watchdog_stops_it() {
        use legbridge_hal::SimRobot;
        use legbridge_runtime::SessionConfig;

        let robot = Arc::new(SimRobot::new());
        let session = Session::new(robot.clone(), SessionConfig::default()).unwrap();
        for cmd in [Command::Connect, Command::Power(true), Command::Stand] {
            execute(&session, cmd).await;
        }
        execute(
            &session,
            Command::Walk {
                request: VelocityRequest::new(0.4, 0.0, 0.0),
                secs: 0.5,
            },
        )
        .await;
        assert!(session.get_status().await.motion_active);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!session.get_status().await.motion_active);
        assert!(robot.last_command().unwrap().is_stationary());
        execute(&session, Command::Disconnect).await;
    }
}
