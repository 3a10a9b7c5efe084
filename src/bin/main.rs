use std::{error::Error, io::IsTerminal, process};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stagehand::{
    cancel::CancellationToken,
    cli::{Cli, Commands, parse_args},
    config::load_config,
    logs, runtime,
    supervisor::Supervisor,
};

fn main() {
    let args = parse_args();
    init_logging(&args);

    if let Err(err) = run(args) {
        error!("{err}");
        eprintln!("Error: {err}");
        process::exit(1);
    }
}

fn run(args: Cli) -> Result<(), Box<dyn Error>> {
    match args.command {
        Commands::Start { config, detach } => {
            let supervisor = build_supervisor(&config)?;
            register_signal_handler(supervisor.cancellation_token())?;
            start(&supervisor, detach)?;
        }
        Commands::Stop { config } => {
            let supervisor = build_supervisor(&config)?;
            stop(&supervisor)?;
        }
        Commands::Restart { config, detach } => {
            let supervisor = build_supervisor(&config)?;
            register_signal_handler(supervisor.cancellation_token())?;
            let healthy = supervisor.restart()?;
            println!("Restarted {} service(s)", healthy.len());
            follow(&supervisor, detach)?;
        }
        Commands::Status {
            config,
            json,
            no_color,
        } => {
            let supervisor = build_supervisor(&config)?;
            let report = supervisor.status()?;
            if json {
                println!("{}", report.to_json()?);
            } else {
                let color = !no_color && std::io::stdout().is_terminal();
                print!("{}", report.render_table(color));
            }
        }
        Commands::Logs {
            service,
            lines,
            kind,
        } => match logs::tail_logs(&runtime::log_dir(), &service, kind, lines)? {
            Some(tail) => {
                for line in tail {
                    println!("{line}");
                }
            }
            None => warn!("No {kind} output recorded for service '{service}'"),
        },
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout is reserved for command output such as `status --json`.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn build_supervisor(config_path: &str) -> Result<Supervisor, Box<dyn Error>> {
    let config = load_config(Some(config_path))?;
    Ok(Supervisor::from_config(&config)?)
}

fn start(supervisor: &Supervisor, detach: bool) -> Result<(), Box<dyn Error>> {
    let running = supervisor.running_services()?;
    if !running.is_empty() {
        return Err(format!(
            "services already running: {}; run `stagehand stop` first",
            running.join(", ")
        )
        .into());
    }

    let healthy = supervisor.start()?;
    println!("Started {} service(s)", healthy.len());
    follow(supervisor, detach)
}

/// Unless detached, monitors in the foreground until Ctrl-C and then stops everything.
fn follow(supervisor: &Supervisor, detach: bool) -> Result<(), Box<dyn Error>> {
    if detach {
        return Ok(());
    }

    info!("Monitoring services; press Ctrl-C to stop");
    supervisor.spawn_monitor(None).join();

    info!("Shutting down");
    stop(supervisor)
}

fn stop(supervisor: &Supervisor) -> Result<(), Box<dyn Error>> {
    let report = supervisor.stop()?;
    for timeout in &report.escalated {
        println!("{timeout}");
    }
    if !report.is_clean() {
        let failed: Vec<_> = report.failures.iter().map(|(id, _)| id.as_str()).collect();
        return Err(format!("failed to stop: {}", failed.join(", ")).into());
    }
    Ok(())
}

/// Ctrl-C cancels the session: startup aborts with rollback, the monitor returns and
/// `start` proceeds to an ordered shutdown.
fn register_signal_handler(token: CancellationToken) -> Result<(), Box<dyn Error>> {
    ctrlc::set_handler(move || {
        if token.is_cancelled() {
            eprintln!("stagehand is already shutting down");
            return;
        }
        eprintln!("stagehand is shutting down...");
        token.cancel();
    })?;

    Ok(())
}
