use anyhow::{bail, Context};
use crabview::{CrabViewConfig, SessionState, SessionStatus, StreamSessionController, StreamTarget};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;

const USAGE: &str = "Usage: crabview-cli <command> [args]

Commands:
  watch <camera_id> <site_id> [--config <path>] [--json]
  show-config [--config <path>]";

fn main() -> anyhow::Result<()> {
    crabview::init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    }

    let command = &args[1];
    match command.as_str() {
        "watch" => cmd_watch(&args),
        "show-config" => cmd_show_config(&args),
        "-h" | "--help" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        _ => {
            eprintln!("Unknown command: {}\n\n{}", command, USAGE);
            std::process::exit(1);
        }
    }
}

/// Splits `args[2..]` into positionals, `--config <path>` and `--json`.
fn parse_args(args: &[String]) -> anyhow::Result<(Vec<String>, Option<PathBuf>, bool)> {
    let mut positional = Vec::new();
    let mut config = None;
    let mut json = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let path = args.get(i).context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            "--json" => json = true,
            flag if flag.starts_with("--") => bail!("Unknown option: {}", flag),
            value => positional.push(value.to_string()),
        }
        i += 1;
    }
    Ok((positional, config, json))
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<CrabViewConfig> {
    let path = path.or_else(|| {
        let default = CrabViewConfig::default_path();
        default.exists().then_some(default)
    });
    CrabViewConfig::load_layered(path).context("loading configuration")
}

fn cmd_show_config(args: &[String]) -> anyhow::Result<()> {
    let (_, path, _) = parse_args(args)?;
    let config = load_config(path)?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

fn cmd_watch(args: &[String]) -> anyhow::Result<()> {
    let (positional, path, json) = parse_args(args)?;
    let [camera_id, site_id] = positional.as_slice() else {
        eprintln!("Usage: crabview-cli watch <camera_id> <site_id> [--config <path>] [--json]");
        std::process::exit(1);
    };

    let config = load_config(path)?;
    let target = StreamTarget::new(camera_id.as_str(), site_id.as_str());
    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(watch(target, config, json))
}

async fn watch(target: StreamTarget, config: CrabViewConfig, json: bool) -> anyhow::Result<()> {
    let interrupted = Arc::new(Notify::new());
    let notify = interrupted.clone();
    ctrlc::set_handler(move || notify.notify_one()).context("installing Ctrl-C handler")?;

    let controller = StreamSessionController::new(
        target,
        config.stream_dependencies()?,
        config.controller_options(),
    );
    let mut status = controller.subscribe();

    if let Err(e) = controller.start().await {
        controller.stop().await;
        return Err(e).context("starting stream session");
    }
    log::info!("Watching; press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = interrupted.notified() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                print_status(&current, json)?;
                if current.state == SessionState::Error {
                    log::warn!("Session gave up; press Ctrl-C to exit");
                }
            }
        }
    }

    controller.stop().await;
    print_status(&controller.status(), json)?;
    Ok(())
}

fn print_status(status: &SessionStatus, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(status)?);
        return Ok(());
    }

    let mut line = format!(
        "{} {:<13} camera={} session={}",
        status.updated_at.format("%H:%M:%S%.3f"),
        status.state.as_str(),
        status.target.camera_id,
        status.session_id.as_deref().unwrap_or("-"),
    );
    if status.retry_attempt > 0 {
        line.push_str(&format!(" retry={}", status.retry_attempt));
    }
    if let Some(error) = &status.last_error {
        line.push_str(&format!(" error=\"{}\"", error));
    }
    println!("{}", line);
    Ok(())
}
