use std::{io, process, time::Duration};

use clap::Parser;
use env_logger::Env;
use narratoctl::{
    cli::{Args, Command},
    lifecycle::{BuildRequest, Lifecycle, LogsRequest, StartOptions},
    Result, Settings,
};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<i32> {
    let mut settings = Settings::load(args.config.as_deref())?;
    settings.apply(&args.overrides());

    let lifecycle = Lifecycle::connect(settings)?;
    let stdout = io::stdout();
    let stderr = io::stderr();

    match args.command {
        Command::Start { build, pull } => {
            let url = lifecycle
                .start(&StartOptions { build, pull }, &mut stdout.lock())
                .await?;
            println!("NarratoAI is starting on {}", url);
        }
        Command::Stop => lifecycle.stop().await?,
        Command::Logs {
            follow,
            tail,
            timestamps,
        } => {
            let request = LogsRequest {
                follow,
                tail,
                timestamps,
            };
            lifecycle
                .logs(&request, &mut stdout.lock(), &mut stderr.lock())
                .await?
        }
        Command::Exec { cmd } => {
            let code = lifecycle
                .exec(&cmd, &mut stdout.lock(), &mut stderr.lock())
                .await?;
            return Ok(code as i32);
        }
        Command::Health { wait } => {
            let report = lifecycle.health(wait.map(Duration::from_secs)).await?;
            println!("{}", report);
            if !report.is_healthy() {
                return Ok(1);
            }
        }
        Command::Build { no_cache } => {
            lifecycle
                .build(&BuildRequest { no_cache }, &mut stdout.lock())
                .await?
        }
        Command::Status => match lifecycle.status().await? {
            Some(status) => println!("{}", status),
            None => {
                println!("{} does not exist", lifecycle.settings().container.name);
                return Ok(1);
            }
        },
        Command::Prepare => lifecycle.prepare()?,
        Command::Render => {
            for path in lifecycle.render()? {
                println!("{}", path.display());
            }
        }
        Command::Doctor => {
            let checks = lifecycle.doctor().await;
            for check in &checks {
                let mark = if check.ok { "ok" } else { "FAIL" };
                println!("{:<6} {:<4} {}", check.name, mark, check.detail);
            }
            if checks.iter().any(|c| !c.ok) {
                return Ok(1);
            }
        }
    }
    Ok(0)
}
