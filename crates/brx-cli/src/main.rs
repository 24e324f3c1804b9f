//! 🚀 brx-cli: the front door of the billing roll-up agent.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary parses arguments, sets up logging, loads config, and then lets the library
//! do the heavy lifting. Like a manager. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// 🧾 Roll daily billing indexes up into monthly and yearly summaries.
#[derive(Debug, Parser)]
#[command(name = "brx", version, about)]
struct Args {
    /// 🔧 TOML config file. Skipped (env vars only) when it does not exist.
    #[arg(short, long, default_value = "brx.toml")]
    config: PathBuf,

    /// 🎯 Run exactly one cycle, print the report, and exit.
    #[arg(long)]
    once: bool,

    /// 📡 Debug logging for brx when RUST_LOG is not set.
    #[arg(short, long)]
    verbose: bool,
}

/// 🚀 main(): parse, log, load, run, and, if it comes to that, explain what broke.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match std::env::var_os("RUST_LOG") {
        Some(_) => EnvFilter::from_default_env(),
        None if args.verbose => EnvFilter::new("brx=debug,info"),
        None => EnvFilter::new("info"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let result = run(&args).await;

    // 💀 Error handling: the part where we find out what went wrong
    // and print it in a way that's helpful at 3am
    if let Err(err) = result {
        error!("💀 error: {}", err);
        // -- 🧅 peel the onion of sadness, one layer at a time
        let mut the_vibes_are_giving_connection_issues = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            let cause_str = cause.to_string();
            if cause_str.contains("error sending request")
                || cause_str.contains("connection refused")
                || cause_str.contains("Connection refused")
                || cause_str.contains("tcp connect error")
                || cause_str.contains("dns error")
            {
                the_vibes_are_giving_connection_issues = true;
            }
        }

        if the_vibes_are_giving_connection_issues {
            error!(
                "🔧 hint: looks like a service isn't reachable. \
                Double-check that Elasticsearch and the pipeline API are actually running \
                and that the URLs in the config point at them. If you're using Docker, try \
                `docker ps` to see what's up. Even servers need a nudge sometimes. ☕"
            );
        }

        std::process::exit(1);
    }

    Ok(())
}

async fn run(args: &Args) -> Result<()> {
    // 🔒 Validate the config file exists before we get too emotionally attached
    let config_file = args.config.as_path();
    let config_file = match config_file.try_exists().with_context(|| {
        format!(
            "💀 Could not check whether the configuration file exists. Was checking here: '{}'",
            config_file.display()
        )
    })? {
        true => Some(config_file),
        false => {
            info!(path = %config_file.display(), "📭 no config file, using BRX_* environment variables only");
            None
        }
    };

    let app_config = brx::app_config::load_config(config_file)
        .context("💀 Couldn't load the configuration. Check the file and the BRX_* variables.")?;

    if args.once {
        let report = brx::run_once(app_config).await?;
        println!("{}", report.render_table());
        if !report.is_clean() {
            error!(
                failed = report.failures().count(),
                "⚠️ cycle finished with isolated failures; the watermark still advanced"
            );
        }
        Ok(())
    } else {
        brx::run(app_config).await
    }
}
