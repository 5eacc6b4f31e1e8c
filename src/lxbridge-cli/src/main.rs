use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use lxbridge_core::{init_logging, AppDirs, Config, InvocationResult, LogLevel, LoggingGuard};
use lxbridge_plugin::{parse_args, run_query, RunOptions, ScriptHost};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(
    name = "lxbridge",
    version,
    about = "Resolve a stream URL by running an LX Music source script",
    override_usage = "lxbridge [OPTIONS] <SCRIPT> <SOURCE> <SONG_ID> <QUALITY> <INFO_JSON>"
)]
struct Cli {
    /// Give up on the script after this many seconds (overrides config)
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
    /// Log verbosity on stderr: trace, debug, info, warn, error (overrides config)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<LogLevel>,
    /// Script path, source id, song id, quality and musicInfo JSON
    #[arg(value_name = "QUERY", trailing_var_arg = true)]
    query: Vec<String>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(secs) = self.timeout {
            config.runtime.timeout_secs = Some(secs);
        }
    }
}

/// Settings for one run plus whatever went wrong while gathering them.
struct Bootstrap {
    config: Config,
    dirs: Option<AppDirs>,
    config_error: Option<anyhow::Error>,
}

fn bootstrap() -> Bootstrap {
    let dirs = match AppDirs::discover() {
        Ok(dirs) => dirs,
        Err(err) => {
            return Bootstrap {
                config: Config::default(),
                dirs: None,
                config_error: Some(err.into()),
            }
        }
    };
    match Config::load_or_default(&dirs)
        .with_context(|| format!("ignoring config at {}", dirs.config_path().display()))
    {
        Ok(config) => Bootstrap {
            config,
            dirs: Some(dirs),
            config_error: None,
        },
        Err(err) => Bootstrap {
            config: Config::default(),
            dirs: Some(dirs),
            config_error: Some(err),
        },
    }
}

fn start_logging(config: &Config, dirs: Option<&AppDirs>) -> Option<LoggingGuard> {
    let fallback;
    let dirs = match dirs {
        Some(dirs) => dirs,
        None => {
            fallback = AppDirs::rooted_at(&std::env::temp_dir().join(lxbridge_core::APP_NAME));
            &fallback
        }
    };
    match init_logging(&config.logging, dirs) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("lxbridge: logging disabled: {err}");
            None
        }
    }
}

fn execute(query: &[String], timeout: Option<Duration>) -> Result<InvocationResult> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let options = RunOptions { timeout };
    Ok(runtime.block_on(run_query(query, &options, ScriptHost::new)))
}

fn emit(result: &InvocationResult) {
    println!("{}", result.to_line());
}

/// Run the parsed command line. Too few positionals short-circuit before
/// `bootstrap` so an invalid call reads and writes nothing.
fn run(cli: &Cli, bootstrap: impl FnOnce() -> Bootstrap) -> InvocationResult {
    if parse_args(&cli.query).is_none() {
        return InvocationResult::InvalidInput;
    }

    let Bootstrap {
        mut config,
        dirs,
        config_error,
    } = bootstrap();
    cli.apply_overrides(&mut config);
    let _logging = start_logging(&config, dirs.as_ref());
    if let Some(err) = config_error {
        tracing::warn!(error = %format!("{err:#}"), "using default configuration");
    }

    match execute(&cli.query, config.runtime.timeout()) {
        Ok(result) => result,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "query aborted");
            InvocationResult::failure(format!("{err:#}"))
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            eprintln!("{}", err.render());
            emit(&InvocationResult::InvalidInput);
            return ExitCode::SUCCESS;
        }
    };

    emit(&run(&cli, bootstrap));
    ExitCode::SUCCESS
}
