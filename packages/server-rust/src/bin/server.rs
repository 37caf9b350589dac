//! `msf-server`: loads configuration, registers the bundled operations and
//! runs the first configured listener.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use msf_core::{ConfigSet, DirectorySource, LogConfig, TracingAuditSink};
use msf_server::app;
use msf_server::listener::queue::backend::MemoryBroker;
use msf_server::{init_logging, LogFormat, ShutdownController};

#[derive(Parser, Debug)]
#[command(name = "msf-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory holding `<name>.json` configuration files. Repeat to
    /// search several; the first match wins.
    #[arg(long = "conf-dir", env = "MSF_CONF_DIR", value_delimiter = ',', default_value = "./conf")]
    conf_dirs: Vec<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let configs = Arc::new(ConfigSet::new(DirectorySource::new(args.conf_dirs)));
    configs.register::<LogConfig>("log", "Log levels, globally and per module.")?;
    let log_config = configs.load_or_default::<LogConfig>("log")?;
    init_logging(&log_config, args.log_format)?;

    let broker = MemoryBroker::new();
    let listeners = app::build_listeners(&configs, Arc::new(broker.connector()))?;

    let registry = match app::build_registry(Arc::clone(&configs)) {
        Ok(registry) => registry,
        Err(err) => {
            tracing::error!(failures = err.errors.len(), "startup aborted");
            eprintln!("{err}");
            return Ok(ExitCode::FAILURE);
        }
    };
    let pipeline = app::build_pipeline(registry, Arc::new(TracingAuditSink));

    let listener = listeners.select(&configs)?;
    app::run(listener, pipeline, Arc::new(ShutdownController::new())).await?;
    Ok(ExitCode::SUCCESS)
}
