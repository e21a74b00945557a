use std::process;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use faregate::config::{usage, OptionsError, ServerOptions};
use faregate::logging::{FanoutSink, FileSink, LogLevel, Logger, LoggerConfig, StdoutSink};
use faregate::server::CentralServer;
use faregate::shutdown::ShutdownSignal;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);

fn main() {
    let options = match ServerOptions::parse(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(OptionsError::HelpRequested) => {
            println!("{}", usage("faregate"));
            return;
        }
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(1);
        }
    };

    let logger = build_logger_or_exit(&options);

    logger.log(
        LogLevel::Info,
        Some("main"),
        &format!(
            "{} v{} starting (built {})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("FAREGATE_BUILD_DATE_UTC")
        ),
        Some(json!({
            "port": options.port,
            "database": options.database,
            "cert": options.cert,
            "key": options.key,
            "log": options.log,
            "multicast": options.multicast_enabled,
            "multicast_address": options.multicast_address.to_string(),
            "multicast_port": options.multicast_port,
        })),
    );

    let shutdown = ShutdownSignal::install().unwrap_or_else(|error| {
        eprintln!("failed to install signal handlers: {error}");
        process::exit(1);
    });

    let mut server = match CentralServer::start(&options, Arc::clone(&logger), &shutdown) {
        Ok(server) => server,
        Err(error) => {
            logger.error(Some("main"), &format!("server startup error: {error}"));
            process::exit(1);
        }
    };

    logger.info(
        Some("main"),
        &format!("central server is running on {}", server.local_addr()),
    );

    shutdown.wait(SHUTDOWN_POLL_INTERVAL);
    logger.info(Some("main"), "shutdown requested");
    server.stop();
}

fn build_logger_or_exit(options: &ServerOptions) -> Arc<Logger> {
    let file_sink = match FileSink::open(&options.log) {
        Ok(sink) => sink,
        Err(error) => {
            eprintln!("failed to open log file '{}': {error}", options.log);
            process::exit(1);
        }
    };

    let config = LoggerConfig {
        min_level: if options.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        },
        human_friendly: false,
    };
    Arc::new(Logger::with_sink(
        config,
        Arc::new(FanoutSink::new(vec![
            Arc::new(StdoutSink),
            Arc::new(file_sink),
        ])),
    ))
}
