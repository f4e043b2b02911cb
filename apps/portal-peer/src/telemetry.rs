pub mod logging {
    //! Process-wide log output for the `portal-peer` binary.

    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;

    use clap::ValueEnum;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    /// Verbosity of the peer layer's own events.
    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    /// Crates whose trace output drowns the layer's own.
    const NOISY_AT_TRACE: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_sctp",
        "webrtc_dtls",
        "webrtc_mdns",
        "tungstenite",
        "tokio_tungstenite",
    ];

    static WRITER: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global subscriber writing to stderr or, when configured,
    /// appending to a file. Only the first call has any effect.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if WRITER.get().is_some() {
            return Ok(());
        }

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let directives = std::env::var("PORTAL_LOG_FILTER")
            .unwrap_or_else(|_| directives_for(config.level, dependency_traces_wanted()));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(directives))
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = WRITER.set(guard);
        Ok(())
    }

    /// Filter directives for `level`. Above `info` the layer's targets get the
    /// extra detail while everything else stays at `info`.
    fn directives_for(level: LogLevel, dependency_traces: bool) -> String {
        let mut directives = match level {
            LogLevel::Error => "error".to_owned(),
            LogLevel::Warn => "warn".to_owned(),
            LogLevel::Info => "info".to_owned(),
            LogLevel::Debug => "info,portal=debug,portal_peer=debug".to_owned(),
            LogLevel::Trace => "info,portal=trace,portal_peer=trace".to_owned(),
        };
        if level == LogLevel::Trace && !dependency_traces {
            for target in NOISY_AT_TRACE {
                directives.push_str(&format!(",{target}=info"));
            }
        }
        directives
    }

    fn dependency_traces_wanted() -> bool {
        std::env::var("PORTAL_TRACE_DEPS").is_ok_and(|value| !value.is_empty() && value != "0")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn debug_raises_only_the_layer() {
            assert_eq!(
                directives_for(LogLevel::Debug, false),
                "info,portal=debug,portal_peer=debug"
            );
            assert_eq!(directives_for(LogLevel::Warn, false), "warn");
        }

        #[test]
        fn trace_keeps_dependencies_at_info_unless_asked() {
            let quiet = directives_for(LogLevel::Trace, false);
            assert!(quiet.starts_with("info,portal=trace"));
            assert!(quiet.contains(",webrtc_ice=info"));

            assert_eq!(
                directives_for(LogLevel::Trace, true),
                "info,portal=trace,portal_peer=trace"
            );
        }
    }
}
