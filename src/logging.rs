//! Logging setup.
//!
//! Library code only talks to the `log` facade. Binaries install `env_logger`
//! through [`init_rust_logging`]; the Python extension instead forwards every
//! record to the standard `logging` module, one Python logger per Rust target
//! (`_core::magnetometer` becomes `_core.magnetometer`).

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

const LEVEL_VAR: &str = "QZFM_LOG";
const FALLBACK_LEVEL_VAR: &str = "RUST_LOG";

static RUST_LOG_ONCE: Once = Once::new();

/// Level from `QZFM_LOG`, then `RUST_LOG`, default `info`.
pub fn env_level() -> LevelFilter {
    [LEVEL_VAR, FALLBACK_LEVEL_VAR]
        .iter()
        .find_map(|var| parse_level(&std::env::var(var).ok()?))
        .unwrap_or(LevelFilter::Info)
}

/// Parse a level name such as `debug` or `WARN`.
pub fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Install the stderr logger for binaries. Later calls are no-ops.
///
/// `QZFM_LOG` takes full `env_logger` filter directives
/// (e.g. `_core::acquisition=debug`); without it `RUST_LOG` applies.
pub fn init_rust_logging() {
    RUST_LOG_ONCE.call_once(|| {
        let fallback =
            std::env::var(FALLBACK_LEVEL_VAR).unwrap_or_else(|_| LevelFilter::Info.to_string());
        env_logger::Builder::from_env(Env::new().filter_or(LEVEL_VAR, fallback))
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .init();
    });
}

#[cfg(feature = "python")]
pub use python_bridge::{init_python_logging, reset_python_logging_cache, set_python_log_level};

#[cfg(feature = "python")]
mod python_bridge {
    use std::collections::HashMap;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;

    use super::env_level;

    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    struct PyLogger {
        max_level: Mutex<LevelFilter>,
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    fn python_level(level: Level) -> u8 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    impl PyLogger {
        fn logger(&self, py: Python<'_>, name: &str) -> PyResult<Py<PyAny>> {
            let mut loggers = lock(&self.loggers);
            if let Some(logger) = loggers.get(name) {
                return Ok(logger.clone_ref(py));
            }
            let logger = py
                .import("logging")?
                .call_method1("getLogger", (name,))?
                .unbind();
            loggers.insert(name.to_string(), logger.clone_ref(py));
            Ok(logger)
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let name = record.target().replace("::", ".");
            let logger = self.logger(py, &name)?;
            let logger = logger.bind(py);
            let level = python_level(record.level());
            if logger.call_method1("isEnabledFor", (level,))?.is_truthy()? {
                logger.call_method1("log", (level, record.args().to_string()))?;
            }
            Ok(())
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= *lock(&self.max_level)
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.print(py);
                }
            });
        }

        fn flush(&self) {}
    }

    fn installed(level: LevelFilter) -> &'static PyLogger {
        PY_LOGGER.get_or_init(|| {
            let logger: &'static PyLogger = Box::leak(Box::new(PyLogger {
                max_level: Mutex::new(level),
                loggers: Mutex::new(HashMap::new()),
            }));
            // Fails if another logger (e.g. env_logger) got there first.
            if log::set_logger(logger).is_ok() {
                log::set_max_level(level);
            }
            logger
        })
    }

    /// Route Rust log records into Python's `logging`. Later calls are no-ops.
    pub fn init_python_logging() {
        installed(env_level());
    }

    /// Change the minimum level forwarded to Python.
    pub fn set_python_log_level(level: LevelFilter) {
        let logger = installed(level);
        *lock(&logger.max_level) = level;
        reset_python_logging_cache();
        log::set_max_level(level);
    }

    /// Forget cached Python loggers (after reconfiguring Python logging).
    pub fn reset_python_logging_cache() {
        if let Some(logger) = PY_LOGGER.get() {
            lock(&logger.loggers).clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_case_insensitively() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level(" WARN "), Some(LevelFilter::Warn));
        assert_eq!(parse_level("loud"), None);
    }
}
