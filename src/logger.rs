use std::fmt;

/// Four-level log sink used by relay sessions.
///
/// Implementations decide formatting and filtering. `debug` and `trace` may
/// be dropped entirely depending on verbosity.
pub trait Logger: Send + Sync {
    fn info(&self, args: fmt::Arguments<'_>);
    fn warn(&self, args: fmt::Arguments<'_>);
    fn debug(&self, args: fmt::Arguments<'_>);
    fn trace(&self, args: fmt::Arguments<'_>);
}

/// Forwards to `tracing`, so the subscriber set up in `main` handles
/// filtering, colors and the per-connection span prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, args: fmt::Arguments<'_>) {
        tracing::info!("{}", args);
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        tracing::warn!("{}", args);
    }

    fn debug(&self, args: fmt::Arguments<'_>) {
        tracing::debug!("{}", args);
    }

    fn trace(&self, args: fmt::Arguments<'_>) {
        tracing::trace!("{}", args);
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn info(&self, _: fmt::Arguments<'_>) {}
    fn warn(&self, _: fmt::Arguments<'_>) {}
    fn debug(&self, _: fmt::Arguments<'_>) {}
    fn trace(&self, _: fmt::Arguments<'_>) {}
}

/// Lazily renders a buffer for trace output, either as lowercase hex or as
/// lossy UTF-8 text. Nothing is formatted unless the line is emitted.
pub struct ByteDump<'a> {
    bytes: &'a [u8],
    hex: bool,
}

impl<'a> ByteDump<'a> {
    pub fn new(bytes: &'a [u8], hex: bool) -> Self {
        Self { bytes, hex }
    }
}

impl fmt::Display for ByteDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hex {
            for b in self.bytes {
                write!(f, "{:02x}", b)?;
            }
            Ok(())
        } else {
            f.write_str(&String::from_utf8_lossy(self.bytes))
        }
    }
}
