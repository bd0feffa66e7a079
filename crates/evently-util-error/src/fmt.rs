use std::error::Error as StdError;
use std::fmt;

/// Renders an error and its full `source()` chain on one line, joined by
/// `: `. Meant for `tracing` fields (`err = %err.fmt_compact()`) where a
/// `{:?}` dump is too noisy and a bare `{}` drops the causes.
pub struct FmtCompactError<'e>(&'e (dyn StdError + 'static));

impl fmt::Display for FmtCompactError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

pub trait FmtCompact {
    fn fmt_compact(&self) -> FmtCompactError<'_>;
}

impl<E> FmtCompact for E
where
    E: StdError + 'static,
{
    fn fmt_compact(&self) -> FmtCompactError<'_> {
        FmtCompactError(self)
    }
}
