use std::io;
use std::path::PathBuf;

use snafu::{Location, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoreError {
    #[snafu(display("Failed to read {path}"))]
    Read {
        path: PathBuf,
        source: io::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Failed to write {path}"))]
    Write {
        path: PathBuf,
        source: io::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Failed to rename {tmp_path} onto {path}"))]
    Rename {
        tmp_path: PathBuf,
        path: PathBuf,
        source: io::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Failed to parse {path} as JSON"))]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Failed to serialize document for {path}"))]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
