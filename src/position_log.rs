//! The per-session position file.
//!
//! One file per output directory, `position.txt`, appended to at the end of
//! every recorded session:
//!
//! ```text
//! POSITION DATA\r\n
//! <elapsed seconds>;<cyclic distance>\r\n
//! ...
//! ```
//!
//! Concluding several sessions into the same directory appends several such
//! blocks, each starting with its own header.

use std::{
    borrow::Cow,
    fmt,
    fs::OpenOptions,
    io::{BufRead, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

/// Name of the position file inside the chosen output directory.
pub const POSITION_FILE_NAME: &str = "position.txt";

/// First line of every block in the position file.
pub const HEADER: &str = "POSITION DATA";

const LINE_END: &str = "\r\n";

/// One recorded tick: seconds since the session started and how far the
/// subject had travelled in the maze.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceSample {
    /// Seconds since the session started.
    pub elapsed_secs: f64,
    /// Cyclic distance at that tick.
    pub cyclic_distance: f64,
}

impl DistanceSample {
    /// Shorthand constructor.
    pub fn new(elapsed_secs: f64, cyclic_distance: f64) -> Self {
        Self {
            elapsed_secs,
            cyclic_distance,
        }
    }
}

/// Errors raised while writing or reading a position file.
#[derive(Debug)]
pub enum PositionLogError {
    /// Returned when io fails when reading or writing files.
    IoError(std::io::Error),
    /// Returned when a block does not start with [`HEADER`].
    MissingHeader,
    /// Returned when a data line is not two `;`-separated numbers.
    BadLine(usize, String),
}

impl fmt::Display for PositionLogError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use PositionLogError as PLE;
        let msg = match self {
            PLE::IoError(error) => Cow::from(format!("io error: {}", error)),
            PLE::MissingHeader => Cow::from("position file does not start with a header"),
            PLE::BadLine(n, line) => Cow::from(format!("bad sample on line {}: {:?}", n, line)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for PositionLogError {}

impl From<std::io::Error> for PositionLogError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value)
    }
}

/// The position file that belongs to `output_dir`.
pub fn position_file(output_dir: impl AsRef<Path>) -> PathBuf {
    output_dir.as_ref().join(POSITION_FILE_NAME)
}

/// Append a header and `samples` to the file at `path`, creating it if
/// needed.
pub fn append_to_path(
    path: impl AsRef<Path>,
    samples: &[DistanceSample],
) -> Result<(), PositionLogError> {
    let handle = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(handle);
    write_block(&mut writer, samples)?;
    writer.flush()?;
    Ok(())
}

/// Write one header-plus-samples block to the [Write]able object provided.
pub fn write_block(
    out: &mut impl Write,
    samples: &[DistanceSample],
) -> Result<(), PositionLogError> {
    write!(out, "{}{}", HEADER, LINE_END)?;
    for sample in samples {
        write!(
            out,
            "{};{}{}",
            sample.elapsed_secs, sample.cyclic_distance, LINE_END
        )?;
    }
    Ok(())
}

/// Read every block back from the file at `path`.
pub fn read_from_path(path: impl AsRef<Path>) -> Result<Vec<Vec<DistanceSample>>, PositionLogError> {
    let handle = std::fs::File::open(path)?;
    read_blocks(handle)
}

/// Read every block back from the [Read]able object provided.
pub fn read_blocks(input: impl Read) -> Result<Vec<Vec<DistanceSample>>, PositionLogError> {
    let mut blocks: Vec<Vec<DistanceSample>> = Vec::new();

    for (n, line) in BufReader::new(input).lines().enumerate() {
        let line = line?;
        let line = line.trim_end_matches('\r');
        if line == HEADER {
            blocks.push(Vec::new());
            continue;
        }
        if line.is_empty() {
            continue;
        }
        let block = blocks.last_mut().ok_or(PositionLogError::MissingHeader)?;
        block.push(parse_line(line).ok_or_else(|| PositionLogError::BadLine(n + 1, line.to_owned()))?);
    }

    Ok(blocks)
}

fn parse_line(line: &str) -> Option<DistanceSample> {
    let (elapsed, distance) = line.split_once(';')?;
    Some(DistanceSample::new(
        elapsed.trim().parse().ok()?,
        distance.trim().parse().ok()?,
    ))
}
