//! The append-only transaction journal: the durable source of truth for
//! certificate issuance (spec section 4.3).
//!
//! One file, opened in append mode, one self-describing text line per
//! committed grant. A record is durable once `append()` returns: the bytes
//! are written and the file descriptor is synced before the engine may ack
//! the caller.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// An internal (non-final) line failed to parse. Fatal at startup.
    Corrupt { line_number: usize, reason: String },
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "journal io error: {e}"),
            Error::Corrupt { line_number, reason } => {
                write!(f, "journal corrupt at line {line_number}: {reason}")
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// One committed transaction, as recorded in the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub class_tag: String,
    pub certificate_number: u64,
    pub amount: u32,
    pub holder_name: String,
}

impl Record {
    fn parse(line: &str, line_number: usize) -> Result<Record> {
        let mut parts = line.splitn(4, ' ');
        let corrupt = |reason: &str| Error::Corrupt {
            line_number,
            reason: reason.to_string(),
        };

        let class_tag = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| corrupt("missing class_tag"))?;
        let certificate_number: u64 = parts
            .next()
            .ok_or_else(|| corrupt("missing certificate_number"))?
            .parse()
            .map_err(|_| corrupt("certificate_number not an integer"))?;
        let amount: u32 = parts
            .next()
            .ok_or_else(|| corrupt("missing amount"))?
            .parse()
            .map_err(|_| corrupt("amount not an integer"))?;
        let holder_name = parts.next().ok_or_else(|| corrupt("missing holder_name"))?;

        Ok(Record {
            class_tag: class_tag.to_string(),
            certificate_number,
            amount,
            holder_name: holder_name.to_string(),
        })
    }

    fn render(&self) -> String {
        format!(
            "{} {} {} {}\n",
            self.class_tag, self.certificate_number, self.amount, self.holder_name
        )
    }
}

/// Handle to the open journal file, positioned for appending.
#[derive(Debug)]
pub struct Journal {
    file: File,
    path: PathBuf,
}

impl Journal {
    /// Open (creating if absent) the journal at `path`, truncating a torn
    /// final write, and return the handle plus every valid record replayed
    /// in file order.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<(Journal, Vec<Record>)> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        truncate_torn_write(&mut file)?;

        let records = replay(&mut file)?;

        // `truncate_torn_write`/`replay` seek around the file; make sure
        // subsequent writes land at the (possibly-truncated) end.
        file.seek(SeekFrom::End(0))?;

        Ok((Journal { file, path }, records))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and block until it is durable (write + fsync).
    /// This is the engine's commit point: `append` returning `Ok(())` is
    /// the only signal that a grant may be acknowledged to its caller.
    pub fn append(&mut self, record: &Record) -> Result<()> {
        if record.holder_name.contains(['\n', '\r']) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "holder_name must not contain newline or carriage return",
            )));
        }

        let line = record.render();
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// If the file's last line lacks a trailing newline, it is a torn write
/// (the process died mid-`write_all`); truncate it away before replay.
fn truncate_torn_write(file: &mut File) -> Result<()> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }

    let mut last_byte = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last_byte)?;

    if last_byte[0] != b'\n' {
        let mut buf = Vec::with_capacity(len as usize);
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut buf)?;
        let torn_start = buf.iter().rposition(|&b| b == b'\n').map(|p| p + 1).unwrap_or(0);
        file.set_len(torn_start as u64)?;
    }

    Ok(())
}

fn replay(file: &mut File) -> Result<Vec<Record>> {
    file.seek(SeekFrom::Start(0))?;
    let reader = BufReader::new(&mut *file);
    let mut records = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        records.push(Record::parse(&line, idx + 1)?);
    }

    Ok(records)
}
