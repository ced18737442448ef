//! Append-only log
//!
//! Every committed mutation is appended as one self-contained record, an
//! array of length-prefixed strings:
//!
//! ```text
//! *3\r\n$3\r\nset\r\n$1\r\nk\r\n$1\r\nv\r\n
//! *5\r\n$3\r\nset\r\n$1\r\nk\r\n$1\r\nv\r\n$2\r\nae\r\n$13\r\n1700000000000\r\n
//! *2\r\n$3\r\ndel\r\n$1\r\nk\r\n
//! *1\r\n$7\r\nflushdb\r\n
//! ```
//!
//! `ae` carries an absolute expiration in unix milliseconds. The reader also
//! accepts `ex <seconds>`, relative to the time of reading.

use super::item::{Item, from_unix_millis, to_unix_millis};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Largest accepted array length and bulk string length.
const MAX_ARGS: usize = 5;
const MAX_BULK_LEN: usize = 512 * 1024 * 1024; // 512MB

/// One logged mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Set {
        key: String,
        value: String,
        expires_at: Option<SystemTime>,
    },
    Del {
        key: String,
    },
    Flush,
}

impl Record {
    pub fn set(item: &Item) -> Self {
        Record::Set {
            key: item.key.clone(),
            value: item.value.clone(),
            expires_at: item.expires_at,
        }
    }

    /// Append the encoded record to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Record::Set {
                key,
                value,
                expires_at: None,
            } => {
                write_array_header(buf, 3);
                write_bulk(buf, b"set");
                write_bulk(buf, key.as_bytes());
                write_bulk(buf, value.as_bytes());
            }
            Record::Set {
                key,
                value,
                expires_at: Some(at),
            } => {
                write_array_header(buf, 5);
                write_bulk(buf, b"set");
                write_bulk(buf, key.as_bytes());
                write_bulk(buf, value.as_bytes());
                write_bulk(buf, b"ae");
                write_bulk(buf, to_unix_millis(*at).to_string().as_bytes());
            }
            Record::Del { key } => {
                write_array_header(buf, 2);
                write_bulk(buf, b"del");
                write_bulk(buf, key.as_bytes());
            }
            Record::Flush => {
                write_array_header(buf, 1);
                write_bulk(buf, b"flushdb");
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

fn write_array_header(buf: &mut Vec<u8>, len: usize) {
    buf.push(b'*');
    buf.extend_from_slice(len.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
}

fn write_bulk(buf: &mut Vec<u8>, data: &[u8]) {
    buf.push(b'$');
    buf.extend_from_slice(data.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

/// Why reading stopped before the end of input.
#[derive(Debug)]
pub enum ReadError {
    /// Input ended inside a record; everything before `valid_len` is intact.
    Truncated { valid_len: u64 },
    /// A record is malformed at `offset`.
    Corrupt { offset: u64, reason: String },
    Io(io::Error),
}

/// Sequential record reader.
pub struct RecordReader<R> {
    reader: R,
    /// Bytes consumed by complete records.
    offset: u64,
    /// Bytes consumed in the current record so far.
    pending: u64,
    now: SystemTime,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            offset: 0,
            pending: 0,
            now: SystemTime::now(),
        }
    }

    /// Bytes covered by the records returned so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next record, or `Ok(None)` at a clean end of input.
    pub fn next_record(&mut self) -> Result<Option<Record>, ReadError> {
        self.pending = 0;

        let header = match self.read_line()? {
            Some(line) => line,
            None if self.pending == 0 => return Ok(None),
            None => return Err(self.truncated()),
        };
        let count = self.parse_prefixed(&header, b'*')?;
        if count == 0 || count > MAX_ARGS {
            return Err(self.corrupt(format!("bad argument count {count}")));
        }

        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            args.push(self.read_bulk()?);
        }

        let record = self.build(args)?;
        self.offset += self.pending;
        self.pending = 0;
        Ok(Some(record))
    }

    fn build(&self, mut args: Vec<String>) -> Result<Record, ReadError> {
        let command = args[0].to_ascii_lowercase();
        match (command.as_str(), args.len()) {
            ("set", 3 | 5) => {
                let expires_at = if args.len() == 5 {
                    let amount = args.pop().unwrap_or_default();
                    let kind = args.pop().unwrap_or_default().to_ascii_lowercase();
                    let amount: u64 = amount
                        .parse()
                        .map_err(|_| self.corrupt(format!("bad expiration '{amount}'")))?;
                    let at = match kind.as_str() {
                        "ae" => from_unix_millis(amount),
                        "ex" => self.now.checked_add(Duration::from_secs(amount)),
                        _ => return Err(self.corrupt(format!("unknown set option '{kind}'"))),
                    };
                    let at =
                        at.ok_or_else(|| self.corrupt("expiration out of range".to_string()))?;
                    Some(at)
                } else {
                    None
                };
                let value = args.pop().unwrap_or_default();
                let key = args.pop().unwrap_or_default();
                Ok(Record::Set {
                    key,
                    value,
                    expires_at,
                })
            }
            ("del", 2) => Ok(Record::Del {
                key: args.pop().unwrap_or_default(),
            }),
            ("flushdb", 1) => Ok(Record::Flush),
            _ => Err(self.corrupt(format!("unknown command '{command}' with {} args", args.len()))),
        }
    }

    fn read_bulk(&mut self) -> Result<String, ReadError> {
        let header = self.read_line()?.ok_or_else(|| self.truncated())?;
        let len = self.parse_prefixed(&header, b'$')?;
        if len > MAX_BULK_LEN {
            return Err(self.corrupt(format!("bulk string too large: {len}")));
        }

        let mut data = vec![0u8; len + 2];
        match self.reader.read_exact(&mut data) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(self.truncated()),
            Err(e) => return Err(ReadError::Io(e)),
        }
        self.pending += data.len() as u64;

        if !data.ends_with(b"\r\n") {
            return Err(self.corrupt("bulk string not terminated".to_string()));
        }
        data.truncate(len);
        String::from_utf8(data).map_err(|_| self.corrupt("bulk string is not utf-8".to_string()))
    }

    /// A full `\r\n` terminated line without its terminator. `None` when
    /// input ends first.
    fn read_line(&mut self) -> Result<Option<Vec<u8>>, ReadError> {
        let mut line = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut line)
            .map_err(ReadError::Io)?;
        self.pending += n as u64;
        if n == 0 || !line.ends_with(b"\n") {
            return Ok(None);
        }
        if !line.ends_with(b"\r\n") {
            return Err(self.corrupt("line not terminated by CRLF".to_string()));
        }
        line.truncate(line.len() - 2);
        Ok(Some(line))
    }

    fn parse_prefixed(&self, line: &[u8], prefix: u8) -> Result<usize, ReadError> {
        if line.first() != Some(&prefix) {
            return Err(self.corrupt(format!("expected '{}'", prefix as char)));
        }
        std::str::from_utf8(&line[1..])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| self.corrupt("bad length".to_string()))
    }

    fn truncated(&self) -> ReadError {
        ReadError::Truncated {
            valid_len: self.offset,
        }
    }

    fn corrupt(&self, reason: String) -> ReadError {
        ReadError::Corrupt {
            offset: self.offset,
            reason,
        }
    }
}

/// The log file opened for appending.
#[derive(Debug)]
pub struct AppendLog {
    file: File,
    path: PathBuf,
    size: u64,
}

impl AppendLog {
    /// Open or create the log. Writes always land at the end.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self { file, path, size })
    }

    /// A log whose appends always fail.
    #[cfg(test)]
    pub(crate) fn open_read_only<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, path, size })
    }

    /// A second handle for reading from the start.
    pub fn reader(&self) -> io::Result<File> {
        File::open(&self.path)
    }

    /// Append a batch of encoded records. On failure the file is cut back to
    /// its previous length so a partial batch never precedes later appends.
    pub fn append(&mut self, buf: &[u8]) -> io::Result<()> {
        if let Err(e) = self.file.write_all(buf) {
            let _ = self.file.set_len(self.size);
            return Err(e);
        }
        self.size += buf.len() as u64;
        Ok(())
    }

    /// Drop everything after `len`.
    pub fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)?;
        self.size = len;
        Ok(())
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record that the open file was renamed to `path`.
    pub(crate) fn set_path<P: AsRef<Path>>(&mut self, path: P) {
        self.path = path.as_ref().to_path_buf();
    }
}
