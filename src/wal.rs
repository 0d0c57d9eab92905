use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Leading bytes of every log file. Bumped whenever `Event` changes shape.
const MAGIC: &[u8; 8] = b"RBOOKWL1";

/// Length prefix plus checksum around every payload.
const ENTRY_OVERHEAD: u64 = 8;

/// Encode a single event as `[len][bincode][crc32]`.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Fill `buf`, or report a clean end of input. A partial read counts as the end.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

enum Entry {
    /// An intact event and the number of bytes it occupied.
    Event(Event, u64),
    End,
    /// Length, checksum or payload did not check out.
    Corrupt,
}

/// Read one entry. `remaining` is how many bytes the file still holds; a length
/// prefix claiming more than that is a torn tail, never an allocation.
fn read_entry(reader: &mut impl Read, remaining: u64) -> io::Result<Entry> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(Entry::End);
    }
    let len = u32::from_le_bytes(len_buf) as u64;
    let size = ENTRY_OVERHEAD + len;
    if size > remaining {
        return Ok(Entry::End);
    }
    let mut payload = vec![0u8; len as usize];
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut crc_buf)? {
        return Ok(Entry::End);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Entry::Corrupt);
    }
    Ok(bincode::deserialize(&payload).map_or(Entry::Corrupt, |event| Entry::Event(event, size)))
}

/// Append-only write-ahead log of [`Event`]s.
///
/// Layout: `MAGIC`, then per entry `[u32 len][bincode Event][u32 crc32]`, little endian.
/// A torn or corrupt tail left by a crash is dropped on replay; everything before it survives.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    /// File length after the last successful `flush_sync`.
    durable_len: u64,
    durable_appends: u64,
}

impl Wal {
    /// Open (or create) the WAL at `path` for appending, first cutting it back to
    /// `intact_len`, the end of the last intact entry as reported by [`Wal::recover`].
    /// Without the cut, new entries would land behind a torn tail and be lost on
    /// the next replay.
    pub fn open_at(path: &Path, intact_len: u64) -> io::Result<Self> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        if len < MAGIC.len() as u64 || intact_len < MAGIC.len() as u64 {
            // New file, or a crash before the header made it to disk
            file.set_len(0)?;
            file.write_all(MAGIC)?;
            file.sync_all()?;
        } else if len > intact_len {
            tracing::warn!(
                path = %path.display(),
                discarded = len - intact_len,
                "truncating WAL tail"
            );
            file.set_len(intact_len)?;
            file.sync_all()?;
        }
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            durable_len,
            durable_appends: 0,
        })
    }

    /// Recover, then open.
    #[cfg(test)]
    pub fn open(path: &Path) -> io::Result<Self> {
        let (_, intact_len) = Self::recover(path)?;
        Self::open_at(path, intact_len)
    }

    /// Append a single event and fsync. Production code goes through
    /// `append_buffered` + `flush_sync` so a batch shares one fsync.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len = self.writer.get_ref().metadata()?.len();
        self.durable_appends = self.appends_since_compact;
        Ok(())
    }

    /// Drop everything appended since the last successful `flush_sync`: the
    /// buffered bytes are discarded unwritten and the file is cut back to its
    /// durable length.
    pub fn rollback(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it on drop
        drop(stale.into_parts());
        let file = self.writer.get_ref();
        file.set_len(self.durable_len)?;
        file.sync_all()?;
        self.appends_since_compact = self.durable_appends;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write `events` to a temp file next to the WAL and fsync it. The slow phase.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        writer.write_all(MAGIC)?;
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the WAL and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        self.durable_appends = 0;
        Ok(())
    }

    /// Both compaction phases at once.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Read every intact event from `path`. A missing file is an empty log;
    /// a file with a foreign header is an error.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::recover(path).map(|(events, _)| events)
    }

    /// Like [`Wal::replay`], also returning the byte length of the intact
    /// prefix: header plus every entry before a torn or corrupt tail.
    pub fn recover(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; MAGIC.len()];
        if !read_full(&mut reader, &mut magic)? {
            return Ok((Vec::new(), 0));
        }
        if &magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is not a roombook WAL", path.display()),
            ));
        }

        let mut events = Vec::new();
        let mut offset = MAGIC.len() as u64;
        loop {
            match read_entry(&mut reader, file_len - offset)? {
                Entry::Event(event, size) => {
                    events.push(event);
                    offset += size;
                }
                Entry::End if offset == file_len => break,
                Entry::End | Entry::Corrupt => {
                    tracing::warn!(
                        path = %path.display(),
                        kept = events.len(),
                        discarded = file_len - offset,
                        "discarding torn or corrupt WAL tail"
                    );
                    break;
                }
            }
        }
        Ok((events, offset))
    }
}
