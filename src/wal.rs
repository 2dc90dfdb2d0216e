use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Bytes of framing around each payload: length prefix plus CRC.
const FRAME_OVERHEAD: u64 = 8;

/// Write one frame and return its size on disk.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large for WAL frame"))?;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(len as u64 + FRAME_OVERHEAD)
}

/// Result of reading a WAL file from the start.
#[derive(Debug, Default)]
pub struct Replay {
    pub events: Vec<Event>,
    /// Length of the prefix made of intact frames.
    pub valid_len: u64,
    /// Bytes past `valid_len` that were ignored (torn or corrupt tail).
    pub discarded: u64,
}

/// Append-only ledger log.
///
/// Format per entry: `[u32 len][bincode Event][u32 crc32]`, little endian.
/// Replay stops at the first torn or corrupt frame; `open` cuts the file back
/// to the intact prefix so later appends stay readable.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// End of the last frame written, buffered or not.
    len: u64,
    appends_since_compact: u64,
}

/// Position to roll back to if a batch fails part way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalMark {
    len: u64,
    appends: u64,
}

impl Wal {
    /// Open (or create) the log at `path`, truncating any torn tail.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let on_disk = file.metadata()?.len();
        let valid = Self::scan(path)?.valid_len;
        if valid < on_disk {
            tracing::warn!(
                path = %path.display(),
                discarded = on_disk - valid,
                "truncating torn WAL tail"
            );
            file.set_len(valid)?;
            file.sync_all()?;
        }
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            len: valid,
            appends_since_compact: 0,
        })
    }

    /// Append and fsync in one go. Production code batches through
    /// `append_buffered` + `flush_sync`.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.len += encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    pub fn mark(&self) -> WalMark {
        WalMark {
            len: self.len,
            appends: self.appends_since_compact,
        }
    }

    /// Forget every frame written after `mark`, whether it is still in the
    /// buffer or already synced. The log ends at `mark` afterwards.
    pub fn rollback(&mut self, mark: WalMark) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it on drop.
        let (stale_file, _unwritten) = stale.into_parts();
        drop(stale_file);

        let file = self.writer.get_ref();
        file.set_len(mark.len)?;
        file.sync_all()?;
        self.len = mark.len;
        self.appends_since_compact = mark.appends;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a snapshot of events to the side file and fsync it. Slow; runs
    /// without blocking appends.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let file = File::create(Self::tmp_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Rename the side file over the log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event in the log. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let replay = Self::scan(path)?;
        if replay.discarded > 0 {
            tracing::warn!(
                path = %path.display(),
                discarded = replay.discarded,
                recovered = replay.events.len(),
                "WAL replay stopped at a torn or corrupt frame"
            );
        }
        Ok(replay.events)
    }

    pub fn scan(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e),
        };
        let total = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut out = Replay::default();

        while let Some(event) = read_frame(&mut reader, total - out.valid_len)? {
            let (event, frame_len) = event;
            out.events.push(event);
            out.valid_len += frame_len;
        }
        out.discarded = total - out.valid_len;
        Ok(out)
    }
}

/// One frame from `reader`, or `None` at a clean end, a torn frame, or a
/// corrupt one. `remaining` bounds the payload allocation.
fn read_frame(reader: &mut impl Read, remaining: u64) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as u64;
    if len + FRAME_OVERHEAD > remaining {
        return Ok(None);
    }

    let mut payload = vec![0u8; len as usize];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Some((event, len + FRAME_OVERHEAD))),
        Err(_) => Ok(None),
    }
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
