// src/sink/mod.rs

use anyhow::{anyhow, bail, Context, Result};
use csv::WriterBuilder;
use std::{
    fs::File,
    io::Write,
    path::Path,
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, error};

/// An append-only CSV output shared by many tasks.
///
/// Every operation takes the sink's own lock, so concurrent appends never
/// interleave partial records. The header record is owned by the sink and
/// written at most once, before any other record, by whichever caller gets
/// there first.
pub struct CsvSink<W: Write> {
    name: &'static str,
    header: Vec<String>,
    state: Mutex<SinkState<W>>,
}

struct SinkState<W: Write> {
    writer: csv::Writer<W>,
    header_written: bool,
    records: u64,
    failed: bool,
}

impl CsvSink<File> {
    /// Create (or truncate) the file at `path`.
    pub fn create<P: AsRef<Path>>(name: &'static str, path: P, header: &[String]) -> Result<Self> {
        let path = path.as_ref();
        let writer = WriterBuilder::new()
            .from_path(path)
            .with_context(|| format!("creating {} output {}", name, path.display()))?;
        debug!(sink = name, path = %path.display(), "opened sink");
        Ok(Self::from_csv_writer(name, writer, header))
    }
}

impl<W: Write> CsvSink<W> {
    pub fn from_writer(name: &'static str, inner: W, header: &[String]) -> Self {
        Self::from_csv_writer(name, WriterBuilder::new().from_writer(inner), header)
    }

    /// Wrap an already configured csv writer.
    pub fn from_csv_writer(name: &'static str, writer: csv::Writer<W>, header: &[String]) -> Self {
        Self {
            name,
            header: header.to_vec(),
            state: Mutex::new(SinkState {
                writer,
                header_written: false,
                records: 0,
                failed: false,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SinkState<W>>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("{} sink lock poisoned", self.name))
    }

    /// Write the header if nobody has yet. Returns true if this call wrote it.
    pub fn ensure_header(&self) -> Result<bool> {
        let mut state = self.lock()?;
        self.header_locked(&mut state)
    }

    fn header_locked(&self, state: &mut SinkState<W>) -> Result<bool> {
        if state.failed {
            bail!("{} sink is unusable after an earlier write error", self.name);
        }
        if state.header_written {
            return Ok(false);
        }
        if let Err(e) = state.writer.write_record(&self.header) {
            state.failed = true;
            return Err(e).with_context(|| format!("writing {} header", self.name));
        }
        state.header_written = true;
        debug!(sink = self.name, "header written");
        Ok(true)
    }

    /// Append one record, writing the header first if needed.
    pub fn append(&self, record: &[String]) -> Result<()> {
        if record.len() != self.header.len() {
            bail!(
                "{} record has {} fields, expected {}",
                self.name,
                record.len(),
                self.header.len()
            );
        }
        let mut state = self.lock()?;
        self.header_locked(&mut state)?;
        if let Err(e) = state.writer.write_record(record) {
            state.failed = true;
            error!(sink = self.name, error = %e, "write failed");
            return Err(e).with_context(|| format!("appending to {}", self.name));
        }
        state.records += 1;
        Ok(())
    }

    /// Data records appended so far, header excluded.
    pub fn records_written(&self) -> Result<u64> {
        Ok(self.lock()?.records)
    }

    /// A failed flush leaves the sink unusable, like a failed append.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.lock()?;
        if let Err(e) = state.writer.flush() {
            state.failed = true;
            return Err(e).with_context(|| format!("flushing {}", self.name));
        }
        Ok(())
    }

    /// Flush and hand back the underlying writer.
    pub fn into_inner(self) -> Result<W> {
        let name = self.name;
        let state = self
            .state
            .into_inner()
            .map_err(|_| anyhow!("{} sink lock poisoned", name))?;
        state
            .writer
            .into_inner()
            .map_err(|e| anyhow!("flushing {}: {}", name, e.error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io, sync::Arc, thread};

    fn header() -> Vec<String> {
        vec!["a".into(), "b".into()]
    }

    fn record(a: &str, b: &str) -> Vec<String> {
        vec![a.into(), b.into()]
    }

    fn text(sink: CsvSink<Vec<u8>>) -> String {
        String::from_utf8(sink.into_inner().unwrap()).unwrap()
    }

    #[test]
    fn header_written_once_before_records() {
        let sink = CsvSink::from_writer("test", Vec::new(), &header());
        assert!(sink.ensure_header().unwrap());
        assert!(!sink.ensure_header().unwrap());
        sink.append(&record("1", "2")).unwrap();
        assert_eq!(sink.records_written().unwrap(), 1);
        assert_eq!(text(sink), "a,b\n1,2\n");
    }

    #[test]
    fn append_writes_missing_header() {
        let sink = CsvSink::from_writer("test", Vec::new(), &header());
        sink.append(&record("x", "y")).unwrap();
        assert!(!sink.ensure_header().unwrap());
        assert_eq!(text(sink), "a,b\nx,y\n");
    }

    #[test]
    fn rejects_records_of_the_wrong_width() {
        let sink = CsvSink::from_writer("test", Vec::new(), &header());
        let err = sink.append(&["only".to_string()]).unwrap_err();
        assert!(err.to_string().contains("expected 2"));
        sink.append(&record("1", "2")).unwrap();
        assert_eq!(text(sink), "a,b\n1,2\n");
    }

    #[test]
    fn quotes_fields_that_need_it() {
        let sink = CsvSink::from_writer("test", Vec::new(), &header());
        sink.append(&record("a,b", "say \"hi\"")).unwrap();
        assert_eq!(text(sink), "a,b\n\"a,b\",\"say \"\"hi\"\"\"\n");
    }

    #[test]
    fn concurrent_appends_do_not_interleave() {
        let sink = Arc::new(CsvSink::from_writer("test", Vec::new(), &header()));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let sink = Arc::clone(&sink);
                thread::spawn(move || {
                    for i in 0..250 {
                        sink.append(&record(&format!("t{}", t), &format!("{:0>40}", i)))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let sink = Arc::try_unwrap(sink).ok().unwrap();
        assert_eq!(sink.records_written().unwrap(), 2000);
        let out = text(sink);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2001);
        assert_eq!(lines.iter().filter(|l| **l == "a,b").count(), 1);
        assert_eq!(lines[0], "a,b");
        for line in &lines[1..] {
            let parts: Vec<&str> = line.split(',').collect();
            assert_eq!(parts.len(), 2, "malformed line {:?}", line);
            assert!(parts[0].starts_with('t'));
            assert_eq!(parts[1].len(), 40);
        }
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk gone"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk gone"))
        }
    }

    #[test]
    fn io_errors_surface_on_flush() {
        // csv buffers internally, so the failure shows up when the buffer drains
        let sink = CsvSink::from_writer("broken", BrokenWriter, &header());
        sink.append(&record("1", "2")).unwrap();
        assert!(sink.flush().is_err());

        let err = sink.append(&record("3", "4")).unwrap_err();
        assert!(err.to_string().contains("unusable"));
        assert!(sink.ensure_header().is_err());
    }

    #[test]
    fn poisoned_lock_is_reported() {
        let sink = CsvSink::from_writer("test", Vec::new(), &header());
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _state = sink.state.lock().unwrap();
            panic!("writer thread died");
        }));
        assert!(sink.records_written().is_err());
        assert!(sink.append(&record("1", "2")).is_err());
    }

    #[test]
    fn create_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope").join("out.csv");
        assert!(CsvSink::create("aggregate", &path, &header()).is_err());
    }
}
