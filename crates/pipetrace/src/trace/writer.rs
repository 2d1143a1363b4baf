use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use parking_lot::Mutex;

use super::{escape_into, TraceError, TraceValue};

const PROLOG: &str = "<?xml version='1.0' encoding='UTF-8'?>\n\
<?xml-stylesheet type='text/xsl' href='trace.xsl'?>\n\
<trace version='0.1'>\n";
const EPILOG: &str = "</trace>\n";

struct Stream {
    out: Option<Box<dyn Write + Send>>,
    next_no: u64,
    broken: bool,
}

/// The trace stream: one XML document of `<call>` records.
///
/// Records are assembled off-lock by [`CallRecord`] and appended whole, so records from different
/// threads never interleave. I/O failures are logged once; after that the stream is dead and
/// recording silently becomes a no-op.
pub struct TraceWriter {
    stream: Mutex<Stream>,
}

impl TraceWriter {
    /// Start a document on `out`.
    pub fn new(mut out: Box<dyn Write + Send>) -> Result<Self, TraceError> {
        out.write_all(PROLOG.as_bytes())?;
        out.flush()?;
        Ok(Self {
            stream: Mutex::new(Stream {
                out: Some(out),
                next_no: 0,
                broken: false,
            }),
        })
    }

    pub fn create(path: &Path) -> Result<Self, TraceError> {
        let file = File::create(path).map_err(|source| TraceError::Open {
            path: path.to_owned(),
            source,
        })?;
        Self::new(Box::new(BufWriter::new(file)))
    }

    /// A writer that numbers records but keeps none of them.
    pub fn discard() -> Self {
        Self {
            stream: Mutex::new(Stream {
                out: Some(Box::new(io::sink())),
                next_no: 0,
                broken: false,
            }),
        }
    }

    pub fn begin_call(&self, class: &'static str, method: &'static str) -> CallRecord<'_> {
        CallRecord {
            writer: self,
            class,
            method,
            body: String::new(),
            committed: false,
        }
    }

    /// Number of records committed so far.
    pub fn calls(&self) -> u64 {
        self.stream.lock().next_no
    }

    pub fn is_closed(&self) -> bool {
        self.stream.lock().out.is_none()
    }

    /// Terminate the document. Later records are dropped.
    pub fn close(&self) {
        let mut stream = self.stream.lock();
        let Some(mut out) = stream.out.take() else {
            return;
        };
        if stream.broken {
            return;
        }
        let res = out.write_all(EPILOG.as_bytes()).and_then(|()| out.flush());
        if let Err(err) = res {
            tracing::error!("failed to close trace stream: {err}");
        }
    }

    pub fn flush(&self) {
        let mut stream = self.stream.lock();
        if stream.broken {
            return;
        }
        if let Some(out) = stream.out.as_mut() {
            if let Err(err) = out.flush() {
                tracing::error!("failed to flush trace stream: {err}");
                stream.broken = true;
            }
        }
    }

    fn commit(&self, class: &str, method: &str, body: &str) {
        let mut stream = self.stream.lock();
        let no = stream.next_no;
        let Stream { out, broken, .. } = &mut *stream;
        let Some(out) = out.as_mut() else {
            return;
        };
        if *broken {
            return;
        }

        let mut record = String::with_capacity(body.len() + 64);
        record.push_str("\t<call no='");
        record.push_str(&no.to_string());
        record.push_str("' class='");
        escape_into(&mut record, class);
        record.push_str("' method='");
        escape_into(&mut record, method);
        record.push_str("'>");
        record.push_str(body);
        record.push_str("</call>\n");

        if let Err(err) = out.write_all(record.as_bytes()) {
            tracing::error!(no, "trace stream write failed, further records are dropped: {err}");
            *broken = true;
            return;
        }
        stream.next_no += 1;
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// One call being recorded.
///
/// Committed by [`CallRecord::end`], or on drop if `end` was never reached.
pub struct CallRecord<'a> {
    writer: &'a TraceWriter,
    class: &'static str,
    method: &'static str,
    body: String,
    committed: bool,
}

impl CallRecord<'_> {
    pub fn arg(&mut self, name: &str, value: impl Into<TraceValue>) -> &mut Self {
        self.body.push_str("<arg name='");
        escape_into(&mut self.body, name);
        self.body.push_str("'>");
        value.into().write_xml(&mut self.body);
        self.body.push_str("</arg>");
        self
    }

    pub fn ret(&mut self, value: impl Into<TraceValue>) -> &mut Self {
        self.body.push_str("<ret>");
        value.into().write_xml(&mut self.body);
        self.body.push_str("</ret>");
        self
    }

    pub fn end(mut self) {
        self.commit();
    }

    fn commit(&mut self) {
        if !self.committed {
            self.committed = true;
            self.writer.commit(self.class, self.method, &self.body);
        }
    }
}

impl Drop for CallRecord<'_> {
    fn drop(&mut self) {
        self.commit();
    }
}
