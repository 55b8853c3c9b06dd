use leaktrace_core::export::{AttackConfig, ExportError, ExportLayout, Exporter};
use leaktrace_core::filter::PackFormat;
use leaktrace_core::trace::TraceStore;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

/// File magic.
pub const MAGIC: [u8; 8] = *b"LKTRACE\0";
/// Current format version.
pub const VERSION: u16 = 1;

/// Errors of the columnar format.
#[derive(Debug, Error)]
pub enum ColumnarError {
    /// Reading or writing failed.
    #[error(transparent)]
    Io(io::Error),
    /// The header is not valid JSON.
    #[error("Invalid header: {0}")]
    Json(#[from] serde_json::Error),
    /// The file does not start with [`MAGIC`].
    #[error("Not a columnar trace file")]
    BadMagic,
    /// The file was written by an incompatible version.
    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u16),
    /// The file ends in the middle of the header or a record.
    #[error("Truncated trace file")]
    Truncated,
    /// The store cannot be exported.
    #[error(transparent)]
    Export(#[from] ExportError),
}

impl From<io::Error> for ColumnarError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => ColumnarError::Truncated,
            _ => ColumnarError::Io(e),
        }
    }
}

/// One exported column in the file header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnHeader {
    /// Filter name
    pub name: String,
    /// Sample format
    pub format: PackFormat,
    /// Size of one sample in bytes
    pub width: usize,
    /// Samples per trace
    pub samples: usize,
}

impl ColumnHeader {
    /// Size of the column in one record.
    pub fn size(&self) -> usize {
        self.width * self.samples
    }
}

/// JSON header of a columnar file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnarHeader {
    /// Number of records
    pub traces: usize,
    /// Plaintext size per record
    pub plaintext_len: usize,
    /// Key size per record, 0 if absent
    pub key_len: usize,
    /// Output size per record
    pub output_len: usize,
    /// Exported columns in record order
    pub filters: Vec<ColumnHeader>,
    /// Attack configurations
    pub attacks: Vec<AttackConfig>,
}

impl ColumnarHeader {
    fn new(layout: &ExportLayout, configs: &[AttackConfig]) -> Self {
        ColumnarHeader {
            traces: layout.traces(),
            plaintext_len: layout.plaintext_len(),
            key_len: layout.key_len(),
            output_len: layout.output_len(),
            filters: layout
                .columns()
                .iter()
                .map(|c| ColumnHeader {
                    name: c.name.clone(),
                    format: c.format,
                    width: c.format.width(),
                    samples: c.samples,
                })
                .collect(),
            attacks: configs.to_vec(),
        }
    }

    /// Size of one record in bytes.
    pub fn record_size(&self) -> usize {
        self.plaintext_len
            + self.key_len
            + self.output_len
            + self.filters.iter().map(ColumnHeader::size).sum::<usize>()
    }
}

/// One trace as stored in a columnar file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Plaintext
    pub plaintext: Vec<u8>,
    /// Key, empty if the file has no keys
    pub key: Vec<u8>,
    /// Output
    pub output: Vec<u8>,
    /// Packed samples per column
    pub columns: Vec<Vec<u8>>,
}

/// Parsed columnar file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnarFile {
    /// File header
    pub header: ColumnarHeader,
    /// Records in store order
    pub records: Vec<Record>,
}

/// Exporter writing the columnar format to any writer.
pub struct ColumnarWriter<W: Write> {
    writer: W,
}

impl<W: Write> ColumnarWriter<W> {
    /// Creates a writer.
    pub fn new(writer: W) -> Self {
        ColumnarWriter { writer }
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl ColumnarWriter<BufWriter<File>> {
    /// Creates a writer to a new file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, ColumnarError> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> Exporter for ColumnarWriter<W> {
    type Error = ColumnarError;

    fn export(
        &mut self,
        store: &TraceStore,
        layout: &ExportLayout,
        configs: &[AttackConfig],
    ) -> Result<(), Self::Error> {
        let header = serde_json::to_vec(&ColumnarHeader::new(layout, configs))?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "header too large"))?;
        self.writer.write_all(&MAGIC)?;
        self.writer.write_all(&VERSION.to_le_bytes())?;
        self.writer.write_all(&header_len.to_le_bytes())?;
        self.writer.write_all(&header)?;
        for trace in store {
            let input = trace.input();
            self.writer.write_all(&input.plaintext)?;
            if let Some(key) = &input.key {
                self.writer.write_all(key)?;
            }
            self.writer.write_all(trace.output())?;
            for column in layout.columns() {
                self.writer
                    .write_all(trace.leakage()[column.position].bytes())?;
            }
        }
        self.writer.flush()?;
        info!(
            "Wrote {} columnar records, {} header bytes",
            layout.traces(),
            header.len()
        );
        Ok(())
    }
}

/// Parses a columnar file.
///
/// # Errors
///
/// * [`ColumnarError::BadMagic`] or [`ColumnarError::UnsupportedVersion`] for foreign files
/// * [`ColumnarError::Truncated`] if the file ends early
/// * [`ColumnarError::Json`] for a malformed header
pub fn read_columnar<R: Read>(mut reader: R) -> Result<ColumnarFile, ColumnarError> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(ColumnarError::BadMagic);
    }
    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    let version = u16::from_le_bytes(version);
    if version != VERSION {
        return Err(ColumnarError::UnsupportedVersion(version));
    }
    let mut header_len = [0u8; 4];
    reader.read_exact(&mut header_len)?;
    let mut header = vec![0u8; u32::from_le_bytes(header_len) as usize];
    reader.read_exact(&mut header)?;
    let header: ColumnarHeader = serde_json::from_slice(&header)?;
    debug!(
        "Reading {} records of {} bytes",
        header.traces,
        header.record_size()
    );

    let mut take = |len: usize| -> Result<Vec<u8>, ColumnarError> {
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    };
    let mut records = Vec::with_capacity(header.traces);
    for _ in 0..header.traces {
        let plaintext = take(header.plaintext_len)?;
        let key = take(header.key_len)?;
        let output = take(header.output_len)?;
        let columns = header
            .filters
            .iter()
            .map(|c| take(c.size()))
            .collect::<Result<_, _>>()?;
        records.push(Record {
            plaintext,
            key,
            output,
            columns,
        });
    }
    Ok(ColumnarFile { header, records })
}

#[cfg(test)]
mod tests {
    use super::*;
    use leaktrace_core::export::export;
    use leaktrace_core::filter::LeakValue;
    use leaktrace_core::trace::{FilterLayout, Samples, TraceInput};

    fn store() -> TraceStore {
        let mut store = TraceStore::new(vec![
            FilterLayout {
                name: "data_W".into(),
                format: PackFormat::BYTE,
            },
            FilterLayout {
                name: "addr_W".into(),
                format: "<H".parse().unwrap(),
            },
        ]);
        for i in 0..3u8 {
            let mut data = Samples::default();
            data.push(PackFormat::BYTE, &LeakValue::from(0x40 + i))
                .unwrap();
            let mut addr = Samples::default();
            addr.push("<H".parse().unwrap(), &LeakValue::from(0x1234u16))
                .unwrap();
            store.push(
                TraceInput {
                    plaintext: vec![i; 4],
                    key: Some(vec![0xaa, 0xbb]),
                },
                vec![i ^ 0xff; 2],
                vec![data, addr],
            );
        }
        store
    }

    fn write(store: &TraceStore, filters: &[String]) -> anyhow::Result<Vec<u8>> {
        let mut writer = ColumnarWriter::new(vec![]);
        let attack = AttackConfig::new("attack_sbox", "AES", "LUT/AES_AFTER_SBOX");
        export(&mut writer, store, filters, &[attack])?;
        Ok(writer.into_inner())
    }

    #[test]
    fn test_layout() -> anyhow::Result<()> {
        let bytes = write(&store(), &[])?;
        assert_eq!(&bytes[..8], b"LKTRACE\0");
        assert_eq!(&bytes[8..10], &[1, 0]);
        let header_len = u32::from_le_bytes(bytes[10..14].try_into()?) as usize;
        let file = read_columnar(bytes.as_slice())?;
        assert_eq!(file.header.record_size(), 4 + 2 + 2 + 1 + 2);
        assert_eq!(bytes.len(), 14 + header_len + 3 * file.header.record_size());
        assert_eq!(file.header.attacks[0].position, "LUT/AES_AFTER_SBOX");
        let record = &file.records[1];
        assert_eq!(record.plaintext, vec![1; 4]);
        assert_eq!(record.key, vec![0xaa, 0xbb]);
        assert_eq!(record.output, vec![0xfe; 2]);
        assert_eq!(record.columns, vec![vec![0x41], vec![0x34, 0x12]]);
        Ok(())
    }

    #[test]
    fn test_reexport_is_identical() -> anyhow::Result<()> {
        let store = store();
        assert_eq!(write(&store, &[])?, write(&store, &[])?);
        Ok(())
    }

    #[test]
    fn test_selected_columns() -> anyhow::Result<()> {
        let bytes = write(&store(), &["addr_W".to_string()])?;
        let file = read_columnar(bytes.as_slice())?;
        assert_eq!(file.header.filters.len(), 1);
        assert_eq!(file.header.filters[0].name, "addr_W");
        assert_eq!(file.records[0].columns, vec![vec![0x34, 0x12]]);
        Ok(())
    }

    #[test]
    fn test_corrupt_files() -> anyhow::Result<()> {
        let bytes = write(&store(), &[])?;
        assert!(matches!(
            read_columnar(&bytes[..bytes.len() - 1]),
            Err(ColumnarError::Truncated)
        ));
        let mut foreign = bytes.clone();
        foreign[0] = b'X';
        assert!(matches!(
            read_columnar(foreign.as_slice()),
            Err(ColumnarError::BadMagic)
        ));
        let mut future = bytes;
        future[8] = 2;
        assert!(matches!(
            read_columnar(future.as_slice()),
            Err(ColumnarError::UnsupportedVersion(2))
        ));
        Ok(())
    }

    #[test]
    fn test_write_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("traces.lkt");
        let mut writer = ColumnarWriter::create(&path)?;
        export(&mut writer, &store(), &[], &[])?;
        drop(writer);
        let file = read_columnar(File::open(&path)?)?;
        assert_eq!(file.records.len(), 3);
        assert!(file.header.attacks.is_empty());
        Ok(())
    }
}
