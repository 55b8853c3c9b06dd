use leaktrace_core::export::{AttackConfig, Column, ExportError, ExportLayout, Exporter};
use leaktrace_core::filter::{ByteOrder, PackFormat, PackType};
use leaktrace_core::trace::TraceStore;
use log::info;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors of the Daredevil export.
#[derive(Debug, Error)]
pub enum DaredevilError {
    /// Writing a file failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Daredevil cannot read samples of this format.
    #[error("Filter {filter:?}: Daredevil cannot read samples of format {format}")]
    UnsupportedFormat {
        /// Filter name
        filter: String,
        /// Sample format of the filter
        format: PackFormat,
    },
    /// The attack name cannot be used in a file name.
    #[error("Attack name {0:?} is not a valid file name component")]
    InvalidAttackName(String),
    /// The filter name cannot be used in a file name.
    #[error("Filter name {0:?} is not a valid file name component")]
    InvalidFilterName(String),
    /// The store cannot be exported.
    #[error(transparent)]
    Export(#[from] ExportError),
}

/// How samples are laid out in the `.trace` file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SampleEncoding {
    /// Every bit of every packed sample byte becomes one file byte holding 0 or 1, least
    /// significant bit first. A one-byte sample spans eight columns of type `i`.
    #[default]
    Bitwise,
    /// Packed samples as they are, one column per sample.
    Raw,
}

/// Exporter writing Daredevil input files into a directory.
///
/// For every exported filter `F` it writes:
///
/// - `F.trace`: the samples, one row per trace
/// - `F.input`: the plaintexts, one row per trace
/// - `F.output`: the outputs, one row per trace
/// - `F.<attack>.config`: one configuration per attack
///
/// Samples are bit-serialized by default, see [`SampleEncoding`].
#[derive(Clone, Debug)]
pub struct DaredevilExporter {
    dir: PathBuf,
    threads: usize,
    encoding: SampleEncoding,
}

impl DaredevilExporter {
    /// Creates an exporter writing into `dir`, which must exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DaredevilExporter {
            dir: dir.into(),
            threads: 8,
            encoding: SampleEncoding::default(),
        }
    }

    /// Sets the number of threads Daredevil is configured to use.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Sets the layout of the sample files.
    pub fn encoding(mut self, encoding: SampleEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Sample type and number of trace file columns of `column`.
    fn columns_of(&self, column: &Column) -> Option<(char, usize)> {
        match self.encoding {
            SampleEncoding::Bitwise => match column.format.ty {
                PackType::F32 | PackType::F64 => None,
                _ => Some(('i', column.samples * column.width() * 8)),
            },
            SampleEncoding::Raw => trace_type(column.format).map(|t| (t, column.samples)),
        }
    }

    fn path(&self, filter: &str, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", filter, suffix))
    }

    fn config(
        &self,
        column: &Column,
        layout: &ExportLayout,
        attack: &AttackConfig,
        trace_type: char,
        nsamples: usize,
    ) -> String {
        let traces = layout.traces();
        let mut lines = vec![
            "[Traces]".to_string(),
            "files=1".to_string(),
            format!("trace_type={}", trace_type),
            "transpose=true".to_string(),
            "index=0".to_string(),
            format!("nsamples={}", nsamples),
            format!(
                "trace={} {} {}",
                self.path(&column.name, "trace").display(),
                traces,
                nsamples
            ),
            String::new(),
            "[Guesses]".to_string(),
            "files=1".to_string(),
            "guess_type=u".to_string(),
            "transpose=true".to_string(),
            format!(
                "guess={} {} {}",
                self.path(&column.name, "input").display(),
                traces,
                layout.plaintext_len()
            ),
            String::new(),
            "[General]".to_string(),
            format!("threads={}", self.threads),
            "order=1".to_string(),
            "return_type=double".to_string(),
            format!("algorithm={}", attack.algorithm),
            format!("position={}", attack.position),
            "round=0".to_string(),
            "bitnum=none".to_string(),
            "bytenum=all".to_string(),
        ];
        if let Some(key) = layout.fixed_key() {
            lines.push(format!("correct_key=0x{}", hex::encode(key)));
        }
        lines.push("memory=4G".to_string());
        lines.push("top=20".to_string());
        lines.push(String::new());
        lines.join("\n")
    }
}

/// Daredevil sample type of `format` in raw files.
///
/// Daredevil reads raw little-endian samples of one byte or IEEE floats.
fn trace_type(format: PackFormat) -> Option<char> {
    match (format.ty, format.order) {
        (PackType::U8, _) => Some('u'),
        (PackType::I8, _) => Some('i'),
        (PackType::F32, ByteOrder::Little) => Some('f'),
        (PackType::F64, ByteOrder::Little) => Some('d'),
        _ => None,
    }
}

fn is_file_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\0'])
}

/// Expands every byte into eight bytes holding its bits, least significant first.
fn bits(row: &[u8]) -> Vec<u8> {
    row.iter()
        .flat_map(|b| (0..8).map(move |i| (b >> i) & 1))
        .collect()
}

fn write_rows<'a>(path: &Path, rows: impl Iterator<Item = &'a [u8]>) -> io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    for row in rows {
        file.write_all(row)?;
    }
    file.flush()
}

impl Exporter for DaredevilExporter {
    type Error = DaredevilError;

    fn export(
        &mut self,
        store: &TraceStore,
        layout: &ExportLayout,
        configs: &[AttackConfig],
    ) -> Result<(), Self::Error> {
        let types = layout
            .columns()
            .iter()
            .map(|c| {
                self.columns_of(c)
                    .ok_or_else(|| DaredevilError::UnsupportedFormat {
                        filter: c.name.clone(),
                        format: c.format,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(column) = layout
            .columns()
            .iter()
            .find(|c| !is_file_component(&c.name))
        {
            return Err(DaredevilError::InvalidFilterName(column.name.clone()));
        }
        if let Some(attack) = configs.iter().find(|a| !is_file_component(&a.name)) {
            return Err(DaredevilError::InvalidAttackName(attack.name.clone()));
        }

        for (column, (trace_type, nsamples)) in layout.columns().iter().zip(types) {
            let samples = store.iter().map(|t| t.leakage()[column.position].bytes());
            match self.encoding {
                SampleEncoding::Bitwise => {
                    let rows: Vec<Vec<u8>> = samples.map(bits).collect();
                    write_rows(
                        &self.path(&column.name, "trace"),
                        rows.iter().map(Vec::as_slice),
                    )?
                }
                SampleEncoding::Raw => write_rows(&self.path(&column.name, "trace"), samples)?,
            }
            write_rows(
                &self.path(&column.name, "input"),
                store.iter().map(|t| t.input().plaintext.as_slice()),
            )?;
            write_rows(
                &self.path(&column.name, "output"),
                store.iter().map(|t| t.output()),
            )?;
            for attack in configs {
                let config = self.config(column, layout, attack, trace_type, nsamples);
                std::fs::write(
                    self.path(&column.name, &format!("{}.config", attack.name)),
                    config,
                )?;
            }
            info!(
                "Wrote Daredevil files for {} ({} traces x {} columns)",
                column.name,
                layout.traces(),
                nsamples
            );
        }
        Ok(())
    }
}
