use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use leaktrace::arch::Arch;
use leaktrace::event::KindSet;
use leaktrace::filter::{Condition, Extract, FilterSpec, presets};
use leaktrace::source::{AccessSource, RunParams, SourceError, TargetSpec};
use leaktrace::{
    ExportError, ExportLayout, Filter, PackFormat, SessionConfig, TraceSession, export,
};
use leaktrace_columnar::{ColumnarError, ColumnarWriter, read_columnar};
use leaktrace_scripted::{Script, ScriptedSource};

const PC: u64 = 0x109214;
const TABLE: u64 = 0x4a5f00;

fn target() -> anyhow::Result<TargetSpec> {
    Ok(TargetSpec::new(
        "/opt/wb_aes",
        Arch::Amd64,
        "0x109080-0x109785".parse()?,
    ))
}

fn config(retries: u32, workers: usize) -> SessionConfig {
    SessionConfig {
        retries,
        seed: Some(0x5eed),
        workers,
        ..Default::default()
    }
}

fn session(
    source: impl AccessSource + 'static,
    filters: Vec<Filter>,
    config: SessionConfig,
) -> anyhow::Result<TraceSession> {
    Ok(TraceSession::builder()
        .source(source)
        .target(target()?)
        .filters(filters)
        .config(config)
        .build()?)
}

/// Writes every plaintext byte through a table, like a lookup-table cipher round.
fn table_script(params: &RunParams<'_>) -> Result<Script, SourceError> {
    let plaintext = &params.input.plaintext;
    let mut script = Script::new(plaintext.iter().map(|b| b ^ 0xff).collect::<Vec<_>>());
    for (i, b) in plaintext.iter().enumerate() {
        script = script
            .read(PC, TABLE + u64::from(*b), 1, u128::from(*b))
            .write(PC + 4, 0x7ff000 + i as u64, 4, u128::from(b.wrapping_mul(3)));
    }
    Ok(script)
}

fn columnar(
    store: &leaktrace::trace::TraceStore,
    filters: &[String],
) -> Result<Vec<u8>, ColumnarError> {
    let mut writer = ColumnarWriter::new(vec![]);
    export(&mut writer, store, filters, &[])?;
    Ok(writer.into_inner())
}

#[test]
fn test_single_write_is_sampled() -> anyhow::Result<()> {
    let source = ScriptedSource::new(|_: &RunParams<'_>| {
        Ok(Script::new(vec![0u8; 16]).write(PC, TABLE, 4, 0x0000_0042))
    });
    let session = session(source, vec![presets::by_name("data_W")?], config(0, 1))?;
    let collection = session.run(1)?;

    let store = &collection.store;
    assert_eq!(store.len(), 1);
    let trace = store.get(0).ok_or_else(|| anyhow::anyhow!("missing trace"))?;
    assert_eq!(trace.input().plaintext.len(), 16);
    assert_eq!(trace.output(), &[0u8; 16]);
    let samples = store
        .samples(trace, "data_W")
        .ok_or_else(|| anyhow::anyhow!("missing column"))?;
    assert_eq!(samples.bytes(), &[0x42]);
    assert_eq!(samples.count(), 1);
    Ok(())
}

#[test]
fn test_crashing_run_is_excluded() -> anyhow::Result<()> {
    let source = ScriptedSource::new(|params: &RunParams<'_>| {
        let script = table_script(params)?;
        Ok(if params.run == 2 {
            script.crash_after(3)
        } else {
            script
        })
    });
    let session = session(source, vec![presets::by_name("data_W")?], config(0, 1))?;
    let collection = session.run(5)?;

    assert_eq!(collection.store.len(), 4);
    let report = &collection.report;
    assert_eq!(report.requested, 5);
    assert_eq!(report.collected, 4);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].request, 2);
    assert_eq!(report.failures[0].attempts, 1);
    assert_eq!(report.failures[0].filter, None);
    assert!(report.aborted_filters().is_empty());
    let indices: Vec<_> = collection.store.iter().map(|t| t.index()).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    Ok(())
}

#[test]
fn test_accesses_outside_window_are_ignored() -> anyhow::Result<()> {
    let source = ScriptedSource::new(|_: &RunParams<'_>| {
        Ok(Script::new(vec![1])
            .write(0x400000, TABLE, 1, 0x11)
            .write(PC, TABLE, 1, 0x22)
            .write(0x109786, TABLE, 1, 0x33))
    });
    let session = session(source, vec![presets::by_name("data_W")?], config(0, 1))?;
    let collection = session.run(2)?;
    for trace in &collection.store {
        assert_eq!(trace.leakage()[0].bytes(), &[0x22]);
    }
    Ok(())
}

#[test]
fn test_read_write_filter_is_union_of_kinds() -> anyhow::Result<()> {
    let filters = ["data_R", "data_W", "data_RW"]
        .into_iter()
        .map(presets::by_name)
        .collect::<Result<Vec<_>, _>>()?;
    let session = session(ScriptedSource::new(table_script), filters, config(0, 1))?;
    let collection = session.run(3)?;

    let store = &collection.store;
    for trace in store {
        let plaintext = &trace.input().plaintext;
        let reads: Vec<u8> = plaintext.clone();
        let writes: Vec<u8> = plaintext.iter().map(|b| b.wrapping_mul(3)).collect();
        let both: Vec<u8> = plaintext
            .iter()
            .flat_map(|b| [*b, b.wrapping_mul(3)])
            .collect();
        assert_eq!(trace.leakage()[0].bytes(), reads.as_slice());
        assert_eq!(trace.leakage()[1].bytes(), writes.as_slice());
        assert_eq!(trace.leakage()[2].bytes(), both.as_slice());
        assert_eq!(
            trace.leakage()[2].count(),
            trace.leakage()[0].count() + trace.leakage()[1].count()
        );
    }
    Ok(())
}

#[test]
fn test_pack_overflow_aborts_run() -> anyhow::Result<()> {
    let wide = FilterSpec {
        name: "wide_W".into(),
        kinds: KindSet::WRITE,
        condition: Condition::Always,
        extract: Extract::Data {
            shift: 0,
            mask: 0xFFFF,
        },
        format: PackFormat::BYTE,
    }
    .build();
    let source = ScriptedSource::new(|params: &RunParams<'_>| {
        let data = if params.run == 1 { 0x1234 } else { 0x12 };
        Ok(Script::new(vec![0]).write(PC, TABLE, 2, data))
    });
    let session = session(source, vec![presets::by_name("data_W")?, wide], config(3, 1))?;
    let collection = session.run(3)?;

    let report = &collection.report;
    assert_eq!(report.collected, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.retried, 0);
    assert_eq!(report.failures[0].request, 1);
    assert_eq!(report.failures[0].attempts, 1);
    assert_eq!(report.failures[0].filter.as_deref(), Some("wide_W"));
    assert_eq!(report.aborted_filters(), vec!["wide_W"]);
    Ok(())
}

#[test]
fn test_failed_launch_is_retried_with_same_input() -> anyhow::Result<()> {
    let failed_once = Arc::new(AtomicBool::new(false));
    let flag = failed_once.clone();
    let source = Arc::new(ScriptedSource::new(move |params: &RunParams<'_>| {
        if params.run == 1 && !flag.swap(true, Ordering::SeqCst) {
            return Err(SourceError::Launch("transient launch failure".into()));
        }
        table_script(params)
    }));
    let session = session(
        source.clone(),
        vec![presets::by_name("addr_R")?],
        config(1, 1),
    )?;
    let collection = session.run(3)?;

    assert!(failed_once.load(Ordering::SeqCst));
    assert_eq!(source.launches(), 4);
    assert_eq!(collection.store.len(), 3);
    assert_eq!(collection.report.retried, 1);
    assert_eq!(collection.report.failed, 0);
    let expected = session.input_for(0x5eed, 1);
    let trace = collection
        .store
        .get(1)
        .ok_or_else(|| anyhow::anyhow!("missing trace"))?;
    assert_eq!(trace.input(), &expected);
    Ok(())
}

#[test]
fn test_parallel_collection_matches_sequential() -> anyhow::Result<()> {
    let filters = || -> anyhow::Result<Vec<Filter>> {
        Ok(vec![presets::by_name("addr_R")?, presets::by_name("data_W")?])
    };
    let sequential = session(ScriptedSource::new(table_script), filters()?, config(0, 1))?;
    let parallel = session(ScriptedSource::new(table_script), filters()?, config(0, 4))?;
    let a = sequential.run(20)?;
    let b = parallel.run(20)?;

    assert_eq!(a.report.seed, b.report.seed);
    assert_eq!(a.store.len(), 20);
    assert_eq!(columnar(&a.store, &[])?, columnar(&b.store, &[])?);
    Ok(())
}

#[test]
fn test_columnar_export_of_collection() -> anyhow::Result<()> {
    let session = session(
        ScriptedSource::new(table_script),
        vec![presets::by_name("data_R")?, presets::by_name("data_W")?],
        config(0, 2),
    )?;
    let collection = session.run(4)?;

    let bytes = columnar(&collection.store, &["data_W".to_string()])?;
    assert_eq!(bytes, columnar(&collection.store, &["data_W".to_string()])?);
    let file = read_columnar(bytes.as_slice())?;
    assert_eq!(file.header.traces, 4);
    assert_eq!(file.header.plaintext_len, 16);
    assert_eq!(file.header.key_len, 0);
    assert_eq!(file.header.filters.len(), 1);
    assert_eq!(file.header.filters[0].samples, 16);
    for (record, trace) in file.records.iter().zip(&collection.store) {
        assert_eq!(record.plaintext, trace.input().plaintext);
        assert_eq!(record.output, trace.output());
        assert_eq!(record.columns[0], trace.leakage()[1].bytes());
    }
    Ok(())
}

#[test]
fn test_ragged_columns_are_all_named() -> anyhow::Result<()> {
    let source = ScriptedSource::new(|params: &RunParams<'_>| {
        let mut script = Script::new(vec![0]).write(PC, TABLE, 1, 1);
        if params.run == 1 {
            script = script.read(PC, TABLE, 1, 7);
        }
        if params.run == 2 {
            script = script.write(PC, TABLE, 1, 2);
        }
        Ok(script)
    });
    let filters = vec![presets::by_name("data_R")?, presets::by_name("data_W")?];
    let session = session(source, filters, config(0, 1))?;
    let collection = session.run(3)?;
    assert_eq!(collection.store.len(), 3);

    let Err(ExportError::ColumnLengthMismatch(mismatches)) =
        ExportLayout::new(&collection.store, &[])
    else {
        anyhow::bail!("ragged columns were accepted");
    };
    let named: Vec<_> = mismatches
        .iter()
        .map(|m| (m.filter.as_str(), m.trace))
        .collect();
    assert_eq!(named, vec![("data_R", 1), ("data_W", 2)]);

    let mut writer = ColumnarWriter::new(vec![]);
    let err = export(&mut writer, &collection.store, &[], &[]).unwrap_err();
    assert!(matches!(
        err,
        ColumnarError::Export(ExportError::ColumnLengthMismatch(ref m)) if m.len() == 2
    ));
    assert!(writer.into_inner().is_empty());
    Ok(())
}
