use crate::error::TracerGrindError;
use crate::output::parse_output;
use crate::parser::parse_line;
use leaktrace_core::arch::Arch;
use leaktrace_core::event::{AccessEvent, AddressRange, StackRange};
use leaktrace_core::source::{AccessSource, EventStream, RunParams, SourceError, TargetSpec};
use log::{debug, trace, warn};
use std::ffi::CString;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const TRACE_FILE: &str = "trace.grind";
const TEXT_FILE: &str = "trace.txt";
const STDOUT_FILE: &str = "stdout.txt";
const STDERR_FILE: &str = "stderr.txt";

/// How the input of a run reaches the target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InputMode {
    /// Hex words appended to the command line
    #[default]
    Argv,
    /// Hex words written to standard input, one per line
    Stdin,
}

/// Access source running the target under Valgrind/TracerGrind.
///
/// Every run gets a private scratch directory holding the binary trace, its text conversion
/// and the captured standard streams. The directory is removed when the event stream is
/// dropped.
///
/// # Examples
///
/// ```no_run
/// use leaktrace_tracergrind::{InputMode, TracerGrind};
///
/// let source = TracerGrind::from_env()
///     .input_mode(InputMode::Argv)
///     .output_prefix("OUTPUT");
/// ```
#[derive(Clone, Debug)]
pub struct TracerGrind {
    valgrind: PathBuf,
    texttrace: PathBuf,
    input_mode: InputMode,
    output_prefix: String,
}

impl TracerGrind {
    /// Creates a source using the given tool binaries.
    pub fn new(valgrind: impl Into<PathBuf>, texttrace: impl Into<PathBuf>) -> Self {
        TracerGrind {
            valgrind: valgrind.into(),
            texttrace: texttrace.into(),
            input_mode: InputMode::default(),
            output_prefix: "OUTPUT".to_string(),
        }
    }

    /// Creates a source using `LEAKTRACE_VALGRIND` and `LEAKTRACE_TEXTTRACE`, falling back to
    /// `valgrind` and `texttrace` on the `PATH`.
    pub fn from_env() -> Self {
        let valgrind =
            std::env::var("LEAKTRACE_VALGRIND").unwrap_or(String::from("valgrind"));
        let texttrace =
            std::env::var("LEAKTRACE_TEXTTRACE").unwrap_or(String::from("texttrace"));
        Self::new(valgrind, texttrace)
    }

    /// Sets how inputs are passed to the target.
    pub fn input_mode(mut self, input_mode: InputMode) -> Self {
        self.input_mode = input_mode;
        self
    }

    /// Sets the prefix of the output line of the target.
    pub fn output_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.output_prefix = prefix.into();
        self
    }

    fn run(&self, params: &RunParams<'_>) -> Result<TextTrace, TracerGrindError> {
        let target = params.target;
        check_target(&target.path, target.arch)?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("leaktrace-run{}-", params.run))
            .tempdir()?;
        let trace_path = scratch.path().join(TRACE_FILE);

        let words = params.input.hex_words();
        let mut cmd = Command::new(&self.valgrind);
        cmd.arg("--tool=tracergrind")
            .arg(format!("--filter={}", target.range))
            .arg("--vex-iropt-register-updates=allregs-at-mem-access")
            .arg(format!("--output={}", trace_path.display()))
            .arg(&target.path)
            .args(&target.args);
        if self.input_mode == InputMode::Argv {
            cmd.args(&words);
        }
        cmd.current_dir(scratch.path())
            .stdin(match self.input_mode {
                InputMode::Argv => Stdio::null(),
                InputMode::Stdin => Stdio::piped(),
            })
            .stdout(File::create(scratch.path().join(STDOUT_FILE))?)
            .stderr(File::create(scratch.path().join(STDERR_FILE))?);
        debug!("Run {}: {:?}", params.run, cmd);

        let child = cmd.spawn().map_err(|source| TracerGrindError::Spawn {
            tool: self.valgrind.clone(),
            source,
        })?;
        let mut child = Reaper(Some(child));
        if self.input_mode == InputMode::Stdin {
            feed_stdin(&mut child, &words);
        }
        let status = child.wait(params.timeout)?;
        check_status(status)?;

        if !trace_path.exists() {
            return Err(TracerGrindError::MissingTrace(trace_path));
        }
        // Targets may print arbitrary bytes around the output line.
        let stdout = std::fs::read(scratch.path().join(STDOUT_FILE))?;
        let output = parse_output(&String::from_utf8_lossy(&stdout), &self.output_prefix)
            .ok_or_else(|| TracerGrindError::NoOutput(self.output_prefix.clone()))?;

        let text_path = scratch.path().join(TEXT_FILE);
        let status = Command::new(&self.texttrace)
            .arg(&trace_path)
            .arg(&text_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .map_err(|source| TracerGrindError::Spawn {
                tool: self.texttrace.clone(),
                source,
            })?;
        if !status.success() {
            return Err(TracerGrindError::ToolFailed {
                tool: self.texttrace.clone(),
                status,
            });
        }

        let lines = BufReader::new(File::open(&text_path)?).lines();
        Ok(TextTrace::new(lines, target, output, scratch))
    }
}

impl Default for TracerGrind {
    fn default() -> Self {
        Self::from_env()
    }
}

impl AccessSource for TracerGrind {
    fn start<'a>(
        &'a self,
        params: &RunParams<'_>,
    ) -> Result<Box<dyn EventStream + 'a>, SourceError> {
        Ok(Box::new(self.run(params)?))
    }
}

/// Checks that `path` is executable and, for ELF binaries, built for `arch`.
fn check_target(path: &Path, arch: Arch) -> Result<(), TracerGrindError> {
    let not_executable = |source| TracerGrindError::NotExecutable {
        path: path.to_path_buf(),
        source,
    };
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| not_executable(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    if unsafe { libc::access(c_path.as_ptr(), libc::X_OK) } != 0 {
        return Err(not_executable(io::Error::last_os_error()));
    }

    let mut header = Vec::with_capacity(20);
    File::open(path)
        .and_then(|f| f.take(20).read_to_end(&mut header))
        .map_err(not_executable)?;
    if header.len() < 20 || !header.starts_with(b"\x7fELF") {
        debug!("{} is not an ELF binary, skipping architecture check", path.display());
        return Ok(());
    }
    let machine = [header[18], header[19]];
    let found = match header[5] {
        2 => u16::from_be_bytes(machine),
        _ => u16::from_le_bytes(machine),
    };
    if found != arch.elf_machine() {
        return Err(TracerGrindError::WrongArch {
            path: path.to_path_buf(),
            arch,
            expected: arch.elf_machine(),
            found,
        });
    }
    Ok(())
}

/// Exit codes from 128 on are used by shells and Valgrind for fatal signals.
fn check_status(status: ExitStatus) -> Result<(), TracerGrindError> {
    if let Some(signal) = status.signal() {
        return Err(TracerGrindError::Signal(signal));
    }
    match status.code() {
        Some(code) if code >= 128 => Err(TracerGrindError::AbnormalExit(code)),
        Some(code) if code != 0 => {
            debug!("Target exited with status {}", code);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn feed_stdin(child: &mut Reaper, words: &[String]) {
    let Some(mut stdin) = child.0.as_mut().and_then(|c| c.stdin.take()) else {
        return;
    };
    let mut input = words.join("\n");
    input.push('\n');
    // The target may exit without reading its input.
    if let Err(e) = stdin.write_all(input.as_bytes()) {
        debug!("Writing input to target failed: {}", e);
    }
}

/// Child process that is killed and reaped on drop unless waited for.
struct Reaper(Option<Child>);

impl Reaper {
    fn wait(&mut self, timeout: Option<Duration>) -> Result<ExitStatus, TracerGrindError> {
        let Some(child) = self.0.as_mut() else {
            return Err(TracerGrindError::Scratch(io::Error::other(
                "process already reaped",
            )));
        };
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                self.0 = None;
                return Ok(status);
            }
            if let Some(timeout) = timeout {
                if start.elapsed() > timeout {
                    warn!("Target exceeded {:?}, killing it", timeout);
                    return Err(TracerGrindError::Timeout(timeout));
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if let Some(mut child) = self.0.take() {
            if let Err(e) = child.kill() {
                debug!("Killing target failed: {}", e);
            }
            if let Err(e) = child.wait() {
                debug!("Reaping target failed: {}", e);
            }
        }
    }
}

/// Memory accesses of a text trace.
struct TextTrace {
    lines: Lines<BufReader<File>>,
    line: usize,
    range: AddressRange,
    stack: StackRange,
    output: Vec<u8>,
    dropped: usize,
    failed: bool,
    scratch: TempDir,
}

impl TextTrace {
    fn new(
        lines: Lines<BufReader<File>>,
        target: &TargetSpec,
        output: Vec<u8>,
        scratch: TempDir,
    ) -> Self {
        TextTrace {
            lines,
            line: 0,
            range: target.range,
            stack: target.stack,
            output,
            dropped: 0,
            failed: false,
            scratch,
        }
    }

    fn fail(&mut self, e: TracerGrindError) -> Option<Result<AccessEvent, SourceError>> {
        self.failed = true;
        Some(Err(e.into()))
    }
}

impl Iterator for TextTrace {
    type Item = Result<AccessEvent, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(e) => return self.fail(e.into()),
            };
            self.line += 1;
            match parse_line(&text) {
                Ok(Some(event)) if self.range.contains(event.pc) => {
                    trace!("{:?}", event);
                    return Some(Ok(AccessEvent {
                        stack: self.stack,
                        ..event
                    }));
                }
                Ok(Some(_)) => self.dropped += 1,
                Ok(None) => {}
                Err(reason) => {
                    let line = self.line;
                    return self.fail(TracerGrindError::Parse { line, reason });
                }
            }
        }
    }
}

impl EventStream for TextTrace {
    fn finish(self: Box<Self>) -> Result<Vec<u8>, SourceError> {
        if self.dropped > 0 {
            debug!(
                "Dropped {} accesses outside {} in {}",
                self.dropped,
                self.range,
                self.scratch.path().display()
            );
        }
        Ok(self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn elf_header(machine: u16) -> Vec<u8> {
        let mut header = b"\x7fELF\x02\x01\x01".to_vec();
        header.resize(18, 0);
        header.extend(machine.to_le_bytes());
        header.resize(64, 0);
        header
    }

    fn executable(dir: &Path, name: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = dir.join(name);
        std::fs::write(&path, content)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    #[test]
    fn test_check_target_arch() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let amd64 = executable(dir.path(), "amd64", &elf_header(62))?;
        assert!(check_target(&amd64, Arch::Amd64).is_ok());
        let err = check_target(&amd64, Arch::Arm64).unwrap_err();
        assert!(matches!(err, TracerGrindError::WrongArch { found: 62, .. }));
        assert!(matches!(
            SourceError::from(err),
            SourceError::Launch(_)
        ));
        let script = executable(dir.path(), "script", b"#!/bin/sh\necho OUTPUT 00\n")?;
        assert!(check_target(&script, Arch::Arm).is_ok());
        Ok(())
    }

    #[test]
    fn test_check_target_missing() {
        let err = check_target(Path::new("/nonexistent/leaktrace-target"), Arch::Amd64)
            .unwrap_err();
        assert!(matches!(err, TracerGrindError::NotExecutable { .. }));
    }

    #[test]
    fn test_status_classification() {
        assert!(check_status(ExitStatus::from_raw(0)).is_ok());
        assert!(check_status(ExitStatus::from_raw(1 << 8)).is_ok());
        assert!(matches!(
            check_status(ExitStatus::from_raw(139 << 8)),
            Err(TracerGrindError::AbnormalExit(139))
        ));
        assert!(matches!(
            check_status(ExitStatus::from_raw(libc::SIGSEGV)),
            Err(TracerGrindError::Signal(libc::SIGSEGV))
        ));
    }

    #[test]
    fn test_text_trace_window() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let text = dir.path().join(TEXT_FILE);
        std::fs::write(
            &text,
            "[I] INS_ADDRESS: 0x109214\n\
             [W] INS_ADDRESS: 0x109214 START_ADDRESS: 0x10 LENGTH: 1 DATA: 42\n\
             [R] INS_ADDRESS: 0x200000 START_ADDRESS: 0x20 LENGTH: 1 DATA: 43\n\
             [R] INS_ADDRESS: 0x109300 START_ADDRESS: 0x30 LENGTH: 1 DATA: 44\n",
        )?;
        let target = TargetSpec::new("/bin/true", Arch::Amd64, "0x109080-0x109785".parse()?);
        let lines = BufReader::new(File::open(&text)?).lines();
        let stream = Box::new(TextTrace::new(lines, &target, vec![0xab], dir));
        let mut stream: Box<dyn EventStream> = stream;
        let data: Vec<u128> = stream
            .by_ref()
            .map(|e| e.map(|e| e.data))
            .collect::<Result<_, _>>()?;
        assert_eq!(data, vec![0x42, 0x44]);
        assert_eq!(stream.finish()?, vec![0xab]);
        Ok(())
    }

    #[test]
    fn test_text_trace_malformed_line() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let text = dir.path().join(TEXT_FILE);
        std::fs::write(&text, "[W] INS_ADDRESS: 0x109214 LENGTH: 1 DATA: 42\n")?;
        let target = TargetSpec::new("/bin/true", Arch::Amd64, "0x109080-0x109785".parse()?);
        let lines = BufReader::new(File::open(&text)?).lines();
        let mut stream = TextTrace::new(lines, &target, vec![], dir);
        assert!(matches!(
            stream.next(),
            Some(Err(SourceError::Instrumentation(_)))
        ));
        assert!(stream.next().is_none());
        Ok(())
    }

    const FAKE_VALGRIND: &str = r#"#!/bin/sh
for arg in "$@"; do
    case "$arg" in
        --output=*) out="${arg#--output=}" ;;
    esac
done
printf 'grind' > "$out"
"#;

    const FAKE_TEXTTRACE: &str = r#"#!/bin/sh
test -f "$1" || exit 2
printf '[I] INS_ADDRESS: 0x109214\n' > "$2"
printf '[W] INS_ADDRESS: 0x109214 START_ADDRESS: 0x10 LENGTH: 1 DATA: 42\n' >> "$2"
printf '[R] INS_ADDRESS: 0x400000 START_ADDRESS: 0x20 LENGTH: 1 DATA: 43\n' >> "$2"
"#;

    /// Fake tool binaries and a target inside one temporary directory.
    struct Fakes {
        dir: tempfile::TempDir,
        target: TargetSpec,
    }

    impl Fakes {
        fn new() -> anyhow::Result<Self> {
            let dir = tempfile::tempdir()?;
            let path = executable(dir.path(), "target", b"#!/bin/sh\nexit 0\n")?;
            let target = TargetSpec::new(path, Arch::Amd64, "0x109080-0x109785".parse()?);
            Ok(Fakes { dir, target })
        }

        /// Source whose Valgrind runs `output` after writing the trace.
        fn source(&self, output: &str, texttrace: &str) -> anyhow::Result<TracerGrind> {
            let valgrind = format!("{}{}\n", FAKE_VALGRIND, output);
            let valgrind = executable(self.dir.path(), "valgrind", valgrind.as_bytes())?;
            let texttrace = executable(self.dir.path(), "texttrace", texttrace.as_bytes())?;
            Ok(TracerGrind::new(valgrind, texttrace))
        }

        fn start<'a>(
            &self,
            source: &'a TracerGrind,
            timeout: Option<Duration>,
        ) -> Result<Box<dyn EventStream + 'a>, SourceError> {
            let input = leaktrace_core::trace::TraceInput {
                plaintext: vec![0x00, 0x11],
                key: None,
            };
            let params = RunParams {
                run: 0,
                target: &self.target,
                input: &input,
                timeout,
            };
            source.start(&params)
        }
    }

    #[test]
    fn test_run_streams_window_events() -> anyhow::Result<()> {
        let fakes = Fakes::new()?;
        let source = fakes.source("echo 'OUTPUT: 3a d7'", FAKE_TEXTTRACE)?;
        let mut stream = fakes.start(&source, Some(Duration::from_secs(10)))?;
        let events = stream.by_ref().collect::<Result<Vec<_>, _>>()?;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].pc, 0x109214);
        assert_eq!(events[0].data, 0x42);
        assert_eq!(events[0].stack, fakes.target.stack);
        assert_eq!(stream.finish()?, vec![0x3a, 0xd7]);
        Ok(())
    }

    #[test]
    fn test_stdin_input_mode() -> anyhow::Result<()> {
        let fakes = Fakes::new()?;
        let source = fakes
            .source("read word; echo \"OUTPUT $word\"", FAKE_TEXTTRACE)?
            .input_mode(InputMode::Stdin);
        let stream = fakes.start(&source, None)?;
        assert_eq!(stream.finish()?, vec![0x00, 0x11]);
        Ok(())
    }

    #[test]
    fn test_missing_trace_is_instrumentation_failure() -> anyhow::Result<()> {
        let fakes = Fakes::new()?;
        let source = fakes.source("rm -f \"$out\"; echo 'OUTPUT 00'", FAKE_TEXTTRACE)?;
        assert!(matches!(
            fakes.start(&source, None),
            Err(SourceError::Instrumentation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_texttrace_failure_is_instrumentation_failure() -> anyhow::Result<()> {
        let fakes = Fakes::new()?;
        let source = fakes.source("echo 'OUTPUT 00'", "#!/bin/sh\nexit 3\n")?;
        assert!(matches!(
            fakes.start(&source, None),
            Err(SourceError::Instrumentation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_hanging_target_times_out() -> anyhow::Result<()> {
        let fakes = Fakes::new()?;
        let source = fakes.source("exec sleep 5", FAKE_TEXTTRACE)?;
        let timeout = Duration::from_millis(200);
        let start = Instant::now();
        assert!(matches!(
            fakes.start(&source, Some(timeout)),
            Err(SourceError::Timeout(t)) if t == timeout
        ));
        assert!(start.elapsed() < Duration::from_secs(4));
        Ok(())
    }

    #[test]
    fn test_non_utf8_stdout() -> anyhow::Result<()> {
        let fakes = Fakes::new()?;
        let source = fakes.source("printf '\\377\\376 noise\\nOUTPUT ab\\n'", FAKE_TEXTTRACE)?;
        let stream = fakes.start(&source, None)?;
        assert_eq!(stream.finish()?, vec![0xab]);

        let source = fakes.source("printf '\\377\\376\\n'", FAKE_TEXTTRACE)?;
        assert!(fakes.start(&source, None).is_err_and(|e| e.is_crash()));
        Ok(())
    }
}
