/// Extracts the output of the target from its standard output.
///
/// The output is the first line starting with `prefix`. After the prefix, an optional `:`
/// is skipped and the rest of the line is read as hex, ignoring whitespace.
///
/// Returns `None` if no line carries the prefix or if the first one is not valid hex.
///
/// # Examples
///
/// ```
/// use leaktrace_tracergrind::parse_output;
///
/// let stdout = "loading tables\nOUTPUT: 3a d7 00 ff\n";
/// assert_eq!(parse_output(stdout, "OUTPUT"), Some(vec![0x3a, 0xd7, 0x00, 0xff]));
/// ```
pub fn parse_output(stdout: &str, prefix: &str) -> Option<Vec<u8>> {
    let line = stdout
        .lines()
        .map(str::trim_start)
        .find(|line| line.starts_with(prefix))?;
    let rest = line[prefix.len()..].trim_start();
    let rest = rest.strip_prefix(':').unwrap_or(rest);
    let digits: String = rest.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(digits).ok()
}
