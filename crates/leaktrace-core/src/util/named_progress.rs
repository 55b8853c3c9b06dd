use indicatif::ProgressStyle;

const LABEL_WIDTH: usize = 31;

/// Extension trait for creating named progress bars.
pub trait NamedProgress {
    /// Creates a progress bar style with a name label.
    ///
    /// # Arguments
    ///
    /// * `name` - Label to display with the progress bar
    fn named_bar(name: &str) -> Self;
}

impl NamedProgress for ProgressStyle {
    fn named_bar(name: &str) -> Self {
        let template = format!(
            "{name:<LABEL_WIDTH$} {{wide_bar:40.cyan/blue}} {{pos:>4}}/{{len:<4}} [{{elapsed_precise}} ({{eta}} remaining)] {{msg}}"
        );
        ProgressStyle::default_bar()
            .template(&template)
            .unwrap_or(ProgressStyle::default_bar())
    }
}
