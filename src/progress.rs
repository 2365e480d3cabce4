use indicatif::{ProgressBar, ProgressStyle};

/// Receives progress notifications; purely observational
pub trait ProgressSink: Send + Sync {
    fn increment(&self, by: u64, label: &str);

    fn finish(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn increment(&self, _by: u64, _label: &str) {}
}

/// Terminal progress bar
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(total: u64) -> Self {
        let bar = ProgressBar::new(total);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        ) {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self { bar }
    }
}

impl ProgressSink for BarProgress {
    fn increment(&self, by: u64, label: &str) {
        self.bar.set_message(label.to_string());
        self.bar.inc(by);
    }

    fn finish(&self) {
        self.bar.finish_with_message("done");
    }
}
