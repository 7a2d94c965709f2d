/// Trait for receiving extraction progress updates.
pub trait ExtractProgress {
    /// Called when starting to write an output file of `len` bytes.
    fn file_start(&self, _name: &str, _len: u64) {}

    /// Called after each chunk written to the current file.
    fn bytes_written(&self, _written: u64) {}

    /// Called when the current file has been fully written.
    fn file_completed(&self, _name: &str) {}

    /// Called when the whole extraction is complete.
    fn completed(&self, _files: usize) {}
}

impl<P: ExtractProgress + ?Sized> ExtractProgress for &P {
    fn file_start(&self, name: &str, len: u64) {
        (**self).file_start(name, len);
    }

    fn bytes_written(&self, written: u64) {
        (**self).bytes_written(written);
    }

    fn file_completed(&self, name: &str) {
        (**self).file_completed(name);
    }

    fn completed(&self, files: usize) {
        (**self).completed(files);
    }
}

/// A no-op progress implementation that discards all updates.
pub struct SilentProgress;

impl ExtractProgress for SilentProgress {}

/// Console progress reporter using an indicatif byte progress bar per file.
#[cfg(feature = "cli")]
pub struct ConsoleProgress {
    bar: indicatif::ProgressBar,
}

#[cfg(feature = "cli")]
impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            bar: indicatif::ProgressBar::hidden(),
        }
    }
}

#[cfg(feature = "cli")]
impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "cli")]
impl ExtractProgress for ConsoleProgress {
    fn file_start(&self, name: &str, len: u64) {
        self.bar
            .set_draw_target(indicatif::ProgressDrawTarget::stderr());
        self.bar.set_length(len);
        self.bar.set_position(0);
        self.bar.set_message(name.to_owned());
        self.bar.set_style(
            indicatif::ProgressStyle::default_bar()
                .template("{msg:20} {bar:40.cyan/blue} {bytes}/{total_bytes} [{elapsed_precise}]")
                .unwrap()
                .progress_chars("━╸─"),
        );
        self.bar.reset();
    }

    fn bytes_written(&self, written: u64) {
        self.bar.inc(written);
    }

    fn file_completed(&self, name: &str) {
        self.bar.finish_and_clear();
        println!("Extracted {name} ({} bytes).", self.bar.position());
    }

    fn completed(&self, files: usize) {
        println!("Extraction complete ({files} files).");
    }
}
