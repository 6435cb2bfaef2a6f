//! Terminal UI: a progress bar for running jobs, and a log writer that stays
//! out of its way.

use std::{
    borrow::Cow,
    io::{self, Write as _},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressFinish, ProgressStyle};
use ocr_dispatch::JobStatus;

/// Application UI state.
#[derive(Clone)]
pub struct Ui {
    multi_progress: Arc<MultiProgress>,
}

impl Ui {
    /// Create a new UI. Attach logging with [`Ui::stderr_writer`].
    pub fn init() -> Ui {
        Ui {
            multi_progress: Arc::new(MultiProgress::new()),
        }
    }

    /// Hide all progress bars, for when results go to `stdout`.
    pub fn hide_progress_bars(&self) {
        self.multi_progress
            .set_draw_target(ProgressDrawTarget::hidden());
    }

    /// A `stderr` writer for `tracing` that doesn't scribble over progress
    /// bars.
    pub fn stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Track `total` jobs as they finish.
    pub fn job_progress(&self, total: usize) -> JobProgress {
        let style = ProgressStyle::default_bar()
            .template("  📄 {msg:24} {pos:>4}/{len:4} {elapsed_precise} {wide_bar:.cyan/blue} {eta_precise}")
            .expect("bad progress bar template");
        let bar = self.multi_progress.add(
            ProgressBar::new(total as u64)
                .with_style(style)
                .with_message("OCRing files")
                .with_finish(ProgressFinish::WithMessage(Cow::Borrowed("OCRed files"))),
        );
        bar.enable_steady_tick(Duration::from_millis(250));
        JobProgress {
            bar,
            failed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Progress of a batch of jobs, counting the ones that didn't complete.
#[derive(Clone)]
pub struct JobProgress {
    bar: ProgressBar,
    failed: Arc<AtomicUsize>,
}

impl JobProgress {
    /// Note that one job reached `status`.
    pub fn record(&self, status: JobStatus) {
        if status != JobStatus::Completed {
            let failed = self.failed.fetch_add(1, Ordering::SeqCst) + 1;
            self.bar.set_message(format!("OCRing files ({failed} failed)"));
        }
        self.bar.inc(1);
    }

    /// How many jobs didn't complete.
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Stop the bar, showing the final message.
    pub fn finish(&self) {
        self.bar.finish_using_style();
    }
}

/// Writes to `stderr`, hiding progress bars while it does.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

impl SafeStderrWriter {
    fn suspend<R>(&self, f: impl FnOnce(&mut io::Stderr) -> R) -> R {
        self.ui.multi_progress.suspend(|| f(&mut io::stderr()))
    }
}

impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.suspend(|stderr| stderr.write(buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.suspend(|stderr| stderr.write_all(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.suspend(|stderr| stderr.flush())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
