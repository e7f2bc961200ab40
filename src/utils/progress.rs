/// Progress feedback for long-running exports
///
/// A lightweight observer task polls the size of the file a subprocess is
/// writing and feeds a spinner. Purely cosmetic: it never gates
/// correctness and is torn down when the monitored operation completes,
/// successfully or not.

use std::path::PathBuf;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;

use crate::utils::helpers::format_bytes;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct SizeWatcher {
    bar: ProgressBar,
    poller: JoinHandle<()>,
}

impl SizeWatcher {
    /// Spawn the observer for `path`, labelled for the console.
    pub fn spawn(path: PathBuf, label: String) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(250));
        bar.set_message(label.clone());

        let observer_bar = bar.clone();
        let poller = tokio::spawn(async move {
            loop {
                let size = tokio::fs::metadata(&path)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                observer_bar.set_message(format!("{}: {} written", label, format_bytes(size)));
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        });

        Self { bar, poller }
    }

    pub fn finish(self) {
        drop(self);
    }
}

impl Drop for SizeWatcher {
    fn drop(&mut self) {
        self.poller.abort();
        self.bar.finish_and_clear();
    }
}
