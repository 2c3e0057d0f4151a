//! Progress reporting using indicatif progress bars

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use stkflash_core::memory::MemoryKind;
use stkflash_stk500v2::SessionProgress;

/// Create a progress bar with custom phase message
fn create_progress_bar_with_phase(
    total: u64,
    phase: &str,
) -> Result<ProgressBar, Box<dyn std::error::Error>> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}}) {}",
                phase
            ))?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Progress reporter using indicatif progress bars
pub struct IndicatifProgress {
    multi: MultiProgress,
    current_bar: Option<ProgressBar>,
    done_message: &'static str,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            current_bar: None,
            done_message: "",
        }
    }

    fn create_bar(&mut self, total: u64, phase: String, done_message: &'static str) {
        self.finish();
        self.done_message = done_message;
        let pb = self.multi.add(
            create_progress_bar_with_phase(total, &phase)
                .unwrap_or_else(|_| ProgressBar::new(total)),
        );
        self.current_bar = Some(pb);
    }

    fn set_position(&self, position: usize) {
        if let Some(pb) = &self.current_bar {
            pb.set_position(position as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = self.current_bar.take() {
            pb.finish_with_message(self.done_message);
        }
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionProgress for IndicatifProgress {
    fn reading(&mut self, kind: MemoryKind, total_bytes: usize) {
        self.create_bar(total_bytes as u64, format!("Reading {}", kind), "Read complete");
    }

    fn read_progress(&mut self, bytes_read: usize) {
        self.set_position(bytes_read);
    }

    fn writing(&mut self, kind: MemoryKind, bytes_to_write: usize) {
        self.create_bar(bytes_to_write as u64, format!("Writing {}", kind), "Write complete");
    }

    fn write_progress(&mut self, bytes_written: usize) {
        self.set_position(bytes_written);
    }

    fn verifying(&mut self, kind: MemoryKind, total_bytes: usize) {
        self.create_bar(total_bytes as u64, format!("Verifying {}", kind), "Verify complete");
    }

    fn verify_progress(&mut self, bytes_verified: usize) {
        self.set_position(bytes_verified);
    }

    fn complete(&mut self) {
        self.finish();
    }
}
