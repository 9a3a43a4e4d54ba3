//! Transfer progress display

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Byte-level progress reporter for one transfer direction.
///
/// When disabled, all updates go to a hidden draw target so library
/// callers and tests pay nothing for it.
pub struct Reporter {
    bar: ProgressBar,
}

impl Reporter {
    pub fn new(direction: &str, total: u64, enabled: bool) -> Self {
        let bar = if enabled {
            ProgressBar::new(total)
        } else {
            ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::hidden())
        };
        bar.set_style(
            ProgressStyle::with_template(
                "{msg} {bytes}/{total_bytes} [{bar:30}] {bytes_per_sec} eta {eta}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message(direction.to_string());
        Self { bar }
    }

    pub fn update(&self, bytes: u64) {
        self.bar.set_position(bytes);
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_reporter_accepts_updates() {
        let r = Reporter::new("receiving", 100, false);
        r.update(10);
        r.update(100);
        r.finish();
    }
}
