use std::io::Write;

const BAR_WIDTH: usize = 30;

/// Single-line page counter for the bulk commands. Rendering is best effort;
/// write errors are ignored.
pub(crate) struct ProgressBar<W: Write> {
    label: String,
    total: u64,
    current: u64,
    out: W,
}

impl<W: Write> ProgressBar<W> {
    pub(crate) fn new(label: &str, total: u64, out: W) -> Self {
        let mut bar = Self {
            label: label.to_string(),
            total,
            current: 0,
            out,
        };
        bar.render();
        bar
    }

    pub(crate) fn tick(&mut self) {
        self.current += 1;
        self.render();
    }

    pub(crate) fn finish(mut self) -> W {
        self.current = self.current.max(self.total);
        self.render();
        let _ = writeln!(self.out);
        let _ = self.out.flush();
        self.out
    }

    fn render(&mut self) {
        let percent = if self.total == 0 {
            100
        } else {
            (self.current.saturating_mul(100) / self.total).min(100)
        };
        let filled = (percent as usize * BAR_WIDTH) / 100;
        let _ = write!(
            self.out,
            "\r{}  {:>3}% [{}{}] {}/{}",
            self.label,
            percent,
            "=".repeat(filled),
            " ".repeat(BAR_WIDTH - filled),
            self.current,
            self.total
        );
        let _ = self.out.flush();
    }
}
