use std::time::Duration;

/// One processed build file and how long it took.
#[derive(Debug, Clone)]
struct Sample {
    build_file: String,
    duration: Duration,
}

/// Accumulates per-query timings for the `report_profile` command (§4.H,
/// §9). No direct teacher analogue: the daemon records this kind of thing
/// via `buck2_events`' span tracking, which is out of scope here (§1); this
/// is the minimal in-process equivalent the spec actually asks for.
#[derive(Debug, Default)]
pub struct Recorder {
    samples: Vec<Sample>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, build_file: impl Into<String>, duration: Duration) {
        self.samples.push(Sample {
            build_file: build_file.into(),
            duration,
        });
    }

    /// Renders the top-10 slowest processed build files, slowest first.
    pub fn report(&self) -> String {
        let mut ranked: Vec<&Sample> = self.samples.iter().collect();
        ranked.sort_by(|a, b| b.duration.cmp(&a.duration));

        let mut out = format!("processed {} build file(s)\n", self.samples.len());
        for sample in ranked.into_iter().take(10) {
            out.push_str(&format!("{:>8.3}s  {}\n", sample.duration.as_secs_f64(), sample.build_file));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_orders_slowest_first() {
        let mut recorder = Recorder::new();
        recorder.record("//a/BUILD", Duration::from_millis(10));
        recorder.record("//b/BUILD", Duration::from_millis(50));
        recorder.record("//c/BUILD", Duration::from_millis(30));
        let report = recorder.report();
        let b_pos = report.find("//b/BUILD").unwrap();
        let c_pos = report.find("//c/BUILD").unwrap();
        let a_pos = report.find("//a/BUILD").unwrap();
        assert!(b_pos < c_pos);
        assert!(c_pos < a_pos);
    }

    #[test]
    fn report_caps_at_ten_entries() {
        let mut recorder = Recorder::new();
        for i in 0..15 {
            recorder.record(format!("//pkg{i}/BUILD"), Duration::from_millis(i as u64));
        }
        let report = recorder.report();
        assert_eq!(report.lines().count(), 11);
    }
}
