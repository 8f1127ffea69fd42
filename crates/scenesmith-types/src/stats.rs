use serde::{Deserialize, Serialize};

/// Running counters for one agent worker, surfaced over `GET /stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    pub messages_received: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub cumulative_processing_ms: u64,
}

impl WorkerStats {
    pub fn record(&mut self, succeeded: bool, duration_ms: u64) {
        self.messages_received += 1;
        self.cumulative_processing_ms += duration_ms;
        if succeeded {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
    }

    pub fn average_processing_ms(&self) -> f64 {
        if self.messages_received == 0 {
            0.0
        } else {
            self.cumulative_processing_ms as f64 / self.messages_received as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        let finished = self.tasks_completed + self.tasks_failed;
        if finished == 0 {
            1.0
        } else {
            self.tasks_completed as f64 / finished as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_with_no_tasks_is_optimistic_default() {
        let s = WorkerStats::default();
        assert_eq!(s.success_rate(), 1.0);
    }

    #[test]
    fn average_tracks_mean_of_recorded_durations() {
        let mut s = WorkerStats::default();
        s.record(true, 100);
        s.record(false, 300);
        assert_eq!(s.average_processing_ms(), 200.0);
        assert_eq!(s.success_rate(), 0.5);
    }
}
