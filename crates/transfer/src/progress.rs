use chunkup_protocol::ProgressSnapshot;
use tokio::time::Instant;

/// Running byte totals for one upload attempt.
///
/// `uploaded_size` accumulates across pauses while the speed estimate only
/// covers bytes sent since the last [`resume_clock`](Self::resume_clock).
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_size: u64,
    size_need_send: u64,
    uploaded_size: u64,
    session_uploaded: u64,
    resume_start: Instant,
    last: ProgressSnapshot,
}

impl ProgressTracker {
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            size_need_send: total_size,
            uploaded_size: 0,
            session_uploaded: 0,
            resume_start: Instant::now(),
            last: ProgressSnapshot::idle(total_size),
        }
    }

    /// Zeroes every counter and returns the idle snapshot.
    pub fn reset(&mut self, total_size: u64) -> ProgressSnapshot {
        *self = Self::new(total_size);
        self.last.clone()
    }

    /// Starts a transfer that still has `size_need_send` bytes to send.
    pub fn begin(&mut self, size_need_send: u64) {
        self.size_need_send = size_need_send;
        self.uploaded_size = 0;
        self.resume_clock();
    }

    /// Restarts the speed window; called on start and on every resume.
    pub fn resume_clock(&mut self) {
        self.session_uploaded = 0;
        self.resume_start = Instant::now();
    }

    /// Accounts one confirmed chunk of `len` bytes.
    pub fn record(&mut self, len: u64) -> ProgressSnapshot {
        self.uploaded_size += len;
        self.session_uploaded += len;

        let elapsed = self.resume_start.elapsed().as_secs_f64();
        let average_speed = if elapsed > 0.0 {
            self.session_uploaded as f64 / elapsed
        } else {
            0.0
        };
        let remaining = self.size_need_send.saturating_sub(self.uploaded_size);
        let time_remaining = if remaining == 0 {
            0.0
        } else if average_speed > 0.0 {
            remaining as f64 / average_speed
        } else {
            f64::INFINITY
        };

        self.last = ProgressSnapshot {
            total_size: self.total_size,
            uploaded_size: self.uploaded_size,
            average_speed,
            time_remaining,
            percent: self.percent(),
        };
        self.last.clone()
    }

    /// Marks the attempt finished: 100 % with nothing remaining.
    pub fn complete(&mut self) -> ProgressSnapshot {
        self.last = ProgressSnapshot {
            percent: 100,
            time_remaining: 0.0,
            ..self.last.clone()
        };
        self.last.clone()
    }

    /// The most recent snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.last.clone()
    }

    pub fn size_need_send(&self) -> u64 {
        self.size_need_send
    }

    fn percent(&self) -> u8 {
        if self.size_need_send == 0 {
            return 100;
        }
        let pct = self.uploaded_size.saturating_mul(100) / self.size_need_send;
        pct.min(100) as u8
    }
}
