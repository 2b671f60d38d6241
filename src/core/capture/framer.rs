/// Cuts a sample stream into frames of a fixed length.
///
/// Exactly one frame is emitted per boundary crossed; leftover samples are
/// kept for the next push.
#[derive(Debug, Clone)]
pub struct Framer {
    frame_len: usize,
    pending: Vec<f32>,
}

impl Framer {
    pub fn new(frame_len: usize) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            frame_len,
            pending: Vec::with_capacity(frame_len),
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Samples waiting for the next boundary.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Append samples and return every completed frame.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut frames = Vec::new();
        let mut rest = samples;

        while !rest.is_empty() {
            let take = (self.frame_len - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_len {
                let frame = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_len));
                frames.push(frame);
            }
        }

        frames
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
