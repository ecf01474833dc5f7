/// Per-session frame decimation state. Owned by the streaming worker; never
/// shared.
///
/// Two policies stack, evaluated in this order per decoded frame:
///
/// 1. A run of frames with the same byte length as the last forwarded frame
///    is assumed to be a static screen; at most one frame out of every
///    `skip_same_frame` of them is let through so a stalled source neither
///    floods the viewer with duplicates nor starves it forever.
/// 2. Of the remaining candidates, only every `skip_frame`-th is forwarded.
///    Larger values trade motion smoothness for bandwidth.
pub struct Throttle {
    skip_frame: u32,
    skip_same_frame: u32,
    frame_count: u32,
    same_count: u32,
    last_forwarded_len: usize,
}

impl Throttle {
    pub fn new(skip_frame: u32, skip_same_frame: u32) -> Self {
        Self {
            skip_frame: skip_frame.max(1),
            skip_same_frame: skip_same_frame.max(1),
            frame_count: 0,
            same_count: 1,
            last_forwarded_len: 0,
        }
    }

    /// Decides whether a frame of `len` bytes should be forwarded, updating
    /// the decimation state. Survivors keep their arrival order; this only
    /// ever drops.
    pub fn admit(&mut self, len: usize) -> bool {
        if len == self.last_forwarded_len && self.same_count % self.skip_same_frame != 0 {
            self.same_count += 1;
            return false;
        }
        self.same_count = 1;

        self.frame_count = self.frame_count.wrapping_add(1);
        if self.frame_count % self.skip_frame == 0 {
            self.last_forwarded_len = len;
            return true;
        }

        false
    }
}
